/// The size class of a mapped page.
///
/// The concrete number of bytes is defined by the architecture through [`Mmu::page_bytes`](crate::Mmu::page_bytes).
/// On both supported architectures these are 4 KiB, 2 MiB and 1 GiB.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PageSize {
    /// The smallest page, translated by a level 0 entry. Always the size of a physical frame.
    #[default]
    Small,
    /// A page translated by a level 1 entry
    Medium,
    /// A page translated by a level 2 entry.
    ///
    /// Not all hardware supports these. Requests for large pages are transparently downgraded to
    /// [`Medium`](PageSize::Medium) pages when support is absent.
    Large,
}

impl PageSize {
    /// The page table level at which a translation for this page size stops.
    pub const fn leaf_level(self) -> usize {
        match self {
            PageSize::Small => 0,
            PageSize::Medium => 1,
            PageSize::Large => 2,
        }
    }

    /// The page size of a leaf entry found at `level`, if leaves are possible at that level.
    pub const fn from_level(level: usize) -> Option<PageSize> {
        match level {
            0 => Some(PageSize::Small),
            1 => Some(PageSize::Medium),
            2 => Some(PageSize::Large),
            _ => None,
        }
    }
}
