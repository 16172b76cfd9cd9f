use bitflags::bitflags;

bitflags! {
    /// Architecture independent protection of a mapped page.
    ///
    /// Without [`USER`](MapFlags::USER) a page is only accessible by the kernel.
    /// A mapping without any of [`READ`](MapFlags::READ), [`WRITE`](MapFlags::WRITE) and [`EXEC`](MapFlags::EXEC) is a
    /// valid guard mapping: it translates but any access faults.
    #[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct MapFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        /// Accessible from user mode
        const USER = 1 << 3;
        /// Present in all address spaces and thus not flushed on address space switches
        const GLOBAL = 1 << 4;

        /// Reported for leaves translating a [`Medium`](crate::PageSize::Medium) page
        const MEDIUM_PAGE = 1 << 8;
        /// Reported for leaves translating a [`Large`](crate::PageSize::Large) page
        const LARGE_PAGE = 1 << 9;

        const RW = Self::READ.bits() | Self::WRITE.bits();
        const RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
        const SIZE_MARKERS = Self::MEDIUM_PAGE.bits() | Self::LARGE_PAGE.bits();
    }
}

impl MapFlags {
    /// Whether any kind of access is permitted.
    pub fn is_accessible(self) -> bool {
        self.intersects(MapFlags::RWX)
    }

    /// The same flags without page size markers.
    pub fn protection(self) -> MapFlags {
        self.difference(MapFlags::SIZE_MARKERS)
    }
}
