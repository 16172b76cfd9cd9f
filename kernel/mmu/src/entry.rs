use crate::arch::{Mmu, MmuFeatures};
use crate::{CachingMode, MapFlags, PAddr, PageSize};
use core::fmt::{Binary, Debug, Formatter, LowerHex, UpperHex};
use core::marker::PhantomData;

/// A decoded copy of one page table entry.
///
/// Page tables live in physical memory that is only reachable through [`PhysAccess`](allocators::PhysAccess), so
/// entries are loaded into this type, modified and then stored back by the [`Pagemap`](crate::Pagemap).
///
/// # States
/// An entry is always in exactly one of three states:
/// - empty (all bits zero),
/// - a pointer to the next-level table (only possible above level 0) or
/// - a leaf translating a page of the size belonging to its level.
///
/// Guard mappings are leaves without any access permission. They are not present for the hardware but still carry
/// their physical address.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct PageTableEntry<A: Mmu> {
    raw: u64,
    level: usize,
    _arch: PhantomData<A>,
}

impl<A: Mmu> PageTableEntry<A> {
    /// Create a new empty entry that is located at `level`
    pub const fn empty(level: usize) -> Self {
        Self::from_raw(0, level)
    }

    /// Interpret the word `raw` as an entry located at `level`
    pub const fn from_raw(raw: u64, level: usize) -> Self {
        Self {
            raw,
            level,
            _arch: PhantomData,
        }
    }

    /// The raw entry word as stored in the page table
    pub const fn raw(&self) -> u64 {
        self.raw
    }

    /// The level of the page table this entry is located in
    pub const fn level(&self) -> usize {
        self.level
    }

    pub fn is_empty(&self) -> bool {
        self.raw == 0
    }

    /// Whether this entry points to a next-level table
    pub fn is_table(&self) -> bool {
        A::is_table(self.raw, self.level)
    }

    /// Whether this entry is a leaf translation (including guard mappings)
    pub fn is_leaf(&self) -> bool {
        !self.is_empty() && !self.is_table()
    }

    /// The size of the page translated by this entry if it is a leaf
    pub fn page_size(&self) -> Option<PageSize> {
        if self.is_leaf() {
            PageSize::from_level(self.level)
        } else {
            None
        }
    }

    /// Return the physical address which this entry points to
    pub fn get_addr(&self) -> PAddr {
        A::addr_of(self.raw, self.level)
    }

    /// Point this entry to `addr` without touching any flags
    pub fn set_addr(&mut self, addr: PAddr) {
        self.raw = A::with_addr(self.raw, addr, self.level);
    }

    /// Return the protection flags encoded in this leaf
    pub fn get_flags(&self) -> MapFlags {
        A::from_arch(self.raw, self.level).0
    }

    /// Return the caching mode encoded in this leaf
    pub fn get_caching(&self) -> CachingMode {
        A::from_arch(self.raw, self.level).1
    }

    /// Turn this entry into a leaf with the given protection and caching while keeping its physical address.
    ///
    /// # Panics
    /// This function panics if leaves are impossible at the level of this entry or if the caching mode cannot be
    /// expressed with `features`.
    pub fn set_flags(&mut self, flags: MapFlags, caching: CachingMode, features: &MmuFeatures) {
        let size = PageSize::from_level(self.level)
            .unwrap_or_else(|| panic!("leaf entries are impossible on level {}", self.level));
        let addr = self.get_addr();
        let bits = A::to_arch(flags.protection(), caching, size, features);
        self.raw = A::with_addr(bits, addr, self.level);
    }

    /// Turn this entry into a pointer to the table at `addr`.
    pub fn set_table(&mut self, addr: PAddr) {
        assert!(self.level > 0, "level 0 entries cannot point to tables");
        self.raw = A::with_addr(A::table_bits(), addr, self.level);
    }

    /// Clear the content of this entry, setting it to 0x0 and removing all flags.
    pub fn clear(&mut self) {
        self.raw = 0;
    }
}

impl<A: Mmu> Debug for PageTableEntry<A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        if self.is_empty() {
            f.write_fmt(format_args!("PageTableEntry L{} (empty)", self.level))
        } else if self.is_table() {
            f.write_fmt(format_args!(
                "PageTableEntry L{} {{ table: {:#x} }}",
                self.level,
                self.get_addr()
            ))
        } else {
            let (flags, caching) = A::from_arch(self.raw, self.level);
            f.write_fmt(format_args!(
                "PageTableEntry L{} {{ addr: {:#x}, flags: {:?}, caching: {:?} }}",
                self.level,
                self.get_addr(),
                flags,
                caching
            ))
        }
    }
}

impl<A: Mmu> Binary for PageTableEntry<A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        Binary::fmt(&self.raw, f)
    }
}

impl<A: Mmu> LowerHex for PageTableEntry<A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        LowerHex::fmt(&self.raw, f)
    }
}

impl<A: Mmu> UpperHex for PageTableEntry<A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        UpperHex::fmt(&self.raw, f)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::arch::{Sv48, X86_64};

    const FEATURES: MmuFeatures = MmuFeatures {
        large_pages: true,
        no_execute: true,
        cache_attributes: true,
    };

    fn check_states<A: Mmu>() {
        let mut entry = PageTableEntry::<A>::empty(1);
        assert!(entry.is_empty());
        assert!(!entry.is_table() && !entry.is_leaf());

        entry.set_table(0x8000_3000);
        assert!(entry.is_table() && !entry.is_leaf());
        assert_eq!(entry.get_addr(), 0x8000_3000);

        entry.set_addr(0x8020_0000);
        entry.set_flags(MapFlags::RW | MapFlags::USER, CachingMode::Normal, &FEATURES);
        assert!(entry.is_leaf() && !entry.is_table());
        assert_eq!(entry.page_size(), Some(PageSize::Medium));
        assert_eq!(entry.get_addr(), 0x8020_0000);
        assert_eq!(
            entry.get_flags(),
            MapFlags::RW | MapFlags::USER | MapFlags::MEDIUM_PAGE
        );

        entry.clear();
        assert!(entry.is_empty());
    }

    #[test]
    fn test_entry_states_x86_64() {
        check_states::<X86_64>();
    }

    #[test]
    fn test_entry_states_sv48() {
        check_states::<Sv48>();
    }

    #[test]
    fn test_set_flags_keeps_address() {
        let mut entry = PageTableEntry::<X86_64>::empty(0);
        entry.set_addr(0x1234_5000);
        entry.set_flags(MapFlags::RWX, CachingMode::WriteCombining, &FEATURES);
        entry.set_flags(MapFlags::READ, CachingMode::Normal, &FEATURES);
        assert_eq!(entry.get_addr(), 0x1234_5000);
        assert_eq!(entry.get_flags(), MapFlags::READ);
        assert_eq!(entry.get_caching(), CachingMode::Normal);
    }

    #[test]
    fn test_guard_entry_is_leaf() {
        let mut entry = PageTableEntry::<Sv48>::empty(0);
        entry.set_addr(0x9000);
        entry.set_flags(MapFlags::empty(), CachingMode::Normal, &FEATURES);
        assert!(entry.is_leaf());
        assert_eq!(entry.get_addr(), 0x9000);
        assert!(!entry.get_flags().is_accessible());
    }

    #[test]
    #[should_panic]
    fn test_leaf_on_top_level_panics() {
        let mut entry = PageTableEntry::<X86_64>::empty(3);
        entry.set_flags(MapFlags::READ, CachingMode::Normal, &FEATURES);
    }
}
