//! Per-architecture page table formats.

mod riscv64;
mod x86_64;

pub use riscv64::Sv48;
pub use x86_64::X86_64;

use crate::{CachingMode, MapFlags, PAddr, PageSize, VAddr, PAGESIZE};

/// Optional MMU capabilities, probed once at boot.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MmuFeatures {
    /// Whether [`Large`](PageSize::Large) pages can be mapped
    pub large_pages: bool,
    /// Whether pages can be marked non-executable
    pub no_execute: bool,
    /// Whether caching modes other than [`Normal`](CachingMode::Normal) are expressible in page table entries
    pub cache_attributes: bool,
}

/// A hardware page table format.
///
/// Implementations are zero-sized marker types.
/// All entry words pass through the functions of this trait so that no other code needs to know the bit layout.
pub trait Mmu: Send + Sync + Sized + 'static {
    /// Name used in log messages
    const NAME: &'static str;

    /// Number of page table levels
    const LEVELS: usize = 4;

    /// Number of entries in each page table
    const ENTRIES: usize = 512;

    /// Number of virtual address bits consumed by one page table level
    const INDEX_BITS: u64 = 9;

    /// Probe the hardware for optional capabilities.
    fn probe() -> MmuFeatures;

    /// The capabilities of the running hardware.
    ///
    /// The probe runs once and the result is memoized for the lifetime of the kernel.
    fn features() -> MmuFeatures;

    /// The number of bytes translated by a leaf of the given size.
    fn page_bytes(size: PageSize) -> u64 {
        (PAGESIZE as u64) << (Self::INDEX_BITS * size.leaf_level() as u64)
    }

    /// The index into the page table at `level` that is used to translate `vaddr`.
    fn index(vaddr: VAddr, level: usize) -> usize {
        let shift = PAGESIZE.trailing_zeros() as u64 + Self::INDEX_BITS * level as u64;
        ((vaddr >> shift) as usize) & (Self::ENTRIES - 1)
    }

    /// The entry bits installed for entries that point to a next-level table.
    ///
    /// These are the minimal bits that make the table valid and do not restrict the permissions of leaves below it.
    fn table_bits() -> u64;

    /// Whether `raw` at `level` points to a next-level table.
    fn is_table(raw: u64, level: usize) -> bool;

    /// The physical address stored in `raw` at `level` with all flag and reserved bits masked out.
    fn addr_of(raw: u64, level: usize) -> PAddr;

    /// Replace the physical address stored in `raw` at `level` with `addr`, keeping all other bits.
    ///
    /// # Panics
    /// This function panics if `addr` cannot be represented in the entry at `level`.
    fn with_addr(raw: u64, addr: PAddr, level: usize) -> u64;

    /// Translate generic protection and caching into the entry bits of a leaf of the given size.
    ///
    /// The returned bits do not contain an address.
    ///
    /// # Panics
    /// This function panics if the caching mode cannot be expressed with the given `features`.
    fn to_arch(flags: MapFlags, caching: CachingMode, size: PageSize, features: &MmuFeatures) -> u64;

    /// Translate the bits of a leaf entry at `level` back into generic protection and caching.
    ///
    /// Leaves above level 0 report the matching page size marker.
    fn from_arch(raw: u64, level: usize) -> (MapFlags, CachingMode);

    /// Invalidate any cached translation of `vaddr` on the executing processor.
    fn invalidate(vaddr: VAddr);

    /// Switch the executing processor to the page table rooted at `root`.
    ///
    /// # Safety
    /// The page table must map the currently executing code, the stack and all data the kernel is about to touch.
    unsafe fn activate(root: PAddr);
}

pub(crate) fn size_marker(level: usize) -> MapFlags {
    match level {
        1 => MapFlags::MEDIUM_PAGE,
        2 => MapFlags::LARGE_PAGE,
        _ => MapFlags::empty(),
    }
}
