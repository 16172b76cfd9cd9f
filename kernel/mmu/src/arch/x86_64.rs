//! x86_64 4-level paging
//!
//! # Entry Format
//!
//! ```text
//!  63  62    52 51                                  12 11  9  8   7   6   5   4   3   2   1   0
//! ┌────┬───────┬──────────────────────────────────────┬─────┬───┬───┬───┬───┬───┬───┬───┬───┬───┐
//! │ NX │ avail │          physical address            │ AVL │ G │PS │ D │ A │PCD│PWT│U/S│R/W│ P │
//! └────┴───────┴──────────────────────────────────────┴─────┴───┴───┴───┴───┴───┴───┴───┴───┴───┘
//! ```
//!
//! In level 0 entries bit 7 selects the upper half of the PAT.
//! In leaves above level 0 bit 7 is the page size bit and bit 12 takes over the role of the PAT bit.
//!
//! # Caching
//!
//! Caching modes are expressed through a PAT index (`PAT << 2 | PCD << 1 | PWT`).
//! The kernel is expected to program `IA32_PAT` with [`PAT_MSR_VALUE`] during boot so that the indices have the
//! following meaning:
//!
//! | index | type | [`CachingMode`] |
//! | :---: | :--: | ---- |
//! | 0 | WB  | `Normal`, `WriteBack` |
//! | 1 | WT  | `WriteThrough` |
//! | 2 | UC- | `Uncacheable` |
//! | 3 | UC  | `UncacheableStrong` |
//! | 4 | WB  | |
//! | 5 | WP  | `WriteProtected` |
//! | 6 | WC  | `WriteCombining` |
//! | 7 | UC  | |

use super::{size_marker, Mmu, MmuFeatures};
use crate::{CachingMode, MapFlags, PAddr, PageSize, VAddr};
use bitflags::bitflags;

bitflags! {
    /// The flags that can be set on an x86_64 page table entry
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct EntryFlags: u64 {
        /// If set, the MMU considers this a valid entry and uses it for address translation
        const Present = 1 << 0;
        const Writable = 1 << 1;
        /// Allows access from user mode
        const User = 1 << 2;
        const WriteThrough = 1 << 3;
        const CacheDisable = 1 << 4;
        /// Set by the MMU when something has accessed the page since the mapping was set up
        const Accessed = 1 << 5;
        /// Set by the MMU when something has written to the page since the mapping was set up
        const Dirty = 1 << 6;
        /// Page size bit in level 1 and 2 entries, PAT bit in level 0 entries
        const Huge = 1 << 7;
        /// The translation is present in all address spaces
        const Global = 1 << 8;
        /// Software bit marking a guard mapping which is not present in hardware but still translates
        const Guard = 1 << 9;
        /// PAT bit of level 1 and 2 leaves
        const HugePat = 1 << 12;
        /// Forbids instruction fetches from the page
        const NoExecute = 1 << 63;
    }
}

/// Bits holding the physical address of a table or a 4 KiB page
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// The value the kernel must program into the `IA32_PAT` MSR for the caching encoding of this module to be valid.
pub const PAT_MSR_VALUE: u64 = 0x0001_0506_0007_0406;

/// Marker type for the x86_64 page table format
#[derive(Debug, Copy, Clone)]
pub struct X86_64;

impl X86_64 {
    fn pat_index(caching: CachingMode) -> u64 {
        match caching {
            CachingMode::Normal | CachingMode::WriteBack => 0,
            CachingMode::WriteThrough => 1,
            CachingMode::Uncacheable => 2,
            CachingMode::UncacheableStrong => 3,
            CachingMode::WriteProtected => 5,
            CachingMode::WriteCombining => 6,
        }
    }

    fn caching_of(index: u64) -> CachingMode {
        match index {
            1 => CachingMode::WriteThrough,
            2 => CachingMode::Uncacheable,
            3 | 7 => CachingMode::UncacheableStrong,
            5 => CachingMode::WriteProtected,
            6 => CachingMode::WriteCombining,
            _ => CachingMode::Normal,
        }
    }

    fn pat_bit(level: usize) -> EntryFlags {
        if level == 0 {
            EntryFlags::Huge
        } else {
            EntryFlags::HugePat
        }
    }

    fn addr_mask(raw: u64, level: usize) -> u64 {
        let flags = EntryFlags::from_bits_truncate(raw);
        if level > 0 && flags.contains(EntryFlags::Huge) {
            ADDR_MASK & !EntryFlags::HugePat.bits()
        } else {
            ADDR_MASK
        }
    }
}

impl Mmu for X86_64 {
    const NAME: &'static str = "x86_64";

    fn probe() -> MmuFeatures {
        #[cfg(target_arch = "x86_64")]
        #[allow(unused_unsafe)]
        {
            use core::arch::x86_64::__cpuid;

            let max_extended = unsafe { __cpuid(0x8000_0000) }.eax;
            if max_extended >= 0x8000_0001 {
                let edx = unsafe { __cpuid(0x8000_0001) }.edx;
                return MmuFeatures {
                    large_pages: edx & (1 << 26) != 0,
                    no_execute: edx & (1 << 20) != 0,
                    cache_attributes: true,
                };
            }
        }

        MmuFeatures {
            large_pages: false,
            no_execute: false,
            cache_attributes: true,
        }
    }

    fn features() -> MmuFeatures {
        static FEATURES: spin::Once<MmuFeatures> = spin::Once::new();
        *FEATURES.call_once(|| {
            let features = Self::probe();
            log::debug!("probed {} mmu features: {features:?}", Self::NAME);
            features
        })
    }

    fn table_bits() -> u64 {
        // user access must be allowed on every level for user leaves to be reachable
        (EntryFlags::Present | EntryFlags::Writable | EntryFlags::User).bits()
    }

    fn is_table(raw: u64, level: usize) -> bool {
        let flags = EntryFlags::from_bits_truncate(raw);
        level > 0 && flags.contains(EntryFlags::Present) && !flags.contains(EntryFlags::Huge)
    }

    fn addr_of(raw: u64, level: usize) -> PAddr {
        raw & Self::addr_mask(raw, level)
    }

    fn with_addr(raw: u64, addr: PAddr, level: usize) -> u64 {
        let mask = Self::addr_mask(raw, level);
        assert_eq!(
            addr & mask,
            addr,
            "physical address {addr:#x} cannot be stored in a level {level} entry"
        );
        (raw & !mask) | addr
    }

    fn to_arch(flags: MapFlags, caching: CachingMode, size: PageSize, features: &MmuFeatures) -> u64 {
        let mut bits = if flags.is_accessible() {
            EntryFlags::Present
        } else {
            EntryFlags::Guard
        };
        if flags.contains(MapFlags::WRITE) {
            bits |= EntryFlags::Writable;
        }
        if flags.contains(MapFlags::USER) {
            bits |= EntryFlags::User;
        }
        if flags.contains(MapFlags::GLOBAL) {
            bits |= EntryFlags::Global;
        }
        if !flags.contains(MapFlags::EXEC) && features.no_execute {
            bits |= EntryFlags::NoExecute;
        }
        if size != PageSize::Small {
            bits |= EntryFlags::Huge;
        }

        let pat = Self::pat_index(caching);
        if pat & 0b001 != 0 {
            bits |= EntryFlags::WriteThrough;
        }
        if pat & 0b010 != 0 {
            bits |= EntryFlags::CacheDisable;
        }
        if pat & 0b100 != 0 {
            bits |= Self::pat_bit(size.leaf_level());
        }

        bits.bits()
    }

    fn from_arch(raw: u64, level: usize) -> (MapFlags, CachingMode) {
        let bits = EntryFlags::from_bits_truncate(raw);
        let mut flags = size_marker(level);
        if bits.contains(EntryFlags::Present) {
            flags |= MapFlags::READ;
            if !bits.contains(EntryFlags::NoExecute) {
                flags |= MapFlags::EXEC;
            }
        }
        if bits.contains(EntryFlags::Writable) {
            flags |= MapFlags::WRITE;
        }
        if bits.contains(EntryFlags::User) {
            flags |= MapFlags::USER;
        }
        if bits.contains(EntryFlags::Global) {
            flags |= MapFlags::GLOBAL;
        }

        let mut pat = 0;
        if bits.contains(EntryFlags::WriteThrough) {
            pat |= 0b001;
        }
        if bits.contains(EntryFlags::CacheDisable) {
            pat |= 0b010;
        }
        if bits.contains(Self::pat_bit(level)) {
            pat |= 0b100;
        }

        (flags, Self::caching_of(pat))
    }

    fn invalidate(vaddr: VAddr) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) vaddr, options(nostack, preserves_flags));
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        let _ = vaddr;
    }

    unsafe fn activate(root: PAddr) {
        log::debug!("enabling page table {root:#x}");
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) root, options(nostack, preserves_flags));
        }
    }
}
