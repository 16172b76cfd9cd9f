//! RiscV Sv48 paging
//!
//! # Entry Format
//!
//! ```text
//!  63  62 61 60    54 53                                       10 9   8 7   6   5   4   3   2   1   0
//! ┌────┬─────┬───────┬───────────────────────────────────────────┬─────┬───┬───┬───┬───┬───┬───┬───┬───┐
//! │ N  │PBMT │ rsvd  │                    PPN                    │ RSW │ D │ A │ G │ U │ X │ W │ R │ V │
//! └────┴─────┴───────┴───────────────────────────────────────────┴─────┴───┴───┴───┴───┴───┴───┴───┴───┘
//! ```
//!
//! An entry with `V` set but none of `R`, `W` and `X` points to the next level table.
//! Otherwise the entry is a leaf on whatever level it is found.
//!
//! # Caching
//!
//! Caching is only expressible with the Svpbmt extension which adds the `PBMT` field.
//! Without it every mapping uses the attributes of the physical memory region it maps.
//! The finer x86 distinctions collapse into the three memory types Svpbmt provides.

use super::{size_marker, Mmu, MmuFeatures};
use crate::{CachingMode, MapFlags, PAddr, PageSize, VAddr};
use bitflags::bitflags;

bitflags! {
    /// The flags that can be set on an Sv48 page table entry
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct EntryFlags: u64 {
        /// If set, the MMU considers this a valid entry and uses it for address translation
        const Valid = 1 << 0;
        /// Allows reading from the mapped page
        const Readable = 1 << 1;
        /// Allows writing to the mapped page
        const Writable = 1 << 2;
        /// Allows executing code from the mapped page
        const Executable = 1 << 3;
        /// Allows access from user mode
        const UserAccessible = 1 << 4;
        /// The translation is present in all address spaces
        const Global = 1 << 5;
        /// Set by the MMU (or by software on hardware that traps instead) when the page was accessed
        const Accessed = 1 << 6;
        /// Set by the MMU (or by software on hardware that traps instead) when the page was written to
        const Dirty = 1 << 7;
        /// Software bit marking a guard mapping which is not valid in hardware but still translates
        const Guard = 1 << 8;
        /// Svpbmt non-cacheable idempotent memory
        const PbmtNc = 1 << 61;
        /// Svpbmt non-cacheable non-idempotent I/O memory
        const PbmtIo = 1 << 62;
    }
}

const PPN_SHIFT: u64 = 10;
const PPN_MASK: u64 = (1 << 44) - 1;
const RWX: EntryFlags = EntryFlags::Readable
    .union(EntryFlags::Writable)
    .union(EntryFlags::Executable);

/// `satp.MODE` value selecting Sv48
const SATP_MODE_SV48: u64 = 9;

/// Marker type for the RiscV Sv48 page table format
#[derive(Debug, Copy, Clone)]
pub struct Sv48;

impl Mmu for Sv48 {
    const NAME: &'static str = "sv48";

    fn probe() -> MmuFeatures {
        // gigapages are mandatory in Sv48, Svpbmt is not discoverable without a device tree
        MmuFeatures {
            large_pages: true,
            no_execute: true,
            cache_attributes: false,
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
        EntryFlags::Valid.bits()
    }

    fn is_table(raw: u64, level: usize) -> bool {
        let flags = EntryFlags::from_bits_truncate(raw);
        level > 0 && flags.contains(EntryFlags::Valid) && !flags.intersects(RWX)
    }

    fn addr_of(raw: u64, _level: usize) -> PAddr {
        ((raw >> PPN_SHIFT) & PPN_MASK) << 12
    }

    fn with_addr(raw: u64, addr: PAddr, level: usize) -> u64 {
        let ppn = addr >> 12;
        assert!(
            addr & 0xfff == 0 && ppn <= PPN_MASK,
            "physical address {addr:#x} cannot be stored in a level {level} entry"
        );
        (raw & !(PPN_MASK << PPN_SHIFT)) | (ppn << PPN_SHIFT)
    }

    fn to_arch(flags: MapFlags, caching: CachingMode, _size: PageSize, features: &MmuFeatures) -> u64 {
        let mut bits = EntryFlags::empty();
        if flags.contains(MapFlags::READ) {
            bits |= EntryFlags::Readable;
        }
        if flags.contains(MapFlags::WRITE) {
            // writable but not readable is a reserved encoding
            bits |= EntryFlags::Readable | EntryFlags::Writable;
        }
        if flags.contains(MapFlags::EXEC) {
            bits |= EntryFlags::Executable;
        }
        if flags.contains(MapFlags::USER) {
            bits |= EntryFlags::UserAccessible;
        }
        if flags.contains(MapFlags::GLOBAL) {
            bits |= EntryFlags::Global;
        }

        if bits.intersects(RWX) {
            // not every implementation manages A and D in hardware so they are always pre-set
            bits |= EntryFlags::Valid | EntryFlags::Accessed | EntryFlags::Dirty;
        } else {
            bits |= EntryFlags::Guard;
        }

        let pbmt = match caching {
            CachingMode::Normal | CachingMode::WriteBack => EntryFlags::empty(),
            CachingMode::WriteThrough
            | CachingMode::WriteProtected
            | CachingMode::WriteCombining
            | CachingMode::Uncacheable => EntryFlags::PbmtNc,
            CachingMode::UncacheableStrong => EntryFlags::PbmtIo,
        };
        assert!(
            pbmt.is_empty() || features.cache_attributes,
            "caching mode {caching:?} requires the Svpbmt extension"
        );

        (bits | pbmt).bits()
    }

    fn from_arch(raw: u64, level: usize) -> (MapFlags, CachingMode) {
        let bits = EntryFlags::from_bits_truncate(raw);
        let mut flags = size_marker(level);
        if bits.contains(EntryFlags::Readable) {
            flags |= MapFlags::READ;
        }
        if bits.contains(EntryFlags::Writable) {
            flags |= MapFlags::WRITE;
        }
        if bits.contains(EntryFlags::Executable) {
            flags |= MapFlags::EXEC;
        }
        if bits.contains(EntryFlags::UserAccessible) {
            flags |= MapFlags::USER;
        }
        if bits.contains(EntryFlags::Global) {
            flags |= MapFlags::GLOBAL;
        }

        let caching = if bits.contains(EntryFlags::PbmtIo) {
            CachingMode::UncacheableStrong
        } else if bits.contains(EntryFlags::PbmtNc) {
            CachingMode::Uncacheable
        } else {
            CachingMode::Normal
        };

        (flags, caching)
    }

    fn invalidate(vaddr: VAddr) {
        #[cfg(all(target_arch = "riscv64", target_os = "none"))]
        unsafe {
            core::arch::asm!("sfence.vma {}, zero", in(reg) vaddr, options(nostack));
        }
        #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
        let _ = vaddr;
    }

    unsafe fn activate(root: PAddr) {
        let satp = (SATP_MODE_SV48 << 60) | (root >> 12);
        log::debug!("enabling page table {root:#x} (satp = {satp:#x})");
        #[cfg(all(target_arch = "riscv64", target_os = "none"))]
        unsafe {
            core::arch::asm!("csrw satp, {}", "sfence.vma", in(reg) satp, options(nostack));
        }
    }
}
