//! Layout of kernel-internal virtual memory regions
//!
//! Besides the direct map of physical memory and the kernel binary, the upper half of every address space contains
//! windows the kernel maps on demand, e.g. for firmware tables or device registers.
//! Each kind of window lives in its own [`Region`] and is handed out by bumping a per-region cursor.
//!
//! ```text
//! 0xFFFF_C000_0000_0000 ┌──────────────────┐
//!                       │ ACPI tables      │ 1 GiB
//! 0xFFFF_C001_0000_0000 ├──────────────────┤
//!                       │ PCI config space │ 16 GiB
//! 0xFFFF_C010_0000_0000 ├──────────────────┤
//!                       │ PCI BARs         │ 256 GiB
//! 0xFFFF_D000_0000_0000 ├──────────────────┤
//!                       │ kernel heap      │ 16 TiB
//! 0xFFFF_E000_0000_0000 ├──────────────────┤
//!                       │ kernel stacks    │ 1 TiB
//!                       └──────────────────┘
//! ```
//!
//! The cursors are owned by boot-time state and passed to whoever needs to allocate a window.

use crate::vmspace::PAGE;
use crate::VmError;
use alloc::collections::BTreeMap;
use mmu::{align_up, is_aligned, is_upper_half, VAddr};

/// The virtual memory address at which ACPI tables are mapped
pub const VIRT_MEM_ACPI_START: VAddr = 0xFFFF_C000_0000_0000;

/// The virtual memory address at which PCI configuration space is mapped
pub const VIRT_MEM_PCI_START: VAddr = 0xFFFF_C001_0000_0000;

/// The virtual memory address at which PCI base address register windows are mapped
pub const VIRT_MEM_BAR_START: VAddr = 0xFFFF_C010_0000_0000;

/// The virtual memory address at which the kernel heap starts
pub const VIRT_MEM_HEAP_START: VAddr = 0xFFFF_D000_0000_0000;

/// The virtual memory address at which kernel stacks are mapped
pub const VIRT_MEM_STACKS_START: VAddr = 0xFFFF_E000_0000_0000;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum RegionKind {
    Acpi,
    Pci,
    Bar,
    Heap,
    Stacks,
}

/// A virtual address range `[start, end)` reserved for one kind of kernel mapping
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Region {
    pub kind: RegionKind,
    pub start: VAddr,
    pub end: VAddr,
}

/// The default regions, see the [module documentation](self)
pub const DEFAULT_REGIONS: [Region; 5] = [
    Region {
        kind: RegionKind::Acpi,
        start: VIRT_MEM_ACPI_START,
        end: VIRT_MEM_ACPI_START + (1 << 30),
    },
    Region {
        kind: RegionKind::Pci,
        start: VIRT_MEM_PCI_START,
        end: VIRT_MEM_PCI_START + (16 << 30),
    },
    Region {
        kind: RegionKind::Bar,
        start: VIRT_MEM_BAR_START,
        end: VIRT_MEM_BAR_START + (256 << 30),
    },
    Region {
        kind: RegionKind::Heap,
        start: VIRT_MEM_HEAP_START,
        end: VIRT_MEM_STACKS_START,
    },
    Region {
        kind: RegionKind::Stacks,
        start: VIRT_MEM_STACKS_START,
        end: VIRT_MEM_STACKS_START + (1 << 40),
    },
];

#[derive(Debug)]
struct Cursor {
    region: Region,
    next: VAddr,
}

/// Per-region bump allocators for kernel virtual address ranges
#[derive(Debug)]
pub struct KernelLayout {
    cursors: BTreeMap<RegionKind, Cursor>,
}

impl KernelLayout {
    /// Create a layout from a region table.
    ///
    /// Regions must be page aligned, non-empty, located in the upper half and must not overlap.
    /// Every kind may appear at most once.
    pub fn new(regions: &[Region]) -> Result<Self, VmError> {
        let mut cursors: BTreeMap<RegionKind, Cursor> = BTreeMap::new();
        for region in regions {
            if !is_aligned(region.start, PAGE) || !is_aligned(region.end, PAGE) {
                return Err(VmError::AddrNotAligned);
            }
            if region.start >= region.end || !is_upper_half(region.start) {
                return Err(VmError::InvalidArgument);
            }
            let overlaps = cursors
                .values()
                .any(|other| region.start < other.region.end && other.region.start < region.end);
            if overlaps || cursors.contains_key(&region.kind) {
                return Err(VmError::InvalidArgument);
            }
            cursors.insert(
                region.kind,
                Cursor {
                    region: *region,
                    next: region.start,
                },
            );
        }
        Ok(Self { cursors })
    }

    pub fn with_default_regions() -> Self {
        Self {
            cursors: DEFAULT_REGIONS
                .iter()
                .map(|region| {
                    (
                        region.kind,
                        Cursor {
                            region: *region,
                            next: region.start,
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn region(&self, kind: RegionKind) -> Option<Region> {
        self.cursors.get(&kind).map(|cursor| cursor.region)
    }

    /// Reserve `length` bytes, rounded up to whole pages, from the region of `kind` and return the start address.
    pub fn alloc_region(&mut self, kind: RegionKind, length: u64) -> Result<VAddr, VmError> {
        self.alloc_aligned(kind, length, PAGE)
    }

    /// Like [`alloc_region`](Self::alloc_region) but the returned address is a multiple of `align`.
    ///
    /// `align` must be a power of two of at least the page size.
    pub fn alloc_aligned(&mut self, kind: RegionKind, length: u64, align: u64) -> Result<VAddr, VmError> {
        if length == 0 || !align.is_power_of_two() || align < PAGE {
            return Err(VmError::InvalidArgument);
        }
        let cursor = self.cursors.get_mut(&kind).ok_or(VmError::InvalidArgument)?;
        let length = align_up(length, PAGE).ok_or(VmError::NoSpace)?;
        let start = align_up(cursor.next, align).ok_or(VmError::NoSpace)?;
        let end = start
            .checked_add(length)
            .filter(|&end| end <= cursor.region.end)
            .ok_or(VmError::NoSpace)?;

        log::debug!("reserving {start:#x}..{end:#x} for {kind:?}");
        cursor.next = end;
        Ok(start)
    }

    /// How many bytes are left in the region of `kind`
    pub fn remaining(&self, kind: RegionKind) -> u64 {
        self.cursors
            .get(&kind)
            .map_or(0, |cursor| cursor.region.end - cursor.next)
    }
}
