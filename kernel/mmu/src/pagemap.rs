use crate::addr::{is_aligned, is_canonical, is_upper_half, LOWER_HALF_END};
use crate::arch::{Mmu, MmuFeatures, Sv48, X86_64};
use crate::{CachingMode, MapFlags, MmuError, PAddr, PageSize, PageTableEntry, VAddr, PAGESIZE};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use allocators::{AllocInit, PhysMemory};
use core::fmt::{Debug, Formatter};
use core::marker::PhantomData;
use core::mem::size_of;
use spin::Mutex;
use static_assertions::const_assert_eq;


// every table must fill exactly one frame
const_assert_eq!(<X86_64 as Mmu>::ENTRIES * size_of::<u64>(), PAGESIZE);
const_assert_eq!(<Sv48 as Mmu>::ENTRIES * size_of::<u64>(), PAGESIZE);

/// Index of the first root entry belonging to the upper half of the address space
const FIRST_UPPER_ROOT_ENTRY: usize = 256;

/// Frame number of a physical address
#[inline]
fn pfn(addr: PAddr) -> u64 {
    addr >> PAGESIZE.trailing_zeros()
}

/// Bookkeeping about one page table owned by a [`Pagemap`]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct TableNode {
    /// The level of the table
    level: usize,
    /// Frame number of the parent table and the index of the entry in it which points to this table.
    /// The root table has no parent.
    parent: Option<(u64, usize)>,
}

/// All page tables owned by one [`Pagemap`], keyed by their frame number
#[derive(Debug, Default)]
struct TableArena {
    nodes: BTreeMap<u64, TableNode>,
}

/// The result of looking up which physical memory a virtual address translates to
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Translation {
    /// The physical address the looked up virtual address translates to, including the offset into the page
    pub paddr: PAddr,
    /// The size of the page containing the translation
    pub size: PageSize,
    /// Protection of the page without page size markers
    pub flags: MapFlags,
    pub caching: CachingMode,
}

/// The page table tree of one address space.
///
/// Tables are tracked in an arena keyed by frame number so that every table has exactly one owner and is released
/// exactly once when the pagemap is dropped.
/// The frames of leaf translations are never owned by the pagemap.
///
/// All structural changes are serialized by an internal lock that is private to this pagemap.
pub struct Pagemap<A: Mmu> {
    root: PAddr,
    phys: Arc<dyn PhysMemory>,
    features: MmuFeatures,
    tables: Mutex<TableArena>,
    /// The kernel pagemap whose upper half tables are borrowed and thus off limits for modification
    kernel: Option<Arc<Pagemap<A>>>,
    _arch: PhantomData<A>,
}

impl<A: Mmu> Pagemap<A> {
    /// Create an empty pagemap using explicitly given hardware `features` instead of probing them.
    ///
    /// The pagemap covers the whole canonical address space.
    pub fn with_features(phys: Arc<dyn PhysMemory>, features: MmuFeatures) -> Result<Self, MmuError> {
        let root = phys.alloc(1, AllocInit::Zeroed)?;
        log::trace!("allocated {} root page table at {root:#x}", A::NAME);

        let mut arena = TableArena::default();
        arena.nodes.insert(
            pfn(root),
            TableNode {
                level: A::LEVELS - 1,
                parent: None,
            },
        );

        Ok(Self {
            root,
            phys,
            features,
            tables: Mutex::new(arena),
            kernel: None,
            _arch: PhantomData,
        })
    }

    /// Create the kernel pagemap.
    ///
    /// Every root entry of the upper half is populated with a table right away so that pagemaps created later with
    /// [`new_user`](Pagemap::new_user) observe all future kernel mappings.
    pub fn new_kernel(phys: Arc<dyn PhysMemory>) -> Result<Self, MmuError> {
        let pagemap = Self::with_features(phys, A::features())?;
        {
            let mut arena = pagemap.tables.lock();
            for index in FIRST_UPPER_ROOT_ENTRY..A::ENTRIES {
                pagemap.alloc_table(&mut arena, pagemap.root, A::LEVELS - 1, index)?;
            }
        }
        log::debug!(
            "created kernel pagemap at {:#x} with {} preallocated upper half tables",
            pagemap.root,
            A::ENTRIES - FIRST_UPPER_ROOT_ENTRY
        );
        Ok(pagemap)
    }

    /// Create a pagemap for a user address space.
    ///
    /// The upper half is shared with `kernel` by copying its root entries.
    /// The shared tables stay owned by `kernel` which is kept alive by the new pagemap.
    /// Only the lower half can be modified through the returned pagemap.
    pub fn new_user(kernel: &Arc<Pagemap<A>>) -> Result<Self, MmuError> {
        let mut pagemap = Self::with_features(kernel.phys.clone(), kernel.features)?;
        pagemap.kernel = Some(kernel.clone());
        for index in FIRST_UPPER_ROOT_ENTRY..A::ENTRIES {
            let offset = (index * size_of::<u64>()) as u64;
            let raw = kernel.phys.read_u64(kernel.root + offset);
            pagemap.phys.write_u64(pagemap.root + offset, raw);
        }
        log::debug!(
            "created user pagemap at {:#x} sharing the kernel half of {:#x}",
            pagemap.root,
            kernel.root
        );
        Ok(pagemap)
    }

    /// The physical address of the root table
    pub fn root(&self) -> PAddr {
        self.root
    }

    /// The hardware capabilities this pagemap encodes entries for
    pub fn features(&self) -> MmuFeatures {
        self.features
    }

    /// How many page tables (including the root) are owned by this pagemap
    pub fn table_count(&self) -> usize {
        self.tables.lock().nodes.len()
    }

    /// The physical memory this pagemap allocates its tables from
    pub fn phys(&self) -> &Arc<dyn PhysMemory> {
        &self.phys
    }

    /// The page size that is actually used when `size` is requested.
    ///
    /// Large pages degrade to medium pages when the hardware does not support them.
    pub fn effective_size(&self, size: PageSize) -> PageSize {
        match size {
            PageSize::Large if !self.features.large_pages => PageSize::Medium,
            size => size,
        }
    }

    /// The number of bytes translated by one page of the effective size belonging to `size`
    pub fn page_bytes(&self, size: PageSize) -> u64 {
        A::page_bytes(self.effective_size(size))
    }

    /// Switch the executing processor to this pagemap.
    ///
    /// # Safety
    /// The pagemap must map the currently executing code, the stack and all data the kernel is about to touch.
    pub unsafe fn activate(&self) {
        unsafe { A::activate(self.root) }
    }

    /// Install translations for every page in `[vaddr, vaddr + length)` to the physical memory starting at `paddr`.
    ///
    /// Missing intermediate tables are allocated.
    /// Existing leaf translations in the range are replaced.
    /// If installing any page fails, all translations installed by this call are cleared again, including those that
    /// replaced previous translations.
    pub fn map(
        &self,
        vaddr: VAddr,
        paddr: PAddr,
        length: u64,
        flags: MapFlags,
        size: PageSize,
        caching: CachingMode,
    ) -> Result<(), MmuError> {
        let size = self.effective_size(size);
        let bytes = A::page_bytes(size);
        if !is_aligned(vaddr, bytes) || !is_aligned(paddr, bytes) {
            return Err(MmuError::AddrNotAligned);
        }
        let pages = self.check_range(vaddr, length, bytes)?;
        if paddr.checked_add(pages * bytes).is_none() {
            return Err(MmuError::OutOfRange);
        }

        let mut arena = self.tables.lock();
        for i in 0..pages {
            let result = self.map_page(
                &mut arena,
                vaddr + i * bytes,
                paddr + i * bytes,
                flags,
                size,
                caching,
            );
            if let Err(e) = result {
                log::debug!(
                    "mapping {vaddr:#x} failed after {i} of {pages} pages ({e}), rolling back"
                );
                for j in 0..i {
                    self.clear_leaf(vaddr + j * bytes, size.leaf_level());
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Remove the translations of every page in `[vaddr, vaddr + length)`.
    ///
    /// Fails with [`NotFound`](MmuError::NotFound) without changing anything if the page table path to any page does
    /// not exist.
    pub fn unmap(&self, vaddr: VAddr, length: u64, size: PageSize) -> Result<(), MmuError> {
        let size = self.effective_size(size);
        let bytes = A::page_bytes(size);
        if !is_aligned(vaddr, bytes) {
            return Err(MmuError::AddrNotAligned);
        }
        let pages = self.check_range(vaddr, length, bytes)?;
        let level = size.leaf_level();

        let _arena = self.tables.lock();
        for i in 0..pages {
            let entry = self.load(self.walk(None, vaddr + i * bytes, level)?, level);
            if entry.is_table() {
                return Err(MmuError::InvalidEntry);
            }
        }
        for i in 0..pages {
            self.clear_leaf(vaddr + i * bytes, level);
        }
        Ok(())
    }

    /// Re-encode the leaves of every page in `[vaddr, vaddr + length)` with new protection and caching while keeping
    /// the physical memory they translate to.
    ///
    /// Fails with [`NotFound`](MmuError::NotFound) without changing anything if any page has no translation.
    pub fn protect(
        &self,
        vaddr: VAddr,
        length: u64,
        flags: MapFlags,
        size: PageSize,
        caching: CachingMode,
    ) -> Result<(), MmuError> {
        let size = self.effective_size(size);
        let bytes = A::page_bytes(size);
        if !is_aligned(vaddr, bytes) {
            return Err(MmuError::AddrNotAligned);
        }
        let pages = self.check_range(vaddr, length, bytes)?;
        let level = size.leaf_level();

        let _arena = self.tables.lock();
        for i in 0..pages {
            let entry = self.load(self.walk(None, vaddr + i * bytes, level)?, level);
            if entry.is_table() {
                return Err(MmuError::InvalidEntry);
            } else if entry.is_empty() {
                return Err(MmuError::NotFound);
            }
        }
        for i in 0..pages {
            let page = vaddr + i * bytes;
            let entry_addr = self.walk(None, page, level)?;
            let mut entry = self.load(entry_addr, level);
            entry.set_flags(flags, caching, &self.features);
            self.store(entry_addr, entry);
            A::invalidate(page);
        }
        Ok(())
    }

    /// Return the physical address of the page of the given size at `vaddr`.
    ///
    /// This never allocates.
    pub fn translate(&self, vaddr: VAddr, size: PageSize) -> Result<PAddr, MmuError> {
        let size = self.effective_size(size);
        if !is_aligned(vaddr, A::page_bytes(size)) {
            return Err(MmuError::AddrNotAligned);
        }
        if !is_canonical(vaddr) {
            return Err(MmuError::OutOfRange);
        }

        let level = size.leaf_level();
        let entry = self.load(self.walk(None, vaddr, level)?, level);
        if entry.is_table() {
            Err(MmuError::InvalidEntry)
        } else if entry.is_empty() {
            Err(MmuError::NotFound)
        } else {
            Ok(entry.get_addr())
        }
    }

    /// Find the translation of the (not necessarily aligned) address `vaddr` whatever page size it is mapped with.
    pub fn query(&self, vaddr: VAddr) -> Option<Translation> {
        if !is_canonical(vaddr) {
            return None;
        }

        let mut table = self.root;
        for level in (0..A::LEVELS).rev() {
            let entry = self.load(table + (A::index(vaddr, level) * size_of::<u64>()) as u64, level);
            if entry.is_table() {
                table = entry.get_addr();
            } else if entry.is_empty() {
                return None;
            } else {
                let size = entry.page_size()?;
                return Some(Translation {
                    paddr: entry.get_addr() + (vaddr & (A::page_bytes(size) - 1)),
                    size,
                    flags: entry.get_flags().protection(),
                    caching: entry.get_caching(),
                });
            }
        }
        None
    }

    /// Validate that `[vaddr, vaddr + length)` may be modified through this pagemap and return the number of pages of
    /// `bytes` each covering it.
    fn check_range(&self, vaddr: VAddr, length: u64, bytes: u64) -> Result<u64, MmuError> {
        let pages = length.div_ceil(bytes);
        if pages == 0 {
            return Ok(0);
        }
        let last = (pages - 1)
            .checked_mul(bytes)
            .and_then(|offset| offset.checked_add(bytes - 1))
            .and_then(|offset| vaddr.checked_add(offset))
            .ok_or(MmuError::OutOfRange)?;
        if !is_canonical(vaddr) || !is_canonical(last) || is_upper_half(vaddr) != is_upper_half(last) {
            return Err(MmuError::OutOfRange);
        }
        if self.kernel.is_some() && last >= LOWER_HALF_END {
            return Err(MmuError::OutOfRange);
        }
        Ok(pages)
    }

    /// Walk from the root down to the table at `level` responsible for `vaddr` and return the physical address of the
    /// entry translating `vaddr` in it.
    ///
    /// Missing tables are allocated if an `arena` is given which records them.
    fn walk(&self, mut arena: Option<&mut TableArena>, vaddr: VAddr, level: usize) -> Result<PAddr, MmuError> {
        let mut table = self.root;
        for current in (level + 1..A::LEVELS).rev() {
            let index = A::index(vaddr, current);
            let entry = self.load(table + (index * size_of::<u64>()) as u64, current);
            table = if entry.is_table() {
                entry.get_addr()
            } else if !entry.is_empty() {
                return Err(MmuError::InvalidEntry);
            } else if let Some(arena) = arena.as_deref_mut() {
                self.alloc_table(arena, table, current, index)?
            } else {
                return Err(MmuError::NotFound);
            };
        }
        Ok(table + (A::index(vaddr, level) * size_of::<u64>()) as u64)
    }

    /// Allocate a new table and install it at `index` of the table at `parent` which is located at `level`
    fn alloc_table(
        &self,
        arena: &mut TableArena,
        parent: PAddr,
        level: usize,
        index: usize,
    ) -> Result<PAddr, MmuError> {
        let table = self.phys.alloc(1, AllocInit::Zeroed)?;
        log::trace!("allocated level {} page table at {table:#x}", level - 1);
        arena.nodes.insert(
            pfn(table),
            TableNode {
                level: level - 1,
                parent: Some((pfn(parent), index)),
            },
        );

        let mut entry = PageTableEntry::<A>::empty(level);
        entry.set_table(table);
        self.store(parent + (index * size_of::<u64>()) as u64, entry);
        Ok(table)
    }

    fn map_page(
        &self,
        arena: &mut TableArena,
        vaddr: VAddr,
        paddr: PAddr,
        flags: MapFlags,
        size: PageSize,
        caching: CachingMode,
    ) -> Result<(), MmuError> {
        let level = size.leaf_level();
        let entry_addr = self.walk(Some(arena), vaddr, level)?;
        let previous = self.load(entry_addr, level);
        if previous.is_table() {
            return Err(MmuError::InvalidEntry);
        }

        let mut entry = PageTableEntry::<A>::empty(level);
        entry.set_flags(flags, caching, &self.features);
        entry.set_addr(paddr);
        self.store(entry_addr, entry);
        if previous.is_leaf() {
            A::invalidate(vaddr);
        }
        Ok(())
    }

    /// Clear the leaf translating `vaddr` at `level` if the path to it exists
    fn clear_leaf(&self, vaddr: VAddr, level: usize) {
        if let Ok(entry_addr) = self.walk(None, vaddr, level) {
            let mut entry = self.load(entry_addr, level);
            if entry.is_leaf() {
                entry.clear();
                self.store(entry_addr, entry);
                A::invalidate(vaddr);
            }
        }
    }

    fn load(&self, entry_addr: PAddr, level: usize) -> PageTableEntry<A> {
        PageTableEntry::from_raw(self.phys.read_u64(entry_addr), level)
    }

    fn store(&self, entry_addr: PAddr, entry: PageTableEntry<A>) {
        log::trace!(
            "setting page table entry {:#x}:{} to {entry:?}",
            entry_addr & !(PAGESIZE as u64 - 1),
            (entry_addr & (PAGESIZE as u64 - 1)) / size_of::<u64>() as u64,
        );
        self.phys.write_u64(entry_addr, entry.raw());
    }
}

impl<A: Mmu> Debug for Pagemap<A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pagemap")
            .field("arch", &A::NAME)
            .field("root", &format_args!("{:#x}", self.root))
            .field("features", &self.features)
            .field("kernel", &self.kernel.as_ref().map(|kernel| kernel.root))
            .finish_non_exhaustive()
    }
}

impl<A: Mmu> Drop for Pagemap<A> {
    fn drop(&mut self) {
        let nodes = core::mem::take(&mut self.tables.get_mut().nodes);
        log::trace!(
            "freeing {} page tables of pagemap {:#x}",
            nodes.len(),
            self.root
        );
        for (frame, node) in nodes.iter() {
            debug_assert!(
                node.parent
                    .map_or(true, |(parent, _)| nodes.contains_key(&parent)),
                "level {} page table {frame:#x} is not owned by any table of this pagemap",
                node.level
            );
            self.phys.free(*frame << PAGESIZE.trailing_zeros(), 1);
        }
    }
}
