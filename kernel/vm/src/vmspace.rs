use crate::object::WriteRevoke;
use crate::{MemObject, VmError};
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use bitflags::bitflags;
use core::cmp::{max, min};
use core::ops::Range;
use mmu::{
    align_up, is_aligned, CachingMode, MapFlags, Mmu, MmuError, PAddr, PageSize, Pagemap, VAddr, LOWER_HALF_END,
    PAGESIZE,
};
use spin::RwLock;

pub(crate) const PAGE: u64 = PAGESIZE as u64;

bitflags! {
    /// The protection of a mapping as seen by user space
    #[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct Prot: u32 {
        /// The mapping is readable.
        const READ = 0b001;
        /// The mapping is writable.
        const WRITE = 0b010;
        /// Code stored in the mapping can be executed.
        const EXEC = 0b100;
    }
}

impl Prot {
    /// The hardware protection of user pages with this protection
    pub fn map_flags(self) -> MapFlags {
        let mut flags = MapFlags::USER;
        if self.contains(Prot::READ) {
            flags |= MapFlags::READ;
        }
        if self.contains(Prot::WRITE) {
            flags |= MapFlags::WRITE;
        }
        if self.contains(Prot::EXEC) {
            flags |= MapFlags::EXEC;
        }
        flags
    }
}

/// Whether modifications through a mapping are visible to other mappings of the same object
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MapKind {
    Private,
    Shared,
}

/// Runtime configuration of an address space, provided by boot code
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct VmConfig {
    /// Lowest address that may be mapped
    pub user_start: VAddr,
    /// Address above the highest address that may be mapped
    pub user_end: VAddr,
    /// Where the search for free address ranges starts
    pub mmap_base: VAddr,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_start: PAGE,
            user_end: LOWER_HALF_END,
            mmap_base: 0x1000_0000_0000,
        }
    }
}

/// One mapping of an object into an address space.
///
/// The pieces a mapping is split into by partial unmaps or protection changes share the handle so that they count as a
/// single mapping of the object.
#[derive(Debug)]
pub(crate) struct MappingHandle {
    object: Arc<MemObject>,
}

impl MappingHandle {
    fn new(object: Arc<MemObject>) -> Arc<Self> {
        object.acquire_mapping();
        Arc::new(Self { object })
    }
}

impl Drop for MappingHandle {
    fn drop(&mut self) {
        self.object.release_mapping();
    }
}

/// A mapping entry covering the page numbers `[start, end)`
#[derive(Debug)]
pub(crate) struct Vma {
    pub(crate) start: u64,
    pub(crate) end: u64,
    handle: Arc<MappingHandle>,
    /// Page index into the object that `start` maps to
    pub(crate) offset: u64,
    pub(crate) prot: Prot,
    pub(crate) kind: MapKind,
}

impl Vma {
    fn new(start: u64, end: u64, object: Arc<MemObject>, offset: u64, prot: Prot, kind: MapKind) -> Self {
        Self {
            start,
            end,
            handle: MappingHandle::new(object),
            offset,
            prot,
            kind,
        }
    }

    pub(crate) fn object(&self) -> &Arc<MemObject> {
        &self.handle.object
    }

    /// The piece of this mapping covering the page numbers `[start, end)`
    fn slice(&self, start: u64, end: u64) -> Vma {
        Vma {
            start,
            end,
            handle: self.handle.clone(),
            offset: self.offset + (start - self.start),
            prot: self.prot,
            kind: self.kind,
        }
    }

    /// The object page index that is mapped at page number `page`
    pub(crate) fn object_index(&self, page: u64) -> usize {
        (self.offset + (page - self.start)) as usize
    }

    /// The object page indices mapped by the page numbers in `pages`
    fn object_range(&self, pages: Range<u64>) -> Range<usize> {
        self.object_index(pages.start)..self.object_index(pages.end)
    }

    /// The virtual address that object page `index` is mapped at
    fn address_of(&self, index: usize) -> VAddr {
        (self.start + (index as u64 - self.offset)) * PAGE
    }

    /// The hardware protection of resident pages.
    ///
    /// Writes to private mappings of objects that are mapped more than once must fault so that they can be copied.
    pub(crate) fn hw_flags(&self) -> MapFlags {
        let mut flags = self.prot.map_flags();
        if self.kind == MapKind::Private && self.object().mapping_count() > 1 {
            flags.remove(MapFlags::WRITE);
        }
        flags
    }

    fn info(&self) -> VmaInfo {
        VmaInfo {
            start: self.start * PAGE,
            end: self.end * PAGE,
            offset: self.offset * PAGE,
            prot: self.prot,
            kind: self.kind,
            object: self.object().clone(),
        }
    }
}

/// A snapshot of one mapping of a [`VmSpace`]
#[derive(Debug, Clone)]
pub struct VmaInfo {
    pub start: VAddr,
    pub end: VAddr,
    /// Byte offset into `object` that `start` maps to
    pub offset: u64,
    pub prot: Prot,
    pub kind: MapKind,
    pub object: Arc<MemObject>,
}

#[derive(Debug)]
pub(crate) struct MappingTree {
    /// Non-overlapping mappings keyed by their first page number
    pub(crate) vmas: BTreeMap<u64, Vma>,
    /// Page number where the next search for a free range starts
    cursor: u64,
}

impl MappingTree {
    /// The mapping containing page number `page`
    pub(crate) fn find(&self, page: u64) -> Option<&Vma> {
        self.vmas
            .range(..=page)
            .next_back()
            .map(|(_, vma)| vma)
            .filter(|vma| vma.end > page)
    }

    /// Start page numbers of all mappings overlapping `pages`
    fn overlapping(&self, pages: Range<u64>) -> Vec<u64> {
        self.vmas
            .range(..pages.end)
            .rev()
            .take_while(|(_, vma)| vma.end > pages.start)
            .map(|(&start, _)| start)
            .collect()
    }

    /// Whether `pages` is covered by adjacent mappings without gaps
    fn covers(&self, pages: Range<u64>) -> bool {
        let Some((&first, _)) = self.vmas.range(..=pages.start).next_back() else {
            return false;
        };
        let mut next = pages.start;
        for vma in self.vmas.range(first..).map(|(_, vma)| vma) {
            if vma.start > next {
                return false;
            }
            next = max(next, vma.end);
            if next >= pages.end {
                return true;
            }
        }
        false
    }
}

/// Key, first and end page number of the overlapping part, and the translated addresses in it
type Overlap = (u64, u64, u64, Vec<VAddr>);

/// Object page indices `[offset, offset + count)` must be addressable as bytes and as indices
fn check_object_range(offset: u64, count: u64) -> Result<(), VmError> {
    offset
        .checked_add(count)
        .filter(|&end| end.checked_mul(PAGE).is_some() && usize::try_from(end).is_ok())
        .map(|_| ())
        .ok_or(VmError::InvalidArgument)
}

/// The address space of one process.
///
/// It consists of non-overlapping mappings of [`MemObject`]s and the [`Pagemap`] which makes resident pages of these
/// objects visible to the hardware.
/// Translations are installed lazily by [`handle_fault`](VmSpace::handle_fault).
pub struct VmSpace<A: Mmu> {
    pub(crate) tree: RwLock<MappingTree>,
    pub(crate) pagemap: Arc<Pagemap<A>>,
    config: VmConfig,
}

impl<A: Mmu> WriteRevoke for Pagemap<A> {
    fn revoke_write(&self, vaddr: VAddr, frame: PAddr) {
        let Some(translation) = self.query(vaddr) else {
            return;
        };
        if translation.paddr != frame
            || translation.size != PageSize::Small
            || !translation.flags.contains(MapFlags::WRITE)
        {
            return;
        }
        let flags = translation.flags.difference(MapFlags::WRITE);
        if let Err(e) = self.protect(vaddr, PAGE, flags, PageSize::Small, translation.caching) {
            log::warn!("could not revoke write access at {vaddr:#x}: {e}");
        }
    }
}

impl<A: Mmu> VmSpace<A> {
    /// Create an empty address space that governs `pagemap`
    pub fn new(pagemap: Pagemap<A>, config: VmConfig) -> Self {
        Self {
            tree: RwLock::new(MappingTree {
                vmas: BTreeMap::new(),
                cursor: config.mmap_base / PAGE,
            }),
            pagemap: Arc::new(pagemap),
            config,
        }
    }

    /// Handle under which objects know about writable translations in this address space
    fn revoker(&self) -> Weak<dyn WriteRevoke> {
        let pagemap = Arc::downgrade(&self.pagemap);
        pagemap as Weak<dyn WriteRevoke>
    }

    /// Let the object of `vma` revoke write access to `page` once it is mapped again elsewhere
    pub(crate) fn track_translation(&self, vma: &Vma, page: u64, flags: MapFlags) {
        if vma.kind == MapKind::Private && flags.contains(MapFlags::WRITE) {
            vma.object()
                .track_writer(vma.object_index(page), page * PAGE, self.revoker());
        }
    }

    pub fn pagemap(&self) -> &Pagemap<A> {
        &self.pagemap
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Validate a byte range and return the page numbers it covers
    fn pages(&self, address: VAddr, length: u64) -> Result<Range<u64>, VmError> {
        if !is_aligned(address, PAGE) {
            return Err(VmError::AddrNotAligned);
        }
        if length == 0 {
            return Err(VmError::InvalidArgument);
        }
        let end = address
            .checked_add(length)
            .and_then(|end| align_up(end, PAGE))
            .ok_or(VmError::InvalidArgument)?;
        if address < self.config.user_start || end > self.config.user_end {
            return Err(VmError::InvalidArgument);
        }
        Ok(address / PAGE..end / PAGE)
    }

    /// Map `object` starting at byte `offset` to `[address, address + length)`.
    ///
    /// Existing mappings in the range are removed or cut back to the parts outside of it.
    pub fn map(
        &self,
        address: VAddr,
        length: u64,
        prot: Prot,
        kind: MapKind,
        object: Arc<MemObject>,
        offset: u64,
    ) -> Result<(), VmError> {
        let pages = self.pages(address, length)?;
        if !is_aligned(offset, PAGE) {
            return Err(VmError::AddrNotAligned);
        }
        check_object_range(offset / PAGE, pages.end - pages.start)?;
        let mut tree = self.tree.write();
        self.map_locked(&mut tree, pages, prot, kind, object, offset / PAGE)
    }

    /// Map `object` starting at byte `offset` to a free range of `length` bytes and return its address.
    pub fn map_anywhere(
        &self,
        length: u64,
        prot: Prot,
        kind: MapKind,
        object: Arc<MemObject>,
        offset: u64,
    ) -> Result<VAddr, VmError> {
        if length == 0 {
            return Err(VmError::InvalidArgument);
        }
        if !is_aligned(offset, PAGE) {
            return Err(VmError::AddrNotAligned);
        }
        let count = length.div_ceil(PAGE);
        check_object_range(offset / PAGE, count)?;
        let mut tree = self.tree.write();
        let start = self.find_free_locked(&mut tree, count)?;
        self.map_locked(&mut tree, start..start + count, prot, kind, object, offset / PAGE)?;
        Ok(start * PAGE)
    }

    pub(crate) fn map_locked(
        &self,
        tree: &mut MappingTree,
        pages: Range<u64>,
        prot: Prot,
        kind: MapKind,
        object: Arc<MemObject>,
        offset: u64,
    ) -> Result<(), VmError> {
        check_object_range(offset, pages.end - pages.start)?;
        self.remove_locked(tree, pages.clone())?;
        log::debug!(
            "mapping {:#x}..{:#x} ({prot:?}, {kind:?}) to {object:?} at page {offset}",
            pages.start * PAGE,
            pages.end * PAGE,
        );
        tree.vmas.insert(
            pages.start,
            Vma::new(pages.start, pages.end, object, offset, prot, kind),
        );
        Ok(())
    }

    /// Remove all mappings in `[address, address + length)`.
    ///
    /// Mappings partially inside the range are cut back to the parts outside of it.
    /// Unmapping a range without mappings is not an error.
    pub fn unmap(&self, address: VAddr, length: u64) -> Result<(), VmError> {
        let pages = self.pages(address, length)?;
        let mut tree = self.tree.write();
        log::debug!("unmapping {address:#x}..{:#x}", pages.end * PAGE);
        self.remove_locked(&mut tree, pages)
    }

    fn remove_locked(&self, tree: &mut MappingTree, pages: Range<u64>) -> Result<(), VmError> {
        // nothing is modified before every affected translation is known to be removable
        let plan = self.plan_locked(tree, pages)?;
        for (key, start, end, translated) in plan {
            if let Some(vma) = tree.vmas.get(&key) {
                self.unmap_translated(vma, &translated)?;
            }
            let Some(vma) = tree.vmas.remove(&key) else {
                continue;
            };
            if vma.start < start {
                tree.vmas.insert(vma.start, vma.slice(vma.start, start));
            }
            if vma.end > end {
                tree.vmas.insert(end, vma.slice(end, vma.end));
            }
        }
        Ok(())
    }

    /// For every mapping overlapping `pages` its key, the overlapping page numbers and the translated addresses in them
    fn plan_locked(&self, tree: &MappingTree, pages: Range<u64>) -> Result<Vec<Overlap>, VmError> {
        let mut plan = Vec::new();
        for key in tree.overlapping(pages.clone()) {
            let Some(vma) = tree.vmas.get(&key) else {
                continue;
            };
            let start = max(vma.start, pages.start);
            let end = min(vma.end, pages.end);
            plan.push((key, start, end, self.translated(vma, start..end)?));
        }
        Ok(plan)
    }

    /// Addresses of resident pages of `vma` in `pages` that have a translation installed
    fn translated(&self, vma: &Vma, pages: Range<u64>) -> Result<Vec<VAddr>, VmError> {
        let mut addresses = Vec::new();
        for (index, _) in vma.object().resident(vma.object_range(pages)) {
            let address = vma.address_of(index);
            match self.pagemap.query(address) {
                // mappings only ever install small pages
                Some(translation) if translation.size != PageSize::Small => {
                    return Err(MmuError::InvalidEntry.into())
                }
                Some(_) => addresses.push(address),
                None => {}
            }
        }
        Ok(addresses)
    }

    fn unmap_translated(&self, vma: &Vma, addresses: &[VAddr]) -> Result<(), VmError> {
        let revoker = self.revoker();
        for &address in addresses {
            self.pagemap.unmap(address, PAGE, PageSize::Small)?;
            vma.object().forget_writer(address, &revoker);
        }
        Ok(())
    }

    /// Change the protection of all mappings in `[address, address + length)` to `prot`.
    ///
    /// The range must be completely mapped.
    /// Mappings partially inside the range are split and translations of resident pages are updated.
    pub fn protect(&self, address: VAddr, length: u64, prot: Prot) -> Result<(), VmError> {
        let pages = self.pages(address, length)?;
        let mut tree = self.tree.write();
        if !tree.covers(pages.clone()) {
            return Err(VmError::NotMapped);
        }
        log::debug!("protecting {address:#x}..{:#x} as {prot:?}", pages.end * PAGE);

        let plan = self.plan_locked(&tree, pages)?;
        for (key, start, end, translated) in plan {
            let Some(vma) = tree.vmas.remove(&key) else {
                continue;
            };
            if vma.start < start {
                tree.vmas.insert(vma.start, vma.slice(vma.start, start));
            }
            if vma.end > end {
                tree.vmas.insert(end, vma.slice(end, vma.end));
            }

            let mut middle = vma.slice(start, end);
            middle.prot = prot;
            let flags = middle.hw_flags();
            let object = middle.object().clone();
            tree.vmas.insert(start, middle);
            if !flags.contains(MapFlags::WRITE) {
                let revoker = self.revoker();
                for &address in &translated {
                    object.forget_writer(address, &revoker);
                }
            }
            for address in translated {
                self.pagemap
                    .protect(address, PAGE, flags, PageSize::Small, CachingMode::Normal)?;
                if let Some(vma) = tree.find(address / PAGE) {
                    self.track_translation(vma, address / PAGE, flags);
                }
            }
        }
        Ok(())
    }

    /// Whether `[address, address + length)` is completely covered by mappings
    pub fn is_mapped(&self, address: VAddr, length: u64) -> bool {
        match self.pages(address, length) {
            Ok(pages) => self.tree.read().covers(pages),
            Err(_) => false,
        }
    }

    /// Reserve a free range of `length` bytes and return its address.
    ///
    /// Ranges are handed out by bumping a cursor that starts at [`VmConfig::mmap_base`] and skips over existing
    /// mappings.
    pub fn find_free(&self, length: u64) -> Result<VAddr, VmError> {
        if length == 0 {
            return Err(VmError::InvalidArgument);
        }
        let mut tree = self.tree.write();
        Ok(self.find_free_locked(&mut tree, length.div_ceil(PAGE))? * PAGE)
    }

    fn find_free_locked(&self, tree: &mut MappingTree, count: u64) -> Result<u64, VmError> {
        let limit = self.config.user_end / PAGE;
        let mut candidate = tree.cursor;
        loop {
            let end = candidate
                .checked_add(count)
                .filter(|&end| end <= limit)
                .ok_or(VmError::NoSpace)?;
            match tree.vmas.range(..end).next_back() {
                Some((_, vma)) if vma.end > candidate => candidate = vma.end,
                _ => {
                    tree.cursor = end;
                    return Ok(candidate);
                }
            }
        }
    }

    /// A snapshot of the mapping containing `address`
    pub fn mapping_at(&self, address: VAddr) -> Option<VmaInfo> {
        self.tree.read().find(address / PAGE).map(Vma::info)
    }

    /// A snapshot of all mappings ordered by address
    pub fn mappings(&self) -> Vec<VmaInfo> {
        self.tree.read().vmas.values().map(Vma::info).collect()
    }

    /// Create a copy of this address space that governs `pagemap`.
    ///
    /// Shared mappings reference the same objects in both address spaces and the translations of their resident pages
    /// are copied.
    /// Private mappings are backed by new objects in the child into which all resident pages are copied right away.
    pub fn fork(&self, pagemap: Pagemap<A>) -> Result<VmSpace<A>, VmError> {
        let tree = self.tree.read();
        let child = VmSpace::new(pagemap, self.config);
        {
            let mut child_tree = child.tree.write();
            child_tree.cursor = tree.cursor;

            for vma in tree.vmas.values() {
                let range = vma.object_range(vma.start..vma.end);
                let object = match vma.kind {
                    MapKind::Shared => {
                        for (index, _) in vma.object().resident(range) {
                            let address = vma.address_of(index);
                            if let Some(translation) = self.pagemap.query(address) {
                                child.pagemap.map(
                                    address,
                                    translation.paddr,
                                    PAGE,
                                    translation.flags,
                                    PageSize::Small,
                                    translation.caching,
                                )?;
                            }
                        }
                        vma.object().clone()
                    }
                    MapKind::Private => Arc::new(vma.object().duplicate(range)?),
                };
                child_tree.vmas.insert(
                    vma.start,
                    Vma::new(vma.start, vma.end, object, vma.offset, vma.prot, vma.kind),
                );
            }
        }
        log::debug!(
            "forked address space {:#x} into {:#x}",
            self.pagemap.root(),
            child.pagemap.root()
        );
        Ok(child)
    }
}

impl<A: Mmu> Drop for VmSpace<A> {
    fn drop(&mut self) {
        // translations must be gone before the objects release their frames
        let vmas = core::mem::take(&mut self.tree.get_mut().vmas);
        for vma in vmas.values() {
            let translated = self.translated(vma, vma.start..vma.end);
            if let Err(e) = translated.and_then(|addresses| self.unmap_translated(vma, &addresses)) {
                log::warn!("could not remove translations of {vma:?}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{arena, read_user, space, write_user};
    use mmu::arch::X86_64;
    use proptest::prelude::*;
    use std::vec;
    use std::vec::Vec;

    fn anon(space: &VmSpace<X86_64>) -> Arc<MemObject> {
        Arc::new(MemObject::new_anonymous(space.pagemap().phys().clone()))
    }

    fn layout(space: &VmSpace<X86_64>) -> Vec<(VAddr, VAddr, u64, Prot)> {
        space
            .mappings()
            .into_iter()
            .map(|info| (info.start, info.end, info.offset, info.prot))
            .collect()
    }

    #[test]
    fn test_map_replaces_tail() {
        let arena = arena(64);
        let space = space(&arena);
        let first = anon(&space);
        let second = anon(&space);

        space
            .map(0x1000, 0x3000, Prot::READ | Prot::WRITE, MapKind::Private, first.clone(), 0)
            .unwrap();
        write_user(&space, 0x2000, b"old").unwrap();

        space
            .map(0x2000, 0x2000, Prot::READ | Prot::WRITE, MapKind::Private, second.clone(), 0)
            .unwrap();
        assert_eq!(
            layout(&space),
            vec![
                (0x1000, 0x2000, 0, Prot::READ | Prot::WRITE),
                (0x2000, 0x4000, 0, Prot::READ | Prot::WRITE),
            ]
        );
        assert!(Arc::ptr_eq(&space.mapping_at(0x1000).unwrap().object, &first));
        assert!(Arc::ptr_eq(&space.mapping_at(0x3fff).unwrap().object, &second));
        assert_eq!(space.pagemap().query(0x2000), None);

        write_user(&space, 0x2000, b"new").unwrap();
        assert_eq!(
            space.pagemap().translate(0x2000, PageSize::Small),
            Ok(second.lookup(0).unwrap())
        );
    }

    #[test]
    fn test_map_into_middle_splits() {
        let arena = arena(64);
        let space = space(&arena);
        let first = anon(&space);
        let second = anon(&space);

        space
            .map(0x1000, 0x4000, Prot::READ, MapKind::Shared, first.clone(), 0)
            .unwrap();
        space
            .map(0x2000, 0x1000, Prot::READ | Prot::WRITE, MapKind::Shared, second, 0x5000)
            .unwrap();

        assert_eq!(
            layout(&space),
            vec![
                (0x1000, 0x2000, 0, Prot::READ),
                (0x2000, 0x3000, 0x5000, Prot::READ | Prot::WRITE),
                (0x3000, 0x5000, 0x2000, Prot::READ),
            ]
        );
        // the remaining pieces are still a single mapping of the object
        assert_eq!(first.mapping_count(), 1);
    }

    #[test]
    fn test_invalid_ranges_are_rejected() {
        let arena = arena(64);
        let space = space(&arena);
        let obj = anon(&space);

        assert_eq!(
            space.map(0x1001, 0x1000, Prot::READ, MapKind::Private, obj.clone(), 0),
            Err(VmError::AddrNotAligned)
        );
        assert_eq!(
            space.map(0x1000, 0x1000, Prot::READ, MapKind::Private, obj.clone(), 0x10),
            Err(VmError::AddrNotAligned)
        );
        assert_eq!(
            space.map(0x1000, 0, Prot::READ, MapKind::Private, obj.clone(), 0),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(
            space.map(0, 0x1000, Prot::READ, MapKind::Private, obj.clone(), 0),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(
            space.map(LOWER_HALF_END - 0x1000, 0x2000, Prot::READ, MapKind::Private, obj, 0),
            Err(VmError::InvalidArgument)
        );
        assert!(space.mappings().is_empty());
    }

    #[test]
    fn test_unmap_splits_and_releases() {
        let arena = arena(64);
        let space = space(&arena);
        let tables = arena.allocated_frames();
        let obj = anon(&space);
        space
            .map(0x1000, 0x3000, Prot::READ | Prot::WRITE, MapKind::Private, obj.clone(), 0)
            .unwrap();
        write_user(&space, 0x1000, &[1; 0x3000]).unwrap();

        space.unmap(0x2000, 0x1000).unwrap();
        assert_eq!(
            layout(&space),
            vec![
                (0x1000, 0x2000, 0, Prot::READ | Prot::WRITE),
                (0x3000, 0x4000, 0x2000, Prot::READ | Prot::WRITE),
            ]
        );
        assert_eq!(space.pagemap().query(0x2000), None);
        assert!(space.pagemap().query(0x3000).is_some());
        assert!(!space.is_mapped(0x1000, 0x3000));

        space.unmap(0x1000, 0x3000).unwrap();
        assert!(space.mappings().is_empty());
        assert_eq!(obj.mapping_count(), 0);
        drop(obj);
        // only the page tables created for the faults remain
        assert_eq!(arena.allocated_frames(), tables + 3);

        // nothing left to unmap is fine
        space.unmap(0x1000, 0x3000).unwrap();
    }

    #[test]
    fn test_protect_middle_third() {
        let arena = arena(64);
        let space = space(&arena);
        let obj = anon(&space);
        space
            .map(0x1000, 0x3000, Prot::READ | Prot::WRITE, MapKind::Private, obj.clone(), 0)
            .unwrap();
        write_user(&space, 0x2000, b"resident").unwrap();

        space.protect(0x2000, 0x1000, Prot::READ).unwrap();
        assert_eq!(
            layout(&space),
            vec![
                (0x1000, 0x2000, 0, Prot::READ | Prot::WRITE),
                (0x2000, 0x3000, 0x1000, Prot::READ),
                (0x3000, 0x4000, 0x2000, Prot::READ | Prot::WRITE),
            ]
        );
        assert!(space
            .mappings()
            .iter()
            .all(|info| Arc::ptr_eq(&info.object, &obj)));

        let translation = space.pagemap().query(0x2000).unwrap();
        assert_eq!(translation.flags, MapFlags::READ | MapFlags::USER);
        assert_eq!(write_user(&space, 0x2000, b"x"), Err(VmError::AccessViolation));
        let mut buf = [0u8; 8];
        read_user(&space, 0x2000, &mut buf).unwrap();
        assert_eq!(&buf, b"resident");
    }

    #[test]
    fn test_protect_requires_complete_coverage() {
        let arena = arena(64);
        let space = space(&arena);
        let obj = anon(&space);
        space
            .map(0x1000, 0x1000, Prot::READ, MapKind::Private, obj.clone(), 0)
            .unwrap();
        space
            .map(0x3000, 0x1000, Prot::READ, MapKind::Private, obj, 0)
            .unwrap();

        assert_eq!(
            space.protect(0x1000, 0x3000, Prot::empty()),
            Err(VmError::NotMapped)
        );
        assert!(space.mappings().iter().all(|info| info.prot == Prot::READ));
    }

    #[test]
    fn test_is_mapped_requires_contiguity() {
        let arena = arena(64);
        let space = space(&arena);
        space
            .map(0x1000, 0x2000, Prot::READ, MapKind::Private, anon(&space), 0)
            .unwrap();
        space
            .map(0x3000, 0x1000, Prot::READ, MapKind::Shared, anon(&space), 0)
            .unwrap();
        space
            .map(0x5000, 0x1000, Prot::READ, MapKind::Private, anon(&space), 0)
            .unwrap();

        assert!(space.is_mapped(0x1000, 0x3000));
        assert!(space.is_mapped(0x2000, 0x1800));
        assert!(!space.is_mapped(0x1000, 0x5000));
        assert!(!space.is_mapped(0x4000, 0x1000));
        assert!(!space.is_mapped(0x1000, 0));
    }

    #[test]
    fn test_find_free_bumps_cursor() {
        let arena = arena(64);
        let space = space(&arena);
        let base = space.config().mmap_base;

        assert_eq!(space.find_free(0x1800), Ok(base));
        space
            .map(base + 0x3000, 0x1000, Prot::READ, MapKind::Private, anon(&space), 0)
            .unwrap();
        // the next range would overlap the mapping at base + 0x3000
        assert_eq!(space.find_free(0x2000), Ok(base + 0x4000));
        assert_eq!(
            space.map_anywhere(0x1000, Prot::READ, MapKind::Private, anon(&space), 0),
            Ok(base + 0x6000)
        );
        assert_eq!(space.find_free(LOWER_HALF_END), Err(VmError::NoSpace));
    }

    #[test]
    fn test_rejected_offset_keeps_cursor() {
        let arena = arena(32);
        let space = space(&arena);
        let base = space.config().mmap_base;
        let offset = u64::MAX / PAGE * PAGE;

        assert_eq!(
            space.map_anywhere(0x2000, Prot::READ, MapKind::Private, anon(&space), offset),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(
            space.map(0x1000, 0x2000, Prot::READ, MapKind::Private, anon(&space), offset),
            Err(VmError::InvalidArgument)
        );
        assert!(space.mappings().is_empty());
        assert_eq!(space.find_free(0x1000), Ok(base));
    }

    #[test]
    fn test_failed_unmap_and_protect_change_nothing() {
        let arena = arena(64);
        let space = space(&arena);
        let odd = anon(&space);
        odd.write(0, b"odd");
        space
            .map(0x20_0000, 0x2000, Prot::READ | Prot::WRITE, MapKind::Private, odd, 0)
            .unwrap();
        // a translation no mapping would install
        space
            .pagemap()
            .map(
                0x20_0000,
                0x8000_0000,
                0x20_0000,
                MapFlags::RW | MapFlags::USER,
                PageSize::Medium,
                CachingMode::Normal,
            )
            .unwrap();
        space
            .map(0x40_0000, 0x1000, Prot::READ | Prot::WRITE, MapKind::Private, anon(&space), 0)
            .unwrap();
        write_user(&space, 0x40_0000, b"good").unwrap();
        let before = layout(&space);
        let good = space.pagemap().query(0x40_0000);

        assert_eq!(
            space.unmap(0x20_0000, 0x20_1000),
            Err(VmError::Mmu(MmuError::InvalidEntry))
        );
        assert_eq!(layout(&space), before);
        assert_eq!(space.pagemap().query(0x40_0000), good);

        assert_eq!(
            space.protect(0x20_1000, 0x1000, Prot::READ),
            Ok(())
        );
        assert_eq!(
            space.protect(0x20_0000, 0x1000, Prot::READ),
            Err(VmError::Mmu(MmuError::InvalidEntry))
        );
        assert_eq!(space.mapping_at(0x20_0000).map(|info| info.prot), Some(Prot::READ | Prot::WRITE));
        assert_eq!(space.mappings().len(), 3);
    }

    #[test]
    fn test_fork_shares_shared_mappings() {
        let arena = arena(64);
        let parent = space(&arena);
        let obj = anon(&parent);
        parent
            .map(0x1000, 0x2000, Prot::READ | Prot::WRITE, MapKind::Shared, obj.clone(), 0)
            .unwrap();
        write_user(&parent, 0x1000, b"before").unwrap();

        let child = parent.fork(crate::test_utils::pagemap(&arena)).unwrap();
        assert_eq!(obj.mapping_count(), 2);
        assert_eq!(
            child.pagemap().query(0x1000),
            parent.pagemap().query(0x1000)
        );

        write_user(&child, 0x1000, b"after").unwrap();
        write_user(&child, 0x2000, b"second").unwrap();
        let mut buf = [0u8; 6];
        read_user(&parent, 0x1000, &mut buf[..5]).unwrap();
        assert_eq!(&buf[..5], b"after");
        read_user(&parent, 0x2000, &mut buf).unwrap();
        assert_eq!(&buf, b"second");
    }

    #[test]
    fn test_fork_copies_private_mappings() {
        let arena = arena(64);
        let parent = space(&arena);
        let obj = anon(&parent);
        parent
            .map(0x1000, 0x2000, Prot::READ | Prot::WRITE, MapKind::Private, obj.clone(), 0)
            .unwrap();
        write_user(&parent, 0x1000, b"parent").unwrap();

        let child = parent.fork(crate::test_utils::pagemap(&arena)).unwrap();
        let child_obj = child.mapping_at(0x1000).unwrap().object;
        assert!(!Arc::ptr_eq(&child_obj, &obj));
        assert_eq!(child_obj.resident_pages(), 1);
        assert_eq!(child.pagemap().query(0x1000), None);

        write_user(&child, 0x1000, b"child!").unwrap();
        let mut buf = [0u8; 6];
        read_user(&parent, 0x1000, &mut buf).unwrap();
        assert_eq!(&buf, b"parent");
        read_user(&child, 0x1000, &mut buf).unwrap();
        assert_eq!(&buf, b"child!");
    }

    #[test]
    fn test_drop_releases_everything() {
        let arena = arena(64);
        {
            let space = space(&arena);
            space
                .map(0x1000, 0x2000, Prot::READ | Prot::WRITE, MapKind::Private, anon(&space), 0)
                .unwrap();
            write_user(&space, 0x1000, &[5; 0x2000]).unwrap();
        }
        assert_eq!(arena.allocated_frames(), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Map { page: u64, count: u64, object: usize, offset: u64, write: bool },
        Unmap { page: u64, count: u64 },
        Protect { page: u64, count: u64, write: bool },
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u64..48, 1u64..16, 0usize..3, 0u64..8, any::<bool>()).prop_map(
                |(page, count, object, offset, write)| Op::Map { page, count, object, offset, write }
            ),
            (1u64..48, 1u64..16).prop_map(|(page, count)| Op::Unmap { page, count }),
            (1u64..48, 1u64..16, any::<bool>())
                .prop_map(|(page, count, write)| Op::Protect { page, count, write }),
        ]
    }

    fn prot(write: bool) -> Prot {
        if write {
            Prot::READ | Prot::WRITE
        } else {
            Prot::READ
        }
    }

    proptest! {
        #[test]
        fn prop_mappings_never_overlap(ops in proptest::collection::vec(op(), 1..24)) {
            let arena = arena(64);
            let space = space(&arena);
            let objects: Vec<Arc<MemObject>> = (0..3).map(|_| anon(&space)).collect();
            // page number -> (object, object page index, protection)
            let mut model: Vec<Option<(usize, u64, Prot)>> = vec![None; 64];

            for op in ops {
                match op {
                    Op::Map { page, count, object, offset, write } => {
                        space.map(page * PAGE, count * PAGE, prot(write), MapKind::Private, objects[object].clone(), offset * PAGE).unwrap();
                        for i in 0..count {
                            model[(page + i) as usize] = Some((object, offset + i, prot(write)));
                        }
                    }
                    Op::Unmap { page, count } => {
                        space.unmap(page * PAGE, count * PAGE).unwrap();
                        for i in 0..count {
                            model[(page + i) as usize] = None;
                        }
                    }
                    Op::Protect { page, count, write } => {
                        let covered = (page..page + count).all(|p| model[p as usize].is_some());
                        let result = space.protect(page * PAGE, count * PAGE, prot(write));
                        prop_assert_eq!(result.is_ok(), covered);
                        if covered {
                            for i in 0..count {
                                if let Some(entry) = model[(page + i) as usize].as_mut() {
                                    entry.2 = prot(write);
                                }
                            }
                        }
                    }
                }
            }

            let mappings = space.mappings();
            for pair in mappings.windows(2) {
                prop_assert!(pair[0].end <= pair[1].start);
            }
            for (page, expected) in model.iter().enumerate() {
                let actual = space.mapping_at(page as u64 * PAGE).map(|info| {
                    let object = objects.iter().position(|o| Arc::ptr_eq(o, &info.object)).unwrap();
                    let index = (info.offset + page as u64 * PAGE - info.start) / PAGE;
                    (object, index, info.prot)
                });
                prop_assert_eq!(actual, *expected);
            }
        }
    }
}
