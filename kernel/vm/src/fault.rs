//! Page fault resolution
//!
//! The trap layer calls [`page_fault`] with the faulting address and access kind.
//! The fault is resolved by installing a translation for the faulting page into the pagemap of the current address
//! space:
//!
//! 1. The mapping containing the faulting page is looked up while the mapping tree is write locked.
//! 2. A write to a private mapping of an object that is mapped more than once replaces the mapping with a private copy
//!    of the object (copy on write).
//! 3. The frame backing the faulting page is obtained from the object, producing it on first access.
//! 4. The frame is mapped at the faulting page.
use crate::vmspace::{MappingTree, PAGE};
use crate::{MapKind, MemObject, Prot, VmError, VmSpace};
use alloc::sync::Arc;
use mmu::{CachingMode, Mmu, PageSize, VAddr};

/// Access to scheduler state that the fault handler needs
pub trait FaultContext<A: Mmu> {
    /// The address space of the process the faulting thread belongs to
    fn current_space(&self) -> Option<Arc<VmSpace<A>>>;
}

/// The outcome of a page fault as reported to the trap layer
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultResolution {
    /// A translation was installed and the faulting instruction can be resumed
    Resolved,
    /// The fault cannot be resolved and the faulting thread must be terminated
    Fatal(VmError),
}

/// Entry point for the trap layer.
///
/// Faults of the same address space are serialized.
/// When two threads fault on the same page at once, the second one finds the translation installed by the first and
/// gets [`VmError::StaleFault`], which terminates it like any other unresolvable fault.
/// A trap layer that wants to tolerate this race may resume the thread once and only treat a repeated stale fault at
/// the same address as fatal.
pub fn page_fault<A: Mmu>(ctx: &impl FaultContext<A>, address: VAddr, is_write: bool) -> FaultResolution {
    let access = if is_write { "write" } else { "read" };
    let Some(space) = ctx.current_space() else {
        log::error!("{access} page fault at {address:#x} without an address space");
        return FaultResolution::Fatal(VmError::NotMapped);
    };

    match space.handle_fault(address, is_write) {
        Ok(()) => FaultResolution::Resolved,
        Err(VmError::StaleFault) => {
            log::error!("{access} page fault at {address:#x} hit a page that is already resolved");
            FaultResolution::Fatal(VmError::StaleFault)
        }
        Err(e) => {
            log::warn!("unresolvable {access} page fault at {address:#x}: {e}");
            FaultResolution::Fatal(e)
        }
    }
}

impl<A: Mmu> VmSpace<A> {
    /// Resolve a fault on `address` by installing a translation for the page containing it.
    ///
    /// Reads are permitted on mappings that are readable or executable, writes only on writable mappings.
    /// If the page already translates to the frame that would be installed, the fault is reported as
    /// [`VmError::StaleFault`] and the translation is left untouched.
    ///
    /// A writable translation of a private mapping is registered with its object so that it loses write access as soon
    /// as the object is mapped a second time.
    pub fn handle_fault(&self, address: VAddr, write: bool) -> Result<(), VmError> {
        let page = address / PAGE;
        let vaddr = page * PAGE;
        let mut tree = self.tree.write();

        let vma = tree.find(page).ok_or(VmError::NotMapped)?;
        let permitted = if write {
            vma.prot.contains(Prot::WRITE)
        } else {
            vma.prot.intersects(Prot::READ | Prot::EXEC)
        };
        if !permitted {
            return Err(VmError::AccessViolation);
        }

        if write && vma.kind == MapKind::Private && vma.object().mapping_count() > 1 {
            self.copy_on_write(&mut tree, page)?;
        }

        let vma = tree.find(page).ok_or(VmError::NotMapped)?;
        let frame = vma.object().get_page(vma.object_index(page))?;
        let flags = vma.hw_flags();

        if let Some(existing) = self.pagemap.query(vaddr) {
            if existing.paddr == frame && existing.flags == flags {
                return Err(VmError::StaleFault);
            }
        }

        log::trace!("resolving fault at {address:#x} with frame {frame:#x} ({flags:?})");
        self.pagemap
            .map(vaddr, frame, PAGE, flags, PageSize::Small, CachingMode::Normal)?;
        self.track_translation(vma, page, flags);
        Ok(())
    }

    /// Replace the mapping containing `page` with a mapping of a private copy of its object
    fn copy_on_write(&self, tree: &mut MappingTree, page: u64) -> Result<(), VmError> {
        let vma = tree.find(page).ok_or(VmError::NotMapped)?;
        let (start, end, offset, prot) = (vma.start, vma.end, vma.offset, vma.prot);
        let source = vma.object().clone();
        let copy = Arc::new(MemObject::new_anonymous(self.pagemap.phys().clone()));

        if source.is_anonymous() {
            // pages that were never touched read as zero in the copy as well
            let range = vma.object_index(start)..vma.object_index(end);
            for (index, _) in source.resident(range) {
                source.copy_to(&copy, index as u64 * PAGE, PAGE)?;
            }
        } else {
            source.copy_to(&copy, offset * PAGE, (end - start) * PAGE)?;
        }

        log::debug!(
            "copying {:#x}..{:#x} on write, {} pages now private",
            start * PAGE,
            end * PAGE,
            copy.resident_pages()
        );
        self.map_locked(tree, start..end, prot, MapKind::Private, copy, offset)
    }
}
