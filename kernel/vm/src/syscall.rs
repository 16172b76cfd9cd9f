//! The `mmap`, `munmap` and `mprotect` system calls.
//!
//! Argument marshaling is done by the syscall dispatcher which also resolves file descriptors to a [`MmapSource`].
//! Errors are reported to user space through [`VmError::errno`].

use crate::vmspace::PAGE;
use crate::{FileBacking, MapKind, MemObject, Prot, VmError, VmSpace};
use alloc::sync::Arc;
use bitflags::bitflags;
use core::fmt::{Debug, Formatter};
use mmu::{is_aligned, Mmu, VAddr};

bitflags! {
    #[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
    pub struct MmapFlags: u32 {
        /// Modifications are visible to all mappings of the same object and are written back to files.
        const SHARED = 0x01;
        /// Modifications are private to this mapping.
        const PRIVATE = 0x02;
        /// Map at exactly the given address, replacing existing mappings.
        const FIXED = 0x10;
        /// The mapping is not backed by a file.
        const ANONYMOUS = 0x20;
    }
}

/// What a new mapping is backed by
#[derive(Clone)]
pub enum MmapSource {
    /// Fresh zero-filled memory; requires [`MmapFlags::ANONYMOUS`]
    Anonymous,
    /// An existing memory object, e.g. one handed out by a driver
    Object(Arc<MemObject>),
    /// An open file
    File(Arc<dyn FileBacking>),
}

impl Debug for MmapSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            MmapSource::Anonymous => f.write_str("Anonymous"),
            MmapSource::Object(object) => f.debug_tuple("Object").field(object).finish(),
            MmapSource::File(_) => f.write_str("File"),
        }
    }
}

/// Map `length` bytes of `source` starting at byte `offset` into `space` and return the address of the mapping.
///
/// With [`MmapFlags::FIXED`] the mapping is placed at `hint` and replaces whatever was mapped there before.
/// Otherwise `hint` is ignored and the address is chosen by the address space.
pub fn mmap<A: Mmu>(
    space: &VmSpace<A>,
    hint: VAddr,
    length: u64,
    prot: Prot,
    flags: MmapFlags,
    source: MmapSource,
    offset: u64,
) -> Result<VAddr, VmError> {
    if length == 0 {
        return Err(VmError::InvalidArgument);
    }
    if !is_aligned(offset, PAGE) {
        return Err(VmError::AddrNotAligned);
    }
    let kind = match (flags.contains(MmapFlags::SHARED), flags.contains(MmapFlags::PRIVATE)) {
        (true, false) => MapKind::Shared,
        (false, true) => MapKind::Private,
        _ => return Err(VmError::InvalidArgument),
    };

    let phys = space.pagemap().phys().clone();
    let (object, offset) = match (source, flags.contains(MmapFlags::ANONYMOUS)) {
        (MmapSource::Anonymous, true) => (Arc::new(MemObject::new_anonymous(phys)), 0),
        (MmapSource::Object(object), false) => (object, offset),
        // the file offset is applied by the object so the mapping starts at its first page
        (MmapSource::File(file), false) => (
            Arc::new(MemObject::new_file(phys, file, offset, kind == MapKind::Shared)),
            0,
        ),
        _ => return Err(VmError::InvalidArgument),
    };

    if flags.contains(MmapFlags::FIXED) {
        space.map(hint, length, prot, kind, object, offset)?;
        Ok(hint)
    } else {
        space.map_anywhere(length, prot, kind, object, offset)
    }
}

/// Remove all mappings in `[address, address + length)`.
///
/// Both `address` and `length` must be multiples of the page size.
pub fn munmap<A: Mmu>(space: &VmSpace<A>, address: VAddr, length: u64) -> Result<(), VmError> {
    if !is_aligned(length, PAGE) {
        return Err(VmError::InvalidArgument);
    }
    space.unmap(address, length)
}

/// Change the protection of the pages covering `[address, address + length)` to `prot`.
pub fn mprotect<A: Mmu>(space: &VmSpace<A>, address: VAddr, length: u64, prot: Prot) -> Result<(), VmError> {
    space.protect(address, length, prot)
}
