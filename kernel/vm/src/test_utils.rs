use crate::vmspace::PAGE;
use crate::{FileBacking, VmConfig, VmError, VmSpace};
use allocators::{FrameArena, MemoryPage, PAddr, PhysAccess};
use core::cmp::min;
use mmu::arch::X86_64;
use mmu::{MapFlags, Mmu, MmuFeatures, Pagemap, VAddr, PAGESIZE};
use spin::Mutex;
use std::sync::Arc;
use std::vec;
use std::vec::Vec;

pub const FEATURES: MmuFeatures = MmuFeatures {
    large_pages: true,
    no_execute: true,
    cache_attributes: true,
};

/// Create a frame arena with `frames` frames, the first of which holds its bitmap
pub fn arena(frames: usize) -> Arc<FrameArena<'static>> {
    Arc::new(FrameArena::new(
        0x8000_0000,
        vec![MemoryPage::default(); frames].leak(),
    ))
}

pub fn pagemap(arena: &Arc<FrameArena<'static>>) -> Pagemap<X86_64> {
    Pagemap::with_features(arena.clone(), FEATURES).unwrap()
}

pub fn space(arena: &Arc<FrameArena<'static>>) -> VmSpace<X86_64> {
    VmSpace::new(pagemap(arena), VmConfig::default())
}

/// A file held in memory
pub struct MemFile {
    data: Mutex<Vec<u8>>,
    broken: bool,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
            broken: false,
        }
    }

    /// A file on which every operation fails
    pub fn broken() -> Self {
        Self {
            data: Mutex::new(Vec::new()),
            broken: true,
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl FileBacking for MemFile {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, VmError> {
        if self.broken {
            return Err(VmError::Io);
        }
        let data = self.data.lock();
        let start = min(offset as usize, data.len());
        let len = min(buf.len(), data.len() - start);
        buf[..len].copy_from_slice(&data[start..start + len]);
        Ok(len)
    }

    fn write(&self, offset: u64, src: &[u8]) -> Result<usize, VmError> {
        if self.broken {
            return Err(VmError::Io);
        }
        let mut data = self.data.lock();
        let end = offset as usize + src.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(src);
        Ok(src.len())
    }
}

/// Resolve `address` the way the hardware would, raising a page fault if the access is not permitted
fn resolve<A: Mmu>(space: &VmSpace<A>, address: VAddr, write: bool) -> Result<PAddr, VmError> {
    let required = if write { MapFlags::WRITE } else { MapFlags::READ };
    let lookup = || {
        space
            .pagemap()
            .query(address)
            .filter(|translation| translation.flags.contains(required))
            .map(|translation| translation.paddr)
    };
    if let Some(paddr) = lookup() {
        return Ok(paddr);
    }
    space.handle_fault(address, write)?;
    lookup().ok_or(VmError::AccessViolation)
}

/// Write `data` to user memory of `space` starting at `address`
pub fn write_user<A: Mmu>(space: &VmSpace<A>, address: VAddr, data: &[u8]) -> Result<(), VmError> {
    let mut done = 0;
    while done < data.len() {
        let current = address + done as u64;
        let chunk = min((PAGE - current % PAGE) as usize, data.len() - done);
        let paddr = resolve(space, current, true)?;
        space
            .pagemap()
            .phys()
            .write_bytes(paddr, &data[done..done + chunk]);
        done += chunk;
    }
    Ok(())
}

/// Read user memory of `space` starting at `address` into `buf`
pub fn read_user<A: Mmu>(space: &VmSpace<A>, address: VAddr, buf: &mut [u8]) -> Result<(), VmError> {
    let mut done = 0;
    while done < buf.len() {
        let current = address + done as u64;
        let chunk = min(PAGESIZE - (current % PAGE) as usize, buf.len() - done);
        let paddr = resolve(space, current, false)?;
        space
            .pagemap()
            .phys()
            .read_bytes(paddr, &mut buf[done..done + chunk]);
        done += chunk;
    }
    Ok(())
}
