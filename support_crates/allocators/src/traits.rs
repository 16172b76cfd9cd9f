use crate::{PAddr, PAGESIZE};
use thiserror_no_std::Error;

/// The error returned when an allocation fails
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum AllocError {
    #[error("the allocator has insufficient free memory to allocate the requested amount")]
    InsufficientMemory,
}

/// A desired initial state for allocated memory
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
pub enum AllocInit {
    /// The memory is returned as-is from the allocator.
    /// It may potentially contain old data.
    Uninitialized,

    /// Memory is filled with zeros before being returned to the caller.
    #[default]
    Zeroed,

    /// Memory is filled with a repetition of the given byte before being returned to the caller.
    Data(u8),
}

/// An implementation of `FrameAllocator` hands out physical frames of [`PAGESIZE`] bytes.
pub trait FrameAllocator {
    /// Attempt to allocate `count` physically contiguous frames.
    ///
    /// On success, return the physical address of the first frame.
    /// The content of the frames is initialized according to `init`.
    ///
    /// # Panics
    /// Implementations may panic when `count` is zero.
    fn alloc(&self, count: usize, init: AllocInit) -> Result<PAddr, AllocError>;

    /// Return `count` frames starting at `addr` to the allocator.
    ///
    /// # Panics
    /// Freeing frames that are not currently allocated is an unrecoverable kernel fault and panics.
    fn free(&self, addr: PAddr, count: usize);
}

/// Access to the content of physical memory.
///
/// The functions here are the only way the memory management layers read or write frames, so that no live pointers into
/// physical memory escape into page tables or memory objects.
///
/// # Panics
/// All functions panic if the accessed range is not backed by memory the implementation can reach.
pub trait PhysAccess {
    /// Copy `buf.len()` bytes starting at `addr` into `buf`.
    fn read_bytes(&self, addr: PAddr, buf: &mut [u8]);

    /// Copy `data` into physical memory starting at `addr`.
    fn write_bytes(&self, addr: PAddr, data: &[u8]);

    /// Set `len` bytes starting at `addr` to `byte`.
    fn fill(&self, addr: PAddr, len: usize, byte: u8);

    /// Read the naturally aligned 64-bit word at `addr`.
    fn read_u64(&self, addr: PAddr) -> u64 {
        let mut buf = [0u8; 8];
        self.read_bytes(addr, &mut buf);
        u64::from_ne_bytes(buf)
    }

    /// Write the naturally aligned 64-bit word at `addr`.
    fn write_u64(&self, addr: PAddr, value: u64) {
        self.write_bytes(addr, &value.to_ne_bytes());
    }

    /// Copy the whole frame at `src` into the frame at `dst`.
    fn copy_frame(&self, src: PAddr, dst: PAddr) {
        let mut buf = [0u8; PAGESIZE];
        self.read_bytes(src, &mut buf);
        self.write_bytes(dst, &buf);
    }
}

/// Everything the memory management layers need from physical memory.
pub trait PhysMemory: FrameAllocator + PhysAccess + Send + Sync {}

impl<T: FrameAllocator + PhysAccess + Send + Sync> PhysMemory for T {}
