//! Physical memory collaborators of the virtual memory core.
//!
//! The page-table and address-space layers never own raw pointers into physical memory.
//! Instead they allocate frames through a [`FrameAllocator`] and touch frame contents through the accessor
//! functions of [`PhysAccess`].
//! Both are bundled into [`PhysMemory`] which is what higher layers hold on to.
//!
//! [`FrameArena`] is a frame pool over one contiguous slice of RAM that implements both traits.
//! A kernel builds it from the direct-mapped usable memory region during boot while tests build it from heap memory.
#![no_std]

#[cfg(test)]
extern crate std;

mod frame_arena;
mod traits;

use core::ops::{Deref, DerefMut};

pub use frame_arena::FrameArena;
pub use traits::{AllocError, AllocInit, FrameAllocator, PhysAccess, PhysMemory};

/// Type alias for physical addresses.
///
/// This is used by functions that explicitly interpret addresses as physical ones.
pub type PAddr = u64;

/// How large a single physical frame is.
///
/// This is also the smallest page size every supported MMU can map.
pub const PAGESIZE: usize = 4096;

/// Type definition for a slice of bytes that is exactly one page large and aligned to it as well
#[derive(Copy, Clone, Eq, PartialEq)]
#[repr(C, align(4096))]
pub struct MemoryPage([u8; PAGESIZE]);

impl Deref for MemoryPage {
    type Target = [u8; PAGESIZE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for MemoryPage {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Default for MemoryPage {
    fn default() -> Self {
        Self([0u8; PAGESIZE])
    }
}

/// Round `addr` down to the start of the frame containing it.
#[inline]
pub const fn frame_align_down(addr: PAddr) -> PAddr {
    addr & !(PAGESIZE as u64 - 1)
}

/// Whether `addr` is the start of a frame.
#[inline]
pub const fn is_frame_aligned(addr: PAddr) -> bool {
    addr & (PAGESIZE as u64 - 1) == 0
}
