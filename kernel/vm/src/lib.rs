//! Address spaces on top of [`mmu`] page tables
//!
//! # Overview
//!
//! ```text
//!   trap ──► fault::page_fault ──► VmSpace::handle_fault ─┐
//!                                                          ├──► mapping tree ──► MemObject::get_page ──► Pagemap::map
//!   mmap / munmap / mprotect ──► VmSpace::{map,unmap,..} ──┘
//! ```
//!
//! - A [`MemObject`] is a sparse, page indexed store of physical frames. Frames are produced on first access by its
//!   [`Backing`] and released when the last reference to the object goes away.
//! - A [`VmSpace`] is the set of non-overlapping mappings of one process together with the [`Pagemap`](mmu::Pagemap)
//!   that makes them visible to the hardware. Translations are installed lazily by the page fault handler.
//! - Private mappings of an object that is referenced by more than one mapping are copied on the first write.
//!
//! # Locking
//!
//! Locks are always taken in the order mapping tree, pagemap, memory object, frame allocator.
#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

mod error;
pub mod fault;
pub mod layout;
mod object;
pub mod syscall;
mod vmspace;

#[cfg(test)]
mod test_utils;

pub use error::{errno, VmError};
pub use object::{Backing, FileBacking, MemObject};
pub use vmspace::{MapKind, Prot, VmConfig, VmSpace, VmaInfo};
