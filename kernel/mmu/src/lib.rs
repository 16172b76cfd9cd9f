//! Architecture neutral page table management
//!
//! # Virtual Addressing Basics
//!
//! Both supported MMU families (x86_64 4-level paging and RiscV Sv48) translate a 48-bit virtual address through four
//! levels of page tables, each filling exactly one 4 KiB frame with 512 entries of 64 bits.
//!
//! ```text
//! 47          39 38          30 29          21 20          12 11            0
//! ┌─────────────┬──────────────┬──────────────┬──────────────┬───────────────┐
//! │   index 3   │   index 2    │   index 1    │   index 0    │  page offset  │
//! └─────────────┴──────────────┴──────────────┴──────────────┴───────────────┘
//!     9bits          9bits          9bits          9bits           12bits
//! ```
//!
//! Bits 63–48 must all be equal to bit 47, giving 256 TiB of usable address space split into a lower (user) and an
//! upper (kernel) half.
//!
//! A translation may stop early at level 1 or 2, producing a 2 MiB or 1 GiB page.
//! This crate calls these page sizes [`Small`](PageSize::Small), [`Medium`](PageSize::Medium) and
//! [`Large`](PageSize::Large).
//!
//! # Layering
//!
//! - [`Mmu`] is implemented once per architecture and is the only place where the bit layout of hardware entries is
//!   visible. It translates the generic [`MapFlags`] and [`CachingMode`] into hardware bits and back.
//! - [`PageTableEntry`] is a decoded view of one entry word.
//! - [`Pagemap`] owns a tree of page tables for one address space and exposes mapping operations over virtual ranges.
#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

mod addr;
pub mod arch;
mod caching;
mod entry;
mod error;
mod flags;
mod page_size;
mod pagemap;

pub use addr::*;
pub use allocators::{PAddr, PAGESIZE};
pub use arch::{Mmu, MmuFeatures};
pub use caching::CachingMode;
pub use entry::PageTableEntry;
pub use error::MmuError;
pub use flags::MapFlags;
pub use page_size::PageSize;
pub use pagemap::{Pagemap, Translation};
