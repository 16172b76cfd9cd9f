use allocators::AllocError;
use thiserror_no_std::Error;

/// The error returned by page table operations
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum MmuError {
    #[error("address is not aligned to the requested page size")]
    AddrNotAligned,
    #[error("no translation exists along the page table path")]
    NotFound,
    #[error("the page table entry along the path has an unexpected type")]
    InvalidEntry,
    #[error("the address range is not covered by this page table")]
    OutOfRange,
    #[error("could not allocate a frame for a page table")]
    OutOfMemory(#[from] AllocError),
}
