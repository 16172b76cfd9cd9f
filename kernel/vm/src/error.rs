use allocators::AllocError;
use mmu::MmuError;
use thiserror_no_std::Error;

/// The error returned by address space operations
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum VmError {
    #[error("address or offset is not aligned to the page size")]
    AddrNotAligned,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("the address is not covered by any mapping")]
    NotMapped,
    #[error("no free virtual address range of the requested size is left")]
    NoSpace,
    #[error("the access is not permitted by the protection of the mapping")]
    AccessViolation,
    #[error("the faulting page was already translated to the resolved frame")]
    StaleFault,
    #[error("the backing file could not be read or written")]
    Io,
    #[error("could not allocate a physical frame")]
    OutOfMemory,
    #[error("page table operation failed: {0}")]
    Mmu(#[from] MmuError),
}

impl From<AllocError> for VmError {
    fn from(_: AllocError) -> Self {
        VmError::OutOfMemory
    }
}

/// POSIX error numbers returned by the system call layer
pub mod errno {
    pub const EIO: i32 = 5;
    pub const ENOMEM: i32 = 12;
    pub const EACCES: i32 = 13;
    pub const EFAULT: i32 = 14;
    pub const EINVAL: i32 = 22;
}

impl VmError {
    /// The POSIX error number that is reported to user space for this error
    pub fn errno(&self) -> i32 {
        match self {
            VmError::AddrNotAligned | VmError::InvalidArgument => errno::EINVAL,
            VmError::NotMapped | VmError::NoSpace | VmError::OutOfMemory => errno::ENOMEM,
            VmError::AccessViolation => errno::EACCES,
            VmError::StaleFault => errno::EFAULT,
            VmError::Io => errno::EIO,
            VmError::Mmu(e) => match e {
                MmuError::AddrNotAligned => errno::EINVAL,
                MmuError::OutOfRange | MmuError::OutOfMemory(_) => errno::ENOMEM,
                MmuError::NotFound | MmuError::InvalidEntry => errno::EFAULT,
            },
        }
    }
}
