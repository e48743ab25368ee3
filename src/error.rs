//! VM error types
//!
//! Every fallible VM operation returns `VmResult`. Errors fall into the
//! classes the process layer reacts to differently: access faults kill the
//! offending process, resource exhaustion is reported as ENOMEM to the
//! immediate caller, and backing-store failures fail only the process whose
//! page could not be transferred.

use crate::device::IoError;
use crate::kern::elf_loader::ElfError;
use crate::vm::vm_fault::FaultType;
use crate::vm::vm_param::VAddr;

/// Kernel errno: out of memory
pub const ENOMEM: i32 = 3;
/// Kernel errno: bad memory reference
pub const EFAULT: i32 = 6;
/// Kernel errno: invalid argument
pub const EINVAL: i32 = 8;
/// Kernel errno: executable format error
pub const ENOEXEC: i32 = 13;
/// Kernel errno: hardware I/O error
pub const EIO: i32 = 32;

/// Broad class of a VM failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// Invalid address or permission violation; fatal to the process
    Access,
    /// Frames, swap slots or page table memory exhausted
    Resource,
    /// Swap device transfer failed
    Io,
    /// Caller passed something the VM cannot act on
    Invalid,
}

/// VM error
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    #[error("address {0:#x} is not mapped by any region, heap or stack")]
    BadAddress(VAddr),
    #[error("{fault:?} access to {vaddr:#x} not permitted by region")]
    PermissionDenied { vaddr: VAddr, fault: FaultType },
    #[error("no address space is active on this processor")]
    NoAddressSpace,
    #[error("coremap has not been bootstrapped")]
    NotBootstrapped,
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("no free swap slots")]
    SwapExhausted,
    #[error("page table entry limit reached")]
    PageTableFull,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("no such processor: {0}")]
    NoSuchCpu(usize),
    #[error("swap I/O failed: {0}")]
    Io(#[from] IoError),
    #[error("executable rejected: {0}")]
    Elf(#[from] ElfError),
}

impl VmError {
    /// Classify the error
    pub fn class(&self) -> FaultClass {
        match self {
            VmError::BadAddress(_) | VmError::PermissionDenied { .. } | VmError::NoAddressSpace => {
                FaultClass::Access
            }
            VmError::OutOfMemory | VmError::SwapExhausted | VmError::PageTableFull => {
                FaultClass::Resource
            }
            VmError::Io(_) => FaultClass::Io,
            VmError::NotBootstrapped
            | VmError::InvalidArgument
            | VmError::NoSuchCpu(_)
            | VmError::Elf(_) => FaultClass::Invalid,
        }
    }

    /// Errno returned to user space
    pub fn errno(&self) -> i32 {
        match self {
            VmError::Elf(_) => ENOEXEC,
            _ => match self.class() {
                FaultClass::Access => EFAULT,
                FaultClass::Resource => ENOMEM,
                FaultClass::Io => EIO,
                FaultClass::Invalid => EINVAL,
            },
        }
    }
}

/// VM result
pub type VmResult<T> = Result<T, VmError>;
