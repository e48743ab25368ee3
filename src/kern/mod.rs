//! Kern subsystem - Core kernel primitives
//!
//! Based on Mach4 kern/ directory
//! Contains the simulated processors and their TLBs, wait channels, user
//! memory access and the program loader.

pub mod copyio;
pub mod elf_loader;
pub mod processor;
pub mod random;
pub mod sched_prim;
pub mod tlb;

pub use copyio::{copyin, copyout, fuword32, suword32};
pub use elf_loader::{load_elf, run_program, ElfError};
pub use processor::{CpuId, Processor, Processors, SplGuard};
pub use sched_prim::{WaitChannel, WaitReason, WaitTicket};
pub use tlb::{Tlb, TlbEntry};
