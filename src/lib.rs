//! demand_vm - Demand-paged virtual memory for a teaching kernel
//!
//! This crate provides the virtual memory core of a small multiprocessor
//! kernel: a coremap frame allocator, per-address-space page tables, a
//! fault handler that resolves faults against address-space regions, a
//! random/clean-first eviction engine backed by a swap device, and the
//! TLB shootdown protocol that keeps every simulated CPU coherent while a
//! frame is being reclaimed.
//!
//! The machine underneath (RAM, per-CPU TLBs, the swap disk) is simulated so
//! that the same code runs inside the kernel image and on a development host.

#![cfg_attr(not(feature = "std"), no_std)]
// Kernel-appropriate clippy configuration
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Manual ceiling division is clearer in memory allocation contexts
#![allow(clippy::manual_div_ceil)]

// Standard library replacement for no_std
extern crate alloc;

pub mod config;
pub mod device;
pub mod error;
pub mod kern;
pub mod logging;
pub mod vm;

pub use config::VmConfig;
pub use error::{FaultClass, VmError, VmResult};
pub use vm::{FaultType, VmSystem};

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
