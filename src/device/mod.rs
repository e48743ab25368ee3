//! Device Subsystem
//!
//! The VM consumes exactly one device interface: a vnode that can read and
//! write byte ranges at an offset. The swap object is opened through a
//! `SwapOpener` the first time a page is written out.
//!
//! - vnode: the `Vnode` trait, I/O errors and the opener hook
//! - ramdisk: an in-memory raw disk used as the default swap device

pub mod ramdisk;
pub mod vnode;

pub use ramdisk::RamDisk;
pub use vnode::{IoError, SwapOpener, Vnode};
