//! Vnode - byte-addressed backing store
//!
//! Transfers are whole-buffer: a read or write either moves every byte or
//! reports an error. A transfer running past the end of the object is
//! refused before any byte moves.

use alloc::sync::Arc;

/// Backing store I/O error
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IoError {
    /// Device reported a failure
    #[error("device error at offset {offset:#x}")]
    Device { offset: u64 },
    /// Transfer extends past the end of the device
    #[error("offset {offset:#x} is past the end of the device")]
    OutOfRange { offset: u64 },
    /// The named object could not be opened
    #[error("no such device")]
    NoSuchDevice,
}

/// A file or raw device the kernel can transfer bytes to and from
pub trait Vnode: Send + Sync {
    /// Read `buf.len()` bytes starting at `offset`
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), IoError>;

    /// Write all of `buf` starting at `offset`
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), IoError>;

    /// Size of the object in bytes
    fn size(&self) -> u64;
}

/// Opens the named swap object on first use
pub trait SwapOpener: Send + Sync {
    fn open(&self, name: &str) -> Result<Arc<dyn Vnode>, IoError>;
}

impl<F> SwapOpener for F
where
    F: Fn(&str) -> Result<Arc<dyn Vnode>, IoError> + Send + Sync,
{
    fn open(&self, name: &str) -> Result<Arc<dyn Vnode>, IoError> {
        self(name)
    }
}
