//! RAM disk
//!
//! Fixed-size in-memory raw disk. Used as the swap device on hosts and in
//! tests; supports injected read/write failures so the error paths of the
//! pager can be exercised.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;

use super::vnode::{IoError, SwapOpener, Vnode};

/// In-memory raw disk
#[derive(Debug)]
pub struct RamDisk {
    /// Name the disk answers to when opened
    name: &'static str,
    /// Disk contents
    data: Mutex<Vec<u8>>,
    /// Fail every write while set
    fail_writes: AtomicBool,
    /// Fail every read while set
    fail_reads: AtomicBool,
    /// Completed reads
    reads: AtomicU64,
    /// Completed writes
    writes: AtomicU64,
}

impl RamDisk {
    /// Create a zero-filled disk of `size` bytes
    pub fn new(name: &'static str, size: u64) -> Arc<Self> {
        Arc::new(Self {
            name,
            data: Mutex::new(vec![0u8; size as usize]),
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        })
    }

    /// Opener that hands out this disk when asked for its name
    pub fn opener(self: &Arc<Self>) -> impl SwapOpener + 'static {
        let disk = Arc::clone(self);
        move |name: &str| -> Result<Arc<dyn Vnode>, IoError> {
            if name == disk.name {
                Ok(Arc::clone(&disk) as Arc<dyn Vnode>)
            } else {
                Err(IoError::NoSuchDevice)
            }
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn check_range(&self, len: usize, offset: u64, size: usize) -> Result<usize, IoError> {
        let start = offset as usize;
        match start.checked_add(len) {
            Some(end) if end <= size => Ok(start),
            _ => Err(IoError::OutOfRange { offset }),
        }
    }
}

impl Vnode for RamDisk {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), IoError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(IoError::Device { offset });
        }
        let data = self.data.lock();
        let start = self.check_range(buf.len(), offset, data.len())?;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), IoError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(IoError::Device { offset });
        }
        let mut data = self.data.lock();
        let start = self.check_range(buf.len(), offset, data.len())?;
        data[start..start + buf.len()].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.lock().len() as u64
    }
}
