//! Swap Store
//!
//! Based on Mach4 vm/vm_external.h/c
//!
//! A fixed table of page-sized slots on a raw backing object. Slot `i`
//! occupies bytes `[i * PAGE_SIZE, (i + 1) * PAGE_SIZE)`. The slot bitmap has
//! its own lock, which is never taken while the coremap or a page table is
//! locked. The backing object is opened on first use.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::device::{SwapOpener, Vnode};
use crate::error::{VmError, VmResult};
use crate::vm::vm_page::Ram;
use crate::vm::vm_param::PAGE_SIZE;

const BITS_PER_WORD: usize = 64;

// ============================================================================
// Slot Bitmap
// ============================================================================

/// Used/free bit per slot
#[derive(Debug)]
struct SlotMap {
    bits: Vec<u64>,
    nslots: usize,
    used: usize,
}

impl SlotMap {
    fn new(nslots: usize) -> Self {
        Self {
            bits: vec![0; (nslots + BITS_PER_WORD - 1) / BITS_PER_WORD],
            nslots,
            used: 0,
        }
    }

    fn test(&self, slot: usize) -> bool {
        self.bits[slot / BITS_PER_WORD] & (1 << (slot % BITS_PER_WORD)) != 0
    }

    /// First free slot, marked used
    fn alloc(&mut self) -> Option<usize> {
        let slot = (0..self.nslots).find(|&s| !self.test(s))?;
        self.bits[slot / BITS_PER_WORD] |= 1 << (slot % BITS_PER_WORD);
        self.used += 1;
        Some(slot)
    }

    fn free(&mut self, slot: usize) -> bool {
        if slot >= self.nslots || !self.test(slot) {
            return false;
        }
        self.bits[slot / BITS_PER_WORD] &= !(1 << (slot % BITS_PER_WORD));
        self.used -= 1;
        true
    }
}

// ============================================================================
// Swap Store
// ============================================================================

/// Swap slot table and its backing object
pub struct SwapStore {
    name: &'static str,
    slots: Mutex<SlotMap>,
    device: Mutex<Option<Arc<dyn Vnode>>>,
    opener: Box<dyn SwapOpener>,
}

impl SwapStore {
    pub fn new(name: &'static str, nslots: usize, opener: Box<dyn SwapOpener>) -> Self {
        Self {
            name,
            slots: Mutex::new(SlotMap::new(nslots)),
            device: Mutex::new(None),
            opener,
        }
    }

    /// Reserve the lowest free slot
    pub fn reserve_slot(&self) -> VmResult<usize> {
        let slot = self.slots.lock().alloc().ok_or(VmError::SwapExhausted)?;
        log::trace!("swap: reserved slot {}", slot);
        Ok(slot)
    }

    pub fn release_slot(&self, slot: usize) {
        if !self.slots.lock().free(slot) {
            log::warn!("swap: release of unused slot {}", slot);
        }
    }

    pub fn is_used(&self, slot: usize) -> bool {
        let slots = self.slots.lock();
        slot < slots.nslots && slots.test(slot)
    }

    /// Slots currently marked used
    pub fn used(&self) -> usize {
        self.slots.lock().used
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().nslots
    }

    /// Backing object, opened on first use
    fn vnode(&self) -> VmResult<Arc<dyn Vnode>> {
        let mut device = self.device.lock();
        if let Some(vnode) = device.as_ref() {
            return Ok(Arc::clone(vnode));
        }
        let vnode = self.opener.open(self.name).map_err(|e| {
            log::error!("swap: cannot open {}: {}", self.name, e);
            VmError::Io(e)
        })?;
        log::info!("swap: opened {} ({} bytes)", self.name, vnode.size());
        *device = Some(Arc::clone(&vnode));
        Ok(vnode)
    }

    fn offset(slot: usize) -> u64 {
        (slot * PAGE_SIZE) as u64
    }

    /// Write a slot from a page-sized buffer
    pub fn write_slot(&self, slot: usize, buf: &[u8]) -> VmResult<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        let vnode = self.vnode()?;
        vnode.write_at(buf, Self::offset(slot)).map_err(|e| {
            log::error!("swap: write of slot {} failed: {}", slot, e);
            VmError::Io(e)
        })
    }

    /// Read a slot into a page-sized buffer
    pub fn read_slot(&self, slot: usize, buf: &mut [u8]) -> VmResult<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        let vnode = self.vnode()?;
        vnode.read_at(buf, Self::offset(slot)).map_err(|e| {
            log::error!("swap: read of slot {} failed: {}", slot, e);
            VmError::Io(e)
        })
    }

    /// Copy a frame out to its slot
    pub fn write_out(&self, ram: &Ram, frame: usize, slot: usize) -> VmResult<()> {
        let mut buf = vec![0u8; PAGE_SIZE];
        ram.read_frame(frame, &mut buf);
        self.write_slot(slot, &buf)?;
        log::debug!("swap: frame {} -> slot {}", frame, slot);
        Ok(())
    }

    /// Fill a frame from its slot
    pub fn read_in(&self, ram: &Ram, frame: usize, slot: usize) -> VmResult<()> {
        let mut buf = vec![0u8; PAGE_SIZE];
        self.read_slot(slot, &mut buf)?;
        ram.write_frame(frame, &buf);
        log::debug!("swap: slot {} -> frame {}", slot, frame);
        Ok(())
    }
}

impl core::fmt::Debug for SwapStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SwapStore")
            .field("name", &self.name)
            .field("slots", &*self.slots.lock())
            .field("opened", &self.device.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{IoError, RamDisk};

    fn store(nslots: usize) -> (Arc<RamDisk>, SwapStore) {
        let disk = RamDisk::new("lhd0raw:", (nslots * PAGE_SIZE) as u64);
        let store = SwapStore::new("lhd0raw:", nslots, Box::new(disk.opener()));
        (disk, store)
    }

    #[test]
    fn test_slots_are_first_fit() {
        let (_disk, store) = store(4);
        assert_eq!(store.reserve_slot(), Ok(0));
        assert_eq!(store.reserve_slot(), Ok(1));
        store.release_slot(0);
        assert_eq!(store.reserve_slot(), Ok(0));
        assert_eq!(store.reserve_slot(), Ok(2));
        assert_eq!(store.reserve_slot(), Ok(3));
        assert_eq!(store.reserve_slot(), Err(VmError::SwapExhausted));
        assert_eq!(store.used(), 4);
    }

    #[test]
    fn test_slot_round_trip_through_frame() {
        let (disk, store) = store(4);
        let ram = Ram::new(2);
        ram.write_frame(0, &[0x5A; PAGE_SIZE]);
        store.write_out(&ram, 0, 3).unwrap();
        store.read_in(&ram, 1, 3).unwrap();
        assert_eq!(ram.frame(1).lock()[123], 0x5A);
        assert_eq!(disk.writes(), 1);
        assert_eq!(disk.reads(), 1);
    }

    #[test]
    fn test_device_failure_is_reported() {
        let (disk, store) = store(2);
        disk.set_fail_writes(true);
        let buf = [0u8; PAGE_SIZE];
        assert_eq!(
            store.write_slot(1, &buf),
            Err(VmError::Io(IoError::Device {
                offset: PAGE_SIZE as u64
            }))
        );
    }

    #[test]
    fn test_missing_device() {
        let store = SwapStore::new("lhd1raw:", 2, Box::new(RamDisk::new("lhd0raw:", 8192).opener()));
        let mut buf = [0u8; PAGE_SIZE];
        assert_eq!(
            store.read_slot(0, &mut buf),
            Err(VmError::Io(IoError::NoSuchDevice))
        );
    }

    #[test]
    fn test_bitmap_spans_words() {
        let mut map = SlotMap::new(130);
        for _ in 0..130 {
            assert!(map.alloc().is_some());
        }
        assert!(map.alloc().is_none());
        assert!(map.free(129));
        assert!(!map.free(129));
        assert_eq!(map.alloc(), Some(129));
    }
}
