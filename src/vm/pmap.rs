//! Page Table (pmap)
//!
//! Based on Mach4 vm/pmap.h/c
//!
//! Each address space has one page table: an ordered map from virtual page
//! to the entry describing where that page lives. Lookups are by exact
//! page-aligned address only.
//!
//! ## Entry states
//!
//! | frame | on_disk | locked | meaning                                  |
//! |-------|---------|--------|------------------------------------------|
//! | none  | false   | false  | created, never filled                    |
//! | some  | false   | false  | resident, newer than any swap copy       |
//! | some  | true    | false  | resident and identical to its swap copy  |
//! | none  | true    | false  | swapped out                              |
//! | any   | any     | true   | in transition (eviction or page-in)      |

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::error::{VmError, VmResult};
use crate::vm::vm_param::{addr_to_vpn, is_page_aligned, VAddr};

// ============================================================================
// Page Table Entry
// ============================================================================

/// Where one virtual page lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry {
    /// Page-aligned virtual address
    pub vaddr: VAddr,
    /// Resident frame
    pub frame: Option<usize>,
    /// Swap slot, kept until the entry is destroyed
    pub swap_slot: Option<usize>,
    /// The swap slot holds a valid copy
    pub on_disk: bool,
    /// In transition; faulting threads must wait
    pub locked: bool,
}

impl PageTableEntry {
    pub const fn new(vaddr: VAddr) -> Self {
        Self {
            vaddr,
            frame: None,
            swap_slot: None,
            on_disk: false,
            locked: false,
        }
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }
}

// ============================================================================
// Page Table
// ============================================================================

/// Per-address-space page table
#[derive(Debug)]
pub struct PageTable {
    entries: BTreeMap<u64, PageTableEntry>,
    /// Entries this table may hold
    limit: usize,
}

impl PageTable {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, vaddr: VAddr) -> Option<&PageTableEntry> {
        if !is_page_aligned(vaddr) {
            return None;
        }
        self.entries.get(&addr_to_vpn(vaddr))
    }

    pub fn lookup_mut(&mut self, vaddr: VAddr) -> Option<&mut PageTableEntry> {
        if !is_page_aligned(vaddr) {
            return None;
        }
        self.entries.get_mut(&addr_to_vpn(vaddr))
    }

    /// Entry for `vaddr`, created unmapped if absent
    pub fn insert(&mut self, vaddr: VAddr) -> VmResult<&mut PageTableEntry> {
        if !is_page_aligned(vaddr) {
            return Err(VmError::InvalidArgument);
        }
        let vpn = addr_to_vpn(vaddr);
        if !self.entries.contains_key(&vpn) && self.entries.len() >= self.limit {
            return Err(VmError::PageTableFull);
        }
        Ok(self
            .entries
            .entry(vpn)
            .or_insert_with(|| PageTableEntry::new(vaddr)))
    }

    pub fn remove(&mut self, vaddr: VAddr) -> Option<PageTableEntry> {
        self.entries.remove(&addr_to_vpn(vaddr))
    }

    /// Entry that must exist because the caller holds it locked
    pub fn locked_entry(&mut self, vaddr: VAddr) -> &mut PageTableEntry {
        match self.lookup_mut(vaddr) {
            Some(pte) if pte.locked => pte,
            _ => panic!("page table entry {:#x} lost while locked", vaddr),
        }
    }

    /// Addresses of every entry, in address order
    pub fn vaddrs(&self) -> Vec<VAddr> {
        self.entries.values().map(|e| e.vaddr).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.values()
    }

    pub fn resident_count(&self) -> usize {
        self.iter().filter(|e| e.is_resident()).count()
    }

    /// Entries holding a swap slot
    pub fn slot_count(&self) -> usize {
        self.iter().filter(|e| e.swap_slot.is_some()).count()
    }

    pub fn on_disk_count(&self) -> usize {
        self.iter().filter(|e| e.on_disk).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_is_idempotent() {
        let mut pt = PageTable::new(8);
        pt.insert(0x40_0000).unwrap().frame = Some(5);
        let pte = pt.insert(0x40_0000).unwrap();
        assert_eq!(pte.frame, Some(5));
        assert_eq!(pt.len(), 1);
    }

    #[test]
    fn test_lookup_is_exact() {
        let mut pt = PageTable::new(8);
        pt.insert(0x1000).unwrap();
        assert!(pt.lookup(0x1000).is_some());
        assert!(pt.lookup(0x1008).is_none());
        assert!(pt.lookup(0x2000).is_none());
        assert_eq!(pt.insert(0x1008).err(), Some(VmError::InvalidArgument));
    }

    #[test]
    fn test_limit() {
        let mut pt = PageTable::new(2);
        pt.insert(0x1000).unwrap();
        pt.insert(0x2000).unwrap();
        assert_eq!(pt.insert(0x3000).err(), Some(VmError::PageTableFull));
        assert!(pt.insert(0x2000).is_ok());
        pt.remove(0x1000);
        assert!(pt.insert(0x3000).is_ok());
        assert_eq!(pt.vaddrs(), [0x2000, 0x3000]);
    }

    #[test]
    fn test_counts() {
        let mut pt = PageTable::new(8);
        {
            let pte = pt.insert(0x1000).unwrap();
            pte.frame = Some(3);
        }
        {
            let pte = pt.insert(0x2000).unwrap();
            pte.swap_slot = Some(0);
            pte.on_disk = true;
        }
        assert_eq!(pt.resident_count(), 1);
        assert_eq!(pt.slot_count(), 1);
        assert_eq!(pt.on_disk_count(), 1);
    }
}
