//! Software TLB
//!
//! A fully associative, software-refilled translation buffer in the style of
//! the MIPS R3000: the kernel probes it, writes entries by index, and lets the
//! hardware pick a random slot on refill. There is no address-space tag;
//! switching address spaces flushes the whole TLB.

use super::random::Rng;
use crate::vm::vm_param::{addr_to_vpn, VAddr, NUM_TLB};

/// One TLB entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TlbEntry {
    /// Virtual page number
    pub vpn: u64,
    /// Physical frame number
    pub pfn: usize,
    /// Entry holds a translation
    pub valid: bool,
    /// Writes allowed (the MIPS "dirty" bit)
    pub writable: bool,
}

impl TlbEntry {
    pub const INVALID: Self = Self {
        vpn: 0,
        pfn: 0,
        valid: false,
        writable: false,
    };

    pub fn new(vaddr: VAddr, pfn: usize, writable: bool) -> Self {
        Self {
            vpn: addr_to_vpn(vaddr),
            pfn,
            valid: true,
            writable,
        }
    }
}

/// Per-processor TLB
#[derive(Debug, Clone)]
pub struct Tlb {
    entries: [TlbEntry; NUM_TLB],
    rng: Rng,
}

impl Tlb {
    pub fn new(seed: u64) -> Self {
        Self {
            entries: [TlbEntry::INVALID; NUM_TLB],
            rng: Rng::new(seed),
        }
    }

    /// Index of the valid entry mapping `vaddr`
    pub fn probe(&self, vaddr: VAddr) -> Option<usize> {
        let vpn = addr_to_vpn(vaddr);
        self.entries.iter().position(|e| e.valid && e.vpn == vpn)
    }

    /// Translation for `vaddr`, if present
    pub fn translate(&self, vaddr: VAddr) -> Option<TlbEntry> {
        self.probe(vaddr).map(|i| self.entries[i])
    }

    pub fn read(&self, index: usize) -> TlbEntry {
        self.entries[index]
    }

    pub fn write(&mut self, index: usize, entry: TlbEntry) {
        self.entries[index] = entry;
    }

    /// Write into a randomly chosen slot, returning the slot used
    pub fn write_random(&mut self, entry: TlbEntry) -> usize {
        let index = self.rng.below(NUM_TLB);
        self.entries[index] = entry;
        index
    }

    /// Replace an existing translation for the page or pick a random slot
    pub fn install(&mut self, entry: TlbEntry) -> usize {
        match self.entries.iter().position(|e| e.valid && e.vpn == entry.vpn) {
            Some(index) => {
                self.entries[index] = entry;
                index
            }
            None => self.write_random(entry),
        }
    }

    pub fn invalidate(&mut self, index: usize) {
        self.entries[index] = TlbEntry::INVALID;
    }

    /// Drop the translation for `vaddr`; true if one was present
    pub fn invalidate_addr(&mut self, vaddr: VAddr) -> bool {
        match self.probe(vaddr) {
            Some(index) => {
                self.invalidate(index);
                true
            }
            None => false,
        }
    }

    pub fn flush_all(&mut self) {
        self.entries = [TlbEntry::INVALID; NUM_TLB];
    }

    /// Number of valid entries
    pub fn valid_count(&self) -> usize {
        self.entries.iter().filter(|e| e.valid).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_reuses_slot_for_same_page() {
        let mut tlb = Tlb::new(1);
        let first = tlb.install(TlbEntry::new(0x40_0000, 12, false));
        let second = tlb.install(TlbEntry::new(0x40_0000, 12, true));
        assert_eq!(first, second);
        assert_eq!(tlb.valid_count(), 1);
        assert!(tlb.translate(0x40_0123).unwrap().writable);
    }

    #[test]
    fn test_invalidate_and_flush() {
        let mut tlb = Tlb::new(7);
        tlb.write(0, TlbEntry::new(0x1000, 3, true));
        tlb.write(1, TlbEntry::new(0x2000, 4, true));
        assert!(tlb.invalidate_addr(0x1000));
        assert!(!tlb.invalidate_addr(0x1000));
        assert_eq!(tlb.valid_count(), 1);
        tlb.flush_all();
        assert_eq!(tlb.valid_count(), 0);
        assert!(tlb.probe(0x2000).is_none());
    }
}
