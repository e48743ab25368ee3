//! Address Spaces
//!
//! Based on Mach4 vm/vm_map.h/c
//!
//! An address space is a list of regions declared by the loader, a heap
//! that starts just past the last region, a stack that grows down from
//! `USERSTACK`, and the page table describing which of those pages exist.
//!
//! Lock order: processor spl, then page table, then coremap. The layout lock
//! is only ever taken alone.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;
use spin::Mutex;

use crate::config::VmConfig;
use crate::error::{VmError, VmResult};
use crate::kern::processor::CpuId;
use crate::kern::sched_prim::{WaitChannel, WaitReason};
use crate::vm::pmap::{PageTable, PageTableEntry};
use crate::vm::vm_fault::FaultType;
use crate::vm::vm_page::{FrameOwner, FrameState, PageBuf};
use crate::vm::vm_param::{
    round_page, trunc_page, VAddr, PAGE_SIZE, USERSPACETOP, USERSTACK, USERSTACKBASE,
};
use crate::vm::VmSystem;

// ============================================================================
// Address Space ID
// ============================================================================

/// Address space identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AsId(pub u64);

// ============================================================================
// VM Protection
// ============================================================================

/// Memory protection flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmProt(u32);

impl VmProt {
    /// No access
    pub const NONE: Self = Self(0);
    /// Read access
    pub const READ: Self = Self(1);
    /// Write access
    pub const WRITE: Self = Self(2);
    /// Execute access
    pub const EXECUTE: Self = Self(4);
    /// Read/write
    pub const DEFAULT: Self = Self(3);
    /// All permissions
    pub const ALL: Self = Self(7);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn new(bits: u32) -> Self {
        Self(bits & 0x7)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Does this protection allow the access a fault attempted
    pub fn permits(&self, fault: FaultType) -> bool {
        match fault {
            FaultType::Read => self.contains(Self::READ),
            FaultType::Write | FaultType::ReadOnly => self.contains(Self::WRITE),
        }
    }
}

impl core::ops::BitOr for VmProt {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for VmProt {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl Default for VmProt {
    fn default() -> Self {
        Self::DEFAULT
    }
}

// ============================================================================
// Regions
// ============================================================================

/// A declared span of the address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Page-aligned base
    pub base: VAddr,
    /// Page-aligned length in bytes
    pub len: u64,
    pub perm: VmProt,
    /// Declared permission while a load forces the region writable
    pub backup_perm: VmProt,
}

impl Region {
    pub fn end(&self) -> VAddr {
        self.base + self.len
    }

    pub fn contains(&self, vaddr: VAddr) -> bool {
        vaddr >= self.base && vaddr < self.end()
    }

    fn overlaps(&self, base: VAddr, end: VAddr) -> bool {
        base < self.end() && self.base < end
    }
}

/// Region list, heap and stack bounds
#[derive(Debug, Clone)]
struct Layout {
    regions: Vec<Region>,
    heap_start: VAddr,
    heap_end: VAddr,
    /// Lowest stack page that may be touched without growing
    stack_end: VAddr,
    /// Inside a prepare/complete load window
    loading: bool,
}

// ============================================================================
// Address Space
// ============================================================================

/// A process address space
pub struct AddrSpace {
    id: AsId,
    layout: Mutex<Layout>,
    pub(crate) page_table: Mutex<PageTable>,
    /// Faulting threads wait here while one of this space's pages is in transition
    pub(crate) swap_wc: WaitChannel,
    heap_max: u64,
    stack_max: u64,
}

impl AddrSpace {
    pub fn new(id: AsId, config: &VmConfig) -> Self {
        Self {
            id,
            layout: Mutex::new(Layout {
                regions: Vec::new(),
                heap_start: 0,
                heap_end: 0,
                stack_end: USERSTACK,
                loading: false,
            }),
            page_table: Mutex::new(PageTable::new(config.max_page_table_entries)),
            swap_wc: WaitChannel::new("as_swap"),
            heap_max: config.heap_max,
            stack_max: config.stack_max,
        }
    }

    pub fn id(&self) -> AsId {
        self.id
    }

    /// Declare a region; the heap moves to just past it
    pub fn define_region(&self, vaddr: VAddr, memsize: u64, perm: VmProt) -> VmResult<()> {
        let base = trunc_page(vaddr);
        let end = vaddr
            .checked_add(memsize)
            .filter(|&end| end <= USERSPACETOP)
            .map(round_page)
            .ok_or(VmError::InvalidArgument)?;
        if end <= base {
            return Err(VmError::InvalidArgument);
        }

        let mut layout = self.layout.lock();
        if layout.regions.iter().any(|r| r.overlaps(base, end)) {
            return Err(VmError::InvalidArgument);
        }
        layout.regions.push(Region {
            base,
            len: end - base,
            perm,
            backup_perm: perm,
        });
        layout.heap_start = end;
        layout.heap_end = end;
        log::debug!("as {}: region {:#x}-{:#x} {:?}", self.id.0, base, end, perm);
        Ok(())
    }

    /// Make every region writable so the loader can fill it
    ///
    /// Nested calls keep the permissions saved by the first one.
    pub fn prepare_load(&self) {
        let mut layout = self.layout.lock();
        if layout.loading {
            return;
        }
        layout.loading = true;
        for region in layout.regions.iter_mut() {
            region.backup_perm = region.perm;
            region.perm = VmProt::READ | VmProt::WRITE;
        }
    }

    /// Restore the declared permissions
    pub fn complete_load(&self) {
        let mut layout = self.layout.lock();
        layout.loading = false;
        for region in layout.regions.iter_mut() {
            region.perm = region.backup_perm;
        }
    }

    /// Initial user stack pointer
    pub fn define_stack(&self) -> VAddr {
        USERSTACK
    }

    /// Sanity-check the layout
    pub fn check_regions(&self) -> VmResult<()> {
        let layout = self.layout.lock();
        let mut sorted = layout.regions.clone();
        sorted.sort_by_key(|r| r.base);
        for pair in sorted.windows(2) {
            if pair[0].end() > pair[1].base {
                return Err(VmError::InvalidArgument);
            }
        }
        for r in &sorted {
            if r.len == 0 || r.base % PAGE_SIZE as u64 != 0 || r.len % PAGE_SIZE as u64 != 0 {
                return Err(VmError::InvalidArgument);
            }
        }
        if layout.heap_end < layout.heap_start || layout.heap_end > self.stack_floor() {
            return Err(VmError::InvalidArgument);
        }
        if layout.stack_end < self.stack_floor() || layout.stack_end > USERSTACK {
            return Err(VmError::InvalidArgument);
        }
        Ok(())
    }

    pub fn regions(&self) -> Vec<Region> {
        self.layout.lock().regions.clone()
    }

    /// `(heap_start, heap_end)`
    pub fn heap_bounds(&self) -> (VAddr, VAddr) {
        let layout = self.layout.lock();
        (layout.heap_start, layout.heap_end)
    }

    pub fn stack_end(&self) -> VAddr {
        self.layout.lock().stack_end
    }

    /// Lowest address the stack may ever reach
    pub fn stack_floor(&self) -> VAddr {
        USERSTACKBASE.max(USERSTACK.saturating_sub(self.stack_max))
    }

    /// Check `addr` against regions, heap and stack, in that order, and
    /// return the protection that applies there
    ///
    /// A touch within one page below the current stack end grows the stack.
    pub fn validate(&self, addr: VAddr, fault: FaultType) -> VmResult<VmProt> {
        if addr >= USERSPACETOP {
            return Err(VmError::BadAddress(addr));
        }
        let mut layout = self.layout.lock();

        if let Some(region) = layout.regions.iter().find(|r| r.contains(addr)) {
            return if region.perm.permits(fault) {
                Ok(region.perm)
            } else {
                Err(VmError::PermissionDenied { vaddr: addr, fault })
            };
        }

        // The heap starts after the first region is declared
        let has_heap = !layout.regions.is_empty();
        if has_heap && addr >= layout.heap_start && addr <= layout.heap_end {
            return Ok(VmProt::DEFAULT);
        }

        let floor = self.stack_floor();
        if addr >= floor && addr >= layout.stack_end.saturating_sub(PAGE_SIZE as u64) {
            if addr < layout.stack_end {
                layout.stack_end -= PAGE_SIZE as u64;
                log::trace!("as {}: stack grown to {:#x}", self.id.0, layout.stack_end);
            }
            return Ok(VmProt::DEFAULT);
        }

        Err(VmError::BadAddress(addr))
    }

    /// Snapshot of one page table entry
    pub fn pte(&self, vaddr: VAddr) -> Option<PageTableEntry> {
        self.page_table.lock().lookup(trunc_page(vaddr)).copied()
    }

    /// Snapshot of every page table entry
    pub fn ptes(&self) -> Vec<PageTableEntry> {
        self.page_table.lock().iter().copied().collect()
    }

    pub fn page_count(&self) -> usize {
        self.page_table.lock().len()
    }

    pub fn resident_pages(&self) -> usize {
        self.page_table.lock().resident_count()
    }

    /// Entries holding a swap slot
    pub fn swap_slots_held(&self) -> usize {
        self.page_table.lock().slot_count()
    }

    fn owner(self: &Arc<Self>, vaddr: VAddr) -> FrameOwner {
        FrameOwner {
            aspace: Arc::downgrade(self),
            asid: self.id,
            vaddr,
        }
    }
}

impl core::fmt::Debug for AddrSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddrSpace").field("id", &self.id).finish_non_exhaustive()
    }
}

pub(crate) fn frame_owner(aspace: &Arc<AddrSpace>, vaddr: VAddr) -> FrameOwner {
    aspace.owner(vaddr)
}

// ============================================================================
// Address Space Lifecycle
// ============================================================================

impl VmSystem {
    /// Create an empty address space
    pub fn as_create(&self) -> Arc<AddrSpace> {
        let id = AsId(self.next_asid.fetch_add(1, Ordering::Relaxed));
        log::debug!("as {}: created", id.0);
        Arc::new(AddrSpace::new(id, &self.config))
    }

    /// Tear down an address space, returning every frame and swap slot
    pub fn as_destroy(&self, aspace: &Arc<AddrSpace>) {
        self.cpus.deactivate_everywhere(aspace.id());
        let vaddrs = aspace.page_table.lock().vaddrs();
        for vaddr in vaddrs {
            self.release_page(aspace, vaddr, false);
        }
        log::debug!("as {}: destroyed", aspace.id().0);
    }

    /// Make `aspace` current on `cpu`
    pub fn as_activate(&self, cpu: CpuId, aspace: &Arc<AddrSpace>) -> VmResult<()> {
        let processor = self.cpus.get(cpu)?;
        processor.splhigh().activate(Some(Arc::clone(aspace)));
        Ok(())
    }

    /// End the load window and drop any writable translations it left behind
    pub fn as_complete_load(&self, aspace: &Arc<AddrSpace>) {
        aspace.complete_load();
        self.cpus.flush_address_space(aspace.id());
    }

    /// Leave `cpu` with no current address space
    pub fn as_deactivate(&self, cpu: CpuId) -> VmResult<()> {
        let processor = self.cpus.get(cpu)?;
        processor.splhigh().activate(None);
        Ok(())
    }

    /// Move the heap break by `delta` bytes, returning the old break
    ///
    /// The request is satisfied whole or not at all. Pages above the one
    /// holding a lowered break are freed.
    pub fn as_grow_heap(&self, aspace: &Arc<AddrSpace>, delta: i64) -> VmResult<VAddr> {
        let (old_end, new_end) = {
            let mut layout = aspace.layout.lock();
            let old_end = layout.heap_end;
            let new_end = old_end
                .checked_add_signed(delta)
                .ok_or(VmError::OutOfMemory)?;
            let ceiling = layout
                .heap_start
                .saturating_add(aspace.heap_max)
                .min(aspace.stack_floor());
            if new_end < layout.heap_start || new_end > ceiling {
                return Err(VmError::OutOfMemory);
            }
            layout.heap_end = new_end;
            (old_end, new_end)
        };

        if new_end < old_end {
            let low = trunc_page(new_end) + PAGE_SIZE as u64;
            let high = trunc_page(old_end) + PAGE_SIZE as u64;
            let doomed: Vec<VAddr> = aspace
                .page_table
                .lock()
                .vaddrs()
                .into_iter()
                .filter(|&v| v >= low && v < high)
                .collect();
            for vaddr in doomed {
                self.release_page(aspace, vaddr, true);
            }
        }
        log::trace!("as {}: break {:#x} -> {:#x}", aspace.id().0, old_end, new_end);
        Ok(old_end)
    }

    /// Remove one page, returning its frame and slot
    ///
    /// With `shootdown` set the translation is flushed from every processor
    /// before the frame is given back.
    pub(crate) fn release_page(&self, aspace: &Arc<AddrSpace>, vaddr: VAddr, shootdown: bool) {
        loop {
            let mut pt = aspace.page_table.lock();
            let Some(pte) = pt.lookup_mut(vaddr) else { return };
            if pte.locked {
                aspace.swap_wc.sleep_releasing(pt, WaitReason::VmPage);
                continue;
            }
            pte.locked = true;
            drop(pt);
            break;
        }

        if shootdown {
            self.cpus.tlbshootdown(aspace.id(), vaddr);
        }

        let removed = {
            let mut pt = aspace.page_table.lock();
            let pte = *pt.locked_entry(vaddr);
            pt.remove(vaddr);
            if let Some(frame) = pte.frame {
                if let Ok(coremap) = self.coremap() {
                    coremap.release_user(frame, aspace.id(), vaddr);
                }
            }
            pte
        };
        aspace.swap_wc.wakeup_all();

        if let Some(slot) = removed.swap_slot {
            self.swap.release_slot(slot);
        }
    }

    /// Duplicate an address space, including pages that are out on swap
    ///
    /// Parent and child never share a frame or a slot. On failure everything
    /// already given to the child is released.
    pub fn as_copy(&self, src: &Arc<AddrSpace>) -> VmResult<Arc<AddrSpace>> {
        let child = self.as_create();
        *child.layout.lock() = src.layout.lock().clone();

        if let Err(e) = self.copy_pages(src, &child) {
            log::warn!("as {}: copy failed: {}", src.id().0, e);
            self.as_destroy(&child);
            return Err(e);
        }
        log::debug!("as {}: copied to as {}", src.id().0, child.id().0);
        Ok(child)
    }

    fn copy_pages(&self, src: &Arc<AddrSpace>, child: &Arc<AddrSpace>) -> VmResult<()> {
        let coremap = self.coremap()?;
        let vaddrs = src.page_table.lock().vaddrs();
        for vaddr in vaddrs {
            loop {
                let mut spt = src.page_table.lock();
                let Some(pte) = spt.lookup_mut(vaddr) else { break };
                if pte.locked {
                    src.swap_wc.sleep_releasing(spt, WaitReason::VmPage);
                    continue;
                }

                if let Some(frame) = pte.frame {
                    if let Err(ticket) = coremap.wire(frame) {
                        drop(spt);
                        coremap.wchan().sleep(ticket, WaitReason::VmFrame);
                        continue;
                    }
                    // Locked so a concurrent release waits for the copy
                    pte.locked = true;
                    drop(spt);
                    let copied = self.copy_resident(frame, child, vaddr);
                    coremap.unwire(frame);
                    src.page_table.lock().locked_entry(vaddr).locked = false;
                    src.swap_wc.wakeup_all();
                    copied?;
                } else if pte.on_disk {
                    let Some(slot) = pte.swap_slot else {
                        panic!("page {:#x} on disk without a slot", vaddr)
                    };
                    pte.locked = true;
                    drop(spt);
                    let copied = self.copy_swapped(slot, child, vaddr);
                    src.page_table.lock().locked_entry(vaddr).locked = false;
                    src.swap_wc.wakeup_all();
                    copied?;
                }
                break;
            }
        }
        Ok(())
    }

    fn copy_resident(&self, frame: usize, child: &Arc<AddrSpace>, vaddr: VAddr) -> VmResult<()> {
        let coremap = self.coremap()?;
        let dst = self.page_alloc()?;
        self.ram.copy_frame(frame, dst);

        let mut cpt = child.page_table.lock();
        match cpt.insert(vaddr) {
            Ok(pte) => {
                pte.frame = Some(dst);
                coremap.assign_user(dst, child.owner(vaddr), FrameState::Dirty);
                Ok(())
            }
            Err(e) => {
                drop(cpt);
                coremap.release_claimed(dst);
                Err(e)
            }
        }
    }

    fn copy_swapped(&self, slot: usize, child: &Arc<AddrSpace>, vaddr: VAddr) -> VmResult<()> {
        let mut bounce: Box<PageBuf> = Box::new([0u8; PAGE_SIZE]);
        self.swap.read_slot(slot, &mut bounce[..])?;
        let new_slot = self.swap.reserve_slot()?;
        if let Err(e) = self.swap.write_slot(new_slot, &bounce[..]) {
            self.swap.release_slot(new_slot);
            return Err(e);
        }

        let mut cpt = child.page_table.lock();
        match cpt.insert(vaddr) {
            Ok(pte) => {
                pte.swap_slot = Some(new_slot);
                pte.on_disk = true;
                Ok(())
            }
            Err(e) => {
                drop(cpt);
                self.swap.release_slot(new_slot);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aspace() -> AddrSpace {
        AddrSpace::new(AsId(1), &VmConfig::new())
    }

    #[test]
    fn test_define_region_moves_heap() {
        let a = aspace();
        a.define_region(0x40_0123, 0x1000, VmProt::READ | VmProt::EXECUTE).unwrap();
        let regions = a.regions();
        assert_eq!(regions[0].base, 0x40_0000);
        assert_eq!(regions[0].len, 0x2000);
        assert_eq!(a.heap_bounds(), (0x40_2000, 0x40_2000));
        a.define_region(0x50_0000, 0x1000, VmProt::DEFAULT).unwrap();
        assert_eq!(a.heap_bounds(), (0x50_1000, 0x50_1000));
        assert!(a.check_regions().is_ok());
    }

    #[test]
    fn test_define_region_rejects_overlap_and_empty() {
        let a = aspace();
        a.define_region(0x40_0000, 0x3000, VmProt::READ).unwrap();
        assert_eq!(
            a.define_region(0x40_2000, 0x1000, VmProt::READ),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(
            a.define_region(0x60_0000, 0, VmProt::READ),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(
            a.define_region(USERSPACETOP - 0x1000, 0x2000, VmProt::READ),
            Err(VmError::InvalidArgument)
        );
    }

    #[test]
    fn test_load_window_forces_write() {
        let a = aspace();
        a.define_region(0x40_0000, 0x1000, VmProt::READ | VmProt::EXECUTE).unwrap();
        assert!(a.validate(0x40_0010, FaultType::Write).is_err());
        a.prepare_load();
        assert!(a.validate(0x40_0010, FaultType::Write).is_ok());
        a.complete_load();
        assert_eq!(
            a.validate(0x40_0010, FaultType::ReadOnly),
            Err(VmError::PermissionDenied {
                vaddr: 0x40_0010,
                fault: FaultType::ReadOnly
            })
        );
        assert_eq!(a.regions()[0].perm, VmProt::READ | VmProt::EXECUTE);
    }

    #[test]
    fn test_repeated_prepare_load_restores_declared_perm() {
        let a = aspace();
        a.define_region(0x40_0000, 0x1000, VmProt::READ).unwrap();
        a.prepare_load();
        a.prepare_load();
        a.complete_load();
        assert_eq!(a.regions()[0].perm, VmProt::READ);
        assert!(a.validate(0x40_0000, FaultType::Write).is_err());
    }

    #[test]
    fn test_validate_heap_and_stack() {
        let a = aspace();
        a.define_region(0x40_0000, 0x1000, VmProt::READ).unwrap();
        // Empty heap: the break itself is still addressable
        assert_eq!(a.validate(0x40_1000, FaultType::Write), Ok(VmProt::DEFAULT));
        assert_eq!(a.validate(0x40_1001, FaultType::Read), Err(VmError::BadAddress(0x40_1001)));

        // Stack grows one page at a time
        assert!(a.validate(USERSTACK - 8, FaultType::Write).is_ok());
        assert_eq!(a.stack_end(), USERSTACK - PAGE_SIZE as u64);
        assert_eq!(
            a.validate(USERSTACK - 3 * PAGE_SIZE as u64, FaultType::Write),
            Err(VmError::BadAddress(USERSTACK - 3 * PAGE_SIZE as u64))
        );
        assert!(a.validate(USERSTACK - PAGE_SIZE as u64 - 1, FaultType::Read).is_ok());
        assert_eq!(a.stack_end(), USERSTACK - 2 * PAGE_SIZE as u64);
        assert_eq!(a.validate(USERSPACETOP, FaultType::Read), Err(VmError::BadAddress(USERSPACETOP)));
    }

    #[test]
    fn test_stack_floor_caps_growth() {
        let config = VmConfig::new().with_stack_max(2 * PAGE_SIZE as u64);
        let a = AddrSpace::new(AsId(2), &config);
        assert!(a.validate(USERSTACK - 1, FaultType::Write).is_ok());
        assert!(a.validate(USERSTACK - PAGE_SIZE as u64 - 1, FaultType::Write).is_ok());
        let below = USERSTACK - 2 * PAGE_SIZE as u64 - 1;
        assert_eq!(a.validate(below, FaultType::Write), Err(VmError::BadAddress(below)));
        assert_eq!(a.stack_floor(), USERSTACK - 2 * PAGE_SIZE as u64);
    }

    #[test]
    fn test_prot_permits() {
        assert!(VmProt::READ.permits(FaultType::Read));
        assert!(!VmProt::READ.permits(FaultType::Write));
        assert!(VmProt::DEFAULT.permits(FaultType::ReadOnly));
        assert!(!VmProt::WRITE.permits(FaultType::Read));
    }
}
