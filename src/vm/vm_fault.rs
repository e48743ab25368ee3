//! VM Fault - Page Fault Handling
//!
//! Based on Mach4 vm/vm_fault.h/c
//!
//! Every TLB miss and every write through a read-only TLB entry lands here.
//!
//! ## Fault states
//!
//! 1. **Validate**: the address must fall in a region, the heap or the
//!    stack, and the region must allow the access. This is checked with the
//!    page table locked.
//! 2. **Lookup/create**: find the page table entry, creating it unmapped.
//! 3. **Wait**: a locked entry is in transition; sleep and start over.
//! 4. **Allocate**: an unmapped entry gets a frame, zero-filled or read back
//!    from swap. The entry stays locked while the frame is filled.
//! 5. **Install**: with interrupts masked, check the frame is still ours,
//!    mark it dirty on a write, and load the TLB. The entry is writable only
//!    if the frame is dirty and the page may be written.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use crate::error::{VmError, VmResult};
use crate::kern::processor::{CpuId, Processor};
use crate::kern::sched_prim::WaitReason;
use crate::kern::tlb::TlbEntry;
use crate::vm::vm_map::{frame_owner, AddrSpace, VmProt};
use crate::vm::vm_page::FrameState;
use crate::vm::vm_param::{trunc_page, VAddr};
use crate::vm::VmSystem;

/// Fault type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultType {
    /// TLB miss on a load
    Read,
    /// TLB miss on a store
    Write,
    /// Store through a TLB entry that is not writable
    ReadOnly,
}

impl FaultType {
    /// Decode the trap handler's fault code
    pub fn from_code(code: u32) -> VmResult<Self> {
        match code {
            0 => Ok(FaultType::Read),
            1 => Ok(FaultType::Write),
            2 => Ok(FaultType::ReadOnly),
            _ => Err(VmError::InvalidArgument),
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, FaultType::Read)
    }
}

/// What the install step found
enum Install {
    Done,
    Retry,
}

impl VmSystem {
    /// Resolve a fault taken on `cpu` at `faultaddress`
    pub fn vm_fault(&self, cpu: CpuId, fault_type: FaultType, faultaddress: VAddr) -> VmResult<()> {
        self.stats.faults.fetch_add(1, Ordering::Relaxed);
        let result = self.handle_fault(cpu, fault_type, faultaddress);
        if let Err(e) = &result {
            self.stats.failed_faults.fetch_add(1, Ordering::Relaxed);
            log::debug!("vm_fault: {:?} at {:#x} on cpu {}: {}", fault_type, faultaddress, cpu.0, e);
        }
        result
    }

    fn handle_fault(&self, cpu: CpuId, fault_type: FaultType, faultaddress: VAddr) -> VmResult<()> {
        let processor = self.cpus.get(cpu)?;
        self.coremap()?;
        let vaddr = trunc_page(faultaddress);

        loop {
            let aspace = processor.curas().ok_or(VmError::NoAddressSpace)?;
            log::trace!("vm_fault: {:?} at {:#x} in as {}", fault_type, faultaddress, aspace.id().0);

            // A heap shrink moves the break before it collects pages under
            // this lock
            let mut pt = aspace.page_table.lock();
            let prot = aspace.validate(faultaddress, fault_type)?;
            let may_write = prot.contains(VmProt::WRITE);
            let pte = pt.insert(vaddr)?;
            if pte.locked {
                aspace.swap_wc.sleep_releasing(pt, WaitReason::VmPage);
                continue;
            }
            if pte.frame.is_none() {
                let slot = if pte.on_disk {
                    assert!(pte.swap_slot.is_some(), "page {:#x} on disk without a slot", vaddr);
                    pte.swap_slot
                } else {
                    None
                };
                pte.locked = true;
                drop(pt);
                self.page_in(&aspace, vaddr, slot)?;
                continue;
            }
            drop(pt);

            match self.install(processor, &aspace, vaddr, fault_type, may_write)? {
                Install::Done => return Ok(()),
                Install::Retry => continue,
            }
        }
    }

    /// Give a locked, unmapped entry a frame and unlock it
    fn page_in(&self, aspace: &Arc<AddrSpace>, vaddr: VAddr, slot: Option<usize>) -> VmResult<()> {
        let coremap = self.coremap()?;
        let filled = self.page_alloc().and_then(|frame| match slot {
            Some(slot) => match self.swap.read_in(&self.ram, frame, slot) {
                Ok(()) => {
                    self.stats.page_ins.fetch_add(1, Ordering::Relaxed);
                    Ok((frame, FrameState::Clean))
                }
                Err(e) => {
                    coremap.release_claimed(frame);
                    Err(e)
                }
            },
            None => {
                self.ram.zero(frame);
                self.stats.zero_fills.fetch_add(1, Ordering::Relaxed);
                Ok((frame, FrameState::Dirty))
            }
        });

        let mut pt = aspace.page_table.lock();
        let pte = pt.locked_entry(vaddr);
        pte.locked = false;
        if let Ok((frame, state)) = filled {
            pte.frame = Some(frame);
            coremap.assign_user(frame, frame_owner(aspace, vaddr), state);
        }
        drop(pt);
        aspace.swap_wc.wakeup_all();
        filled.map(|_| ())
    }

    /// Load the translation into this processor's TLB
    fn install(
        &self,
        processor: &Processor,
        aspace: &Arc<AddrSpace>,
        vaddr: VAddr,
        fault_type: FaultType,
        may_write: bool,
    ) -> VmResult<Install> {
        let coremap = self.coremap()?;
        let mut spl = processor.splhigh();
        let mut pt = aspace.page_table.lock();
        let Some(pte) = pt.lookup_mut(vaddr) else {
            return Ok(Install::Retry);
        };
        let Some(frame) = pte.frame else {
            return Ok(Install::Retry);
        };
        if pte.locked {
            return Ok(Install::Retry);
        }

        let mut cm = coremap.lock();
        let entry = cm.entry_mut(frame);
        if entry.state == FrameState::Victim {
            // Selected for eviction before its entry was locked
            let ticket = coremap.wchan().prepare();
            drop(cm);
            drop(pt);
            drop(spl);
            coremap.wchan().sleep(ticket, WaitReason::VmFrame);
            return Ok(Install::Retry);
        }
        assert!(
            matches!(entry.state, FrameState::Clean | FrameState::Dirty),
            "installing frame {} in state {:?}",
            frame,
            entry.state
        );
        assert!(
            entry.owner.as_ref().is_some_and(|o| o.is(aspace.id(), vaddr)),
            "frame {} does not belong to as {} page {:#x}",
            frame,
            aspace.id().0,
            vaddr
        );

        // Switched away since the fault started; retry in the new space
        if spl.curas().map(|a| a.id()) != Some(aspace.id()) {
            return Ok(Install::Retry);
        }

        if fault_type.is_write() {
            entry.state = FrameState::Dirty;
            pte.on_disk = false;
        }
        let writable = may_write && entry.state == FrameState::Dirty;
        drop(cm);
        drop(pt);

        spl.tlb.install(TlbEntry::new(vaddr, frame, writable));
        Ok(Install::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use crate::device::RamDisk;
    use crate::vm::vm_param::PAGE_SIZE;

    #[test]
    fn test_fault_codes() {
        assert_eq!(FaultType::from_code(0), Ok(FaultType::Read));
        assert_eq!(FaultType::from_code(2), Ok(FaultType::ReadOnly));
        assert_eq!(FaultType::from_code(7), Err(VmError::InvalidArgument));
        assert!(FaultType::ReadOnly.is_write());
        assert!(!FaultType::Read.is_write());
    }

    #[test]
    fn test_install_after_switch_retries() {
        let config = VmConfig::new().with_ram_frames(16).with_ncpus(1).with_swap_slots(8);
        let disk = RamDisk::new("lhd0raw:", config.swap_bytes());
        let vm = VmSystem::new(config, disk.opener()).unwrap();
        vm.vm_bootstrap().unwrap();

        let a = vm.as_create();
        a.define_region(0x40_0000, PAGE_SIZE as u64, VmProt::READ | VmProt::WRITE).unwrap();
        vm.as_activate(CpuId(0), &a).unwrap();
        vm.vm_fault(CpuId(0), FaultType::Write, 0x40_0000).unwrap();

        let b = vm.as_create();
        vm.as_activate(CpuId(0), &b).unwrap();
        let processor = vm.cpu(CpuId(0)).unwrap();
        let result = vm.install(processor, &a, 0x40_0000, FaultType::Read, true).unwrap();
        assert!(matches!(result, Install::Retry));
        assert_eq!(processor.splhigh().tlb.valid_count(), 0);
    }
}
