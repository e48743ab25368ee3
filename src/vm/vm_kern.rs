//! Kernel Page Allocation
//!
//! Based on Mach4 vm/vm_kern.c
//!
//! Kernel memory is handed out as runs of contiguous frames addressed
//! through the KSEG0 direct map. Before the coremap exists every request is
//! served by the boot stealer and can never be freed.

use crate::error::{VmError, VmResult};
use crate::kern::sched_prim::WaitReason;
use crate::vm::vm_page::{Selection, VictimPolicy};
use crate::vm::vm_param::{
    frame_to_paddr, kvaddr_to_paddr, paddr_to_frame, paddr_to_kvaddr, VAddr, MIPS_KSEG0,
};
use crate::vm::VmSystem;

impl VmSystem {
    /// Allocate `npages` contiguous zeroed frames for the kernel
    pub fn alloc_kpages(&self, npages: usize) -> VmResult<VAddr> {
        if npages == 0 {
            return Err(VmError::InvalidArgument);
        }
        let Some(coremap) = self.coremap.get() else {
            return self
                .ram
                .ram_stealmem(npages)
                .map(paddr_to_kvaddr)
                .ok_or(VmError::OutOfMemory);
        };

        let mut policy = VictimPolicy::AnyReclaimable;
        loop {
            match coremap.select_run(npages, policy) {
                Selection::Ready(victims) => match self.evict_run(&victims) {
                    Ok(()) => {
                        let start = victims[0].frame;
                        for victim in &victims {
                            self.ram.zero(victim.frame);
                        }
                        coremap.assign_kernel_run(start, npages);
                        log::trace!("alloc_kpages: {} pages at frame {}", npages, start);
                        return Ok(paddr_to_kvaddr(frame_to_paddr(start)));
                    }
                    Err(VmError::SwapExhausted) if policy == VictimPolicy::AnyReclaimable => {
                        log::warn!("alloc_kpages: swap full, retrying with clean frames");
                        policy = VictimPolicy::CleanOnly;
                    }
                    Err(e) => return Err(e),
                },
                Selection::Wait(ticket) => coremap.wchan().sleep(ticket, WaitReason::VmFrame),
                Selection::Exhausted => {
                    log::warn!("alloc_kpages: no run of {} pages", npages);
                    return Err(VmError::OutOfMemory);
                }
            }
        }
    }

    /// Free a run returned by `alloc_kpages`
    ///
    /// Memory taken before bootstrap cannot be returned; such frees are
    /// ignored.
    pub fn free_kpages(&self, kvaddr: VAddr) -> VmResult<()> {
        if kvaddr < MIPS_KSEG0 {
            return Err(VmError::InvalidArgument);
        }
        let frame = paddr_to_frame(kvaddr_to_paddr(kvaddr));
        let Some(coremap) = self.coremap.get() else {
            log::warn!("free_kpages: {:#x} freed before bootstrap, ignored", kvaddr);
            return Ok(());
        };
        if frame < coremap.first_managed() {
            log::warn!("free_kpages: {:#x} was stolen at boot, ignored", kvaddr);
            return Ok(());
        }
        let npages = coremap.free_run(frame)?;
        log::trace!("free_kpages: {} pages at frame {}", npages, frame);
        Ok(())
    }
}
