//! Page Replacement
//!
//! Based on Mach4 vm/vm_pageout.c
//!
//! ## Eviction protocol
//!
//! The caller has already flipped the frame to `Victim` in the coremap.
//!
//! 1. Lock the owning page table entry so new faults on the page wait.
//! 2. Shoot the translation down on every processor.
//! 3. Unmap the frame from the entry.
//! 4. A dirty frame is written to the entry's swap slot (reserving one if
//!    the entry has none); a clean frame already has a valid copy there.
//! 5. Unlock the entry and wake every thread waiting on the address space.
//!
//! If the write fails the entry is remapped and unlocked, and the caller
//! restores the frame, so a failed eviction leaves nothing behind.

use core::sync::atomic::Ordering;

use crate::error::{VmError, VmResult};
use crate::kern::sched_prim::WaitReason;
use crate::vm::vm_page::{FrameState, Selection, VictimFrame, VictimPolicy};
use crate::vm::VmSystem;

impl VmSystem {
    /// Take a victim frame away from the page that owns it
    pub(crate) fn evict(&self, victim: &VictimFrame) -> VmResult<()> {
        if !matches!(victim.prior, FrameState::Clean | FrameState::Dirty) {
            return Ok(());
        }
        let Some(owner) = victim.owner.as_ref() else {
            return Ok(());
        };
        let Some(aspace) = owner.aspace.upgrade() else {
            log::debug!("evict: frame {} belongs to a dead address space", victim.frame);
            return Ok(());
        };
        let vaddr = owner.vaddr;

        loop {
            let mut pt = aspace.page_table.lock();
            match pt.lookup_mut(vaddr) {
                Some(pte) if pte.frame == Some(victim.frame) => {
                    if pte.locked {
                        aspace.swap_wc.sleep_releasing(pt, WaitReason::VmPage);
                        continue;
                    }
                    pte.locked = true;
                    break;
                }
                _ => {
                    log::debug!("evict: frame {} released by its page", victim.frame);
                    return Ok(());
                }
            }
        }

        self.cpus.tlbshootdown(aspace.id(), vaddr);

        let (slot, on_disk) = {
            let mut pt = aspace.page_table.lock();
            let pte = pt.locked_entry(vaddr);
            pte.frame = None;
            (pte.swap_slot, pte.on_disk)
        };

        let written = match victim.prior {
            FrameState::Dirty => self.page_out(victim.frame, slot),
            _ => {
                assert!(on_disk, "clean frame {} has no copy on swap", victim.frame);
                slot.ok_or(VmError::SwapExhausted)
            }
        };

        {
            let mut pt = aspace.page_table.lock();
            let pte = pt.locked_entry(vaddr);
            match written {
                Ok(slot) => {
                    pte.swap_slot = Some(slot);
                    pte.on_disk = true;
                }
                Err(_) => pte.frame = Some(victim.frame),
            }
            pte.locked = false;
        }
        aspace.swap_wc.wakeup_all();

        written?;
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        if victim.prior == FrameState::Clean {
            self.stats.clean_evictions.fetch_add(1, Ordering::Relaxed);
        }
        log::debug!(
            "evict: frame {} from as {} page {:#x} ({:?})",
            victim.frame,
            owner.asid.0,
            vaddr,
            victim.prior
        );
        Ok(())
    }

    /// Write a dirty frame to swap, reserving a slot if needed
    fn page_out(&self, frame: usize, slot: Option<usize>) -> VmResult<usize> {
        let (slot, fresh) = match slot {
            Some(slot) => (slot, false),
            None => (self.swap.reserve_slot()?, true),
        };
        if let Err(e) = self.swap.write_out(&self.ram, frame, slot) {
            if fresh {
                self.swap.release_slot(slot);
            }
            return Err(e);
        }
        self.stats.page_outs.fetch_add(1, Ordering::Relaxed);
        Ok(slot)
    }

    /// Evict a contiguous run; on failure frames already evicted are freed and
    /// the rest are put back
    pub(crate) fn evict_run(&self, victims: &[VictimFrame]) -> VmResult<()> {
        let coremap = self.coremap()?;
        for (i, victim) in victims.iter().enumerate() {
            if let Err(e) = self.evict(victim) {
                coremap.release_victims(&victims[..i]);
                coremap.restore(&victims[i..]);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Get a frame for a user page, evicting if memory is full
    ///
    /// The frame comes back held (`Victim`, no owner); the caller fills it
    /// and assigns it to a page.
    pub(crate) fn page_alloc(&self) -> VmResult<usize> {
        let coremap = self.coremap()?;
        let mut policy = VictimPolicy::AnyReclaimable;
        loop {
            match coremap.select_page(policy) {
                Selection::Ready(victim) => match self.evict(&victim) {
                    Ok(()) => {
                        coremap.disown(victim.frame);
                        return Ok(victim.frame);
                    }
                    Err(VmError::SwapExhausted) if policy == VictimPolicy::AnyReclaimable => {
                        log::warn!("page_alloc: swap full, reclaiming clean frames only");
                        coremap.restore(core::slice::from_ref(&victim));
                        policy = VictimPolicy::CleanOnly;
                    }
                    Err(e) => {
                        coremap.restore(core::slice::from_ref(&victim));
                        return Err(e);
                    }
                },
                Selection::Wait(ticket) => coremap.wchan().sleep(ticket, WaitReason::VmFrame),
                Selection::Exhausted => {
                    log::warn!("page_alloc: no reclaimable frame ({:?})", policy);
                    return Err(VmError::OutOfMemory);
                }
            }
        }
    }
}
