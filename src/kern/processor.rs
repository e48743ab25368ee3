//! Processor Management and TLB Shootdown
//!
//! Based on Mach4 kern/processor.h/c
//!
//! Each simulated processor owns a TLB, the address space of the thread it
//! is running, and a mailbox for shootdown requests. Masking interrupts on a
//! processor (`splhigh`) is modeled by holding its state lock: while a thread
//! has interrupts masked, no inter-processor interrupt can be taken there.
//!
//! ## Shootdown protocol
//!
//! 1. The requester posts a `ShootdownRequest` into every processor's mailbox.
//! 2. It then raises the inter-processor interrupt on each processor. The
//!    interrupt is taken as soon as the target has interrupts enabled; the
//!    handler drains the mailbox, invalidates the translation if the request's
//!    address space is the one active there, and acknowledges the request.
//! 3. The requester does not return until every processor has acknowledged.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use heapless::Deque;
use spin::{Mutex, MutexGuard};

use super::sched_prim::cpu_relax;
use super::tlb::Tlb;
use crate::error::{VmError, VmResult};
use crate::vm::vm_map::{AddrSpace, AsId};
use crate::vm::vm_param::VAddr;

/// Pending shootdowns a processor can queue before requesters must wait
pub const MAILBOX_DEPTH: usize = 16;

// ============================================================================
// Processor ID
// ============================================================================

/// Processor identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(pub usize);

// ============================================================================
// Shootdown Request
// ============================================================================

/// Request to drop one translation from every processor
#[derive(Debug, Clone)]
pub struct ShootdownRequest {
    /// Address space the translation belongs to
    pub asid: AsId,
    /// Page being invalidated
    pub vaddr: VAddr,
    /// Processors that have not yet acknowledged
    pending: Arc<AtomicUsize>,
}

impl ShootdownRequest {
    fn acknowledge(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Processor State
// ============================================================================

/// State only touched with the processor's interrupts masked
#[derive(Debug)]
pub struct CpuState {
    /// Translation buffer
    pub tlb: Tlb,
    /// Address space of the running thread
    curas: Option<Arc<AddrSpace>>,
}

impl CpuState {
    pub fn curas(&self) -> Option<&Arc<AddrSpace>> {
        self.curas.as_ref()
    }

    /// Switch address spaces; the TLB has no ASID tags so it is flushed
    pub fn activate(&mut self, aspace: Option<Arc<AddrSpace>>) {
        self.curas = aspace;
        self.tlb.flush_all();
    }
}

/// Invalidate the requested translation if its address space is active here
pub fn vm_tlbshootdown(state: &mut CpuState, req: &ShootdownRequest) {
    let active = state.curas.as_ref().map(|a| a.id());
    if active == Some(req.asid) {
        state.tlb.invalidate_addr(req.vaddr);
    }
}

/// Flush every translation on the processor
pub fn vm_tlbshootdown_all(state: &mut CpuState) {
    state.tlb.flush_all();
}

// ============================================================================
// Interrupt Mask Guard
// ============================================================================

/// Interrupts stay masked on the processor until this guard is dropped
pub struct SplGuard<'a> {
    state: MutexGuard<'a, CpuState>,
}

impl Deref for SplGuard<'_> {
    type Target = CpuState;
    fn deref(&self) -> &CpuState {
        &self.state
    }
}

impl DerefMut for SplGuard<'_> {
    fn deref_mut(&mut self) -> &mut CpuState {
        &mut self.state
    }
}

// ============================================================================
// Processor
// ============================================================================

/// A simulated processor
#[derive(Debug)]
pub struct Processor {
    id: CpuId,
    state: Mutex<CpuState>,
    mailbox: Mutex<Deque<ShootdownRequest, MAILBOX_DEPTH>>,
    /// Shootdown requests handled here
    handled: AtomicU64,
}

impl Processor {
    pub fn new(id: CpuId, seed: u64) -> Self {
        Self {
            id,
            state: Mutex::new(CpuState {
                tlb: Tlb::new(seed ^ (id.0 as u64 + 1)),
                curas: None,
            }),
            mailbox: Mutex::new(Deque::new()),
            handled: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> CpuId {
        self.id
    }

    /// Mask interrupts on this processor
    pub fn splhigh(&self) -> SplGuard<'_> {
        SplGuard {
            state: self.state.lock(),
        }
    }

    /// Address space currently active on this processor
    pub fn curas(&self) -> Option<Arc<AddrSpace>> {
        self.splhigh().curas().cloned()
    }

    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    fn post(&self, mut req: ShootdownRequest) {
        loop {
            let pushed = self.mailbox.lock().push_back(req);
            match pushed {
                Ok(()) => return,
                Err(back) => {
                    req = back;
                    self.deliver();
                    cpu_relax();
                }
            }
        }
    }

    /// Raise the inter-processor interrupt; false if interrupts are masked here
    pub fn deliver(&self) -> bool {
        match self.state.try_lock() {
            Some(mut state) => {
                self.interprocessor_interrupt(&mut state);
                true
            }
            None => false,
        }
    }

    fn interprocessor_interrupt(&self, state: &mut CpuState) {
        loop {
            let next = self.mailbox.lock().pop_front();
            let Some(req) = next else { break };
            vm_tlbshootdown(state, &req);
            self.handled.fetch_add(1, Ordering::Relaxed);
            req.acknowledge();
        }
    }
}

// ============================================================================
// Processor Set
// ============================================================================

/// All processors of the machine
#[derive(Debug)]
pub struct Processors {
    cpus: Vec<Processor>,
    shootdowns: AtomicU64,
}

impl Processors {
    pub fn new(ncpus: usize, seed: u64) -> Self {
        Self {
            cpus: (0..ncpus).map(|i| Processor::new(CpuId(i), seed)).collect(),
            shootdowns: AtomicU64::new(0),
        }
    }

    pub fn get(&self, id: CpuId) -> VmResult<&Processor> {
        self.cpus.get(id.0).ok_or(VmError::NoSuchCpu(id.0))
    }

    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Processor> {
        self.cpus.iter()
    }

    /// Shootdowns issued so far
    pub fn shootdowns(&self) -> u64 {
        self.shootdowns.load(Ordering::Relaxed)
    }

    /// Invalidate `(asid, vaddr)` on every processor and wait for all acks
    ///
    /// Must not be called with interrupts masked on any processor.
    pub fn tlbshootdown(&self, asid: AsId, vaddr: VAddr) {
        let pending = Arc::new(AtomicUsize::new(self.cpus.len()));
        for cpu in &self.cpus {
            cpu.post(ShootdownRequest {
                asid,
                vaddr,
                pending: Arc::clone(&pending),
            });
        }
        while pending.load(Ordering::SeqCst) > 0 {
            for cpu in &self.cpus {
                cpu.deliver();
            }
            if pending.load(Ordering::SeqCst) > 0 {
                cpu_relax();
            }
        }
        self.shootdowns.fetch_add(1, Ordering::Relaxed);
    }

    /// Flush the TLB of every processor `asid` is active on
    pub fn flush_address_space(&self, asid: AsId) {
        for cpu in &self.cpus {
            let mut spl = cpu.splhigh();
            if spl.curas().map(|a| a.id()) == Some(asid) {
                vm_tlbshootdown_all(&mut spl);
            }
        }
    }

    /// Clear `asid` from every processor it is active on
    pub fn deactivate_everywhere(&self, asid: AsId) {
        for cpu in &self.cpus {
            let mut spl = cpu.splhigh();
            if spl.curas().map(|a| a.id()) == Some(asid) {
                spl.activate(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::tlb::TlbEntry;

    #[test]
    fn test_cpu_lookup() {
        let cpus = Processors::new(2, 1);
        assert_eq!(cpus.len(), 2);
        assert!(cpus.get(CpuId(1)).is_ok());
        assert_eq!(cpus.get(CpuId(2)).err(), Some(VmError::NoSuchCpu(2)));
    }

    #[test]
    fn test_shootdown_skips_inactive_address_space() {
        let cpus = Processors::new(2, 1);
        {
            let mut spl = cpus.get(CpuId(0)).unwrap().splhigh();
            spl.tlb.install(TlbEntry::new(0x40_0000, 9, true));
        }
        // Nothing is active, so the entry is left alone but every cpu acks
        cpus.tlbshootdown(AsId(5), 0x40_0000);
        let spl = cpus.get(CpuId(0)).unwrap().splhigh();
        assert_eq!(spl.tlb.valid_count(), 1);
        drop(spl);
        assert_eq!(cpus.shootdowns(), 1);
        assert!(cpus.iter().all(|c| c.handled() == 1));
    }
}
