//! VM subsystem - Demand-paged virtual memory
//!
//! Based on Mach4 vm/ directory
//!
//! `VmSystem` owns the simulated machine (RAM, processors, swap object) and
//! every piece of VM state layered on it. The kernel uses one instance,
//! reached through `bootstrap` and `system`; tests build as many private
//! instances as they like.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::VmConfig;
use crate::device::SwapOpener;
use crate::error::{VmError, VmResult};
use crate::kern::processor::{CpuId, Processor, Processors};

pub mod pmap;
pub mod vm_fault;
pub mod vm_kern;
pub mod vm_map;
pub mod vm_page;
pub mod vm_pageout;
pub mod vm_param;
pub mod vm_swap;

pub use pmap::{PageTable, PageTableEntry};
pub use vm_fault::FaultType;
pub use vm_map::{AddrSpace, AsId, Region, VmProt};
pub use vm_page::{Census, Coremap, FrameState, Ram};
pub use vm_param::{PAGE_SIZE, USERSPACETOP, USERSTACK};
pub use vm_swap::SwapStore;

// ============================================================================
// Statistics
// ============================================================================

/// VM event counters
#[derive(Debug)]
pub struct VmStats {
    pub faults: AtomicU64,
    pub failed_faults: AtomicU64,
    pub zero_fills: AtomicU64,
    pub page_ins: AtomicU64,
    pub page_outs: AtomicU64,
    pub evictions: AtomicU64,
    pub clean_evictions: AtomicU64,
}

impl VmStats {
    pub const fn new() -> Self {
        Self {
            faults: AtomicU64::new(0),
            failed_faults: AtomicU64::new(0),
            zero_fills: AtomicU64::new(0),
            page_ins: AtomicU64::new(0),
            page_outs: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            clean_evictions: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> VmStatsSnapshot {
        VmStatsSnapshot {
            faults: self.faults.load(Ordering::Relaxed),
            failed_faults: self.failed_faults.load(Ordering::Relaxed),
            zero_fills: self.zero_fills.load(Ordering::Relaxed),
            page_ins: self.page_ins.load(Ordering::Relaxed),
            page_outs: self.page_outs.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            clean_evictions: self.clean_evictions.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of `VmStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmStatsSnapshot {
    pub faults: u64,
    pub failed_faults: u64,
    pub zero_fills: u64,
    pub page_ins: u64,
    pub page_outs: u64,
    pub evictions: u64,
    pub clean_evictions: u64,
}

// ============================================================================
// VM System
// ============================================================================

/// The VM subsystem and the machine it runs on
#[derive(Debug)]
pub struct VmSystem {
    pub(crate) config: VmConfig,
    pub(crate) ram: Ram,
    pub(crate) coremap: spin::Once<Coremap>,
    pub(crate) swap: SwapStore,
    pub(crate) cpus: Processors,
    pub(crate) next_asid: AtomicU64,
    pub(crate) stats: VmStats,
}

impl VmSystem {
    /// Build the machine; the coremap does not exist until `vm_bootstrap`
    pub fn new(config: VmConfig, opener: impl SwapOpener + 'static) -> VmResult<Self> {
        config.validate()?;
        Ok(Self {
            ram: Ram::new(config.ram_frames),
            coremap: spin::Once::new(),
            swap: SwapStore::new(config.swap_name, config.swap_slots, Box::new(opener)),
            cpus: Processors::new(config.ncpus, config.rng_seed),
            next_asid: AtomicU64::new(1),
            stats: VmStats::new(),
            config,
        })
    }

    /// Hand all memory not yet stolen to the coremap
    pub fn vm_bootstrap(&self) -> VmResult<()> {
        self.coremap
            .try_call_once(|| Coremap::bootstrap(&self.ram, &self.config))
            .map(|_| ())
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.coremap.is_completed()
    }

    pub fn coremap(&self) -> VmResult<&Coremap> {
        self.coremap.get().ok_or(VmError::NotBootstrapped)
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn ram(&self) -> &Ram {
        &self.ram
    }

    pub fn swap(&self) -> &SwapStore {
        &self.swap
    }

    pub fn cpus(&self) -> &Processors {
        &self.cpus
    }

    pub fn cpu(&self, id: CpuId) -> VmResult<&Processor> {
        self.cpus.get(id)
    }

    pub fn stats(&self) -> VmStatsSnapshot {
        self.stats.snapshot()
    }

    /// Frames in each state
    pub fn census(&self) -> VmResult<Census> {
        Ok(self.coremap()?.census())
    }

    /// Flush every translation on `cpu`
    pub fn vm_tlbshootdown_all(&self, cpu: CpuId) -> VmResult<()> {
        let processor = self.cpus.get(cpu)?;
        crate::kern::processor::vm_tlbshootdown_all(&mut processor.splhigh());
        Ok(())
    }
}

// ============================================================================
// Kernel Instance
// ============================================================================

static SYSTEM: spin::Once<VmSystem> = spin::Once::new();

/// Create and bootstrap the kernel's VM system; later calls return the first
pub fn bootstrap(
    config: VmConfig,
    opener: impl SwapOpener + 'static,
) -> VmResult<&'static VmSystem> {
    SYSTEM.try_call_once(|| {
        // An already installed logger only takes the new level
        let _ = crate::logging::init_from_config(&config);
        let vm = VmSystem::new(config, opener)?;
        vm.vm_bootstrap()?;
        Ok(vm)
    })
}

/// The kernel's VM system
pub fn system() -> VmResult<&'static VmSystem> {
    SYSTEM.get().ok_or(VmError::NotBootstrapped)
}
