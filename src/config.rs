//! VM configuration
//!
//! All sizing knobs of the simulated machine and the tunables of the
//! replacement policy. Defaults model a small OS/161-class machine: 2MB of
//! RAM, four CPUs and a 2000-slot swap disk.

use log::LevelFilter;

use crate::error::{VmError, VmResult};
use crate::vm::vm_param::{HEAP_MAX, MAX_SWAP_PG_NUM, PAGE_SIZE, STACK_MAX};

/// Default number of physical frames (2MB)
pub const DEFAULT_RAM_FRAMES: usize = 512;

/// Default number of simulated processors
pub const DEFAULT_NCPUS: usize = 4;

/// Default swap object name
pub const DEFAULT_SWAP_NAME: &str = "lhd0raw:";

/// Clean candidates required before dirty ones are considered
pub const DEFAULT_CLEAN_WATERMARK: usize = 4;

/// Random probes before the multi-frame allocator falls back to a linear scan
pub const DEFAULT_MAX_PROBES: usize = 16;

/// Default cap on page table entries per address space
pub const DEFAULT_MAX_PTES: usize = 1 << 20;

/// VM system configuration
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Physical frames in the machine
    pub ram_frames: usize,
    /// Simulated processors
    pub ncpus: usize,
    /// Slots on the swap object
    pub swap_slots: usize,
    /// Name handed to the swap opener on first use
    pub swap_name: &'static str,
    /// Minimum clean eviction candidates before dirty ones are accepted
    pub clean_watermark: usize,
    /// Random probes per multi-frame eviction search
    pub max_probes: usize,
    /// Absolute heap size ceiling in bytes
    pub heap_max: u64,
    /// Maximum stack depth in bytes, measured from USERSTACK
    pub stack_max: u64,
    /// Page table entries an address space may hold
    pub max_page_table_entries: usize,
    /// Seed for victim selection and TLB random replacement
    pub rng_seed: u64,
    /// Level applied by `logging::init`
    pub log_level: LevelFilter,
}

impl VmConfig {
    /// Default configuration
    pub const fn new() -> Self {
        Self {
            ram_frames: DEFAULT_RAM_FRAMES,
            ncpus: DEFAULT_NCPUS,
            swap_slots: MAX_SWAP_PG_NUM,
            swap_name: DEFAULT_SWAP_NAME,
            clean_watermark: DEFAULT_CLEAN_WATERMARK,
            max_probes: DEFAULT_MAX_PROBES,
            heap_max: HEAP_MAX,
            stack_max: STACK_MAX,
            max_page_table_entries: DEFAULT_MAX_PTES,
            rng_seed: 0x9E37_79B9_7F4A_7C15,
            log_level: LevelFilter::Warn,
        }
    }

    pub const fn with_ram_frames(mut self, frames: usize) -> Self {
        self.ram_frames = frames;
        self
    }

    pub const fn with_ncpus(mut self, ncpus: usize) -> Self {
        self.ncpus = ncpus;
        self
    }

    pub const fn with_swap_slots(mut self, slots: usize) -> Self {
        self.swap_slots = slots;
        self
    }

    pub const fn with_swap_name(mut self, name: &'static str) -> Self {
        self.swap_name = name;
        self
    }

    pub const fn with_clean_watermark(mut self, watermark: usize) -> Self {
        self.clean_watermark = watermark;
        self
    }

    pub const fn with_max_probes(mut self, probes: usize) -> Self {
        self.max_probes = probes;
        self
    }

    pub const fn with_heap_max(mut self, bytes: u64) -> Self {
        self.heap_max = bytes;
        self
    }

    pub const fn with_stack_max(mut self, bytes: u64) -> Self {
        self.stack_max = bytes;
        self
    }

    pub const fn with_max_page_table_entries(mut self, entries: usize) -> Self {
        self.max_page_table_entries = entries;
        self
    }

    pub const fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = seed;
        self
    }

    pub const fn with_log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }

    /// Bytes of swap backing store the configuration needs
    pub const fn swap_bytes(&self) -> u64 {
        (self.swap_slots * PAGE_SIZE) as u64
    }

    /// Reject configurations the VM cannot run with
    pub fn validate(&self) -> VmResult<()> {
        if self.ram_frames < 4 || self.ncpus == 0 {
            return Err(VmError::InvalidArgument);
        }
        if self.max_page_table_entries == 0 {
            return Err(VmError::InvalidArgument);
        }
        if self.stack_max < PAGE_SIZE as u64 || self.stack_max % PAGE_SIZE as u64 != 0 {
            return Err(VmError::InvalidArgument);
        }
        Ok(())
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a level name the way the boot command line spells it
pub fn level_from_str(name: &str) -> LevelFilter {
    match name {
        "ERROR" | "error" => LevelFilter::Error,
        "WARN" | "warn" => LevelFilter::Warn,
        "INFO" | "info" => LevelFilter::Info,
        "DEBUG" | "debug" => LevelFilter::Debug,
        "TRACE" | "trace" => LevelFilter::Trace,
        _ => LevelFilter::Off,
    }
}
