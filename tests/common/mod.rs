//! Shared machine setup for the integration tests

#![allow(dead_code)]

use std::sync::Arc;

use demand_vm::device::RamDisk;
use demand_vm::kern::copyio::{copyin, copyout};
use demand_vm::kern::CpuId;
use demand_vm::vm::{AddrSpace, FrameState, VmProt, PAGE_SIZE};
use demand_vm::{VmConfig, VmSystem};

/// Base of the one-page text region every test space gets
pub const TEXT_BASE: u64 = 0x40_0000;

pub struct Machine {
    pub vm: VmSystem,
    pub disk: Arc<RamDisk>,
}

pub fn machine(frames: usize, ncpus: usize, slots: usize) -> Machine {
    machine_with(VmConfig::new().with_ram_frames(frames).with_ncpus(ncpus).with_swap_slots(slots))
}

pub fn machine_with(config: VmConfig) -> Machine {
    let _ = demand_vm::logging::init(config.log_level);
    let disk = RamDisk::new(config.swap_name, config.swap_bytes());
    let vm = VmSystem::new(config, disk.opener()).unwrap();
    vm.vm_bootstrap().unwrap();
    Machine { vm, disk }
}

/// New space with a read-only text page and `pages` pages of heap, active on `cpu`
///
/// Returns the space and the first heap address.
pub fn heap_space(vm: &VmSystem, cpu: CpuId, pages: usize) -> (Arc<AddrSpace>, u64) {
    let aspace = vm.as_create();
    aspace
        .define_region(TEXT_BASE, PAGE_SIZE as u64, VmProt::READ | VmProt::EXECUTE)
        .unwrap();
    vm.as_activate(cpu, &aspace).unwrap();
    let heap = vm.as_grow_heap(&aspace, (pages * PAGE_SIZE) as i64).unwrap();
    (aspace, heap)
}

/// Page contents tagged with an owner and a page index
pub fn pattern(tag: u8, index: usize) -> Vec<u8> {
    (0..PAGE_SIZE)
        .map(|i| tag.wrapping_mul(31) ^ (index as u8).wrapping_add(i as u8).wrapping_mul(7))
        .collect()
}

pub fn write_pages(vm: &VmSystem, cpu: CpuId, base: u64, pages: usize, tag: u8) {
    for i in 0..pages {
        copyout(vm, cpu, &pattern(tag, i), base + (i * PAGE_SIZE) as u64).unwrap();
    }
}

pub fn check_pages(vm: &VmSystem, cpu: CpuId, base: u64, pages: usize, tag: u8) {
    let mut buf = vec![0u8; PAGE_SIZE];
    for i in 0..pages {
        copyin(vm, cpu, base + (i * PAGE_SIZE) as u64, &mut buf).unwrap();
        assert!(buf == pattern(tag, i), "page {} of tag {} corrupted", i, tag);
    }
}

/// Cross-check the coremap, the page tables and the swap bitmap
///
/// Only meaningful while no fault, eviction or copy is in flight.
pub fn assert_consistent(vm: &VmSystem, spaces: &[&Arc<AddrSpace>]) {
    let coremap = vm.coremap().unwrap();
    let census = vm.census().unwrap();
    assert_eq!(census.total(), vm.config().ram_frames);
    assert_eq!(census.victim, 0, "frame left in transition");
    assert_eq!(census.wired, 0, "frame left wired");

    let mut resident = 0;
    let mut slots = 0;
    for aspace in spaces {
        for pte in aspace.ptes() {
            assert!(!pte.locked, "page {:#x} left locked", pte.vaddr);
            if pte.on_disk {
                assert!(pte.swap_slot.is_some());
            }
            if let Some(slot) = pte.swap_slot {
                assert!(vm.swap().is_used(slot));
                slots += 1;
            }
            if let Some(frame) = pte.frame {
                resident += 1;
                assert_eq!(coremap.owner_of(frame), Some((aspace.id(), pte.vaddr)));
                match coremap.state_of(frame) {
                    Some(FrameState::Clean) => assert!(pte.on_disk),
                    Some(FrameState::Dirty) => {}
                    other => panic!("mapped frame {} in state {:?}", frame, other),
                }
            }
        }
    }
    assert_eq!(census.clean + census.dirty, resident);
    assert_eq!(vm.swap().used(), slots);
}
