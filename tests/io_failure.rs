//! Swap device failures

mod common;

use common::{assert_consistent, check_pages, heap_space, machine, write_pages};
use demand_vm::device::{IoError, RamDisk};
use demand_vm::kern::copyio::{copyin, copyout};
use demand_vm::kern::CpuId;
use demand_vm::vm::PAGE_SIZE;
use demand_vm::{FaultClass, VmConfig, VmError, VmSystem};

const CPU0: CpuId = CpuId(0);

#[test]
fn test_failed_page_out_rolls_back() {
    let m = machine(8, 1, 32);
    let vm = &m.vm;
    let managed = vm.census().unwrap().free;
    let (aspace, heap) = heap_space(vm, CPU0, managed + 3);
    write_pages(vm, CPU0, heap, managed, 1);

    m.disk.set_fail_writes(true);
    let next = heap + (managed * PAGE_SIZE) as u64;
    let err = copyout(vm, CPU0, &[0xaa; 16], next).unwrap_err();
    assert!(matches!(err, VmError::Io(IoError::Device { .. })));
    assert_eq!(err.class(), FaultClass::Io);

    assert_consistent(vm, &[&aspace]);
    assert_eq!(vm.swap().used(), 0);
    assert_eq!(aspace.resident_pages(), managed);
    let pte = aspace.pte(next).unwrap();
    assert!(!pte.is_resident() && !pte.locked);
    check_pages(vm, CPU0, heap, managed, 1);

    m.disk.set_fail_writes(false);
    write_pages(vm, CPU0, heap, managed + 3, 2);
    check_pages(vm, CPU0, heap, managed + 3, 2);
    assert_consistent(vm, &[&aspace]);
}

#[test]
fn test_failed_page_in_releases_the_frame() {
    let m = machine(8, 1, 32);
    let vm = &m.vm;
    let pages = 10;
    let (aspace, heap) = heap_space(vm, CPU0, pages);
    write_pages(vm, CPU0, heap, pages, 3);

    let swapped = aspace
        .ptes()
        .into_iter()
        .find(|pte| pte.on_disk && !pte.is_resident())
        .unwrap();

    m.disk.set_fail_reads(true);
    let mut buf = [0u8; 8];
    let err = copyin(vm, CPU0, swapped.vaddr, &mut buf).unwrap_err();
    assert_eq!(err.class(), FaultClass::Io);
    assert!(vm.stats().failed_faults > 0);

    assert_consistent(vm, &[&aspace]);
    let pte = aspace.pte(swapped.vaddr).unwrap();
    assert!(pte.on_disk && !pte.is_resident() && !pte.locked);
    assert_eq!(pte.swap_slot, swapped.swap_slot);

    m.disk.set_fail_reads(false);
    check_pages(vm, CPU0, heap, pages, 3);
    assert_consistent(vm, &[&aspace]);
}

#[test]
fn test_missing_swap_device() {
    let config = VmConfig::new().with_ram_frames(8).with_ncpus(1).with_swap_slots(16);
    let disk = RamDisk::new("lhd1raw:", config.swap_bytes());
    let vm = VmSystem::new(config, disk.opener()).unwrap();
    vm.vm_bootstrap().unwrap();

    let managed = vm.census().unwrap().free;
    let (aspace, heap) = heap_space(&vm, CPU0, managed + 1);
    write_pages(&vm, CPU0, heap, managed, 4);

    let err = copyout(&vm, CPU0, &[1u8; 4], heap + (managed * PAGE_SIZE) as u64).unwrap_err();
    assert_eq!(err, VmError::Io(IoError::NoSuchDevice));
    assert_consistent(&vm, &[&aspace]);
    check_pages(&vm, CPU0, heap, managed, 4);
}
