//! Address space duplication

mod common;

use std::collections::BTreeSet;

use common::{assert_consistent, check_pages, heap_space, machine, pattern, write_pages};
use demand_vm::kern::copyio::copyin;
use demand_vm::kern::CpuId;
use demand_vm::vm::PAGE_SIZE;
use demand_vm::FaultClass;

const CPU0: CpuId = CpuId(0);
const CPU1: CpuId = CpuId(1);

#[test]
fn test_child_is_isolated_from_parent() {
    let m = machine(16, 2, 128);
    let vm = &m.vm;
    let (parent, heap) = heap_space(vm, CPU0, 20);
    write_pages(vm, CPU0, heap, 20, 1);
    assert!(parent.ptes().iter().any(|pte| pte.on_disk && pte.frame.is_none()));

    let child = vm.as_copy(&parent).unwrap();
    assert_ne!(child.id(), parent.id());
    assert_eq!(child.heap_bounds(), parent.heap_bounds());
    assert_eq!(child.page_count(), parent.page_count());
    assert_consistent(vm, &[&parent, &child]);

    let parent_slots: BTreeSet<usize> = parent.ptes().iter().filter_map(|p| p.swap_slot).collect();
    let child_slots: BTreeSet<usize> = child.ptes().iter().filter_map(|p| p.swap_slot).collect();
    assert!(parent_slots.is_disjoint(&child_slots));

    vm.as_activate(CPU1, &child).unwrap();
    check_pages(vm, CPU1, heap, 20, 1);
    write_pages(vm, CPU1, heap, 20, 2);

    check_pages(vm, CPU0, heap, 20, 1);
    check_pages(vm, CPU1, heap, 20, 2);
    assert_consistent(vm, &[&parent, &child]);

    vm.as_destroy(&child);
    assert_eq!(vm.swap().used(), parent.swap_slots_held());
    check_pages(vm, CPU0, heap, 20, 1);
    assert_consistent(vm, &[&parent]);
}

#[test]
fn test_failed_copy_leaves_parent_intact() {
    // 15 usable frames and 10 slots cannot hold two copies of 24 pages
    let m = machine(16, 1, 10);
    let vm = &m.vm;
    let (parent, heap) = heap_space(vm, CPU0, 24);
    write_pages(vm, CPU0, heap, 24, 3);
    let census_before = vm.census().unwrap();

    let err = vm.as_copy(&parent).unwrap_err();
    assert_eq!(err.class(), FaultClass::Resource);
    assert_consistent(vm, &[&parent]);
    assert_eq!(vm.census().unwrap().total(), census_before.total());
    assert_eq!(parent.page_count(), 24);

    let mut buf = vec![0u8; PAGE_SIZE];
    for pte in parent.ptes().into_iter().filter(|pte| pte.is_resident()) {
        let index = ((pte.vaddr - heap) / PAGE_SIZE as u64) as usize;
        copyin(vm, CPU0, pte.vaddr, &mut buf).unwrap();
        assert!(buf == pattern(3, index), "page {} corrupted by failed copy", index);
    }
}

#[test]
fn test_copy_of_unloaded_space() {
    let m = machine(16, 1, 16);
    let vm = &m.vm;
    let (parent, heap) = heap_space(vm, CPU0, 4);
    let child = vm.as_copy(&parent).unwrap();
    assert_eq!(child.page_count(), 0);
    assert_eq!(child.regions(), parent.regions());

    vm.as_activate(CPU0, &child).unwrap();
    write_pages(vm, CPU0, heap, 4, 9);
    assert_eq!(parent.page_count(), 0);
    assert_consistent(vm, &[&parent, &child]);
}
