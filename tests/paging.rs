//! Demand paging through the swap store

mod common;

use common::{assert_consistent, check_pages, heap_space, machine, pattern, write_pages};
use demand_vm::kern::copyio::{copyin, copyout, fuword32, suword32};
use demand_vm::kern::CpuId;
use demand_vm::vm::PAGE_SIZE;

const CPU0: CpuId = CpuId(0);

#[test]
fn test_pages_survive_a_trip_through_swap() {
    let m = machine(16, 1, 64);
    let vm = &m.vm;
    let (aspace, heap) = heap_space(vm, CPU0, 24);

    write_pages(vm, CPU0, heap, 24, 1);
    let after_write = vm.stats();
    assert!(after_write.page_outs > 0);
    assert!(aspace.ptes().iter().any(|pte| pte.on_disk && pte.frame.is_none()));
    assert_consistent(vm, &[&aspace]);

    check_pages(vm, CPU0, heap, 24, 1);
    let after_read = vm.stats();
    assert!(after_read.page_ins > 0);
    assert!(m.disk.reads() > 0);
    assert_consistent(vm, &[&aspace]);
}

#[test]
fn test_twice_overcommitted_memory() {
    let m = machine(32, 1, 128);
    let vm = &m.vm;
    let pages = 64;
    let (aspace, heap) = heap_space(vm, CPU0, pages);

    write_pages(vm, CPU0, heap, pages, 2);
    check_pages(vm, CPU0, heap, pages, 2);
    check_pages(vm, CPU0, heap, pages, 2);

    let stats = vm.stats();
    assert!(stats.evictions > 0);
    assert!(stats.clean_evictions > 0, "re-reading should evict clean copies");
    assert_eq!(stats.failed_faults, 0);
    assert!(vm.swap().used() <= pages);
    assert_eq!(aspace.page_count(), pages);
    assert_consistent(vm, &[&aspace]);
}

#[test]
fn test_rewriting_a_clean_page_keeps_its_slot() {
    let m = machine(12, 1, 64);
    let vm = &m.vm;
    let (aspace, heap) = heap_space(vm, CPU0, 20);
    write_pages(vm, CPU0, heap, 20, 3);

    let swapped = aspace
        .ptes()
        .into_iter()
        .find(|pte| pte.on_disk && pte.frame.is_none())
        .unwrap();
    let slot = swapped.swap_slot.unwrap();

    // Read it back in: clean, still on disk
    let index = ((swapped.vaddr - heap) / PAGE_SIZE as u64) as usize;
    let expected = pattern(3, index);
    let word = u32::from_le_bytes([expected[0], expected[1], expected[2], expected[3]]);
    assert_eq!(fuword32(vm, CPU0, swapped.vaddr).unwrap(), word);
    let pte = aspace.pte(swapped.vaddr).unwrap();
    assert!(pte.is_resident());
    assert!(pte.on_disk);

    // Writing invalidates the copy on disk but not the slot
    suword32(vm, CPU0, swapped.vaddr, 0xdead_beef).unwrap();
    let pte = aspace.pte(swapped.vaddr).unwrap();
    assert!(!pte.on_disk);
    assert_eq!(pte.swap_slot, Some(slot));
    assert_consistent(vm, &[&aspace]);
}

#[test]
fn test_census_and_owners_agree_with_page_tables() {
    let m = machine(20, 1, 64);
    let vm = &m.vm;
    let (a, heap_a) = heap_space(vm, CPU0, 10);
    write_pages(vm, CPU0, heap_a, 10, 4);
    let (b, heap_b) = heap_space(vm, CPU0, 10);
    write_pages(vm, CPU0, heap_b, 10, 5);
    assert_consistent(vm, &[&a, &b]);

    vm.as_activate(CPU0, &a).unwrap();
    check_pages(vm, CPU0, heap_a, 10, 4);
    assert_consistent(vm, &[&a, &b]);

    let before = vm.census().unwrap();
    vm.as_destroy(&b);
    let after = vm.census().unwrap();
    assert!(after.free > before.free);
    assert_eq!(vm.swap().used(), a.swap_slots_held());
    assert_consistent(vm, &[&a]);
}

#[test]
fn test_kernel_run_evicts_user_pages() {
    let m = machine(16, 1, 64);
    let vm = &m.vm;
    let free = vm.census().unwrap().free;
    let (aspace, heap) = heap_space(vm, CPU0, free);
    write_pages(vm, CPU0, heap, free, 6);
    assert_eq!(vm.census().unwrap().free, 0);

    let kva = vm.alloc_kpages(4).unwrap();
    assert_eq!(vm.census().unwrap().fixed, 4 + vm.coremap().unwrap().first_managed());
    assert_consistent(vm, &[&aspace]);

    check_pages(vm, CPU0, heap, free, 6);
    vm.free_kpages(kva).unwrap();
    assert_consistent(vm, &[&aspace]);
}

#[test]
fn test_heap_shrink_releases_frames_and_slots() {
    let m = machine(12, 1, 64);
    let vm = &m.vm;
    let (aspace, heap) = heap_space(vm, CPU0, 20);
    write_pages(vm, CPU0, heap, 20, 7);
    let held = vm.swap().used();
    assert!(held > 0);

    let old = vm.as_grow_heap(&aspace, -(10 * PAGE_SIZE as i64)).unwrap();
    assert_eq!(old, heap + 20 * PAGE_SIZE as u64);
    // Pages 0..=10 remain; page 10 holds the new break
    assert_eq!(aspace.page_count(), 11);
    assert!(aspace.ptes().iter().all(|pte| pte.vaddr <= heap + 10 * PAGE_SIZE as u64));
    assert_consistent(vm, &[&aspace]);

    // Released pages come back zero-filled
    vm.as_grow_heap(&aspace, 10 * PAGE_SIZE as i64).unwrap();
    let mut buf = vec![0xffu8; PAGE_SIZE];
    copyin(vm, CPU0, heap + 15 * PAGE_SIZE as u64, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0));
    check_pages(vm, CPU0, heap, 10, 7);
    assert_consistent(vm, &[&aspace]);
}

#[test]
fn test_stack_grows_on_demand() {
    let m = machine(16, 1, 32);
    let vm = &m.vm;
    let (aspace, _) = heap_space(vm, CPU0, 1);
    let top = aspace.define_stack();

    for depth in 1..=4u64 {
        let addr = top - depth * PAGE_SIZE as u64;
        copyout(vm, CPU0, &depth.to_le_bytes(), addr).unwrap();
    }
    assert_eq!(aspace.stack_end(), top - 4 * PAGE_SIZE as u64);
    for depth in 1..=4u64 {
        let mut buf = [0u8; 8];
        copyin(vm, CPU0, top - depth * PAGE_SIZE as u64, &mut buf).unwrap();
        assert_eq!(u64::from_le_bytes(buf), depth);
    }
    assert_consistent(vm, &[&aspace]);
}
