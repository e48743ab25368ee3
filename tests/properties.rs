//! Property tests for heap bounds and frame accounting

mod common;

use common::{heap_space, machine_with};
use demand_vm::kern::copyio::copyout;
use demand_vm::kern::CpuId;
use demand_vm::vm::PAGE_SIZE;
use demand_vm::{VmConfig, VmError};
use proptest::prelude::*;

const HEAP_PAGES: u64 = 16;

#[derive(Debug, Clone)]
enum KernelOp {
    Alloc(usize),
    Free(usize),
}

fn kernel_op() -> impl Strategy<Value = KernelOp> {
    prop_oneof![
        (1usize..5).prop_map(KernelOp::Alloc),
        (0usize..8).prop_map(KernelOp::Free),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_heap_break_stays_in_bounds(deltas in prop::collection::vec(-40_000i64..40_000, 1..24)) {
        let config = VmConfig::new()
            .with_ram_frames(32)
            .with_ncpus(1)
            .with_swap_slots(32)
            .with_heap_max(HEAP_PAGES * PAGE_SIZE as u64);
        let m = machine_with(config);
        let vm = &m.vm;
        let (aspace, start) = heap_space(vm, CpuId(0), 0);
        let ceiling = start + HEAP_PAGES * PAGE_SIZE as u64;

        for delta in deltas {
            let (_, before) = aspace.heap_bounds();
            let wanted = before as i64 + delta;
            let result = vm.as_grow_heap(&aspace, delta);
            let (_, after) = aspace.heap_bounds();

            if wanted >= start as i64 && wanted <= ceiling as i64 {
                prop_assert_eq!(result, Ok(before));
                prop_assert_eq!(after, wanted as u64);
            } else {
                prop_assert_eq!(result, Err(VmError::OutOfMemory));
                prop_assert_eq!(after, before);
            }

            if after > start {
                prop_assert!(copyout(vm, CpuId(0), &[0x5a], after - 1).is_ok());
            }
            prop_assert!(aspace.ptes().iter().all(|pte| pte.vaddr <= after));
        }
    }

    #[test]
    fn test_kernel_runs_keep_census_whole(ops in prop::collection::vec(kernel_op(), 1..32)) {
        let config = VmConfig::new().with_ram_frames(24).with_ncpus(1).with_swap_slots(8);
        let m = machine_with(config);
        let vm = &m.vm;
        let reserved = vm.coremap().unwrap().first_managed();
        let mut live: Vec<(u64, usize)> = Vec::new();

        for op in ops {
            match op {
                KernelOp::Alloc(n) => match vm.alloc_kpages(n) {
                    Ok(kva) => live.push((kva, n)),
                    Err(e) => prop_assert_eq!(e, VmError::OutOfMemory),
                },
                KernelOp::Free(i) if !live.is_empty() => {
                    let (kva, _) = live.remove(i % live.len());
                    prop_assert!(vm.free_kpages(kva).is_ok());
                }
                KernelOp::Free(_) => {}
            }
            let census = vm.census().unwrap();
            let held: usize = live.iter().map(|&(_, n)| n).sum();
            prop_assert_eq!(census.total(), 24);
            prop_assert_eq!(census.fixed, reserved + held);
            prop_assert_eq!(census.free, 24 - reserved - held);
        }
    }
}
