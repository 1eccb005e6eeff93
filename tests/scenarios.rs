//! Integration tests for the literal scenarios and invariants named in the
//! spec: static warm-up (S1), feasibility (invariant 1), and static
//! idempotence (invariant 2).

use resalloc::allocator::{denormalize_all, static_allocation};
use resalloc::types::ResourceScale;
use std::collections::BTreeMap;

fn s1_scale() -> ResourceScale {
    ResourceScale {
        cache_total_mb: 10240,
        min_cache_mb: 1024,
        max_cache_mb: 10240,
        mem_bw_total_mbps: 7680,
        min_mem_bw_mbps: 768,
        max_mem_bw_mbps: 7680,
    }
}

#[test]
fn s1_static_warm_up_two_apps_one_vm() {
    let mut vm_map = BTreeMap::new();
    vm_map.insert(1u32, vec![1u32, 2u32]);

    let alloc = static_allocation(&vm_map, &[1, 2], 1);
    let scale = s1_scale();
    let denorm = denormalize_all(&alloc, &scale);

    assert_eq!(denorm[&1].cache_mb, 5120);
    assert_eq!(denorm[&1].mem_bw_mbps, 3840);
    assert_eq!(denorm[&2].cache_mb, 5120);
    assert_eq!(denorm[&2].mem_bw_mbps, 3840);
}

#[test]
fn invariant_feasibility_holds_for_static_allocation_across_vms() {
    let mut vm_map = BTreeMap::new();
    vm_map.insert(1u32, vec![1u32, 2u32, 3u32]);
    vm_map.insert(2u32, vec![4u32]);

    let alloc = static_allocation(&vm_map, &[1, 2, 3, 4], 2);

    for apps in vm_map.values() {
        let sum_cache: f64 = apps.iter().map(|id| alloc[id].cache).sum();
        let sum_bw: f64 = apps.iter().map(|id| alloc[id].mem_bw).sum();
        assert!(sum_cache <= 1.0 + 1e-6);
        assert!(sum_bw <= 1.0 + 1e-6);
    }
}

#[test]
fn invariant_static_idempotence_floors_equal_division() {
    let mut vm_map = BTreeMap::new();
    vm_map.insert(1u32, vec![1u32, 2u32, 3u32]);

    let alloc = static_allocation(&vm_map, &[1, 2, 3], 1);
    let scale = ResourceScale {
        cache_total_mb: 10000,
        min_cache_mb: 0,
        max_cache_mb: 10000,
        mem_bw_total_mbps: 7000,
        min_mem_bw_mbps: 0,
        max_mem_bw_mbps: 7000,
    };
    let denorm = denormalize_all(&alloc, &scale);

    for id in [1u32, 2, 3] {
        assert_eq!(denorm[&id].cache_mb, 10000 / 3);
        assert_eq!(denorm[&id].mem_bw_mbps, 7000 / 3);
    }
}
