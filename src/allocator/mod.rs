//! Allocator policies: market-clearing (Spirit), performance-feedback
//! (Incremental Trade), pairwise fair trade (Fij Trade), oracle static
//! assignment, and equal static split.
//!
//! Grounded on `allocators/allocator_base.py::ResourceAllocator` for the
//! shared scaffolding (warm-up detection, static fallback, denormalization)
//! and `allocators/*_allocator.py` for each policy. Per Design Notes §9,
//! policy subclasses are replaced with a tagged union; the scaffolding
//! below is free functions shared across variants rather than base-class
//! methods.

pub mod fij;
pub mod incremental;
pub mod oracle;
pub mod spirit;
pub mod static_alloc;

use crate::config::{Config, ProfileConfig};
use crate::estimator::Estimator;
use crate::monitor::Monitor;
use crate::types::{Allocation, AppId, NormAlloc, ResourceScale, VmId};
use std::collections::BTreeMap;

pub const INIT_PHASE_INTERVAL: u64 = 2;

/// Per-iteration context shared by every policy's `allocate_and_parse`.
pub struct AllocatorContext<'a> {
    pub monitor: &'a Monitor,
    pub estimator: Estimator<'a>,
    pub config: &'a Config,
    pub scale: ResourceScale,
    pub epsilon: f64,
}

/// The tagged union of supported allocation policies.
pub enum Policy {
    Spirit(spirit::SpiritState),
    IncrementalTrade(incremental::IncrementalState),
    FijTrade(fij::FijState),
    Oracle,
    Static,
}

impl Policy {
    pub fn name(&self) -> &'static str {
        match self {
            Policy::Spirit(_) => "spirit",
            Policy::IncrementalTrade(_) => "inc-trade",
            Policy::FijTrade(_) => "fij-trade",
            Policy::Oracle => "oracle",
            Policy::Static => "static",
        }
    }
}

/// Runs the warm-up check (§4.D.6); if true, the caller should publish the
/// static split this iteration instead of running the dynamic policy.
pub fn needs_warmup(ctx: &AllocatorContext, app_ids: &[AppId]) -> bool {
    for &app_id in app_ids {
        if ctx.monitor.get_total_records(app_id) < INIT_PHASE_INTERVAL {
            return true;
        }
    }
    false
}

/// True when the monitor's VM map covers every configured app; policies
/// degrade to the static split across `num_vms` virtual buckets otherwise.
pub fn is_complete_vm_map(vm_map: &BTreeMap<VmId, Vec<AppId>>, app_ids: &[AppId]) -> bool {
    let mapped: std::collections::BTreeSet<AppId> = vm_map.values().flatten().copied().collect();
    app_ids.iter().all(|id| mapped.contains(id))
}

/// Equal division within each VM (or `num_vms` virtual buckets when the
/// map is incomplete), normalized.
pub fn static_allocation(
    vm_map: &BTreeMap<VmId, Vec<AppId>>,
    app_ids: &[AppId],
    num_vms: u32,
) -> BTreeMap<AppId, NormAlloc> {
    let mut result = BTreeMap::new();
    if is_complete_vm_map(vm_map, app_ids) && !vm_map.is_empty() {
        for apps in vm_map.values() {
            let n = apps.len().max(1) as f64;
            for &app_id in apps {
                result.insert(app_id, NormAlloc::new(1.0 / n, 1.0 / n));
            }
        }
    } else {
        let n = app_ids.len().max(1) as f64;
        let buckets = num_vms.max(1) as f64;
        let per_bucket = (n / buckets).max(1.0);
        for &app_id in app_ids {
            result.insert(app_id, NormAlloc::new(1.0 / per_bucket, 1.0 / per_bucket));
        }
    }
    result
}

/// `cache_MB = normalized * cache_total_MB` (integer), `mem_bw_Mbps =
/// normalized * mem_bw_total_Mbps` (integer), per app.
pub fn denormalize_all(
    alloc: &BTreeMap<AppId, NormAlloc>,
    scale: &ResourceScale,
) -> BTreeMap<AppId, Allocation> {
    alloc
        .iter()
        .map(|(&id, norm)| (id, norm.denormalize(scale)))
        .collect()
}

/// If the total exceeds 1.0 for either resource, divides every entry by
/// the total so the VM's sums settle at exactly 1.0.
pub fn normalize_vm(alloc: &mut BTreeMap<AppId, NormAlloc>) {
    let total_cache: f64 = alloc.values().map(|a| a.cache).sum();
    let total_bw: f64 = alloc.values().map(|a| a.mem_bw).sum();
    if total_cache > 1.0 {
        for v in alloc.values_mut() {
            v.cache /= total_cache;
        }
    }
    if total_bw > 1.0 {
        for v in alloc.values_mut() {
            v.mem_bw /= total_bw;
        }
    }
}

pub fn profile_by_id<'a>(config: &'a Config, app_id: AppId) -> Option<&'a ProfileConfig> {
    config.profiles.iter().find(|p| p.user_id == app_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_allocation_splits_equally_within_a_vm() {
        let mut vm_map = BTreeMap::new();
        vm_map.insert(1, vec![10, 20]);
        let alloc = static_allocation(&vm_map, &[10, 20], 1);
        assert_eq!(alloc[&10], NormAlloc::new(0.5, 0.5));
        assert_eq!(alloc[&20], NormAlloc::new(0.5, 0.5));
    }

    #[test]
    fn static_allocation_falls_back_to_num_vms_buckets_when_map_incomplete() {
        let vm_map = BTreeMap::new();
        let alloc = static_allocation(&vm_map, &[1, 2, 3, 4], 2);
        for a in alloc.values() {
            assert!((a.cache - 0.5).abs() < 1e-9);
        }
    }

    #[test]
    fn normalize_vm_rescales_when_over_budget() {
        let mut alloc = BTreeMap::new();
        alloc.insert(1u32, NormAlloc::new(0.7, 0.3));
        alloc.insert(2u32, NormAlloc::new(0.6, 0.3));
        normalize_vm(&mut alloc);
        let total: f64 = alloc.values().map(|a| a.cache).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }
}
