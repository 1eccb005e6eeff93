//! Oracle allocator: reads the literal `oracle_allocation` from each app's
//! profile, renormalizing per-VM when totals exceed capacity; falls back
//! to a sensitivity-bucket split when a profile omits it.
//!
//! Grounded on `allocators/oracle_allocator.py::OracleAllocator`.

use super::{static_allocation, AllocatorContext};
use crate::types::{AppId, NormAlloc, Sensitivity};
use std::collections::BTreeMap;

pub fn allocate_and_parse(ctx: &AllocatorContext, app_ids: &[AppId]) -> BTreeMap<AppId, NormAlloc> {
    let vm_map = ctx.monitor.get_vm_to_app_mapping();

    let all_have_oracle = app_ids.iter().all(|id| {
        super::profile_by_id(ctx.config, *id)
            .and_then(|p| p.oracle_allocation)
            .is_some()
    });

    if !all_have_oracle {
        return sensitivity_fallback(ctx, app_ids);
    }

    let mut result = BTreeMap::new();
    for (_, apps) in &vm_map {
        let mut requested: BTreeMap<AppId, NormAlloc> = BTreeMap::new();
        for &app_id in apps {
            if let Some(profile) = super::profile_by_id(ctx.config, app_id) {
                if let Some(oracle) = profile.oracle_allocation {
                    requested.insert(
                        app_id,
                        NormAlloc::new(
                            oracle.cache as f64 / ctx.scale.cache_total_mb as f64,
                            oracle.mem_bw as f64 / ctx.scale.mem_bw_total_mbps as f64,
                        ),
                    );
                }
            }
        }
        super::normalize_vm(&mut requested);
        result.extend(requested);
    }

    // Any app outside the VM map falls back to static.
    let missing: Vec<AppId> = app_ids.iter().copied().filter(|id| !result.contains_key(id)).collect();
    if !missing.is_empty() {
        let fallback = static_allocation(&vm_map, &missing, ctx.config.num_vms());
        result.extend(fallback);
    }

    result
}

/// Cache-sensitive apps split `cache_total - min_cache_for_mem_sensitive`
/// among themselves plus `min_mem_bw`; mem_bw-sensitive apps symmetric.
fn sensitivity_fallback(ctx: &AllocatorContext, app_ids: &[AppId]) -> BTreeMap<AppId, NormAlloc> {
    let mut cache_sensitive = Vec::new();
    let mut mem_bw_sensitive = Vec::new();
    for &id in app_ids {
        match super::profile_by_id(ctx.config, id).map(|p| p.sensitivity) {
            Some(Sensitivity::Cache) => cache_sensitive.push(id),
            _ => mem_bw_sensitive.push(id),
        }
    }

    let min_cache_norm = ctx.scale.min_cache_norm();
    let min_bw_norm = ctx.scale.min_mem_bw_norm();

    let mut result = BTreeMap::new();

    if !cache_sensitive.is_empty() {
        let reserved_for_others = min_cache_norm * mem_bw_sensitive.len() as f64;
        let share_cache = ((1.0 - reserved_for_others) / cache_sensitive.len() as f64).max(min_cache_norm);
        for &id in &cache_sensitive {
            result.insert(id, NormAlloc::new(share_cache, min_bw_norm));
        }
    }

    if !mem_bw_sensitive.is_empty() {
        let reserved_for_others = min_bw_norm * cache_sensitive.len() as f64;
        let share_bw = ((1.0 - reserved_for_others) / mem_bw_sensitive.len() as f64).max(min_bw_norm);
        for &id in &mem_bw_sensitive {
            result.insert(id, NormAlloc::new(min_cache_norm, share_bw));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AllocationParameters, ClusterConfig, Config, OracleAllocationConfig, ProfileConfig, ResourceControllerConfig};
    use crate::estimator::Estimator;
    use crate::monitor::Monitor;

    fn two_app_config(oracle: bool) -> Config {
        Config {
            cluster: ClusterConfig {
                name: "t".into(),
                total_cache_in_mb: 10240,
                total_mem_bw_in_mbps: 7680,
                min_cache_in_mb: Some(1024),
                max_cache_in_mb: Some(10240),
                min_mem_bw_in_mbps: Some(768),
                max_mem_bw_in_mbps: Some(7680),
                num_vms: 1,
            },
            resource_controller: ResourceControllerConfig {
                base_url: "http://localhost".into(),
                collect_route: "collect".into(),
                deploy_route: "deploy".into(),
            },
            benchmark_map: Default::default(),
            allocation_parameters: AllocationParameters::default(),
            profiles: vec![
                ProfileConfig {
                    user_id: 1,
                    file: None,
                    sensitivity: Sensitivity::Cache,
                    oracle_allocation: oracle.then_some(OracleAllocationConfig { cache: 3072, mem_bw: 1920 }),
                    clip_l3miss: None,
                    clip_iteration: None,
                },
                ProfileConfig {
                    user_id: 2,
                    file: None,
                    sensitivity: Sensitivity::MemBw,
                    oracle_allocation: oracle.then_some(OracleAllocationConfig { cache: 7168, mem_bw: 5760 }),
                    clip_l3miss: None,
                    clip_iteration: None,
                },
            ],
        }
    }

    #[test]
    fn oracle_pass_through_within_totals() {
        let config = two_app_config(true);
        let monitor = Monitor::new([1, 2], 60.0);
        let mut vm_map = BTreeMap::new();
        vm_map.insert(1, vec![1, 2]);
        monitor.set_vm_map_for_test(vm_map);
        let ctx = AllocatorContext {
            monitor: &monitor,
            estimator: Estimator::new(&monitor),
            config: &config,
            scale: config.resource_scale(),
            epsilon: 0.005,
        };
        let result = allocate_and_parse(&ctx, &[1, 2]);
        let a1 = result[&1].denormalize(&ctx.scale);
        let a2 = result[&2].denormalize(&ctx.scale);
        assert_eq!(a1.cache_mb, 3072);
        assert_eq!(a1.mem_bw_mbps, 1920);
        assert_eq!(a2.cache_mb, 7168);
        assert_eq!(a2.mem_bw_mbps, 5760);
    }

    #[test]
    fn oracle_renormalizes_when_totals_exceed_capacity() {
        // Profile sums exceed totals by 2x -> each app should land at
        // exactly half its requested share (S3).
        let mut config = two_app_config(true);
        config.profiles[0].oracle_allocation = Some(OracleAllocationConfig { cache: 10240, mem_bw: 0 });
        config.profiles[1].oracle_allocation = Some(OracleAllocationConfig { cache: 10240, mem_bw: 0 });
        let monitor = Monitor::new([1, 2], 60.0);
        let mut vm_map = BTreeMap::new();
        vm_map.insert(1, vec![1, 2]);
        monitor.set_vm_map_for_test(vm_map);
        let ctx = AllocatorContext {
            monitor: &monitor,
            estimator: Estimator::new(&monitor),
            config: &config,
            scale: config.resource_scale(),
            epsilon: 0.005,
        };
        let result = allocate_and_parse(&ctx, &[1, 2]);
        assert!((result[&1].cache - 0.5).abs() < 1e-9);
        assert!((result[&2].cache - 0.5).abs() < 1e-9);
    }
}
