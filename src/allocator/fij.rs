//! Fij (pairwise) Trade allocator: cache/bandwidth sensitivity scoring via
//! what-if estimator calls, trading epsilon units between the
//! most-cache-sensitive and most-bw-sensitive app on each VM.
//!
//! Grounded on `allocators/fij_trade_allocator.py::FijTradeAllocator`.

use super::{static_allocation, AllocatorContext};
use crate::types::{AppId, NormAlloc, VmId};
use std::collections::BTreeMap;

#[derive(Default)]
pub struct FijState {
    pub allocations: BTreeMap<AppId, NormAlloc>,
    last_adjusted: BTreeMap<VmId, (AppId, AppId)>,
}

pub fn allocate_and_parse(
    ctx: &AllocatorContext,
    app_ids: &[AppId],
    state: &mut FijState,
) -> BTreeMap<AppId, NormAlloc> {
    let vm_map = ctx.monitor.get_vm_to_app_mapping();
    if !super::is_complete_vm_map(&vm_map, app_ids) || vm_map.is_empty() {
        return static_allocation(&vm_map, app_ids, ctx.config.num_vms());
    }

    let mut result = BTreeMap::new();
    for (&vm_id, apps) in &vm_map {
        let baseline = static_allocation(&BTreeMap::from([(vm_id, apps.clone())]), apps, 1);
        for &app_id in apps {
            state.allocations.entry(app_id).or_insert_with(|| baseline[&app_id]);
        }

        let mut vm_alloc: BTreeMap<AppId, NormAlloc> = apps.iter().map(|&id| (id, state.allocations[&id])).collect();

        let previously_adjusted = state.last_adjusted.get(&vm_id).copied();
        let scores = calculate_sensitivity_scores(ctx, apps, &vm_alloc, previously_adjusted);

        let cache_sensitive = most_cache_sensitive(&scores);
        let bw_sensitive = most_bw_sensitive(&scores, cache_sensitive);

        // Reset unconditionally, then re-add only the pair actually traded
        // this round, matching `_calculate_sensitivity_scores`'s
        // reset-then-re-add of `last_adjusted_users[vm_id]`.
        state.last_adjusted.remove(&vm_id);
        if let (Some(a), Some(b)) = (cache_sensitive, bw_sensitive) {
            if a != b {
                trade(&mut vm_alloc, a, b, ctx);
                state.last_adjusted.insert(vm_id, (a, b));
            }
        }

        super::normalize_vm(&mut vm_alloc);
        for (&id, &alloc) in &vm_alloc {
            state.allocations.insert(id, alloc);
        }
        result.extend(vm_alloc);
    }

    result
}

struct Scores {
    cache_sensitivity: f64,
    bw_sensitivity: f64,
}

/// `more_cache_less_bw_perf` and `less_cache_more_bw_perf` are each
/// evaluated via a what-if estimator call respecting min/max clamps.
/// Apps in `previously_adjusted` (the pair traded last iteration on this
/// VM) are skipped entirely, matching
/// `_calculate_sensitivity_scores`'s `last_adjusted_users` exclusion —
/// without it, the same pair would be re-traded every iteration.
fn calculate_sensitivity_scores(
    ctx: &AllocatorContext,
    apps: &[AppId],
    alloc: &BTreeMap<AppId, NormAlloc>,
    previously_adjusted: Option<(AppId, AppId)>,
) -> BTreeMap<AppId, Scores> {
    let mut scores = BTreeMap::new();
    for &app_id in apps {
        if let Some((a, b)) = previously_adjusted {
            if app_id == a || app_id == b {
                continue;
            }
        }
        let Some(&cur) = alloc.get(&app_id) else { continue };
        let Some(base_util) = ctx.estimator.estimate(
            app_id,
            cur.cache * ctx.scale.cache_total_mb as f64,
            cur.mem_bw * ctx.scale.mem_bw_total_mbps as f64,
        ) else {
            continue;
        };

        let more_cache = clamp_point(
            cur.cache + ctx.epsilon,
            cur.mem_bw - ctx.epsilon,
            ctx,
        );
        let less_cache = clamp_point(
            cur.cache - ctx.epsilon,
            cur.mem_bw + ctx.epsilon,
            ctx,
        );

        let more_cache_perf = ctx
            .estimator
            .estimate(app_id, more_cache.0 * ctx.scale.cache_total_mb as f64, more_cache.1 * ctx.scale.mem_bw_total_mbps as f64);
        let less_cache_perf = ctx
            .estimator
            .estimate(app_id, less_cache.0 * ctx.scale.cache_total_mb as f64, less_cache.1 * ctx.scale.mem_bw_total_mbps as f64);

        let cache_sensitivity = more_cache_perf.map(|p| (p - base_util) / base_util).unwrap_or(0.0);
        let bw_sensitivity = less_cache_perf.map(|p| (p - base_util) / base_util).unwrap_or(0.0);

        scores.insert(app_id, Scores { cache_sensitivity, bw_sensitivity });
    }
    scores
}

fn clamp_point(cache: f64, mem_bw: f64, ctx: &AllocatorContext) -> (f64, f64) {
    (
        cache.clamp(ctx.scale.min_cache_norm(), ctx.scale.max_cache_norm()),
        mem_bw.clamp(ctx.scale.min_mem_bw_norm(), ctx.scale.max_mem_bw_norm()),
    )
}

fn most_cache_sensitive(scores: &BTreeMap<AppId, Scores>) -> Option<AppId> {
    scores
        .iter()
        .filter(|(_, s)| s.cache_sensitivity > 0.0 && s.cache_sensitivity > s.bw_sensitivity)
        .max_by(|a, b| a.1.cache_sensitivity.partial_cmp(&b.1.cache_sensitivity).unwrap())
        .map(|(&id, _)| id)
}

fn most_bw_sensitive(scores: &BTreeMap<AppId, Scores>, exclude: Option<AppId>) -> Option<AppId> {
    scores
        .iter()
        .filter(|(&id, _)| Some(id) != exclude)
        .filter(|(_, s)| s.bw_sensitivity > 0.0 && s.bw_sensitivity > s.cache_sensitivity)
        .max_by(|a, b| a.1.bw_sensitivity.partial_cmp(&b.1.bw_sensitivity).unwrap())
        .map(|(&id, _)| id)
}

/// Swaps epsilon units between the two users: `+cache/-bw` to the
/// cache-sensitive app, the reverse to the bw-sensitive app.
fn trade(alloc: &mut BTreeMap<AppId, NormAlloc>, cache_sensitive: AppId, bw_sensitive: AppId, ctx: &AllocatorContext) {
    let min_cache = ctx.scale.min_cache_norm();
    let min_bw = ctx.scale.min_mem_bw_norm();

    let can_donate_bw = alloc.get(&cache_sensitive).map(|a| a.mem_bw - ctx.epsilon >= min_bw).unwrap_or(false);
    let can_donate_cache = alloc.get(&bw_sensitive).map(|a| a.cache - ctx.epsilon >= min_cache).unwrap_or(false);
    if !can_donate_bw || !can_donate_cache {
        return;
    }

    if let Some(a) = alloc.get_mut(&cache_sensitive) {
        a.cache += ctx.epsilon;
        a.mem_bw -= ctx.epsilon;
    }
    if let Some(b) = alloc.get_mut(&bw_sensitive) {
        b.cache -= ctx.epsilon;
        b.mem_bw += ctx.epsilon;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn most_cache_sensitive_requires_positive_and_dominant_score() {
        let mut scores = BTreeMap::new();
        scores.insert(1u32, Scores { cache_sensitivity: 0.2, bw_sensitivity: 0.1 });
        scores.insert(2u32, Scores { cache_sensitivity: -0.1, bw_sensitivity: 0.3 });
        assert_eq!(most_cache_sensitive(&scores), Some(1));
    }

    #[test]
    fn most_bw_sensitive_excludes_the_cache_sensitive_pick() {
        let mut scores = BTreeMap::new();
        scores.insert(1u32, Scores { cache_sensitivity: 0.2, bw_sensitivity: 0.5 });
        scores.insert(2u32, Scores { cache_sensitivity: -0.1, bw_sensitivity: 0.3 });
        assert_eq!(most_bw_sensitive(&scores, Some(1)), Some(2));
    }

    #[test]
    fn previously_adjusted_pair_is_excluded_from_scoring() {
        use crate::config::{AllocationParameters, ClusterConfig, Config, ResourceControllerConfig};
        use crate::types::{MrcPoint, Sensitivity, TelemetrySample};

        let monitor = crate::monitor::Monitor::new([1, 2, 3], 60.0);
        let mrc = vec![
            MrcPoint { cache_mb: 1024.0, miss_rate: 0.5 },
            MrcPoint { cache_mb: 4096.0, miss_rate: 0.1 },
        ];
        let usage = TelemetrySample {
            vm_id: 1,
            mem_mb_alloc: 2048.0,
            mem_mb_raw: 2048.0,
            bw_mbps_alloc: 2048.0,
            bw_mbps_raw: 2048.0,
            perf_proxy: 1.0,
            access_rate: 1.0,
            mrc: None,
        };
        for app_id in [1u32, 2, 3] {
            monitor.seed_for_test(app_id, mrc.clone(), usage.clone(), &[]);
        }

        let config = Config {
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
            profiles: [1u32, 2, 3]
                .iter()
                .map(|&id| crate::config::ProfileConfig {
                    user_id: id,
                    file: None,
                    sensitivity: Sensitivity::Cache,
                    oracle_allocation: None,
                    clip_l3miss: None,
                    clip_iteration: None,
                })
                .collect(),
        };

        let ctx = AllocatorContext {
            monitor: &monitor,
            estimator: crate::estimator::Estimator::new(&monitor),
            config: &config,
            scale: config.resource_scale(),
            epsilon: 0.005,
        };
        let mut alloc = BTreeMap::new();
        alloc.insert(1u32, NormAlloc::new(0.4, 0.4));
        alloc.insert(2u32, NormAlloc::new(0.3, 0.3));
        alloc.insert(3u32, NormAlloc::new(0.3, 0.3));

        // Without exclusion every app has usage/MRC history and would
        // score; with (1, 2) marked previously-adjusted only app 3 should
        // appear.
        let scores = calculate_sensitivity_scores(&ctx, &[1, 2, 3], &alloc, Some((1, 2)));
        assert!(!scores.contains_key(&1));
        assert!(!scores.contains_key(&2));
        assert!(scores.contains_key(&3));
    }
}
