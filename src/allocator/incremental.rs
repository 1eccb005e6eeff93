//! Incremental Trade allocator: performance-feedback based up/down resource
//! reassignment. Per VM, the worst performer gains a unit of its preferred
//! resource each iteration; when no free units remain the allocator harvests
//! from the best performer instead, shrinking its share of the worst
//! performer's preferred resource and leaving the freed unit as headroom for
//! a later iteration rather than handing it to the worst performer directly.
//!
//! Grounded on `allocators/inc_trade_allocator.py::IncrementalTradeAllocator`.
//! `_check_performance_changes`, `_find_worst_performer_for_allocation`, and
//! `_find_best_performer_for_harvest` are kept as separate steps rather than
//! fused, matching the original's separation of concerns. The "previously
//! adjusted" exclusion in both finder functions is scoped per VM, as in
//! `last_adjusted_users[vm_id]`, and is set to the harvested app (not the
//! worst performer) after a harvest round.

use super::{static_allocation, AllocatorContext};
use crate::types::{AllocationDecision, AppId, Direction, NormAlloc, ResType, VmId};
use std::collections::BTreeMap;

const PERF_MARGIN: f64 = 0.01;
const REVOKE_MARGIN: f64 = 0.1;

#[derive(Default)]
pub struct IncrementalState {
    pub allocations: BTreeMap<AppId, NormAlloc>,
    decisions: BTreeMap<AppId, AllocationDecision>,
    last_adjusted: BTreeMap<VmId, AppId>,
    baseline_perf: BTreeMap<AppId, f64>,
    iteration: u64,
    /// Shared across every VM processed by this allocator instance, not
    /// reset per VM or per iteration. A VM can only grow the worst
    /// performer's share once some VM has harvested a unit of that
    /// resource type; this couples VMs' up/down decisions through one
    /// pool rather than giving each VM independent headroom. Grounded on
    /// `inc_trade_allocator.py::__init__`'s `self.remaining_resources`,
    /// a single dict despite the "Per-VM remaining resources" comment
    /// above it in the original.
    remaining_cache: f64,
    remaining_mem_bw: f64,
}

impl IncrementalState {
    fn remaining(&self, res_type: ResType) -> f64 {
        match res_type {
            ResType::Cache => self.remaining_cache,
            ResType::MemBw => self.remaining_mem_bw,
        }
    }

    fn remaining_mut(&mut self, res_type: ResType) -> &mut f64 {
        match res_type {
            ResType::Cache => &mut self.remaining_cache,
            ResType::MemBw => &mut self.remaining_mem_bw,
        }
    }
}

pub fn allocate_and_parse(
    ctx: &AllocatorContext,
    app_ids: &[AppId],
    state: &mut IncrementalState,
) -> BTreeMap<AppId, NormAlloc> {
    let vm_map = ctx.monitor.get_vm_to_app_mapping();
    if !super::is_complete_vm_map(&vm_map, app_ids) || vm_map.is_empty() {
        return static_allocation(&vm_map, app_ids, ctx.config.num_vms());
    }

    state.iteration += 1;

    let mut result = BTreeMap::new();
    for (&vm_id, apps) in &vm_map {
        let baseline = static_allocation(&BTreeMap::from([(vm_id, apps.clone())]), apps, 1);
        for &app_id in apps {
            state.allocations.entry(app_id).or_insert_with(|| baseline[&app_id]);
            state
                .baseline_perf
                .entry(app_id)
                .or_insert_with(|| current_performance(ctx, app_id, baseline[&app_id]).unwrap_or(1.0));
        }

        revisit_last_decision(ctx, vm_id, state);

        let mut vm_alloc: BTreeMap<AppId, NormAlloc> = apps
            .iter()
            .map(|&id| (id, state.allocations[&id]))
            .collect();

        if let Some(worst) = find_worst_performer(ctx, vm_id, apps, state, &vm_alloc) {
            let res_type = preferred_resource(ctx, worst);
            let has_room = state.remaining(res_type) > 0.0;

            if has_room {
                *state.remaining_mut(res_type) = (state.remaining(res_type) - ctx.epsilon).max(0.0);
                bump(&mut vm_alloc, worst, res_type, ctx.epsilon, true);
                record_decision(ctx, state, worst, res_type, Direction::Up);
                state.last_adjusted.insert(vm_id, worst);
            } else if let Some(best) = find_best_performer(ctx, vm_id, apps, state, res_type, &vm_alloc) {
                let opposite = match res_type {
                    ResType::Cache => ResType::MemBw,
                    ResType::MemBw => ResType::Cache,
                };
                // Harvest: shrink the best performer's share of
                // `res_type` (the worst performer's preferred resource,
                // not its opposite — the clamp check and the decrement
                // both key on `res_type_to_adjust` in the original) and
                // credit the same resource type back to the shared pool.
                // The freed unit is not handed to `worst` in this same
                // iteration; it becomes available the next time any VM's
                // `has_room` check runs. The decision recorded for `best`
                // uses `opposite`, not `res_type` — the original records
                // the opposite of what it actually decremented; preserved
                // as-is rather than reconciled. Grounded on
                // `inc_trade_allocator.py::_harvest_resources`.
                bump(&mut vm_alloc, best, res_type, ctx.epsilon, false);
                *state.remaining_mut(res_type) += ctx.epsilon;
                record_decision(ctx, state, best, opposite, Direction::Down);
                state.last_adjusted.insert(vm_id, best);
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

fn revisit_last_decision(ctx: &AllocatorContext, vm_id: VmId, state: &mut IncrementalState) {
    let Some(&app_id) = state.last_adjusted.get(&vm_id) else {
        return;
    };
    let Some(decision) = state.decisions.get(&app_id).copied() else {
        return;
    };
    let Some(alloc) = state.allocations.get(&app_id).copied() else {
        return;
    };
    let Some(now) = current_performance(ctx, app_id, alloc) else {
        return;
    };

    let delta = (now - decision.performance_at_decision) / decision.performance_at_decision;

    match decision.direction {
        Direction::Down => {
            if delta < -PERF_MARGIN {
                flip_preference(state, app_id);
                if delta < -REVOKE_MARGIN {
                    // Revoke: credit the resource back to the user.
                    if let Some(a) = state.allocations.get_mut(&app_id) {
                        match decision.res_type {
                            ResType::Cache => a.cache += ctx.epsilon,
                            ResType::MemBw => a.mem_bw += ctx.epsilon,
                        }
                    }
                }
            }
        }
        Direction::Up => {
            if delta < PERF_MARGIN {
                flip_preference(state, app_id);
            }
        }
    }
}

fn flip_preference(state: &mut IncrementalState, app_id: AppId) {
    if let Some(decision) = state.decisions.get_mut(&app_id) {
        decision.res_type = match decision.res_type {
            ResType::Cache => ResType::MemBw,
            ResType::MemBw => ResType::Cache,
        };
    }
}

fn record_decision(ctx: &AllocatorContext, state: &mut IncrementalState, app_id: AppId, res_type: ResType, direction: Direction) {
    let perf = state
        .allocations
        .get(&app_id)
        .and_then(|&a| current_performance(ctx, app_id, a))
        .unwrap_or(1.0);
    state.decisions.insert(
        app_id,
        AllocationDecision {
            res_type,
            direction,
            performance_at_decision: perf,
            timestamp: state.iteration,
        },
    );
}

fn preferred_resource(ctx: &AllocatorContext, app_id: AppId) -> ResType {
    match super::profile_by_id(ctx.config, app_id).map(|p| p.sensitivity) {
        Some(crate::types::Sensitivity::Cache) => ResType::Cache,
        _ => ResType::MemBw,
    }
}

/// Skips a user whose bump would push its preferred resource past the VM's
/// max clamp rather than excluding it outright: a later, worse-ratio
/// candidate that does fit still wins. Grounded on
/// `_find_worst_performer_for_allocation`'s `continue`-without-updating
/// `worst_ratio` behavior.
fn find_worst_performer(
    ctx: &AllocatorContext,
    vm_id: VmId,
    apps: &[AppId],
    state: &IncrementalState,
    vm_alloc: &BTreeMap<AppId, NormAlloc>,
) -> Option<AppId> {
    let adjusted = state.last_adjusted.get(&vm_id).copied();
    let mut worst: Option<(AppId, f64)> = None;
    for &id in apps {
        if Some(id) == adjusted {
            continue;
        }
        let Some(alloc) = state.allocations.get(&id).copied() else { continue };
        let Some(baseline) = state.baseline_perf.get(&id).copied() else { continue };
        if baseline.abs() < f64::EPSILON {
            continue;
        }
        let Some(now) = current_performance(ctx, id, alloc) else { continue };
        let ratio = now / baseline;
        if worst.is_some_and(|(_, best_ratio)| ratio >= best_ratio) {
            continue;
        }

        let res_type = preferred_resource(ctx, id);
        let cur = vm_alloc.get(&id).copied().unwrap_or(alloc);
        let exceeds_max = match res_type {
            ResType::Cache => cur.cache + ctx.epsilon > ctx.scale.max_cache_norm(),
            ResType::MemBw => cur.mem_bw + ctx.epsilon > ctx.scale.max_mem_bw_norm(),
        };
        if exceeds_max {
            continue;
        }
        worst = Some((id, ratio));
    }
    worst.map(|(id, _)| id)
}

/// Candidates are the same pool `find_worst_performer` scans (minus the
/// vm-scoped previously-adjusted exclusion); the worst performer itself is
/// not excluded explicitly, matching `_find_best_performer_for_harvest`,
/// which has no such exclusion beyond `previously_adjusted_users`. The
/// min-clamp check uses `res_type` (the worst performer's preferred
/// resource) against every candidate, not each candidate's own preference.
fn find_best_performer(
    ctx: &AllocatorContext,
    vm_id: VmId,
    apps: &[AppId],
    state: &IncrementalState,
    res_type: ResType,
    vm_alloc: &BTreeMap<AppId, NormAlloc>,
) -> Option<AppId> {
    let previously_adjusted = state.last_adjusted.get(&vm_id).copied();
    let mut best: Option<(AppId, f64)> = None;
    for &id in apps {
        if Some(id) == previously_adjusted {
            continue;
        }
        let Some(alloc) = state.allocations.get(&id).copied() else { continue };
        let Some(baseline) = state.baseline_perf.get(&id).copied() else { continue };
        if baseline.abs() < f64::EPSILON {
            continue;
        }
        let Some(now) = current_performance(ctx, id, alloc) else { continue };
        let ratio = now / baseline;
        if best.is_some_and(|(_, best_ratio)| ratio <= best_ratio) {
            continue;
        }

        if !can_spare(vm_alloc, id, res_type, ctx) {
            continue;
        }
        best = Some((id, ratio));
    }
    best.map(|(id, _)| id)
}

fn bump(alloc: &mut BTreeMap<AppId, NormAlloc>, app_id: AppId, res_type: ResType, epsilon: f64, increase: bool) {
    let Some(a) = alloc.get_mut(&app_id) else { return };
    let delta = if increase { epsilon } else { -epsilon };
    match res_type {
        ResType::Cache => a.cache = (a.cache + delta).max(0.0),
        ResType::MemBw => a.mem_bw = (a.mem_bw + delta).max(0.0),
    }
}

fn can_spare(alloc: &BTreeMap<AppId, NormAlloc>, app_id: AppId, res_type: ResType, ctx: &AllocatorContext) -> bool {
    let Some(a) = alloc.get(&app_id) else { return false };
    match res_type {
        ResType::Cache => a.cache - ctx.epsilon >= ctx.scale.min_cache_norm(),
        ResType::MemBw => a.mem_bw - ctx.epsilon >= ctx.scale.min_mem_bw_norm(),
    }
}

fn current_performance(ctx: &AllocatorContext, app_id: AppId, alloc: NormAlloc) -> Option<f64> {
    let cache_mb = (alloc.cache * ctx.scale.cache_total_mb as f64).round() as u64;
    let bw_mbps = (alloc.mem_bw * ctx.scale.mem_bw_total_mbps as f64).round() as u64;
    let measurements = ctx.monitor.collect_recent_measurement(app_id);
    if measurements.is_empty() {
        return None;
    }

    let closest_cache = measurements
        .keys()
        .min_by_key(|&&c| (c as i64 - cache_mb as i64).abs())
        .copied()?;
    let by_bw = &measurements[&closest_cache];
    let closest_bw = by_bw.keys().min_by_key(|&&b| (b as i64 - bw_mbps as i64).abs()).copied()?;
    let perfs = &by_bw[&closest_bw];
    if perfs.is_empty() {
        return None;
    }
    Some(perfs.iter().sum::<f64>() / perfs.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::monitor::Monitor;

    #[test]
    fn flip_preference_toggles_resource_type() {
        let mut state = IncrementalState::default();
        state.decisions.insert(
            1,
            AllocationDecision {
                res_type: ResType::Cache,
                direction: Direction::Up,
                performance_at_decision: 1.0,
                timestamp: 0,
            },
        );
        flip_preference(&mut state, 1);
        assert_eq!(state.decisions[&1].res_type, ResType::MemBw);
    }

    #[test]
    fn bump_clamps_at_zero() {
        let mut alloc = BTreeMap::new();
        alloc.insert(1u32, NormAlloc::new(0.001, 0.5));
        bump(&mut alloc, 1, ResType::Cache, 0.005, false);
        assert!(alloc[&1].cache >= 0.0);
    }

    fn two_app_ctx<'a>(monitor: &'a Monitor, config: &'a Config) -> AllocatorContext<'a> {
        AllocatorContext {
            monitor,
            estimator: crate::estimator::Estimator::new(monitor),
            config,
            scale: config.resource_scale(),
            epsilon: 0.005,
        }
    }

    fn two_app_config() -> Config {
        serde_json::from_str(
            r#"{
                "cluster": {"name": "t", "total_cache_in_mb": 10240, "total_mem_bw_in_mbps": 7680, "num_vms": 1},
                "resource_controller": {"base_url": "http://x", "collect_route": "c", "deploy_route": "d"},
                "profiles": [
                    {"user_id": 1, "sensitivity": "cache"},
                    {"user_id": 2, "sensitivity": "cache"}
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn a_unit_harvested_from_the_best_performer_becomes_available_next_iteration() {
        let monitor = Monitor::new([1, 2], 60.0);
        monitor.set_vm_map_for_test(BTreeMap::from([(7u32, vec![1u32, 2u32])]));
        let dummy_usage = crate::types::TelemetrySample {
            vm_id: 7,
            mem_mb_alloc: 0.0,
            mem_mb_raw: 0.0,
            bw_mbps_alloc: 0.0,
            bw_mbps_raw: 0.0,
            perf_proxy: 0.0,
            access_rate: 0.0,
            mrc: None,
        };
        monitor.seed_for_test(1, Vec::new(), dummy_usage.clone(), &[(5120, 3840, 1.0)]);
        monitor.seed_for_test(2, Vec::new(), dummy_usage, &[(5120, 3840, 1.0)]);

        let config = two_app_config();
        let ctx = two_app_ctx(&monitor, &config);

        let mut state = IncrementalState::default();
        state.allocations.insert(1, NormAlloc::new(0.5, 0.5));
        state.allocations.insert(2, NormAlloc::new(0.5, 0.5));
        // Pre-seed baselines so app 1 is unambiguously the worst performer
        // and app 2 the best, instead of relying on the degenerate tie a
        // brand-new state produces on its very first iteration (baseline
        // and current performance captured from the same snapshot).
        state.baseline_perf.insert(1, 1.2);
        state.baseline_perf.insert(2, 1.0);

        let first = allocate_and_parse(&ctx, &[1, 2], &mut state);
        // No room in the pool yet: harvests from app 2 (the better
        // performer) instead of granting app 1 anything this round.
        assert!((first[&1].cache - 0.5).abs() < 1e-9);
        assert!(first[&2].cache < 0.5);

        let second = allocate_and_parse(&ctx, &[1, 2], &mut state);
        // The unit harvested last round is now in the pool; app 1 (still
        // the worst performer, app 2 excluded as previously-adjusted)
        // claims it.
        assert!((second[&1].cache - (first[&1].cache + 0.005)).abs() < 1e-9);
        assert!((second[&2].cache - first[&2].cache).abs() < 1e-9);
    }
}
