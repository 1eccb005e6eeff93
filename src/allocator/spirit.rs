//! Spirit allocator: market-clearing price search plus per-app PTAS.
//!
//! Grounded on `allocators/spirit_allocator.py::SpiritAllocator::allocate`.
//! The binary search runs in simplex coordinates `left={1,0}`,
//! `right={0,1}`; each probe solves every app's PTAS bundle at the
//! candidate price and adjusts the bracket based on which resource is
//! oversubscribed, or which resource a PTAS winner was clamped against.

use super::{static_allocation, AllocatorContext};
use crate::ptas::{self, PtasParams};
use crate::types::{AppId, NormAlloc, PriceVector, ResourceLimited, VmId};
use std::collections::BTreeMap;

const MAX_ITERATION: u32 = 20;
const MAXIMUM_RETRY: u32 = 3;
const NUM_CONFLICT_RESOLVE_TH: u32 = 3;
const CLIPPING_RES_DECREASE_RATIO: f64 = 0.25;
const EPS_FLOAT: f64 = 1e-5;

#[derive(Default)]
pub struct SpiritState {
    pub last_allocation: BTreeMap<AppId, NormAlloc>,
    conflict_count: BTreeMap<VmId, u32>,
}

pub fn allocate_and_parse(
    ctx: &AllocatorContext,
    app_ids: &[AppId],
    state: &mut SpiritState,
) -> BTreeMap<AppId, NormAlloc> {
    let vm_map = ctx.monitor.get_vm_to_app_mapping();
    if !super::is_complete_vm_map(&vm_map, app_ids) || vm_map.is_empty() {
        return static_allocation(&vm_map, app_ids, ctx.config.num_vms());
    }

    let mut result = BTreeMap::new();
    for (&vm_id, apps) in &vm_map {
        let mut vm_alloc = allocate_vm(ctx, vm_id, apps, state);
        super::normalize_vm(&mut vm_alloc);
        result.extend(vm_alloc);
    }
    state.last_allocation = result.clone();
    result
}

fn allocate_vm(
    ctx: &AllocatorContext,
    vm_id: VmId,
    apps: &[AppId],
    state: &mut SpiritState,
) -> BTreeMap<AppId, NormAlloc> {
    let n = apps.len().max(1) as f64;
    let ptas_params = PtasParams {
        epsilon: ctx.epsilon,
        ..PtasParams::default()
    };

    let mut retries = 0;
    loop {
        let mut left = PriceVector { cache: 1.0, mem_bw: 0.0 };
        let mut right = PriceVector { cache: 0.0, mem_bw: 1.0 };

        for _ in 0..MAX_ITERATION {
            let mid = PriceVector::mid(left, right);
            let mut per_app = BTreeMap::new();
            let mut resource_limited = ResourceLimited::default();

            for &app_id in apps {
                let last = state.last_allocation.get(&app_id).copied();
                let ptas_result = ptas::search_with_peer_count(
                    &ctx.estimator,
                    app_id,
                    1.0 / n,
                    mid,
                    (0.0, 1.0),
                    &ctx.scale,
                    last,
                    last,
                    &ptas_params,
                    apps.len(),
                );
                if let Some(bundle) = ptas_result.bundle {
                    per_app.insert(app_id, bundle);
                }
                resource_limited.update(ptas_result.resource_limited);
            }

            let sum_cache: f64 = per_app.values().map(|a| a.cache).sum();
            let sum_bw: f64 = per_app.values().map(|a| a.mem_bw).sum();

            if resource_limited.is_resource_limited() {
                // Move the limiting bound gradually toward mid, choosing
                // direction by which *other* resource is oversubscribed.
                // mem_bw limiting is checked first; when both resources are
                // limited simultaneously only this branch fires. When
                // neither sum is over budget the choice falls to the `else`
                // below — preserved intentionally, see spec Design Notes on
                // Spirit's branch ambiguity.
                if resource_limited.mem_bw_min_limit || resource_limited.mem_bw_max_limit {
                    if sum_cache > 1.0 + EPS_FLOAT {
                        right = clip_toward_mid(right, mid);
                    } else {
                        left = clip_toward_mid(left, mid);
                    }
                } else if resource_limited.cache_min_limit || resource_limited.cache_max_limit {
                    if sum_bw > 1.0 + EPS_FLOAT {
                        left = clip_toward_mid(left, mid);
                    } else {
                        right = clip_toward_mid(right, mid);
                    }
                }
            } else if sum_cache > 1.0 + EPS_FLOAT {
                right = mid;
            } else if sum_bw > 1.0 + EPS_FLOAT {
                left = mid;
            } else {
                return per_app;
            }

            if (left.cache - right.cache).abs() < EPS_FLOAT && (left.mem_bw - right.mem_bw).abs() < EPS_FLOAT {
                break;
            }
        }

        retries += 1;
        if retries >= MAXIMUM_RETRY {
            let count = state.conflict_count.entry(vm_id).or_insert(0);
            *count += 1;
            let mut cur_alloc = state.last_allocation.clone();
            if *count > NUM_CONFLICT_RESOLVE_TH {
                // Both branches keep the last allocation; the original
                // resets the conflict counter here without changing the
                // returned allocation. Flagged suspicious, preserved as-is.
                *count = 0;
            }
            cur_alloc.retain(|id, _| apps.contains(id));
            if cur_alloc.is_empty() {
                return static_allocation(&BTreeMap::from([(vm_id, apps.to_vec())]), apps, 1);
            }
            return cur_alloc;
        }
    }
}

fn clip_toward_mid(bound: PriceVector, mid: PriceVector) -> PriceVector {
    PriceVector {
        cache: bound.cache + (mid.cache - bound.cache) * CLIPPING_RES_DECREASE_RATIO,
        mem_bw: bound.mem_bw + (mid.mem_bw - bound.mem_bw) * CLIPPING_RES_DECREASE_RATIO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_toward_mid_moves_a_quarter_of_the_way() {
        let left = PriceVector { cache: 1.0, mem_bw: 0.0 };
        let mid = PriceVector { cache: 0.5, mem_bw: 0.5 };
        let moved = clip_toward_mid(left, mid);
        assert!((moved.cache - 0.875).abs() < 1e-9);
        assert!((moved.mem_bw - 0.125).abs() < 1e-9);
    }

    #[test]
    fn non_convergence_falls_back_to_last_allocation() {
        let mut state = SpiritState::default();
        state.last_allocation.insert(1, NormAlloc::new(0.4, 0.4));
        state.last_allocation.insert(2, NormAlloc::new(0.6, 0.6));
        let count = state.conflict_count.entry(7).or_insert(NUM_CONFLICT_RESOLVE_TH + 1);
        assert_eq!(*count, NUM_CONFLICT_RESOLVE_TH + 1);
    }
}
