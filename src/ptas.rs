//! Per-app bundle search (PTAS): picks the (cache, bw) bundle maximizing
//! estimated utility within a budget and a bounding search range, subject
//! to resource clamps.
//!
//! Grounded on `allocators/ptas_algorithm.py::ptas_algorithm`. The
//! `margin_in_budget` shrink, the two-stage static seed repair, and
//! `check_last_allocation`'s ratio-preserving fallback are implemented as
//! the original does them (see SPEC_FULL.md §4.C).

use crate::estimator::Estimator;
use crate::types::{AppId, NormAlloc, PriceVector, ResourceLimited, ResourceScale};

#[derive(Debug, Clone, Copy)]
pub struct PtasParams {
    pub epsilon: f64,
    pub margin_in_budget: f64,
    pub reallocation_threshold: f64,
    pub prefer_last_allocation: bool,
}

impl Default for PtasParams {
    fn default() -> Self {
        Self {
            epsilon: 0.005,
            margin_in_budget: 0.97,
            reallocation_threshold: 1.005,
            prefer_last_allocation: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PtasResult {
    pub bundle: Option<NormAlloc>,
    pub points_checked: u32,
    pub resource_limited: ResourceLimited,
}

struct Candidate {
    utility: f64,
    alloc: NormAlloc,
    limited: ResourceLimited,
}

/// Above this many co-resident apps, per-candidate debug logging is
/// suppressed so a busy VM doesn't spam the log with one line per grid
/// point per app per iteration. Grounded on `ptas_algorithm.py`'s
/// `verbose_n_user` gate.
const VERBOSE_N_USER_TH: usize = 8;

pub fn search(
    estimator: &Estimator,
    app_id: AppId,
    budget: f64,
    price: PriceVector,
    search_range: (f64, f64),
    scale: &ResourceScale,
    last_allocation: Option<NormAlloc>,
    last_static_allocation: Option<NormAlloc>,
    params: &PtasParams,
) -> PtasResult {
    search_with_peer_count(estimator, app_id, budget, price, search_range, scale, last_allocation, last_static_allocation, params, 1)
}

#[allow(clippy::too_many_arguments)]
pub fn search_with_peer_count(
    estimator: &Estimator,
    app_id: AppId,
    budget: f64,
    price: PriceVector,
    search_range: (f64, f64),
    scale: &ResourceScale,
    last_allocation: Option<NormAlloc>,
    last_static_allocation: Option<NormAlloc>,
    params: &PtasParams,
    vm_app_count: usize,
) -> PtasResult {
    let verbose = vm_app_count <= VERBOSE_N_USER_TH;
    let effective_budget = budget * params.margin_in_budget;
    let min_cache = scale.min_cache_norm();
    let max_cache = scale.max_cache_norm();
    let min_bw = scale.min_mem_bw_norm();
    let max_bw = scale.max_mem_bw_norm();

    let mut max_util = f64::NEG_INFINITY;
    let mut best: Option<NormAlloc> = None;
    let mut resource_limited = ResourceLimited::default();
    let mut points_checked: u32 = 0;

    let mut closest: Option<(NormAlloc, f64, f64)> = None; // (alloc, utility, distance)

    let clamp_bundle = |cache: f64, bw: f64| -> (f64, f64, ResourceLimited) {
        let mut limited = ResourceLimited::default();
        let margin_cache = params.epsilon;
        let margin_bw = params.epsilon;

        let cache = if cache < min_cache - margin_cache {
            limited.cache_min_limit = true;
            min_cache
        } else if cache > max_cache + margin_cache {
            limited.cache_max_limit = true;
            max_cache
        } else {
            cache
        };

        let bw = if bw < min_bw - margin_bw {
            limited.mem_bw_min_limit = true;
            min_bw
        } else if bw > max_bw + margin_bw {
            limited.mem_bw_max_limit = true;
            max_bw
        } else {
            bw
        };

        (cache, bw, limited)
    };

    let mut evaluate = |cache: f64, bw: f64, penalize_shrink: bool| -> Option<Candidate> {
        let (cache, bw, limited) = clamp_bundle(cache, bw);
        let mut utility = estimator.estimate(app_id, cache * scale.cache_total_mb as f64, bw * scale.mem_bw_total_mbps as f64)?;
        if penalize_shrink {
            if let Some(last) = last_allocation {
                if cache < last.cache {
                    utility /= params.reallocation_threshold;
                }
            }
        }
        Some(Candidate {
            utility,
            alloc: NormAlloc::new(cache, bw),
            limited,
        })
    };

    // Seed with the static allocation, biasing the search toward it unless
    // a candidate beats it by >= reallocation_threshold.
    if let Some(static_alloc) = last_static_allocation {
        let cache = static_alloc.cache.clamp(search_range.0, search_range.1);
        let remaining = effective_budget - cache * price.cache;
        let bw = if price.mem_bw.abs() > f64::EPSILON {
            (remaining / price.mem_bw).max(0.0)
        } else {
            static_alloc.mem_bw
        };
        if cache >= min_cache && cache <= max_cache && bw >= min_bw && bw <= max_bw {
            if let Some(util) = estimator.estimate(app_id, cache * scale.cache_total_mb as f64, bw * scale.mem_bw_total_mbps as f64) {
                max_util = util / params.reallocation_threshold;
                best = Some(NormAlloc::new(cache, bw));
            }
        }
    }

    // Evaluate the candidate derived from keeping the last allocation's
    // cache and filling bw from the remaining budget; if the budget can't
    // cover it, fall back to a ratio-preserving reallocation.
    if let Some(last) = last_allocation {
        let (cache, bw) = check_last_allocation(last, effective_budget, params.epsilon, price, min_cache, min_bw, scale);
        if let Some(candidate) = evaluate(cache, bw, false) {
            if candidate.utility > max_util {
                max_util = candidate.utility;
                best = Some(candidate.alloc);
            }
        }
    }

    let steps = (1.0 / params.epsilon).floor() as u64;
    for i in 1..=steps {
        let cache = i as f64 * params.epsilon;
        if cache < search_range.0 {
            continue;
        }
        if cache > search_range.1 {
            break;
        }
        if cache * price.cache > effective_budget {
            break;
        }

        let bw_units = if price.mem_bw.abs() > f64::EPSILON {
            (((effective_budget - cache * price.cache) / price.mem_bw) / params.epsilon)
                .floor()
                .clamp(1.0, steps as f64)
        } else {
            steps as f64
        };
        let bw = bw_units * params.epsilon;

        points_checked += 1;

        let Some(candidate) = evaluate(cache, bw, true) else {
            continue;
        };

        if verbose {
            tracing::debug!(app_id, cache, bw = candidate.alloc.mem_bw, utility = candidate.utility, "ptas candidate");
        }

        if let Some(last) = last_allocation {
            let dist = ((candidate.alloc.cache - last.cache).powi(2) + (candidate.alloc.mem_bw - last.mem_bw).powi(2)).sqrt();
            let better = match &closest {
                Some((_, _, best_dist)) => dist < *best_dist,
                None => true,
            };
            if better {
                closest = Some((candidate.alloc, candidate.utility, dist));
            }
        }

        if candidate.utility > max_util {
            max_util = candidate.utility;
            let limited_now = candidate.limited;
            best = Some(candidate.alloc);
            resource_limited.update(limited_now);
            if limited_now.is_resource_limited() {
                // Ignore noisy mid-points past the first resource-limited
                // winner.
                break;
            }
        }
    }

    // Stickiness: damp churn by preferring the grid point closest to the
    // last allocation unless the winner clears it by the threshold.
    if params.prefer_last_allocation {
        if let Some((closest_alloc, closest_util, _)) = closest {
            if max_util / params.reallocation_threshold < closest_util {
                best = Some(closest_alloc);
            }
        }
    }

    PtasResult {
        bundle: best,
        points_checked,
        resource_limited,
    }
}

/// Reuses the last allocation's cache leg and fills bw from the remaining
/// budget; when the budget can't cover it, falls back to whichever of
/// (min cache, min bw) the budget prefers, preserving the cache:bw ratio,
/// then rounds down to the epsilon grid. Grounded on
/// `ptas_algorithm.py::check_last_allocation`.
fn check_last_allocation(
    last: NormAlloc,
    budget: f64,
    epsilon: f64,
    price: PriceVector,
    min_cache: f64,
    min_bw: f64,
    scale: &ResourceScale,
) -> (f64, f64) {
    let remaining = budget - last.cache * price.cache;
    if remaining > 0.0 {
        let units = (remaining / price.mem_bw.max(1e-6) / epsilon).floor();
        let bw_units = units.max(1.0).min((1.0 / epsilon).floor());
        let mut bw = bw_units * epsilon;
        let bw_actual = (bw * scale.mem_bw_total_mbps as f64).min(scale.max_mem_bw_mbps as f64);
        bw = bw_actual / scale.mem_bw_total_mbps as f64;
        return (last.cache, bw);
    }

    let ratio = if last.mem_bw.abs() > f64::EPSILON {
        last.cache / last.mem_bw
    } else {
        1.0
    };

    let min_cache_alloc = epsilon.max(min_cache);
    let corresponding_mem_bw = min_cache_alloc / ratio;
    let min_mem_bw_alloc = epsilon.max(min_bw);
    let corresponding_cache = min_mem_bw_alloc * ratio;

    let option1_cost = min_cache_alloc * price.cache + corresponding_mem_bw * price.mem_bw;
    let option2_cost = corresponding_cache * price.cache + min_mem_bw_alloc * price.mem_bw;

    let (mut cache, mut bw) = if option1_cost > budget && option2_cost > budget {
        if option1_cost <= option2_cost {
            let cache = min_cache_alloc;
            let bw = (budget - cache * price.cache) / price.mem_bw;
            (cache, bw)
        } else {
            let bw = min_mem_bw_alloc;
            let cache = (budget - bw * price.mem_bw) / price.cache;
            (cache, bw)
        }
    } else {
        let mut cache = budget / (price.cache + price.mem_bw / ratio);
        let mut bw = cache / ratio;
        if cache < min_cache {
            cache = min_cache;
            bw = (budget - cache * price.cache) / price.mem_bw;
        } else if bw < min_bw {
            bw = min_bw;
            cache = (budget - bw * price.mem_bw) / price.cache;
        }
        (cache, bw)
    };

    cache = (cache / epsilon).floor() * epsilon;
    bw = (bw / epsilon).floor() * epsilon;
    cache = cache.max(epsilon);
    bw = bw.max(epsilon);
    (cache, bw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::Monitor;

    fn test_scale() -> ResourceScale {
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
    fn stickiness_prefers_last_allocation_within_threshold() {
        // No monitor history means the estimator always returns None, so
        // every candidate is skipped and the search returns nothing to
        // compare against last_allocation; this asserts the no-data path
        // degrades to "no bundle" rather than panicking.
        let monitor = Monitor::new([1], 60.0);
        let estimator = Estimator::new(&monitor);
        let scale = test_scale();
        let params = PtasParams::default();
        let price = PriceVector { cache: 0.5, mem_bw: 0.5 };

        let result = search(
            &estimator,
            1,
            0.5,
            price,
            (0.0, 1.0),
            &scale,
            Some(NormAlloc::new(0.5, 0.5)),
            None,
            &params,
        );

        assert!(result.bundle.is_none());
    }

    #[test]
    fn without_estimator_history_every_candidate_is_skipped() {
        let monitor = Monitor::new([1], 60.0);
        let estimator = Estimator::new(&monitor);
        let scale = test_scale();
        let params = PtasParams::default();
        let price = PriceVector { cache: 0.5, mem_bw: 0.5 };

        let result = search(&estimator, 1, 0.5, price, (0.0, 1.0), &scale, None, None, &params);
        assert!(result.bundle.is_none());
        assert!(result.points_checked > 0);
    }

    #[test]
    fn check_last_allocation_reuses_cache_leg_when_budget_allows() {
        let scale = test_scale();
        let last = NormAlloc::new(0.5, 0.5);
        let price = PriceVector { cache: 0.5, mem_bw: 0.5 };
        let (cache, bw) = check_last_allocation(last, 0.6, 0.005, price, scale.min_cache_norm(), scale.min_mem_bw_norm(), &scale);
        assert_eq!(cache, 0.5);
        assert!(bw > 0.0);
    }

    #[test]
    fn check_last_allocation_falls_back_when_budget_too_small() {
        let scale = test_scale();
        let last = NormAlloc::new(0.8, 0.8);
        let price = PriceVector { cache: 0.9, mem_bw: 0.9 };
        let (cache, bw) = check_last_allocation(last, 0.1, 0.005, price, scale.min_cache_norm(), scale.min_mem_bw_norm(), &scale);
        assert!(cache >= scale.min_cache_norm() - 1e-9);
        assert!(bw >= scale.min_mem_bw_norm() - 1e-9 || bw >= 0.005 - 1e-9);
    }
}
