//! MRC-based performance estimator. Given the monitor's current usage and
//! MRC for an app, predicts relative performance at a hypothetical
//! (cache, bw) point.
//!
//! Grounded on `estimators/runtime_estimator.py::RuntimeEstimator`.
//! Failure is signaled with `None` rather than the original's sentinel
//! negative return (Design Notes §9: "replace the sentinel negative return
//! with an explicit optional type").

use crate::monitor::Monitor;
use crate::types::{AppId, Mrc};

/// Loc-to-ret slowdown proxy constant from the original model. Empirical;
/// kept as a tunable, not derived.
const SLOWDOWN_K: f64 = 100.0;
/// Bandwidth-saturation margin in the slowdown branch condition.
const BW_MARGIN: f64 = 0.8;

pub struct Estimator<'m> {
    monitor: &'m Monitor,
}

impl<'m> Estimator<'m> {
    pub fn new(monitor: &'m Monitor) -> Self {
        Self { monitor }
    }

    /// `relative_perf ∈ (0, ∞)` where 1.0 means "same as current".
    /// `None` when the monitor has no usage or MRC history for `app_id` yet.
    pub fn estimate(&self, app_id: AppId, cache_mb: f64, bw_mbps_target: f64) -> Option<f64> {
        let usage = self.monitor.get_last_usage(app_id)?;
        let mrc = self.monitor.get_last_mrc(app_id)?;

        let m_c = estimate_miss_rate(&mrc, usage.mem_mb_alloc)?;
        let m_t = estimate_miss_rate(&mrc, cache_mb)?;

        let bw_c = usage.bw_mbps_raw;
        let bw_alloc = usage.bw_mbps_alloc;

        let slowdown_ratio = estimate_slow_down(m_c, m_t, bw_c, bw_mbps_target, bw_alloc);
        if slowdown_ratio <= 0.0 {
            return None;
        }
        Some(1.0 / slowdown_ratio)
    }
}

/// Linear interpolation on the monotone MRC; linear extrapolation past the
/// endpoints. Clamped to `(1e-12, 1.0)`. `None` if the curve is empty.
pub fn estimate_miss_rate(mrc: &Mrc, cache_mb: f64) -> Option<f64> {
    if mrc.is_empty() {
        return None;
    }
    if mrc.len() == 1 {
        return Some(mrc[0].miss_rate.clamp(1e-12, 1.0));
    }

    let raw = if cache_mb <= mrc[0].cache_mb {
        let (p0, p1) = (&mrc[0], &mrc[1]);
        lerp(p0.cache_mb, p0.miss_rate, p1.cache_mb, p1.miss_rate, cache_mb)
    } else if cache_mb >= mrc[mrc.len() - 1].cache_mb {
        let (p0, p1) = (&mrc[mrc.len() - 2], &mrc[mrc.len() - 1]);
        lerp(p0.cache_mb, p0.miss_rate, p1.cache_mb, p1.miss_rate, cache_mb)
    } else {
        let idx = mrc.partition_point(|p| p.cache_mb < cache_mb).max(1);
        let p0 = &mrc[idx - 1];
        let p1 = &mrc[idx];
        lerp(p0.cache_mb, p0.miss_rate, p1.cache_mb, p1.miss_rate, cache_mb)
    };

    Some(raw.clamp(1e-12, 1.0))
}

fn lerp(x0: f64, y0: f64, x1: f64, y1: f64, x: f64) -> f64 {
    if (x1 - x0).abs() < f64::EPSILON {
        return y0;
    }
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}

/// `S(m, bw_eff, bw_here) = 1 + m * K * max(1, bw_eff / bw_here)`.
fn slowdown_proxy(miss_rate: f64, bw_eff: f64, bw_here: f64) -> f64 {
    let ratio = if bw_here.abs() < f64::EPSILON {
        1.0
    } else {
        (bw_eff / bw_here).max(1.0)
    };
    1.0 + miss_rate * SLOWDOWN_K * ratio
}

/// Returns `S(m_t, bw_est, bw_t) / S(m_c, bw_est, bw_alloc)`: target over
/// current, the inverse of relative performance (callers divide 1.0 by
/// this to get `relative_perf`, which must rise when the target has a
/// lower miss rate). Preserves the original's two-branch saturation check
/// verbatim — collapsing it to one branch changes the numeric result at
/// the margin boundary.
fn estimate_slow_down(m_c: f64, m_t: f64, bw_c: f64, bw_t: f64, bw_alloc: f64) -> f64 {
    if m_c.abs() < f64::EPSILON {
        return 0.0;
    }

    let bw_est = if bw_c <= bw_alloc * BW_MARGIN || bw_c > bw_t {
        bw_c * (m_t / m_c)
    } else {
        bw_t * (bw_c / bw_alloc).min(1.0) * (m_t / m_c)
    };

    let s_c = slowdown_proxy(m_c, bw_est, bw_alloc);
    let s_t = slowdown_proxy(m_t, bw_est, bw_t);
    if s_c.abs() < f64::EPSILON {
        return 0.0;
    }
    s_t / s_c
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MrcPoint;

    fn sample_mrc() -> Mrc {
        vec![
            MrcPoint { cache_mb: 1024.0, miss_rate: 0.5 },
            MrcPoint { cache_mb: 2048.0, miss_rate: 0.3 },
            MrcPoint { cache_mb: 4096.0, miss_rate: 0.1 },
        ]
    }

    #[test]
    fn miss_rate_interpolates_between_points() {
        let mrc = sample_mrc();
        let m = estimate_miss_rate(&mrc, 1536.0).unwrap();
        assert!((m - 0.4).abs() < 1e-9);
    }

    #[test]
    fn miss_rate_extrapolates_below_range() {
        let mrc = sample_mrc();
        let m = estimate_miss_rate(&mrc, 512.0).unwrap();
        assert!(m > 0.5);
    }

    #[test]
    fn miss_rate_clamps_to_unit_interval() {
        let mrc = vec![
            MrcPoint { cache_mb: 1.0, miss_rate: 0.01 },
            MrcPoint { cache_mb: 100000.0, miss_rate: 0.0001 },
        ];
        let m = estimate_miss_rate(&mrc, 1_000_000.0).unwrap();
        assert!(m >= 1e-12 && m <= 1.0);
    }

    #[test]
    fn slowdown_ratio_is_one_at_identical_points() {
        let ratio = estimate_slow_down(0.2, 0.2, 100.0, 100.0, 200.0);
        assert!((ratio - 1.0).abs() < 1e-9);
    }

    #[test]
    fn slowdown_ratio_below_one_when_target_has_lower_miss_rate() {
        let ratio = estimate_slow_down(0.2, 0.1, 100.0, 100.0, 200.0);
        assert!(ratio < 1.0);
    }
}
