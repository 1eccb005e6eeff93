//! Telemetry Buffer (Monitor): fetches controller snapshots, filters noise,
//! maintains per-app windowed history, and answers MRC/usage/VM-mapping
//! queries for the estimator and allocator.
//!
//! Grounded on `resource_monitor.py`'s `ResourceMonitor`/`MemcachedMindMonitor`.
//! All mutable state lives behind one `parking_lot::Mutex` per the
//! concurrency model (§5: "protect reads/writes with a single lock scoped
//! to the monitor instance").

use crate::controller_client::ControllerClient;
use crate::error::Result;
use crate::types::{Allocation, AppId, Mrc, MrcPoint, TelemetrySample, VmId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};

const EWMA_ALPHA: f64 = 0.95;
const RECENT_WINDOW: usize = 24;
const SKIP_NOISE_AFTER_ALLOC: u32 = 1;

#[derive(Debug, Clone, Default)]
pub struct CollectedData {
    pub total_records: u64,
    pub total_unique_points: u64,
    /// cache_mb -> bw_mbps -> [(perf, iteration)]
    pub datapoints: BTreeMap<u64, BTreeMap<u64, Vec<(f64, u64)>>>,
    pub last_mrc: Option<Mrc>,
    pub last_update_iteration: u64,
}

type RecentSnapshot = BTreeMap<u64, BTreeMap<u64, f64>>;

#[derive(Default)]
struct AppState {
    collected: CollectedData,
    /// cache_mb -> bw_mbps -> buffered perf samples, drained on consume.
    buffered: BTreeMap<u64, BTreeMap<u64, Vec<f64>>>,
    buffered_mrc: Option<Mrc>,
    last_usage: Option<TelemetrySample>,
    recent: VecDeque<RecentSnapshot>,
    last_accepted_perf: BTreeMap<(u64, u64), f64>,
    last_allocation: Option<Allocation>,
    /// set true right after a publish; the next collect for this app is
    /// dropped unless the allocation interval is too short to afford it.
    skip_next: bool,
}

struct Inner {
    apps: BTreeMap<AppId, AppState>,
    vm_to_app_map: BTreeMap<VmId, Vec<AppId>>,
    iteration: u64,
    allocation_interval_in_sec: f64,
}

pub struct Monitor {
    inner: Mutex<Inner>,
}

impl Monitor {
    pub fn new(app_ids: impl IntoIterator<Item = AppId>, allocation_interval_in_sec: f64) -> Self {
        let mut apps = BTreeMap::new();
        for id in app_ids {
            apps.insert(id, AppState::default());
        }
        Self {
            inner: Mutex::new(Inner {
                apps,
                vm_to_app_map: BTreeMap::new(),
                iteration: 0,
                allocation_interval_in_sec,
            }),
        }
    }

    /// Records the allocation the controller was just told to enforce, so
    /// the next snapshot can be annotated with the currently-enforced
    /// values instead of whatever the controller happens to report.
    pub fn set_last_allocation(&self, allocations: &BTreeMap<AppId, Allocation>) {
        let mut inner = self.inner.lock();
        for (app_id, alloc) in allocations {
            if let Some(state) = inner.apps.get_mut(app_id) {
                state.last_allocation = Some(*alloc);
                state.skip_next = true;
            }
        }
    }

    pub fn get_vm_to_app_mapping(&self) -> BTreeMap<VmId, Vec<AppId>> {
        self.inner.lock().vm_to_app_map.clone()
    }

    pub fn get_last_usage(&self, app_id: AppId) -> Option<TelemetrySample> {
        self.inner.lock().apps.get(&app_id)?.last_usage.clone()
    }

    pub fn get_last_mrc(&self, app_id: AppId) -> Option<Mrc> {
        self.inner
            .lock()
            .apps
            .get(&app_id)?
            .collected
            .last_mrc
            .clone()
    }

    /// Number of datapoints consumed into history for `app_id` so far,
    /// i.e. `collected_data[app_id]["total_record"]` in the original —
    /// the quantity the warm-up gate counts against `init_phase_interval`,
    /// not the number of points on the MRC curve.
    pub fn get_total_records(&self, app_id: AppId) -> u64 {
        self.inner
            .lock()
            .apps
            .get(&app_id)
            .map(|s| s.collected.total_records)
            .unwrap_or(0)
    }

    /// Merges the bounded recent-measurement window into cache -> bw ->
    /// [perf] lists, for the Incremental/Fij allocators' "current
    /// performance" queries.
    pub fn collect_recent_measurement(&self, app_id: AppId) -> BTreeMap<u64, BTreeMap<u64, Vec<f64>>> {
        let inner = self.inner.lock();
        let mut merged: BTreeMap<u64, BTreeMap<u64, Vec<f64>>> = BTreeMap::new();
        let Some(state) = inner.apps.get(&app_id) else {
            return merged;
        };
        for snapshot in &state.recent {
            for (&cache, by_bw) in snapshot {
                for (&bw, &perf) in by_bw {
                    merged.entry(cache).or_default().entry(bw).or_default().push(perf);
                }
            }
        }
        merged
    }

    pub fn reset_metrics_for_app(&self, app_id: AppId) -> bool {
        let mut inner = self.inner.lock();
        match inner.apps.get_mut(&app_id) {
            Some(state) => {
                *state = AppState::default();
                true
            }
            None => false,
        }
    }

    /// Pulls one snapshot from the controller, filters noise, and buffers
    /// accepted samples. Empty/malformed snapshots and transport failures
    /// are logged and leave state untouched.
    pub async fn collect(&self, client: &ControllerClient, verification_th: f64) -> Result<()> {
        let snapshot = match client.fetch_snapshot().await {
            Ok(Some(s)) => s,
            Ok(None) => {
                tracing::debug!("empty snapshot from controller, skipping");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(error = %e, "snapshot fetch failed, proceeding with stale data");
                return Ok(());
            }
        };

        let mut inner = self.inner.lock();
        let interval = inner.allocation_interval_in_sec;
        // Records arrive roughly every 5s; only skip the noise window if the
        // interval spans more than skip_noise_after_alloc * 2 of them.
        let skip_eligible = interval > (SKIP_NOISE_AFTER_ALLOC as f64) * 5.0 * 2.0;

        let mut vm_map: BTreeMap<VmId, Vec<AppId>> = BTreeMap::new();

        for (vm_str, by_app) in &snapshot.map {
            let vm_id: VmId = match vm_str.parse() {
                Ok(v) => v,
                Err(_) => continue,
            };
            for (app_str, record) in by_app {
                let app_id: AppId = match app_str.parse() {
                    Ok(a) => a,
                    Err(_) => continue,
                };
                vm_map.entry(vm_id).or_default().push(app_id);

                let Some(state) = inner.apps.get_mut(&app_id) else {
                    continue;
                };

                if state.skip_next && skip_eligible {
                    state.skip_next = false;
                    continue;
                }
                state.skip_next = false;

                let (mem_mb_alloc, bw_mbps_alloc) = match state.last_allocation {
                    Some(a) => (a.cache_mb as f64, a.mem_bw_mbps as f64),
                    None => (record.mem_mb, record.bw_mbps),
                };

                if record.mem_mb > mem_mb_alloc * (1.0 + verification_th)
                    || record.bw_mbps > bw_mbps_alloc * (1.0 + verification_th)
                {
                    tracing::debug!(app_id, "dropping sample, raw usage exceeds allocation");
                    continue;
                }

                let sample = TelemetrySample {
                    vm_id,
                    mem_mb_alloc,
                    mem_mb_raw: record.mem_mb,
                    bw_mbps_alloc,
                    bw_mbps_raw: record.bw_mbps,
                    perf_proxy: record.cache_mbps,
                    access_rate: record.access_rate_ops_sec,
                    mrc: record.mrc.clone(),
                };

                let bucket = (mem_mb_alloc.round() as u64, bw_mbps_alloc.round() as u64);
                if let Some(&prev) = state.last_accepted_perf.get(&bucket) {
                    if (prev - sample.perf_proxy).abs() < f64::EPSILON {
                        tracing::debug!(app_id, "dropping duplicate perf sample");
                        continue;
                    }
                }
                state.last_accepted_perf.insert(bucket, sample.perf_proxy);

                state
                    .buffered
                    .entry(bucket.0)
                    .or_default()
                    .entry(bucket.1)
                    .or_default()
                    .push(sample.perf_proxy);

                if let Some(mrc) = &sample.mrc {
                    state.buffered_mrc = Some(match state.buffered_mrc.take() {
                        Some(old) => weighted_merge_mrc(&old, mrc, EWMA_ALPHA),
                        None => mrc.clone(),
                    });
                }

                state.last_usage = Some(match state.last_usage.take() {
                    Some(old) => weighted_merge_sample(&old, &sample, EWMA_ALPHA),
                    None => sample,
                });
            }
        }

        inner.vm_to_app_map = vm_map;
        Ok(())
    }

    /// Drains the per-iteration buffer into persistent history (median
    /// perf per bucket), advances the iteration counter, and updates the
    /// recent-measurement window.
    pub fn consume_collected_data(&self) {
        let mut inner = self.inner.lock();
        let iteration = inner.iteration;

        for state in inner.apps.values_mut() {
            if state.buffered.is_empty() {
                tracing::debug!("no buffered data to consume, using stale history");
                continue;
            }

            let mut recent_snapshot: RecentSnapshot = BTreeMap::new();

            for (&cache, by_bw) in &state.buffered {
                for (&bw, perfs) in by_bw {
                    let median = median(perfs);
                    state
                        .collected
                        .datapoints
                        .entry(cache)
                        .or_default()
                        .entry(bw)
                        .or_default()
                        .push((median, iteration));
                    state.collected.total_records += perfs.len() as u64;
                    recent_snapshot.entry(cache).or_default().insert(bw, median);
                }
            }

            state.collected.total_unique_points = state
                .collected
                .datapoints
                .values()
                .map(|m| m.len() as u64)
                .sum();
            state.collected.last_mrc = state.buffered_mrc.clone();
            state.collected.last_update_iteration = iteration;

            state.recent.push_back(recent_snapshot);
            while state.recent.len() > RECENT_WINDOW {
                state.recent.pop_front();
            }

            state.buffered.clear();
            // buffered_mrc is intentionally NOT cleared here: it is the
            // running EWMA accumulator and carries forward across
            // iterations so next iteration's merge smooths against this
            // iteration's result, not a blank slate.
        }

        inner.iteration += 1;
    }
}

/// Test-only seam: populates one app's MRC, last usage, and a recent
/// measurement point directly, bypassing the async `collect()` path so
/// unit tests elsewhere in the crate can exercise the estimator and the
/// Incremental/Fij allocators without a mock controller.
#[cfg(test)]
impl Monitor {
    pub(crate) fn seed_for_test(&self, app_id: AppId, mrc: Mrc, usage: TelemetrySample, recent_points: &[(u64, u64, f64)]) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.apps.get_mut(&app_id) {
            state.collected.last_mrc = Some(mrc);
            state.last_usage = Some(usage);
            let mut snapshot: RecentSnapshot = BTreeMap::new();
            for &(cache, bw, perf) in recent_points {
                snapshot.entry(cache).or_default().insert(bw, perf);
            }
            state.recent.push_back(snapshot);
        }
    }

    pub(crate) fn set_vm_map_for_test(&self, vm_map: BTreeMap<VmId, Vec<AppId>>) {
        self.inner.lock().vm_to_app_map = vm_map;
    }
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// EWMA merge of two MRCs; requires identical cache-size grids, otherwise
/// the new curve replaces the old one wholesale.
fn weighted_merge_mrc(old: &Mrc, new: &Mrc, alpha: f64) -> Mrc {
    if old.len() != new.len() {
        return new.clone();
    }
    old.iter()
        .zip(new.iter())
        .map(|(o, n)| {
            if (o.cache_mb - n.cache_mb).abs() > f64::EPSILON {
                return *n;
            }
            MrcPoint {
                cache_mb: n.cache_mb,
                miss_rate: alpha * n.miss_rate + (1.0 - alpha) * o.miss_rate,
            }
        })
        .collect()
}

fn weighted_merge_sample(old: &TelemetrySample, new: &TelemetrySample, alpha: f64) -> TelemetrySample {
    TelemetrySample {
        vm_id: new.vm_id,
        mem_mb_alloc: new.mem_mb_alloc,
        mem_mb_raw: alpha * new.mem_mb_raw + (1.0 - alpha) * old.mem_mb_raw,
        bw_mbps_alloc: new.bw_mbps_alloc,
        bw_mbps_raw: alpha * new.bw_mbps_raw + (1.0 - alpha) * old.bw_mbps_raw,
        perf_proxy: alpha * new.perf_proxy + (1.0 - alpha) * old.perf_proxy,
        access_rate: alpha * new.access_rate + (1.0 - alpha) * old.access_rate,
        mrc: new.mrc.clone().or_else(|| old.mrc.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_only_the_requested_app() {
        let monitor = Monitor::new([1, 2], 60.0);
        {
            let mut inner = monitor.inner.lock();
            inner.apps.get_mut(&1).unwrap().collected.total_records = 5;
            inner.apps.get_mut(&2).unwrap().collected.total_records = 9;
        }
        assert!(monitor.reset_metrics_for_app(1));
        let inner = monitor.inner.lock();
        assert_eq!(inner.apps.get(&1).unwrap().collected.total_records, 0);
        assert_eq!(inner.apps.get(&2).unwrap().collected.total_records, 9);
    }

    #[test]
    fn reset_unknown_app_returns_false() {
        let monitor = Monitor::new([1], 60.0);
        assert!(!monitor.reset_metrics_for_app(42));
    }

    #[test]
    fn median_computes_correctly_for_even_and_odd() {
        assert_eq!(median(&[1.0, 2.0, 3.0]), 2.0);
        assert_eq!(median(&[1.0, 2.0, 3.0, 4.0]), 2.5);
    }
}
