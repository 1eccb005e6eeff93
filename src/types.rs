//! Core data model: applications, VMs, resource scale, allocations, and the
//! telemetry shapes that flow between the monitor, estimator, and allocator.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type AppId = u32;
pub type VmId = u32;

/// Which resource an application's profile favors when a policy has to
/// decide a tie-breaking direction (Fij, Oracle's sensitivity fallback).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    Cache,
    MemBw,
}

/// Static, per-run configuration for one application. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub app_id: AppId,
    pub sensitivity: Sensitivity,
    pub oracle_allocation: Option<ResourcePair<u64>>,
    pub clip_l3miss: Option<f64>,
    pub clip_iteration: Option<f64>,
}

/// A (cache, mem_bw) pair of the same unit, used for both denormalized MB/Mbps
/// amounts and normalized [0,1] fractions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourcePair<T> {
    pub cache: T,
    pub mem_bw: T,
}

impl<T: Copy> ResourcePair<T> {
    pub fn new(cache: T, mem_bw: T) -> Self {
        Self { cache, mem_bw }
    }
}

/// Pool totals and clamps shared by every application on a VM.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceScale {
    pub cache_total_mb: u64,
    pub min_cache_mb: u64,
    pub max_cache_mb: u64,
    pub mem_bw_total_mbps: u64,
    pub min_mem_bw_mbps: u64,
    pub max_mem_bw_mbps: u64,
}

impl ResourceScale {
    pub fn min_cache_norm(&self) -> f64 {
        self.min_cache_mb as f64 / self.cache_total_mb as f64
    }
    pub fn max_cache_norm(&self) -> f64 {
        self.max_cache_mb as f64 / self.cache_total_mb as f64
    }
    pub fn min_mem_bw_norm(&self) -> f64 {
        self.min_mem_bw_mbps as f64 / self.mem_bw_total_mbps as f64
    }
    pub fn max_mem_bw_norm(&self) -> f64 {
        self.max_mem_bw_mbps as f64 / self.mem_bw_total_mbps as f64
    }
}

/// A normalized allocation in [0, 1] per resource, as produced by PTAS and
/// consumed by the policies before denormalization for the deployer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct NormAlloc {
    pub cache: f64,
    pub mem_bw: f64,
}

impl NormAlloc {
    pub fn new(cache: f64, mem_bw: f64) -> Self {
        Self { cache, mem_bw }
    }

    pub fn denormalize(&self, scale: &ResourceScale) -> Allocation {
        Allocation {
            cache_mb: (self.cache * scale.cache_total_mb as f64) as u64,
            mem_bw_mbps: (self.mem_bw * scale.mem_bw_total_mbps as f64) as u64,
        }
    }
}

/// A final, denormalized per-app allocation ready to be published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub cache_mb: u64,
    pub mem_bw_mbps: u64,
}

/// Price vector used by the market-clearing (Spirit) binary search. The two
/// components live on the unit simplex during the search.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PriceVector {
    pub cache: f64,
    pub mem_bw: f64,
}

impl PriceVector {
    pub fn mid(left: PriceVector, right: PriceVector) -> PriceVector {
        PriceVector {
            cache: (left.cache + right.cache) / 2.0,
            mem_bw: (left.mem_bw + right.mem_bw) / 2.0,
        }
    }
}

/// Which resource clamp a PTAS winner hit, and in which direction, so the
/// Spirit allocator can decide which side of the price bracket to move.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimited {
    pub cache_min_limit: bool,
    pub cache_max_limit: bool,
    pub mem_bw_min_limit: bool,
    pub mem_bw_max_limit: bool,
}

impl ResourceLimited {
    pub fn update(&mut self, other: ResourceLimited) {
        self.cache_min_limit |= other.cache_min_limit;
        self.cache_max_limit |= other.cache_max_limit;
        self.mem_bw_min_limit |= other.mem_bw_min_limit;
        self.mem_bw_max_limit |= other.mem_bw_max_limit;
    }

    pub fn is_resource_limited(&self) -> bool {
        self.cache_min_limit || self.cache_max_limit || self.mem_bw_min_limit || self.mem_bw_max_limit
    }
}

/// One point in a sampled miss-ratio curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MrcPoint {
    pub cache_mb: f64,
    pub miss_rate: f64,
}

/// A sampled MRC, sorted ascending by `cache_mb`.
pub type Mrc = Vec<MrcPoint>;

/// Per-app, per-snapshot telemetry record as parsed off the wire, after
/// `last_allocation` override and before noise filtering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub vm_id: VmId,
    pub mem_mb_alloc: f64,
    pub mem_mb_raw: f64,
    pub bw_mbps_alloc: f64,
    pub bw_mbps_raw: f64,
    pub perf_proxy: f64,
    pub access_rate: f64,
    pub mrc: Option<Mrc>,
}

/// The resource decision history used by the Incremental Trade allocator to
/// judge whether its last nudge helped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResType {
    Cache,
    MemBw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy)]
pub struct AllocationDecision {
    pub res_type: ResType,
    pub direction: Direction,
    pub performance_at_decision: f64,
    pub timestamp: u64,
}

/// Wire shape of one snapshot record, as returned by the controller's
/// collect route: `{"map": {"<vm_id>": {"<app_id>": {...}}}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSnapshotRecord {
    pub mem_mb: f64,
    pub bw_mbps: f64,
    pub cache_mbps: f64,
    #[serde(default)]
    pub miss_rate_ops_sec: f64,
    #[serde(default)]
    pub access_rate_ops_sec: f64,
    #[serde(default)]
    pub hit_rate_percent: f64,
    #[serde(default)]
    pub mrc: Option<Mrc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSnapshot {
    pub map: BTreeMap<String, BTreeMap<String, RawSnapshotRecord>>,
}

/// Map shipped to the controller's deploy route:
/// `{"allocation_map": {"<app_id>": [cache_MB, mem_bw_Mbps]}}`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeployPayload {
    pub allocation_map: BTreeMap<String, [u64; 2]>,
}
