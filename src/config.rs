//! JSON configuration file loading, mirroring the teacher's plain
//! `Config::load(path) -> Result<Self>` shape rather than a builder.

use crate::error::{AllocError, Result};
use crate::types::{AppId, Sensitivity, VmId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    pub name: String,
    pub total_cache_in_mb: u64,
    pub total_mem_bw_in_mbps: u64,
    #[serde(default)]
    pub min_cache_in_mb: Option<u64>,
    #[serde(default)]
    pub max_cache_in_mb: Option<u64>,
    #[serde(default)]
    pub min_mem_bw_in_mbps: Option<u64>,
    #[serde(default)]
    pub max_mem_bw_in_mbps: Option<u64>,
    #[serde(default = "default_num_vms")]
    pub num_vms: u32,
}

fn default_num_vms() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResourceControllerConfig {
    pub base_url: String,
    pub collect_route: String,
    pub deploy_route: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AllocationParameters {
    #[serde(default = "default_interval")]
    pub allocation_interval_in_sec: f64,
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    #[serde(default = "default_init_timer")]
    pub init_timer: u64,
    #[serde(default = "default_verification_th")]
    pub verification_th: f64,
}

fn default_interval() -> f64 {
    60.0
}
fn default_epsilon() -> f64 {
    0.005
}
fn default_init_timer() -> u64 {
    180
}
fn default_verification_th() -> f64 {
    0.025
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProfileConfig {
    pub user_id: AppId,
    #[serde(default)]
    pub file: Option<String>,
    pub sensitivity: Sensitivity,
    #[serde(default)]
    pub oracle_allocation: Option<OracleAllocationConfig>,
    #[serde(default)]
    pub clip_l3miss: Option<f64>,
    #[serde(default)]
    pub clip_iteration: Option<f64>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct OracleAllocationConfig {
    pub cache: u64,
    pub mem_bw: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub cluster: ClusterConfig,
    pub resource_controller: ResourceControllerConfig,
    #[serde(default)]
    pub benchmark_map: BTreeMap<String, String>,
    #[serde(default)]
    pub allocation_parameters: AllocationParameters,
    #[serde(default)]
    pub profiles: Vec<ProfileConfig>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let mut config: Config = serde_json::from_str(&text)?;
        config.fill_defaults();
        config.validate()?;
        Ok(config)
    }

    fn fill_defaults(&mut self) {
        let c = &mut self.cluster;
        if c.min_cache_in_mb.is_none() {
            c.min_cache_in_mb = Some(0);
        }
        if c.max_cache_in_mb.is_none() {
            c.max_cache_in_mb = Some(c.total_cache_in_mb);
        }
        if c.min_mem_bw_in_mbps.is_none() {
            c.min_mem_bw_in_mbps = Some(0);
        }
        if c.max_mem_bw_in_mbps.is_none() {
            c.max_mem_bw_in_mbps = Some(c.total_mem_bw_in_mbps);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.cluster.total_cache_in_mb == 0 {
            return Err(AllocError::ConfigInvalid(
                "cluster.total_cache_in_mb must be positive".into(),
            ));
        }
        if self.cluster.total_mem_bw_in_mbps == 0 {
            return Err(AllocError::ConfigInvalid(
                "cluster.total_mem_bw_in_mbps must be positive".into(),
            ));
        }
        if self.resource_controller.base_url.is_empty() {
            return Err(AllocError::ConfigInvalid(
                "resource_controller.base_url must not be empty".into(),
            ));
        }
        if self.profiles.is_empty() {
            return Err(AllocError::ConfigInvalid(
                "profiles must contain at least one application".into(),
            ));
        }
        Ok(())
    }

    pub fn resource_scale(&self) -> crate::types::ResourceScale {
        crate::types::ResourceScale {
            cache_total_mb: self.cluster.total_cache_in_mb,
            min_cache_mb: self.cluster.min_cache_in_mb.unwrap_or(0),
            max_cache_mb: self
                .cluster
                .max_cache_in_mb
                .unwrap_or(self.cluster.total_cache_in_mb),
            mem_bw_total_mbps: self.cluster.total_mem_bw_in_mbps,
            min_mem_bw_mbps: self.cluster.min_mem_bw_in_mbps.unwrap_or(0),
            max_mem_bw_mbps: self
                .cluster
                .max_mem_bw_in_mbps
                .unwrap_or(self.cluster.total_mem_bw_in_mbps),
        }
    }

    pub fn num_vms(&self) -> u32 {
        self.cluster.num_vms.max(1)
    }

    pub fn app_ids(&self) -> Vec<AppId> {
        self.profiles.iter().map(|p| p.user_id).collect()
    }
}

/// CLI-level overrides applied on top of a loaded [`Config`], matching
/// `res_allocation`'s argparse-driven overrides in `main_memcached.py`.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub allocation_interval_in_sec: Option<f64>,
}

impl Config {
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(interval) = overrides.allocation_interval_in_sec {
            self.allocation_parameters.allocation_interval_in_sec = interval;
        }
    }
}

/// VM identifiers are discovered at runtime from telemetry, not configured
/// up front; this placeholder keeps the type visible for documentation
/// purposes where a `VmId` default is needed before the first snapshot.
pub const UNASSIGNED_VM: VmId = 0;
