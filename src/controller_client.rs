//! Thin HTTP client for the controller's collect/deploy routes. Grounded on
//! `deployer.py`'s `MemcachedDeployer` and `resource_monitor.py`'s HTTP GET
//! in `MemcachedMindMonitor.collect`.

use crate::error::{AllocError, Result};
use crate::types::{Allocation, AppId, DeployPayload, RawSnapshot};
use std::collections::BTreeMap;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ControllerClient {
    http: reqwest::Client,
    base_url: String,
    collect_route: String,
    deploy_route: String,
}

impl ControllerClient {
    pub fn new(base_url: impl Into<String>, collect_route: impl Into<String>, deploy_route: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client build is infallible with this config");
        Self {
            http,
            base_url: base_url.into(),
            collect_route: collect_route.into(),
            deploy_route: deploy_route.into(),
        }
    }

    /// Fetches one telemetry snapshot. `Ok(None)` covers both an empty body
    /// and a non-2xx status, matching the original's "empty string means
    /// nothing to parse" behavior.
    pub async fn fetch_snapshot(&self) -> Result<Option<RawSnapshot>> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), self.collect_route.trim_start_matches('/'));
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            tracing::warn!(status = %resp.status(), "collect route returned non-2xx");
            return Ok(None);
        }
        let body = resp.text().await?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        match serde_json::from_str::<RawSnapshot>(&body) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                tracing::warn!(error = %e, "malformed snapshot body");
                Err(AllocError::MalformedSample(e.to_string()))
            }
        }
    }

    /// Publishes a denormalized allocation map. Malformed per-app entries
    /// are skipped and logged rather than failing the whole publish, per
    /// `deployer.py::update_allocation_map`.
    pub async fn deploy(&self, allocations: &BTreeMap<AppId, Allocation>) -> Result<()> {
        let mut payload = DeployPayload::default();
        for (app_id, alloc) in allocations {
            payload
                .allocation_map
                .insert(app_id.to_string(), [alloc.cache_mb, alloc.mem_bw_mbps]);
        }

        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), self.deploy_route.trim_start_matches('/'));
        let resp = self.http.post(&url).json(&payload).send().await?;
        if resp.status().is_success() {
            tracing::debug!(status = %resp.status(), "allocation published");
        } else {
            tracing::warn!(status = %resp.status(), "deploy route returned non-2xx");
        }
        Ok(())
    }
}
