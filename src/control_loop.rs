//! Single-threaded cooperative control loop: static warm-up, then a
//! collect → allocate → publish → sleep cycle per iteration.
//!
//! Grounded on `allocators/allocator_base.py::ResourceAllocator.start`.

use crate::allocator::{denormalize_all, fij, incremental, needs_warmup, oracle, spirit, static_alloc, static_allocation, AllocatorContext, Policy};
use crate::config::Config;
use crate::controller_client::ControllerClient;
use crate::error::Result;
use crate::estimator::Estimator;
use crate::monitor::Monitor;
use crate::types::{AppId, NormAlloc, ResourceScale};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub struct ControlLoop<'a> {
    config: &'a Config,
    monitor: Arc<Monitor>,
    client: ControllerClient,
    policy: Policy,
    app_ids: Vec<AppId>,
}

impl<'a> ControlLoop<'a> {
    /// `monitor` is shared with the admin HTTP server so that
    /// `POST /reset_metrics` mutates the same history the control loop
    /// reads from.
    pub fn new(config: &'a Config, monitor: Arc<Monitor>, policy: Policy) -> Self {
        let client = ControllerClient::new(
            config.resource_controller.base_url.clone(),
            config.resource_controller.collect_route.clone(),
            config.resource_controller.deploy_route.clone(),
        );
        Self {
            config,
            monitor,
            client,
            policy,
            app_ids: config.app_ids(),
        }
    }

    pub async fn run(&mut self, max_iteration: u64) -> Result<()> {
        let scale = self.config.resource_scale();
        let epsilon = self.config.allocation_parameters.epsilon;
        let verification_th = self.config.allocation_parameters.verification_th;
        let interval_sec = self.config.allocation_parameters.allocation_interval_in_sec;
        let init_timer = self.config.allocation_parameters.init_timer;

        tracing::info!(policy = self.policy.name(), apps = self.app_ids.len(), "starting control loop");

        let vm_map = self.monitor.get_vm_to_app_mapping();
        let initial = static_allocation(&vm_map, &self.app_ids, self.config.num_vms());
        self.publish(&initial, &scale).await?;
        tokio::time::sleep(Duration::from_secs(10)).await;

        tracing::info!(seconds = init_timer, "cache warm-up countdown starting");
        let mut remaining = init_timer;
        while remaining > 0 {
            let step = remaining.min(10);
            tokio::time::sleep(Duration::from_secs(step)).await;
            remaining -= step;
            tracing::debug!(remaining_seconds = remaining, "warm-up countdown");
        }

        for iteration in 0..max_iteration {
            let alloc = {
                let ctx = AllocatorContext {
                    monitor: &self.monitor,
                    estimator: Estimator::new(&self.monitor),
                    config: self.config,
                    scale,
                    epsilon,
                };

                if needs_warmup(&ctx, &self.app_ids) {
                    static_allocation(&ctx.monitor.get_vm_to_app_mapping(), &self.app_ids, self.config.num_vms())
                } else {
                    match &mut self.policy {
                        Policy::Spirit(state) => spirit::allocate_and_parse(&ctx, &self.app_ids, state),
                        Policy::IncrementalTrade(state) => incremental::allocate_and_parse(&ctx, &self.app_ids, state),
                        Policy::FijTrade(state) => fij::allocate_and_parse(&ctx, &self.app_ids, state),
                        Policy::Oracle => oracle::allocate_and_parse(&ctx, &self.app_ids),
                        Policy::Static => static_alloc::allocate_and_parse(&ctx, &self.app_ids),
                    }
                }
            };

            self.publish(&alloc, &scale).await?;

            let measurements_per_alloc = ((interval_sec * 0.25).floor() as u64).max(1);
            let sleep_per = Duration::from_secs_f64(interval_sec / measurements_per_alloc as f64);
            for _ in 0..measurements_per_alloc {
                tokio::time::sleep(sleep_per).await;
                self.monitor.collect(&self.client, verification_th).await?;
            }
            self.monitor.consume_collected_data();

            tracing::info!(iteration, "iteration complete");
        }

        tracing::info!("control loop finished, max_iteration reached");
        Ok(())
    }

    async fn publish(&self, alloc: &BTreeMap<AppId, NormAlloc>, scale: &ResourceScale) -> Result<()> {
        let denorm = denormalize_all(alloc, scale);
        self.monitor.set_last_allocation(&denorm);
        self.client.deploy(&denorm).await
    }
}
