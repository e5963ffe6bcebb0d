// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use prometheus::{
    IntCounterVec, IntGaugeVec, Opts, Registry,
    core::{AtomicI64, AtomicU64, GenericCounter, GenericGauge},
    register_int_counter_vec_with_registry, register_int_gauge_vec_with_registry,
};
use std::sync::Arc;

pub const REQUESTED_BYTES: &str = "requested_bytes";
pub const LIVE_BYTES: &str = "live_bytes";
pub const ACTIVE_BLOCKS: &str = "active_blocks";
pub const CACHED_BLOCKS: &str = "cached_blocks";
pub const DEDICATED_BLOCKS: &str = "dedicated_blocks";
pub const CAPACITY_BYTES: &str = "capacity_bytes";
pub const OVERFLOW_BYTES: &str = "overflow_bytes";

pub const REGIONS_ACQUIRED: &str = "regions_acquired";
pub const REGIONS_RELEASED: &str = "regions_released";
pub const OVERFLOW_ALLOCATIONS: &str = "overflow_allocations";
pub const MIGRATIONS: &str = "migrations";

pub struct MemoryMetrics {
    gauges: IntGaugeVec,
    counters: IntCounterVec,
}

impl MemoryMetrics {
    pub fn new(metrics_registry: &Arc<Registry>) -> Result<Arc<Self>> {
        let gauge_opts = Opts::new("gauges", "Gauges for the memory pools")
            .namespace("blockpool")
            .subsystem("memory");

        let counter_opts = Opts::new("counters", "Counters for the memory pools")
            .namespace("blockpool")
            .subsystem("memory");

        let gauges = register_int_gauge_vec_with_registry!(
            gauge_opts,
            &["pool", "metric_type"],
            metrics_registry
        )?;

        let counters = register_int_counter_vec_with_registry!(
            counter_opts,
            &["pool", "metric_type"],
            metrics_registry
        )?;

        Ok(Arc::new(Self { gauges, counters }))
    }

    pub fn pool(self: &Arc<Self>, name: &str) -> Arc<PoolMetrics> {
        PoolMetrics::new(self, name)
    }
}

impl std::fmt::Debug for MemoryMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMetrics").finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct PoolMetrics {
    memory_metrics: Arc<MemoryMetrics>,
    pool: String,
}

impl PoolMetrics {
    pub fn new(memory_metrics: &Arc<MemoryMetrics>, pool: &str) -> Arc<Self> {
        Arc::new(Self {
            memory_metrics: memory_metrics.clone(),
            pool: pool.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.pool
    }

    pub fn gauge(&self, metric_type: &str) -> GenericGauge<AtomicI64> {
        self.memory_metrics
            .gauges
            .with_label_values(&[self.pool.as_str(), metric_type])
    }

    pub fn counter(&self, metric_type: &str) -> GenericCounter<AtomicU64> {
        self.memory_metrics
            .counters
            .with_label_values(&[self.pool.as_str(), metric_type])
    }

    /// Set a gauge from an unsigned quantity, saturating at `i64::MAX`.
    pub(crate) fn set(&self, metric_type: &str, value: u64) {
        self.gauge(metric_type)
            .set(i64::try_from(value).unwrap_or(i64::MAX));
    }

    pub(crate) fn inc(&self, metric_type: &str) {
        self.counter(metric_type).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_metrics_are_labelled() {
        let registry = Arc::new(Registry::new());
        let metrics = MemoryMetrics::new(&registry).unwrap();
        let device = metrics.pool("device");
        let host = metrics.pool("host");

        device.set(LIVE_BYTES, 4096);
        device.inc(REGIONS_ACQUIRED);
        host.set(LIVE_BYTES, 1);

        assert_eq!(device.gauge(LIVE_BYTES).get(), 4096);
        assert_eq!(device.counter(REGIONS_ACQUIRED).get(), 1);
        assert_eq!(host.gauge(LIVE_BYTES).get(), 1);

        let families = registry.gather();
        let names: Vec<_> = families.iter().map(|f| f.name().to_string()).collect();
        assert!(names.contains(&"blockpool_memory_gauges".to_string()));
        assert!(names.contains(&"blockpool_memory_counters".to_string()));
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Arc::new(Registry::new());
        let _first = MemoryMetrics::new(&registry).unwrap();
        assert!(MemoryMetrics::new(&registry).is_err());
    }
}
