// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Seeded random workload against a block [`Pool`] and a [`GrowablePool`] backed by system memory.
//!
//! Run with: cargo run --package blockpool-sim -- --iterations 10000 --seed 7

use anyhow::{Context, Result};
use blockpool_memory::pool::{BufferPoolStats, CheckpointOutcome};
use blockpool_memory::{
    Allocation, BufferAllocation, BufferPoolConfig, GrowablePool, MemoryMetrics, Pool,
    PoolConfig, PoolStats, SystemBackingStore,
};
use clap::Parser;
use prometheus::{Encoder, Registry, TextEncoder};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug, Clone)]
#[command(name = "blockpool-sim")]
#[command(about = "Exercise the block pool and growable buffer pool with a random workload")]
pub struct Args {
    /// Size of each pooled block in bytes
    #[arg(long)]
    pub block_size: Option<u64>,

    /// Minimum allocation granularity in bytes
    #[arg(long)]
    pub granularity: Option<u64>,

    /// Fraction of active blocks kept in the free-block cache
    #[arg(long)]
    pub retention_ratio: Option<f64>,

    /// Initial capacity of the growable buffer pool in bytes
    #[arg(long)]
    pub buffer_capacity: Option<u64>,

    /// TOML file with `[pool]` and `[buffer_pool]` tables
    #[arg(long, env = "BLOCKPOOL_CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// Number of workload steps
    #[arg(long, default_value = "10000")]
    pub iterations: u64,

    /// Largest single request in bytes
    #[arg(long, default_value = "262144")]
    pub max_alloc: u64,

    /// Request a dedicated region every N allocations (0 = never)
    #[arg(long, default_value = "0")]
    pub dedicated_every: u64,

    /// Checkpoint the growable buffer pool every N steps
    #[arg(long, default_value = "64")]
    pub checkpoint_every: u64,

    /// Random seed for reproducibility
    #[arg(long, default_value = "42")]
    pub seed: u64,

    /// Print the Prometheus exposition to stderr
    #[arg(long)]
    pub metrics: bool,
}

#[derive(Debug, Default, Serialize)]
pub struct Counters {
    pub allocations: u64,
    pub frees: u64,
    pub dedicated: u64,
    pub overflowed: u64,
    pub peak_live: u64,
}

#[derive(Debug, Serialize)]
pub struct Report {
    pub seed: u64,
    pub iterations: u64,
    pub pool: PoolStats,
    pub pool_config: PoolConfig,
    pub pool_counters: Counters,
    pub buffer_pool: BufferPoolStats,
    pub buffer_pool_config: BufferPoolConfig,
    pub buffer_counters: Counters,
    pub checkpoints: u64,
    pub growths: Vec<(u64, u64)>,
    #[serde(skip)]
    pub metrics_text: String,
}

fn pool_config(args: &Args) -> Result<PoolConfig> {
    let mut builder = PoolConfig::builder();
    if let Some(block_size) = args.block_size {
        builder.block_size(block_size);
    }
    if let Some(granularity) = args.granularity {
        builder.minimum_granularity(granularity);
    }
    if let Some(retention_ratio) = args.retention_ratio {
        builder.retention_ratio(retention_ratio);
    }
    builder
        .build_with_settings_from(args.config.as_deref())
        .context("invalid pool configuration")
}

fn buffer_pool_config(args: &Args) -> Result<BufferPoolConfig> {
    let mut builder = BufferPoolConfig::builder();
    if let Some(capacity) = args.buffer_capacity {
        builder.initial_capacity(capacity);
    }
    if let Some(granularity) = args.granularity {
        builder.minimum_granularity(granularity);
    }
    builder
        .build_with_settings_from(args.config.as_deref())
        .context("invalid buffer pool configuration")
}

/// Run the workload and collect the final statistics.
pub fn run(args: &Args) -> Result<Report> {
    anyhow::ensure!(args.max_alloc > 0, "--max-alloc must be positive");
    anyhow::ensure!(args.checkpoint_every > 0, "--checkpoint-every must be positive");

    let pool_config = pool_config(args)?;
    let buffer_pool_config = buffer_pool_config(args)?;
    tracing::info!(?pool_config, ?buffer_pool_config, seed = args.seed, "starting workload");

    let registry = Arc::new(Registry::new());
    let metrics = MemoryMetrics::new(&registry)?;
    let store = Arc::new(SystemBackingStore::new());

    let mut pool =
        Pool::new(store.clone(), pool_config.clone()).with_metrics(metrics.pool("blocks"));
    let mut buffers = GrowablePool::new(store.clone(), store.clone(), buffer_pool_config.clone())?
        .with_metrics(metrics.pool("upload"));

    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut live: Vec<Allocation> = Vec::new();
    let mut transient: Vec<BufferAllocation> = Vec::new();
    let mut pool_counters = Counters::default();
    let mut buffer_counters = Counters::default();
    let mut checkpoints = 0;
    let mut growths = Vec::new();

    for step in 0..args.iterations {
        if !live.is_empty() && rng.random_bool(0.45) {
            let allocation = live.swap_remove(rng.random_range(0..live.len()));
            pool.free(allocation)?;
            pool_counters.frees += 1;
        } else {
            let size = rng.random_range(1..=args.max_alloc);
            let align = 1u64 << rng.random_range(0..8);
            pool_counters.allocations += 1;
            let dedicated =
                args.dedicated_every > 0 && pool_counters.allocations % args.dedicated_every == 0;
            let allocation = pool.allocate(size, align, dedicated)?;
            if allocation.is_dedicated() {
                pool_counters.dedicated += 1;
            }
            live.push(allocation);
        }
        pool_counters.peak_live = pool_counters.peak_live.max(pool.stats().live);

        let allocation = buffers.allocate(rng.random_range(1..=args.max_alloc / 4 + 1), 0)?;
        buffer_counters.allocations += 1;
        if buffers.locate(&allocation)?.overflow {
            buffer_counters.overflowed += 1;
        }
        transient.push(allocation);
        buffer_counters.peak_live = buffer_counters.peak_live.max(buffers.stats().live);

        if (step + 1) % args.checkpoint_every == 0 {
            for allocation in transient.drain(..) {
                buffers.free(allocation)?;
                buffer_counters.frees += 1;
            }
            let token = buffers.wait_until_idle()?;
            if let CheckpointOutcome::Grown { from, to } = buffers.checkpoint(token)? {
                tracing::info!(step, from, to, "buffer pool grew");
                growths.push((from, to));
            }
            checkpoints += 1;
        }
    }

    for allocation in live.drain(..) {
        pool.free(allocation)?;
        pool_counters.frees += 1;
    }
    for allocation in transient.drain(..) {
        buffers.free(allocation)?;
        buffer_counters.frees += 1;
    }

    let mut metrics_text = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut metrics_text)?;

    Ok(Report {
        seed: args.seed,
        iterations: args.iterations,
        pool: pool.stats(),
        pool_config,
        pool_counters,
        buffer_pool: buffers.stats(),
        buffer_pool_config,
        buffer_counters,
        checkpoints,
        growths,
        metrics_text: String::from_utf8(metrics_text)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["blockpool-sim", "--iterations", "500", "--max-alloc", "16384"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_workload_drains_every_pool() {
        let report = run(&args(&["--block-size", "65536", "--dedicated-every", "7"])).unwrap();
        assert_eq!(report.pool.live, 0);
        assert_eq!(report.pool.live_allocations, 0);
        assert_eq!(report.pool.active_blocks, 0);
        assert_eq!(report.pool.dedicated_blocks, 0);
        assert!(report.pool_counters.dedicated > 0);
        assert_eq!(
            report.pool_counters.allocations,
            report.pool_counters.frees
        );
        assert_eq!(report.buffer_pool.live, 0);
        assert!(report.metrics_text.contains("blockpool_memory_gauges"));
    }

    #[test]
    fn test_same_seed_same_report() {
        let first = run(&args(&["--seed", "9"])).unwrap();
        let second = run(&args(&["--seed", "9"])).unwrap();
        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
    }

    #[test]
    fn test_small_buffer_grows() {
        let report = run(&args(&["--buffer-capacity", "16384", "--granularity", "1024"])).unwrap();
        assert!(!report.growths.is_empty());
        assert!(report.buffer_pool.capacity > 16384);
        assert!(report.buffer_pool.capacity.is_power_of_two());
    }

    #[test]
    fn test_invalid_overrides_are_rejected() {
        let err = run(&args(&["--granularity", "3000"])).unwrap_err();
        assert!(err.to_string().contains("invalid pool configuration"));
    }
}
