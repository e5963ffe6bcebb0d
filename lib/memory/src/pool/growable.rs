// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # Growable Buffer Pool
//!
//! A [`GrowablePool`] sub-allocates a single linear main buffer through a
//! [`VirtualRange`]. When the main buffer cannot fit a request, the request is served at once from
//! a private overflow region, so producers never stall. Growth is deferred to a caller-chosen
//! checkpoint:
//!
//! ```text
//! Stable --(main buffer full)--> Overflowing --(checkpoint)--> Migrating --> Stable
//! ```
//!
//! Migration replaces the main buffer with one of capacity
//! `next_power_of_two(capacity + overflow bytes)`, copies every live allocation into it, and
//! releases the overflow regions. Because allocations move, a [`BufferAllocation`] does not carry a
//! location; [`GrowablePool::locate`] resolves the current one.
//!
//! The device must not be using the old buffers while they are destroyed. Every `locate` is taken
//! to mean the returned slice may be referenced by in-flight work, and [`GrowablePool::checkpoint`]
//! only migrates with an [`IdleToken`] obtained after the last `locate`.

use super::config::BufferPoolConfig;
use super::{next_pool_id, normalize_request};
use crate::backing::{BackingStore, CommandSubmission, RegionHandle};
use crate::metrics::{self, PoolMetrics};
use crate::range::{RangeAllocator, VirtualRange};
use crate::{AllocError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use validator::Validate;

/// Lifecycle of a [`GrowablePool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum PoolState {
    /// Every live allocation sits in the main buffer.
    Stable,

    /// Some allocations were served from overflow regions since the last checkpoint.
    Overflowing {
        /// Bytes placed in overflow regions since the last checkpoint.
        overflow_bytes: u64,
    },

    /// The main buffer is being replaced.
    Migrating,

    /// A migration failed part-way. The pool refuses further work.
    Poisoned,
}

/// The caller's handle to a live range inside a [`GrowablePool`].
///
/// The range may move at every checkpoint; use [`GrowablePool::locate`] to find it.
#[must_use = "buffer allocations must be returned with GrowablePool::free"]
#[derive(Debug, PartialEq, Eq)]
pub struct BufferAllocation {
    pool: u64,
    id: u64,
    size: u64,
}

impl BufferAllocation {
    /// Size in bytes, rounded up to the pool granularity.
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Where an allocation lives right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferSlice {
    pub region: RegionHandle,
    pub offset: u64,
    pub size: u64,
    /// Host address of the first byte, for host-visible pools.
    pub host_addr: Option<usize>,
    /// `true` when the slice lives in a private overflow region.
    pub overflow: bool,
}

/// Proof that the device was idle as of a given submission epoch.
#[must_use]
#[derive(Debug)]
pub struct IdleToken {
    pool: u64,
    epoch: u64,
}

/// Result of a [`GrowablePool::checkpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointOutcome {
    /// Nothing overflowed since the last checkpoint.
    Unchanged,
    /// The main buffer was replaced.
    Grown { from: u64, to: u64 },
}

/// Snapshot of a growable pool's totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferPoolStats {
    pub state: PoolState,
    pub capacity: u64,
    pub live: u64,
    pub pooled_allocations: usize,
    pub overflow_allocations: usize,
    pub overflow_regions_bytes: u64,
    pub migrations: u64,
}

#[derive(Debug, Clone, Copy)]
struct Placement {
    offset: u64,
    size: u64,
    align: u64,
}

#[derive(Debug, Clone, Copy)]
struct Overflow {
    region: RegionHandle,
    host_addr: Option<usize>,
    size: u64,
    align: u64,
}

#[derive(Debug, Clone, Copy)]
struct MainBuffer {
    region: RegionHandle,
    host_addr: Option<usize>,
}

/// Linear buffer sub-allocator that overflows instead of blocking and grows at checkpoints.
pub struct GrowablePool<B: BackingStore, C: CommandSubmission> {
    id: u64,
    store: B,
    commands: C,
    config: BufferPoolConfig,
    state: PoolState,
    main: Option<MainBuffer>,
    capacity: u64,
    ranges: VirtualRange,
    pooled: HashMap<u64, Placement>,
    overflow: HashMap<u64, Overflow>,
    retired_overflow: Vec<RegionHandle>,
    next_id: u64,
    live_bytes: u64,
    migrations: u64,
    submission_epoch: AtomicU64,
    metrics: Option<Arc<PoolMetrics>>,
}

impl<B: BackingStore, C: CommandSubmission> std::fmt::Debug for GrowablePool<B, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrowablePool")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<B: BackingStore, C: CommandSubmission> GrowablePool<B, C> {
    /// Create a pool and its main buffer of `config.initial_capacity` bytes.
    ///
    /// The configuration is validated again here, since its fields are public.
    pub fn new(store: B, commands: C, config: BufferPoolConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| AllocError::InvalidRequest(format!("buffer pool configuration: {e}")))?;
        let id = next_pool_id();
        let main = acquire_main(&store, &config, config.initial_capacity, id)?;

        Ok(Self {
            id,
            store,
            commands,
            ranges: VirtualRange::new(
                config.range_algorithm,
                config.initial_capacity,
                config.minimum_granularity,
            ),
            capacity: config.initial_capacity,
            config,
            state: PoolState::Stable,
            main: Some(main),
            pooled: HashMap::new(),
            overflow: HashMap::new(),
            retired_overflow: Vec::new(),
            next_id: 0,
            live_bytes: 0,
            migrations: 0,
            submission_epoch: AtomicU64::new(0),
            metrics: None,
        })
    }

    /// Publish this pool's gauges and counters through `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<PoolMetrics>) -> Self {
        self.metrics = Some(metrics);
        self.update_gauges();
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &BufferPoolConfig {
        &self.config
    }

    pub fn state(&self) -> PoolState {
        self.state
    }

    /// Capacity of the main buffer.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Region backing the main buffer. `None` only after a failed migration.
    pub fn main_region(&self) -> Option<RegionHandle> {
        self.main.map(|main| main.region)
    }

    pub fn store(&self) -> &B {
        &self.store
    }

    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            state: self.state,
            capacity: self.capacity,
            live: self.live_bytes,
            pooled_allocations: self.pooled.len(),
            overflow_allocations: self.overflow.len(),
            overflow_regions_bytes: self.overflow.values().map(|o| o.size).sum(),
            migrations: self.migrations,
        }
    }

    /// Allocate `size` bytes aligned to `align`.
    ///
    /// Served from the main buffer when it has room, otherwise from a new overflow region of
    /// exactly the rounded size. Never waits on the device.
    pub fn allocate(&mut self, size: u64, align: u64) -> Result<BufferAllocation> {
        self.ensure_usable()?;
        let (size, align) = normalize_request(size, align, self.config.minimum_granularity)?;

        let id = self.next_id;
        self.next_id += 1;

        if let Some(offset) = self.ranges.allocate(size, align) {
            self.pooled.insert(id, Placement { offset, size, align });
        } else {
            let class = self.config.memory_class;
            let region = self.store.allocate_region(size, class).map_err(|source| {
                AllocError::BackingStoreExhausted {
                    size,
                    class,
                    source,
                }
            })?;
            let host_addr = match self.map_if_host_visible(region) {
                Ok(addr) => addr,
                Err(e) => {
                    if let Err(release) = self.store.free_region(region) {
                        tracing::warn!(pool = self.id, %region, error = %release, "failed to release unmappable overflow region");
                    }
                    return Err(e);
                }
            };

            self.overflow.insert(
                id,
                Overflow {
                    region,
                    host_addr,
                    size,
                    align,
                },
            );
            // Charge worst-case padding so the grown buffer can always re-place this allocation.
            let charged = size.saturating_add(align - self.config.minimum_granularity);
            let overflow_bytes = match self.state {
                PoolState::Overflowing { overflow_bytes } => overflow_bytes.saturating_add(charged),
                _ => charged,
            };
            self.state = PoolState::Overflowing { overflow_bytes };

            tracing::debug!(pool = self.id, %region, size, overflow_bytes, "main buffer full, serving from overflow region");
            if let Some(metrics) = &self.metrics {
                metrics.inc(metrics::OVERFLOW_ALLOCATIONS);
                metrics.inc(metrics::REGIONS_ACQUIRED);
            }
        }

        self.live_bytes += size;
        self.update_gauges();
        Ok(BufferAllocation {
            pool: self.id,
            id,
            size,
        })
    }

    /// Return an allocation.
    ///
    /// An overflow region is released at once; its bytes still count towards the next growth.
    ///
    /// # Panics
    /// Panics when the allocation was not issued by this pool.
    pub fn free(&mut self, allocation: BufferAllocation) -> Result<()> {
        assert_eq!(
            allocation.pool, self.id,
            "buffer allocation from pool {} returned to pool {}",
            allocation.pool, self.id
        );

        let result = if let Some(placement) = self.pooled.remove(&allocation.id) {
            if self.state != PoolState::Poisoned
                && let Err(e) = self.ranges.free(placement.offset, placement.size)
            {
                panic!("invalid free on buffer pool {}: {e}", self.id);
            }
            Ok(())
        } else if let Some(overflow) = self.overflow.remove(&allocation.id) {
            if let Some(metrics) = &self.metrics {
                metrics.inc(metrics::REGIONS_RELEASED);
            }
            self.store
                .free_region(overflow.region)
                .map_err(|source| AllocError::Release {
                    region: overflow.region,
                    source,
                })
        } else {
            panic!(
                "buffer allocation {} is not live in pool {}",
                allocation.id, self.id
            );
        };

        self.live_bytes -= allocation.size;
        self.update_gauges();
        result
    }

    /// Current location of an allocation.
    ///
    /// The slice is assumed to be referenced by device work from here on, so an [`IdleToken`]
    /// taken before this call no longer permits a migration.
    ///
    /// # Panics
    /// Panics when the allocation was not issued by this pool.
    pub fn locate(&self, allocation: &BufferAllocation) -> Result<BufferSlice> {
        assert_eq!(
            allocation.pool, self.id,
            "buffer allocation from pool {} located in pool {}",
            allocation.pool, self.id
        );
        self.ensure_usable()?;
        self.submission_epoch.fetch_add(1, Ordering::AcqRel);

        if let Some(placement) = self.pooled.get(&allocation.id) {
            let main = self.main.ok_or(AllocError::Poisoned)?;
            return Ok(BufferSlice {
                region: main.region,
                offset: placement.offset,
                size: placement.size,
                host_addr: main
                    .host_addr
                    .map(|base| base + placement.offset as usize),
                overflow: false,
            });
        }

        match self.overflow.get(&allocation.id) {
            Some(overflow) => Ok(BufferSlice {
                region: overflow.region,
                offset: 0,
                size: overflow.size,
                host_addr: overflow.host_addr,
                overflow: true,
            }),
            None => panic!(
                "buffer allocation {} is not live in pool {}",
                allocation.id, self.id
            ),
        }
    }

    /// Wait for every submitted command to complete.
    ///
    /// The returned token permits one checkpoint, provided nothing is located in between.
    pub fn wait_until_idle(&self) -> Result<IdleToken> {
        let epoch = self.submission_epoch.load(Ordering::Acquire);
        self.commands.wait_until_idle()?;
        Ok(IdleToken {
            pool: self.id,
            epoch,
        })
    }

    /// Apply deferred growth.
    ///
    /// Does nothing while the pool is stable. Otherwise migrates every live allocation into a new
    /// main buffer. A failure part-way leaves the pool [`PoolState::Poisoned`]; it is not retried.
    pub fn checkpoint(&mut self, token: IdleToken) -> Result<CheckpointOutcome> {
        self.ensure_usable()?;
        if token.pool != self.id {
            return Err(AllocError::MigrationPrecondition(format!(
                "idle token of pool {} presented to pool {}",
                token.pool, self.id
            )));
        }

        let PoolState::Overflowing { overflow_bytes } = self.state else {
            return Ok(CheckpointOutcome::Unchanged);
        };

        let epoch = self.submission_epoch.load(Ordering::Acquire);
        if token.epoch != epoch {
            return Err(AllocError::MigrationPrecondition(format!(
                "{} slice(s) located since the device was last idle",
                epoch - token.epoch
            )));
        }

        let from = self.capacity;
        let to = from
            .checked_add(overflow_bytes)
            .and_then(u64::checked_next_power_of_two)
            .ok_or_else(|| {
                AllocError::MigrationFailed(format!(
                    "capacity {from} + {overflow_bytes} overflow bytes cannot be represented"
                ))
            })?;

        self.state = PoolState::Migrating;
        tracing::info!(
            pool = self.id,
            from,
            to,
            overflow_bytes,
            pooled = self.pooled.len(),
            overflow = self.overflow.len(),
            upload_only = self.config.upload_only,
            "growing buffer pool"
        );

        let mut staging = None;
        if let Err(e) = self.migrate(to, &mut staging) {
            tracing::warn!(pool = self.id, error = %e, "migration failed, pool poisoned");
            self.state = PoolState::Poisoned;
            if let Some(region) = staging
                && let Err(release) = self.store.free_region(region)
            {
                tracing::warn!(pool = self.id, %region, error = %release, "failed to release staging region");
            }
            self.update_gauges();
            return Err(e);
        }

        self.capacity = to;
        self.migrations += 1;
        self.state = PoolState::Stable;
        if let Some(metrics) = &self.metrics {
            metrics.inc(metrics::MIGRATIONS);
        }

        // Data now lives in the new main buffer; the old regions are only garbage.
        let mut redundant: Vec<RegionHandle> = staging.into_iter().collect();
        redundant.extend(self.retired_overflow.drain(..));
        let mut result = Ok(CheckpointOutcome::Grown { from, to });
        for region in redundant {
            if let Some(metrics) = &self.metrics {
                metrics.inc(metrics::REGIONS_RELEASED);
            }
            if let Err(source) = self.store.free_region(region) {
                tracing::warn!(pool = self.id, %region, error = %source, "failed to release region after migration");
                if result.is_ok() {
                    result = Err(AllocError::Release { region, source });
                }
            }
        }

        self.update_gauges();
        result
    }

    fn migrate(&mut self, capacity: u64, staging: &mut Option<RegionHandle>) -> Result<()> {
        let class = self.config.memory_class;
        let preserve = !self.config.upload_only;
        let old = self.main.ok_or(AllocError::Poisoned)?;

        if preserve && !self.pooled.is_empty() {
            let region = self
                .store
                .allocate_region(self.capacity, class)
                .map_err(|source| AllocError::BackingStoreExhausted {
                    size: self.capacity,
                    class,
                    source,
                })?;
            *staging = Some(region);
            self.commands
                .copy_region(old.region, 0, region, 0, self.capacity)?;
            self.commands.wait_until_idle()?;
        }

        self.main = None;
        if let Some(metrics) = &self.metrics {
            metrics.inc(metrics::REGIONS_RELEASED);
        }
        self.store
            .free_region(old.region)
            .map_err(|source| AllocError::Release {
                region: old.region,
                source,
            })?;

        let main = acquire_main(&self.store, &self.config, capacity, self.id)?;
        self.main = Some(main);
        if let Some(metrics) = &self.metrics {
            metrics.inc(metrics::REGIONS_ACQUIRED);
        }
        self.ranges = VirtualRange::new(
            self.config.range_algorithm,
            capacity,
            self.config.minimum_granularity,
        );

        let mut pooled: Vec<(u64, Placement)> =
            self.pooled.iter().map(|(&id, &p)| (id, p)).collect();
        pooled.sort_by_key(|(_, placement)| placement.offset);
        for (id, placement) in pooled {
            let offset = self.place(placement.size, placement.align)?;
            if let Some(staging) = *staging {
                self.commands.copy_region(
                    staging,
                    placement.offset,
                    main.region,
                    offset,
                    placement.size,
                )?;
            }
            self.pooled.insert(id, Placement { offset, ..placement });
        }

        let mut overflow: Vec<(u64, Overflow)> =
            self.overflow.iter().map(|(&id, &o)| (id, o)).collect();
        overflow.sort_by_key(|(id, _)| *id);
        for (id, entry) in overflow {
            let offset = self.place(entry.size, entry.align)?;
            if preserve {
                self.commands
                    .copy_region(entry.region, 0, main.region, offset, entry.size)?;
            }
            self.overflow.remove(&id);
            self.retired_overflow.push(entry.region);
            self.pooled.insert(
                id,
                Placement {
                    offset,
                    size: entry.size,
                    align: entry.align,
                },
            );
        }

        self.commands.wait_until_idle()?;
        Ok(())
    }

    fn place(&mut self, size: u64, align: u64) -> Result<u64> {
        self.ranges.allocate(size, align).ok_or_else(|| {
            AllocError::MigrationFailed(format!(
                "{size} bytes aligned to {align} do not fit the grown buffer"
            ))
        })
    }

    fn ensure_usable(&self) -> Result<()> {
        match self.state {
            PoolState::Poisoned => Err(AllocError::Poisoned),
            _ => Ok(()),
        }
    }

    fn map_if_host_visible(&self, region: RegionHandle) -> Result<Option<usize>> {
        map_if_host_visible(&self.store, &self.config, region)
    }

    fn update_gauges(&self) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        let overflow_bytes = match self.state {
            PoolState::Overflowing { overflow_bytes } => overflow_bytes,
            _ => 0,
        };
        metrics.set(metrics::CAPACITY_BYTES, self.capacity);
        metrics.set(metrics::LIVE_BYTES, self.live_bytes);
        metrics.set(metrics::OVERFLOW_BYTES, overflow_bytes);
    }
}

fn map_if_host_visible<B: BackingStore>(
    store: &B,
    config: &BufferPoolConfig,
    region: RegionHandle,
) -> Result<Option<usize>> {
    let class = config.memory_class;
    if !class.is_host_visible() {
        return Ok(None);
    }
    store
        .map_region(region)
        .map(Some)
        .map_err(|source| AllocError::BackingStoreExhausted {
            size: 0,
            class,
            source,
        })
}

fn acquire_main<B: BackingStore>(
    store: &B,
    config: &BufferPoolConfig,
    capacity: u64,
    pool: u64,
) -> Result<MainBuffer> {
    let class = config.memory_class;
    let region = store
        .allocate_region(capacity, class)
        .map_err(|source| AllocError::BackingStoreExhausted {
            size: capacity,
            class,
            source,
        })?;

    let host_addr = match map_if_host_visible(store, config, region) {
        Ok(addr) => addr,
        Err(e) => {
            if let Err(release) = store.free_region(region) {
                tracing::warn!(pool, %region, error = %release, "failed to release unmappable main buffer");
            }
            return Err(e);
        }
    };

    tracing::info!(pool, %region, capacity, %class, "acquired main buffer");
    Ok(MainBuffer { region, host_addr })
}

impl<B: BackingStore, C: CommandSubmission> Drop for GrowablePool<B, C> {
    fn drop(&mut self) {
        if self.live_bytes > 0 {
            tracing::warn!(
                pool = self.id,
                live_bytes = self.live_bytes,
                live_allocations = self.pooled.len() + self.overflow.len(),
                "buffer pool dropped with live allocations"
            );
        }

        let regions = self
            .main
            .take()
            .map(|main| main.region)
            .into_iter()
            .chain(self.overflow.drain().map(|(_, o)| o.region))
            .chain(self.retired_overflow.drain(..));
        for region in regions {
            if let Err(e) = self.store.free_region(region) {
                tracing::warn!(pool = self.id, %region, error = %e, "failed to release region on drop");
            }
        }
    }
}
