// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # Pool Manager
//!
//! A [`Pool`] serves allocations of one memory class out of [`Block`]s it obtains from a
//! [`BackingStore`]. For every pooled request it tries, in order:
//!
//! 1. each active block, oldest first,
//! 2. the most recently emptied block in the free-block cache,
//! 3. a new block of the standard block size.
//!
//! Requests that are marked dedicated, are larger than a standard block, or come from a
//! pointer-stable host-visible pool get a region of their own which is released as soon as the
//! allocation is freed.
//!
//! Blocks live in an arena of slots. An [`Allocation`] names its block by slot index and the slot's
//! generation, so a handle that outlives its block is caught instead of corrupting whatever block
//! reuses the slot.

pub mod config;
pub mod growable;

pub use config::{BufferPoolConfig, BufferPoolConfigBuilder, PoolConfig, PoolConfigBuilder};
pub use growable::{
    BufferAllocation, BufferPoolStats, BufferSlice, CheckpointOutcome, GrowablePool, IdleToken,
    PoolState,
};

use crate::backing::{BackingStore, RegionHandle};
use crate::block::Block;
use crate::metrics::{self, PoolMetrics};
use crate::range::round_request;
use crate::{AllocError, MemoryClass, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_pool_id() -> u64 {
    NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed)
}

/// Validate a `(size, align)` request and normalise it against `granularity`.
pub(crate) fn normalize_request(size: u64, align: u64, granularity: u64) -> Result<(u64, u64)> {
    if align != 0 && !align.is_power_of_two() {
        return Err(AllocError::InvalidRequest(format!(
            "alignment {align} is not a power of two"
        )));
    }
    round_request(size, align, granularity).ok_or_else(|| {
        AllocError::InvalidRequest(format!(
            "size {size} overflows when rounded to {granularity} bytes"
        ))
    })
}

/// The caller's handle to a live range inside a [`Pool`].
///
/// Must be handed back to [`Pool::free`] exactly once; it cannot be copied.
#[must_use = "allocations must be returned with Pool::free"]
#[derive(Debug, PartialEq, Eq)]
pub struct Allocation {
    pool: u64,
    slot: usize,
    generation: u64,
    offset: u64,
    size: u64,
    region: RegionHandle,
    host_addr: Option<usize>,
    dedicated: bool,
}

impl Allocation {
    /// Offset of the first byte within [`Allocation::region`].
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Size in bytes, rounded up to the pool granularity.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Backing region holding this allocation.
    pub fn region(&self) -> RegionHandle {
        self.region
    }

    /// Host address of the first byte, for host-visible pools.
    pub fn host_addr(&self) -> Option<usize> {
        self.host_addr
    }

    /// `true` when this allocation owns its region outright.
    pub fn is_dedicated(&self) -> bool {
        self.dedicated
    }

    /// One past the last byte within the region.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Snapshot of a pool's totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Bytes currently held from the backing store, cached blocks included.
    pub requested_from_backing_store: u64,
    /// Bytes handed out to callers and not yet freed.
    pub live: u64,
    pub live_allocations: usize,
    pub active_blocks: usize,
    pub cached_blocks: usize,
    pub dedicated_blocks: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Residency {
    Active,
    Cached,
    Dedicated,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    entry: Option<(Block, Residency)>,
}

/// Block-list sub-allocator for one memory class.
///
/// Methods take `&mut self`: pool-level bookkeeping is not shared between threads. Each
/// [`Block`] still guards its own range state.
pub struct Pool<B: BackingStore> {
    id: u64,
    store: B,
    config: PoolConfig,
    slots: Vec<Slot>,
    vacant: Vec<usize>,
    /// Active pooled blocks in the order they became active.
    active: Vec<usize>,
    /// Empty pooled blocks, oldest first.
    cache: VecDeque<usize>,
    dedicated: Vec<usize>,
    requested_bytes: u64,
    live_bytes: u64,
    live_allocations: usize,
    metrics: Option<Arc<PoolMetrics>>,
}

impl<B: BackingStore> std::fmt::Debug for Pool<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<B: BackingStore> Pool<B> {
    pub fn new(store: B, config: PoolConfig) -> Self {
        Self {
            id: next_pool_id(),
            store,
            config,
            slots: Vec::new(),
            vacant: Vec::new(),
            active: Vec::new(),
            cache: VecDeque::new(),
            dedicated: Vec::new(),
            requested_bytes: 0,
            live_bytes: 0,
            live_allocations: 0,
            metrics: None,
        }
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

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn memory_class(&self) -> MemoryClass {
        self.config.memory_class
    }

    pub fn store(&self) -> &B {
        &self.store
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            requested_from_backing_store: self.requested_bytes,
            live: self.live_bytes,
            live_allocations: self.live_allocations,
            active_blocks: self.active.len(),
            cached_blocks: self.cache.len(),
            dedicated_blocks: self.dedicated.len(),
        }
    }

    /// Every block the pool currently holds.
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.slots
            .iter()
            .filter_map(|slot| slot.entry.as_ref().map(|(block, _)| block))
    }

    /// Active pooled blocks in scan order.
    pub fn active_blocks(&self) -> impl Iterator<Item = &Block> {
        self.active.iter().map(|&index| self.block_at(index))
    }

    /// Cached empty blocks, oldest first.
    pub fn cached_blocks(&self) -> impl Iterator<Item = &Block> {
        self.cache.iter().map(|&index| self.block_at(index))
    }

    /// The block an allocation was carved from.
    ///
    /// # Panics
    /// Panics when the allocation was not issued by this pool or its block is gone.
    pub fn block_of(&self, allocation: &Allocation) -> &Block {
        let (block, _) = self.resolve(allocation);
        block
    }

    /// Allocate `size` bytes aligned to `align`.
    ///
    /// `align` must be zero or a power of two. `dedicated` asks for a region of its own; requests
    /// larger than the standard block size are made dedicated regardless.
    pub fn allocate(&mut self, size: u64, align: u64, dedicated: bool) -> Result<Allocation> {
        let (size, align) = normalize_request(size, align, self.config.minimum_granularity)?;

        let promoted = !dedicated && size > self.config.block_size;
        if promoted {
            tracing::debug!(
                pool = self.id,
                size,
                block_size = self.config.block_size,
                "request larger than a block, promoting to dedicated"
            );
        }

        let allocation = if dedicated || promoted || self.config.forces_dedicated() {
            self.allocate_dedicated(size)?
        } else {
            match self.allocate_pooled(size, align)? {
                Some(allocation) => allocation,
                None => {
                    tracing::debug!(
                        pool = self.id,
                        size,
                        align,
                        "alignment cannot be met inside a block, promoting to dedicated"
                    );
                    self.allocate_dedicated(size)?
                }
            }
        };

        self.live_bytes += allocation.size;
        self.live_allocations += 1;
        self.update_gauges();
        Ok(allocation)
    }

    /// Return an allocation to the pool.
    ///
    /// Dedicated regions are released immediately. A pooled block that becomes empty moves to the
    /// free-block cache, which is then trimmed to its retention limit. `Err` is only returned when
    /// the backing store fails to take a region back; the pool's bookkeeping is already updated.
    ///
    /// # Panics
    /// Panics when the allocation was not issued by this pool or its block was already released.
    pub fn free(&mut self, allocation: Allocation) -> Result<()> {
        let (block, residency) = self.resolve(&allocation);
        block.free(allocation.offset, allocation.size);
        let emptied = block.is_empty();

        self.live_bytes -= allocation.size;
        self.live_allocations -= 1;

        let result = match residency {
            Residency::Dedicated => {
                self.dedicated.retain(|&index| index != allocation.slot);
                self.release_block(allocation.slot)
            }
            Residency::Active if emptied => {
                self.active.retain(|&index| index != allocation.slot);
                self.set_residency(allocation.slot, Residency::Cached);
                self.cache.push_back(allocation.slot);
                tracing::debug!(pool = self.id, region = %allocation.region, "block emptied, cached");
                self.trim_cache()
            }
            Residency::Active => Ok(()),
            Residency::Cached => unreachable!("live allocation in cached block"),
        };

        self.update_gauges();
        result
    }

    /// Most blocks the cache may retain given the current active block count.
    pub fn cache_limit(&self) -> usize {
        let limit = (self.active.len() as f64 * self.config.retention_ratio).floor() as usize;
        limit.max(1)
    }

    fn allocate_pooled(&mut self, size: u64, align: u64) -> Result<Option<Allocation>> {
        for &index in &self.active {
            if let Some(offset) = self.block_at(index).allocate(size, align) {
                return Ok(Some(self.handle(index, offset, size)));
            }
        }

        if let Some(index) = self.cache.pop_back() {
            tracing::debug!(pool = self.id, region = %self.block_at(index).region(), "reusing cached block");
            if let Some(offset) = self.block_at(index).allocate(size, align) {
                self.set_residency(index, Residency::Active);
                self.active.push(index);
                return Ok(Some(self.handle(index, offset, size)));
            }
            self.cache.push_back(index);
            return Ok(None);
        }

        let index = self.acquire_block(self.config.block_size, Residency::Active)?;
        match self.block_at(index).allocate(size, align) {
            Some(offset) => {
                self.active.push(index);
                Ok(Some(self.handle(index, offset, size)))
            }
            None => {
                self.set_residency(index, Residency::Cached);
                self.cache.push_back(index);
                Ok(None)
            }
        }
    }

    fn allocate_dedicated(&mut self, size: u64) -> Result<Allocation> {
        let index = self.acquire_block(size, Residency::Dedicated)?;
        self.block_at(index).claim_whole();
        self.dedicated.push(index);
        Ok(self.handle(index, 0, size))
    }

    fn handle(&self, index: usize, offset: u64, size: u64) -> Allocation {
        let slot = &self.slots[index];
        let block = self.block_at(index);
        Allocation {
            pool: self.id,
            slot: index,
            generation: slot.generation,
            offset,
            size,
            region: block.region(),
            host_addr: block.host_addr().map(|base| base + offset as usize),
            dedicated: block.is_dedicated(),
        }
    }

    fn block_at(&self, index: usize) -> &Block {
        match &self.slots[index].entry {
            Some((block, _)) => block,
            None => unreachable!("slot {index} referenced while vacant"),
        }
    }

    fn set_residency(&mut self, index: usize, residency: Residency) {
        if let Some((_, current)) = self.slots[index].entry.as_mut() {
            *current = residency;
        }
    }

    fn resolve(&self, allocation: &Allocation) -> (&Block, Residency) {
        assert_eq!(
            allocation.pool, self.id,
            "allocation from pool {} returned to pool {}",
            allocation.pool, self.id
        );
        let slot = self.slots.get(allocation.slot);
        match slot {
            Some(Slot {
                generation,
                entry: Some((block, residency)),
            }) if *generation == allocation.generation && block.region() == allocation.region => {
                (block, *residency)
            }
            _ => panic!(
                "allocation [{}, {}) on {} does not belong to a live block of pool {}",
                allocation.offset,
                allocation.end(),
                allocation.region,
                self.id
            ),
        }
    }

    fn acquire_block(&mut self, size: u64, residency: Residency) -> Result<usize> {
        let class = self.config.memory_class;
        let region = self
            .store
            .allocate_region(size, class)
            .map_err(|source| {
                tracing::warn!(pool = self.id, size, %class, error = %source, "backing store refused region");
                AllocError::BackingStoreExhausted {
                    size,
                    class,
                    source,
                }
            })?;

        let host_addr = if class.is_host_visible() {
            match self.store.map_region(region) {
                Ok(addr) => Some(addr),
                Err(source) => {
                    if let Err(e) = self.store.free_region(region) {
                        tracing::warn!(pool = self.id, %region, error = %e, "failed to release unmappable region");
                    }
                    return Err(AllocError::BackingStoreExhausted {
                        size,
                        class,
                        source,
                    });
                }
            }
        } else {
            None
        };

        let dedicated = residency == Residency::Dedicated;
        let block = Block::new(
            region,
            size,
            class,
            dedicated,
            host_addr,
            self.config.range_algorithm,
            self.config.minimum_granularity,
        );

        let index = match self.vacant.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
        };
        self.slots[index].entry = Some((block, residency));
        self.requested_bytes += size;

        tracing::info!(pool = self.id, %region, size, %class, dedicated, "acquired region");
        if let Some(metrics) = &self.metrics {
            metrics.inc(metrics::REGIONS_ACQUIRED);
        }
        Ok(index)
    }

    fn release_block(&mut self, index: usize) -> Result<()> {
        let slot = &mut self.slots[index];
        let Some((block, _)) = slot.entry.take() else {
            unreachable!("slot {index} released while vacant");
        };
        slot.generation += 1;
        self.vacant.push(index);
        self.requested_bytes -= block.capacity();

        let region = block.region();
        tracing::info!(pool = self.id, %region, size = block.capacity(), dedicated = block.is_dedicated(), "releasing region");
        if let Some(metrics) = &self.metrics {
            metrics.inc(metrics::REGIONS_RELEASED);
        }

        self.store.free_region(region).map_err(|source| {
            tracing::warn!(pool = self.id, %region, error = %source, "backing store failed to release region");
            AllocError::Release { region, source }
        })
    }

    fn trim_cache(&mut self) -> Result<()> {
        let mut result = Ok(());
        while self.cache.len() > self.cache_limit() {
            let Some(index) = self.cache.pop_front() else {
                break;
            };
            if let Err(e) = self.release_block(index) {
                result = result.and(Err(e));
            }
        }
        result
    }

    fn update_gauges(&self) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        let stats = self.stats();
        metrics.set(metrics::REQUESTED_BYTES, stats.requested_from_backing_store);
        metrics.set(metrics::LIVE_BYTES, stats.live);
        metrics.set(metrics::ACTIVE_BLOCKS, stats.active_blocks as u64);
        metrics.set(metrics::CACHED_BLOCKS, stats.cached_blocks as u64);
        metrics.set(metrics::DEDICATED_BLOCKS, stats.dedicated_blocks as u64);
    }
}

impl<B: BackingStore> Drop for Pool<B> {
    fn drop(&mut self) {
        if self.live_allocations > 0 {
            tracing::warn!(
                pool = self.id,
                live_allocations = self.live_allocations,
                live_bytes = self.live_bytes,
                "pool dropped with live allocations"
            );
        }

        for slot in &mut self.slots {
            if let Some((block, _)) = slot.entry.take()
                && let Err(e) = self.store.free_region(block.region())
            {
                tracing::warn!(pool = self.id, region = %block.region(), error = %e, "failed to release region on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SystemBackingStore;
    use crate::range::{FreeRange, RangeAlgorithm};
    use rstest::rstest;

    const KIB: u64 = 1024;

    fn pool_with(
        block_size: u64,
        retention_ratio: f64,
    ) -> (Arc<SystemBackingStore>, Pool<Arc<SystemBackingStore>>) {
        let store = Arc::new(SystemBackingStore::new());
        let config = PoolConfig::builder()
            .block_size(block_size)
            .minimum_granularity(4 * KIB)
            .retention_ratio(retention_ratio)
            .build()
            .unwrap();
        (store.clone(), Pool::new(store, config))
    }

    #[test]
    fn test_first_request_opens_a_block() {
        let (store, mut pool) = pool_with(64 * KIB, 1.0 / 16.0);
        let a = pool.allocate(3 * KIB, 1, false).unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(a.size(), 4 * KIB);
        assert!(!a.is_dedicated());
        assert_eq!(store.live_regions(), 1);
        assert_eq!(
            pool.stats(),
            PoolStats {
                requested_from_backing_store: 64 * KIB,
                live: 4 * KIB,
                live_allocations: 1,
                active_blocks: 1,
                cached_blocks: 0,
                dedicated_blocks: 0,
            }
        );
        pool.free(a).unwrap();
    }

    #[test]
    fn test_oversized_request_is_promoted() {
        let (store, mut pool) = pool_with(64 * KIB, 1.0 / 16.0);
        let big = pool.allocate(65 * KIB, 1, false).unwrap();
        assert!(big.is_dedicated());
        assert_eq!(big.size(), 68 * KIB);
        assert_eq!(store.region_size(big.region()), Some(68 * KIB));
        assert_eq!(pool.stats().dedicated_blocks, 1);
        assert_eq!(pool.stats().active_blocks, 0);

        pool.free(big).unwrap();
        assert_eq!(pool.stats().requested_from_backing_store, 0);
        assert_eq!(store.live_regions(), 0);
    }

    #[test]
    fn test_dedicated_blocks_are_never_cached() {
        let (_store, mut pool) = pool_with(64 * KIB, 1.0);
        let a = pool.allocate(4 * KIB, 1, true).unwrap();
        let b = pool.allocate(4 * KIB, 1, true).unwrap();
        assert_ne!(a.region(), b.region());
        pool.free(a).unwrap();
        pool.free(b).unwrap();
        assert_eq!(pool.stats().cached_blocks, 0);
        assert_eq!(pool.blocks().count(), 0);
    }

    #[test]
    fn test_emptied_block_moves_to_cache_and_is_reused() {
        let (store, mut pool) = pool_with(64 * KIB, 1.0 / 16.0);
        let a = pool.allocate(4 * KIB, 1, false).unwrap();
        let region = a.region();
        pool.free(a).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.active_blocks, 0);
        assert_eq!(stats.cached_blocks, 1);
        assert_eq!(stats.requested_from_backing_store, 64 * KIB);

        let b = pool.allocate(8 * KIB, 1, false).unwrap();
        assert_eq!(b.region(), region);
        assert_eq!(store.regions_acquired(), 1);
        assert_eq!(pool.stats().cached_blocks, 0);
        pool.free(b).unwrap();
    }

    #[test]
    fn test_active_blocks_scanned_oldest_first() {
        let (_store, mut pool) = pool_with(16 * KIB, 1.0);
        let first: Vec<_> = (0..4)
            .map(|_| pool.allocate(4 * KIB, 1, false).unwrap())
            .collect();
        let second = pool.allocate(4 * KIB, 1, false).unwrap();
        assert_ne!(second.region(), first[0].region());

        let hole = first[0].offset();
        let region = first[0].region();
        let mut first = first.into_iter();
        pool.free(first.next().unwrap()).unwrap();

        let refill = pool.allocate(4 * KIB, 1, false).unwrap();
        assert_eq!(refill.region(), region);
        assert_eq!(refill.offset(), hole);

        for allocation in first.chain([second, refill]) {
            pool.free(allocation).unwrap();
        }
        assert_eq!(pool.stats().live, 0);
    }

    #[test]
    fn test_cache_trimmed_to_retention_limit() {
        let (store, mut pool) = pool_with(4 * KIB, 1.0 / 16.0);
        let allocations: Vec<_> = (0..3)
            .map(|_| pool.allocate(4 * KIB, 1, false).unwrap())
            .collect();
        assert_eq!(pool.stats().active_blocks, 3);

        for allocation in allocations {
            pool.free(allocation).unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.cached_blocks, 1);
        assert_eq!(stats.requested_from_backing_store, 4 * KIB);
        assert_eq!(store.regions_released(), 2);
    }

    #[test]
    fn test_host_visible_allocations_carry_addresses() {
        let store = Arc::new(SystemBackingStore::new());
        let config = PoolConfig::builder()
            .memory_class(MemoryClass::HostVisible)
            .block_size(64 * KIB)
            .build()
            .unwrap();
        let mut pool = Pool::new(store, config);

        let a = pool.allocate(4 * KIB, 1, false).unwrap();
        let b = pool.allocate(4 * KIB, 1, false).unwrap();
        let base = pool.block_of(&a).host_addr().unwrap();
        assert_eq!(a.host_addr(), Some(base));
        assert_eq!(b.host_addr(), Some(base + b.offset() as usize));
        pool.free(a).unwrap();
        pool.free(b).unwrap();
    }

    #[test]
    fn test_pointer_stable_pool_dedicates_everything() {
        let store = Arc::new(SystemBackingStore::new());
        let config = PoolConfig::builder()
            .memory_class(MemoryClass::HostVisible)
            .pointer_stable(true)
            .block_size(64 * KIB)
            .build()
            .unwrap();
        let mut pool = Pool::new(store.clone(), config);

        let a = pool.allocate(1, 1, false).unwrap();
        assert!(a.is_dedicated());
        assert_eq!(store.region_size(a.region()), Some(4 * KIB));
        pool.free(a).unwrap();
        assert_eq!(store.live_regions(), 0);
    }

    #[test]
    fn test_backing_store_failure_is_surfaced() {
        let store = Arc::new(SystemBackingStore::with_limit(64 * KIB));
        let config = PoolConfig::builder().block_size(64 * KIB).build().unwrap();
        let mut pool = Pool::new(store, config);

        let a = pool.allocate(64 * KIB, 1, false).unwrap();
        let err = pool.allocate(4 * KIB, 1, false).unwrap_err();
        assert!(matches!(
            err,
            AllocError::BackingStoreExhausted { size, .. } if size == 64 * KIB
        ));
        let stats = pool.stats();
        assert_eq!(stats.live_allocations, 1);
        assert_eq!(stats.requested_from_backing_store, 64 * KIB);
        pool.free(a).unwrap();
    }

    #[rstest]
    #[case(3)]
    #[case(4096 + 1)]
    fn test_invalid_alignment_is_rejected(#[case] align: u64) {
        let (_store, mut pool) = pool_with(64 * KIB, 1.0 / 16.0);
        assert!(matches!(
            pool.allocate(4 * KIB, align, false),
            Err(AllocError::InvalidRequest(_))
        ));
        assert_eq!(pool.stats(), PoolStats::default());
    }

    #[test]
    fn test_overflowing_size_is_rejected() {
        let (_store, mut pool) = pool_with(64 * KIB, 1.0 / 16.0);
        assert!(matches!(
            pool.allocate(u64::MAX, 1, false),
            Err(AllocError::InvalidRequest(_))
        ));
    }

    #[rstest]
    #[case(RangeAlgorithm::FirstFit)]
    #[case(RangeAlgorithm::Linear)]
    #[case(RangeAlgorithm::Tlsf)]
    fn test_every_algorithm_serves_the_pool(#[case] algorithm: RangeAlgorithm) {
        let store = Arc::new(SystemBackingStore::new());
        let config = PoolConfig::builder()
            .block_size(64 * KIB)
            .range_algorithm(algorithm)
            .build()
            .unwrap();
        let mut pool = Pool::new(store, config);

        let allocations: Vec<_> = (0..20)
            .map(|_| pool.allocate(3 * KIB, 1, false).unwrap())
            .collect();
        assert_eq!(pool.stats().active_blocks, 2);
        for allocation in allocations {
            pool.free(allocation).unwrap();
        }
        assert_eq!(pool.stats().live, 0);
        assert_eq!(pool.stats().active_blocks, 0);
    }

    #[test]
    fn test_alignment_beyond_tlsf_block_falls_back_to_dedicated() {
        let store = Arc::new(SystemBackingStore::new());
        let config = PoolConfig::builder()
            .block_size(64 * KIB)
            .range_algorithm(RangeAlgorithm::Tlsf)
            .build()
            .unwrap();
        let mut pool = Pool::new(store, config);

        let a = pool.allocate(64 * KIB, 64 * KIB, false).unwrap();
        assert!(a.is_dedicated());
        assert_eq!(pool.stats().cached_blocks, 1);
        pool.free(a).unwrap();
    }

    #[test]
    fn test_free_restores_free_ranges() {
        let (_store, mut pool) = pool_with(64 * KIB, 1.0);
        let keep = pool.allocate(4 * KIB, 1, false).unwrap();
        let before = pool.block_of(&keep).free_ranges().unwrap();

        let a = pool.allocate(8 * KIB, 16 * KIB, false).unwrap();
        assert_eq!(a.offset() % (16 * KIB), 0);
        pool.free(a).unwrap();

        assert_eq!(pool.block_of(&keep).free_ranges().unwrap(), before);
        assert_eq!(before, vec![FreeRange::new(4 * KIB, 60 * KIB)]);
        pool.free(keep).unwrap();
    }

    #[test]
    #[should_panic(expected = "returned to pool")]
    fn test_free_into_foreign_pool_panics() {
        let (_store, mut a) = pool_with(64 * KIB, 1.0);
        let (_store, mut b) = pool_with(64 * KIB, 1.0);
        let allocation = a.allocate(4 * KIB, 1, false).unwrap();
        let _ = b.free(allocation);
    }

    #[test]
    #[should_panic(expected = "does not belong to a live block")]
    fn test_stale_handle_panics() {
        let (_store, mut pool) = pool_with(64 * KIB, 1.0);
        let a = pool.allocate(4 * KIB, 1, true).unwrap();
        let forged = Allocation {
            pool: a.pool,
            slot: a.slot,
            generation: a.generation,
            offset: a.offset,
            size: a.size,
            region: a.region,
            host_addr: a.host_addr,
            dedicated: a.dedicated,
        };
        pool.free(a).unwrap();
        let _ = pool.free(forged);
    }

    #[rstest]
    #[case(RangeAlgorithm::FirstFit)]
    #[case(RangeAlgorithm::Linear)]
    #[case(RangeAlgorithm::Tlsf)]
    #[should_panic(expected = "invalid free")]
    fn test_double_free_panics_before_caching_block(#[case] algorithm: RangeAlgorithm) {
        let store = Arc::new(SystemBackingStore::new());
        let config = PoolConfig::builder()
            .block_size(64 * KIB)
            .range_algorithm(algorithm)
            .build()
            .unwrap();
        let mut pool = Pool::new(store, config);

        let a = pool.allocate(4 * KIB, 1, false).unwrap();
        let _b = pool.allocate(4 * KIB, 1, false).unwrap();
        let again = Allocation {
            pool: a.pool,
            slot: a.slot,
            generation: a.generation,
            offset: a.offset,
            size: a.size,
            region: a.region,
            host_addr: a.host_addr,
            dedicated: a.dedicated,
        };
        pool.free(a).unwrap();
        let _ = pool.free(again);
    }

    #[test]
    fn test_drop_releases_every_region() {
        let (store, mut pool) = pool_with(16 * KIB, 1.0);
        let leaked = pool.allocate(4 * KIB, 1, false).unwrap();
        let dedicated = pool.allocate(32 * KIB, 1, false).unwrap();
        std::mem::forget(leaked);
        std::mem::forget(dedicated);
        drop(pool);
        assert_eq!(store.live_regions(), 0);
    }

    #[test]
    fn test_metrics_follow_pool() {
        let registry = Arc::new(prometheus::Registry::new());
        let memory_metrics = crate::MemoryMetrics::new(&registry).unwrap();
        let pool_metrics = memory_metrics.pool("device");
        let (_store, pool) = pool_with(64 * KIB, 1.0);
        let mut pool = pool.with_metrics(pool_metrics.clone());

        let a = pool.allocate(4 * KIB, 1, false).unwrap();
        assert_eq!(pool_metrics.gauge(metrics::LIVE_BYTES).get(), 4096);
        assert_eq!(pool_metrics.gauge(metrics::ACTIVE_BLOCKS).get(), 1);
        assert_eq!(pool_metrics.counter(metrics::REGIONS_ACQUIRED).get(), 1);

        pool.free(a).unwrap();
        assert_eq!(pool_metrics.gauge(metrics::LIVE_BYTES).get(), 0);
        assert_eq!(pool_metrics.gauge(metrics::CACHED_BLOCKS).get(), 1);
    }
}
