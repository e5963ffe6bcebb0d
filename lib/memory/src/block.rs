// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! A single region obtained from a [`BackingStore`](crate::BackingStore) and the bookkeeping
//! for the bytes carved out of it.
//!
//! The range state sits behind a per-block mutex so concurrent `allocate`/`free` calls against the
//! same block observe a consistent free list. Everything above a block (which block to use, the
//! free-block cache, pool totals) is not synchronised here.

use crate::MemoryClass;
use crate::backing::RegionHandle;
use crate::range::{FreeRange, RangeAlgorithm, RangeAllocator, VirtualRange};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug)]
struct BlockState {
    ranges: VirtualRange,
    live_bytes: u64,
    live_allocations: usize,
}

/// One bulk-allocated region.
///
/// Invariant: `free_bytes() + live_bytes() == capacity()` between calls. Live bytes are what the
/// range allocator actually consumed, so TLSF alignment padding is charged as live.
///
/// A dedicated block is never split: it holds zero or one allocation spanning its full capacity.
#[derive(Debug)]
pub struct Block {
    region: RegionHandle,
    capacity: u64,
    memory_class: MemoryClass,
    dedicated: bool,
    host_addr: Option<usize>,
    state: Mutex<BlockState>,
}

impl Block {
    pub(crate) fn new(
        region: RegionHandle,
        capacity: u64,
        memory_class: MemoryClass,
        dedicated: bool,
        host_addr: Option<usize>,
        algorithm: RangeAlgorithm,
        granularity: u64,
    ) -> Self {
        Self {
            region,
            capacity,
            memory_class,
            dedicated,
            host_addr,
            state: Mutex::new(BlockState {
                ranges: VirtualRange::new(algorithm, capacity, granularity),
                live_bytes: 0,
                live_allocations: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BlockState> {
        self.state.lock().expect("block state mutex poisoned")
    }

    /// Carve `size` bytes aligned to `align` out of this block.
    ///
    /// `size` and `align` must already be normalised against the granularity. Returns `None` when
    /// nothing in the block fits.
    ///
    /// # Panics
    /// Panics when called on a dedicated block; those are claimed whole by the pool.
    pub(crate) fn allocate(&self, size: u64, align: u64) -> Option<u64> {
        assert!(
            !self.dedicated,
            "pooled allocation requested from dedicated block {}",
            self.region
        );

        let mut state = self.state();
        let before = state.ranges.free_bytes();
        let offset = state.ranges.allocate(size, align)?;
        state.live_bytes += before - state.ranges.free_bytes();
        state.live_allocations += 1;
        Some(offset)
    }

    /// Take the whole capacity of a dedicated block.
    pub(crate) fn claim_whole(&self) {
        debug_assert!(self.dedicated);

        let mut state = self.state();
        assert_eq!(
            state.live_allocations, 0,
            "dedicated block {} claimed twice",
            self.region
        );
        state.live_bytes = self.capacity;
        state.live_allocations = 1;
    }

    /// Return a range to this block.
    ///
    /// # Panics
    /// Panics when the range was not handed out by this block or was already returned; continuing
    /// would corrupt the free list.
    pub(crate) fn free(&self, offset: u64, size: u64) {
        let mut state = self.state();

        if self.dedicated {
            assert!(
                offset == 0 && size == self.capacity && state.live_allocations == 1,
                "invalid free of [{offset}, {}) on dedicated block {}",
                offset.saturating_add(size),
                self.region
            );
            state.live_bytes = 0;
            state.live_allocations = 0;
            return;
        }

        let before = state.ranges.free_bytes();
        if let Err(e) = state.ranges.free(offset, size) {
            panic!("invalid free on block {}: {e}", self.region);
        }
        state.live_bytes -= state.ranges.free_bytes() - before;
        state.live_allocations -= 1;
    }

    pub fn region(&self) -> RegionHandle {
        self.region
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn memory_class(&self) -> MemoryClass {
        self.memory_class
    }

    pub fn is_dedicated(&self) -> bool {
        self.dedicated
    }

    /// Host address of the first byte, for host-visible blocks.
    pub fn host_addr(&self) -> Option<usize> {
        self.host_addr
    }

    pub fn live_bytes(&self) -> u64 {
        self.state().live_bytes
    }

    pub fn live_allocations(&self) -> usize {
        self.state().live_allocations
    }

    pub fn free_bytes(&self) -> u64 {
        if self.dedicated {
            return self.capacity - self.state().live_bytes;
        }
        self.state().ranges.free_bytes()
    }

    /// `true` when no allocation is live in this block.
    pub fn is_empty(&self) -> bool {
        self.state().live_allocations == 0
    }

    /// Snapshot of the free ranges, for first-fit blocks.
    pub fn free_ranges(&self) -> Option<Vec<FreeRange>> {
        self.state()
            .ranges
            .as_free_list()
            .map(|list| list.ranges().to_vec())
    }
}
