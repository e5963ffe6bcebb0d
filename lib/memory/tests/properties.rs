// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Randomised invariant checks over the range allocators and both pool kinds.

use blockpool_memory::range::FreeList;
use blockpool_memory::{
    Allocation, BufferAllocation, BufferPoolConfig, GrowablePool, Pool, PoolConfig,
    RangeAlgorithm, RangeAllocator, SystemBackingStore, VirtualRange,
};
use proptest::prelude::*;
use std::sync::Arc;

const GRANULARITY: u64 = 1024;

#[derive(Debug, Clone)]
enum Op {
    Allocate { units: u64, align_shift: u32 },
    Free { pick: usize },
}

fn ops(max_units: u64) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            3 => (1..=max_units, 0u32..4).prop_map(|(units, align_shift)| Op::Allocate { units, align_shift }),
            2 => any::<usize>().prop_map(|pick| Op::Free { pick }),
        ],
        1..80,
    )
}

fn algorithms() -> impl Strategy<Value = RangeAlgorithm> {
    prop_oneof![
        Just(RangeAlgorithm::FirstFit),
        Just(RangeAlgorithm::Linear),
        Just(RangeAlgorithm::Tlsf),
    ]
}

fn assert_disjoint(mut ranges: Vec<(u64, u64)>) {
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        assert!(
            pair[0].0 + pair[0].1 <= pair[1].0,
            "ranges {:?} and {:?} overlap",
            pair[0],
            pair[1]
        );
    }
}

proptest! {
    #[test]
    fn test_free_list_conserves_bytes(ops in ops(8)) {
        let capacity = 32 * GRANULARITY;
        let mut list = FreeList::new(capacity, GRANULARITY);
        let mut live: Vec<(u64, u64)> = Vec::new();

        for op in ops {
            match op {
                Op::Allocate { units, align_shift } => {
                    let size = units * GRANULARITY;
                    let align = GRANULARITY << align_shift;
                    if let Some(offset) = list.allocate(size, align) {
                        prop_assert_eq!(offset % align, 0);
                        prop_assert!(offset + size <= capacity);
                        live.push((offset, size));
                    }
                }
                Op::Free { pick } if !live.is_empty() => {
                    let (offset, size) = live.swap_remove(pick % live.len());
                    list.free(offset, size).unwrap();
                }
                Op::Free { .. } => {}
            }

            list.check_invariants().map_err(TestCaseError::fail)?;
            let used: u64 = live.iter().map(|(_, size)| size).sum();
            prop_assert_eq!(list.free_bytes() + used, capacity);
            assert_disjoint(live.clone());
        }

        for (offset, size) in live {
            list.free(offset, size).unwrap();
        }
        prop_assert_eq!(list.ranges().len(), 1);
        prop_assert_eq!(list.free_bytes(), capacity);
    }

    #[test]
    fn test_free_list_round_trip_restores_ranges(
        prefix in ops(6),
        pairs in prop::collection::vec((1..=6u64, 0u32..4), 1..40),
        batch in prop::collection::vec((1..=6u64, 0u32..4), 1..8),
        picks in prop::collection::vec(any::<usize>(), 8),
    ) {
        let mut list = FreeList::new(32 * GRANULARITY, GRANULARITY);
        let mut live: Vec<(u64, u64)> = Vec::new();
        let mut pairs = pairs.into_iter().cycle();

        for op in prefix {
            match op {
                Op::Allocate { units, align_shift } => {
                    let size = units * GRANULARITY;
                    if let Some(offset) = list.allocate(size, GRANULARITY << align_shift) {
                        live.push((offset, size));
                    }
                }
                Op::Free { pick } if !live.is_empty() => {
                    let (offset, size) = live.swap_remove(pick % live.len());
                    list.free(offset, size).unwrap();
                }
                Op::Free { .. } => {}
            }

            // A single allocate/free pair leaves the list exactly as it was.
            let (units, align_shift) = pairs.next().unwrap();
            let before = list.ranges().to_vec();
            if let Some(offset) = list.allocate(units * GRANULARITY, GRANULARITY << align_shift) {
                list.free(offset, units * GRANULARITY).unwrap();
            }
            prop_assert_eq!(list.ranges(), before.as_slice());
        }

        // So does a batch of allocations freed in any order.
        let before = list.ranges().to_vec();
        let mut batch_live: Vec<(u64, u64)> = batch
            .into_iter()
            .filter_map(|(units, align_shift)| {
                let size = units * GRANULARITY;
                list.allocate(size, GRANULARITY << align_shift)
                    .map(|offset| (offset, size))
            })
            .collect();
        for pick in picks {
            if batch_live.is_empty() {
                break;
            }
            let (offset, size) = batch_live.swap_remove(pick % batch_live.len());
            list.free(offset, size).unwrap();
        }
        for (offset, size) in batch_live {
            list.free(offset, size).unwrap();
        }
        prop_assert_eq!(list.ranges(), before.as_slice());
        list.check_invariants().unwrap();
    }

    #[test]
    fn test_virtual_ranges_never_overlap(algorithm in algorithms(), ops in ops(6)) {
        let capacity = 64 * GRANULARITY;
        let mut range = VirtualRange::new(algorithm, capacity, GRANULARITY);
        let mut live: Vec<(u64, u64)> = Vec::new();

        for op in ops {
            match op {
                Op::Allocate { units, align_shift } => {
                    let size = units * GRANULARITY;
                    if let Some(offset) = range.allocate(size, GRANULARITY << align_shift) {
                        prop_assert!(offset + size <= capacity);
                        live.push((offset, size));
                    }
                }
                Op::Free { pick } if !live.is_empty() => {
                    let (offset, size) = live.swap_remove(pick % live.len());
                    range.free(offset, size).unwrap();
                }
                Op::Free { .. } => {}
            }
            assert_disjoint(live.clone());
        }

        for (offset, size) in live {
            range.free(offset, size).unwrap();
        }
        prop_assert!(range.is_empty());
    }

    #[test]
    fn test_pool_accounting_matches_store(
        algorithm in algorithms(),
        retention_ratio in 0.0f64..=1.0,
        ops in ops(20),
    ) {
        let store = Arc::new(SystemBackingStore::new());
        let config = PoolConfig::builder()
            .block_size(16 * GRANULARITY)
            .minimum_granularity(GRANULARITY)
            .retention_ratio(retention_ratio)
            .range_algorithm(algorithm)
            .build()
            .unwrap();
        let mut pool = Pool::new(store.clone(), config);
        let mut live: Vec<Allocation> = Vec::new();

        for op in ops {
            match op {
                Op::Allocate { units, align_shift } => {
                    let allocation = pool
                        .allocate(units * GRANULARITY, GRANULARITY << align_shift, false)
                        .unwrap();
                    prop_assert_eq!(allocation.offset() % (GRANULARITY << align_shift), 0);
                    live.push(allocation);
                }
                Op::Free { pick } if !live.is_empty() => {
                    let allocation = live.swap_remove(pick % live.len());
                    pool.free(allocation).unwrap();
                }
                Op::Free { .. } => {}
            }

            let stats = pool.stats();
            prop_assert_eq!(stats.live, live.iter().map(Allocation::size).sum::<u64>());
            prop_assert_eq!(stats.live_allocations, live.len());
            prop_assert_eq!(stats.requested_from_backing_store, store.allocated_bytes());
            prop_assert!(stats.cached_blocks <= pool.cache_limit());
            prop_assert!(pool.cached_blocks().all(|block| block.is_empty()));

            for block in pool.blocks() {
                prop_assert_eq!(block.free_bytes() + block.live_bytes(), block.capacity());
                let ranges = live
                    .iter()
                    .filter(|a| a.region() == block.region())
                    .map(|a| (a.offset(), a.size()))
                    .collect();
                assert_disjoint(ranges);
            }
        }

        for allocation in live {
            pool.free(allocation).unwrap();
        }
        prop_assert_eq!(pool.stats().live, 0);
        prop_assert_eq!(pool.stats().active_blocks, 0);
    }

    #[test]
    fn test_growable_pool_preserves_contents(
        algorithm in prop_oneof![Just(RangeAlgorithm::FirstFit), Just(RangeAlgorithm::Linear)],
        frames in prop::collection::vec(ops(6), 1..6),
    ) {
        let store = Arc::new(SystemBackingStore::new());
        let config = BufferPoolConfig::builder()
            .initial_capacity(8 * GRANULARITY)
            .minimum_granularity(GRANULARITY)
            .range_algorithm(algorithm)
            .build()
            .unwrap();
        let mut pool = GrowablePool::new(store.clone(), store.clone(), config).unwrap();
        let mut live: Vec<(u8, BufferAllocation)> = Vec::new();
        let mut stamp = 0u8;

        for ops in frames {
            for op in ops {
                match op {
                    Op::Allocate { units, align_shift } => {
                        let allocation = pool
                            .allocate(units * GRANULARITY, GRANULARITY << align_shift)
                            .unwrap();
                        stamp = stamp.wrapping_add(1);
                        let slice = pool.locate(&allocation).unwrap();
                        store
                            .write(slice.region, slice.offset, &vec![stamp; slice.size as usize])
                            .unwrap();
                        live.push((stamp, allocation));
                    }
                    Op::Free { pick } if !live.is_empty() => {
                        let (_, allocation) = live.swap_remove(pick % live.len());
                        pool.free(allocation).unwrap();
                    }
                    Op::Free { .. } => {}
                }
            }

            let token = pool.wait_until_idle().unwrap();
            pool.checkpoint(token).unwrap();
            prop_assert!(pool.capacity().is_power_of_two());
            prop_assert_eq!(pool.stats().overflow_allocations, 0);

            for (stamp, allocation) in &live {
                let slice = pool.locate(allocation).unwrap();
                prop_assert_eq!(Some(slice.region), pool.main_region());
                let bytes = store.read(slice.region, slice.offset, slice.size).unwrap();
                prop_assert!(bytes.iter().all(|b| b == stamp));
            }
            assert_disjoint(
                live.iter()
                    .map(|(_, a)| {
                        let slice = pool.locate(a).unwrap();
                        (slice.offset, slice.size)
                    })
                    .collect(),
            );
        }

        for (_, allocation) in live {
            pool.free(allocation).unwrap();
        }
        prop_assert_eq!(store.live_regions(), 1);
    }
}
