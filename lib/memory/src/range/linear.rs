// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Append-only range allocation.
//!
//! Allocations are carved from a single moving head. Space below the head is only reclaimed when
//! the topmost allocation is freed, which rewinds the head to the end of the highest allocation
//! still live (zero once everything is freed). Upload pools that rewrite their contents every use
//! free everything at once, so in practice they never fragment.

use super::{RangeAllocator, RangeError, round_request, round_up};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearRange {
    capacity: u64,
    granularity: u64,
    head: u64,
    live_bytes: u64,
    /// Live allocations by offset, with their rounded sizes.
    live: BTreeMap<u64, u64>,
}

impl LinearRange {
    pub fn new(capacity: u64, granularity: u64) -> Self {
        debug_assert!(granularity.is_power_of_two());
        Self {
            capacity,
            granularity,
            head: 0,
            live_bytes: 0,
            live: BTreeMap::new(),
        }
    }

    /// Offset at which the next allocation would start, before alignment.
    pub fn head(&self) -> u64 {
        self.head
    }

    /// Forget every allocation.
    pub fn reset(&mut self) {
        self.head = 0;
        self.live_bytes = 0;
        self.live.clear();
    }

    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }
}

impl RangeAllocator for LinearRange {
    fn allocate(&mut self, size: u64, align: u64) -> Option<u64> {
        let (size, align) = round_request(size, align, self.granularity)?;
        let offset = round_up(self.head, align)?;
        let end = offset.checked_add(size)?;
        if end > self.capacity {
            return None;
        }

        self.head = end;
        self.live_bytes += size;
        self.live.insert(offset, size);
        Some(offset)
    }

    fn free(&mut self, offset: u64, size: u64) -> Result<(), RangeError> {
        let size = round_up(size.max(1), self.granularity).unwrap_or(u64::MAX);
        let end = offset.saturating_add(size);
        if end > self.head {
            return Err(RangeError::OutOfBounds {
                offset,
                end,
                capacity: self.head,
            });
        }
        if offset % self.granularity != 0 {
            return Err(RangeError::Misaligned {
                offset,
                end,
                granularity: self.granularity,
            });
        }
        if self.live.get(&offset) != Some(&size) {
            return Err(RangeError::Unknown { offset });
        }

        self.live.remove(&offset);
        self.live_bytes -= size;
        if end == self.head {
            self.head = self
                .live
                .last_key_value()
                .map_or(0, |(&offset, &size)| offset + size);
        }
        Ok(())
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn free_bytes(&self) -> u64 {
        self.capacity - self.live_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRANULARITY: u64 = 4096;

    #[test]
    fn test_linear_appends() {
        let mut range = LinearRange::new(GRANULARITY * 8, GRANULARITY);
        assert_eq!(range.allocate(1, 1), Some(0));
        assert_eq!(range.allocate(GRANULARITY + 1, 1), Some(GRANULARITY));
        assert_eq!(range.head(), 3 * GRANULARITY);
    }

    #[test]
    fn test_linear_does_not_reuse_holes() {
        let mut range = LinearRange::new(GRANULARITY * 4, GRANULARITY);
        let a = range.allocate(GRANULARITY, 1).unwrap();
        let _b = range.allocate(GRANULARITY, 1).unwrap();
        range.free(a, GRANULARITY).unwrap();
        assert_eq!(range.allocate(GRANULARITY, 1), Some(2 * GRANULARITY));
        assert_eq!(range.allocate(GRANULARITY, 1), Some(3 * GRANULARITY));
        assert!(range.allocate(GRANULARITY, 1).is_none());
    }

    #[test]
    fn test_linear_lifo_free_rewinds_head() {
        let mut range = LinearRange::new(GRANULARITY * 4, GRANULARITY);
        let _a = range.allocate(GRANULARITY, 1).unwrap();
        let b = range.allocate(2 * GRANULARITY, 1).unwrap();
        range.free(b, 2 * GRANULARITY).unwrap();
        assert_eq!(range.head(), GRANULARITY);
    }

    #[test]
    fn test_linear_rewinds_when_drained() {
        let mut range = LinearRange::new(GRANULARITY * 4, GRANULARITY);
        let a = range.allocate(GRANULARITY, 1).unwrap();
        let b = range.allocate(GRANULARITY, 1).unwrap();
        range.free(a, GRANULARITY).unwrap();
        range.free(b, GRANULARITY).unwrap();
        assert_eq!(range.head(), 0);
        assert!(range.is_empty());
    }

    #[test]
    fn test_linear_top_free_reclaims_holes_below() {
        let mut range = LinearRange::new(GRANULARITY * 4, GRANULARITY);
        let _a = range.allocate(GRANULARITY, 1).unwrap();
        let b = range.allocate(GRANULARITY, 1).unwrap();
        let c = range.allocate(GRANULARITY, 1).unwrap();
        range.free(b, GRANULARITY).unwrap();
        assert_eq!(range.head(), 3 * GRANULARITY);
        range.free(c, GRANULARITY).unwrap();
        assert_eq!(range.head(), GRANULARITY);
    }

    #[test]
    fn test_linear_rejects_double_free() {
        let mut range = LinearRange::new(GRANULARITY * 4, GRANULARITY);
        let a = range.allocate(GRANULARITY, 1).unwrap();
        let _b = range.allocate(GRANULARITY, 1).unwrap();
        range.free(a, GRANULARITY).unwrap();
        assert_eq!(
            range.free(a, GRANULARITY),
            Err(RangeError::Unknown { offset: a })
        );
        assert_eq!(range.live_allocations(), 1);
        assert_eq!(range.head(), 2 * GRANULARITY);
    }

    #[test]
    fn test_linear_rejects_wrong_size() {
        let mut range = LinearRange::new(GRANULARITY * 4, GRANULARITY);
        let a = range.allocate(2 * GRANULARITY, 1).unwrap();
        assert!(range.free(a, GRANULARITY).is_err());
        assert!(range.free(a + GRANULARITY, GRANULARITY).is_err());
        range.free(a, 2 * GRANULARITY).unwrap();
        assert!(range.is_empty());
    }

    #[test]
    fn test_linear_rejects_free_above_head() {
        let mut range = LinearRange::new(GRANULARITY * 4, GRANULARITY);
        range.allocate(GRANULARITY, 1).unwrap();
        assert!(range.free(2 * GRANULARITY, GRANULARITY).is_err());
    }
}
