// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! First-fit free list.
//!
//! Free space is a vector of [`FreeRange`]s kept sorted by offset. After every mutation the list
//! holds no overlapping and no adjacent ranges: adjacent ranges are merged on the spot, so a freed
//! range only ever needs to look at its immediate predecessor and successor.

use super::{FreeRange, RangeAllocator, RangeError, round_request, round_up};

/// Sorted, coalescing free list over `[0, capacity)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeList {
    capacity: u64,
    granularity: u64,
    free_bytes: u64,
    ranges: Vec<FreeRange>,
}

impl FreeList {
    /// Create a free list with the whole capacity free.
    ///
    /// `granularity` must be a power of two and `capacity` a multiple of it.
    pub fn new(capacity: u64, granularity: u64) -> Self {
        debug_assert!(granularity.is_power_of_two());
        debug_assert_eq!(capacity % granularity, 0);

        let ranges = if capacity > 0 {
            vec![FreeRange::new(0, capacity)]
        } else {
            Vec::new()
        };

        Self {
            capacity,
            granularity,
            free_bytes: capacity,
            ranges,
        }
    }

    /// The current free ranges in ascending offset order.
    pub fn ranges(&self) -> &[FreeRange] {
        &self.ranges
    }

    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    /// Verify the structural invariants of the list.
    ///
    /// Returns a description of the first violation found.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut total = 0u64;
        for (i, range) in self.ranges.iter().enumerate() {
            if range.size == 0 {
                return Err(format!("empty range at index {i}"));
            }
            if range.size < self.granularity
                || range.offset % self.granularity != 0
                || range.size % self.granularity != 0
            {
                return Err(format!("range {range:?} is not granular"));
            }
            if range.end() > self.capacity {
                return Err(format!("range {range:?} exceeds capacity {}", self.capacity));
            }
            if let Some(next) = self.ranges.get(i + 1) {
                if range.end() > next.offset {
                    return Err(format!("ranges {range:?} and {next:?} overlap or are unsorted"));
                }
                if range.end() == next.offset {
                    return Err(format!("ranges {range:?} and {next:?} are adjacent"));
                }
            }
            total += range.size;
        }
        if total != self.free_bytes {
            return Err(format!(
                "free byte count {} disagrees with range total {total}",
                self.free_bytes
            ));
        }
        Ok(())
    }

    /// Index of the first range whose offset is not below `offset`.
    fn insertion_point(&self, offset: u64) -> usize {
        self.ranges.partition_point(|r| r.offset < offset)
    }
}

impl RangeAllocator for FreeList {
    fn allocate(&mut self, size: u64, align: u64) -> Option<u64> {
        let (size, align) = round_request(size, align, self.granularity)?;

        for index in 0..self.ranges.len() {
            let range = self.ranges[index];
            let Some(aligned) = round_up(range.offset, align) else {
                continue;
            };
            let padding = aligned - range.offset;
            if padding >= range.size || range.size - padding < size {
                continue;
            }

            // The head keeps the original start, so it can never touch the predecessor; the tail
            // keeps the original end, so it can never touch the successor.
            let head = FreeRange::new(range.offset, padding);
            let tail = FreeRange::new(aligned + size, range.end() - (aligned + size));

            match (head.size > 0, tail.size > 0) {
                (false, false) => {
                    self.ranges.remove(index);
                }
                (true, false) => self.ranges[index] = head,
                (false, true) => self.ranges[index] = tail,
                (true, true) => {
                    self.ranges[index] = head;
                    self.ranges.insert(index + 1, tail);
                }
            }

            self.free_bytes -= size;
            debug_assert!(self.check_invariants().is_ok());
            return Some(aligned);
        }

        None
    }

    fn free(&mut self, offset: u64, size: u64) -> Result<(), RangeError> {
        let size = round_up(size.max(1), self.granularity).ok_or(RangeError::OutOfBounds {
            offset,
            end: u64::MAX,
            capacity: self.capacity,
        })?;
        let end = offset
            .checked_add(size)
            .filter(|end| *end <= self.capacity)
            .ok_or(RangeError::OutOfBounds {
                offset,
                end: offset.saturating_add(size),
                capacity: self.capacity,
            })?;
        if offset % self.granularity != 0 {
            return Err(RangeError::Misaligned {
                offset,
                end,
                granularity: self.granularity,
            });
        }

        let index = self.insertion_point(offset);
        let prev = index.checked_sub(1).map(|i| self.ranges[i]);
        let next = self.ranges.get(index).copied();

        if prev.is_some_and(|p| p.end() > offset) || next.is_some_and(|n| n.offset < end) {
            return Err(RangeError::OverlapsFree { offset, end });
        }

        let merge_prev = prev.is_some_and(|p| p.end() == offset);
        let merge_next = next.is_some_and(|n| n.offset == end);

        match (merge_prev, merge_next) {
            (true, true) => {
                let next = self.ranges.remove(index);
                self.ranges[index - 1].size += size + next.size;
            }
            (true, false) => self.ranges[index - 1].size += size,
            (false, true) => {
                self.ranges[index] = FreeRange::new(offset, size + self.ranges[index].size);
            }
            (false, false) => self.ranges.insert(index, FreeRange::new(offset, size)),
        }

        self.free_bytes += size;
        debug_assert!(self.check_invariants().is_ok());
        Ok(())
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn free_bytes(&self) -> u64 {
        self.free_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const GRANULARITY: u64 = 4096;
    const CAPACITY: u64 = GRANULARITY * 16;

    fn ranges(list: &FreeList) -> Vec<(u64, u64)> {
        list.ranges().iter().map(|r| (r.offset, r.size)).collect()
    }

    #[test]
    fn test_new_list_is_one_range() {
        let list = FreeList::new(CAPACITY, GRANULARITY);
        assert_eq!(ranges(&list), vec![(0, CAPACITY)]);
        assert!(list.is_empty());
        list.check_invariants().unwrap();
    }

    #[test]
    fn test_first_fit_takes_lowest_offset() {
        let mut list = FreeList::new(CAPACITY, GRANULARITY);
        let a = list.allocate(GRANULARITY, 1).unwrap();
        let b = list.allocate(GRANULARITY, 1).unwrap();
        let c = list.allocate(GRANULARITY, 1).unwrap();
        assert_eq!((a, b, c), (0, GRANULARITY, 2 * GRANULARITY));

        // free the middle one; the next request of the same size must land in the hole
        list.free(b, GRANULARITY).unwrap();
        assert_eq!(list.allocate(GRANULARITY, 1), Some(GRANULARITY));
    }

    #[test]
    fn test_sizes_round_up_to_granularity() {
        let mut list = FreeList::new(CAPACITY, GRANULARITY);
        let a = list.allocate(3 * 1024, 1).unwrap();
        assert_eq!(a, 0);
        assert_eq!(list.free_bytes(), CAPACITY - GRANULARITY);
        assert_eq!(ranges(&list), vec![(GRANULARITY, CAPACITY - GRANULARITY)]);
    }

    #[test]
    fn test_alignment_splits_head_and_tail() {
        let mut list = FreeList::new(CAPACITY, GRANULARITY);
        list.allocate(GRANULARITY, 1).unwrap();
        let aligned = list.allocate(GRANULARITY, 4 * GRANULARITY).unwrap();
        assert_eq!(aligned, 4 * GRANULARITY);
        assert_eq!(
            ranges(&list),
            vec![
                (GRANULARITY, 3 * GRANULARITY),
                (5 * GRANULARITY, CAPACITY - 5 * GRANULARITY)
            ]
        );
        list.check_invariants().unwrap();
    }

    #[test]
    fn test_free_coalesces_both_neighbours() {
        let mut list = FreeList::new(CAPACITY, GRANULARITY);
        let offsets: Vec<u64> = (0..16)
            .map(|_| list.allocate(GRANULARITY, 1).unwrap())
            .collect();
        assert!(list.ranges().is_empty());

        list.free(offsets[3], GRANULARITY).unwrap();
        list.free(offsets[5], GRANULARITY).unwrap();
        assert_eq!(list.ranges().len(), 2);

        list.free(offsets[4], GRANULARITY).unwrap();
        assert_eq!(ranges(&list), vec![(3 * GRANULARITY, 3 * GRANULARITY)]);
    }

    #[test]
    fn test_no_fit_returns_none() {
        let mut list = FreeList::new(CAPACITY, GRANULARITY);
        assert!(list.allocate(CAPACITY + 1, 1).is_none());
        assert_eq!(list.allocate(CAPACITY, 1), Some(0));
        assert!(list.allocate(1, 1).is_none());
    }

    #[test]
    fn test_alignment_padding_larger_than_range_is_rejected() {
        let mut list = FreeList::new(CAPACITY, GRANULARITY);
        list.allocate(GRANULARITY, 1).unwrap();
        // [4K, 64K) is free, but nothing inside it is 64K aligned
        assert!(list.allocate(GRANULARITY, CAPACITY).is_none());
    }

    #[rstest]
    #[case(0, GRANULARITY)]
    #[case(GRANULARITY * 15, GRANULARITY * 2)]
    fn test_free_rejects_foreign_ranges(#[case] offset: u64, #[case] size: u64) {
        let mut list = FreeList::new(CAPACITY, GRANULARITY);
        let before = list.clone();
        assert!(list.free(offset, size).is_err());
        assert_eq!(list, before);
    }

    #[test]
    fn test_double_free_is_detected() {
        let mut list = FreeList::new(CAPACITY, GRANULARITY);
        let a = list.allocate(GRANULARITY, 1).unwrap();
        let _b = list.allocate(GRANULARITY, 1).unwrap();
        list.free(a, GRANULARITY).unwrap();
        assert!(matches!(
            list.free(a, GRANULARITY),
            Err(RangeError::OverlapsFree { .. })
        ));
    }

    #[test]
    fn test_misaligned_free_is_rejected() {
        let mut list = FreeList::new(CAPACITY, GRANULARITY);
        list.allocate(CAPACITY, 1).unwrap();
        assert!(matches!(
            list.free(100, GRANULARITY),
            Err(RangeError::Misaligned { .. })
        ));
    }

    #[test]
    fn test_alloc_free_restores_state() {
        let mut list = FreeList::new(CAPACITY, GRANULARITY);
        let _keep = list.allocate(2 * GRANULARITY, 1).unwrap();
        let snapshot = list.clone();

        let a = list.allocate(GRANULARITY, 8 * GRANULARITY).unwrap();
        let b = list.allocate(3 * GRANULARITY, 1).unwrap();
        list.free(a, GRANULARITY).unwrap();
        list.free(b, 3 * GRANULARITY).unwrap();

        assert_eq!(list, snapshot);
    }
}
