// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # Arena Range Allocator
//!
//! This module provides a page-granular range allocator for generally heap-like allocation
//! patterns. It is a [`RangeAllocator`] backed by the [`offset_allocator`] crate,
//! which builds on [Sebastian Aaltonen's OffsetAllocator](https://github.com/sebbbi/OffsetAllocator)
//! (a two-level segregated fit allocator with O(1) allocate and free).
//!
//! The capacity is divided into pages of the minimum granularity. [`offset_allocator`] has no
//! notion of alignment, so requests aligned beyond a page over-allocate by `align / page - 1`
//! pages and return the first aligned page inside the node. The node is remembered by the
//! returned offset so it can be handed back on free.

use crate::range::{RangeAllocator, RangeError, round_request, round_up};
use offset_allocator::{Allocation, Allocator};
use std::collections::HashMap;

/// A live node handed out by the inner [`Allocator`].
#[derive(Clone, Copy)]
struct Node {
    allocation: Allocation,
    pages: u32,
}

/// TLSF range allocator over `[0, capacity)`.
pub struct ArenaRange {
    allocator: Allocator,
    page_size: u64,
    capacity: u64,
    used_pages: u64,
    nodes: HashMap<u64, Node>,
}

impl std::fmt::Debug for ArenaRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ArenaRange {{ capacity: {}, page_size: {}, used_pages: {}, live: {} }}",
            self.capacity,
            self.page_size,
            self.used_pages,
            self.nodes.len()
        )
    }
}

impl ArenaRange {
    /// Create a new [`ArenaRange`] spanning `capacity` bytes with pages of `page_size` bytes.
    ///
    /// The page size must be a power of two. The capacity is divided into whole pages; any
    /// trailing bytes that do not fill a page are never handed out. The page count is clamped to
    /// what the inner allocator can address.
    pub fn new(capacity: u64, page_size: u64) -> Self {
        debug_assert!(page_size.is_power_of_two());

        let pages = u32::try_from(capacity / page_size).unwrap_or(u32::MAX);

        Self {
            allocator: Allocator::new(pages),
            page_size,
            capacity: pages as u64 * page_size,
            used_pages: 0,
            nodes: HashMap::new(),
        }
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Number of live allocations.
    pub fn live_allocations(&self) -> usize {
        self.nodes.len()
    }
}

impl RangeAllocator for ArenaRange {
    fn allocate(&mut self, size: u64, align: u64) -> Option<u64> {
        let (size, align) = round_request(size, align, self.page_size)?;

        let pages = size / self.page_size;
        let padding_pages = align / self.page_size - 1;
        let total: u32 = pages.checked_add(padding_pages)?.try_into().ok()?;

        let allocation = self.allocator.allocate(total)?;

        let base = allocation.offset as u64 * self.page_size;
        let Some(offset) = round_up(base, align) else {
            self.allocator.free(allocation);
            return None;
        };

        debug_assert!(offset + size <= base + total as u64 * self.page_size);
        debug_assert!(offset + size <= self.capacity);

        self.used_pages += total as u64;
        self.nodes.insert(
            offset,
            Node {
                allocation,
                pages: total,
            },
        );
        Some(offset)
    }

    fn free(&mut self, offset: u64, _size: u64) -> Result<(), RangeError> {
        let node = self
            .nodes
            .remove(&offset)
            .ok_or(RangeError::Unknown { offset })?;
        self.allocator.free(node.allocation);
        self.used_pages -= node.pages as u64;
        Ok(())
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn free_bytes(&self) -> u64 {
        self.capacity - self.used_pages * self.page_size
    }
}
