// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # Virtual Range Allocators
//!
//! A range allocator hands out `[offset, offset + size)` sub-ranges of a fixed capacity without
//! touching the memory itself. The same algorithms serve two masters:
//!
//! - every pooled [`Block`](crate::block::Block) tracks its free space with one, and
//! - the [`GrowablePool`](crate::pool::GrowablePool) manages its single linear main buffer with one.
//!
//! All requests are normalised by [`round_request`]: sizes are rounded up to the minimum
//! granularity and alignments are clamped to at least the granularity. Because every offset and
//! every size is then a multiple of the granularity, no free hole smaller than the granularity can
//! ever be produced.

pub mod free_list;
pub mod linear;

pub use free_list::FreeList;
pub use linear::LinearRange;

use crate::arena::ArenaRange;
use serde::{Deserialize, Serialize};

/// Round `value` up to the next multiple of `align`, which must be a power of two.
///
/// Returns `None` on overflow.
#[inline]
pub fn round_up(value: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

/// Normalise a `(size, align)` request against the minimum granularity.
///
/// A zero size is treated as one byte, a zero alignment as one byte. Returns `None` when the
/// rounded size would overflow.
#[inline]
pub fn round_request(size: u64, align: u64, granularity: u64) -> Option<(u64, u64)> {
    let size = round_up(size.max(1), granularity)?;
    let align = align.max(1).max(granularity);
    Some((size, align))
}

/// A free `(offset, size)` range within a capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FreeRange {
    pub offset: u64,
    pub size: u64,
}

impl FreeRange {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// One past the last byte of the range.
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Reasons a range cannot be returned to its allocator.
///
/// Each of these means the caller is freeing something the allocator never handed out (or
/// already took back); the allocator state is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("range [{offset}, {end}) exceeds capacity {capacity}")]
    OutOfBounds { offset: u64, end: u64, capacity: u64 },

    #[error("range [{offset}, {end}) is not aligned to the granularity {granularity}")]
    Misaligned {
        offset: u64,
        end: u64,
        granularity: u64,
    },

    #[error("range [{offset}, {end}) overlaps free space (double free?)")]
    OverlapsFree { offset: u64, end: u64 },

    #[error("range at offset {offset} was not allocated")]
    Unknown { offset: u64 },
}

/// The virtual range allocator seam.
pub trait RangeAllocator: Send + std::fmt::Debug {
    /// Carve `size` bytes aligned to `align` out of the free space.
    ///
    /// `None` means this allocator cannot satisfy the request right now; it is an expected,
    /// recoverable outcome.
    fn allocate(&mut self, size: u64, align: u64) -> Option<u64>;

    /// Return a range previously produced by [`RangeAllocator::allocate`].
    ///
    /// `size` is the rounded size the caller was charged for.
    fn free(&mut self, offset: u64, size: u64) -> Result<(), RangeError>;

    /// Total number of bytes managed.
    fn capacity(&self) -> u64;

    /// Number of bytes that are not currently allocated.
    fn free_bytes(&self) -> u64;

    /// `true` when no allocation is live.
    fn is_empty(&self) -> bool {
        self.free_bytes() == self.capacity()
    }
}

/// Which range algorithm backs a block or buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeAlgorithm {
    /// First-fit over a sorted, coalescing free list.
    #[default]
    FirstFit,

    /// Append-only bump allocation, suited to upload-only pools that are rewritten every use.
    Linear,

    /// Two-level segregated fit via the `offset-allocator` crate.
    Tlsf,
}

/// A range allocator chosen at runtime by [`RangeAlgorithm`].
#[derive(Debug)]
pub enum VirtualRange {
    FirstFit(FreeList),
    Linear(LinearRange),
    Tlsf(ArenaRange),
}

impl VirtualRange {
    /// Create an allocator of `algorithm` spanning `capacity` bytes.
    pub fn new(algorithm: RangeAlgorithm, capacity: u64, granularity: u64) -> Self {
        match algorithm {
            RangeAlgorithm::FirstFit => Self::FirstFit(FreeList::new(capacity, granularity)),
            RangeAlgorithm::Linear => Self::Linear(LinearRange::new(capacity, granularity)),
            RangeAlgorithm::Tlsf => Self::Tlsf(ArenaRange::new(capacity, granularity)),
        }
    }

    pub fn algorithm(&self) -> RangeAlgorithm {
        match self {
            Self::FirstFit(_) => RangeAlgorithm::FirstFit,
            Self::Linear(_) => RangeAlgorithm::Linear,
            Self::Tlsf(_) => RangeAlgorithm::Tlsf,
        }
    }

    /// The free list, when this is a first-fit allocator.
    pub fn as_free_list(&self) -> Option<&FreeList> {
        match self {
            Self::FirstFit(list) => Some(list),
            _ => None,
        }
    }

    fn inner(&self) -> &dyn RangeAllocator {
        match self {
            Self::FirstFit(a) => a,
            Self::Linear(a) => a,
            Self::Tlsf(a) => a,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn RangeAllocator {
        match self {
            Self::FirstFit(a) => a,
            Self::Linear(a) => a,
            Self::Tlsf(a) => a,
        }
    }
}

impl RangeAllocator for VirtualRange {
    fn allocate(&mut self, size: u64, align: u64) -> Option<u64> {
        self.inner_mut().allocate(size, align)
    }

    fn free(&mut self, offset: u64, size: u64) -> Result<(), RangeError> {
        self.inner_mut().free(offset, size)
    }

    fn capacity(&self) -> u64 {
        self.inner().capacity()
    }

    fn free_bytes(&self) -> u64 {
        self.inner().free_bytes()
    }
}
