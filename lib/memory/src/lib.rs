// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Region-based sub-allocation of GPU-visible memory.
//!
//! This crate carves caller-requested byte ranges out of a small number of large regions obtained
//! from a graphics-memory backend:
//! - [`range`]: virtual range allocators (first-fit free list, linear, TLSF) over `[0, capacity)`
//! - [`Block`]: one backing region and the range state tracking its free space
//! - [`Pool`]: chooses which block serves a request, caches emptied blocks, and hands out
//!   dedicated whole-region allocations
//! - [`GrowablePool`]: a single linear buffer that overflows into private regions and grows at
//!   caller-chosen checkpoints
//!
//! The backend is reached through the [`BackingStore`] and [`CommandSubmission`] traits.

pub mod arena;
pub mod backing;
pub mod block;
pub mod metrics;
pub mod pool;
pub mod prelude;
pub mod range;

#[cfg(feature = "cuda")]
mod device;
mod system;


pub use arena::ArenaRange;
pub use backing::{
    BackingStore, BackingStoreError, CommandSubmission, RegionHandle, SubmissionError,
};
pub use block::Block;
#[cfg(feature = "cuda")]
pub use device::CudaBackingStore;
pub use metrics::{MemoryMetrics, PoolMetrics};
pub use pool::{
    Allocation, BufferAllocation, BufferPoolConfig, GrowablePool, Pool, PoolConfig, PoolStats,
};
pub use range::{FreeRange, RangeAlgorithm, RangeAllocator, RangeError, VirtualRange};
pub use system::SystemBackingStore;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for allocation operations.
pub type Result<T> = std::result::Result<T, AllocError>;

/// Errors surfaced to callers of [`Pool`] and [`GrowablePool`].
///
/// A miss inside a single block is never an error; it is resolved by the pool's fallback chain.
/// Freeing something the pool never handed out is a caller bug and panics instead.
#[derive(Debug, Error)]
pub enum AllocError {
    #[error("backing store could not supply {size} bytes of {class} memory")]
    BackingStoreExhausted {
        size: u64,
        class: MemoryClass,
        #[source]
        source: BackingStoreError,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to release {region}")]
    Release {
        region: RegionHandle,
        #[source]
        source: BackingStoreError,
    },

    #[error("command submission failed: {0}")]
    Submission(#[from] SubmissionError),

    #[error("migration precondition violated: {0}")]
    MigrationPrecondition(String),

    #[error("migration failed: {0}")]
    MigrationFailed(String),

    #[error("pool is poisoned by an earlier failed migration")]
    Poisoned,
}

/// Memory class of a region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryClass {
    /// Memory private to the device.
    #[default]
    DeviceLocal,

    /// Memory the host can map and address directly.
    HostVisible,
}

impl MemoryClass {
    pub fn is_host_visible(&self) -> bool {
        matches!(self, MemoryClass::HostVisible)
    }
}

impl fmt::Display for MemoryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryClass::DeviceLocal => write!(f, "device-local"),
            MemoryClass::HostVisible => write!(f, "host-visible"),
        }
    }
}
