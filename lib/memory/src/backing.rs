// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Contracts with the graphics-memory backend.
//!
//! - [`BackingStore`] allocates and frees whole regions of a [`MemoryClass`], and maps
//!   host-visible regions into the process.
//! - [`CommandSubmission`] copies bytes between regions and waits for the device to drain. It is
//!   only needed by the [`GrowablePool`](crate::pool::GrowablePool) during migration.
//!
//! Both are implemented for host memory by [`SystemBackingStore`](crate::SystemBackingStore) and,
//! with the `cuda` feature, for CUDA by `CudaBackingStore`.

use crate::MemoryClass;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Opaque identifier of one region obtained from a [`BackingStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionHandle(pub u64);

impl fmt::Display for RegionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region#{:#x}", self.0)
    }
}

/// Errors reported by a [`BackingStore`].
#[derive(Debug, thiserror::Error)]
pub enum BackingStoreError {
    #[error("out of {class} memory: {requested} bytes requested")]
    OutOfMemory { requested: u64, class: MemoryClass },

    #[error("zero-sized regions are not supported")]
    ZeroSized,

    #[error("{0} is not a live region")]
    UnknownRegion(RegionHandle),

    #[error("{class} memory cannot be mapped into the host")]
    NotMappable { class: MemoryClass },

    #[error("backend error: {0}")]
    Backend(String),

    #[cfg(feature = "cuda")]
    #[error("CUDA error: {0}")]
    Cuda(#[from] cudarc::driver::DriverError),
}

/// Errors reported by a [`CommandSubmission`].
#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    #[error("copy of {size} bytes from {src}+{src_offset} to {dst}+{dst_offset} is out of bounds")]
    OutOfBounds {
        src: RegionHandle,
        src_offset: u64,
        dst: RegionHandle,
        dst_offset: u64,
        size: u64,
    },

    #[error("{0} is not a live region")]
    UnknownRegion(RegionHandle),

    #[error("device error: {0}")]
    Device(String),

    #[cfg(feature = "cuda")]
    #[error("CUDA error: {0}")]
    Cuda(#[from] cudarc::driver::DriverError),
}

/// The low-level allocation capability this crate sub-allocates from.
///
/// Regions are only ever allocated and freed whole. Implementations must be safe to share between
/// threads; the pools themselves never call into the store concurrently.
pub trait BackingStore: Send + Sync {
    /// Allocate a region of exactly `size` bytes in `class`.
    fn allocate_region(
        &self,
        size: u64,
        class: MemoryClass,
    ) -> Result<RegionHandle, BackingStoreError>;

    /// Return a region to the store.
    fn free_region(&self, region: RegionHandle) -> Result<(), BackingStoreError>;

    /// Host address of the first byte of a host-visible region.
    ///
    /// The address stays valid until the region is freed.
    fn map_region(&self, region: RegionHandle) -> Result<usize, BackingStoreError> {
        let _ = region;
        Err(BackingStoreError::NotMappable {
            class: MemoryClass::DeviceLocal,
        })
    }
}

/// Device-side copies used while migrating a [`GrowablePool`](crate::pool::GrowablePool).
pub trait CommandSubmission: Send + Sync {
    /// Copy `size` bytes between two regions. The copy may complete asynchronously.
    fn copy_region(
        &self,
        src: RegionHandle,
        src_offset: u64,
        dst: RegionHandle,
        dst_offset: u64,
        size: u64,
    ) -> Result<(), SubmissionError>;

    /// Block until every previously submitted operation has completed.
    fn wait_until_idle(&self) -> Result<(), SubmissionError>;
}

impl<T: BackingStore + ?Sized> BackingStore for Arc<T> {
    fn allocate_region(
        &self,
        size: u64,
        class: MemoryClass,
    ) -> Result<RegionHandle, BackingStoreError> {
        (**self).allocate_region(size, class)
    }

    fn free_region(&self, region: RegionHandle) -> Result<(), BackingStoreError> {
        (**self).free_region(region)
    }

    fn map_region(&self, region: RegionHandle) -> Result<usize, BackingStoreError> {
        (**self).map_region(region)
    }
}

impl<T: CommandSubmission + ?Sized> CommandSubmission for Arc<T> {
    fn copy_region(
        &self,
        src: RegionHandle,
        src_offset: u64,
        dst: RegionHandle,
        dst_offset: u64,
        size: u64,
    ) -> Result<(), SubmissionError> {
        (**self).copy_region(src, src_offset, dst, dst_offset, size)
    }

    fn wait_until_idle(&self) -> Result<(), SubmissionError> {
        (**self).wait_until_idle()
    }
}
