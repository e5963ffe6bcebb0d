// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! System memory backing store.
//!
//! Every region is a zero-initialised heap allocation. Both memory classes are served from host
//! memory; only [`MemoryClass::HostVisible`] regions may be mapped, so code exercised against this
//! store behaves the same way it would against a device that keeps device-local memory private.
//!
//! Copies are plain synchronous memcpys, which makes [`CommandSubmission::wait_until_idle`] a
//! no-op beyond bookkeeping.

use crate::MemoryClass;
use crate::backing::{
    BackingStore, BackingStoreError, CommandSubmission, RegionHandle, SubmissionError,
};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug)]
struct SystemRegion {
    class: MemoryClass,
    bytes: Box<[u8]>,
}

#[derive(Debug, Default)]
struct SystemState {
    next_handle: u64,
    regions: HashMap<RegionHandle, SystemRegion>,
    allocated_bytes: u64,
    regions_acquired: u64,
    regions_released: u64,
    copies: u64,
    idle_waits: u64,
}

/// Host heap implementation of [`BackingStore`] and [`CommandSubmission`].
#[derive(Debug, Default)]
pub struct SystemBackingStore {
    limit: Option<u64>,
    state: Mutex<SystemState>,
}

impl SystemBackingStore {
    /// A store without a capacity limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that refuses to hold more than `limit` bytes at once.
    pub fn with_limit(limit: u64) -> Self {
        Self {
            limit: Some(limit),
            state: Mutex::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, SystemState> {
        self.state
            .lock()
            .expect("system backing store mutex poisoned")
    }

    /// Bytes currently held by live regions.
    pub fn allocated_bytes(&self) -> u64 {
        self.state().allocated_bytes
    }

    /// Number of live regions.
    pub fn live_regions(&self) -> usize {
        self.state().regions.len()
    }

    /// Total number of regions ever allocated.
    pub fn regions_acquired(&self) -> u64 {
        self.state().regions_acquired
    }

    /// Total number of regions ever freed.
    pub fn regions_released(&self) -> u64 {
        self.state().regions_released
    }

    /// Number of copies submitted so far.
    pub fn copies(&self) -> u64 {
        self.state().copies
    }

    /// Number of times the store was asked to drain.
    pub fn idle_waits(&self) -> u64 {
        self.state().idle_waits
    }

    /// Size of a live region.
    pub fn region_size(&self, region: RegionHandle) -> Option<u64> {
        self.state()
            .regions
            .get(&region)
            .map(|r| r.bytes.len() as u64)
    }

    /// Write `data` into a region at `offset`.
    pub fn write(
        &self,
        region: RegionHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackingStoreError> {
        let mut state = self.state();
        let entry = state
            .regions
            .get_mut(&region)
            .ok_or(BackingStoreError::UnknownRegion(region))?;
        let range = byte_range(offset, data.len() as u64, entry.bytes.len()).ok_or_else(|| {
            BackingStoreError::Backend(format!(
                "write of {} bytes at {offset} exceeds {region}",
                data.len()
            ))
        })?;
        entry.bytes[range].copy_from_slice(data);
        Ok(())
    }

    /// Read `len` bytes from a region at `offset`.
    pub fn read(
        &self,
        region: RegionHandle,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, BackingStoreError> {
        let state = self.state();
        let entry = state
            .regions
            .get(&region)
            .ok_or(BackingStoreError::UnknownRegion(region))?;
        let range = byte_range(offset, len, entry.bytes.len()).ok_or_else(|| {
            BackingStoreError::Backend(format!(
                "read of {len} bytes at {offset} exceeds {region}"
            ))
        })?;
        Ok(entry.bytes[range].to_vec())
    }
}

fn byte_range(offset: u64, len: u64, limit: usize) -> Option<std::ops::Range<usize>> {
    let start = usize::try_from(offset).ok()?;
    let end = start.checked_add(usize::try_from(len).ok()?)?;
    (end <= limit).then_some(start..end)
}

impl BackingStore for SystemBackingStore {
    fn allocate_region(
        &self,
        size: u64,
        class: MemoryClass,
    ) -> Result<RegionHandle, BackingStoreError> {
        if size == 0 {
            return Err(BackingStoreError::ZeroSized);
        }

        let mut state = self.state();
        let exhausted = self
            .limit
            .is_some_and(|limit| state.allocated_bytes.saturating_add(size) > limit);
        let len = usize::try_from(size).ok().filter(|_| !exhausted).ok_or(
            BackingStoreError::OutOfMemory {
                requested: size,
                class,
            },
        )?;

        state.next_handle += 1;
        let handle = RegionHandle(state.next_handle);
        state.regions.insert(
            handle,
            SystemRegion {
                class,
                bytes: vec![0u8; len].into_boxed_slice(),
            },
        );
        state.allocated_bytes += size;
        state.regions_acquired += 1;

        tracing::trace!(%handle, size, %class, "system region allocated");
        Ok(handle)
    }

    fn free_region(&self, region: RegionHandle) -> Result<(), BackingStoreError> {
        let mut state = self.state();
        let entry = state
            .regions
            .remove(&region)
            .ok_or(BackingStoreError::UnknownRegion(region))?;
        state.allocated_bytes -= entry.bytes.len() as u64;
        state.regions_released += 1;

        tracing::trace!(handle = %region, "system region freed");
        Ok(())
    }

    fn map_region(&self, region: RegionHandle) -> Result<usize, BackingStoreError> {
        let state = self.state();
        let entry = state
            .regions
            .get(&region)
            .ok_or(BackingStoreError::UnknownRegion(region))?;
        match entry.class {
            MemoryClass::HostVisible => Ok(entry.bytes.as_ptr() as usize),
            class => Err(BackingStoreError::NotMappable { class }),
        }
    }
}

impl CommandSubmission for SystemBackingStore {
    fn copy_region(
        &self,
        src: RegionHandle,
        src_offset: u64,
        dst: RegionHandle,
        dst_offset: u64,
        size: u64,
    ) -> Result<(), SubmissionError> {
        let out_of_bounds = || SubmissionError::OutOfBounds {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        };

        let mut state = self.state();

        let source = state
            .regions
            .get(&src)
            .ok_or(SubmissionError::UnknownRegion(src))?;
        let src_range = byte_range(src_offset, size, source.bytes.len()).ok_or_else(out_of_bounds)?;

        if src == dst {
            let dst_range =
                byte_range(dst_offset, size, source.bytes.len()).ok_or_else(out_of_bounds)?;
            let entry = state
                .regions
                .get_mut(&src)
                .ok_or(SubmissionError::UnknownRegion(src))?;
            entry.bytes.copy_within(src_range, dst_range.start);
        } else {
            let data = source.bytes[src_range].to_vec();
            let target = state
                .regions
                .get_mut(&dst)
                .ok_or(SubmissionError::UnknownRegion(dst))?;
            let dst_range =
                byte_range(dst_offset, size, target.bytes.len()).ok_or_else(out_of_bounds)?;
            target.bytes[dst_range].copy_from_slice(&data);
        }

        state.copies += 1;
        Ok(())
    }

    fn wait_until_idle(&self) -> Result<(), SubmissionError> {
        self.state().idle_waits += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_free_region() {
        let store = SystemBackingStore::new();
        let region = store
            .allocate_region(4096, MemoryClass::DeviceLocal)
            .unwrap();
        assert_eq!(store.allocated_bytes(), 4096);
        assert_eq!(store.region_size(region), Some(4096));

        store.free_region(region).unwrap();
        assert_eq!(store.allocated_bytes(), 0);
        assert_eq!(store.live_regions(), 0);
        assert_eq!(store.regions_acquired(), 1);
        assert_eq!(store.regions_released(), 1);
    }

    #[test]
    fn test_zero_sized_region_is_rejected() {
        let store = SystemBackingStore::new();
        assert!(matches!(
            store.allocate_region(0, MemoryClass::DeviceLocal),
            Err(BackingStoreError::ZeroSized)
        ));
    }

    #[test]
    fn test_limit_is_enforced() {
        let store = SystemBackingStore::with_limit(8192);
        let _a = store.allocate_region(4096, MemoryClass::DeviceLocal).unwrap();
        let _b = store.allocate_region(4096, MemoryClass::DeviceLocal).unwrap();
        assert!(matches!(
            store.allocate_region(4096, MemoryClass::DeviceLocal),
            Err(BackingStoreError::OutOfMemory {
                requested: 4096,
                ..
            })
        ));
    }

    #[test]
    fn test_double_free_is_reported() {
        let store = SystemBackingStore::new();
        let region = store.allocate_region(64, MemoryClass::DeviceLocal).unwrap();
        store.free_region(region).unwrap();
        assert!(matches!(
            store.free_region(region),
            Err(BackingStoreError::UnknownRegion(_))
        ));
    }

    #[test]
    fn test_only_host_visible_regions_map() {
        let store = SystemBackingStore::new();
        let device = store.allocate_region(64, MemoryClass::DeviceLocal).unwrap();
        let host = store.allocate_region(64, MemoryClass::HostVisible).unwrap();
        assert!(store.map_region(device).is_err());
        assert_ne!(store.map_region(host).unwrap(), 0);
    }

    #[test]
    fn test_copy_between_regions() {
        let store = SystemBackingStore::new();
        let a = store.allocate_region(64, MemoryClass::DeviceLocal).unwrap();
        let b = store.allocate_region(64, MemoryClass::DeviceLocal).unwrap();
        store.write(a, 8, &[1, 2, 3, 4]).unwrap();

        store.copy_region(a, 8, b, 32, 4).unwrap();
        store.wait_until_idle().unwrap();

        assert_eq!(store.read(b, 32, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(store.copies(), 1);
        assert_eq!(store.idle_waits(), 1);
    }

    #[test]
    fn test_copy_within_region() {
        let store = SystemBackingStore::new();
        let a = store.allocate_region(16, MemoryClass::DeviceLocal).unwrap();
        store.write(a, 0, &[9, 8, 7, 6]).unwrap();
        store.copy_region(a, 0, a, 12, 4).unwrap();
        assert_eq!(store.read(a, 12, 4).unwrap(), vec![9, 8, 7, 6]);
    }

    #[test]
    fn test_copy_out_of_bounds() {
        let store = SystemBackingStore::new();
        let a = store.allocate_region(16, MemoryClass::DeviceLocal).unwrap();
        let b = store.allocate_region(8, MemoryClass::DeviceLocal).unwrap();
        assert!(matches!(
            store.copy_region(a, 0, b, 4, 8),
            Err(SubmissionError::OutOfBounds { .. })
        ));
    }
}
