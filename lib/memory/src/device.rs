// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! CUDA backing store.
//!
//! Device-local regions come from `cuMemAlloc`, host-visible regions from pinned `cuMemHostAlloc`.
//! Copies are issued on the context's default stream with unified addressing, so the same path
//! serves every pair of memory classes.

use crate::MemoryClass;
use crate::backing::{
    BackingStore, BackingStoreError, CommandSubmission, RegionHandle, SubmissionError,
};
use cudarc::driver::sys::{self, CUresult};
use cudarc::driver::{CudaContext, CudaStream};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy)]
struct CudaRegion {
    class: MemoryClass,
    ptr: u64,
    len: u64,
}

#[derive(Debug, Default)]
struct Regions {
    next_handle: u64,
    live: HashMap<RegionHandle, CudaRegion>,
}

/// [`BackingStore`] and [`CommandSubmission`] over one CUDA device.
#[derive(Debug)]
pub struct CudaBackingStore {
    ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    device_id: usize,
    regions: Mutex<Regions>,
}

// SAFETY: region pointers are plain integers owned by this store and only dereferenced by the
// driver; the context is bound to the calling thread before every driver call.
unsafe impl Send for CudaBackingStore {}
unsafe impl Sync for CudaBackingStore {}

impl CudaBackingStore {
    pub fn new(device_id: usize) -> Result<Self, BackingStoreError> {
        let ctx = CudaContext::new(device_id)?;
        let stream = ctx.default_stream();
        tracing::info!(device_id, "opened CUDA backing store");
        Ok(Self {
            ctx,
            stream,
            device_id,
            regions: Mutex::default(),
        })
    }

    pub fn device_id(&self) -> usize {
        self.device_id
    }

    fn regions(&self) -> MutexGuard<'_, Regions> {
        self.regions
            .lock()
            .expect("CUDA backing store mutex poisoned")
    }

    fn lookup(&self, region: RegionHandle) -> Option<CudaRegion> {
        self.regions().live.get(&region).copied()
    }
}

impl BackingStore for CudaBackingStore {
    fn allocate_region(
        &self,
        size: u64,
        class: MemoryClass,
    ) -> Result<RegionHandle, BackingStoreError> {
        if size == 0 {
            return Err(BackingStoreError::ZeroSized);
        }
        let len = usize::try_from(size).map_err(|_| BackingStoreError::OutOfMemory {
            requested: size,
            class,
        })?;

        self.ctx.bind_to_thread()?;
        let ptr = match class {
            MemoryClass::DeviceLocal => unsafe { cudarc::driver::result::malloc_sync(len)? },
            MemoryClass::HostVisible => unsafe {
                cudarc::driver::result::malloc_host(len, sys::CU_MEMHOSTALLOC_PORTABLE)? as u64
            },
        };

        let mut regions = self.regions();
        regions.next_handle += 1;
        let handle = RegionHandle(regions.next_handle);
        regions.live.insert(
            handle,
            CudaRegion {
                class,
                ptr,
                len: size,
            },
        );

        tracing::debug!(%handle, size, %class, device_id = self.device_id, "CUDA region allocated");
        Ok(handle)
    }

    fn free_region(&self, region: RegionHandle) -> Result<(), BackingStoreError> {
        let entry = self
            .regions()
            .live
            .remove(&region)
            .ok_or(BackingStoreError::UnknownRegion(region))?;

        self.ctx.bind_to_thread()?;
        unsafe {
            match entry.class {
                MemoryClass::DeviceLocal => cudarc::driver::result::free_sync(entry.ptr)?,
                MemoryClass::HostVisible => {
                    cudarc::driver::result::free_host(entry.ptr as *mut std::ffi::c_void)?
                }
            }
        }
        tracing::debug!(handle = %region, "CUDA region freed");
        Ok(())
    }

    fn map_region(&self, region: RegionHandle) -> Result<usize, BackingStoreError> {
        let entry = self
            .lookup(region)
            .ok_or(BackingStoreError::UnknownRegion(region))?;
        match entry.class {
            MemoryClass::HostVisible => Ok(entry.ptr as usize),
            class => Err(BackingStoreError::NotMappable { class }),
        }
    }
}

impl CommandSubmission for CudaBackingStore {
    fn copy_region(
        &self,
        src: RegionHandle,
        src_offset: u64,
        dst: RegionHandle,
        dst_offset: u64,
        size: u64,
    ) -> Result<(), SubmissionError> {
        let source = self.lookup(src).ok_or(SubmissionError::UnknownRegion(src))?;
        let target = self.lookup(dst).ok_or(SubmissionError::UnknownRegion(dst))?;

        let in_bounds = |offset: u64, region: &CudaRegion| {
            offset
                .checked_add(size)
                .is_some_and(|end| end <= region.len)
        };
        if !in_bounds(src_offset, &source) || !in_bounds(dst_offset, &target) {
            return Err(SubmissionError::OutOfBounds {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            });
        }

        self.ctx.bind_to_thread()?;
        // SAFETY: both ranges were bounds-checked against live regions owned by this store.
        let result = unsafe {
            sys::cuMemcpyAsync(
                target.ptr + dst_offset,
                source.ptr + src_offset,
                size as usize,
                self.stream.cu_stream(),
            )
        };
        if result != CUresult::CUDA_SUCCESS {
            return Err(SubmissionError::Device(format!(
                "cuMemcpyAsync failed with error: {result:?}"
            )));
        }
        Ok(())
    }

    fn wait_until_idle(&self) -> Result<(), SubmissionError> {
        self.ctx.bind_to_thread()?;
        self.stream.synchronize()?;
        Ok(())
    }
}

impl Drop for CudaBackingStore {
    fn drop(&mut self) {
        let leaked: Vec<RegionHandle> = self.regions().live.keys().copied().collect();
        if !leaked.is_empty() {
            tracing::warn!(count = leaked.len(), "CUDA backing store dropped with live regions");
        }
        for region in leaked {
            if let Err(e) = self.free_region(region) {
                tracing::debug!(%region, "failed to free CUDA region: {e}");
            }
        }
    }
}
