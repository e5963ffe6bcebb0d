// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Common imports for pool users.

pub use crate::backing::{BackingStore, CommandSubmission, RegionHandle};
pub use crate::pool::{
    Allocation, BufferAllocation, BufferPoolConfig, BufferSlice, CheckpointOutcome, GrowablePool,
    Pool, PoolConfig, PoolState,
};
pub use crate::range::{RangeAlgorithm, RangeAllocator};
pub use crate::{AllocError, MemoryClass};
