// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide plumbing shared by the blockpool crates: logging bootstrap, environment variable
//! names and configuration helpers.

pub mod config;
pub mod logging;
