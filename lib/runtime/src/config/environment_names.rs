// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Environment variable name constants for centralized management across the workspace
//!
//! ## Organization
//!
//! Environment variables are organized by functional area:
//! - **Logging**: Log level, configuration file, output format
//! - **Memory**: Pool and buffer-pool configuration

/// Logging and tracing environment variables
pub mod logging {
    /// Log level (e.g., "debug", "info", "warn", "error") or a full filter directive
    pub const BLOCKPOOL_LOG: &str = "BLOCKPOOL_LOG";

    /// Path to logging configuration file
    pub const BLOCKPOOL_LOGGING_CONFIG_PATH: &str = "BLOCKPOOL_LOGGING_CONFIG_PATH";

    /// Enable JSONL logging format
    pub const BLOCKPOOL_LOGGING_JSONL: &str = "BLOCKPOOL_LOGGING_JSONL";

    /// Disable ANSI terminal colors in logs
    pub const BLOCKPOOL_DISABLE_ANSI_LOGGING: &str = "BLOCKPOOL_DISABLE_ANSI_LOGGING";
}

/// Memory pool configuration environment variables
///
/// Pool settings may also come from a TOML file with `[pool]` and `[buffer_pool]` tables.
pub mod memory {
    /// Path to a TOML configuration file
    pub const BLOCKPOOL_CONFIG_PATH: &str = "BLOCKPOOL_CONFIG_PATH";

    /// Block-list pool settings
    pub mod pool {
        /// Prefix shared by every pool setting
        pub const PREFIX: &str = "BLOCKPOOL_POOL_";

        /// Memory class served by the pool ("device_local" or "host_visible")
        pub const BLOCKPOOL_POOL_MEMORY_CLASS: &str = "BLOCKPOOL_POOL_MEMORY_CLASS";

        /// Standard block size in bytes
        pub const BLOCKPOOL_POOL_BLOCK_SIZE: &str = "BLOCKPOOL_POOL_BLOCK_SIZE";

        /// Fraction of active blocks that may sit idle in the free-block cache
        pub const BLOCKPOOL_POOL_RETENTION_RATIO: &str = "BLOCKPOOL_POOL_RETENTION_RATIO";

        /// Minimum allocation granularity in bytes
        pub const BLOCKPOOL_POOL_MINIMUM_GRANULARITY: &str = "BLOCKPOOL_POOL_MINIMUM_GRANULARITY";

        /// Range algorithm inside each block ("first_fit", "linear" or "tlsf")
        pub const BLOCKPOOL_POOL_RANGE_ALGORITHM: &str = "BLOCKPOOL_POOL_RANGE_ALGORITHM";

        /// Serve every host-visible allocation from its own region
        pub const BLOCKPOOL_POOL_POINTER_STABLE: &str = "BLOCKPOOL_POOL_POINTER_STABLE";
    }

    /// Growable buffer pool settings
    pub mod buffer_pool {
        /// Prefix shared by every buffer pool setting
        pub const PREFIX: &str = "BLOCKPOOL_BUFFER_POOL_";

        /// Memory class of the main buffer
        pub const BLOCKPOOL_BUFFER_POOL_MEMORY_CLASS: &str = "BLOCKPOOL_BUFFER_POOL_MEMORY_CLASS";

        /// Initial capacity of the main buffer in bytes
        pub const BLOCKPOOL_BUFFER_POOL_INITIAL_CAPACITY: &str =
            "BLOCKPOOL_BUFFER_POOL_INITIAL_CAPACITY";

        /// Minimum allocation granularity in bytes
        pub const BLOCKPOOL_BUFFER_POOL_MINIMUM_GRANULARITY: &str =
            "BLOCKPOOL_BUFFER_POOL_MINIMUM_GRANULARITY";

        /// Range algorithm over the main buffer
        pub const BLOCKPOOL_BUFFER_POOL_RANGE_ALGORITHM: &str =
            "BLOCKPOOL_BUFFER_POOL_RANGE_ALGORITHM";

        /// Skip data preservation when the buffer grows
        pub const BLOCKPOOL_BUFFER_POOL_UPLOAD_ONLY: &str = "BLOCKPOOL_BUFFER_POOL_UPLOAD_ONLY";
    }
}
