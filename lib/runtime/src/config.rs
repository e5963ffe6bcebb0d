// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use figment::providers::Env;
use std::path::PathBuf;

pub mod environment_names;

/// Environment provider for every variable starting with `prefix`.
///
/// The prefix is stripped and the remainder lower-cased, so `BLOCKPOOL_POOL_BLOCK_SIZE` becomes
/// the `block_size` key. Variables that are set but empty are ignored rather than parsed.
pub fn env_provider(prefix: &'static str) -> Env {
    Env::prefixed(prefix).filter_map(move |k| {
        let full_key = format!("{}{}", prefix, k.as_str().to_uppercase());
        // filters out empty environment variables
        match std::env::var(&full_key) {
            Ok(v) if !v.is_empty() => Some(k.into()),
            _ => None,
        }
    })
}

/// Path of the TOML configuration file, when `BLOCKPOOL_CONFIG_PATH` names one.
pub fn config_file_path() -> Option<PathBuf> {
    std::env::var(environment_names::memory::BLOCKPOOL_CONFIG_PATH)
        .ok()
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}

/// Check if a string is truthy
/// This will be used to evaluate environment variables or any other subjective
/// configuration parameters that can be set by the user that should be evaluated
/// as a boolean value.
pub fn is_truthy(val: &str) -> bool {
    matches!(val.to_lowercase().as_str(), "1" | "true" | "on" | "yes")
}

/// Check if an environment variable is truthy
pub fn env_is_truthy(env: &str) -> bool {
    match std::env::var(env) {
        Ok(val) => is_truthy(val.as_str()),
        Err(_) => false,
    }
}

/// Check whether JSONL logging enabled
/// Set the `BLOCKPOOL_LOGGING_JSONL` environment variable a [`is_truthy`] value
pub fn jsonl_logging_enabled() -> bool {
    env_is_truthy(environment_names::logging::BLOCKPOOL_LOGGING_JSONL)
}

/// Check whether logging with ANSI terminal escape codes and colors is disabled.
/// Set the `BLOCKPOOL_DISABLE_ANSI_LOGGING` environment variable a [`is_truthy`] value
pub fn disable_ansi_logging() -> bool {
    env_is_truthy(environment_names::logging::BLOCKPOOL_DISABLE_ANSI_LOGGING)
}
