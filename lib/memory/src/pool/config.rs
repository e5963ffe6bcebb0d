// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::MemoryClass;
use crate::range::RangeAlgorithm;
use anyhow::Result;
use blockpool_runtime::config::environment_names::memory as env_memory;
use blockpool_runtime::config::{config_file_path, env_provider};
use derive_builder::Builder;
use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::path::Path;
use validator::{Validate, ValidationError};

/// Default standard block size.
pub const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024 * 1024;

/// Default minimum allocation granularity.
pub const DEFAULT_MINIMUM_GRANULARITY: u64 = 4 * 1024;

/// Default share of active blocks that may be retained idle in the free-block cache.
pub const DEFAULT_RETENTION_RATIO: f64 = 1.0 / 16.0;

/// Default initial capacity of a growable buffer pool.
pub const DEFAULT_INITIAL_CAPACITY: u64 = 16 * 1024 * 1024;

/// Configuration of a block-list [`Pool`](super::Pool).
///
/// Loaded from the TOML `[pool]` table of `BLOCKPOOL_CONFIG_PATH` and `BLOCKPOOL_POOL_*`
/// environment variables by [`PoolConfig::from_settings`].
#[derive(Serialize, Deserialize, Validate, Debug, Builder, Clone, PartialEq)]
#[builder(build_fn(private, name = "build_internal"), derive(Debug, Serialize))]
#[validate(schema(function = "validate_pool_config"))]
pub struct PoolConfig {
    /// Memory class every block of this pool is allocated in
    #[builder(default)]
    #[builder_field_attr(serde(skip_serializing_if = "Option::is_none"))]
    pub memory_class: MemoryClass,

    /// Size of a standard (shared) block in bytes
    /// Requests larger than this are promoted to dedicated allocations.
    #[validate(range(min = 1))]
    #[builder(default = "DEFAULT_BLOCK_SIZE")]
    #[builder_field_attr(serde(skip_serializing_if = "Option::is_none"))]
    pub block_size: u64,

    /// Share of the active block count that may stay resident as empty cached blocks
    /// At least one block is always retained.
    #[validate(range(min = 0.0, max = 1.0))]
    #[builder(default = "DEFAULT_RETENTION_RATIO")]
    #[builder_field_attr(serde(skip_serializing_if = "Option::is_none"))]
    pub retention_ratio: f64,

    /// Every size is rounded up to, and every alignment clamped to at least, this many bytes
    #[builder(default = "DEFAULT_MINIMUM_GRANULARITY")]
    #[builder_field_attr(serde(skip_serializing_if = "Option::is_none"))]
    pub minimum_granularity: u64,

    /// Range algorithm tracking the free space inside each block
    #[builder(default)]
    #[builder_field_attr(serde(skip_serializing_if = "Option::is_none"))]
    pub range_algorithm: RangeAlgorithm,

    /// Host-visible pools whose regions must never be shared serve every request as a dedicated
    /// allocation
    #[builder(default)]
    #[builder_field_attr(serde(skip_serializing_if = "Option::is_none"))]
    pub pointer_stable: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            memory_class: MemoryClass::default(),
            block_size: DEFAULT_BLOCK_SIZE,
            retention_ratio: DEFAULT_RETENTION_RATIO,
            minimum_granularity: DEFAULT_MINIMUM_GRANULARITY,
            range_algorithm: RangeAlgorithm::default(),
            pointer_stable: false,
        }
    }
}

impl PoolConfig {
    /// Table of the configuration file holding pool settings.
    pub const SECTION: &'static str = "pool";

    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::default()
    }

    /// Settings sources, lowest priority first: defaults, the `[pool]` table of `path`, then
    /// `BLOCKPOOL_POOL_*` environment variables.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(PoolConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Figment::from(Toml::file(path)).focus(Self::SECTION));
        }
        figment.merge(env_provider(env_memory::pool::PREFIX))
    }

    /// Load the pool configuration from the configuration file and the environment.
    pub fn from_settings() -> Result<PoolConfig> {
        let config: PoolConfig = Self::figment(config_file_path().as_deref()).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// `true` when every allocation must get its own region.
    pub fn forces_dedicated(&self) -> bool {
        self.pointer_stable && self.memory_class.is_host_visible()
    }
}

impl PoolConfigBuilder {
    /// Select append-only allocation inside each block, or the default first-fit.
    pub fn linear_algorithm(&mut self, linear: bool) -> &mut Self {
        self.range_algorithm = Some(if linear {
            RangeAlgorithm::Linear
        } else {
            RangeAlgorithm::FirstFit
        });
        self
    }

    /// Build and validate the pool configuration
    pub fn build(&self) -> Result<PoolConfig> {
        let config = self.build_internal()?;
        config.validate()?;
        Ok(config)
    }

    /// Build from the settings sources, with every field set on this builder taking precedence.
    pub fn build_with_settings(&self) -> Result<PoolConfig> {
        self.build_with_settings_from(config_file_path().as_deref())
    }

    /// Like [`Self::build_with_settings`], reading the configuration file at `path` instead.
    pub fn build_with_settings_from(&self, path: Option<&Path>) -> Result<PoolConfig> {
        let config: PoolConfig = PoolConfig::figment(path)
            .merge(Serialized::defaults(self))
            .extract()?;
        config.validate()?;
        Ok(config)
    }
}

/// Configuration of a [`GrowablePool`](super::GrowablePool).
///
/// Loaded from the TOML `[buffer_pool]` table of `BLOCKPOOL_CONFIG_PATH` and
/// `BLOCKPOOL_BUFFER_POOL_*` environment variables by [`BufferPoolConfig::from_settings`].
#[derive(Serialize, Deserialize, Validate, Debug, Builder, Clone, PartialEq)]
#[builder(build_fn(private, name = "build_internal"), derive(Debug, Serialize))]
#[validate(schema(function = "validate_buffer_pool_config"))]
pub struct BufferPoolConfig {
    /// Memory class of the main buffer and every overflow region
    #[builder(default)]
    #[builder_field_attr(serde(skip_serializing_if = "Option::is_none"))]
    pub memory_class: MemoryClass,

    /// Capacity of the main buffer when the pool is created
    #[validate(range(min = 1))]
    #[builder(default = "DEFAULT_INITIAL_CAPACITY")]
    #[builder_field_attr(serde(skip_serializing_if = "Option::is_none"))]
    pub initial_capacity: u64,

    /// Every size is rounded up to, and every alignment clamped to at least, this many bytes
    #[builder(default = "DEFAULT_MINIMUM_GRANULARITY")]
    #[builder_field_attr(serde(skip_serializing_if = "Option::is_none"))]
    pub minimum_granularity: u64,

    /// Range algorithm over the main buffer
    /// Growth must re-place every live allocation, so only `first_fit` and `linear` are accepted.
    #[builder(default)]
    #[builder_field_attr(serde(skip_serializing_if = "Option::is_none"))]
    pub range_algorithm: RangeAlgorithm,

    /// Contents are rewritten before every use, so growing never copies data
    #[builder(default)]
    #[builder_field_attr(serde(skip_serializing_if = "Option::is_none"))]
    pub upload_only: bool,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            memory_class: MemoryClass::default(),
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            minimum_granularity: DEFAULT_MINIMUM_GRANULARITY,
            range_algorithm: RangeAlgorithm::default(),
            upload_only: false,
        }
    }
}

impl BufferPoolConfig {
    /// Table of the configuration file holding buffer pool settings.
    pub const SECTION: &'static str = "buffer_pool";

    pub fn builder() -> BufferPoolConfigBuilder {
        BufferPoolConfigBuilder::default()
    }

    /// Settings sources, lowest priority first: defaults, the `[buffer_pool]` table of `path`,
    /// then `BLOCKPOOL_BUFFER_POOL_*` environment variables.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(BufferPoolConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Figment::from(Toml::file(path)).focus(Self::SECTION));
        }
        figment.merge(env_provider(env_memory::buffer_pool::PREFIX))
    }

    /// Load the buffer pool configuration from the configuration file and the environment.
    pub fn from_settings() -> Result<BufferPoolConfig> {
        let config: BufferPoolConfig = Self::figment(config_file_path().as_deref()).extract()?;
        config.validate()?;
        Ok(config)
    }
}

impl BufferPoolConfigBuilder {
    /// Build and validate the buffer pool configuration
    pub fn build(&self) -> Result<BufferPoolConfig> {
        let config = self.build_internal()?;
        config.validate()?;
        Ok(config)
    }

    /// Build from the settings sources, with every field set on this builder taking precedence.
    pub fn build_with_settings(&self) -> Result<BufferPoolConfig> {
        self.build_with_settings_from(config_file_path().as_deref())
    }

    /// Like [`Self::build_with_settings`], reading the configuration file at `path` instead.
    pub fn build_with_settings_from(&self, path: Option<&Path>) -> Result<BufferPoolConfig> {
        let config: BufferPoolConfig = BufferPoolConfig::figment(path)
            .merge(Serialized::defaults(self))
            .extract()?;
        config.validate()?;
        Ok(config)
    }
}

fn invalid(code: &'static str, message: String) -> ValidationError {
    ValidationError::new(code).with_message(Cow::Owned(message))
}

fn validate_granularity(granularity: u64) -> Result<(), ValidationError> {
    if !granularity.is_power_of_two() {
        return Err(invalid(
            "minimum_granularity",
            format!("minimum_granularity {granularity} is not a power of two"),
        ));
    }
    Ok(())
}

fn validate_pool_config(config: &PoolConfig) -> Result<(), ValidationError> {
    validate_granularity(config.minimum_granularity)?;
    if config.block_size % config.minimum_granularity != 0 {
        return Err(invalid(
            "block_size",
            format!(
                "block_size {} is not a multiple of minimum_granularity {}",
                config.block_size, config.minimum_granularity
            ),
        ));
    }
    Ok(())
}

fn validate_buffer_pool_config(config: &BufferPoolConfig) -> Result<(), ValidationError> {
    validate_granularity(config.minimum_granularity)?;
    // TLSF rounds requests up to its bin sizes, so a grown buffer of `capacity + overflow`
    // bytes is not guaranteed to hold every live allocation again.
    if config.range_algorithm == RangeAlgorithm::Tlsf {
        return Err(invalid(
            "range_algorithm",
            "a growable buffer pool cannot use the tlsf range algorithm".to_string(),
        ));
    }
    if config.initial_capacity % config.minimum_granularity != 0 {
        return Err(invalid(
            "initial_capacity",
            format!(
                "initial_capacity {} is not a multiple of minimum_granularity {}",
                config.initial_capacity, config.minimum_granularity
            ),
        ));
    }
    Ok(())
}
