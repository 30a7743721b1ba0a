// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Boot-time kernel sizing loaded from TOML
//! OWNERS: @kernel-team
//! PUBLIC API: KernelConfig::{from_toml_str, load, validate}, ConfigError
//! DEPENDS_ON: serde, toml, thiserror
//! INVARIANTS: max_envs is a power of two within the id encoding; heap_top page-aligned

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::types::{PAGE_SIZE, UHEAP_TOP, UTEXT, UTOP, MAX_ENV_SLOTS};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read kernel config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse kernel config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid kernel config: {0}")]
    Invalid(&'static str),
}

/// Sizing knobs for the kernel model.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    /// Number of environment slots (power of two).
    pub max_envs: usize,
    /// Physical frames available, table pages included.
    pub frames: usize,
    /// Initial program break of every new environment.
    pub heap_top: usize,
    /// Descriptor ring length of the loopback NIC.
    pub nic_ring: usize,
    /// Capacity of the blocked-sender FIFO (queued-send builds only).
    pub send_queue_capacity: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_envs: 1024,
            frames: 4096,
            heap_top: UHEAP_TOP,
            nic_ring: 64,
            send_queue_capacity: 1024,
        }
    }
}

impl KernelConfig {
    /// Parses and validates a TOML document; absent keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads and parses the config file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_envs < 2 || !self.max_envs.is_power_of_two() {
            return Err(ConfigError::Invalid("max_envs must be a power of two >= 2"));
        }
        if self.max_envs > MAX_ENV_SLOTS {
            return Err(ConfigError::Invalid("max_envs exceeds the id encoding"));
        }
        if self.frames == 0 {
            return Err(ConfigError::Invalid("frames must be non-zero"));
        }
        if self.heap_top % PAGE_SIZE != 0 || self.heap_top <= UTEXT || self.heap_top >= UTOP {
            return Err(ConfigError::Invalid("heap_top must be page-aligned inside user space"));
        }
        if self.nic_ring == 0 {
            return Err(ConfigError::Invalid("nic_ring must be non-zero"));
        }
        if self.send_queue_capacity == 0 {
            return Err(ConfigError::Invalid("send_queue_capacity must be non-zero"));
        }
        Ok(())
    }
}
