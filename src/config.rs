// src/config.rs
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ipc::backoff::BackoffSchedule;

pub const DEFAULT_BACKOFF_MS: [u64; 5] = [100, 500, 1000, 2000, 5000];
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;
pub const DEFAULT_PIPE_BUFFER_SIZE: u32 = 1024;
pub const DEFAULT_INITIAL_REFRESH_MS: u64 = 200;

const ENV_RUNTIME_DIR: &str = "FRPWATCH_RUNTIME_DIR";
const ENV_BACKOFF_MS: &str = "FRPWATCH_BACKOFF_MS";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Backoff schedule must not be empty")]
    EmptyBackoff,

    #[error("Backoff schedule must be non-decreasing (step {index} is shorter than the one before)")]
    InvalidBackoff { index: usize },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Settings shared by the GUI-side tracker and the worker-side server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WatchConfig {
    pub backoff_ms: Vec<u64>,
    pub runtime_dir: Option<PathBuf>,
    pub max_frame_bytes: usize,
    pub pipe_buffer_size: u32,
    pub initial_refresh_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            backoff_ms: DEFAULT_BACKOFF_MS.to_vec(),
            runtime_dir: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            pipe_buffer_size: DEFAULT_PIPE_BUFFER_SIZE,
            initial_refresh_ms: DEFAULT_INITIAL_REFRESH_MS,
        }
    }
}

impl WatchConfig {
    /// Load a JSON config file. Missing keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.backoff_schedule()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides(|key| env::var(key).ok())?;
        Ok(config)
    }

    fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_RUNTIME_DIR).filter(|v| !v.trim().is_empty()) {
            self.runtime_dir = Some(PathBuf::from(dir));
        }

        if let Some(raw) = lookup(ENV_BACKOFF_MS) {
            let steps = raw
                .split(',')
                .map(|part| part.trim().parse::<u64>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| ConfigError::InvalidValue {
                    key: ENV_BACKOFF_MS.to_string(),
                    value: raw.clone(),
                })?;
            self.backoff_ms = steps;
        }

        self.backoff_schedule()?;
        Ok(())
    }

    pub fn backoff_schedule(&self) -> Result<BackoffSchedule, ConfigError> {
        BackoffSchedule::new(
            self.backoff_ms
                .iter()
                .copied()
                .map(Duration::from_millis)
                .collect(),
        )
    }

    /// Directory holding Unix socket endpoints.
    pub fn resolved_runtime_dir(&self) -> PathBuf {
        self.runtime_dir
            .clone()
            .or_else(dirs::runtime_dir)
            .unwrap_or_else(env::temp_dir)
    }

    pub fn initial_refresh(&self) -> Duration {
        Duration::from_millis(self.initial_refresh_ms)
    }
}
