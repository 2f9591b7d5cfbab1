use std::time::Duration;

use gpuexec_mem::{env_var_truthy, PAGE_SIZE_2M, PAGE_SIZE_64K};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_COMMAND_BUFFER_SIZE: usize = PAGE_SIZE_64K;
pub const DEFAULT_RING_BUFFER_SIZE: usize = PAGE_SIZE_64K;
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_WAIT_SPIN_COUNT: u32 = 64;
pub const DEFAULT_FIRST_SUBMISSION_RETRIES: u32 = 3;

const DIRECT_SUBMISSION_ENV: &str = "GPUEXEC_DIRECT_SUBMISSION";
const RING_SIZE_ENV: &str = "GPUEXEC_DIRECT_SUBMISSION_RING_SIZE";
const PREALLOCATED_ENV: &str = "GPUEXEC_PREALLOCATED_COMMAND_BUFFERS";
const COMMAND_BUFFER_SIZE_ENV: &str = "GPUEXEC_COMMAND_BUFFER_SIZE";
const FORCED_ALIGNMENT_ENV: &str = "GPUEXEC_FORCE_COMMAND_BUFFER_ALIGNMENT_KB";
const HUGE_PAGE_THRESHOLD_ENV: &str = "GPUEXEC_HUGE_PAGE_THRESHOLD";
const WAIT_SPIN_COUNT_ENV: &str = "GPUEXEC_WAIT_SPIN_COUNT";
const WAIT_TIMEOUT_ENV: &str = "GPUEXEC_WAIT_TIMEOUT_MS";
const HEAPLESS_ENV: &str = "GPUEXEC_HEAPLESS";
const FIRST_SUBMISSION_RETRIES_ENV: &str = "GPUEXEC_FIRST_SUBMISSION_RETRIES";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for env var {0}")]
    InvalidEnv(&'static str),
    #[error("forced command buffer alignment {0} KiB is not a power of two")]
    InvalidAlignment(u32),
    #[error("{0} must be non-zero")]
    Zero(&'static str),
}

/// Tunables of a command stream receiver.
///
/// `None` fields defer to the GPU family's defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CsrConfig {
    pub direct_submission: Option<bool>,
    pub direct_submission_ring_size: usize,
    pub preallocated_command_buffers: Option<u32>,
    pub command_buffer_size: usize,
    /// Extra command buffer alignment in KiB; zero disables it.
    pub forced_command_buffer_alignment_kb: u32,
    /// Command buffers at least this large are rounded to 2 MiB instead of 64 KiB.
    pub huge_page_threshold: usize,
    pub wait_spin_count: u32,
    /// `None` waits forever.
    pub default_wait_timeout_ms: Option<u64>,
    pub heapless: Option<bool>,
    pub first_submission_retries: u32,
}

impl Default for CsrConfig {
    fn default() -> Self {
        Self {
            direct_submission: None,
            direct_submission_ring_size: DEFAULT_RING_BUFFER_SIZE,
            preallocated_command_buffers: None,
            command_buffer_size: DEFAULT_COMMAND_BUFFER_SIZE,
            forced_command_buffer_alignment_kb: 0,
            huge_page_threshold: PAGE_SIZE_2M,
            wait_spin_count: DEFAULT_WAIT_SPIN_COUNT,
            default_wait_timeout_ms: Some(DEFAULT_WAIT_TIMEOUT_MS),
            heapless: None,
            first_submission_retries: DEFAULT_FIRST_SUBMISSION_RETRIES,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv(name)),
        Err(_) => Ok(None),
    }
}

fn bool_env(name: &'static str) -> Option<bool> {
    std::env::var_os(name).map(|_| env_var_truthy(name))
}

impl CsrConfig {
    /// Defaults overridden by `GPUEXEC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(enabled) = bool_env(DIRECT_SUBMISSION_ENV) {
            config.direct_submission = Some(enabled);
        }
        if let Some(size) = parse_env(RING_SIZE_ENV)? {
            config.direct_submission_ring_size = size;
        }
        if let Some(count) = parse_env(PREALLOCATED_ENV)? {
            config.preallocated_command_buffers = Some(count);
        }
        if let Some(size) = parse_env(COMMAND_BUFFER_SIZE_ENV)? {
            config.command_buffer_size = size;
        }
        if let Some(kb) = parse_env(FORCED_ALIGNMENT_ENV)? {
            config.forced_command_buffer_alignment_kb = kb;
        }
        if let Some(threshold) = parse_env(HUGE_PAGE_THRESHOLD_ENV)? {
            config.huge_page_threshold = threshold;
        }
        if let Some(spins) = parse_env(WAIT_SPIN_COUNT_ENV)? {
            config.wait_spin_count = spins;
        }
        if let Ok(raw) = std::env::var(WAIT_TIMEOUT_ENV) {
            config.default_wait_timeout_ms = match raw.trim() {
                "" | "none" | "infinite" => None,
                value => Some(
                    value
                        .parse::<u64>()
                        .map_err(|_| ConfigError::InvalidEnv(WAIT_TIMEOUT_ENV))?,
                ),
            };
        }
        if let Some(heapless) = bool_env(HEAPLESS_ENV) {
            config.heapless = Some(heapless);
        }
        if let Some(retries) = parse_env(FIRST_SUBMISSION_RETRIES_ENV)? {
            config.first_submission_retries = retries;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let kb = self.forced_command_buffer_alignment_kb;
        if kb != 0 && !kb.is_power_of_two() {
            return Err(ConfigError::InvalidAlignment(kb));
        }
        if self.direct_submission_ring_size == 0 {
            return Err(ConfigError::Zero("direct_submission_ring_size"));
        }
        if self.command_buffer_size == 0 {
            return Err(ConfigError::Zero("command_buffer_size"));
        }
        Ok(())
    }

    pub fn default_wait_timeout(&self) -> Option<Duration> {
        self.default_wait_timeout_ms.map(Duration::from_millis)
    }

    pub fn forced_command_buffer_alignment(&self) -> Option<usize> {
        match self.forced_command_buffer_alignment_kb {
            0 => None,
            kb => Some(kb as usize * 1024),
        }
    }
}
