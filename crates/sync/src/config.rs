use std::path::Path;
use std::time::Duration;

use alloy_primitives::B256;
use serde::Deserialize;
use thiserror::Error;

/// Which data a sync session fetches and how blocks are imported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Headers, bodies and execution of every block.
    #[default]
    Full,
    /// Receipts up to a pivot, state at the pivot, execution after it.
    Fast,
    /// Headers only.
    Light,
}

/// Trusted block the ancestor search never looks below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Checkpoint {
    pub hash: B256,
    pub number: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetcherConfig {
    /// Outstanding announcements per peer before it is treated as flooding.
    pub announce_limit: usize,
    /// Complete blocks queued per peer while their parent is missing.
    pub block_limit: usize,
    /// How far ahead of the local head an announcement may be.
    pub max_queue_distance: u64,
    /// How far behind the local head an announcement may be.
    pub max_uncle_distance: u64,
    pub fetch_timeout_ms: u64,
    pub announce_expiry_secs: u64,
    pub max_extra_data: usize,
    /// Total orphan blocks held across all peers.
    pub max_orphans: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            announce_limit: 256,
            block_limit: 64,
            max_queue_distance: 32,
            max_uncle_distance: 7,
            fetch_timeout_ms: 5_000,
            announce_expiry_secs: 60,
            max_extra_data: 32,
            max_orphans: 256,
        }
    }
}

impl FetcherConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn announce_expiry(&self) -> Duration {
        Duration::from_secs(self.announce_expiry_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub mode: SyncMode,
    pub header_batch: u64,
    pub body_batch: usize,
    pub receipt_batch: usize,
    pub state_batch: usize,
    /// Result slots held before header fetching pauses.
    pub max_pending_results: usize,
    /// Tasks a peer may hold per data kind.
    pub max_inflight_per_peer: usize,
    pub request_timeout_ms: u64,
    /// Consecutive failed requests before a peer is dropped.
    pub max_consecutive_failures: u32,
    /// Weight of a new measurement in the throughput moving average.
    pub throughput_impact: f64,
    pub max_reorg_depth: u64,
    pub pivot_confirmations: u64,
    pub stall_timeout_secs: u64,
    pub sync_interval_secs: u64,
    pub tick_interval_ms: u64,
    /// Start a session when a heavier peer connects.
    pub auto_sync: bool,
    pub checkpoint: Option<Checkpoint>,
    pub fetcher: FetcherConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::Full,
            header_batch: 192,
            body_batch: 128,
            receipt_batch: 256,
            state_batch: 384,
            max_pending_results: 2048,
            max_inflight_per_peer: 1,
            request_timeout_ms: 15_000,
            max_consecutive_failures: 3,
            throughput_impact: 0.1,
            max_reorg_depth: 90_000,
            pivot_confirmations: 64,
            stall_timeout_secs: 60,
            sync_interval_secs: 10,
            tick_interval_ms: 1_000,
            auto_sync: true,
            checkpoint: None,
            fetcher: FetcherConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.header_batch == 0 {
            return Err(ConfigError::Invalid("header_batch must be positive"));
        }
        if self.body_batch == 0 || self.receipt_batch == 0 || self.state_batch == 0 {
            return Err(ConfigError::Invalid("batch sizes must be positive"));
        }
        if self.max_inflight_per_peer == 0 {
            return Err(ConfigError::Invalid("max_inflight_per_peer must be positive"));
        }
        if self.max_consecutive_failures == 0 {
            return Err(ConfigError::Invalid("max_consecutive_failures must be positive"));
        }
        if !(self.throughput_impact > 0.0 && self.throughput_impact <= 1.0) {
            return Err(ConfigError::Invalid("throughput_impact must be in (0, 1]"));
        }
        if (self.max_pending_results as u64) < self.header_batch {
            return Err(ConfigError::Invalid(
                "max_pending_results must hold at least one header batch",
            ));
        }
        if self.request_timeout_ms == 0 || self.fetcher.fetch_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive"));
        }
        if self.fetcher.announce_limit == 0 {
            return Err(ConfigError::Invalid("fetcher.announce_limit must be positive"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Low watermark at which header fetching resumes after back-pressure.
    pub fn resume_results(&self) -> usize {
        self.max_pending_results * 3 / 4
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid sync config: {0}")]
    Invalid(&'static str),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),
}
