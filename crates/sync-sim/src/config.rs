use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use sync::{SyncConfig, SyncMode};
use thiserror::Error;

// ============================================================================
// CLI STRUCTS
// ============================================================================

/// Drive the sync engine against a simulated swarm of peers.
#[derive(Parser, Debug)]
#[command(name = "sync-sim", version = "0.1.0")]
pub struct Cli {
    /// Path to TOML configuration file.
    #[arg(short = 'C', long)]
    pub config: Option<PathBuf>,

    /// Length of the chain the peers serve.
    #[arg(long)]
    pub blocks: Option<u64>,

    /// Sync mode (full, fast, light).
    #[arg(long)]
    pub mode: Option<String>,

    /// Peers that answer promptly and correctly.
    #[arg(long = "honest-peers")]
    pub honest_peers: Option<usize>,

    /// Peers that answer correctly after a delay.
    #[arg(long = "slow-peers")]
    pub slow_peers: Option<usize>,

    /// Delay of slow peers, in milliseconds.
    #[arg(long = "slow-delay-ms")]
    pub slow_delay_ms: Option<u64>,

    /// Peers that never answer.
    #[arg(long = "silent-peers")]
    pub silent_peers: Option<usize>,

    /// Peers that serve a broken header chain.
    #[arg(long = "lying-peers")]
    pub lying_peers: Option<usize>,

    /// Seed for the generated chain.
    #[arg(long)]
    pub seed: Option<u8>,

    /// Give up after this many seconds.
    #[arg(long = "deadline-secs")]
    pub deadline_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long = "log-level")]
    pub log_level: Option<String>,
}

// ============================================================================
// CONFIG FILE STRUCTS
// ============================================================================

/// Configuration loaded from TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub blocks: Option<u64>,
    pub honest_peers: Option<usize>,
    pub slow_peers: Option<usize>,
    pub slow_delay_ms: Option<u64>,
    pub silent_peers: Option<usize>,
    pub lying_peers: Option<usize>,
    pub seed: Option<u8>,
    pub deadline_secs: Option<u64>,
    pub log_level: Option<String>,
    /// Engine settings; `--mode` overrides `sync.mode`.
    pub sync: Option<SyncConfig>,
}

// ============================================================================
// RUNTIME CONFIG
// ============================================================================

/// Final merged configuration for runtime.
#[derive(Debug)]
pub struct RuntimeConfig {
    pub blocks: u64,
    pub honest_peers: usize,
    pub slow_peers: usize,
    pub slow_delay: Duration,
    pub silent_peers: usize,
    pub lying_peers: usize,
    pub seed: u8,
    pub deadline: Duration,
    pub log_level: String,
    pub sync: SyncConfig,
}

impl RuntimeConfig {
    /// Merge CLI args with config file. Precedence: CLI > config file > defaults.
    pub fn from_cli_and_file(cli: &Cli, file: ConfigFile) -> Result<Self, ConfigError> {
        let mut sync = file.sync.unwrap_or_default();
        if let Some(mode) = &cli.mode {
            sync.mode = parse_mode(mode)?;
        }
        sync.validate()?;

        let honest_peers = cli.honest_peers.or(file.honest_peers).unwrap_or(3);
        if honest_peers == 0 {
            return Err(ConfigError::Invalid("honest-peers must be at least 1"));
        }

        let blocks = cli.blocks.or(file.blocks).unwrap_or(1_000);
        if blocks == 0 {
            return Err(ConfigError::Invalid("blocks must be positive"));
        }

        let slow_peers = cli.slow_peers.or(file.slow_peers).unwrap_or(1);
        let slow_delay_ms = cli.slow_delay_ms.or(file.slow_delay_ms).unwrap_or(250);
        let silent_peers = cli.silent_peers.or(file.silent_peers).unwrap_or(1);
        let lying_peers = cli.lying_peers.or(file.lying_peers).unwrap_or(1);
        let seed = cli.seed.or(file.seed).unwrap_or(1);
        let deadline_secs = cli.deadline_secs.or(file.deadline_secs).unwrap_or(120);

        let log_level = cli
            .log_level
            .clone()
            .or(file.log_level)
            .unwrap_or_else(|| "info".to_string());

        Ok(RuntimeConfig {
            blocks,
            honest_peers,
            slow_peers,
            slow_delay: Duration::from_millis(slow_delay_ms),
            silent_peers,
            lying_peers,
            seed,
            deadline: Duration::from_secs(deadline_secs),
            log_level,
            sync,
        })
    }
}

fn parse_mode(s: &str) -> Result<SyncMode, ConfigError> {
    match s {
        "full" => Ok(SyncMode::Full),
        "fast" => Ok(SyncMode::Fast),
        "light" => Ok(SyncMode::Light),
        _ => Err(ConfigError::Invalid("mode must be one of full, fast, light")),
    }
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid setting: {0}")]
    Invalid(&'static str),
    #[error(transparent)]
    Sync(#[from] sync::ConfigError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

// ============================================================================
// LOADING FUNCTIONS
// ============================================================================

/// Load TOML config file, returns default if path is None.
pub fn load_config_file(path: Option<&PathBuf>) -> Result<ConfigFile, ConfigError> {
    match path {
        Some(p) => {
            let content = std::fs::read_to_string(p)?;
            toml::from_str(&content).map_err(ConfigError::Toml)
        }
        None => Ok(ConfigFile::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("sync-sim").chain(args.iter().copied()))
    }

    #[test]
    fn cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            blocks = 500
            honest_peers = 5
            log_level = "debug"

            [sync]
            mode = "light"
            header_batch = 64
            "#
        )
        .unwrap();
        let path = file.path().to_path_buf();
        let parsed = load_config_file(Some(&path)).unwrap();
        let config = RuntimeConfig::from_cli_and_file(&cli(&["--blocks", "50", "--mode", "fast"]), parsed).unwrap();

        assert_eq!(config.blocks, 50);
        assert_eq!(config.honest_peers, 5);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.sync.mode, SyncMode::Fast);
        assert_eq!(config.sync.header_batch, 64);
    }

    #[test]
    fn defaults_without_file() {
        let config = RuntimeConfig::from_cli_and_file(&cli(&[]), ConfigFile::default()).unwrap();
        assert_eq!(config.blocks, 1_000);
        assert_eq!(config.sync, SyncConfig::default());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            RuntimeConfig::from_cli_and_file(&cli(&["--mode", "turbo"]), ConfigFile::default()),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            RuntimeConfig::from_cli_and_file(&cli(&["--honest-peers", "0"]), ConfigFile::default()),
            Err(ConfigError::Invalid(_))
        ));
        let file: Result<ConfigFile, _> = toml::from_str("unknown = 1");
        assert!(file.is_err());
    }
}
