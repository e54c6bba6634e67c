//! Configuration for the transfer engine.
//!
//! Resolution order: CLI flags → environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $RFT_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/rft/config.toml
//!   3. ~/.config/rft/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::puzzle::DIFFICULTY;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub transport: TransportConfig,
    pub admission: AdmissionConfig,
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Port the server listens on. The client binds port + 1.
    pub port: u16,
    /// Where received files land.
    pub dest: PathBuf,
    /// Directory served files are looked up under.
    pub serve_root: PathBuf,
    /// Receiving-capacity hint advertised to the server, in MB/s.
    pub max_throughput: u16,
    /// Gilbert loss model: probability of entering the lossy state.
    pub loss_p: f64,
    /// Gilbert loss model: probability of leaving the lossy state.
    pub loss_q: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Low bits of the puzzle the client must brute-force.
    pub difficulty: u8,
    /// Server-side admission secret. Override via RFT_SECRET in production.
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Retransmit horizon = factor × average RTT.
    pub timeout_factor: u32,
    /// Attempts per request or window before the transfer is abandoned.
    pub max_retries: u32,
    /// Server drops a connection after this long without a request.
    pub inactivity_secs: u64,
    /// Client gives a file request this long before retrying.
    pub file_request_secs: u64,
    /// Client gives a validation response this long before retrying.
    pub validation_secs: u64,
    /// Lower bound on RTT-derived timeouts.
    pub timeout_floor_ms: u64,
    /// Timeout used before the first RTT sample exists.
    pub initial_timeout_ms: u64,
}

impl TimingConfig {
    pub fn inactivity(&self) -> Duration {
        Duration::from_secs(self.inactivity_secs)
    }

    pub fn file_request(&self) -> Duration {
        Duration::from_secs(self.file_request_secs)
    }

    pub fn validation(&self) -> Duration {
        Duration::from_secs(self.validation_secs)
    }

    pub fn timeout_floor(&self) -> Duration {
        Duration::from_millis(self.timeout_floor_ms)
    }

    pub fn initial_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_timeout_ms)
    }
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            admission: AdmissionConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            dest: PathBuf::from("/tmp"),
            serve_root: PathBuf::from("."),
            max_throughput: 1,
            loss_p: 0.0,
            loss_q: 1.0,
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            difficulty: DIFFICULTY,
            secret: "rft-admission-secret".to_string(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            timeout_factor: 10,
            max_retries: 10,
            inactivity_secs: 180,
            file_request_secs: 600,
            validation_secs: 60,
            timeout_floor_ms: 50,
            initial_timeout_ms: 500,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_or_tmp().join(".config"))
        .join("rft")
}

fn home_or_tmp() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl EngineConfig {
    /// Load config: env vars → file → defaults. CLI flags overlay the
    /// result in the binary.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            EngineConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("RFT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Apply RFT_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RFT_SECRET") {
            self.admission.secret = v;
        }
        if let Ok(v) = std::env::var("RFT_DIFFICULTY") {
            if let Ok(d) = v.parse() {
                self.admission.difficulty = d;
            }
        }
        if let Ok(v) = std::env::var("RFT_MAX_THROUGHPUT") {
            if let Ok(t) = v.parse() {
                self.transport.max_throughput = t;
            }
        }
        if let Ok(v) = std::env::var("RFT_PORT") {
            if let Ok(p) = v.parse() {
                self.transport.port = p;
            }
        }
    }
}
