use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::aggregate::key::is_valid_component;
use crate::identity::DEFAULT_COMMAND;

/// Top-level configuration for the loadtally aggregator.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Identifies the test run in every output row. Default: "-1".
    #[serde(default)]
    pub run_id: String,

    /// Aggregated output configuration.
    #[serde(default)]
    pub output: OutputConfig,

    /// Machine identity resolution.
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Drain timing.
    #[serde(default)]
    pub drain: DrainConfig,

    /// Worker pool configuration.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Aggregated output configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Output file path; "-" writes to stdout. Default: "agg_out.csv".
    #[serde(default = "default_output_path")]
    pub path: String,

    /// Append to an existing file instead of truncating it. Default: true.
    #[serde(default = "default_true")]
    pub append: bool,
}

/// Machine identity resolution.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    /// Shell command printing the machine id. Default: "cat /etc/nagent_sn".
    #[serde(default = "default_identity_command")]
    pub command: String,

    /// Upper bound for one command run. Default: 2s.
    #[serde(default = "default_identity_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Drain timing.
#[derive(Debug, Clone, Deserialize)]
pub struct DrainConfig {
    /// Delay before the first periodic drain. Default: 3s.
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Drain period. Default: 1s.
    #[serde(default = "default_drain_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// How long a closed second stays open for stragglers. Default: 0s.
    #[serde(default, with = "humantime_serde")]
    pub allowed_lateness: Duration,

    /// Wait after the last run ends before the final drain. Default: 2s.
    #[serde(default = "default_final_grace", with = "humantime_serde")]
    pub final_grace: Duration,
}

/// Worker pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Async worker threads running combines and drains. Default: 10.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_true() -> bool {
    true
}

fn default_output_path() -> String {
    "agg_out.csv".to_string()
}

fn default_identity_command() -> String {
    DEFAULT_COMMAND.to_string()
}

fn default_identity_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(3)
}

fn default_drain_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_final_grace() -> Duration {
    Duration::from_secs(2)
}

fn default_worker_threads() -> usize {
    10
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: default_output_path(),
            append: true,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            command: default_identity_command(),
            timeout: default_identity_timeout(),
        }
    }
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            interval: default_drain_interval(),
            allowed_lateness: Duration::ZERO,
            final_grace: default_final_grace(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::from_yaml(&data).with_context(|| format!("loading config file {}", path.display()))
    }

    /// Parse and validate configuration from YAML text. Empty text yields
    /// the defaults.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config = if data.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(data).context("parsing config")?
        };

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_component(&self.run_id) {
            bail!("run_id must not contain '|' or ','");
        }

        if self.output.path.is_empty() {
            bail!("output.path is required");
        }

        if self.identity.command.trim().is_empty() {
            bail!("identity.command is required");
        }

        if self.identity.timeout.is_zero() {
            bail!("identity.timeout must be positive");
        }

        if self.drain.interval.is_zero() {
            bail!("drain.interval must be positive");
        }

        if self.drain.allowed_lateness.subsec_nanos() != 0 {
            bail!("drain.allowed_lateness must be a whole number of seconds");
        }

        if self.runtime.worker_threads == 0 {
            bail!("runtime.worker_threads must be positive");
        }

        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when enabled");
        }

        Ok(())
    }
}
