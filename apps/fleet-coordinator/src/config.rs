use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:7400";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Runtime settings for the coordinator.
///
/// Layered as defaults, then an optional TOML file, then `FLEET_*`
/// environment variables; the daemon CLI applies its flags last.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    pub listen_addr: SocketAddr,
    pub http_addr: Option<SocketAddr>,
    pub persistence_dir: Option<PathBuf>,
    pub required_capabilities: BTreeSet<String>,

    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
    pub removal_grace: Duration,

    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub probe_window_size: usize,
    pub clock_staleness: Duration,
    pub clock_reset_threshold: Duration,

    pub command_ack_timeout: Duration,
    pub command_retry_count: u32,
    pub command_retry_backoff: Duration,

    pub arming_timeout: Duration,
    pub stop_timeout: Duration,
    pub start_lead_time: Duration,
    pub min_quorum_fraction: Option<f64>,
    pub min_live_fraction: Option<f64>,

    pub handshake_timeout: Duration,
    pub write_timeout: Duration,
    pub max_protocol_errors: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 7400))),
            http_addr: None,
            persistence_dir: None,
            required_capabilities: BTreeSet::new(),
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(3),
            sweep_interval: Duration::from_millis(250),
            removal_grace: Duration::from_secs(60),
            probe_interval: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(1),
            probe_window_size: 8,
            clock_staleness: Duration::from_secs(10),
            clock_reset_threshold: Duration::from_millis(50),
            command_ack_timeout: Duration::from_millis(500),
            command_retry_count: 3,
            command_retry_backoff: Duration::from_millis(100),
            arming_timeout: Duration::from_secs(2),
            stop_timeout: Duration::from_secs(3),
            start_lead_time: Duration::from_millis(500),
            min_quorum_fraction: None,
            min_live_fraction: None,
            handshake_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(2),
            max_protocol_errors: 5,
        }
    }
}

/// On-disk representation; every duration is in milliseconds.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    listen_addr: Option<SocketAddr>,
    http_addr: Option<SocketAddr>,
    persistence_dir: Option<PathBuf>,
    required_capabilities: Option<BTreeSet<String>>,
    heartbeat_interval_ms: Option<u64>,
    heartbeat_timeout_ms: Option<u64>,
    sweep_interval_ms: Option<u64>,
    removal_grace_ms: Option<u64>,
    probe_interval_ms: Option<u64>,
    probe_timeout_ms: Option<u64>,
    probe_window_size: Option<usize>,
    clock_staleness_ms: Option<u64>,
    clock_reset_threshold_ms: Option<u64>,
    command_ack_timeout_ms: Option<u64>,
    command_retry_count: Option<u32>,
    command_retry_backoff_ms: Option<u64>,
    arming_timeout_ms: Option<u64>,
    stop_timeout_ms: Option<u64>,
    start_lead_time_ms: Option<u64>,
    min_quorum_fraction: Option<f64>,
    min_live_fraction: Option<f64>,
    handshake_timeout_ms: Option<u64>,
    write_timeout_ms: Option<u64>,
    max_protocol_errors: Option<u32>,
}

impl CoordinatorConfig {
    /// Builds the effective configuration from an optional file plus the
    /// process environment, then validates it.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = path {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            config.merge_toml(&raw)?;
        }
        config.apply_env_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.merge_toml(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn merge_toml(&mut self, raw: &str) -> Result<(), ConfigError> {
        let file: FileConfig = toml::from_str(raw)?;
        if let Some(addr) = file.listen_addr {
            self.listen_addr = addr;
        }
        if file.http_addr.is_some() {
            self.http_addr = file.http_addr;
        }
        if file.persistence_dir.is_some() {
            self.persistence_dir = file.persistence_dir;
        }
        if let Some(caps) = file.required_capabilities {
            self.required_capabilities = caps;
        }
        merge_ms(&mut self.heartbeat_interval, file.heartbeat_interval_ms);
        merge_ms(&mut self.heartbeat_timeout, file.heartbeat_timeout_ms);
        merge_ms(&mut self.sweep_interval, file.sweep_interval_ms);
        merge_ms(&mut self.removal_grace, file.removal_grace_ms);
        merge_ms(&mut self.probe_interval, file.probe_interval_ms);
        merge_ms(&mut self.probe_timeout, file.probe_timeout_ms);
        merge_ms(&mut self.clock_staleness, file.clock_staleness_ms);
        merge_ms(&mut self.clock_reset_threshold, file.clock_reset_threshold_ms);
        merge_ms(&mut self.command_ack_timeout, file.command_ack_timeout_ms);
        merge_ms(&mut self.command_retry_backoff, file.command_retry_backoff_ms);
        merge_ms(&mut self.arming_timeout, file.arming_timeout_ms);
        merge_ms(&mut self.stop_timeout, file.stop_timeout_ms);
        merge_ms(&mut self.start_lead_time, file.start_lead_time_ms);
        merge_ms(&mut self.handshake_timeout, file.handshake_timeout_ms);
        merge_ms(&mut self.write_timeout, file.write_timeout_ms);
        if let Some(size) = file.probe_window_size {
            self.probe_window_size = size;
        }
        if let Some(count) = file.command_retry_count {
            self.command_retry_count = count;
        }
        if file.min_quorum_fraction.is_some() {
            self.min_quorum_fraction = file.min_quorum_fraction;
        }
        if file.min_live_fraction.is_some() {
            self.min_live_fraction = file.min_live_fraction;
        }
        if let Some(max) = file.max_protocol_errors {
            self.max_protocol_errors = max;
        }
        Ok(())
    }

    /// Applies `FLEET_*` overrides read through `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("FLEET_LISTEN_ADDR") {
            self.listen_addr = parse_env("FLEET_LISTEN_ADDR", &value)?;
        }
        if let Some(value) = lookup("FLEET_HTTP_ADDR") {
            self.http_addr = Some(parse_env("FLEET_HTTP_ADDR", &value)?);
        }
        if let Some(value) = lookup("FLEET_PERSISTENCE_DIR") {
            self.persistence_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("FLEET_REQUIRED_CAPABILITIES") {
            self.required_capabilities = value
                .split(',')
                .map(str::trim)
                .filter(|cap| !cap.is_empty())
                .map(str::to_owned)
                .collect();
        }

        let durations: [(&'static str, &mut Duration); 15] = [
            ("FLEET_HEARTBEAT_INTERVAL_MS", &mut self.heartbeat_interval),
            ("FLEET_HEARTBEAT_TIMEOUT_MS", &mut self.heartbeat_timeout),
            ("FLEET_SWEEP_INTERVAL_MS", &mut self.sweep_interval),
            ("FLEET_REMOVAL_GRACE_MS", &mut self.removal_grace),
            ("FLEET_PROBE_INTERVAL_MS", &mut self.probe_interval),
            ("FLEET_PROBE_TIMEOUT_MS", &mut self.probe_timeout),
            ("FLEET_CLOCK_STALENESS_MS", &mut self.clock_staleness),
            ("FLEET_CLOCK_RESET_THRESHOLD_MS", &mut self.clock_reset_threshold),
            ("FLEET_COMMAND_ACK_TIMEOUT_MS", &mut self.command_ack_timeout),
            ("FLEET_COMMAND_RETRY_BACKOFF_MS", &mut self.command_retry_backoff),
            ("FLEET_ARMING_TIMEOUT_MS", &mut self.arming_timeout),
            ("FLEET_STOP_TIMEOUT_MS", &mut self.stop_timeout),
            ("FLEET_START_LEAD_TIME_MS", &mut self.start_lead_time),
            ("FLEET_HANDSHAKE_TIMEOUT_MS", &mut self.handshake_timeout),
            ("FLEET_WRITE_TIMEOUT_MS", &mut self.write_timeout),
        ];
        for (key, slot) in durations {
            if let Some(value) = lookup(key) {
                *slot = Duration::from_millis(parse_env(key, &value)?);
            }
        }

        if let Some(value) = lookup("FLEET_PROBE_WINDOW_SIZE") {
            self.probe_window_size = parse_env("FLEET_PROBE_WINDOW_SIZE", &value)?;
        }
        if let Some(value) = lookup("FLEET_COMMAND_RETRY_COUNT") {
            self.command_retry_count = parse_env("FLEET_COMMAND_RETRY_COUNT", &value)?;
        }
        if let Some(value) = lookup("FLEET_MIN_QUORUM_FRACTION") {
            self.min_quorum_fraction = Some(parse_env("FLEET_MIN_QUORUM_FRACTION", &value)?);
        }
        if let Some(value) = lookup("FLEET_MIN_LIVE_FRACTION") {
            self.min_live_fraction = Some(parse_env("FLEET_MIN_LIVE_FRACTION", &value)?);
        }
        if let Some(value) = lookup("FLEET_MAX_PROTOCOL_ERRORS") {
            self.max_protocol_errors = parse_env("FLEET_MAX_PROTOCOL_ERRORS", &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(invalid("heartbeat_interval must be non-zero"));
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(invalid("heartbeat_timeout must exceed heartbeat_interval"));
        }
        if self.sweep_interval.is_zero() || self.probe_interval.is_zero() {
            return Err(invalid("sweep_interval and probe_interval must be non-zero"));
        }
        if self.probe_window_size == 0 {
            return Err(invalid("probe_window_size must be at least 1"));
        }
        if self.clock_staleness <= self.probe_interval {
            return Err(invalid("clock_staleness must exceed probe_interval"));
        }
        if self.command_ack_timeout.is_zero() {
            return Err(invalid("command_ack_timeout must be non-zero"));
        }
        if self.command_retry_count > 0 && self.command_retry_backoff.is_zero() {
            return Err(invalid("command_retry_backoff must be non-zero when retries are enabled"));
        }
        if self.max_protocol_errors == 0 {
            return Err(invalid("max_protocol_errors must be at least 1"));
        }
        if self.arming_timeout.is_zero() || self.stop_timeout.is_zero() {
            return Err(invalid("arming_timeout and stop_timeout must be non-zero"));
        }
        for (name, fraction) in [
            ("min_quorum_fraction", self.min_quorum_fraction),
            ("min_live_fraction", self.min_live_fraction),
        ] {
            if let Some(value) = fraction {
                if !(value > 0.0 && value <= 1.0) {
                    return Err(invalid(&format!("{name} must be within (0, 1], got {value}")));
                }
            }
        }
        Ok(())
    }
}

fn merge_ms(target: &mut Duration, value: Option<u64>) {
    if let Some(ms) = value {
        *target = Duration::from_millis(ms);
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key,
        value: value.to_string(),
    })
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_string())
}
