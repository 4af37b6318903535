//! Broker configuration.
//!
//! Layered as: built-in defaults, an optional TOML file, `SPOOL_*`
//! environment overrides, then whatever the caller sets explicitly.
//! Durations are expressed in milliseconds everywhere outside of Rust.

use serde::{Deserialize, Serialize};
use spool_protocol::codec::{DEFAULT_PREFIX, DEFAULT_REQUEST_EXTENSION, DEFAULT_RESPONSE_EXTENSION};
use spool_protocol::ArtifactCodec;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{BrokerError, Result};

/// Name of the config file picked up from the shared root when no explicit
/// path is given.
pub const CONFIG_FILE_NAME: &str = "spool.toml";

const MAX_ATTEMPTS_CAP: u32 = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    pub root: PathBuf,
    pub prefix: String,
    pub request_extension: String,
    pub response_extension: String,

    /// Backup directory scan period.
    #[serde(rename = "poll_interval_ms", with = "duration_ms")]
    pub poll_interval: Duration,
    /// Poll period handed to the notify backend when it has to fall back to polling.
    #[serde(rename = "notify_poll_interval_ms", with = "duration_ms")]
    pub notify_poll_interval: Duration,
    #[serde(rename = "health_interval_ms", with = "duration_ms")]
    pub health_interval: Duration,
    #[serde(rename = "restart_cooldown_ms", with = "duration_ms")]
    pub restart_cooldown: Duration,
    /// Artificial delay before the responder runs, simulating work.
    #[serde(rename = "processing_delay_ms", with = "duration_ms")]
    pub processing_delay: Duration,

    pub max_attempts: u32,
    #[serde(rename = "base_delay_ms", with = "duration_ms")]
    pub base_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,

    #[serde(rename = "response_poll_interval_ms", with = "duration_ms")]
    pub response_poll_interval: Duration,

    #[serde(rename = "stale_after_ms", with = "duration_ms")]
    pub stale_after: Duration,
    pub response_sample: usize,
    pub top_errors: usize,
    /// Only failures this recent lower the diagnostic health score.
    #[serde(rename = "error_window_ms", with = "duration_ms")]
    pub error_window: Duration,

    pub health_file: Option<PathBuf>,
    pub event_buffer: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            prefix: DEFAULT_PREFIX.to_string(),
            request_extension: DEFAULT_REQUEST_EXTENSION.to_string(),
            response_extension: DEFAULT_RESPONSE_EXTENSION.to_string(),
            poll_interval: Duration::from_secs(2),
            notify_poll_interval: Duration::from_secs(2),
            health_interval: Duration::from_secs(20),
            restart_cooldown: Duration::from_secs(1),
            processing_delay: Duration::ZERO,
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            response_poll_interval: Duration::from_millis(250),
            stale_after: Duration::from_secs(10 * 60),
            response_sample: 20,
            top_errors: 5,
            error_window: Duration::from_secs(24 * 60 * 60),
            health_file: None,
            event_buffer: 1024,
        }
    }
}

impl BrokerConfig {
    #[must_use]
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|err| BrokerError::Config(format!("invalid TOML: {err}")))
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            BrokerError::Config(format!("read config {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Defaults, then `explicit` (or `<root>/spool.toml` when present), then
    /// the process environment.
    pub fn load(root: &Path, explicit: Option<&Path>) -> Result<Self> {
        let candidate = root.join(CONFIG_FILE_NAME);
        let mut config = match explicit {
            Some(path) => Self::from_toml_file(path)?,
            None if candidate.is_file() => Self::from_toml_file(&candidate)?,
            None => Self::default(),
        };
        config.root = root.to_path_buf();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `SPOOL_*` overrides from an arbitrary lookup; unparsable or
    /// non-positive values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let duration = |key: &str| parse_duration_ms(lookup(key).as_deref());

        if let Some(v) = duration("SPOOL_POLL_INTERVAL_MS") {
            self.poll_interval = v;
        }
        if let Some(v) = duration("SPOOL_HEALTH_INTERVAL_MS") {
            self.health_interval = v;
        }
        if let Some(v) = duration("SPOOL_RESTART_COOLDOWN_MS") {
            self.restart_cooldown = v;
        }
        if let Some(v) = duration("SPOOL_PROCESSING_DELAY_MS") {
            self.processing_delay = v;
        }
        if let Some(v) = duration("SPOOL_BASE_DELAY_MS") {
            self.base_delay = v;
        }
        if let Some(v) = duration("SPOOL_MAX_DELAY_MS") {
            self.max_delay = v;
        }
        if let Some(v) = duration("SPOOL_STALE_AFTER_MS") {
            self.stale_after = v;
        }
        if let Some(v) = duration("SPOOL_ERROR_WINDOW_MS") {
            self.error_window = v;
        }
        if let Some(v) = parse_positive_u64(lookup("SPOOL_MAX_ATTEMPTS").as_deref()) {
            self.max_attempts = u32::try_from(v).unwrap_or(MAX_ATTEMPTS_CAP);
        }
        if let Some(prefix) = lookup("SPOOL_PREFIX")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
        {
            self.prefix = prefix;
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.codec()?;
        let intervals = [
            ("poll_interval_ms", self.poll_interval),
            ("notify_poll_interval_ms", self.notify_poll_interval),
            ("health_interval_ms", self.health_interval),
            ("response_poll_interval_ms", self.response_poll_interval),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(BrokerError::Config(format!("{name} must be positive")));
            }
        }
        if self.max_attempts == 0 || self.max_attempts > MAX_ATTEMPTS_CAP {
            return Err(BrokerError::Config(format!(
                "max_attempts must be within 1..={MAX_ATTEMPTS_CAP}"
            )));
        }
        if self.max_delay < self.base_delay {
            return Err(BrokerError::Config(
                "max_delay_ms must not be smaller than base_delay_ms".to_string(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(BrokerError::Config("event_buffer must be positive".to_string()));
        }
        Ok(())
    }

    pub fn codec(&self) -> Result<ArtifactCodec> {
        ArtifactCodec::new(
            self.prefix.clone(),
            self.request_extension.clone(),
            self.response_extension.clone(),
        )
        .map_err(Into::into)
    }
}

fn parse_positive_u64(raw: Option<&str>) -> Option<u64> {
    raw.map(str::trim)
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
}

fn parse_duration_ms(raw: Option<&str>) -> Option<Duration> {
    parse_positive_u64(raw).map(Duration::from_millis)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
