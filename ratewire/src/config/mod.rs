//! Dispatch configuration.
//!
//! Everything is plain serde data with per-field defaults so a partial JSON
//! document is enough. Durations are carried as `*_ms` integers.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::DEFAULT_MAX_ATTEMPTS;
use crate::{Error, Result};

pub const ENV_GLOBAL_RPS: &str = "RATEWIRE_GLOBAL_RPS";
pub const ENV_WARNING_THRESHOLD: &str = "RATEWIRE_WARNING_THRESHOLD";
pub const ENV_CRITICAL_THRESHOLD: &str = "RATEWIRE_CRITICAL_THRESHOLD";
pub const ENV_LOG: &str = "RATEWIRE_LOG";

/// Limits and retry policy of one delivery channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Unique channel name.
    pub name: String,
    /// Legacy fixed-window cap per second. Also the default token rate.
    #[serde(default = "default_max_per_second")]
    pub max_per_second: u32,
    /// Legacy fixed-window cap per minute.
    #[serde(default = "default_max_per_minute")]
    pub max_per_minute: u32,
    /// Cap on sends to one target in any trailing minute. `None` disables it.
    #[serde(default)]
    pub max_per_target_per_minute: Option<u32>,
    /// Nominal mailbox capacity.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// How far above `max_queue_size` high-priority traffic may go.
    /// Defaults to `max_queue_size`.
    #[serde(default)]
    pub max_overflow: Option<usize>,
    /// Token bucket burst size. Defaults to `max_per_second`.
    #[serde(default)]
    pub token_capacity: Option<f64>,
    /// Token bucket refill rate. Defaults to `max_per_second`.
    #[serde(default)]
    pub token_refill_per_second: Option<f64>,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Relative jitter applied to backoff delays, in `[0, 1]`.
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
    /// Attempts per message before it is dropped.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Enables priority aging. `None` keeps strict priority.
    #[serde(default)]
    pub starvation_threshold: Option<u32>,
    /// Pause after every delivery attempt.
    #[serde(default = "default_pacing_interval_ms")]
    pub pacing_interval_ms: u64,
    /// Longest idle wait before the loop re-checks an empty mailbox.
    #[serde(default = "default_idle_poll_interval_ms")]
    pub idle_poll_interval_ms: u64,
}

fn default_max_per_second() -> u32 {
    30
}

fn default_max_per_minute() -> u32 {
    20
}

fn default_max_queue_size() -> usize {
    100
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter_fraction() -> f64 {
    0.1
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_pacing_interval_ms() -> u64 {
    50
}

fn default_idle_poll_interval_ms() -> u64 {
    100
}

impl ChannelConfig {
    /// Defaults for a channel called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_per_second: default_max_per_second(),
            max_per_minute: default_max_per_minute(),
            max_per_target_per_minute: None,
            max_queue_size: default_max_queue_size(),
            max_overflow: None,
            token_capacity: None,
            token_refill_per_second: None,
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_fraction: default_jitter_fraction(),
            max_attempts: default_max_attempts(),
            starvation_threshold: None,
            pacing_interval_ms: default_pacing_interval_ms(),
            idle_poll_interval_ms: default_idle_poll_interval_ms(),
        }
    }

    pub fn overflow(&self) -> usize {
        self.max_overflow.unwrap_or(self.max_queue_size)
    }

    pub fn token_capacity(&self) -> f64 {
        self.token_capacity
            .unwrap_or(f64::from(self.max_per_second))
    }

    pub fn token_refill_per_second(&self) -> f64 {
        self.token_refill_per_second
            .unwrap_or(f64::from(self.max_per_second))
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn pacing_interval(&self) -> Duration {
        Duration::from_millis(self.pacing_interval_ms)
    }

    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::config("channel name must not be empty"));
        }
        let ctx = |msg: &str| Error::config(format!("channel '{}': {}", self.name, msg));

        if self.max_per_second == 0 || self.max_per_minute == 0 {
            return Err(ctx("max_per_second and max_per_minute must be positive"));
        }
        if self.max_per_target_per_minute == Some(0) {
            return Err(ctx("max_per_target_per_minute must be positive when set"));
        }
        if self.max_queue_size == 0 {
            return Err(ctx("max_queue_size must be positive"));
        }
        if !is_positive(self.token_capacity()) || !is_positive(self.token_refill_per_second()) {
            return Err(ctx("token bucket capacity and refill rate must be positive"));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(ctx("base_delay_ms must not exceed max_delay_ms"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ctx("backoff_multiplier must be at least 1.0"));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(ctx("jitter_fraction must be within [0, 1]"));
        }
        if self.max_attempts == 0 {
            return Err(ctx("max_attempts must be at least 1"));
        }
        if self.idle_poll_interval_ms == 0 {
            return Err(ctx("idle_poll_interval_ms must be positive"));
        }
        Ok(())
    }
}

/// Shared global budget across all channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_global_messages_per_second")]
    pub global_messages_per_second: f64,
    /// Optional second, per-minute global cap.
    #[serde(default)]
    pub global_messages_per_minute: Option<f64>,
    /// Whether `fair_share` divides the budget between channels.
    #[serde(default = "default_true")]
    pub fairness_enabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_global_messages_per_second() -> f64 {
    90.0
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            global_messages_per_second: default_global_messages_per_second(),
            global_messages_per_minute: None,
            fairness_enabled: true,
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<()> {
        if !is_positive(self.global_messages_per_second) {
            return Err(Error::config(
                "global_messages_per_second must be a positive finite number",
            ));
        }
        if let Some(per_minute) = self.global_messages_per_minute
            && !is_positive(per_minute)
        {
            return Err(Error::config(
                "global_messages_per_minute must be a positive finite number",
            ));
        }
        Ok(())
    }
}

/// Queue occupancy watchdog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Queue fill percentage at which a channel is in warning.
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,
    /// Queue fill percentage at which a channel is critical.
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f64,
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
}

fn default_warning_threshold() -> f64 {
    70.0
}

fn default_critical_threshold() -> f64 {
    90.0
}

fn default_check_interval_ms() -> u64 {
    5000
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            warning_threshold: default_warning_threshold(),
            critical_threshold: default_critical_threshold(),
            check_interval_ms: default_check_interval_ms(),
        }
    }
}

impl WatchdogConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let in_range = |v: f64| v > 0.0 && v <= 100.0;
        if !in_range(self.warning_threshold) || !in_range(self.critical_threshold) {
            return Err(Error::config("watchdog thresholds must be within (0, 100]"));
        }
        if self.warning_threshold >= self.critical_threshold {
            return Err(Error::config(
                "warning_threshold must be lower than critical_threshold",
            ));
        }
        if self.check_interval_ms == 0 {
            return Err(Error::config("check_interval_ms must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Emit JSON lines instead of the human-readable format.
    #[serde(default)]
    pub json: bool,
    /// Also write daily-rolling log files here.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_log_filter() -> String {
    "ratewire=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
            log_dir: None,
        }
    }
}

/// Top-level configuration of a [`DispatchHub`](crate::hub::DispatchHub).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl DispatchConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let mut config: Self = serde_json::from_str(&contents)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `RATEWIRE_*` environment variables on top of the loaded values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_with(|key| std::env::var(key).ok())
    }

    fn apply_overrides_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let parse = |key: &str, value: String| -> Result<f64> {
            value
                .trim()
                .parse::<f64>()
                .map_err(|e| Error::config(format!("{}={:?}: {}", key, value, e)))
        };

        if let Some(value) = lookup(ENV_GLOBAL_RPS) {
            self.coordinator.global_messages_per_second = parse(ENV_GLOBAL_RPS, value)?;
        }
        if let Some(value) = lookup(ENV_WARNING_THRESHOLD) {
            self.watchdog.warning_threshold = parse(ENV_WARNING_THRESHOLD, value)?;
        }
        if let Some(value) = lookup(ENV_CRITICAL_THRESHOLD) {
            self.watchdog.critical_threshold = parse(ENV_CRITICAL_THRESHOLD, value)?;
        }
        if let Some(value) = lookup(ENV_LOG) {
            self.logging.filter = value;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for channel in &self.channels {
            channel.validate()?;
            if !seen.insert(channel.name.as_str()) {
                return Err(Error::config(format!(
                    "duplicate channel name '{}'",
                    channel.name
                )));
            }
        }
        self.coordinator.validate()?;
        self.watchdog.validate()?;
        Ok(())
    }
}

fn is_positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}
