//! Health report types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Occupancy level of a channel or of the whole system.
///
/// Ordered by severity so the system level is the `max` of channel levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    #[default]
    Healthy,
    Warning,
    Critical,
}

impl HealthLevel {
    /// Classify a queue fill percentage.
    pub fn classify(queue_percent: f64, warning_threshold: f64, critical_threshold: f64) -> Self {
        if queue_percent >= critical_threshold {
            HealthLevel::Critical
        } else if queue_percent >= warning_threshold {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthLevel::Healthy => "healthy",
            HealthLevel::Warning => "warning",
            HealthLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health of one channel at check time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelHealth {
    pub name: String,
    pub level: HealthLevel,
    pub queue_size: usize,
    pub queue_capacity: usize,
    pub queue_percent: f64,
    pub running: bool,
    pub total_sent: u64,
    pub total_dropped: u64,
    pub total_failed: u64,
}

/// Result of one health check over every registered channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Worst channel level.
    pub status: HealthLevel,
    pub channels: Vec<ChannelHealth>,
    /// Human-readable findings, one line each.
    pub alerts: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn channel(&self, name: &str) -> Option<&ChannelHealth> {
        self.channels.iter().find(|c| c.name == name)
    }
}
