//! Periodic queue occupancy watchdog.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::report::{ChannelHealth, HealthLevel, HealthReport};
use crate::config::WatchdogConfig;
use crate::dispatch::ChannelDispatcher;

/// Receives warning and critical reports.
///
/// Runs on the watchdog task, so it should return quickly. Errors and panics
/// are logged and otherwise ignored.
#[async_trait]
pub trait AlertCallback: Send + Sync {
    async fn on_alert(&self, level: HealthLevel, report: &HealthReport) -> crate::Result<()>;
}

#[derive(Debug, Default)]
struct WatchdogCounters {
    checks_performed: AtomicU64,
    warnings_issued: AtomicU64,
    critical_alerts: AtomicU64,
    callback_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
struct LastCheck {
    status: Option<HealthLevel>,
    at: Option<DateTime<Utc>>,
}

/// Background checker of every registered dispatcher's mailbox occupancy.
///
/// Only reads dispatcher state.
pub struct HealthWatchdog {
    config: WatchdogConfig,
    dispatchers: RwLock<BTreeMap<String, Arc<ChannelDispatcher>>>,
    alert_callback: Option<Arc<dyn AlertCallback>>,
    counters: WatchdogCounters,
    last_check: Mutex<LastCheck>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl HealthWatchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            config,
            dispatchers: RwLock::new(BTreeMap::new()),
            alert_callback: None,
            counters: WatchdogCounters::default(),
            last_check: Mutex::new(LastCheck::default()),
            task: Mutex::new(None),
        }
    }

    pub fn with_alert_callback(mut self, callback: Arc<dyn AlertCallback>) -> Self {
        self.alert_callback = Some(callback);
        self
    }

    /// Watch `dispatcher` under its own name. Replaces an earlier entry.
    pub fn register(&self, dispatcher: Arc<ChannelDispatcher>) {
        let name = dispatcher.name().to_string();
        self.dispatchers.write().insert(name.clone(), dispatcher);
        debug!(channel = %name, "Watchdog tracking channel");
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.dispatchers.write().remove(name).is_some()
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.dispatchers.read().keys().cloned().collect()
    }

    /// Classify every registered channel. No side effects.
    pub fn check_health(&self) -> HealthReport {
        let dispatchers: Vec<_> = self.dispatchers.read().values().cloned().collect();

        let mut status = HealthLevel::Healthy;
        let mut channels = Vec::with_capacity(dispatchers.len());
        let mut alerts = Vec::new();

        for dispatcher in dispatchers {
            let queue_size = dispatcher.queue_size();
            let queue_capacity = dispatcher.queue_capacity();
            let queue_percent = if queue_capacity > 0 {
                queue_size as f64 / queue_capacity as f64 * 100.0
            } else {
                0.0
            };
            let level = HealthLevel::classify(
                queue_percent,
                self.config.warning_threshold,
                self.config.critical_threshold,
            );
            let totals = dispatcher.totals();
            let name = dispatcher.name().to_string();

            match level {
                HealthLevel::Critical => {
                    alerts.push(format!("{}: Queue CRITICAL at {:.1}%", name, queue_percent))
                }
                HealthLevel::Warning => {
                    alerts.push(format!("{}: Queue WARNING at {:.1}%", name, queue_percent))
                }
                HealthLevel::Healthy => {}
            }
            if totals.total_dropped > 0 {
                alerts.push(format!(
                    "{}: {} messages dropped",
                    name, totals.total_dropped
                ));
            }

            status = status.max(level);
            channels.push(ChannelHealth {
                name,
                level,
                queue_size,
                queue_capacity,
                queue_percent,
                running: dispatcher.is_running(),
                total_sent: totals.total_sent,
                total_dropped: totals.total_dropped,
                total_failed: totals.total_failed,
            });
        }

        HealthReport {
            status,
            channels,
            alerts,
            checked_at: Utc::now(),
        }
    }

    /// One periodic tick: check, update statistics, alert if needed.
    pub async fn run_check(&self) -> HealthReport {
        let report = self.check_health();
        self.counters
            .checks_performed
            .fetch_add(1, Ordering::Relaxed);
        *self.last_check.lock() = LastCheck {
            status: Some(report.status),
            at: Some(report.checked_at),
        };

        match report.status {
            HealthLevel::Healthy => {
                debug!(channels = report.channels.len(), "Health check passed");
                return report;
            }
            HealthLevel::Warning => {
                self.counters.warnings_issued.fetch_add(1, Ordering::Relaxed);
                warn!(alerts = ?report.alerts, "Queue health warning");
            }
            HealthLevel::Critical => {
                self.counters.critical_alerts.fetch_add(1, Ordering::Relaxed);
                error!(alerts = ?report.alerts, "Queue health critical");
            }
        }

        self.notify(report.status, &report).await;
        report
    }

    async fn notify(&self, level: HealthLevel, report: &HealthReport) {
        let Some(callback) = self.alert_callback.as_ref() else {
            return;
        };

        match AssertUnwindSafe(callback.on_alert(level, report))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.counters.callback_failures.fetch_add(1, Ordering::Relaxed);
                error!(level = %level, error = %e, "Alert callback failed");
            }
            Err(_) => {
                self.counters.callback_failures.fetch_add(1, Ordering::Relaxed);
                error!(level = %level, "Alert callback panicked");
            }
        }
    }

    /// Start the periodic check loop. Returns `false` if already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut task = self.task.lock();
        if task.is_some() {
            return false;
        }

        let token = CancellationToken::new();
        // Weak, so dropping the last handle ends the loop and releases the
        // watched dispatchers.
        let watchdog: Weak<Self> = Arc::downgrade(self);
        let loop_token = token.clone();
        let interval = self.config.check_interval();

        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let Some(watchdog) = watchdog.upgrade() else {
                            break;
                        };
                        watchdog.run_check().await;
                    }
                }
            }
            debug!("Watchdog loop exited");
        });

        *task = Some((token, join));
        info!(
            interval_ms = self.config.check_interval_ms,
            warning_threshold = self.config.warning_threshold,
            critical_threshold = self.config.critical_threshold,
            "Health watchdog started"
        );
        true
    }

    /// Stop the loop. No-op when not running.
    pub async fn stop(&self) {
        let Some((token, join)) = self.task.lock().take() else {
            return;
        };
        token.cancel();
        if let Err(e) = join.await {
            warn!(error = %e, "Watchdog loop ended abnormally");
        }
        info!("Health watchdog stopped");
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    pub fn get_stats(&self) -> WatchdogStats {
        let last = *self.last_check.lock();
        WatchdogStats {
            running: self.is_running(),
            check_interval_ms: self.config.check_interval_ms,
            warning_threshold: self.config.warning_threshold,
            critical_threshold: self.config.critical_threshold,
            channels: self.channel_names(),
            checks_performed: self.counters.checks_performed.load(Ordering::Relaxed),
            warnings_issued: self.counters.warnings_issued.load(Ordering::Relaxed),
            critical_alerts: self.counters.critical_alerts.load(Ordering::Relaxed),
            callback_failures: self.counters.callback_failures.load(Ordering::Relaxed),
            last_status: last.status,
            last_check_at: last.at,
        }
    }
}

impl Drop for HealthWatchdog {
    fn drop(&mut self) {
        if let Some((token, _)) = self.task.get_mut().take() {
            token.cancel();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchdogStats {
    pub running: bool,
    pub check_interval_ms: u64,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    pub channels: Vec<String>,
    pub checks_performed: u64,
    pub warnings_issued: u64,
    pub critical_alerts: u64,
    pub callback_failures: u64,
    pub last_status: Option<HealthLevel>,
    pub last_check_at: Option<DateTime<Utc>>,
}
