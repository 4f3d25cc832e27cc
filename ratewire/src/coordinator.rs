//! Global send budget shared by all channels.
//!
//! Dispatchers ask the coordinator before every attempt. Permits come from a
//! per-second bucket and, when configured, a per-minute bucket; both are
//! checked and taken under one lock so concurrent loops cannot overdraw.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{SharedClock, SystemClock};
use crate::config::CoordinatorConfig;
use crate::dispatch::ChannelDispatcher;
use crate::limiter::RateBudget;

/// Longest single sleep inside [`GlobalCoordinator::await_permission`].
const MAX_PERMISSION_POLL: Duration = Duration::from_millis(100);

struct GlobalBudgets {
    per_second: RateBudget,
    per_minute: Option<RateBudget>,
}

impl GlobalBudgets {
    fn try_acquire(&mut self) -> bool {
        let minute_ready = self
            .per_minute
            .as_mut()
            .is_none_or(|budget| budget.available_now() >= 1.0);
        if !minute_ready || !self.per_second.consume(1.0) {
            return false;
        }
        if let Some(budget) = self.per_minute.as_mut() {
            budget.consume(1.0);
        }
        true
    }

    fn wait_time(&mut self) -> Duration {
        let second = self.per_second.wait_time(1.0);
        let minute = self
            .per_minute
            .as_mut()
            .map_or(Duration::ZERO, |budget| budget.wait_time(1.0));
        second.max(minute)
    }
}

struct RegisteredChannel {
    /// Weak so the registry never keeps a dispatcher alive.
    dispatcher: Weak<ChannelDispatcher>,
    granted: u64,
    denied: u64,
}

/// Shared rate budget and channel registry.
pub struct GlobalCoordinator {
    config: CoordinatorConfig,
    budgets: Mutex<GlobalBudgets>,
    channels: DashMap<String, RegisteredChannel>,
    total_coordinated: AtomicU64,
    total_throttled: AtomicU64,
    unknown_channel_grants: AtomicU64,
}

impl GlobalCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self::with_clock(config, SystemClock::shared())
    }

    pub fn with_clock(config: CoordinatorConfig, clock: SharedClock) -> Self {
        let per_second = RateBudget::new(
            config.global_messages_per_second,
            config.global_messages_per_second,
            clock.clone(),
        );
        let per_minute = config
            .global_messages_per_minute
            .map(|per_minute| RateBudget::new(per_minute, per_minute / 60.0, clock.clone()));

        info!(
            messages_per_second = config.global_messages_per_second,
            messages_per_minute = ?config.global_messages_per_minute,
            fairness = config.fairness_enabled,
            "Global coordinator initialized"
        );

        Self {
            config,
            budgets: Mutex::new(GlobalBudgets {
                per_second,
                per_minute,
            }),
            channels: DashMap::new(),
            total_coordinated: AtomicU64::new(0),
            total_throttled: AtomicU64::new(0),
            unknown_channel_grants: AtomicU64::new(0),
        }
    }

    /// Add a channel. Re-registering keeps its counters.
    pub fn register(&self, name: &str, dispatcher: &Arc<ChannelDispatcher>) {
        let weak = Arc::downgrade(dispatcher);
        self.channels
            .entry(name.to_string())
            .and_modify(|channel| channel.dispatcher = weak.clone())
            .or_insert_with(|| RegisteredChannel {
                dispatcher: weak,
                granted: 0,
                denied: 0,
            });
        info!(channel = %name, registered = self.channels.len(), "Channel registered");
    }

    /// Remove a channel. Unknown names are ignored.
    pub fn unregister(&self, name: &str) {
        if self.channels.remove(name).is_some() {
            info!(channel = %name, registered = self.channels.len(), "Channel unregistered");
        }
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    pub fn registered_count(&self) -> usize {
        self.channels.len()
    }

    /// Take one global permit for `name`.
    ///
    /// Unregistered names are always granted.
    pub fn request_permission(&self, name: &str) -> bool {
        if !self.channels.contains_key(name) {
            self.unknown_channel_grants.fetch_add(1, Ordering::Relaxed);
            warn!(channel = %name, "Permission requested by unregistered channel, granting");
            return true;
        }

        let granted = self.budgets.lock().try_acquire();

        if let Some(mut channel) = self.channels.get_mut(name) {
            if granted {
                channel.granted += 1;
            } else {
                channel.denied += 1;
            }
        }

        if granted {
            self.total_coordinated.fetch_add(1, Ordering::Relaxed);
        } else {
            self.total_throttled.fetch_add(1, Ordering::Relaxed);
            debug!(channel = %name, "Global budget exhausted");
        }
        granted
    }

    /// Keep asking until granted or `timeout` elapses.
    pub async fn await_permission(&self, name: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.request_permission(name) {
                return true;
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }

            let wait = self
                .budgets
                .lock()
                .wait_time()
                .min(MAX_PERMISSION_POLL)
                .min(deadline - now)
                .max(Duration::from_millis(1));
            tokio::time::sleep(wait).await;
        }
    }

    /// Advisory fraction of the global budget for one channel.
    pub fn fair_share(&self, _name: &str) -> f64 {
        let registered = self.channels.len();
        if !self.config.fairness_enabled || registered == 0 {
            1.0
        } else {
            1.0 / registered as f64
        }
    }

    pub fn available_tokens(&self) -> f64 {
        self.budgets.lock().per_second.available_now()
    }

    /// Zero every counter. Budgets and registrations are kept.
    pub fn reset_stats(&self) {
        self.total_coordinated.store(0, Ordering::Relaxed);
        self.total_throttled.store(0, Ordering::Relaxed);
        self.unknown_channel_grants.store(0, Ordering::Relaxed);
        for mut channel in self.channels.iter_mut() {
            channel.granted = 0;
            channel.denied = 0;
        }
        debug!("Coordinator statistics reset");
    }

    pub fn stats(&self) -> CoordinatorStats {
        // Snapshot the registry first so no DashMap guard is held while
        // dispatchers take their own locks.
        let entries: Vec<_> = self
            .channels
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    entry.dispatcher.clone(),
                    entry.granted,
                    entry.denied,
                )
            })
            .collect();

        let mut channels: Vec<ChannelShare> = entries
            .into_iter()
            .map(|(name, dispatcher, granted, denied)| {
                let dispatcher = dispatcher.upgrade();
                ChannelShare {
                    fair_share: self.fair_share(&name),
                    queue_size: dispatcher.as_ref().map(|d| d.queue_size()),
                    available_tokens: dispatcher.as_ref().map(|d| d.available_tokens()),
                    name,
                    granted,
                    denied,
                }
            })
            .collect();
        channels.sort_by(|a, b| a.name.cmp(&b.name));

        let (available_tokens, available_minute_tokens) = {
            let mut budgets = self.budgets.lock();
            (
                budgets.per_second.available_now(),
                budgets.per_minute.as_mut().map(RateBudget::available_now),
            )
        };

        CoordinatorStats {
            global_limits: GlobalLimits {
                messages_per_second: self.config.global_messages_per_second,
                messages_per_minute: self.config.global_messages_per_minute,
                fairness_enabled: self.config.fairness_enabled,
            },
            registered_channels: channels,
            available_tokens,
            available_minute_tokens,
            total_coordinated: self.total_coordinated.load(Ordering::Relaxed),
            total_throttled: self.total_throttled.load(Ordering::Relaxed),
            unknown_channel_grants: self.unknown_channel_grants.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalLimits {
    pub messages_per_second: f64,
    pub messages_per_minute: Option<f64>,
    pub fairness_enabled: bool,
}

/// Per-channel view in [`CoordinatorStats`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelShare {
    pub name: String,
    pub granted: u64,
    pub denied: u64,
    pub fair_share: f64,
    /// `None` once the dispatcher has been dropped.
    pub queue_size: Option<usize>,
    pub available_tokens: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorStats {
    pub global_limits: GlobalLimits,
    pub registered_channels: Vec<ChannelShare>,
    pub available_tokens: f64,
    pub available_minute_tokens: Option<f64>,
    /// Permits granted.
    pub total_coordinated: u64,
    /// Permits denied.
    pub total_throttled: u64,
    pub unknown_channel_grants: u64,
}
