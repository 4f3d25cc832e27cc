//! Multi-channel dispatch hub.
//!
//! Builds one [`ChannelDispatcher`] per configured channel, wires them to a
//! shared [`GlobalCoordinator`] and a [`HealthWatchdog`], and manages their
//! lifecycle together.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{ChannelConfig, DispatchConfig};
use crate::coordinator::{CoordinatorStats, GlobalCoordinator};
use crate::dispatch::{ChannelDispatcher, DeliveryFunction, DispatcherStats};
use crate::domain::OutboundMessage;
use crate::health::{AlertCallback, HealthReport, HealthWatchdog, WatchdogStats};
use crate::{Error, Result};

pub struct DispatchHub {
    dispatchers: BTreeMap<String, Arc<ChannelDispatcher>>,
    coordinator: Option<Arc<GlobalCoordinator>>,
    watchdog: Option<Arc<HealthWatchdog>>,
}

impl DispatchHub {
    /// Build a hub where every channel delivers through `delivery`.
    pub fn new(config: &DispatchConfig, delivery: Arc<dyn DeliveryFunction>) -> Result<Self> {
        Self::builder(config)
            .delivery(move |_| delivery.clone())
            .build()
    }

    pub fn builder(config: &DispatchConfig) -> DispatchHubBuilder<'_> {
        DispatchHubBuilder {
            config,
            delivery: None,
            alert_callback: None,
        }
    }

    /// Start every dispatcher and the watchdog. Must be called within a Tokio runtime.
    pub fn start(&self) {
        for dispatcher in self.dispatchers.values() {
            dispatcher.start();
        }
        if let Some(watchdog) = &self.watchdog {
            watchdog.start();
        }
        info!(channels = self.dispatchers.len(), "Dispatch hub started");
    }

    /// Stop the watchdog, then every dispatcher. Queued messages are discarded.
    pub async fn stop(&self) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.stop().await;
        }
        for dispatcher in self.dispatchers.values() {
            dispatcher.stop().await;
        }
        info!("Dispatch hub stopped");
    }

    /// Queue `message` on `channel`.
    ///
    /// `Ok(false)` means the channel dropped it for lack of space.
    pub fn enqueue(&self, channel: &str, message: OutboundMessage) -> Result<bool> {
        let dispatcher = self
            .dispatchers
            .get(channel)
            .ok_or_else(|| Error::not_found("channel", channel))?;
        if message.target.trim().is_empty() {
            return Err(Error::validation("message target must not be empty"));
        }
        Ok(dispatcher.enqueue(message))
    }

    pub fn dispatcher(&self, name: &str) -> Option<&Arc<ChannelDispatcher>> {
        self.dispatchers.get(name)
    }

    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.dispatchers.keys().map(String::as_str)
    }

    pub fn coordinator(&self) -> Option<&Arc<GlobalCoordinator>> {
        self.coordinator.as_ref()
    }

    pub fn watchdog(&self) -> Option<&Arc<HealthWatchdog>> {
        self.watchdog.as_ref()
    }

    /// On-demand health report, `None` when the watchdog is disabled.
    pub fn check_health(&self) -> Option<HealthReport> {
        self.watchdog.as_ref().map(|w| w.check_health())
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            channels: self.dispatchers.values().map(|d| d.stats()).collect(),
            coordinator: self.coordinator.as_ref().map(|c| c.stats()),
            watchdog: self.watchdog.as_ref().map(|w| w.get_stats()),
        }
    }
}

type DeliveryFactory<'a> = Box<dyn Fn(&ChannelConfig) -> Arc<dyn DeliveryFunction> + 'a>;

pub struct DispatchHubBuilder<'a> {
    config: &'a DispatchConfig,
    delivery: Option<DeliveryFactory<'a>>,
    alert_callback: Option<Arc<dyn AlertCallback>>,
}

impl<'a> DispatchHubBuilder<'a> {
    /// Choose the delivery function of each channel.
    pub fn delivery(
        mut self,
        factory: impl Fn(&ChannelConfig) -> Arc<dyn DeliveryFunction> + 'a,
    ) -> Self {
        self.delivery = Some(Box::new(factory));
        self
    }

    pub fn alert_callback(mut self, callback: Arc<dyn AlertCallback>) -> Self {
        self.alert_callback = Some(callback);
        self
    }

    pub fn build(self) -> Result<DispatchHub> {
        let config = self.config;
        config.validate()?;
        let factory = self
            .delivery
            .ok_or_else(|| Error::config("no delivery function configured"))?;

        let coordinator = config
            .coordinator
            .enabled
            .then(|| Arc::new(GlobalCoordinator::new(config.coordinator.clone())));

        let watchdog = config.watchdog.enabled.then(|| {
            let watchdog = HealthWatchdog::new(config.watchdog.clone());
            let watchdog = match self.alert_callback {
                Some(callback) => watchdog.with_alert_callback(callback),
                None => watchdog,
            };
            Arc::new(watchdog)
        });

        let mut dispatchers = BTreeMap::new();
        for channel in &config.channels {
            let dispatcher = Arc::new(ChannelDispatcher::new(channel.clone(), factory(channel)));
            if let Some(coordinator) = &coordinator {
                coordinator.register(&channel.name, &dispatcher);
                dispatcher.attach_coordinator(coordinator.clone());
            }
            if let Some(watchdog) = &watchdog {
                watchdog.register(dispatcher.clone());
            }
            dispatchers.insert(channel.name.clone(), dispatcher);
        }

        info!(
            channels = dispatchers.len(),
            coordinator = coordinator.is_some(),
            watchdog = watchdog.is_some(),
            "Dispatch hub built"
        );

        Ok(DispatchHub {
            dispatchers,
            coordinator,
            watchdog,
        })
    }
}

/// Combined statistics of a hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubStats {
    pub channels: Vec<DispatcherStats>,
    pub coordinator: Option<CoordinatorStats>,
    pub watchdog: Option<WatchdogStats>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DeliveryError, from_fn};
    use std::time::Duration;

    fn ok_delivery() -> Arc<dyn DeliveryFunction> {
        from_fn(|_msg: OutboundMessage| async { Ok::<(), DeliveryError>(()) })
    }

    fn two_channels() -> DispatchConfig {
        DispatchConfig {
            channels: vec![ChannelConfig::new("alerts"), ChannelConfig::new("reports")],
            ..Default::default()
        }
    }

    #[test]
    fn test_build_wires_components() {
        let hub = DispatchHub::new(&two_channels(), ok_delivery()).unwrap();

        assert_eq!(hub.channel_names().collect::<Vec<_>>(), vec!["alerts", "reports"]);
        let coordinator = hub.coordinator().unwrap();
        assert!(coordinator.is_registered("alerts"));
        assert!(coordinator.is_registered("reports"));
        assert_eq!(coordinator.fair_share("alerts"), 0.5);
        assert_eq!(
            hub.watchdog().unwrap().channel_names(),
            vec!["alerts".to_string(), "reports".to_string()]
        );
    }

    #[test]
    fn test_optional_components_can_be_disabled() {
        let mut config = two_channels();
        config.coordinator.enabled = false;
        config.watchdog.enabled = false;

        let hub = DispatchHub::new(&config, ok_delivery()).unwrap();
        assert!(hub.coordinator().is_none());
        assert!(hub.watchdog().is_none());
        assert!(hub.check_health().is_none());

        let stats = hub.stats();
        assert_eq!(stats.channels.len(), 2);
        assert!(stats.coordinator.is_none());
    }

    #[test]
    fn test_enqueue_unknown_channel() {
        let hub = DispatchHub::new(&two_channels(), ok_delivery()).unwrap();

        assert!(hub.enqueue("alerts", OutboundMessage::new("1", "hi")).unwrap());
        let err = hub.enqueue("nope", OutboundMessage::new("1", "hi")).unwrap_err();
        assert!(matches!(err, Error::NotFound { ref id, .. } if id == "nope"));

        let err = hub.enqueue("alerts", OutboundMessage::new(" ", "hi")).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = two_channels();
        config.channels[1].name = "alerts".to_string();
        assert!(DispatchHub::new(&config, ok_delivery()).is_err());

        assert!(DispatchHub::builder(&two_channels()).build().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_started_hub_ends_background_loops() {
        let delivery = ok_delivery();
        let hub = DispatchHub::new(&two_channels(), delivery.clone()).unwrap();
        hub.start();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let alerts = Arc::downgrade(hub.dispatcher("alerts").unwrap());
        let watchdog = Arc::downgrade(hub.watchdog().unwrap());
        drop(hub);
        assert!(alerts.upgrade().is_none());
        assert!(watchdog.upgrade().is_none());

        // Each dispatch loop holds the delivery function until it exits.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(Arc::strong_count(&delivery), 1);
    }

    #[test]
    fn test_per_channel_delivery_factory() {
        let config = two_channels();
        let seen = std::sync::Mutex::new(Vec::new());
        let hub = DispatchHub::builder(&config)
            .delivery(|channel| {
                seen.lock().unwrap().push(channel.name.clone());
                ok_delivery()
            })
            .build()
            .unwrap();

        assert_eq!(hub.stats().channels.len(), 2);
        assert_eq!(*seen.lock().unwrap(), vec!["alerts", "reports"]);
    }
}
