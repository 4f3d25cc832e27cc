//! `ratewire [config.json]`
//!
//! Reads `channel priority target body...` lines from stdin, dispatches them
//! through a hub whose delivery sink only logs, and prints the hub
//! statistics as JSON once stdin is exhausted and the queues have drained.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use ratewire::config::{ChannelConfig, DispatchConfig};
use ratewire::dispatch::{DeliveryError, DeliveryFunction};
use ratewire::domain::{MessagePriority, OutboundMessage};
use ratewire::health::{AlertCallback, HealthLevel, HealthReport};
use ratewire::hub::DispatchHub;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Delivery sink that logs each message instead of sending it.
struct LogSink {
    channel: String,
}

#[async_trait]
impl DeliveryFunction for LogSink {
    async fn deliver(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        info!(
            channel = %self.channel,
            priority = %message.priority,
            target = %message.target,
            attempt = message.attempt_count + 1,
            "deliver: {}",
            message.body
        );
        Ok(())
    }
}

struct LogAlerts;

#[async_trait]
impl AlertCallback for LogAlerts {
    async fn on_alert(&self, level: HealthLevel, report: &HealthReport) -> ratewire::Result<()> {
        for alert in &report.alerts {
            warn!(level = %level, "{}", alert);
        }
        Ok(())
    }
}

/// Split `channel priority target body...`.
fn parse_line(line: &str) -> Option<(&str, MessagePriority, &str, &str)> {
    let mut parts = line.trim().splitn(4, char::is_whitespace);
    let channel = parts.next().filter(|s| !s.is_empty())?;
    let priority = MessagePriority::parse(parts.next()?)?;
    let target = parts.next().filter(|s| !s.is_empty())?;
    let body = parts.next().map(str::trim).unwrap_or_default();
    Some((channel, priority, target, body))
}

fn load_config() -> anyhow::Result<DispatchConfig> {
    match std::env::args().nth(1) {
        Some(path) => DispatchConfig::load(&path)
            .with_context(|| format!("failed to load configuration from {}", path)),
        None => {
            let mut config = DispatchConfig {
                channels: vec![ChannelConfig::new("default")],
                ..Default::default()
            };
            config.apply_env_overrides()?;
            config.validate()?;
            Ok(config)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = load_config()?;
    let _log_guard = ratewire::logging::init_logging(&config.logging)?;

    let hub = DispatchHub::builder(&config)
        .delivery(|channel| {
            Arc::new(LogSink {
                channel: channel.name.clone(),
            }) as Arc<dyn DeliveryFunction>
        })
        .alert_callback(Arc::new(LogAlerts))
        .build()?;
    hub.start();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping");
                None
            }
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }

        let Some((channel, priority, target, body)) = parse_line(&line) else {
            warn!(line = %line, "Expected: channel priority target body...");
            continue;
        };
        let message = OutboundMessage::new(target, body).with_priority(priority);
        match hub.enqueue(channel, message) {
            Ok(true) => {}
            Ok(false) => warn!(channel = %channel, "Message dropped, queue full"),
            Err(e) => error!(error = %e, "Cannot enqueue"),
        }
    }

    // Let the queues drain before stopping.
    loop {
        let pending: usize = hub
            .channel_names()
            .filter_map(|name| hub.dispatcher(name))
            .map(|d| d.queue_size())
            .sum();
        if pending == 0 {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(DRAIN_POLL_INTERVAL) => {}
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    hub.stop().await;
    println!("{}", serde_json::to_string_pretty(&hub.stats())?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        assert_eq!(
            parse_line("alerts critical 42 disk almost full"),
            Some(("alerts", MessagePriority::Critical, "42", "disk almost full"))
        );
        assert_eq!(
            parse_line("  reports LOW 7  "),
            Some(("reports", MessagePriority::Low, "7", ""))
        );
        assert_eq!(parse_line("alerts urgent 42 hi"), None);
        assert_eq!(parse_line("alerts"), None);
    }
}
