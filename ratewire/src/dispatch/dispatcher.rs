//! Per-channel dispatch loop.
//!
//! A [`ChannelDispatcher`] owns one mailbox, one token bucket, the legacy
//! fixed-window counters, optional per-target counters and a retry backoff. Producers call
//! [`enqueue`](ChannelDispatcher::enqueue) from anywhere; a single background
//! task pulls messages out in priority order and paces delivery.
//!
//! The loop suspends when a fixed window is full, when the channel was told
//! to back off, when the mailbox is empty (woken early by `enqueue`), when a
//! backoff delay is owed and after every attempt. All of these wait on the
//! cancellation token, so `stop()` returns within one iteration. A delivery
//! already in flight is allowed to finish.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::delivery::{DeliveryError, DeliveryFunction, deliver_guarded};
use super::mailbox::{Admission, PriorityMailbox};
use crate::clock::{SharedClock, SystemClock};
use crate::config::ChannelConfig;
use crate::coordinator::GlobalCoordinator;
use crate::domain::{MessagePriority, OutboundMessage};
use crate::limiter::{FixedWindowLimiter, RateBudget, RetryBackoff, TargetWindowLimiter};

/// Pause while a fixed window is at its cap.
const WINDOW_RECHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Floor for token waits so a rounding-to-zero wait cannot spin.
const MIN_TOKEN_WAIT: Duration = Duration::from_millis(1);

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    queued: AtomicU64,
    dropped: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    rate_limited: AtomicU64,
    coordinator_throttled: AtomicU64,
    target_limited: AtomicU64,
    throttled: AtomicU64,
    discarded: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispatcherTotals {
        DispatcherTotals {
            total_sent: self.sent.load(Ordering::Relaxed),
            total_queued: self.queued.load(Ordering::Relaxed),
            total_dropped: self.dropped.load(Ordering::Relaxed),
            total_retried: self.retried.load(Ordering::Relaxed),
            total_failed: self.failed.load(Ordering::Relaxed),
            total_rate_limited: self.rate_limited.load(Ordering::Relaxed),
            total_coordinator_throttled: self.coordinator_throttled.load(Ordering::Relaxed),
            total_target_limited: self.target_limited.load(Ordering::Relaxed),
            total_throttled: self.throttled.load(Ordering::Relaxed),
            total_discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// State shared between the handle and the loop task.
struct DispatcherState {
    name: String,
    config: ChannelConfig,
    mailbox: Mutex<PriorityMailbox>,
    budget: Mutex<RateBudget>,
    windows: Mutex<FixedWindowLimiter>,
    targets: Option<Mutex<TargetWindowLimiter>>,
    backoff: Mutex<RetryBackoff>,
    /// Set when the channel answered with a retry-after.
    throttled_until: Mutex<Option<Instant>>,
    counters: Counters,
    delivery: Arc<dyn DeliveryFunction>,
    coordinator: RwLock<Option<Arc<GlobalCoordinator>>>,
    clock: SharedClock,
    wakeup: Notify,
}

struct LoopHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

/// Rate-limited, priority-ordered sender for one channel.
pub struct ChannelDispatcher {
    state: Arc<DispatcherState>,
    task: Mutex<Option<LoopHandle>>,
}

impl std::fmt::Debug for ChannelDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelDispatcher")
            .field("name", &self.state.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl ChannelDispatcher {
    /// Create a stopped dispatcher using the system clock.
    ///
    /// `config` is expected to have passed [`ChannelConfig::validate`].
    pub fn new(config: ChannelConfig, delivery: Arc<dyn DeliveryFunction>) -> Self {
        Self::with_clock(config, delivery, SystemClock::shared())
    }

    pub fn with_clock(
        config: ChannelConfig,
        delivery: Arc<dyn DeliveryFunction>,
        clock: SharedClock,
    ) -> Self {
        let mailbox = PriorityMailbox::new(config.max_queue_size, config.overflow())
            .with_starvation_threshold(config.starvation_threshold);
        let budget = RateBudget::new(
            config.token_capacity(),
            config.token_refill_per_second(),
            clock.clone(),
        );
        let windows = FixedWindowLimiter::new(config.max_per_second, config.max_per_minute);
        let targets = config
            .max_per_target_per_minute
            .map(|cap| Mutex::new(TargetWindowLimiter::new(cap)));
        let backoff = RetryBackoff::new(
            config.base_delay(),
            config.max_delay(),
            config.backoff_multiplier,
            config.jitter_fraction,
        );

        Self {
            state: Arc::new(DispatcherState {
                name: config.name.clone(),
                config,
                mailbox: Mutex::new(mailbox),
                budget: Mutex::new(budget),
                windows: Mutex::new(windows),
                targets,
                backoff: Mutex::new(backoff),
                throttled_until: Mutex::new(None),
                counters: Counters::default(),
                delivery,
                coordinator: RwLock::new(None),
                clock,
                wakeup: Notify::new(),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.state.config
    }

    /// Ask `coordinator` for permission before every attempt.
    pub fn attach_coordinator(&self, coordinator: Arc<GlobalCoordinator>) {
        *self.state.coordinator.write() = Some(coordinator);
    }

    /// Queue a message. Never blocks.
    ///
    /// Works whether or not the loop is running. Returns `false` when the
    /// message was dropped for lack of space.
    pub fn enqueue(&self, message: OutboundMessage) -> bool {
        let priority = message.priority;
        let admission = self.state.mailbox.lock().admit(message);

        let accepted = match admission {
            Admission::Accepted | Admission::AcceptedOverCapacity => true,
            Admission::AcceptedEvicting(evicted) => {
                Counters::bump(&self.state.counters.dropped);
                warn!(
                    channel = %self.state.name,
                    evicted_priority = %evicted.priority,
                    evicted_target = %evicted.target,
                    "Mailbox full, evicted oldest lower-priority message"
                );
                true
            }
            Admission::Rejected(rejected) => {
                Counters::bump(&self.state.counters.dropped);
                warn!(
                    channel = %self.state.name,
                    priority = %rejected.priority,
                    target = %rejected.target,
                    "Mailbox full, message dropped"
                );
                false
            }
        };

        if accepted {
            Counters::bump(&self.state.counters.queued);
            trace!(channel = %self.state.name, priority = %priority, "Message queued");
            self.state.wakeup.notify_one();
        }
        accepted
    }

    /// Spawn the dispatch loop. Must be called within a Tokio runtime.
    ///
    /// Returns `false` if the loop was already running.
    pub fn start(&self) -> bool {
        let mut task = self.task.lock();
        if task.is_some() {
            debug!(channel = %self.state.name, "Dispatcher already running");
            return false;
        }

        let token = CancellationToken::new();
        let join = tokio::spawn(run_loop(self.state.clone(), token.clone()));
        *task = Some(LoopHandle { token, join });

        info!(
            channel = %self.state.name,
            max_per_second = self.state.config.max_per_second,
            max_per_minute = self.state.config.max_per_minute,
            max_queue_size = self.state.config.max_queue_size,
            "Dispatcher started"
        );
        true
    }

    /// Stop the loop and discard whatever is still queued.
    ///
    /// Waits for an in-flight delivery to finish. No-op when not running.
    pub async fn stop(&self) {
        let Some(handle) = self.task.lock().take() else {
            return;
        };

        handle.token.cancel();
        if let Err(e) = handle.join.await {
            warn!(channel = %self.state.name, error = %e, "Dispatch loop ended abnormally");
        }

        let discarded = self.clear_queues();
        info!(channel = %self.state.name, discarded, "Dispatcher stopped");
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Drop every queued message. Returns how many were discarded.
    pub fn clear_queues(&self) -> usize {
        let discarded = self.state.mailbox.lock().clear();
        if discarded > 0 {
            self.state
                .counters
                .discarded
                .fetch_add(discarded as u64, Ordering::Relaxed);
            debug!(channel = %self.state.name, discarded, "Queues cleared");
        }
        discarded
    }

    pub fn queue_size(&self) -> usize {
        self.state.mailbox.lock().size()
    }

    pub fn queue_capacity(&self) -> usize {
        self.state.mailbox.lock().capacity()
    }

    pub fn available_tokens(&self) -> f64 {
        self.state.budget.lock().available_now()
    }

    pub fn totals(&self) -> DispatcherTotals {
        self.state.counters.snapshot()
    }

    pub fn stats(&self) -> DispatcherStats {
        let queued = {
            let mailbox = self.state.mailbox.lock();
            QueueDepths {
                critical: mailbox.len_of(MessagePriority::Critical),
                high: mailbox.len_of(MessagePriority::High),
                normal: mailbox.len_of(MessagePriority::Normal),
                low: mailbox.len_of(MessagePriority::Low),
                total: mailbox.size(),
            }
        };
        let now = self.state.clock.now();
        let (sent_last_second, sent_last_minute) = self.state.windows.lock().counts(now);
        let throttled_for_ms = (*self.state.throttled_until.lock())
            .map(|until| until.saturating_duration_since(now).as_millis() as u64)
            .filter(|ms| *ms > 0);
        let config = &self.state.config;

        DispatcherStats {
            name: self.state.name.clone(),
            running: self.is_running(),
            queued,
            totals: self.totals(),
            limits: DispatcherLimits {
                max_per_second: config.max_per_second,
                max_per_minute: config.max_per_minute,
                max_per_target_per_minute: config.max_per_target_per_minute,
                max_queue_size: config.max_queue_size,
                max_overflow: config.overflow(),
                max_attempts: config.max_attempts,
                token_capacity: config.token_capacity(),
                token_refill_per_second: config.token_refill_per_second(),
            },
            available_tokens: self.available_tokens(),
            sent_last_second,
            sent_last_minute,
            backoff_attempt: self.state.backoff.lock().attempt(),
            throttled_for_ms,
        }
    }
}

impl Drop for ChannelDispatcher {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.token.cancel();
        }
    }
}

/// Sleep unless cancelled first. Returns `false` on cancellation.
async fn pause(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

async fn run_loop(state: Arc<DispatcherState>, token: CancellationToken) {
    debug!(channel = %state.name, "Dispatch loop started");

    while !token.is_cancelled() {
        let now = state.clock.now();

        if state.windows.lock().is_blocked(now) {
            Counters::bump(&state.counters.rate_limited);
            trace!(channel = %state.name, "Fixed window full");
            if !pause(&token, WINDOW_RECHECK_INTERVAL).await {
                break;
            }
            continue;
        }

        let hold = state.throttled_remaining(now);
        if !hold.is_zero() {
            if !pause(&token, hold).await {
                break;
            }
            continue;
        }

        if state.mailbox.lock().is_empty() {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = state.wakeup.notified() => {}
                _ = tokio::time::sleep(state.config.idle_poll_interval()) => {}
            }
            continue;
        }

        // Only this loop consumes tokens, so a permit seen here is still
        // there once the global budget has granted the send.
        let token_wait = state.budget.lock().wait_time(1.0);
        if !token_wait.is_zero() {
            let wait = token_wait.max(MIN_TOKEN_WAIT);
            trace!(channel = %state.name, wait_ms = wait.as_millis() as u64, "Waiting for token");
            if !pause(&token, wait).await {
                break;
            }
            continue;
        }

        let Some(message) = state.mailbox.lock().take_next() else {
            continue;
        };

        let target_wait = state.target_wait(&message.target, now);
        if !target_wait.is_zero() {
            Counters::bump(&state.counters.target_limited);
            trace!(
                channel = %state.name,
                target = %message.target,
                wait_ms = target_wait.as_millis() as u64,
                "Target cap reached"
            );
            state.return_unattempted(message);
            if !pause(&token, target_wait.min(WINDOW_RECHECK_INTERVAL)).await {
                break;
            }
            continue;
        }

        let coordinator = state.coordinator.read().clone();
        if let Some(coordinator) = coordinator
            && !coordinator.request_permission(&state.name)
        {
            Counters::bump(&state.counters.coordinator_throttled);
            debug!(channel = %state.name, "Global budget denied send");
            state.on_failure(message, None);
        } else {
            state.budget.lock().consume(1.0);

            let owed = {
                let backoff = state.backoff.lock();
                (backoff.attempt() > 0).then(|| backoff.next_delay())
            };
            if let Some(delay) = owed
                && !delay.is_zero()
            {
                debug!(
                    channel = %state.name,
                    delay_ms = delay.as_millis() as u64,
                    "Backing off before next attempt"
                );
                if !pause(&token, delay).await {
                    state.return_unattempted(message);
                    break;
                }
            }

            match deliver_guarded(state.delivery.as_ref(), &message).await {
                Ok(()) => state.on_success(&message),
                Err(e) => state.on_failure(message, Some(e)),
            }
        }

        if !pause(&token, state.config.pacing_interval()).await {
            break;
        }
    }

    debug!(channel = %state.name, "Dispatch loop exited");
}

impl DispatcherState {
    fn throttled_remaining(&self, now: Instant) -> Duration {
        let mut throttled_until = self.throttled_until.lock();
        match *throttled_until {
            Some(until) if until > now => until - now,
            Some(_) => {
                *throttled_until = None;
                Duration::ZERO
            }
            None => Duration::ZERO,
        }
    }

    fn target_wait(&self, target: &str, now: Instant) -> Duration {
        self.targets
            .as_ref()
            .map_or(Duration::ZERO, |targets| targets.lock().wait_time(target, now))
    }

    fn on_success(&self, message: &OutboundMessage) {
        let now = self.clock.now();
        self.windows.lock().record(now);
        if let Some(targets) = &self.targets {
            targets.lock().record(&message.target, now);
        }
        self.backoff.lock().record_success();
        Counters::bump(&self.counters.sent);
        debug!(
            channel = %self.name,
            priority = %message.priority,
            target = %message.target,
            attempt = message.attempt_count + 1,
            "Message delivered"
        );
    }

    /// Account a failed attempt. `error` is `None` for a coordinator denial.
    fn on_failure(&self, mut message: OutboundMessage, error: Option<DeliveryError>) {
        message.attempt_count += 1;

        if let Some(DeliveryError::RateLimited { retry_after }) = &error {
            *self.throttled_until.lock() = Some(self.clock.now() + *retry_after);
            Counters::bump(&self.counters.throttled);
            warn!(
                channel = %self.name,
                retry_after_ms = retry_after.as_millis() as u64,
                "Channel throttled by remote"
            );
        }

        if let Some(DeliveryError::Rejected(reason)) = &error {
            Counters::bump(&self.counters.failed);
            error!(
                channel = %self.name,
                priority = %message.priority,
                target = %message.target,
                error = %reason,
                "Delivery rejected, not retrying: {}",
                message.preview()
            );
            return;
        }

        let reason = error
            .as_ref()
            .map_or_else(|| "global budget exhausted".to_string(), |e| e.to_string());
        let limit = message.attempt_limit(self.config.max_attempts);

        if !message.has_attempts_left(self.config.max_attempts) {
            Counters::bump(&self.counters.failed);
            error!(
                channel = %self.name,
                priority = %message.priority,
                target = %message.target,
                attempts = message.attempt_count,
                error = %reason,
                "Delivery failed, giving up: {}",
                message.preview()
            );
            return;
        }

        let attempt = message.attempt_count;
        match self.mailbox.lock().requeue(message) {
            Admission::Accepted | Admission::AcceptedOverCapacity => {}
            Admission::AcceptedEvicting(evicted) => {
                Counters::bump(&self.counters.dropped);
                warn!(
                    channel = %self.name,
                    evicted_priority = %evicted.priority,
                    "Mailbox full on retry, evicted a message"
                );
            }
            Admission::Rejected(rejected) => {
                Counters::bump(&self.counters.failed);
                error!(
                    channel = %self.name,
                    priority = %rejected.priority,
                    target = %rejected.target,
                    "No room to retry, message dropped"
                );
                return;
            }
        }

        self.backoff.lock().record_failure();
        Counters::bump(&self.counters.retried);
        warn!(
            channel = %self.name,
            attempt,
            max_attempts = limit,
            error = %reason,
            "Delivery failed, will retry"
        );
    }

    /// Put back a message that was taken but never attempted.
    fn return_unattempted(&self, message: OutboundMessage) {
        match self.mailbox.lock().requeue(message) {
            Admission::Accepted | Admission::AcceptedOverCapacity => {}
            Admission::AcceptedEvicting(_) | Admission::Rejected(_) => {
                Counters::bump(&self.counters.dropped);
            }
        }
    }
}

/// Cumulative counters of one dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherTotals {
    /// Delivered successfully.
    pub total_sent: u64,
    /// Admitted by `enqueue`.
    pub total_queued: u64,
    /// Rejected or evicted for space.
    pub total_dropped: u64,
    /// Failed attempts that were requeued.
    pub total_retried: u64,
    /// Dropped after exhausting attempts or a permanent rejection.
    pub total_failed: u64,
    /// Loop iterations held back by a full fixed window.
    pub total_rate_limited: u64,
    /// Sends denied by the global coordinator.
    pub total_coordinator_throttled: u64,
    /// Loop iterations held back by a per-target cap.
    pub total_target_limited: u64,
    /// Retry-after answers from the channel.
    pub total_throttled: u64,
    /// Discarded by `clear_queues` or `stop`.
    pub total_discarded: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepths {
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherLimits {
    pub max_per_second: u32,
    pub max_per_minute: u32,
    pub max_per_target_per_minute: Option<u32>,
    pub max_queue_size: usize,
    pub max_overflow: usize,
    pub max_attempts: u32,
    pub token_capacity: f64,
    pub token_refill_per_second: f64,
}

/// Point-in-time view of a dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherStats {
    pub name: String,
    pub running: bool,
    pub queued: QueueDepths,
    pub totals: DispatcherTotals,
    pub limits: DispatcherLimits,
    pub available_tokens: f64,
    pub sent_last_second: usize,
    pub sent_last_minute: usize,
    pub backoff_attempt: u32,
    /// Remaining hold from a retry-after, if any.
    pub throttled_for_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::dispatch::delivery::from_fn;

    type Log = Arc<Mutex<Vec<(String, tokio::time::Instant)>>>;

    fn recording_delivery(fail_bodies: &'static [&'static str]) -> (Arc<dyn DeliveryFunction>, Log) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let delivery = from_fn(move |msg: OutboundMessage| {
            let sink = sink.clone();
            async move {
                sink.lock().push((msg.body.clone(), tokio::time::Instant::now()));
                if fail_bodies.iter().any(|body| *body == msg.body) {
                    Err(DeliveryError::Transport("connection reset".to_string()))
                } else {
                    Ok(())
                }
            }
        });
        (delivery, log)
    }

    fn fast_config(name: &str) -> ChannelConfig {
        ChannelConfig {
            base_delay_ms: 10,
            max_delay_ms: 100,
            jitter_fraction: 0.0,
            ..ChannelConfig::new(name)
        }
    }

    fn critical(body: &str) -> OutboundMessage {
        OutboundMessage::new("chat", body).with_priority(MessagePriority::Critical)
    }

    #[tokio::test(start_paused = true)]
    async fn test_paces_to_one_per_second() {
        let (delivery, log) = recording_delivery(&[]);
        let config = ChannelConfig {
            max_per_second: 1,
            max_queue_size: 10,
            ..fast_config("pager")
        };
        let dispatcher = ChannelDispatcher::new(config, delivery);

        for i in 0..5 {
            assert!(dispatcher.enqueue(critical(&format!("m{}", i))));
        }
        dispatcher.start();
        tokio::time::sleep(Duration::from_secs(10)).await;

        let totals = dispatcher.totals();
        assert_eq!(totals.total_sent, 5);
        assert_eq!(totals.total_dropped, 0);

        let log = log.lock();
        let bodies: Vec<_> = log.iter().map(|(b, _)| b.as_str()).collect();
        assert_eq!(bodies, vec!["m0", "m1", "m2", "m3", "m4"]);
        for pair in log.windows(2) {
            let gap = pair[1].1 - pair[0].1;
            assert!(gap >= Duration::from_millis(950), "gap too small: {:?}", gap);
        }
        drop(log);

        dispatcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_message_retried_before_later_arrivals() {
        let (delivery, log) = recording_delivery(&["A"]);
        let dispatcher = ChannelDispatcher::new(fast_config("ops"), delivery);

        dispatcher.enqueue(OutboundMessage::new("chat", "A"));
        dispatcher.enqueue(OutboundMessage::new("chat", "B"));
        dispatcher.start();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let bodies: Vec<_> = log.lock().iter().map(|(b, _)| b.clone()).collect();
        assert_eq!(bodies, vec!["A", "A", "A", "B"]);

        let totals = dispatcher.totals();
        assert_eq!(totals.total_failed, 1);
        assert_eq!(totals.total_retried, 2);
        assert_eq!(totals.total_sent, 1);
        assert_eq!(dispatcher.stats().backoff_attempt, 0);

        dispatcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent_and_stop_before_start_is_noop() {
        let (delivery, _log) = recording_delivery(&[]);
        let dispatcher = ChannelDispatcher::new(fast_config("idem"), delivery);

        dispatcher.stop().await;
        assert!(!dispatcher.is_running());

        assert!(dispatcher.start());
        assert!(!dispatcher.start());
        assert!(dispatcher.is_running());

        dispatcher.stop().await;
        assert!(!dispatcher.is_running());
        dispatcher.stop().await;

        assert!(dispatcher.start());
        dispatcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_discards_queued_messages() {
        let (delivery, _log) = recording_delivery(&[]);
        let config = ChannelConfig {
            max_per_second: 1,
            max_per_minute: 1,
            ..fast_config("slow")
        };
        let dispatcher = ChannelDispatcher::new(config, delivery);

        for i in 0..4 {
            dispatcher.enqueue(OutboundMessage::new("chat", format!("m{}", i)));
        }
        dispatcher.start();
        tokio::time::sleep(Duration::from_millis(500)).await;
        dispatcher.stop().await;

        let stats = dispatcher.stats();
        assert_eq!(stats.totals.total_sent, 1);
        assert_eq!(stats.totals.total_discarded, 3);
        assert_eq!(stats.queued.total, 0);
        assert!(!stats.running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_holds_channel() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let delivery = from_fn(move |_msg: OutboundMessage| {
            let sink = sink.clone();
            async move {
                let mut calls = sink.lock();
                calls.push(tokio::time::Instant::now());
                if calls.len() == 1 {
                    Err(DeliveryError::RateLimited {
                        retry_after: Duration::from_secs(5),
                    })
                } else {
                    Ok(())
                }
            }
        });
        let dispatcher = ChannelDispatcher::new(fast_config("throttled"), delivery);

        dispatcher.enqueue(OutboundMessage::new("chat", "hello"));
        dispatcher.start();
        tokio::time::sleep(Duration::from_secs(10)).await;

        let calls = calls.lock().clone();
        assert_eq!(calls.len(), 2);
        assert!(calls[1] - calls[0] >= Duration::from_secs(5));

        let totals = dispatcher.totals();
        assert_eq!(totals.total_throttled, 1);
        assert_eq!(totals.total_retried, 1);
        assert_eq!(totals.total_sent, 1);

        dispatcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_delivery_counts_as_failure() {
        async fn explode(_msg: OutboundMessage) -> Result<(), DeliveryError> {
            panic!("boom")
        }
        let config = ChannelConfig {
            max_attempts: 2,
            ..fast_config("fragile")
        };
        let dispatcher = ChannelDispatcher::new(config, from_fn(explode));

        dispatcher.enqueue(OutboundMessage::new("chat", "x"));
        dispatcher.start();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let totals = dispatcher.totals();
        assert_eq!(totals.total_retried, 1);
        assert_eq!(totals.total_failed, 1);
        assert!(dispatcher.is_running());

        dispatcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_coordinator_denial_is_a_failed_attempt() {
        let (delivery, log) = recording_delivery(&[]);
        let config = ChannelConfig {
            max_attempts: 1,
            token_capacity: Some(5.0),
            token_refill_per_second: Some(0.01),
            ..fast_config("denied")
        };
        let dispatcher = Arc::new(ChannelDispatcher::new(config, delivery));

        let coordinator = Arc::new(GlobalCoordinator::new(CoordinatorConfig {
            global_messages_per_second: 1.0,
            ..Default::default()
        }));
        coordinator.register("denied", &dispatcher);
        dispatcher.attach_coordinator(coordinator.clone());

        dispatcher.enqueue(OutboundMessage::new("chat", "first"));
        dispatcher.enqueue(OutboundMessage::new("chat", "second"));
        dispatcher.start();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let totals = dispatcher.totals();
        assert_eq!(totals.total_sent, 1);
        assert_eq!(totals.total_coordinator_throttled, 1);
        assert_eq!(totals.total_failed, 1);
        assert_eq!(log.lock().len(), 1);
        // Only the granted send spent a channel token.
        let tokens = dispatcher.available_tokens();
        assert!((4.0..4.1).contains(&tokens), "tokens left: {}", tokens);

        dispatcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_one_token_rate_still_delivers() {
        let (delivery, log) = recording_delivery(&[]);
        let config = ChannelConfig {
            token_capacity: Some(0.5),
            token_refill_per_second: Some(0.5),
            ..fast_config("trickle")
        };
        let dispatcher = ChannelDispatcher::new(config, delivery);

        dispatcher.enqueue(OutboundMessage::new("chat", "first"));
        dispatcher.enqueue(OutboundMessage::new("chat", "second"));
        dispatcher.start();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(dispatcher.totals().total_sent, 2);
        let log = log.lock();
        assert!(log[1].1 - log[0].1 >= Duration::from_millis(1950));
        drop(log);

        dispatcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_delivery_is_not_retried() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let delivery = from_fn(move |msg: OutboundMessage| {
            let sink = sink.clone();
            async move {
                sink.lock().push(msg.body.clone());
                if msg.body == "blocked" {
                    Err(DeliveryError::Rejected("forbidden".to_string()))
                } else {
                    Ok(())
                }
            }
        });
        let dispatcher = ChannelDispatcher::new(fast_config("strict"), delivery);

        dispatcher.enqueue(OutboundMessage::new("chat", "blocked"));
        dispatcher.enqueue(OutboundMessage::new("chat", "fine"));
        dispatcher.start();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(*calls.lock(), vec!["blocked", "fine"]);
        let stats = dispatcher.stats();
        assert_eq!(stats.totals.total_failed, 1);
        assert_eq!(stats.totals.total_retried, 0);
        assert_eq!(stats.totals.total_sent, 1);
        assert_eq!(stats.backoff_attempt, 0);

        dispatcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_target_cap_spaces_sends_to_one_target() {
        let (delivery, log) = recording_delivery(&[]);
        let config = ChannelConfig {
            max_per_target_per_minute: Some(1),
            ..fast_config("per-target")
        };
        let dispatcher = ChannelDispatcher::new(config, delivery);

        dispatcher.enqueue(OutboundMessage::new("alice", "a1"));
        dispatcher.enqueue(OutboundMessage::new("alice", "a2"));
        dispatcher.start();

        tokio::time::sleep(Duration::from_secs(1)).await;
        let stats = dispatcher.stats();
        assert_eq!(stats.totals.total_sent, 1);
        assert_eq!(stats.queued.total, 1);
        assert!(stats.totals.total_target_limited > 0);

        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(dispatcher.totals().total_sent, 2);
        let log = log.lock();
        assert!(log[1].1 - log[0].1 >= Duration::from_secs(60));
        drop(log);

        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_enqueue_before_start_and_stats_shape() {
        let (delivery, _log) = recording_delivery(&[]);
        let config = ChannelConfig {
            max_queue_size: 2,
            max_overflow: Some(0),
            ..fast_config("stats")
        };
        let dispatcher = ChannelDispatcher::new(config, delivery);

        let low = |body: &str| OutboundMessage::new("c", body).with_priority(MessagePriority::Low);
        assert!(dispatcher.enqueue(low("1")));
        assert!(dispatcher.enqueue(low("2")));
        // Each of these evicts the oldest low message.
        assert!(dispatcher.enqueue(OutboundMessage::new("c", "3").with_priority(MessagePriority::High)));
        assert!(dispatcher.enqueue(OutboundMessage::new("c", "4")));
        // Full of higher traffic: a low newcomer is rejected.
        assert!(!dispatcher.enqueue(low("5")));

        let stats = dispatcher.stats();
        assert!(!stats.running);
        assert_eq!(stats.queued.low, 0);
        assert_eq!(stats.queued.high, 1);
        assert_eq!(stats.queued.normal, 1);
        assert_eq!(stats.queued.total, 2);
        assert_eq!(stats.totals.total_queued, 4);
        assert_eq!(stats.totals.total_dropped, 3);
        assert_eq!(stats.limits.max_queue_size, 2);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["queued"]["total"], 2);
        assert_eq!(json["totals"]["total_dropped"], 3);

        assert_eq!(dispatcher.clear_queues(), 2);
        assert_eq!(dispatcher.totals().total_discarded, 2);
    }
}
