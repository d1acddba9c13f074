//! The stream session state machine
//!
//! One implementation drives both sources:
//!
//! ```text
//! DISCONNECTED -> CONNECTING -> CONNECTED <-> DEGRADED
//!                     ^            |
//!                     |            v
//!                     +------ RECONNECTING
//! ```
//!
//! Transport failures, heartbeat timeouts and even panics inside a
//! connection cycle are ordinary transitions to RECONNECTING. Only the
//! shared cancellation token ends a session.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{
    Clock, ContractKey, InboundMessage, SessionSnapshot, SessionState, Source, Subscription,
    SubscriptionDiff, SubscriptionSet, SystemClock,
};
use futures::FutureExt;
use observability::SessionMetrics;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::BackoffSchedule;
use crate::error::{Result, SessionError};
use crate::inbound::{InboundSender, PushOutcome};
use crate::maintenance::MaintenanceWindow;
use crate::transport::{FeedTransport, Frame};

/// Per-source session settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub source: Source,
    pub account_id: String,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Silence longer than `heartbeat_interval * multiple` is a dead transport
    pub heartbeat_timeout_multiple: u32,
    pub backoff: BackoffSchedule,
    pub maintenance: Option<MaintenanceWindow>,
}

impl SessionConfig {
    pub fn new(source: Source, account_id: impl Into<String>) -> Self {
        Self {
            source,
            account_id: account_id.into(),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout_multiple: 3,
            backoff: BackoffSchedule::default(),
            maintenance: None,
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_timeout_multiple.max(1)
    }
}

enum CycleEnd {
    Shutdown,
    Lost(SessionError),
}

pub struct StreamSession<T: FeedTransport> {
    config: SessionConfig,
    account_id: Arc<str>,
    transport: T,
    inbound: InboundSender,
    subscriptions: watch::Receiver<SubscriptionSet>,
    subscribed: BTreeMap<ContractKey, Subscription>,
    status: watch::Sender<SessionSnapshot>,
    clock: Arc<dyn Clock>,
    metrics: SessionMetrics,
    reported_delivered: u64,
    reported_dropped: u64,
    cancel: CancellationToken,
}

impl<T: FeedTransport> StreamSession<T> {
    pub fn new(
        config: SessionConfig,
        transport: T,
        inbound: InboundSender,
        subscriptions: watch::Receiver<SubscriptionSet>,
        cancel: CancellationToken,
    ) -> Self {
        let (status, _) = watch::channel(SessionSnapshot::new(config.source));
        Self {
            account_id: Arc::from(config.account_id.as_str()),
            metrics: SessionMetrics::new(config.source.as_str()),
            config,
            transport,
            inbound,
            subscriptions,
            subscribed: BTreeMap::new(),
            status,
            clock: Arc::new(SystemClock),
            reported_delivered: 0,
            reported_dropped: 0,
            cancel,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn source(&self) -> Source {
        self.config.source
    }

    pub fn status(&self) -> watch::Receiver<SessionSnapshot> {
        self.status.subscribe()
    }

    /// Run until the cancellation token fires
    pub async fn run(mut self) {
        let source = self.config.source;
        info!(%source, "Session started");
        let mut attempt: u32 = 0;

        loop {
            if !self.wait_before_connect(attempt).await {
                break;
            }

            if attempt > 0 {
                self.metrics.reconnect_attempt();
            }
            self.publish(|s| {
                s.state = SessionState::Connecting;
                s.next_attempt_at = None;
            });
            debug!(%source, attempt, "Connecting");

            let cycle = AssertUnwindSafe(self.connection_cycle(&mut attempt))
                .catch_unwind()
                .await;
            let err = match cycle {
                Ok(CycleEnd::Shutdown) => break,
                Ok(CycleEnd::Lost(err)) => err,
                Err(panic) => SessionError::Panicked(panic_message(panic.as_ref())),
            };

            self.transport.close().await;
            if self.cancel.is_cancelled() {
                break;
            }

            attempt = attempt.saturating_add(1);
            warn!(%source, attempt, error = %err, "Session lost");
            let message = err.to_string();
            self.publish(|s| {
                s.state = SessionState::Reconnecting;
                s.reconnect_attempt = attempt;
                s.last_error = Some(message);
            });
        }

        self.shutdown().await;
    }

    /// Sleep out backoff and any maintenance window; `false` on cancellation
    async fn wait_before_connect(&mut self, attempt: u32) -> bool {
        if let Some(resume) = self.maintenance_resume() {
            return self.hold_until(resume).await;
        }
        if attempt == 0 {
            return true;
        }

        let delay = self.config.backoff.delay_for(attempt);
        let next = self.clock.now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        debug!(source = %self.config.source, attempt, ?delay, "Backing off");
        if !self.sleep_reconnecting(delay, next).await {
            return false;
        }

        // The backoff may have carried us into the window
        match self.maintenance_resume() {
            Some(resume) => self.hold_until(resume).await,
            None => true,
        }
    }

    fn maintenance_resume(&self) -> Option<DateTime<Utc>> {
        let window = self.config.maintenance.as_ref()?;
        let now = self.clock.now();
        window.contains(now).then(|| window.resume_instant(now))
    }

    async fn hold_until(&mut self, resume: DateTime<Utc>) -> bool {
        let delay = (resume - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
        info!(
            source = %self.config.source,
            resume_at = %resume,
            "Inside maintenance window; holding reconnects until the reset completes"
        );
        self.sleep_reconnecting(delay, resume).await
    }

    async fn sleep_reconnecting(&mut self, delay: Duration, next_at: DateTime<Utc>) -> bool {
        self.publish(|s| {
            s.state = SessionState::Reconnecting;
            s.next_attempt_at = Some(next_at);
        });
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn connection_cycle(&mut self, attempt: &mut u32) -> CycleEnd {
        let cancel = self.cancel.clone();
        let timeout = self.config.connect_timeout;

        let connected = tokio::select! {
            _ = cancel.cancelled() => return CycleEnd::Shutdown,
            result = tokio::time::timeout(timeout, self.transport.connect()) => result,
        };
        match connected {
            Err(_) => return CycleEnd::Lost(SessionError::ConnectTimeout(timeout)),
            Ok(Err(err)) => return CycleEnd::Lost(err),
            Ok(Ok(())) => {}
        }

        // Full resubscribe on every connect
        let wanted = self.subscriptions.borrow_and_update().for_source(self.config.source);
        let all: Vec<Subscription> = wanted.values().cloned().collect();
        if let Err(err) = bounded(timeout, self.transport.subscribe(&all, &[])).await {
            return CycleEnd::Lost(err);
        }
        self.subscribed = wanted;

        *attempt = 0;
        let now = self.clock.now();
        self.publish(|s| {
            s.state = SessionState::Connected;
            s.reconnect_attempt = 0;
            s.last_heartbeat_at = Some(now);
            s.next_attempt_at = None;
        });
        info!(
            source = %self.config.source,
            subscribed = self.subscribed.len(),
            "Session connected"
        );

        self.read_loop().await
    }

    async fn read_loop(&mut self) -> CycleEnd {
        let cancel = self.cancel.clone();
        let interval = self.config.heartbeat_interval;
        let dead_after = self.config.heartbeat_timeout();

        let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_activity = Instant::now();
        let mut subscriptions_open = true;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return CycleEnd::Shutdown,

                _ = heartbeat.tick() => {
                    let idle = last_activity.elapsed();
                    if idle > dead_after {
                        return CycleEnd::Lost(SessionError::HeartbeatTimeout(idle));
                    }
                    if idle > interval {
                        self.mark_degraded(idle);
                    }
                    if let Err(err) = bounded(dead_after, self.transport.send_heartbeat()).await {
                        return CycleEnd::Lost(err);
                    }
                    self.inbound.drain_overflow();
                    self.publish(|_| {});
                }

                changed = self.subscriptions.changed(), if subscriptions_open => {
                    if changed.is_err() {
                        debug!(source = %self.config.source, "Subscription source gone; keeping current set");
                        subscriptions_open = false;
                        continue;
                    }
                    if let Err(err) = self.apply_subscription_update().await {
                        return CycleEnd::Lost(err);
                    }
                }

                frame = self.transport.next_frame() => {
                    match frame {
                        Ok(frame) => {
                            last_activity = Instant::now();
                            self.on_frame(frame).await;
                        }
                        Err(err) => return CycleEnd::Lost(err),
                    }
                }
            }
        }
    }

    async fn on_frame(&mut self, frame: Frame) {
        let now = self.clock.now();
        let source = self.config.source;

        match frame {
            Frame::Data(payloads) => {
                for parsed in payloads {
                    let message = InboundMessage {
                        source,
                        account_id: Arc::clone(&self.account_id),
                        payload: parsed.payload,
                        raw: parsed.raw,
                        read_at: now,
                    };
                    match self.inbound.push(message).await {
                        PushOutcome::Delivered | PushOutcome::Queued => {}
                        PushOutcome::DroppedOldest => warn!(
                            %source,
                            dropped_total = self.inbound.dropped(),
                            "Inbound channel congested; dropped oldest message"
                        ),
                        PushOutcome::Closed => {
                            debug!(%source, "Inbound channel closed; discarding message")
                        }
                    }
                }
                self.publish(|s| {
                    s.last_message_at = Some(now);
                    if s.state == SessionState::Degraded {
                        s.state = SessionState::Connected;
                    }
                });
            }
            Frame::Heartbeat => {
                self.publish(|s| {
                    s.last_heartbeat_at = Some(now);
                    if s.state == SessionState::Degraded {
                        s.state = SessionState::Connected;
                    }
                });
            }
            Frame::Malformed(reason) => {
                self.metrics.parse_error();
                debug!(%source, %reason, "Dropping unparseable frame");
            }
        }
    }

    fn mark_degraded(&mut self, idle: Duration) {
        if self.status.borrow().state == SessionState::Connected {
            warn!(source = %self.config.source, ?idle, "No activity for more than one heartbeat interval");
            self.publish(|s| s.state = SessionState::Degraded);
        }
    }

    async fn apply_subscription_update(&mut self) -> Result<()> {
        let wanted = self.subscriptions.borrow_and_update().for_source(self.config.source);
        let diff = SubscriptionDiff::between(&self.subscribed, &wanted);
        if diff.is_empty() {
            return Ok(());
        }

        info!(
            source = %self.config.source,
            added = diff.added.len(),
            removed = diff.removed.len(),
            "Applying subscription update"
        );
        bounded(
            self.config.connect_timeout,
            self.transport.subscribe(&diff.added, &diff.removed),
        )
        .await?;
        self.subscribed = wanted;
        self.publish(|_| {});
        Ok(())
    }

    fn publish(&mut self, update: impl FnOnce(&mut SessionSnapshot)) {
        let delivered = self.inbound.delivered();
        let dropped = self.inbound.dropped();
        let subscribed = self.subscribed.len();

        self.status.send_modify(|snapshot| {
            update(snapshot);
            snapshot.messages_delivered = delivered;
            snapshot.messages_dropped = dropped;
            snapshot.subscribed_keys = subscribed;
        });

        self.metrics.messages_delivered(delivered - self.reported_delivered);
        self.metrics.messages_dropped(dropped - self.reported_dropped);
        self.reported_delivered = delivered;
        self.reported_dropped = dropped;
        self.metrics.set_state(self.status.borrow().state.as_gauge());
    }

    async fn shutdown(mut self) {
        let source = self.config.source;
        self.transport.close().await;
        self.inbound.flush().await;
        self.publish(|s| {
            s.state = SessionState::Disconnected;
            s.next_attempt_at = None;
        });
        info!(
            %source,
            delivered = self.inbound.delivered(),
            dropped = self.inbound.dropped(),
            "Session stopped"
        );
    }
}

/// Run a transport call under a deadline
async fn bounded<F>(limit: Duration, call: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or_else(|_| Err(SessionError::Transport(format!("transport call exceeded {:?}", limit))))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
