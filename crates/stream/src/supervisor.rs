//! Stream supervisor
//!
//! Owns the shared inbound channel and the subscription set, spawns one
//! independent task per source and aggregates their status.

use std::sync::Arc;
use std::time::Duration;

use common::{
    Clock, InboundMessage, SessionSnapshot, Source, SubscriptionHandle, SubscriptionSet, SupervisorStatus, SystemClock,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use crate::error::{Result, SessionError};
use crate::inbound::InboundSender;
use crate::session::{SessionConfig, StreamSession};
use crate::transport::FeedTransport;

/// Channel sizing shared by every session
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub inbound_capacity: usize,
    pub push_timeout: Duration,
    pub overflow_capacity: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            inbound_capacity: 4096,
            push_timeout: Duration::from_millis(50),
            overflow_capacity: 1024,
        }
    }
}

struct SessionHandle {
    source: Source,
    status: watch::Receiver<SessionSnapshot>,
    task: JoinHandle<()>,
}

pub struct StreamSupervisor {
    settings: SupervisorSettings,
    inbound_tx: mpsc::Sender<InboundMessage>,
    subscriptions: SubscriptionHandle,
    sessions: Vec<SessionHandle>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl StreamSupervisor {
    /// Create the supervisor and the receiving end of the inbound channel
    pub fn new(
        settings: SupervisorSettings,
        subscriptions: SubscriptionSet,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(settings.inbound_capacity.max(1));
        let subscriptions = SubscriptionHandle::new(subscriptions);

        let supervisor = Self {
            settings,
            inbound_tx,
            subscriptions,
            sessions: Vec::new(),
            clock: Arc::new(SystemClock),
            cancel,
        };
        (supervisor, inbound_rx)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Spawn a session task for `transport`
    ///
    /// A panic or error inside one session never reaches another: each runs
    /// in its own task and recovers through its own reconnect loop.
    pub fn spawn_session<T: FeedTransport>(&mut self, config: SessionConfig, transport: T) -> Result<()> {
        let source = config.source;
        if self.sessions.iter().any(|s| s.source == source) {
            return Err(SessionError::DuplicateSource(source));
        }

        let inbound = InboundSender::new(
            self.inbound_tx.clone(),
            self.settings.push_timeout,
            self.settings.overflow_capacity,
        );
        let session = StreamSession::new(
            config,
            transport,
            inbound,
            self.subscriptions.subscribe(),
            self.cancel.child_token(),
        )
        .with_clock(Arc::clone(&self.clock));

        let status = session.status();
        let task = tokio::spawn(
            session
                .run()
                .instrument(info_span!("session", source = source.as_str())),
        );

        info!(%source, "Spawned stream session");
        self.sessions.push(SessionHandle { source, status, task });
        Ok(())
    }

    /// Replace the subscription set; live sessions apply the diff
    pub fn update_subscriptions(&self, subscriptions: SubscriptionSet) {
        let entries = self.subscriptions.replace(subscriptions);
        info!(entries, "Subscription set updated");
    }

    pub fn subscriptions(&self) -> SubscriptionSet {
        self.subscriptions.current()
    }

    /// Handle for pushing subscription updates from outside the supervisor
    pub fn subscription_handle(&self) -> SubscriptionHandle {
        self.subscriptions.clone()
    }

    pub fn status_receivers(&self) -> Vec<watch::Receiver<SessionSnapshot>> {
        self.sessions.iter().map(|s| s.status.clone()).collect()
    }

    pub fn status(&self) -> SupervisorStatus {
        SupervisorStatus::from_sessions(self.sessions.iter().map(|s| s.status.borrow().clone()).collect())
    }

    /// Wait for every session to stop
    ///
    /// Sessions stop when the cancellation token passed to [`new`](Self::new)
    /// fires. Once this returns, the inbound channel closes.
    pub async fn join(self) {
        let Self {
            inbound_tx,
            sessions,
            ..
        } = self;
        drop(inbound_tx);

        for handle in sessions {
            if let Err(e) = handle.task.await {
                error!(source = %handle.source, error = %e, "Session task failed");
            }
        }
        info!("All stream sessions stopped");
    }
}
