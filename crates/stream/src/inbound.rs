//! Backpressure-aware handoff to the shared inbound channel
//!
//! A session's read loop must never stall on a congested consumer. Each push
//! waits at most `push_timeout`; a message that misses it parks in a
//! session-owned overflow queue which is drained ahead of newer messages.
//! When that queue is full the oldest parked message is dropped.

use std::collections::VecDeque;
use std::time::Duration;

use common::InboundMessage;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};
use tracing::warn;

/// What happened to a pushed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Handed to the channel
    Delivered,
    /// Parked in the overflow queue
    Queued,
    /// Parked, and the oldest parked message was dropped to make room
    DroppedOldest,
    /// The consumer is gone
    Closed,
}

pub struct InboundSender {
    tx: mpsc::Sender<InboundMessage>,
    overflow: VecDeque<InboundMessage>,
    overflow_capacity: usize,
    push_timeout: Duration,
    delivered: u64,
    dropped: u64,
}

impl InboundSender {
    pub fn new(
        tx: mpsc::Sender<InboundMessage>,
        push_timeout: Duration,
        overflow_capacity: usize,
    ) -> Self {
        Self {
            tx,
            overflow: VecDeque::new(),
            overflow_capacity: overflow_capacity.max(1),
            push_timeout,
            delivered: 0,
            dropped: 0,
        }
    }

    pub async fn push(&mut self, message: InboundMessage) -> PushOutcome {
        if self.drain_overflow().is_none() {
            return PushOutcome::Closed;
        }

        if !self.overflow.is_empty() {
            // Keep arrival order: newer messages queue behind parked ones
            return self.park(message);
        }

        match self.tx.send_timeout(message, self.push_timeout).await {
            Ok(()) => {
                self.delivered += 1;
                PushOutcome::Delivered
            }
            Err(SendTimeoutError::Timeout(message)) => self.park(message),
            Err(SendTimeoutError::Closed(_)) => PushOutcome::Closed,
        }
    }

    /// Move parked messages into the channel without waiting
    ///
    /// Returns the number moved, or `None` if the consumer is gone.
    pub fn drain_overflow(&mut self) -> Option<usize> {
        let mut moved = 0;
        while let Some(message) = self.overflow.pop_front() {
            match self.tx.try_send(message) {
                Ok(()) => {
                    self.delivered += 1;
                    moved += 1;
                }
                Err(TrySendError::Full(message)) => {
                    self.overflow.push_front(message);
                    break;
                }
                Err(TrySendError::Closed(_)) => return None,
            }
        }
        Some(moved)
    }

    /// Deliver what is parked, waiting up to `push_timeout` per message
    ///
    /// Used on clean shutdown. Messages that still cannot be delivered are
    /// counted as dropped.
    pub async fn flush(&mut self) -> usize {
        let mut lost = 0;
        while let Some(message) = self.overflow.pop_front() {
            match self.tx.send_timeout(message, self.push_timeout).await {
                Ok(()) => self.delivered += 1,
                Err(_) => {
                    lost = self.overflow.len() + 1;
                    self.overflow.clear();
                    break;
                }
            }
        }
        if lost > 0 {
            self.dropped += lost as u64;
            warn!(lost, "Inbound channel unavailable during shutdown; parked messages dropped");
        }
        lost
    }

    fn park(&mut self, message: InboundMessage) -> PushOutcome {
        let mut outcome = PushOutcome::Queued;
        if self.overflow.len() >= self.overflow_capacity {
            self.overflow.pop_front();
            self.dropped += 1;
            outcome = PushOutcome::DroppedOldest;
        }
        self.overflow.push_back(message);
        outcome
    }

    pub fn parked(&self) -> usize {
        self.overflow.len()
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::{DxGreeksEvent, RawPayload, Source};
    use std::sync::Arc;

    fn message(symbol: &str) -> InboundMessage {
        let event = DxGreeksEvent {
            event_type: "Greeks".to_string(),
            event_symbol: symbol.to_string(),
            event_time: None,
            time: None,
            price: None,
            volatility: None,
            delta: Some(0.5),
            gamma: None,
            theta: None,
            rho: None,
            vega: None,
        };
        InboundMessage {
            source: Source::Tastytrade,
            account_id: Arc::from("acct"),
            payload: RawPayload::Tastytrade(event),
            raw: "{}".to_string(),
            read_at: Utc::now(),
        }
    }

    fn symbol_of(message: &InboundMessage) -> String {
        match &message.payload {
            RawPayload::Tastytrade(event) => event.event_symbol.clone(),
            RawPayload::Ibkr(_) => String::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_channel_parks_then_drops_oldest() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut sender = InboundSender::new(tx, Duration::from_millis(50), 2);

        assert_eq!(sender.push(message("a")).await, PushOutcome::Delivered);
        assert_eq!(sender.push(message("b")).await, PushOutcome::Queued);
        assert_eq!(sender.push(message("c")).await, PushOutcome::Queued);
        assert_eq!(sender.push(message("d")).await, PushOutcome::DroppedOldest);
        assert_eq!(sender.dropped(), 1);
        assert_eq!(sender.parked(), 2);

        assert_eq!(symbol_of(&rx.recv().await.unwrap()), "a");

        // Parked messages go out ahead of the new one, oldest first
        assert_eq!(sender.push(message("e")).await, PushOutcome::Queued);
        assert_eq!(symbol_of(&rx.recv().await.unwrap()), "c");
        sender.drain_overflow().unwrap();
        assert_eq!(symbol_of(&rx.recv().await.unwrap()), "d");
        sender.drain_overflow().unwrap();
        assert_eq!(symbol_of(&rx.recv().await.unwrap()), "e");
        assert_eq!(sender.delivered(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_waits_no_longer_than_timeout() {
        let (tx, _rx) = mpsc::channel(1);
        let mut sender = InboundSender::new(tx, Duration::from_millis(50), 8);
        sender.push(message("a")).await;

        let started = tokio::time::Instant::now();
        assert_eq!(sender.push(message("b")).await, PushOutcome::Queued);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(50) && waited < Duration::from_millis(60));

        // Once something is parked, later pushes do not wait at all
        let started = tokio::time::Instant::now();
        sender.push(message("c")).await;
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_closed_consumer() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut sender = InboundSender::new(tx, Duration::from_millis(10), 4);
        assert_eq!(sender.push(message("a")).await, PushOutcome::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_delivers_parked_messages() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut sender = InboundSender::new(tx, Duration::from_millis(50), 4);
        sender.push(message("a")).await;
        sender.push(message("b")).await;

        let consumer = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(m) = rx.recv().await {
                seen.push(symbol_of(&m));
            }
            seen
        });

        assert_eq!(sender.flush().await, 0);
        drop(sender);
        assert_eq!(consumer.await.unwrap(), vec!["a", "b"]);
    }
}
