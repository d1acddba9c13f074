//! Transport seam between the shared session state machine and each source

use async_trait::async_trait;
use common::{RawPayload, Source, Subscription};

use crate::error::Result;

/// One source payload together with its untouched JSON text
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPayload {
    pub payload: RawPayload,
    pub raw: String,
}

/// A frame read off the transport
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Data-plane activity: zero or more parsed payloads
    Data(Vec<ParsedPayload>),
    /// Heartbeat-plane or control activity with nothing to deliver
    Heartbeat,
    /// A frame that could not be parsed; the connection stays up
    Malformed(String),
}

/// Source-specific network calls
///
/// The reconnect state machine, heartbeat timer, backpressure and status
/// reporting live in [`StreamSession`](crate::StreamSession); an
/// implementation only knows how to talk to its server.
#[async_trait]
pub trait FeedTransport: Send + 'static {
    fn source(&self) -> Source;

    /// Open the connection and complete the authentication handshake
    ///
    /// The session bounds this with its connect timeout.
    async fn connect(&mut self) -> Result<()>;

    /// Apply a subscription change on the live connection
    async fn subscribe(&mut self, added: &[Subscription], removed: &[Subscription]) -> Result<()>;

    async fn send_heartbeat(&mut self) -> Result<()>;

    /// Wait for the next frame
    ///
    /// Must be cancel-safe: the session polls this inside `select!`.
    async fn next_frame(&mut self) -> Result<Frame>;

    /// Drop the connection; never fails
    async fn close(&mut self);
}

#[async_trait]
impl FeedTransport for Box<dyn FeedTransport> {
    fn source(&self) -> Source {
        (**self).source()
    }

    async fn connect(&mut self) -> Result<()> {
        (**self).connect().await
    }

    async fn subscribe(&mut self, added: &[Subscription], removed: &[Subscription]) -> Result<()> {
        (**self).subscribe(added, removed).await
    }

    async fn send_heartbeat(&mut self) -> Result<()> {
        (**self).send_heartbeat().await
    }

    async fn next_frame(&mut self) -> Result<Frame> {
        (**self).next_frame().await
    }

    async fn close(&mut self) {
        (**self).close().await
    }
}
