//! Thin websocket wrapper shared by both transports

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

use crate::error::{Result, SessionError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the socket produced
pub(crate) enum WsInbound {
    Text(String),
    /// Ping, pong or a non-UTF-8 binary frame
    Control,
}

pub(crate) struct WsConnection {
    socket: WsStream,
}

impl WsConnection {
    pub async fn open(url: &str) -> Result<Self> {
        let (socket, response) = connect_async(url)
            .await
            .map_err(|e| SessionError::Connect(e.to_string()))?;
        debug!(url, status = %response.status(), "Websocket upgraded");
        Ok(Self { socket })
    }

    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<()> {
        self.socket.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Next inbound message; cancel-safe
    pub async fn recv(&mut self) -> Result<WsInbound> {
        match self.socket.next().await {
            None => Err(SessionError::Closed),
            Some(Err(e)) => Err(e.into()),
            Some(Ok(Message::Text(text))) => Ok(WsInbound::Text(text)),
            // IBKR sends its JSON in binary frames
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => Ok(WsInbound::Text(text)),
                Err(_) => Ok(WsInbound::Control),
            },
            Some(Ok(Message::Close(frame))) => {
                debug!(?frame, "Peer sent close frame");
                Err(SessionError::Closed)
            }
            Some(Ok(_)) => Ok(WsInbound::Control),
        }
    }

    pub async fn close(mut self) {
        if let Err(e) = self.socket.close(None).await {
            debug!(error = %e, "Websocket close handshake failed");
        }
    }
}
