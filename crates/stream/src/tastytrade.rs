//! Tastytrade DXLink transport
//!
//! DXLink multiplexes channels over one websocket. Channel 0 carries setup,
//! authentication and keepalives; the session opens a single FEED channel
//! for Greeks events in the FULL data format.

use std::time::Duration;

use async_trait::async_trait;
use common::{DxGreeksEvent, RawPayload, Source, Subscription};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{Result, SessionError};
use crate::transport::{FeedTransport, Frame, ParsedPayload};
use crate::ws::{WsConnection, WsInbound};

const CONTROL_CHANNEL: u64 = 0;
const FEED_CHANNEL: u64 = 1;
const GREEKS_EVENT: &str = "Greeks";
const GREEKS_FIELDS: [&str; 11] = [
    "eventType",
    "eventSymbol",
    "eventTime",
    "time",
    "price",
    "volatility",
    "delta",
    "gamma",
    "theta",
    "rho",
    "vega",
];

pub fn setup_message(keepalive: Duration) -> String {
    let secs = keepalive.as_secs().max(1);
    json!({
        "type": "SETUP",
        "channel": CONTROL_CHANNEL,
        "version": "0.1-greekstream",
        "keepaliveTimeout": secs,
        "acceptKeepaliveTimeout": secs,
    })
    .to_string()
}

pub fn auth_message(token: &str) -> String {
    json!({"type": "AUTH", "channel": CONTROL_CHANNEL, "token": token}).to_string()
}

pub fn channel_request_message() -> String {
    json!({
        "type": "CHANNEL_REQUEST",
        "channel": FEED_CHANNEL,
        "service": "FEED",
        "parameters": {"contract": "AUTO"},
    })
    .to_string()
}

pub fn feed_setup_message() -> String {
    json!({
        "type": "FEED_SETUP",
        "channel": FEED_CHANNEL,
        "acceptAggregationPeriod": 0.1,
        "acceptDataFormat": "FULL",
        "acceptEventFields": {"Greeks": GREEKS_FIELDS},
    })
    .to_string()
}

pub fn subscription_message(added: &[Subscription], removed: &[Subscription]) -> String {
    let entries = |subs: &[Subscription]| -> Vec<Value> {
        subs.iter()
            .map(|s| json!({"type": GREEKS_EVENT, "symbol": s.feed_symbol}))
            .collect()
    };
    let mut message = json!({"type": "FEED_SUBSCRIPTION", "channel": FEED_CHANNEL});
    if !added.is_empty() {
        message["add"] = Value::Array(entries(added));
    }
    if !removed.is_empty() {
        message["remove"] = Value::Array(entries(removed));
    }
    message.to_string()
}

pub fn keepalive_message() -> String {
    json!({"type": "KEEPALIVE", "channel": CONTROL_CHANNEL}).to_string()
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    channel: u64,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<Vec<Value>>,
}

impl Envelope {
    fn error_text(&self) -> String {
        match (&self.error, &self.message) {
            (Some(kind), Some(message)) => format!("{kind}: {message}"),
            (Some(kind), None) => kind.clone(),
            (None, Some(message)) => message.clone(),
            (None, None) => "unspecified DXLink error".to_string(),
        }
    }
}

/// What the handshake wants next
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeStep {
    /// Send this and keep reading
    Reply(String),
    /// Nothing to send yet
    Wait,
    /// The feed channel is open; send this final setup message
    Ready(String),
}

/// Client side of the DXLink setup / auth / channel handshake
#[derive(Debug)]
pub struct DxHandshake {
    token: String,
    auth_sent: bool,
}

impl DxHandshake {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            auth_sent: false,
        }
    }

    pub fn advance(&mut self, text: &str) -> Result<HandshakeStep> {
        let envelope: Envelope = serde_json::from_str(text)?;
        match envelope.kind.as_str() {
            "AUTH_STATE" => match envelope.state.as_deref() {
                Some("AUTHORIZED") => Ok(HandshakeStep::Reply(channel_request_message())),
                Some("UNAUTHORIZED") if !self.auth_sent => {
                    self.auth_sent = true;
                    Ok(HandshakeStep::Reply(auth_message(&self.token)))
                }
                Some("UNAUTHORIZED") => Err(SessionError::Auth("streamer token rejected".into())),
                other => Err(SessionError::Protocol(format!("unknown auth state {other:?}"))),
            },
            "CHANNEL_OPENED" if envelope.channel == FEED_CHANNEL => {
                Ok(HandshakeStep::Ready(feed_setup_message()))
            }
            "ERROR" => {
                let text = envelope.error_text();
                if envelope.error.as_deref() == Some("UNAUTHORIZED") {
                    Err(SessionError::Auth(text))
                } else {
                    Err(SessionError::Protocol(text))
                }
            }
            _ => Ok(HandshakeStep::Wait),
        }
    }
}

/// Parse one post-handshake DXLink frame
pub fn parse_feed_frame(text: &str) -> Result<Frame> {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => return Ok(Frame::Malformed(e.to_string())),
    };

    match envelope.kind.as_str() {
        "FEED_DATA" => {
            let events = envelope.data.unwrap_or_default();
            let mut payloads = Vec::with_capacity(events.len());
            for event in events {
                if !event.is_object() {
                    return Ok(Frame::Malformed("FEED_DATA is not in FULL format".into()));
                }
                if event.get("eventType").and_then(Value::as_str).is_some_and(|t| t != GREEKS_EVENT) {
                    continue;
                }
                let raw = event.to_string();
                match serde_json::from_value::<DxGreeksEvent>(event) {
                    Ok(greeks) => payloads.push(ParsedPayload {
                        payload: RawPayload::Tastytrade(greeks),
                        raw,
                    }),
                    Err(e) => debug!(error = %e, %raw, "Skipping unreadable Greeks event"),
                }
            }
            Ok(Frame::Data(payloads))
        }
        "AUTH_STATE" if envelope.state.as_deref() == Some("UNAUTHORIZED") => {
            Err(SessionError::Auth("authorization revoked".into()))
        }
        "CHANNEL_CLOSED" if envelope.channel == FEED_CHANNEL => {
            Err(SessionError::Protocol("feed channel closed by server".into()))
        }
        "ERROR" => Err(SessionError::Protocol(envelope.error_text())),
        _ => Ok(Frame::Heartbeat),
    }
}

pub struct TastytradeTransport {
    url: String,
    token: String,
    keepalive: Duration,
    connection: Option<WsConnection>,
}

impl TastytradeTransport {
    pub fn new(url: impl Into<String>, token: impl Into<String>, keepalive: Duration) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            keepalive,
            connection: None,
        }
    }

    fn connection(&mut self) -> Result<&mut WsConnection> {
        self.connection.as_mut().ok_or(SessionError::Closed)
    }
}

#[async_trait]
impl FeedTransport for TastytradeTransport {
    fn source(&self) -> Source {
        Source::Tastytrade
    }

    async fn connect(&mut self) -> Result<()> {
        self.close().await;

        let mut ws = WsConnection::open(&self.url).await?;
        ws.send_text(setup_message(self.keepalive)).await?;

        let mut handshake = DxHandshake::new(self.token.clone());
        loop {
            let text = match ws.recv().await? {
                WsInbound::Text(text) => text,
                WsInbound::Control => continue,
            };
            match handshake.advance(&text)? {
                HandshakeStep::Reply(reply) => ws.send_text(reply).await?,
                HandshakeStep::Wait => {}
                HandshakeStep::Ready(setup) => {
                    ws.send_text(setup).await?;
                    break;
                }
            }
        }

        info!(url = %self.url, "DXLink feed channel open");
        self.connection = Some(ws);
        Ok(())
    }

    async fn subscribe(&mut self, added: &[Subscription], removed: &[Subscription]) -> Result<()> {
        if added.is_empty() && removed.is_empty() {
            return Ok(());
        }
        let message = subscription_message(added, removed);
        self.connection()?
            .send_text(message)
            .await
            .map_err(|e| SessionError::Subscribe(e.to_string()))
    }

    async fn send_heartbeat(&mut self) -> Result<()> {
        self.connection()?.send_text(keepalive_message()).await
    }

    async fn next_frame(&mut self) -> Result<Frame> {
        match self.connection()?.recv().await? {
            WsInbound::Text(text) => parse_feed_frame(&text),
            WsInbound::Control => Ok(Frame::Heartbeat),
        }
    }

    async fn close(&mut self) {
        if let Some(ws) = self.connection.take() {
            ws.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::NaiveDate;
    use common::{InstrumentSpec, OptionRight};

    #[test]
    fn test_handshake_sequence() {
        let mut handshake = DxHandshake::new("tok");

        let setup = r#"{"type":"SETUP","channel":0,"keepaliveTimeout":60,"version":"1.0"}"#;
        assert_eq!(handshake.advance(setup).unwrap(), HandshakeStep::Wait);

        let step = handshake
            .advance(r#"{"type":"AUTH_STATE","channel":0,"state":"UNAUTHORIZED"}"#)
            .unwrap();
        assert_matches!(step, HandshakeStep::Reply(ref m) if m.contains(r#""token":"tok""#));

        let step = handshake
            .advance(r#"{"type":"AUTH_STATE","channel":0,"state":"AUTHORIZED","userId":"u"}"#)
            .unwrap();
        assert_matches!(step, HandshakeStep::Reply(ref m) if m.contains("CHANNEL_REQUEST"));

        let step = handshake
            .advance(r#"{"type":"CHANNEL_OPENED","channel":1,"service":"FEED"}"#)
            .unwrap();
        assert_matches!(step, HandshakeStep::Ready(ref m) if m.contains(r#""acceptDataFormat":"FULL""#));
    }

    #[test]
    fn test_second_unauthorized_fails() {
        let mut handshake = DxHandshake::new("bad");
        let unauthorized = r#"{"type":"AUTH_STATE","channel":0,"state":"UNAUTHORIZED"}"#;
        handshake.advance(unauthorized).unwrap();
        assert_matches!(handshake.advance(unauthorized), Err(SessionError::Auth(_)));
    }

    #[test]
    fn test_error_message_fails_handshake() {
        let mut handshake = DxHandshake::new("tok");
        let result = handshake.advance(r#"{"type":"ERROR","channel":0,"error":"TIMEOUT","message":"too slow"}"#);
        assert_matches!(result, Err(SessionError::Protocol(ref m)) if m == "TIMEOUT: too slow");
    }

    #[test]
    fn test_parse_feed_data() {
        let text = r#"{"type":"FEED_DATA","channel":1,"data":[
            {"eventType":"Greeks","eventSymbol":".SPY240119C450","eventTime":0,"time":1705500000000,
             "price":5.1,"volatility":0.18,"delta":0.52,"gamma":0.03,"theta":-0.1,"rho":0.02,"vega":0.4},
            {"eventType":"Quote","eventSymbol":"SPY","bidPrice":450.1}
        ]}"#;
        let frame = parse_feed_frame(text).unwrap();
        let payloads = assert_matches!(frame, Frame::Data(p) => p);
        assert_eq!(payloads.len(), 1);
        let event = assert_matches!(&payloads[0].payload, RawPayload::Tastytrade(e) => e);
        assert_eq!(event.event_symbol, ".SPY240119C450");
        assert_eq!(event.delta, Some(0.52));
        assert!(payloads[0].raw.contains(r#""eventSymbol":".SPY240119C450""#));
    }

    #[test]
    fn test_parse_control_frames() {
        assert_eq!(
            parse_feed_frame(r#"{"type":"KEEPALIVE","channel":0}"#).unwrap(),
            Frame::Heartbeat
        );
        assert_matches!(parse_feed_frame("{not json"), Ok(Frame::Malformed(_)));
        assert_matches!(
            parse_feed_frame(r#"{"type":"FEED_DATA","channel":1,"data":["Greeks",[".SPY",1]]}"#),
            Ok(Frame::Malformed(_))
        );
        assert_matches!(
            parse_feed_frame(r#"{"type":"CHANNEL_CLOSED","channel":1}"#),
            Err(SessionError::Protocol(_))
        );
        assert_matches!(
            parse_feed_frame(r#"{"type":"AUTH_STATE","channel":0,"state":"UNAUTHORIZED"}"#),
            Err(SessionError::Auth(_))
        );
    }

    #[test]
    fn test_subscription_message() {
        let expiry = NaiveDate::from_ymd_opt(2024, 1, 19).unwrap();
        let sub = Subscription::new(
            Source::Tastytrade,
            ".SPY240119C450",
            InstrumentSpec::option("SPY", expiry, 450.0, OptionRight::Call),
        );

        let message: Value = serde_json::from_str(&subscription_message(&[sub.clone()], &[])).unwrap();
        assert_eq!(message["type"], "FEED_SUBSCRIPTION");
        assert_eq!(message["add"][0]["symbol"], ".SPY240119C450");
        assert!(message.get("remove").is_none());

        let message: Value = serde_json::from_str(&subscription_message(&[], &[sub])).unwrap();
        assert_eq!(message["remove"][0]["type"], "Greeks");
    }
}
