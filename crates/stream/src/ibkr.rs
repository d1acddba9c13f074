//! IBKR Client Portal websocket transport
//!
//! Topics are plain text commands (`smd+<conid>+{...}`, `umd+<conid>+{}`,
//! `tic`); server messages are JSON objects tagged by `topic`. Market data
//! only names the conid, so the transport keeps the conid -> instrument map
//! of its current subscriptions and attaches the instrument to each payload.

use std::collections::HashMap;

use async_trait::async_trait;
use common::{IbkrMarketData, InstrumentSpec, RawPayload, Source, Subscription};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::transport::{FeedTransport, Frame, ParsedPayload};
use crate::ws::{WsConnection, WsInbound};

/// Delta, gamma, theta, vega, implied vol, underlying price
pub const GREEK_FIELDS: [&str; 6] = ["7308", "7309", "7310", "7311", "7633", "7635"];

pub fn session_message(token: &str) -> String {
    serde_json::json!({ "session": token }).to_string()
}

pub fn subscribe_message(conid: i64) -> String {
    format!(
        "smd+{conid}+{}",
        serde_json::json!({ "fields": GREEK_FIELDS })
    )
}

pub fn unsubscribe_message(conid: i64) -> String {
    format!("umd+{conid}+{{}}")
}

pub const HEARTBEAT_MESSAGE: &str = "tic";

fn authenticated(message: &Value) -> Option<bool> {
    message
        .get("args")
        .and_then(|args| args.get("authenticated"))
        .and_then(Value::as_bool)
}

/// Whether a handshake-phase message marks the session ready
pub fn handshake_ready(text: &str) -> Result<bool> {
    let message: Value = serde_json::from_str(text)?;
    match message.get("topic").and_then(Value::as_str) {
        Some("system") => Ok(true),
        Some("sts") => match authenticated(&message) {
            Some(true) => Ok(true),
            Some(false) => Err(SessionError::Auth("brokerage session is not authenticated".into())),
            None => Ok(false),
        },
        _ => Ok(false),
    }
}

/// Parse one post-handshake frame
pub fn parse_frame(text: &str, conids: &HashMap<i64, InstrumentSpec>) -> Result<Frame> {
    let message: Value = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => return Ok(Frame::Malformed(e.to_string())),
    };

    let topic = message.get("topic").and_then(Value::as_str).unwrap_or_default().to_string();
    if topic.starts_with("smd+") {
        let mut data: IbkrMarketData = match serde_json::from_value(message) {
            Ok(data) => data,
            Err(e) => return Ok(Frame::Malformed(e.to_string())),
        };
        let Some(conid) = data.resolved_conid() else {
            return Ok(Frame::Malformed(format!("no conid in topic {topic}")));
        };
        let Some(instrument) = conids.get(&conid) else {
            debug!(conid, "Market data for a conid that is no longer subscribed");
            return Ok(Frame::Data(Vec::new()));
        };
        data.instrument = Some(instrument.clone());
        return Ok(Frame::Data(vec![ParsedPayload {
            payload: RawPayload::Ibkr(data),
            raw: text.to_string(),
        }]));
    }

    if topic == "sts" && authenticated(&message) == Some(false) {
        return Err(SessionError::Auth("brokerage session lost authentication".into()));
    }
    Ok(Frame::Heartbeat)
}

pub struct IbkrTransport {
    url: String,
    token: String,
    connection: Option<WsConnection>,
    conids: HashMap<i64, InstrumentSpec>,
}

impl IbkrTransport {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            connection: None,
            conids: HashMap::new(),
        }
    }

    fn connection(&mut self) -> Result<&mut WsConnection> {
        self.connection.as_mut().ok_or(SessionError::Closed)
    }
}

fn conid_of(subscription: &Subscription) -> Option<i64> {
    let conid = subscription.feed_symbol.trim().parse().ok();
    if conid.is_none() {
        warn!(
            feed_symbol = %subscription.feed_symbol,
            contract_key = %subscription.contract_key(),
            "IBKR subscription without a numeric conid; skipping"
        );
    }
    conid
}

#[async_trait]
impl FeedTransport for IbkrTransport {
    fn source(&self) -> Source {
        Source::Ibkr
    }

    async fn connect(&mut self) -> Result<()> {
        self.close().await;

        let mut ws = WsConnection::open(&self.url).await?;
        ws.send_text(session_message(&self.token)).await?;

        loop {
            match ws.recv().await? {
                WsInbound::Text(text) => {
                    if handshake_ready(&text)? {
                        break;
                    }
                }
                WsInbound::Control => {}
            }
        }

        info!(url = %self.url, "IBKR websocket session ready");
        self.connection = Some(ws);
        Ok(())
    }

    async fn subscribe(&mut self, added: &[Subscription], removed: &[Subscription]) -> Result<()> {
        let mut commands = Vec::with_capacity(added.len() + removed.len());
        for sub in removed {
            if let Some(conid) = conid_of(sub) {
                self.conids.remove(&conid);
                commands.push(unsubscribe_message(conid));
            }
        }
        for sub in added {
            if let Some(conid) = conid_of(sub) {
                self.conids.insert(conid, sub.instrument.clone());
                commands.push(subscribe_message(conid));
            }
        }

        let ws = self.connection()?;
        for command in commands {
            ws.send_text(command)
                .await
                .map_err(|e| SessionError::Subscribe(e.to_string()))?;
        }
        Ok(())
    }

    async fn send_heartbeat(&mut self) -> Result<()> {
        self.connection()?.send_text(HEARTBEAT_MESSAGE).await
    }

    async fn next_frame(&mut self) -> Result<Frame> {
        let inbound = match self.connection.as_mut() {
            Some(ws) => ws.recv().await?,
            None => return Err(SessionError::Closed),
        };
        match inbound {
            WsInbound::Text(text) => parse_frame(&text, &self.conids),
            WsInbound::Control => Ok(Frame::Heartbeat),
        }
    }

    async fn close(&mut self) {
        self.conids.clear();
        if let Some(ws) = self.connection.take() {
            ws.close().await;
        }
    }
}
