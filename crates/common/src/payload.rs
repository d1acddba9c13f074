//! Raw payloads as they leave a stream session
//!
//! Each source has its own typed payload; the [`RawPayload`] tagged union is
//! the only thing that crosses the supervisor -> normalizer channel.

use std::sync::{Arc, OnceLock};

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

use crate::types::{InstrumentSpec, OptionRight, Source};

/// Greeks event from the DXLink feed (FULL data format)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DxGreeksEvent {
    #[serde(default)]
    pub event_type: String,
    pub event_symbol: String,
    /// Epoch millis, zero when the feed does not set it
    #[serde(default, deserialize_with = "lenient_number")]
    pub event_time: Option<f64>,
    /// Epoch millis of the calculation
    #[serde(default, deserialize_with = "lenient_number")]
    pub time: Option<f64>,
    /// Theoretical option price
    #[serde(default, deserialize_with = "lenient_number")]
    pub price: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub volatility: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub delta: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub gamma: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub theta: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub rho: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub vega: Option<f64>,
}

/// Market data message from the IBKR Client Portal websocket
///
/// Field values arrive as strings keyed by numeric field codes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IbkrMarketData {
    pub topic: String,
    #[serde(default)]
    pub conid: Option<i64>,
    /// Epoch millis of the last update
    #[serde(rename = "_updated", default)]
    pub updated: Option<i64>,
    #[serde(rename = "7308", default, deserialize_with = "lenient_text")]
    pub delta: Option<String>,
    #[serde(rename = "7309", default, deserialize_with = "lenient_text")]
    pub gamma: Option<String>,
    #[serde(rename = "7310", default, deserialize_with = "lenient_text")]
    pub theta: Option<String>,
    #[serde(rename = "7311", default, deserialize_with = "lenient_text")]
    pub vega: Option<String>,
    #[serde(rename = "7633", default, deserialize_with = "lenient_text")]
    pub implied_vol: Option<String>,
    #[serde(rename = "7635", default, deserialize_with = "lenient_text")]
    pub underlying_price: Option<String>,
    /// Instrument the session subscribed this conid for
    #[serde(skip)]
    pub instrument: Option<InstrumentSpec>,
}

impl IbkrMarketData {
    /// Conid from the body, falling back to the `smd+<conid>` topic
    pub fn resolved_conid(&self) -> Option<i64> {
        self.conid.or_else(|| {
            self.topic
                .strip_prefix("smd+")
                .and_then(|rest| rest.split('+').next())
                .and_then(|id| id.parse().ok())
        })
    }
}

/// Source-tagged raw payload
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    Tastytrade(DxGreeksEvent),
    Ibkr(IbkrMarketData),
}

impl RawPayload {
    pub fn source(&self) -> Source {
        match self {
            RawPayload::Tastytrade(_) => Source::Tastytrade,
            RawPayload::Ibkr(_) => Source::Ibkr,
        }
    }
}

/// One message pushed by a session onto the shared inbound channel
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub source: Source,
    pub account_id: Arc<str>,
    pub payload: RawPayload,
    /// Untouched JSON text of this payload
    pub raw: String,
    /// When the session read the frame off the socket
    pub read_at: DateTime<Utc>,
}

/// Parse a DXLink option streamer symbol such as `.SPY240119C452.5`
///
/// Symbols without the option suffix are treated as non-derivatives.
pub fn parse_streamer_symbol(symbol: &str) -> InstrumentSpec {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"^\.([A-Z0-9/]+?)(\d{6})([CP])(\d+(?:\.\d+)?)$").ok()
    });

    let trimmed = symbol.trim();
    let parsed = pattern.as_ref().and_then(|re| re.captures(trimmed)).and_then(|caps| {
        let underlying = caps.get(1)?.as_str();
        let expiration = NaiveDate::parse_from_str(caps.get(2)?.as_str(), "%y%m%d").ok()?;
        let right = OptionRight::from_code(caps.get(3)?.as_str().chars().next()?)?;
        let strike: f64 = caps.get(4)?.as_str().parse().ok()?;
        Some(InstrumentSpec::option(underlying, expiration, strike, right))
    });

    parsed.unwrap_or_else(|| InstrumentSpec::underlying_only(trimmed.trim_start_matches('.')))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(f64),
    Text(String),
}

/// Accept a JSON number or a numeric string; `"NaN"`, infinities and
/// unparseable text become `None`.
fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<NumberOrText>::deserialize(deserializer)?;
    Ok(value
        .and_then(|v| match v {
            NumberOrText::Number(n) => Some(n),
            NumberOrText::Text(s) => s.trim().parse::<f64>().ok(),
        })
        .filter(|n| n.is_finite()))
}

/// Accept a JSON string or number and keep it as text
fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<NumberOrText>::deserialize(deserializer)?;
    Ok(value.map(|v| match v {
        NumberOrText::Number(n) => n.to_string(),
        NumberOrText::Text(s) => s,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dx_event_accepts_nan_strings() {
        let json = r#"{"eventType":"Greeks","eventSymbol":".SPY240119C450","eventTime":0,
            "time":1705500000000,"price":"NaN","volatility":0.18,"delta":"0.52",
            "gamma":0.031,"theta":-0.12,"rho":"Infinity","vega":0.4}"#;
        let event: DxGreeksEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.price, None);
        assert_eq!(event.rho, None);
        assert_eq!(event.delta, Some(0.52));
        assert_eq!(event.time, Some(1_705_500_000_000.0));
    }

    #[test]
    fn test_ibkr_conid_from_topic() {
        let json = r#"{"topic":"smd+265598","7308":"0.45","_updated":1705500000000}"#;
        let data: IbkrMarketData = serde_json::from_str(json).unwrap();
        assert_eq!(data.resolved_conid(), Some(265598));
        assert_eq!(data.delta.as_deref(), Some("0.45"));
        assert!(data.instrument.is_none());
    }

    #[test]
    fn test_ibkr_numeric_field_kept_as_text() {
        let json = r#"{"topic":"smd+1","conid":1,"7309":0.02}"#;
        let data: IbkrMarketData = serde_json::from_str(json).unwrap();
        assert_eq!(data.gamma.as_deref(), Some("0.02"));
    }

    #[test]
    fn test_parse_streamer_symbol() {
        let spec = parse_streamer_symbol(".SPY240119P452.5");
        assert_eq!(spec.underlying, "SPY");
        assert_eq!(spec.expiration, NaiveDate::from_ymd_opt(2024, 1, 19));
        assert_eq!(spec.strike, Some(452.5));
        assert_eq!(spec.right, Some(OptionRight::Put));
        assert_eq!(spec.contract_key().as_str(), "SPY:2024-01-19:452.5:P");
    }

    #[test]
    fn test_parse_streamer_symbol_non_option() {
        let spec = parse_streamer_symbol("SPY");
        assert!(!spec.is_option());
        assert_eq!(spec.contract_key().as_str(), "SPY");
    }
}
