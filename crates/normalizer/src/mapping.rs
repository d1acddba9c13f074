//! Pure per-source field mappings
//!
//! Each mapping turns one raw payload into a [`PartialSnapshot`]: the
//! canonical fields a source can tell us, before identity and ingestion
//! timestamps are assigned. Nothing here touches shared state.

use chrono::{DateTime, TimeZone, Utc};
use common::{
    payload::parse_streamer_symbol, ContractKey, DxGreeksEvent, GreekSnapshot, IbkrMarketData,
    RawPayload, Source,
};
use uuid::Uuid;

use crate::error::{NormalizeError, Result};

/// Canonical fields recovered from one payload
#[derive(Debug, Clone, PartialEq)]
pub struct PartialSnapshot {
    pub underlying_symbol: String,
    pub contract_key: ContractKey,
    pub event_time: Option<DateTime<Utc>>,
    pub delta: Option<f64>,
    pub gamma: Option<f64>,
    pub theta: Option<f64>,
    pub vega: Option<f64>,
    pub rho: Option<f64>,
    pub implied_volatility: Option<f64>,
    pub underlying_price: Option<f64>,
}

impl PartialSnapshot {
    pub fn has_any_greek(&self) -> bool {
        [self.delta, self.gamma, self.theta, self.vega, self.rho]
            .iter()
            .any(Option::is_some)
    }

    /// Attach identity and ingestion context
    pub fn into_snapshot(
        self,
        source: Source,
        account_id: &str,
        received_at: DateTime<Utc>,
        raw_payload: String,
        out_of_order: bool,
    ) -> GreekSnapshot {
        GreekSnapshot {
            snapshot_id: Uuid::new_v4(),
            source,
            account_id: account_id.to_string(),
            underlying_symbol: self.underlying_symbol,
            contract_key: self.contract_key,
            event_time: self.event_time,
            received_at,
            persisted_at: None,
            delta: self.delta,
            gamma: self.gamma,
            theta: self.theta,
            vega: self.vega,
            rho: self.rho,
            implied_volatility: self.implied_volatility,
            underlying_price: self.underlying_price,
            raw_payload,
            out_of_order,
        }
    }
}

/// Map any raw payload
pub fn map_payload(payload: &RawPayload) -> Result<PartialSnapshot> {
    match payload {
        RawPayload::Tastytrade(event) => map_tastytrade(event),
        RawPayload::Ibkr(data) => map_ibkr(data),
    }
}

/// DXLink Greeks event
///
/// `volatility` is already a fraction. `time` is the calculation time and
/// wins over `eventTime`, which the feed usually leaves at zero.
pub fn map_tastytrade(event: &DxGreeksEvent) -> Result<PartialSnapshot> {
    let symbol = event.event_symbol.trim();
    if symbol.is_empty() {
        return Err(NormalizeError::MissingSymbol);
    }
    let instrument = parse_streamer_symbol(symbol);
    let event_time = [event.time, event.event_time]
        .into_iter()
        .flatten()
        .find(|ms| *ms > 0.0)
        .and_then(|ms| from_epoch_millis(ms as i64));

    Ok(PartialSnapshot {
        contract_key: instrument.contract_key(),
        underlying_symbol: instrument.underlying,
        event_time,
        delta: event.delta,
        gamma: event.gamma,
        theta: event.theta,
        vega: event.vega,
        rho: event.rho,
        implied_volatility: event.volatility,
        underlying_price: None,
    })
}

/// IBKR market data message
///
/// Implied volatility arrives as a percentage and is scaled to a fraction.
/// IBKR publishes no rho.
pub fn map_ibkr(data: &IbkrMarketData) -> Result<PartialSnapshot> {
    let instrument = data
        .instrument
        .as_ref()
        .ok_or_else(|| NormalizeError::UnknownInstrument(data.resolved_conid()))?;

    let field = |value: &Option<String>| value.as_deref().and_then(parse_ibkr_number);

    Ok(PartialSnapshot {
        underlying_symbol: instrument.underlying.clone(),
        contract_key: instrument.contract_key(),
        event_time: data.updated.filter(|ms| *ms > 0).and_then(from_epoch_millis),
        delta: field(&data.delta),
        gamma: field(&data.gamma),
        theta: field(&data.theta),
        vega: field(&data.vega),
        rho: None,
        implied_volatility: field(&data.implied_vol).map(|pct| pct / 100.0),
        underlying_price: field(&data.underlying_price),
    })
}

/// Parse an IBKR field value
///
/// Values may carry a one-letter prefix (`C` for a prior close, `H` for a
/// halted contract) and a trailing `%`. Anything else unparseable is `None`.
pub fn parse_ibkr_number(value: &str) -> Option<f64> {
    let mut text = value.trim();
    if let Some(first) = text.chars().next() {
        if first.is_ascii_alphabetic() && text.len() > 1 {
            text = &text[1..];
        }
    }
    let text = text.strip_suffix('%').unwrap_or(text).replace(',', "");
    text.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

fn from_epoch_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::NaiveDate;
    use common::{InstrumentSpec, OptionRight};

    fn dx_event(json: &str) -> DxGreeksEvent {
        serde_json::from_str(json).unwrap()
    }

    fn ibkr(json: &str, instrument: Option<InstrumentSpec>) -> IbkrMarketData {
        let mut data: IbkrMarketData = serde_json::from_str(json).unwrap();
        data.instrument = instrument;
        data
    }

    #[test]
    fn test_tastytrade_fixture() {
        let event = dx_event(
            r#"{"eventType":"Greeks","eventSymbol":".SPY240119P452.5","eventTime":0,
                "time":1705500000123,"price":3.4,"volatility":0.1812,"delta":-0.48,
                "gamma":0.031,"theta":-0.2,"rho":-0.05,"vega":0.41}"#,
        );
        let partial = map_tastytrade(&event).unwrap();

        assert_eq!(partial.underlying_symbol, "SPY");
        assert_eq!(partial.contract_key.as_str(), "SPY:2024-01-19:452.5:P");
        assert_eq!(
            partial.event_time,
            Some(Utc.timestamp_millis_opt(1_705_500_000_123).unwrap())
        );
        assert_eq!(partial.delta, Some(-0.48));
        assert_eq!(partial.rho, Some(-0.05));
        assert_eq!(partial.implied_volatility, Some(0.1812));
        assert_eq!(partial.underlying_price, None);
        assert!(partial.has_any_greek());
    }

    #[test]
    fn test_tastytrade_without_times_or_greeks() {
        let event = dx_event(r#"{"eventSymbol":"SPY","eventTime":0,"delta":"NaN","volatility":0.2}"#);
        let partial = map_tastytrade(&event).unwrap();
        assert_eq!(partial.event_time, None);
        assert_eq!(partial.contract_key.as_str(), "SPY");
        assert!(!partial.has_any_greek());
    }

    #[test]
    fn test_tastytrade_blank_symbol() {
        let event = dx_event(r#"{"eventSymbol":"  ","delta":0.5}"#);
        assert_matches!(map_tastytrade(&event), Err(NormalizeError::MissingSymbol));
    }

    #[test]
    fn test_ibkr_fixture() {
        let expiry = NaiveDate::from_ymd_opt(2024, 1, 19).unwrap();
        let data = ibkr(
            r#"{"topic":"smd+265598","conid":265598,"_updated":1705500000000,
                "7308":"0.452","7309":"0.0123","7310":"-0.081","7311":"0.19",
                "7633":"25.3%","7635":"C190.25"}"#,
            Some(InstrumentSpec::option("aapl", expiry, 190.0, OptionRight::Call)),
        );
        let partial = map_ibkr(&data).unwrap();

        assert_eq!(partial.underlying_symbol, "AAPL");
        assert_eq!(partial.contract_key.as_str(), "AAPL:2024-01-19:190:C");
        assert_eq!(partial.delta, Some(0.452));
        assert_eq!(partial.theta, Some(-0.081));
        assert_eq!(partial.rho, None);
        assert!((partial.implied_volatility.unwrap() - 0.253).abs() < 1e-12);
        assert_eq!(partial.underlying_price, Some(190.25));
        assert_eq!(partial.event_time, Some(Utc.timestamp_millis_opt(1_705_500_000_000).unwrap()));
    }

    #[test]
    fn test_ibkr_requires_instrument() {
        let data = ibkr(r#"{"topic":"smd+42","7308":"0.1"}"#, None);
        assert_eq!(map_ibkr(&data), Err(NormalizeError::UnknownInstrument(Some(42))));
    }

    #[test]
    fn test_same_contract_same_key_across_sources() {
        let expiry = NaiveDate::from_ymd_opt(2024, 1, 19).unwrap();
        let dx = map_tastytrade(&dx_event(r#"{"eventSymbol":".SPY240119C450","delta":0.5}"#)).unwrap();
        let ib = map_ibkr(&ibkr(
            r#"{"topic":"smd+1","7308":"0.5"}"#,
            Some(InstrumentSpec::option("SPY", expiry, 450.0, OptionRight::Call)),
        ))
        .unwrap();
        assert_eq!(dx.contract_key, ib.contract_key);
    }

    #[test]
    fn test_parse_ibkr_number() {
        assert_eq!(parse_ibkr_number("0.45"), Some(0.45));
        assert_eq!(parse_ibkr_number("C12.5"), Some(12.5));
        assert_eq!(parse_ibkr_number("H-0.3"), Some(-0.3));
        assert_eq!(parse_ibkr_number("25.3%"), Some(25.3));
        assert_eq!(parse_ibkr_number("1,234.5"), Some(1234.5));
        assert_eq!(parse_ibkr_number(""), None);
        assert_eq!(parse_ibkr_number("N/A"), None);
        assert_eq!(parse_ibkr_number("C"), None);
    }
}
