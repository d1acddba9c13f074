//! Normalization error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NormalizeError>;

/// Why a payload did not become a snapshot
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NormalizeError {
    #[error("payload carries no delta, gamma, theta, vega or rho")]
    NoGreeks,

    #[error("payload has no instrument symbol")]
    MissingSymbol,

    #[error("no instrument is known for conid {0:?}")]
    UnknownInstrument(Option<i64>),

    #[error("payload source {payload} does not match session source {session}")]
    SourceMismatch {
        session: common::Source,
        payload: common::Source,
    },
}

impl NormalizeError {
    /// Stable label for the rejection counter
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NoGreeks => "no_greeks",
            Self::MissingSymbol => "missing_symbol",
            Self::UnknownInstrument(_) => "unknown_instrument",
            Self::SourceMismatch { .. } => "source_mismatch",
        }
    }
}
