use thiserror::Error;

use crate::models::{CurrencyCode, Pair};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid currency code {0:?}")]
pub struct InvalidCurrency(pub String);

/// A quote that violates `ask >= bid > 0`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum QuoteError {
    #[error("{pair}: bid and ask must be finite and positive (bid={bid}, ask={ask})")]
    NonPositive { pair: Pair, bid: f64, ask: f64 },
    #[error("{pair}: crossed quote, ask {ask} is below bid {bid}")]
    Crossed { pair: Pair, bid: f64, ask: f64 },
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("http transport: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{endpoint} returned {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("unexpected response from {endpoint}: {detail}")]
    Decode { endpoint: String, detail: String },
    #[error("bad broker url: {0}")]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Quote(#[from] QuoteError),
}

/// One pair's fetch failed. The pass carries on without that pair's edges.
#[derive(Debug, Error)]
#[error("quote fetch failed for {pair}: {source}")]
pub struct QuoteFetchError {
    pub pair: Pair,
    #[source]
    pub source: BrokerError,
}

/// A leg the venue refused or never confirmed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("order rejected: {reason}")]
pub struct OrderRejection {
    pub reason: String,
}

impl OrderRejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl From<BrokerError> for OrderRejection {
    fn from(err: BrokerError) -> Self {
        Self::new(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("trade journal io: {0}")]
    Io(#[from] std::io::Error),
    #[error("trade journal encode: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Conditions the outer control loop must act on.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unwind failed for trade #{trade_id}: {amount} {currency} left open")]
    UnwindFailed {
        trade_id: u64,
        currency: CurrencyCode,
        amount: f64,
    },
    #[error("trading halted: {0}")]
    Halted(String),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}
