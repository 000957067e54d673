use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{InvalidCurrency, QuoteError};

/// Three-letter currency code, stored inline so it stays `Copy`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyCode([u8; 3]);

impl CurrencyCode {
    pub const USD: CurrencyCode = CurrencyCode(*b"USD");

    pub fn new(code: &str) -> Result<Self, InvalidCurrency> {
        let trimmed = code.trim();
        let bytes = trimmed.as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(u8::is_ascii_alphabetic) {
            return Err(InvalidCurrency(code.to_string()));
        }
        Ok(Self([
            bytes[0].to_ascii_uppercase(),
            bytes[1].to_ascii_uppercase(),
            bytes[2].to_ascii_uppercase(),
        ]))
    }

    pub fn as_str(&self) -> &str {
        // only ascii letters are ever stored
        std::str::from_utf8(&self.0).unwrap_or("???")
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CurrencyCode {
    type Err = InvalidCurrency;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for CurrencyCode {
    type Error = InvalidCurrency;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<CurrencyCode> for String {
    fn from(code: CurrencyCode) -> Self {
        code.as_str().to_string()
    }
}

/// Ordered currency pair as it is quoted: the price of one `quote` in `base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pair {
    pub base: CurrencyCode,
    pub quote: CurrencyCode,
}

impl Pair {
    pub fn new(base: CurrencyCode, quote: CurrencyCode) -> Self {
        Self { base, quote }
    }

    pub fn inverse(&self) -> Self {
        Self::new(self.quote, self.base)
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

/// Bid/ask for one pair. `ask` is what it costs in `base` to buy one `quote`,
/// `bid` is what selling one `quote` returns in `base`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub base: CurrencyCode,
    pub quote: CurrencyCode,
    pub bid: f64,
    pub ask: f64,
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    pub fn new(
        base: CurrencyCode,
        quote: CurrencyCode,
        bid: f64,
        ask: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, QuoteError> {
        let pair = Pair::new(base, quote);
        if !bid.is_finite() || !ask.is_finite() || bid <= 0.0 || ask <= 0.0 {
            return Err(QuoteError::NonPositive { pair, bid, ask });
        }
        if ask < bid {
            return Err(QuoteError::Crossed { pair, bid, ask });
        }
        Ok(Self {
            base,
            quote,
            bid,
            ask,
            timestamp,
        })
    }

    pub fn pair(&self) -> Pair {
        Pair::new(self.base, self.quote)
    }

    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    /// `(ask - bid) / mid`; the same for a quote and its reciprocal.
    pub fn relative_spread(&self) -> f64 {
        (self.ask - self.bid) / self.mid()
    }

    /// Reciprocal view of the same market. Never stored in a snapshot.
    pub fn inverse(&self) -> Self {
        Self {
            base: self.quote,
            quote: self.base,
            bid: 1.0 / self.ask,
            ask: 1.0 / self.bid,
            timestamp: self.timestamp,
        }
    }
}

/// Point-in-time set of quotes captured in one fetch cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct RateSnapshot {
    quotes: BTreeMap<Pair, Quote>,
    captured_at: DateTime<Utc>,
}

impl RateSnapshot {
    pub fn new(quotes: impl IntoIterator<Item = Quote>, captured_at: DateTime<Utc>) -> Self {
        Self {
            quotes: quotes.into_iter().map(|q| (q.pair(), q)).collect(),
            captured_at,
        }
    }

    pub fn quotes(&self) -> impl Iterator<Item = &Quote> {
        self.quotes.values()
    }

    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }
}

/// What the venue reports back for one conversion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    /// Amount of the target currency received.
    pub filled_amount: f64,
    pub price: Option<f64>,
}

#[cfg(test)]
pub(crate) fn ccy(code: &str) -> CurrencyCode {
    CurrencyCode::new(code).expect("valid test currency")
}

#[cfg(test)]
pub(crate) fn quote(base: &str, quote: &str, bid: f64, ask: f64) -> Quote {
    Quote::new(ccy(base), ccy(quote), bid, ask, Utc::now()).expect("valid test quote")
}
