//! The venue seam: quotes, balance and orders.

pub mod oanda;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use tracing::{info, warn};

use crate::error::{BrokerError, QuoteFetchError};
use crate::execution::OrderSubmitter;
use crate::models::{Pair, Quote, RateSnapshot};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Balance {
    pub balance: f64,
    pub available_margin: f64,
}

#[async_trait]
pub trait Broker: OrderSubmitter {
    async fn fetch_quote(&self, pair: Pair) -> Result<Quote, BrokerError>;

    async fn account_balance(&self) -> Result<Balance, BrokerError>;
}

/// A snapshot plus the pairs that could not be priced this pass.
#[derive(Debug)]
pub struct FetchedSnapshot {
    pub snapshot: RateSnapshot,
    pub failures: Vec<QuoteFetchError>,
}

/// Fetches every pair with at most `max_concurrent` requests in flight. A
/// failed pair is reported and left out; it never fails the whole snapshot.
pub async fn fetch_snapshot<B>(
    broker: &B,
    pairs: &[Pair],
    max_concurrent: usize,
    captured_at: DateTime<Utc>,
) -> FetchedSnapshot
where
    B: Broker + ?Sized,
{
    let results: Vec<(Pair, Result<Quote, BrokerError>)> = stream::iter(pairs.iter().copied())
        .map(|pair| async move { (pair, broker.fetch_quote(pair).await) })
        .buffer_unordered(max_concurrent.max(1))
        .collect()
        .await;

    let mut quotes = Vec::with_capacity(results.len());
    let mut failures = Vec::new();
    for (pair, result) in results {
        match result {
            Ok(q) if q.pair() == pair => quotes.push(q),
            Ok(q) => failures.push(QuoteFetchError {
                pair,
                source: BrokerError::Decode {
                    endpoint: pair.to_string(),
                    detail: format!("asked for {pair}, got {}", q.pair()),
                },
            }),
            Err(source) => {
                warn!("{}: {}", pair, source);
                failures.push(QuoteFetchError { pair, source });
            }
        }
    }

    let snapshot = RateSnapshot::new(quotes, captured_at);
    info!(
        "snapshot: {} of {} pairs priced, {} failed",
        snapshot.len(),
        pairs.len(),
        failures.len()
    );
    FetchedSnapshot { snapshot, failures }
}
