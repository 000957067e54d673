use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::{Balance, Broker};
use crate::config::BrokerConfig;
use crate::error::{BrokerError, OrderRejection};
use crate::execution::OrderSubmitter;
use crate::models::{CurrencyCode, Fill, Pair, Quote};

pub const PRACTICE_URL: &str = "https://api-fxpractice.oanda.com/";
pub const LIVE_URL: &str = "https://api-fxtrade.oanda.com/";

/// OANDA v20 REST client.
///
/// An instrument `X_Y` is priced in `Y` per unit of `X`, so it maps to a
/// [`Quote`] with `base = Y` and `quote = X`.
pub struct OandaClient {
    http: Client,
    base: Url,
    api_key: String,
    account_id: String,
    instruments: HashSet<String>,
}

impl std::fmt::Debug for OandaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OandaClient")
            .field("base", &self.base.as_str())
            .field("account_id", &self.account_id)
            .field("instruments", &self.instruments.len())
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct InstrumentsResponse {
    instruments: Vec<Instrument>,
}

#[derive(Deserialize)]
struct Instrument {
    name: String,
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Deserialize)]
struct CandlesResponse {
    candles: Vec<Candle>,
}

#[derive(Deserialize)]
struct Candle {
    time: Option<DateTime<Utc>>,
    bid: Option<Ohlc>,
    ask: Option<Ohlc>,
}

#[derive(Deserialize)]
struct Ohlc {
    c: String,
}

#[derive(Deserialize)]
struct SummaryResponse {
    account: AccountSummary,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountSummary {
    balance: String,
    margin_available: String,
}

pub fn instrument_name(pair: Pair) -> String {
    format!("{}_{}", pair.quote, pair.base)
}

fn pair_of(instrument: &str) -> Option<Pair> {
    let (x, y) = instrument.split_once('_')?;
    Some(Pair::new(CurrencyCode::new(y).ok()?, CurrencyCode::new(x).ok()?))
}

fn parse_num(endpoint: &str, field: &str, raw: &str) -> Result<f64, BrokerError> {
    raw.parse::<f64>().map_err(|_| BrokerError::Decode {
        endpoint: endpoint.to_string(),
        detail: format!("{field} is not a number: {raw:?}"),
    })
}

impl OandaClient {
    pub fn new(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let raw = match &config.base_url {
            Some(url) => url.clone(),
            None if config.practice_mode => PRACTICE_URL.to_string(),
            None => LIVE_URL.to_string(),
        };
        let base = if raw.ends_with('/') {
            Url::parse(&raw)?
        } else {
            Url::parse(&format!("{raw}/"))?
        };
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        info!(
            "oanda: {} account {} at {}",
            if config.practice_mode { "practice" } else { "live" },
            config.account_id,
            base
        );
        Ok(Self {
            http,
            base,
            api_key: config.api_key.clone(),
            account_id: config.account_id.clone(),
            instruments: HashSet::new(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, BrokerError> {
        Ok(self.base.join(path)?)
    }

    async fn read<T: DeserializeOwned>(endpoint: &str, resp: Response) -> Result<T, BrokerError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BrokerError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        let bytes = resp.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| BrokerError::Decode {
            endpoint: endpoint.to_string(),
            detail: e.to_string(),
        })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, BrokerError> {
        let url = self.endpoint(path)?;
        let resp = self
            .http
            .get(url)
            .bearer_auth(&self.api_key)
            .query(query)
            .send()
            .await?;
        Self::read(path, resp).await
    }

    /// Loads the tradable currency instruments and returns those whose both
    /// currencies are monitored. Later orders only use loaded instruments.
    pub async fn load_instruments(
        &mut self,
        monitored: &[CurrencyCode],
    ) -> Result<Vec<Pair>, BrokerError> {
        let path = format!("v3/accounts/{}/instruments", self.account_id);
        let resp: InstrumentsResponse = self.get(&path, &[]).await?;
        let wanted: HashSet<CurrencyCode> = monitored.iter().copied().collect();

        self.instruments.clear();
        let mut pairs = Vec::new();
        for inst in resp.instruments {
            if !inst.kind.is_empty() && inst.kind != "CURRENCY" {
                continue;
            }
            let Some(pair) = pair_of(&inst.name) else {
                debug!("oanda: skipping instrument {}", inst.name);
                continue;
            };
            if wanted.contains(&pair.base) && wanted.contains(&pair.quote) {
                self.instruments.insert(inst.name);
                pairs.push(pair);
            }
        }
        pairs.sort();
        info!("oanda: {} instruments between monitored currencies", pairs.len());
        Ok(pairs)
    }

    pub fn has_instrument(&self, name: &str) -> bool {
        self.instruments.contains(name)
    }

    /// Picks the instrument and signed units that spend `amount` of `from`.
    /// Buying `to` when it is the instrument's first currency, otherwise
    /// selling `from` outright.
    fn order_for(
        &self,
        from: CurrencyCode,
        to: CurrencyCode,
        amount: f64,
        ask: Option<f64>,
    ) -> Result<(String, i64), OrderRejection> {
        let buy = format!("{to}_{from}");
        if self.has_instrument(&buy) {
            let ask = ask.ok_or_else(|| OrderRejection::new(format!("no price for {buy}")))?;
            let units = (amount / ask).floor() as i64;
            return Ok((buy, units));
        }
        let sell = format!("{from}_{to}");
        if self.has_instrument(&sell) {
            return Ok((sell, -(amount.floor() as i64)));
        }
        Err(OrderRejection::new(format!("no instrument converts {from} to {to}")))
    }
}

#[async_trait]
impl OrderSubmitter for OandaClient {
    async fn submit_order(
        &self,
        from: CurrencyCode,
        to: CurrencyCode,
        amount: f64,
    ) -> Result<Fill, OrderRejection> {
        let buying = self.has_instrument(&format!("{to}_{from}"));
        let ask = if buying {
            Some(self.fetch_quote(Pair::new(from, to)).await?.ask)
        } else {
            None
        };
        let (instrument, units) = self.order_for(from, to, amount, ask)?;
        if units == 0 {
            return Err(OrderRejection::new(format!(
                "{amount} {from} is less than one unit of {instrument}"
            )));
        }

        let path = format!("v3/accounts/{}/orders", self.account_id);
        let url = self.endpoint(&path)?;
        let body = json!({
            "order": {
                "type": "MARKET",
                "instrument": instrument,
                "units": units.to_string(),
                "timeInForce": "FOK",
                "positionFill": "DEFAULT",
            }
        });
        info!("oanda: market {} {} units", instrument, units);
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(BrokerError::from)?;
        let v: Value = Self::read(&path, resp).await?;

        let Some(fill) = v.get("orderFillTransaction") else {
            let reason = v
                .get("orderCancelTransaction")
                .and_then(|c| c.get("reason"))
                .and_then(|r| r.as_str())
                .unwrap_or("no fill transaction in response");
            warn!("oanda: {} not filled: {}", instrument, reason);
            return Err(OrderRejection::new(reason));
        };
        let price = fill
            .get("price")
            .and_then(|p| p.as_str())
            .and_then(|p| p.parse::<f64>().ok());
        let filled_units = fill
            .get("units")
            .and_then(|u| u.as_str())
            .and_then(|u| u.parse::<f64>().ok());
        let (Some(price), Some(filled_units)) = (price, filled_units) else {
            return Err(OrderRejection::new("fill without price or units"));
        };
        if price <= 0.0 || filled_units == 0.0 {
            return Err(OrderRejection::new(format!(
                "empty fill: {filled_units} units at {price}"
            )));
        }

        // buys receive the units, sells receive units priced in the second currency
        let filled_amount = if units > 0 {
            filled_units.abs()
        } else {
            filled_units.abs() * price
        };
        Ok(Fill {
            filled_amount,
            price: Some(price),
        })
    }
}

#[async_trait]
impl Broker for OandaClient {
    /// Latest 5-second candle close, bid and ask sides.
    async fn fetch_quote(&self, pair: Pair) -> Result<Quote, BrokerError> {
        // either orientation may be the listed one
        let direct = instrument_name(pair);
        let direct_listed = self.instruments.is_empty() || self.has_instrument(&direct);
        let (instrument, inverted) = if direct_listed {
            (direct, false)
        } else {
            (instrument_name(pair.inverse()), true)
        };
        let path = format!("v3/instruments/{instrument}/candles");
        let resp: CandlesResponse = self
            .get(&path, &[("count", "1"), ("price", "BA"), ("granularity", "S5")])
            .await?;
        let candle = resp.candles.last().ok_or_else(|| BrokerError::Decode {
            endpoint: path.clone(),
            detail: "no candles".to_string(),
        })?;
        let (Some(bid), Some(ask)) = (&candle.bid, &candle.ask) else {
            return Err(BrokerError::Decode {
                endpoint: path,
                detail: "candle lacks bid or ask".to_string(),
            });
        };
        let bid = parse_num(&path, "bid.c", &bid.c)?;
        let ask = parse_num(&path, "ask.c", &ask.c)?;
        let listed = if inverted { pair.inverse() } else { pair };
        let quote = Quote::new(
            listed.base,
            listed.quote,
            bid,
            ask,
            candle.time.unwrap_or_else(Utc::now),
        )?;
        Ok(if inverted { quote.inverse() } else { quote })
    }

    async fn account_balance(&self) -> Result<Balance, BrokerError> {
        let path = format!("v3/accounts/{}/summary", self.account_id);
        let resp: SummaryResponse = self.get(&path, &[]).await?;
        Ok(Balance {
            balance: parse_num(&path, "balance", &resp.account.balance)?,
            available_margin: parse_num(&path, "marginAvailable", &resp.account.margin_available)?,
        })
    }
}
