//! Leg sequencing for approved cycles.
//!
//! Legs run strictly in cycle order because each leg spends what the previous
//! one received. A refused leg is never retried: the trade aborts and, when
//! earlier legs already filled, the coordinator tries to convert the holding
//! back to the start currency. The unwind goes through the same
//! [`OrderSubmitter`] as the legs, so an unwind that fails ends up in the
//! [`TradeRecord`] as open exposure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::account::{AccountState, AccountView, LossWindow};
use crate::cycles::Opportunity;
use crate::error::OrderRejection;
use crate::graph::RateGraph;
use crate::models::{CurrencyCode, Fill};
use crate::risk::Sizing;
use crate::utils::pct;

/// The trade-submission seam. Live trading goes to the broker, demo mode
/// fills from the detection snapshot.
#[async_trait]
pub trait OrderSubmitter: Send + Sync {
    /// Converts `amount` of `from` into `to`.
    async fn submit_order(
        &self,
        from: CurrencyCode,
        to: CurrencyCode,
        amount: f64,
    ) -> Result<Fill, OrderRejection>;
}

/// Synthesizes fills at the graph's edge rates.
#[derive(Debug, Clone)]
pub struct SimulatedFills {
    graph: RateGraph,
}

impl SimulatedFills {
    pub fn new(graph: RateGraph) -> Self {
        Self { graph }
    }
}

#[async_trait]
impl OrderSubmitter for SimulatedFills {
    async fn submit_order(
        &self,
        from: CurrencyCode,
        to: CurrencyCode,
        amount: f64,
    ) -> Result<Fill, OrderRejection> {
        let edge = self
            .graph
            .edge(from, to)
            .ok_or_else(|| OrderRejection::new(format!("no {from}/{to} market in snapshot")))?;
        Ok(Fill {
            filled_amount: amount * edge.rate,
            price: Some(1.0 / edge.rate),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Live,
    Simulated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecState {
    Pending,
    LegSubmitted(usize),
    LegFilled(usize),
    Unwinding,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum LegResult {
    Filled { filled_amount: f64, price: Option<f64> },
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegOutcome {
    pub from: CurrencyCode,
    pub to: CurrencyCode,
    pub input_amount: f64,
    /// What the detection rates promised for this leg.
    pub expected_amount: Option<f64>,
    #[serde(flatten)]
    pub result: LegResult,
}

impl LegOutcome {
    pub fn filled_amount(&self) -> Option<f64> {
        match self.result {
            LegResult::Filled { filled_amount, .. } => Some(filled_amount),
            LegResult::Rejected { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnwindReport {
    pub attempts: Vec<LegOutcome>,
    /// Start-currency amount recovered, when the unwind got all the way back.
    pub recovered_amount: Option<f64>,
    /// What was still held when the unwind stopped.
    pub open_currency: CurrencyCode,
    pub open_amount: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TradeStatus {
    Completed,
    Aborted { unrecovered_exposure: bool },
}

impl TradeStatus {
    pub fn unrecovered_exposure(&self) -> bool {
        matches!(
            self,
            TradeStatus::Aborted {
                unrecovered_exposure: true
            }
        )
    }
}

/// Immutable outcome of one executed or aborted opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: u64,
    pub mode: ExecutionMode,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub opportunity: Opportunity,
    pub sizing: Sizing,
    /// Notional converted into the cycle's start currency.
    pub start_amount: f64,
    pub final_amount: Option<f64>,
    pub leg_outcomes: Vec<LegOutcome>,
    pub unwind: Option<UnwindReport>,
    /// In the account currency. Zero when the outcome is unknown.
    pub realized_pnl: f64,
    /// Expected net yield minus realized return, for completed or unwound trades.
    pub slippage: Option<f64>,
    pub status: TradeStatus,
}

impl TradeRecord {
    /// Final over start amount, for trades that ended back in the start currency.
    pub fn realized_return(&self) -> Option<f64> {
        self.final_amount.map(|f| f / self.start_amount - 1.0)
    }
}

/// Owns the account and is its only writer.
pub struct ExecutionCoordinator {
    account: AccountState,
    account_currency: CurrencyCode,
    loss_window: LossWindow,
    mode: ExecutionMode,
    next_id: u64,
}

impl ExecutionCoordinator {
    pub fn new(
        account: AccountState,
        account_currency: CurrencyCode,
        loss_window: LossWindow,
        mode: ExecutionMode,
    ) -> Self {
        Self {
            account,
            account_currency,
            loss_window,
            mode,
            next_id: 1,
        }
    }

    pub fn account(&self) -> AccountView {
        self.account.view()
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Called at the start of each decision.
    pub fn roll_loss_window(&mut self, now: DateTime<Utc>) -> bool {
        let rolled = self.account.roll_loss_window(now, self.loss_window);
        if rolled {
            info!("daily loss window reset at {}", now);
        }
        rolled
    }

    pub fn sync_balance(&mut self, balance: f64, available_margin: f64) {
        self.account.sync_balance(balance, available_margin);
    }

    /// Runs one approved opportunity to `Completed` or `Aborted` and books
    /// the outcome. `graph` is the one the opportunity was detected on.
    pub async fn execute<S>(
        &mut self,
        opportunity: Opportunity,
        sizing: Sizing,
        graph: &RateGraph,
        submitter: &S,
    ) -> TradeRecord
    where
        S: OrderSubmitter + ?Sized,
    {
        let id = self.next_id;
        self.next_id += 1;
        let opened_at = Utc::now();
        let start = opportunity.start();
        let mut state = ExecState::Pending;

        info!(
            "trade #{}: {} expected {} on {:.2} {}",
            id,
            opportunity.cycle,
            pct(opportunity.net_yield),
            sizing.notional,
            self.account_currency
        );

        let Some(start_amount) = graph.convert(sizing.notional, self.account_currency, start)
        else {
            warn!(
                "trade #{}: cannot value {} in {}, aborting before first leg",
                id, self.account_currency, start
            );
            self.account.record_outcome(0.0, None);
            return self.record(id, opened_at, opportunity, sizing, 0.0, aborted(false));
        };

        let mut holding = start_amount;
        let mut leg_outcomes = Vec::with_capacity(opportunity.legs.len());
        let mut failed_at = None;

        for (i, leg) in opportunity.legs.iter().enumerate() {
            state = transition(id, state, ExecState::LegSubmitted(i));
            let expected = Some(holding * leg.rate);
            let outcome = submit(submitter, leg.from, leg.to, holding, expected).await;
            let filled = outcome.filled_amount();
            leg_outcomes.push(outcome);
            match filled {
                Some(amount) => {
                    state = transition(id, state, ExecState::LegFilled(i));
                    holding = amount;
                }
                None => {
                    failed_at = Some(i);
                    break;
                }
            }
        }

        let Some(failed) = failed_at else {
            transition(id, state, ExecState::Completed);
            let realized_return = holding / start_amount - 1.0;
            let pnl = self.to_account(graph, holding - start_amount, start);
            let slippage = opportunity.net_yield - realized_return;
            self.account.record_outcome(pnl, Some(slippage));
            info!(
                "trade #{} completed: {:.2} {} -> {:.2} {}, pnl {:.4} {} ({})",
                id,
                start_amount,
                start,
                holding,
                start,
                pnl,
                self.account_currency,
                pct(realized_return)
            );
            let status = TradeStatus::Completed;
            return TradeRecord {
                final_amount: Some(holding),
                leg_outcomes,
                realized_pnl: pnl,
                slippage: Some(slippage),
                ..self.record(id, opened_at, opportunity, sizing, start_amount, status)
            };
        };

        warn!("trade #{}: leg {} failed, aborting", id, failed + 1);
        if failed == 0 {
            transition(id, state, ExecState::Aborted);
            self.account.record_outcome(0.0, None);
            return TradeRecord {
                leg_outcomes,
                ..self.record(id, opened_at, opportunity, sizing, start_amount, aborted(false))
            };
        }

        state = transition(id, state, ExecState::Unwinding);
        let report = unwind(submitter, &opportunity, failed, holding).await;
        transition(id, state, ExecState::Aborted);

        match report.recovered_amount {
            Some(recovered) => {
                let realized_return = recovered / start_amount - 1.0;
                let pnl = self.to_account(graph, recovered - start_amount, start);
                let slippage = opportunity.net_yield - realized_return;
                self.account.record_outcome(pnl, Some(slippage));
                warn!(
                    "trade #{} unwound: recovered {:.2} of {:.2} {}, pnl {:.4} {}",
                    id, recovered, start_amount, start, pnl, self.account_currency
                );
                TradeRecord {
                    final_amount: Some(recovered),
                    leg_outcomes,
                    unwind: Some(report),
                    realized_pnl: pnl,
                    slippage: Some(slippage),
                    ..self.record(id, opened_at, opportunity, sizing, start_amount, aborted(false))
                }
            }
            None => {
                self.account.record_unresolved();
                error!(
                    "trade #{}: UNWIND FAILED, {:.4} {} still open",
                    id, report.open_amount, report.open_currency
                );
                TradeRecord {
                    leg_outcomes,
                    unwind: Some(report),
                    ..self.record(id, opened_at, opportunity, sizing, start_amount, aborted(true))
                }
            }
        }
    }

    fn to_account(&self, graph: &RateGraph, amount: f64, from: CurrencyCode) -> f64 {
        match graph.convert(amount, from, self.account_currency) {
            Some(v) => v,
            None => {
                warn!(
                    "no {}/{} rate to value pnl, booking it unconverted",
                    from, self.account_currency
                );
                amount
            }
        }
    }

    /// A record with no fills, no unwind and nothing booked.
    fn record(
        &self,
        id: u64,
        opened_at: DateTime<Utc>,
        opportunity: Opportunity,
        sizing: Sizing,
        start_amount: f64,
        status: TradeStatus,
    ) -> TradeRecord {
        TradeRecord {
            id,
            mode: self.mode,
            opened_at,
            closed_at: Utc::now(),
            opportunity,
            sizing,
            start_amount,
            final_amount: None,
            leg_outcomes: Vec::new(),
            unwind: None,
            realized_pnl: 0.0,
            slippage: None,
            status,
        }
    }
}

fn aborted(unrecovered_exposure: bool) -> TradeStatus {
    TradeStatus::Aborted {
        unrecovered_exposure,
    }
}

fn transition(id: u64, from: ExecState, to: ExecState) -> ExecState {
    debug!("trade #{}: {:?} -> {:?}", id, from, to);
    to
}

async fn submit<S>(
    submitter: &S,
    from: CurrencyCode,
    to: CurrencyCode,
    amount: f64,
    expected_amount: Option<f64>,
) -> LegOutcome
where
    S: OrderSubmitter + ?Sized,
{
    let result = match submitter.submit_order(from, to, amount).await {
        Ok(fill) if fill.filled_amount.is_finite() && fill.filled_amount > 0.0 => {
            LegResult::Filled {
                filled_amount: fill.filled_amount,
                price: fill.price,
            }
        }
        Ok(fill) => LegResult::Rejected {
            reason: format!("unusable fill amount {}", fill.filled_amount),
        },
        Err(rejection) => LegResult::Rejected {
            reason: rejection.reason,
        },
    };
    if let LegResult::Rejected { reason } = &result {
        warn!("{} -> {} for {:.4} rejected: {}", from, to, amount, reason);
    }
    LegOutcome {
        from,
        to,
        input_amount: amount,
        expected_amount,
        result,
    }
}

/// Best effort back to the start currency: first directly, then by reversing
/// the filled legs one at a time.
async fn unwind<S>(
    submitter: &S,
    opportunity: &Opportunity,
    filled_legs: usize,
    holding: f64,
) -> UnwindReport
where
    S: OrderSubmitter + ?Sized,
{
    let start = opportunity.start();
    let open_currency = opportunity.legs[filled_legs - 1].to;
    let mut attempts = Vec::new();

    let direct = submit(submitter, open_currency, start, holding, None).await;
    let recovered = direct.filled_amount();
    attempts.push(direct);
    if let Some(amount) = recovered {
        return UnwindReport {
            attempts,
            recovered_amount: Some(amount),
            open_currency: start,
            open_amount: 0.0,
        };
    }

    // with one filled leg the direct attempt already was the reversal
    let mut currency = open_currency;
    let mut amount = holding;
    if filled_legs > 1 {
        for leg in opportunity.legs[..filled_legs].iter().rev() {
            let back = submit(submitter, leg.to, leg.from, amount, None).await;
            let filled = back.filled_amount();
            attempts.push(back);
            match filled {
                Some(received) => {
                    currency = leg.from;
                    amount = received;
                }
                None => break,
            }
        }
        if currency == start {
            return UnwindReport {
                attempts,
                recovered_amount: Some(amount),
                open_currency: start,
                open_amount: 0.0,
            };
        }
    }

    UnwindReport {
        attempts,
        recovered_amount: None,
        open_currency: currency,
        open_amount: amount,
    }
}
