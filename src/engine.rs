//! Detect, decide, execute: one pass at a time.
//!
//! A pass fetches one snapshot, finds and ranks cycles on it, walks the
//! ranking through the risk gate and executes at most one approved cycle
//! before the next pass starts. Stop requests are only looked at between
//! passes, so an in-flight trade always runs to `Completed` or `Aborted`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::account::{AccountState, AccountView};
use crate::broker::{fetch_snapshot, Balance, Broker};
use crate::config::Policy;
use crate::cycles::{rank, select, CycleFinder};
use crate::error::EngineError;
use crate::execution::{
    ExecutionCoordinator, ExecutionMode, SimulatedFills, TradeRecord, TradeStatus,
};
use crate::graph::RateGraph;
use crate::history::{PerformanceSummary, TradeSink};
use crate::models::Pair;
use crate::risk::{evaluate, Decision, RejectReason};
use crate::session::{Session, SessionTag};
use crate::utils::pct;

#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    /// A quiet session with no recent sighting; nothing was fetched.
    SessionGated {
        session: SessionTag,
    },
    NoOpportunity,
    /// Every ranked opportunity that could be valued was turned down.
    Rejected {
        evaluated: usize,
        last_reason: RejectReason,
    },
    Traded(Box<TradeRecord>),
}

/// Cloneable stop signal shared with the control surface and ctrl-c.
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        if !self.tx.send_replace(true) {
            info!("stop requested, finishing after the current pass");
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LastTrade {
    pub id: u64,
    pub cycle: String,
    pub status: TradeStatus,
    pub realized_pnl: f64,
    pub closed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub mode: ExecutionMode,
    pub account: AccountView,
    pub passes: u64,
    pub halted: Option<String>,
    pub stopped: bool,
    /// Current value, after any adaptation.
    pub min_profit_threshold: f64,
    /// Pairs that could not be priced on the latest pass.
    pub failed_pairs: usize,
    pub last_trade: Option<LastTrade>,
    pub performance: PerformanceSummary,
}

pub type SharedStatus = Arc<RwLock<EngineStatus>>;

pub struct Engine {
    policy: Policy,
    broker: Arc<dyn Broker>,
    pairs: Vec<Pair>,
    coordinator: ExecutionCoordinator,
    journal: Option<Box<dyn TradeSink>>,
    summary: PerformanceSummary,
    max_concurrent: usize,
    stop: StopHandle,
    status: SharedStatus,
    halted: Option<String>,
    passes: u64,
    failed_pairs: usize,
    /// Last time a cycle cleared the threshold.
    last_opportunity_at: Option<DateTime<Utc>>,
    /// `(realized_return, slippage)` of recent completed trades.
    recent_trades: VecDeque<(f64, f64)>,
}

impl Engine {
    pub fn new(
        policy: Policy,
        broker: Arc<dyn Broker>,
        pairs: Vec<Pair>,
        mode: ExecutionMode,
        balance: Balance,
        started_at: DateTime<Utc>,
    ) -> Self {
        let account = AccountState::new(
            balance.balance,
            balance.available_margin,
            started_at,
            policy.loss_window,
            policy.slippage_window,
        );
        let coordinator =
            ExecutionCoordinator::new(account, policy.account_currency, policy.loss_window, mode);
        let status = Arc::new(RwLock::new(EngineStatus {
            mode,
            account: coordinator.account(),
            passes: 0,
            halted: None,
            stopped: false,
            min_profit_threshold: policy.min_profit_threshold,
            failed_pairs: 0,
            last_trade: None,
            performance: PerformanceSummary::default(),
        }));
        Self {
            policy,
            broker,
            pairs,
            coordinator,
            journal: None,
            summary: PerformanceSummary::default(),
            max_concurrent: 10,
            stop: StopHandle::new(),
            status,
            halted: None,
            passes: 0,
            failed_pairs: 0,
            last_opportunity_at: None,
            recent_trades: VecDeque::new(),
        }
    }

    pub fn with_journal(mut self, journal: Box<dyn TradeSink>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn status(&self) -> SharedStatus {
        Arc::clone(&self.status)
    }

    pub fn summary(&self) -> &PerformanceSummary {
        &self.summary
    }

    pub fn account(&self) -> AccountView {
        self.coordinator.account()
    }

    pub async fn run_once(&mut self) -> Result<PassOutcome, EngineError> {
        self.run_once_at(Utc::now()).await
    }

    /// One pass with an injected clock for session and loss-window decisions.
    pub async fn run_once_at(&mut self, now: DateTime<Utc>) -> Result<PassOutcome, EngineError> {
        if let Some(reason) = &self.halted {
            return Err(EngineError::Halted(reason.clone()));
        }
        self.passes += 1;
        let result = self.pass(now).await;
        self.publish().await;
        result
    }

    async fn pass(&mut self, now: DateTime<Utc>) -> Result<PassOutcome, EngineError> {
        self.coordinator.roll_loss_window(now);
        let session = Session::resolve(
            now,
            &self.policy.sessions,
            &self.policy.session_multipliers,
        );
        if !self.session_open(session.tag, now) {
            info!(
                "{} session with no opportunity in the last {}s, waiting",
                session.tag, self.policy.quiet_session_recency_secs
            );
            return Ok(PassOutcome::SessionGated {
                session: session.tag,
            });
        }

        if self.coordinator.mode() == ExecutionMode::Live {
            let balance = self.broker.account_balance().await?;
            self.coordinator
                .sync_balance(balance.balance, balance.available_margin);
        }

        let broker = Arc::clone(&self.broker);
        let fetched = fetch_snapshot(broker.as_ref(), &self.pairs, self.max_concurrent, now).await;
        self.failed_pairs = fetched.failures.len();
        if fetched.snapshot.is_empty() {
            warn!("pass {}: no pair could be priced", self.passes);
            return Ok(PassOutcome::NoOpportunity);
        }
        let graph = RateGraph::build_filtered(&fetched.snapshot, self.policy.max_relative_spread);
        debug!(
            "pass {}: snapshot at {}, {} currencies, {} edges",
            self.passes,
            fetched.snapshot.captured_at(),
            graph.currencies().count(),
            graph.edge_count()
        );

        let finder = CycleFinder::new(self.policy.max_length)
            .with_fee_per_leg(self.policy.fee_per_leg);
        let ranked = select(
            rank(finder.find(&graph, &self.policy.currencies_to_monitor)),
            self.policy.cycle_selection,
        );
        if ranked.is_empty() {
            debug!("pass {}: no profitable cycle", self.passes);
            return Ok(PassOutcome::NoOpportunity);
        }
        if ranked[0].net_yield >= self.policy.min_profit_threshold {
            self.last_opportunity_at = Some(now);
        }

        let account = self.coordinator.account();
        let account_currency = self.policy.account_currency;
        let mut evaluated = 0;
        let mut last_reason = None;

        for opportunity in ranked {
            if graph.convert(1.0, account_currency, opportunity.start()).is_none() {
                debug!(
                    "skipping {}: no {}/{} rate to size it",
                    opportunity.cycle,
                    account_currency,
                    opportunity.start()
                );
                continue;
            }
            evaluated += 1;
            match evaluate(&opportunity, &account, &self.policy, &session) {
                Decision::Rejected(reason) => {
                    info!(
                        "{} ({}) rejected: {}",
                        opportunity.cycle,
                        pct(opportunity.net_yield),
                        reason
                    );
                    // ranked by net yield, so the rest fail the same checks
                    last_reason = Some(reason);
                    break;
                }
                Decision::Approved(sizing) => {
                    info!(
                        "{} ({} legs) approved in {} session: {:.2} {}",
                        opportunity.cycle,
                        opportunity.cycle.leg_count(),
                        session.tag,
                        sizing.notional,
                        account_currency
                    );
                    let record = match self.coordinator.mode() {
                        ExecutionMode::Live => {
                            self.coordinator
                                .execute(opportunity, sizing, &graph, broker.as_ref())
                                .await
                        }
                        ExecutionMode::Simulated => {
                            let fills = SimulatedFills::new(graph.clone());
                            self.coordinator
                                .execute(opportunity, sizing, &graph, &fills)
                                .await
                        }
                    };
                    return self.finish(record).await;
                }
            }
        }

        match last_reason {
            Some(last_reason) => Ok(PassOutcome::Rejected {
                evaluated,
                last_reason,
            }),
            None => Ok(PassOutcome::NoOpportunity),
        }
    }

    async fn finish(&mut self, record: TradeRecord) -> Result<PassOutcome, EngineError> {
        if let Some(journal) = self.journal.as_mut() {
            if let Err(e) = journal.append(&record) {
                error!("trade #{} not journaled: {}", record.id, e);
            }
        }
        self.summary.record(&record);
        if record.status == TradeStatus::Completed {
            self.adapt_threshold(&record);
        }
        {
            let mut status = self.status.write().await;
            status.last_trade = Some(LastTrade {
                id: record.id,
                cycle: record.opportunity.cycle.to_string(),
                status: record.status,
                realized_pnl: record.realized_pnl,
                closed_at: record.closed_at,
            });
        }

        if record.status.unrecovered_exposure() {
            let (currency, amount) = record
                .unwind
                .as_ref()
                .map(|u| (u.open_currency, u.open_amount))
                .unwrap_or((record.opportunity.start(), record.start_amount));
            let err = EngineError::UnwindFailed {
                trade_id: record.id,
                currency,
                amount,
            };
            self.halted = Some(err.to_string());
            return Err(err);
        }
        Ok(PassOutcome::Traded(Box::new(record)))
    }

    /// Quiet sessions only trade within `quiet_session_recency_secs` of the
    /// last sighting.
    fn session_open(&self, tag: SessionTag, now: DateTime<Utc>) -> bool {
        if !self.policy.quiet_sessions.contains(&tag) {
            return true;
        }
        let recency = i64::try_from(self.policy.quiet_session_recency_secs).unwrap_or(i64::MAX);
        self.last_opportunity_at.is_some_and(|seen| (now - seen).num_seconds() < recency)
    }

    fn adapt_threshold(&mut self, record: &TradeRecord) {
        let (Some(realized), Some(slippage)) = (record.realized_return(), record.slippage) else {
            return;
        };
        let adaptation = self.policy.threshold_adaptation;
        self.recent_trades.push_back((realized, slippage));
        while self.recent_trades.len() > adaptation.lookback.max(1) {
            self.recent_trades.pop_front();
        }

        let current = self.policy.min_profit_threshold;
        let next = adaptation.adjust(current, self.recent_trades.make_contiguous());
        if next != current {
            info!(
                "min profit threshold {} -> {} after {} recent trades",
                pct(current),
                pct(next),
                self.recent_trades.len()
            );
            self.policy.min_profit_threshold = next;
        }
    }

    async fn publish(&self) {
        let mut status = self.status.write().await;
        status.account = self.coordinator.account();
        status.passes = self.passes;
        status.halted = self.halted.clone();
        status.stopped = self.stop.is_stopped();
        status.min_profit_threshold = self.policy.min_profit_threshold;
        status.failed_pairs = self.failed_pairs;
        status.performance = self.summary.clone();
    }

    /// Runs passes every `check_interval` seconds, twice that after a trade or
    /// a gated session. Ends on stop, halt or `max_runtime`.
    pub async fn run(&mut self, max_runtime: Option<Duration>) -> Result<(), EngineError> {
        let started = Instant::now();
        let interval = Duration::from_secs(self.policy.check_interval);
        let mut stop_rx = self.stop.subscribe();
        info!(
            "engine running: {:?} mode, {} pairs, every {:?}",
            self.coordinator.mode(),
            self.pairs.len(),
            interval
        );

        let result = loop {
            if self.stop.is_stopped() {
                info!("engine stopped after {} passes", self.passes);
                break Ok(());
            }
            if let Some(limit) = max_runtime {
                if started.elapsed() >= limit {
                    info!("max runtime of {:?} reached", limit);
                    break Ok(());
                }
            }

            let wait = match self.run_once().await {
                Ok(PassOutcome::Traded(_) | PassOutcome::SessionGated { .. }) => interval * 2,
                Ok(_) => interval,
                Err(EngineError::Broker(e)) => {
                    warn!("pass {} skipped: {}", self.passes, e);
                    interval
                }
                Err(e) => {
                    error!("halting: {}", e);
                    self.stop.stop();
                    break Err(e);
                }
            };
            let wait = match max_runtime {
                Some(limit) => wait.min(limit.saturating_sub(started.elapsed())),
                None => wait,
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = stop_rx.changed() => {}
            }
        };

        self.publish().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::FakeBroker;
    use crate::history::MemoryJournal;
    use crate::models::{ccy, quote, CurrencyCode, Quote};
    use chrono::TimeZone;
    use std::sync::atomic::Ordering;

    fn at(hour: u32) -> DateTime<Utc> {
        at_min(hour, 0)
    }

    fn at_min(hour: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, hour, min, 0).unwrap()
    }

    fn profitable() -> Vec<Quote> {
        vec![
            quote("USD", "EUR", 0.899, 0.90),
            quote("EUR", "GBP", 0.849, 0.85),
            quote("GBP", "USD", 1.299, 1.30),
        ]
    }

    fn policy() -> Policy {
        Policy {
            currencies_to_monitor: vec![ccy("USD"), ccy("EUR"), ccy("GBP")],
            check_interval: 1,
            ..Policy::default()
        }
    }

    fn engine(broker: Arc<FakeBroker>, mode: ExecutionMode) -> Engine {
        engine_with(policy(), broker, mode)
    }

    fn engine_with(policy: Policy, broker: Arc<FakeBroker>, mode: ExecutionMode) -> Engine {
        let pairs = broker.pairs();
        Engine::new(
            policy,
            broker,
            pairs,
            mode,
            Balance {
                balance: 5_000.0,
                available_margin: 5_000.0,
            },
            at(0),
        )
        .with_journal(Box::new(MemoryJournal::default()))
    }

    #[tokio::test]
    async fn simulated_pass_trades_the_best_cycle() {
        let broker = Arc::new(FakeBroker::new(profitable(), 5_000.0));
        let mut eng = engine(Arc::clone(&broker), ExecutionMode::Simulated);

        let outcome = eng.run_once_at(at(14)).await.unwrap();
        let PassOutcome::Traded(record) = outcome else {
            panic!("expected a trade, got {outcome:?}");
        };
        assert_eq!(record.status, TradeStatus::Completed);
        assert_eq!(record.mode, ExecutionMode::Simulated);
        // 2% of 5000 in the london/new york overlap
        assert!((record.sizing.notional - 120.0).abs() < 1e-9);
        assert!(record.realized_pnl > 0.0);
        // simulated fills never reach the venue
        assert!(broker.orders.lock().unwrap().is_empty());

        let status = eng.status();
        let status = status.read().await;
        assert_eq!(status.passes, 1);
        assert_eq!(status.last_trade.as_ref().unwrap().id, record.id);
        assert_eq!(status.performance.total_trades, 1);
        assert!(status.account.balance > 5_000.0);
    }

    #[tokio::test]
    async fn unprofitable_market_has_no_opportunity() {
        let broker = Arc::new(FakeBroker::new(
            [
                // mids multiply to about one, so the spread loses either way
                quote("USD", "EUR", 0.8995, 0.9005),
                quote("EUR", "GBP", 0.8495, 0.8505),
                quote("GBP", "USD", 1.3065, 1.3085),
            ],
            5_000.0,
        ));
        let mut eng = engine(broker, ExecutionMode::Simulated);
        assert_eq!(eng.run_once_at(at(10)).await.unwrap(), PassOutcome::NoOpportunity);
    }

    #[tokio::test]
    async fn losing_streak_trips_the_breaker() {
        let broker = Arc::new(FakeBroker::new(profitable(), 5_000.0));
        broker
            .refuse
            .lock()
            .unwrap()
            .push((ccy("GBP"), ccy("USD")));
        let mut eng = engine(Arc::clone(&broker), ExecutionMode::Live);

        for _ in 0..3 {
            let outcome = eng.run_once_at(at(10)).await.unwrap();
            let PassOutcome::Traded(record) = outcome else {
                panic!("expected an aborted trade, got {outcome:?}");
            };
            assert!(matches!(record.status, TradeStatus::Aborted { unrecovered_exposure: false }));
        }
        assert_eq!(eng.account().consecutive_losses, 3);
        assert!(!broker.orders.lock().unwrap().is_empty());

        match eng.run_once_at(at(11)).await.unwrap() {
            PassOutcome::Rejected { last_reason, evaluated } => {
                assert_eq!(last_reason, RejectReason::ConsecutiveLossLimit);
                assert_eq!(evaluated, 1);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_unwind_halts_until_restart() {
        let broker = Arc::new(FakeBroker::new(profitable(), 5_000.0));
        *broker.order_budget.lock().unwrap() = Some(1);
        let mut eng = engine(Arc::clone(&broker), ExecutionMode::Live);

        match eng.run_once_at(at(10)).await {
            Err(EngineError::UnwindFailed { amount, .. }) => assert!(amount > 0.0),
            other => panic!("expected unwind failure, got {other:?}"),
        }
        assert!(matches!(
            eng.run_once_at(at(10)).await,
            Err(EngineError::Halted(_))
        ));
        let status = eng.status();
        assert!(status.read().await.halted.is_some());
        assert_eq!(eng.summary().total_trades, 1);
    }

    #[tokio::test]
    async fn unvaluable_start_currencies_are_skipped() {
        let mut p = policy();
        p.account_currency = CurrencyCode::new("JPY").unwrap();
        p.currencies_to_monitor.push(p.account_currency);
        let broker = Arc::new(FakeBroker::new(profitable(), 5_000.0));
        let pairs = broker.pairs();
        let mut eng = Engine::new(
            p,
            broker,
            pairs,
            ExecutionMode::Simulated,
            Balance {
                balance: 5_000.0,
                available_margin: 5_000.0,
            },
            at(0),
        );
        assert_eq!(eng.run_once_at(at(10)).await.unwrap(), PassOutcome::NoOpportunity);
    }

    #[tokio::test]
    async fn stop_is_honoured_between_passes() {
        let broker = Arc::new(FakeBroker::new(profitable(), 5_000.0));
        let mut eng = engine(broker, ExecutionMode::Simulated);
        let handle = eng.stop_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.stop();
        });

        tokio::time::timeout(Duration::from_secs(5), eng.run(None))
            .await
            .expect("run should end on stop")
            .unwrap();
        let status = eng.status();
        let status = status.read().await;
        assert!(status.stopped);
        assert_eq!(status.passes, 1);
    }

    #[tokio::test]
    async fn max_runtime_ends_the_loop() {
        let broker = Arc::new(FakeBroker::new(profitable(), 5_000.0));
        // runs on the wall clock, so no session may be gated
        let p = Policy {
            quiet_sessions: Vec::new(),
            ..policy()
        };
        let mut eng = engine_with(p, broker, ExecutionMode::Simulated);
        tokio::time::timeout(Duration::from_secs(5), eng.run(Some(Duration::from_millis(20))))
            .await
            .expect("run should end at max runtime")
            .unwrap();
        assert!(eng.summary().total_trades >= 1);
    }

    #[tokio::test]
    async fn stopped_engine_runs_no_pass() {
        let broker = Arc::new(FakeBroker::new(profitable(), 5_000.0));
        let mut eng = engine(broker, ExecutionMode::Simulated);
        eng.stop_handle().stop();
        eng.run(None).await.unwrap();
        assert_eq!(eng.status().read().await.passes, 0);
    }

    #[tokio::test]
    async fn quiet_sessions_wait_for_a_recent_sighting() {
        let broker = Arc::new(FakeBroker::new(profitable(), 5_000.0));
        let mut eng = engine(Arc::clone(&broker), ExecutionMode::Simulated);

        assert_eq!(
            eng.run_once_at(at(23)).await.unwrap(),
            PassOutcome::SessionGated {
                session: SessionTag::LowLiquidity
            }
        );
        assert_eq!(
            eng.run_once_at(at(3)).await.unwrap(),
            PassOutcome::SessionGated {
                session: SessionTag::Tokyo
            }
        );
        // gated passes never price anything
        assert_eq!(broker.peak_in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(eng.status().read().await.passes, 2);
    }

    #[tokio::test]
    async fn recent_sighting_opens_a_quiet_session() {
        let broker = Arc::new(FakeBroker::new(profitable(), 5_000.0));
        let mut eng = engine(broker, ExecutionMode::Simulated);

        let seen = eng.run_once_at(at_min(21, 58)).await.unwrap();
        assert!(matches!(seen, PassOutcome::Traded(_)), "{seen:?}");

        // three minutes later, low liquidity but still within 300s
        let PassOutcome::Traded(record) = eng.run_once_at(at_min(22, 1)).await.unwrap() else {
            panic!("expected a trade in the quiet session");
        };
        assert_eq!(record.sizing.session, SessionTag::LowLiquidity);
        assert_eq!(record.sizing.multiplier, 0.5);

        // nine minutes after the last sighting
        assert_eq!(
            eng.run_once_at(at_min(22, 10)).await.unwrap(),
            PassOutcome::SessionGated {
                session: SessionTag::LowLiquidity
            }
        );
    }

    #[tokio::test]
    async fn active_sessions_never_wait() {
        for hour in [8, 10, 14, 18] {
            let broker = Arc::new(FakeBroker::new(profitable(), 5_000.0));
            let mut eng = engine(broker, ExecutionMode::Simulated);
            let outcome = eng.run_once_at(at(hour)).await.unwrap();
            assert!(matches!(outcome, PassOutcome::Traded(_)), "hour {hour}: {outcome:?}");
        }
    }

    #[tokio::test]
    async fn clean_wins_lower_the_threshold() {
        let broker = Arc::new(FakeBroker::new(profitable(), 5_000.0));
        let mut eng = engine(broker, ExecutionMode::Simulated);

        for expected in [0.0009, 0.00081, 0.0008] {
            let outcome = eng.run_once_at(at(10)).await.unwrap();
            assert!(matches!(outcome, PassOutcome::Traded(_)), "{outcome:?}");
            let status = eng.status();
            let threshold = status.read().await.min_profit_threshold;
            assert!((threshold - expected).abs() < 1e-12, "{threshold} vs {expected}");
        }
    }

    #[tokio::test]
    async fn losing_completed_trade_raises_the_threshold() {
        let broker = Arc::new(FakeBroker::new(profitable(), 5_000.0));
        *broker.fill_haircut.lock().unwrap() = 0.01;
        let mut eng = engine(Arc::clone(&broker), ExecutionMode::Live);

        let PassOutcome::Traded(record) = eng.run_once_at(at(10)).await.unwrap() else {
            panic!("expected a completed losing trade");
        };
        assert_eq!(record.status, TradeStatus::Completed);
        assert!(record.realized_return().unwrap() < 0.0);
        let status = eng.status();
        assert!((status.read().await.min_profit_threshold - 0.0012).abs() < 1e-12);
    }

    #[tokio::test]
    async fn aborted_trades_leave_the_threshold_alone() {
        let broker = Arc::new(FakeBroker::new(profitable(), 5_000.0));
        broker
            .refuse
            .lock()
            .unwrap()
            .push((ccy("USD"), ccy("EUR")));
        let mut eng = engine(Arc::clone(&broker), ExecutionMode::Live);
        let PassOutcome::Traded(record) = eng.run_once_at(at(10)).await.unwrap() else {
            panic!("expected an aborted trade");
        };
        assert!(matches!(record.status, TradeStatus::Aborted { .. }));
        assert_eq!(eng.status().read().await.min_profit_threshold, 0.001);
    }

    #[tokio::test]
    async fn unpriced_pairs_are_counted() {
        let broker = Arc::new(FakeBroker::new(profitable(), 5_000.0));
        let mut pairs = broker.pairs();
        pairs.push(Pair::new(ccy("USD"), CurrencyCode::new("JPY").unwrap()));
        let mut eng = Engine::new(
            policy(),
            broker,
            pairs,
            ExecutionMode::Simulated,
            Balance {
                balance: 5_000.0,
                available_margin: 5_000.0,
            },
            at(0),
        );
        let outcome = eng.run_once_at(at(10)).await.unwrap();
        assert!(matches!(outcome, PassOutcome::Traded(_)), "{outcome:?}");
        assert_eq!(eng.status().read().await.failed_pairs, 1);
    }

    #[tokio::test]
    async fn empty_snapshot_has_no_opportunity() {
        let broker = Arc::new(FakeBroker::new(Vec::new(), 5_000.0));
        let pairs = profitable().iter().map(Quote::pair).collect();
        let mut eng = Engine::new(
            policy(),
            broker,
            pairs,
            ExecutionMode::Simulated,
            Balance {
                balance: 5_000.0,
                available_margin: 5_000.0,
            },
            at(0),
        );
        assert_eq!(eng.run_once_at(at(10)).await.unwrap(), PassOutcome::NoOpportunity);
        assert_eq!(eng.status().read().await.failed_pairs, 3);
    }
}
