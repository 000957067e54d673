use serde::{Deserialize, Serialize};
use std::fmt;

use crate::account::AccountView;
use crate::config::Policy;
use crate::cycles::Opportunity;
use crate::session::{Session, SessionTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceTier {
    Small,
    Medium,
    Large,
}

/// Fraction of balance risked per trade, by account size. Balances below
/// `small_below` are small, below `medium_below` medium, the rest large.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskTiers {
    #[serde(rename = "small_account")]
    pub small: f64,
    #[serde(rename = "medium_account")]
    pub medium: f64,
    #[serde(rename = "large_account")]
    pub large: f64,
    pub small_below: f64,
    pub medium_below: f64,
}

impl Default for RiskTiers {
    fn default() -> Self {
        Self {
            small: 0.01,
            medium: 0.02,
            large: 0.03,
            small_below: 1_000.0,
            medium_below: 10_000.0,
        }
    }
}

impl RiskTiers {
    pub fn select(&self, balance: f64) -> (BalanceTier, f64) {
        if balance < self.small_below {
            (BalanceTier::Small, self.small)
        } else if balance < self.medium_below {
            (BalanceTier::Medium, self.medium)
        } else {
            (BalanceTier::Large, self.large)
        }
    }

    pub(crate) fn problems(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (name, f) in [
            ("small_account", self.small),
            ("medium_account", self.medium),
            ("large_account", self.large),
        ] {
            if !(f > 0.0 && f <= 1.0) {
                out.push(format!("risk_per_trade.{name} must be in (0, 1], got {f}"));
            }
        }
        if !(self.small_below > 0.0 && self.small_below < self.medium_below) {
            out.push(format!(
                "risk_per_trade boundaries must satisfy 0 < small_below < medium_below, got {} / {}",
                self.small_below, self.medium_below
            ));
        }
        out
    }
}

/// Moves `min_profit_threshold` after each completed trade, from the realized
/// returns and slippage of the last `lookback` completed trades.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdAdaptation {
    pub enabled: bool,
    pub lookback: usize,
    /// Applied when the average realized return is negative.
    pub raise_factor: f64,
    pub ceiling: f64,
    /// Applied when returns beat `good_return` with slippage under `good_slippage`.
    pub lower_factor: f64,
    pub floor: f64,
    pub good_return: f64,
    pub good_slippage: f64,
}

impl Default for ThresholdAdaptation {
    fn default() -> Self {
        Self {
            enabled: true,
            lookback: 5,
            raise_factor: 1.2,
            ceiling: 0.005,
            lower_factor: 0.9,
            floor: 0.0008,
            good_return: 0.002,
            good_slippage: 0.001,
        }
    }
}

impl ThresholdAdaptation {
    /// `recent` holds `(realized_return, slippage)` pairs, newest last. Only
    /// the last `lookback` count. Returns `current` when nothing applies.
    pub fn adjust(&self, current: f64, recent: &[(f64, f64)]) -> f64 {
        let window = &recent[recent.len().saturating_sub(self.lookback)..];
        if !self.enabled || window.is_empty() {
            return current;
        }
        let n = window.len() as f64;
        let avg_return = window.iter().map(|(r, _)| r).sum::<f64>() / n;
        let avg_slippage = window.iter().map(|(_, s)| s).sum::<f64>() / n;

        if avg_return < 0.0 {
            // never lowers a threshold already above the ceiling
            (current * self.raise_factor).min(self.ceiling.max(current))
        } else if avg_return > self.good_return && avg_slippage < self.good_slippage {
            (current * self.lower_factor).max(self.floor.min(current))
        } else {
            current
        }
    }

    pub(crate) fn problems(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.lookback == 0 {
            out.push("threshold_adaptation.lookback must be at least 1".to_string());
        }
        if !(self.raise_factor.is_finite() && self.raise_factor >= 1.0) {
            out.push(format!(
                "threshold_adaptation.raise_factor must be at least 1, got {}",
                self.raise_factor
            ));
        }
        if !(self.lower_factor > 0.0 && self.lower_factor <= 1.0) {
            out.push(format!(
                "threshold_adaptation.lower_factor must be in (0, 1], got {}",
                self.lower_factor
            ));
        }
        if !(self.floor >= 0.0 && self.floor <= self.ceiling) {
            out.push(format!(
                "threshold_adaptation needs 0 <= floor <= ceiling, got {} / {}",
                self.floor, self.ceiling
            ));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    BelowThreshold,
    ConsecutiveLossLimit,
    DailyLossLimit,
    ExcessiveSlippage,
    InsufficientBalance,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::BelowThreshold => "net yield below threshold",
            RejectReason::ConsecutiveLossLimit => "consecutive loss limit reached",
            RejectReason::DailyLossLimit => "daily loss limit reached",
            RejectReason::ExcessiveSlippage => "recent slippage too high",
            RejectReason::InsufficientBalance => "no balance to size a trade",
        };
        f.write_str(s)
    }
}

/// How an approved notional was arrived at. Amounts are in the account currency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sizing {
    pub tier: BalanceTier,
    pub risk_fraction: f64,
    pub base_notional: f64,
    pub session: SessionTag,
    pub multiplier: f64,
    pub notional: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Approved(Sizing),
    Rejected(RejectReason),
}

#[cfg(test)]
impl Decision {
    pub fn notional(&self) -> Option<f64> {
        match self {
            Decision::Approved(s) => Some(s.notional),
            Decision::Rejected(_) => None,
        }
    }
}

/// Go/no-go and size for one opportunity. Pure: reads its inputs only and
/// checks in a fixed order, stopping at the first failure.
pub fn evaluate(
    opportunity: &Opportunity,
    account: &AccountView,
    policy: &Policy,
    session: &Session,
) -> Decision {
    if opportunity.net_yield < policy.min_profit_threshold {
        return Decision::Rejected(RejectReason::BelowThreshold);
    }
    if account.consecutive_losses >= policy.max_consecutive_losses {
        return Decision::Rejected(RejectReason::ConsecutiveLossLimit);
    }
    if account.daily_loss_accum >= policy.daily_loss_limit_pct * account.balance {
        return Decision::Rejected(RejectReason::DailyLossLimit);
    }
    if let (Some(limit), Some(avg)) = (policy.max_avg_slippage, account.avg_recent_slippage) {
        if avg > limit {
            return Decision::Rejected(RejectReason::ExcessiveSlippage);
        }
    }

    let (tier, risk_fraction) = policy.risk_per_trade.select(account.balance);
    let base_notional = account.balance * risk_fraction;
    let cap = account
        .available_margin
        .min(account.balance)
        .min(account.balance * policy.max_position_pct);
    let notional = (base_notional * session.multiplier).min(cap);

    if !notional.is_finite() || notional <= 0.0 {
        return Decision::Rejected(RejectReason::InsufficientBalance);
    }
    Decision::Approved(Sizing {
        tier,
        risk_fraction,
        base_notional,
        session: session.tag,
        multiplier: session.multiplier,
        notional,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycles::Cycle;
    use crate::models::ccy;
    use chrono::Utc;

    fn opportunity(net_yield: f64) -> Opportunity {
        Opportunity {
            cycle: Cycle::new(vec![ccy("USD"), ccy("EUR"), ccy("GBP"), ccy("USD")]).unwrap(),
            gross_yield: net_yield + 0.001,
            cost_estimate: 0.001,
            net_yield,
            legs: Vec::new(),
        }
    }

    fn account(balance: f64) -> AccountView {
        AccountView {
            balance,
            available_margin: balance,
            consecutive_losses: 0,
            daily_loss_accum: 0.0,
            daily_window_start: Utc::now(),
            avg_recent_slippage: None,
        }
    }

    fn session(multiplier: f64) -> Session {
        Session {
            tag: SessionTag::London,
            multiplier,
        }
    }

    #[test]
    fn approves_and_sizes_by_tier_and_session() {
        let policy = Policy::default();
        let d = evaluate(&opportunity(0.004), &account(5_000.0), &policy, &session(1.2));
        match d {
            Decision::Approved(s) => {
                assert_eq!(s.tier, BalanceTier::Medium);
                assert_eq!(s.risk_fraction, 0.02);
                assert!((s.base_notional - 100.0).abs() < 1e-9);
                assert!((s.notional - 120.0).abs() < 1e-9);
                assert_eq!(s.session, SessionTag::London);
            }
            other => panic!("expected approval, got {other:?}"),
        }
    }

    #[test]
    fn tier_boundaries_come_from_policy() {
        let tiers = RiskTiers::default();
        assert_eq!(tiers.select(999.99).0, BalanceTier::Small);
        assert_eq!(tiers.select(1_000.0).0, BalanceTier::Medium);
        assert_eq!(tiers.select(10_000.0).0, BalanceTier::Large);

        let custom = RiskTiers {
            small_below: 50.0,
            medium_below: 100.0,
            ..RiskTiers::default()
        };
        assert_eq!(custom.select(75.0).0, BalanceTier::Medium);
        assert_eq!(custom.select(150.0), (BalanceTier::Large, 0.03));
    }

    #[test]
    fn checks_short_circuit_in_order() {
        let policy = Policy::default();
        let mut acct = account(5_000.0);
        acct.consecutive_losses = 5;
        acct.daily_loss_accum = 1_000.0;

        assert_eq!(
            evaluate(&opportunity(0.0005), &acct, &policy, &session(1.0)),
            Decision::Rejected(RejectReason::BelowThreshold)
        );
        assert_eq!(
            evaluate(&opportunity(0.004), &acct, &policy, &session(1.0)),
            Decision::Rejected(RejectReason::ConsecutiveLossLimit)
        );
        acct.consecutive_losses = 2;
        assert_eq!(
            evaluate(&opportunity(0.004), &acct, &policy, &session(1.0)),
            Decision::Rejected(RejectReason::DailyLossLimit)
        );
        acct.daily_loss_accum = 249.0;
        acct.avg_recent_slippage = Some(0.01);
        assert_eq!(
            evaluate(&opportunity(0.004), &acct, &policy, &session(1.0)),
            Decision::Rejected(RejectReason::ExcessiveSlippage)
        );
        acct.avg_recent_slippage = Some(0.001);
        assert!(matches!(
            evaluate(&opportunity(0.004), &acct, &policy, &session(1.0)),
            Decision::Approved(_)
        ));
    }

    #[test]
    fn threshold_is_inclusive() {
        let policy = Policy::default();
        let d = evaluate(&opportunity(0.001), &account(5_000.0), &policy, &session(1.0));
        assert!(matches!(d, Decision::Approved(_)));
    }

    #[test]
    fn daily_limit_scales_with_balance() {
        let policy = Policy::default();
        let mut acct = account(2_000.0);
        acct.daily_loss_accum = 100.0;
        assert_eq!(
            evaluate(&opportunity(0.004), &acct, &policy, &session(1.0)),
            Decision::Rejected(RejectReason::DailyLossLimit)
        );
        acct.daily_loss_accum = 99.0;
        assert!(evaluate(&opportunity(0.004), &acct, &policy, &session(1.0))
            .notional()
            .is_some());
    }

    #[test]
    fn notional_is_clamped_to_margin_and_position_cap() {
        let policy = Policy {
            risk_per_trade: RiskTiers {
                large: 0.5,
                ..RiskTiers::default()
            },
            ..Policy::default()
        };
        let mut acct = account(20_000.0);
        // 0.5 * 20k * 1.2 = 12k, capped at 10% of balance
        let d = evaluate(&opportunity(0.004), &acct, &policy, &session(1.2));
        assert!((d.notional().unwrap() - 2_000.0).abs() < 1e-9);

        acct.available_margin = 500.0;
        let d = evaluate(&opportunity(0.004), &acct, &policy, &session(1.2));
        assert!((d.notional().unwrap() - 500.0).abs() < 1e-9);

        acct.available_margin = 0.0;
        assert_eq!(
            evaluate(&opportunity(0.004), &acct, &policy, &session(1.2)),
            Decision::Rejected(RejectReason::InsufficientBalance)
        );
    }

    #[test]
    fn evaluation_is_pure() {
        let policy = Policy::default();
        let opp = opportunity(0.003);
        let acct = account(12_345.0);
        let s = session(0.8);
        let first = evaluate(&opp, &acct, &policy, &s);
        let second = evaluate(&opp, &acct, &policy, &s);
        assert_eq!(first, second);
    }

    #[test]
    fn losing_trades_raise_the_threshold_up_to_the_ceiling() {
        let adapt = ThresholdAdaptation::default();
        let recent = [(0.003, 0.0), (-0.004, 0.002)];
        assert!((adapt.adjust(0.001, &recent) - 0.0012).abs() < 1e-12);
        assert!((adapt.adjust(0.0045, &recent) - 0.005).abs() < 1e-12);
        assert_eq!(adapt.adjust(0.006, &recent), 0.006);
    }

    #[test]
    fn clean_winners_lower_the_threshold_down_to_the_floor() {
        let adapt = ThresholdAdaptation::default();
        let recent = [(0.003, 0.0002), (0.004, 0.0)];
        assert!((adapt.adjust(0.001, &recent) - 0.0009).abs() < 1e-12);
        assert!((adapt.adjust(0.00085, &recent) - 0.0008).abs() < 1e-12);

        // high slippage or thin returns leave it alone
        assert_eq!(adapt.adjust(0.001, &[(0.003, 0.002)]), 0.001);
        assert_eq!(adapt.adjust(0.001, &[(0.001, 0.0)]), 0.001);
    }

    #[test]
    fn only_the_lookback_counts() {
        let adapt = ThresholdAdaptation {
            lookback: 2,
            ..ThresholdAdaptation::default()
        };
        // the old loss falls out of the window
        let recent = [(-0.05, 0.01), (0.003, 0.0), (0.003, 0.0)];
        assert!((adapt.adjust(0.001, &recent) - 0.0009).abs() < 1e-12);
        assert_eq!(adapt.adjust(0.001, &[]), 0.001);

        let off = ThresholdAdaptation {
            enabled: false,
            ..ThresholdAdaptation::default()
        };
        assert_eq!(off.adjust(0.001, &recent), 0.001);
    }
}
