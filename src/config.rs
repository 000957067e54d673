use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::account::LossWindow;
use crate::cycles::CycleSelection;
use crate::error::ConfigError;
use crate::models::CurrencyCode;
use crate::risk::{RiskTiers, ThresholdAdaptation};
use crate::session::{default_multipliers, SessionMultipliers, SessionTag, SessionWindows};

/// Risk and detection policy. Field names match the config file keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub min_profit_threshold: f64,
    pub max_consecutive_losses: u32,
    pub daily_loss_limit_pct: f64,
    pub risk_per_trade: RiskTiers,
    pub max_position_pct: f64,
    pub session_multipliers: SessionMultipliers,
    pub sessions: SessionWindows,
    pub currencies_to_monitor: Vec<CurrencyCode>,
    pub account_currency: CurrencyCode,
    pub max_length: usize,
    /// Seconds between detection passes.
    pub check_interval: u64,
    pub cycle_selection: CycleSelection,
    pub loss_window: LossWindow,
    pub fee_per_leg: f64,
    pub max_relative_spread: Option<f64>,
    pub max_avg_slippage: Option<f64>,
    pub slippage_window: usize,
    pub threshold_adaptation: ThresholdAdaptation,
    /// Sessions that only trade shortly after a sighting.
    pub quiet_sessions: Vec<SessionTag>,
    /// How recent, in seconds, that sighting must be.
    pub quiet_session_recency_secs: u64,
}

impl Default for Policy {
    fn default() -> Self {
        let currencies_to_monitor = ["USD", "EUR", "GBP", "JPY", "AUD", "CAD", "CHF", "NZD"]
            .iter()
            .filter_map(|c| CurrencyCode::new(c).ok())
            .collect();
        Self {
            min_profit_threshold: 0.001,
            max_consecutive_losses: 3,
            daily_loss_limit_pct: 0.05,
            risk_per_trade: RiskTiers::default(),
            max_position_pct: 0.10,
            session_multipliers: default_multipliers(),
            sessions: SessionWindows::default(),
            currencies_to_monitor,
            account_currency: CurrencyCode::USD,
            max_length: 3,
            check_interval: 3,
            cycle_selection: CycleSelection::All,
            loss_window: LossWindow::CalendarDay,
            fee_per_leg: 0.0,
            max_relative_spread: None,
            max_avg_slippage: Some(0.003),
            slippage_window: 3,
            threshold_adaptation: ThresholdAdaptation::default(),
            quiet_sessions: vec![SessionTag::Tokyo, SessionTag::LowLiquidity],
            quiet_session_recency_secs: 300,
        }
    }
}

impl Policy {
    /// Collects every violation instead of stopping at the first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        let distinct: HashSet<_> = self.currencies_to_monitor.iter().collect();
        if distinct.len() < 3 {
            problems.push("currencies_to_monitor needs at least three distinct codes".to_string());
        }
        if !distinct.contains(&self.account_currency) {
            problems.push(format!(
                "account_currency {} is not in currencies_to_monitor",
                self.account_currency
            ));
        }
        if !(3..=6).contains(&self.max_length) {
            problems.push(format!("max_length must be 3..=6, got {}", self.max_length));
        }
        if self.check_interval == 0 {
            problems.push("check_interval must be at least 1 second".to_string());
        }
        for (name, value) in [
            ("min_profit_threshold", self.min_profit_threshold),
            ("daily_loss_limit_pct", self.daily_loss_limit_pct),
            ("fee_per_leg", self.fee_per_leg),
        ] {
            if !value.is_finite() || value < 0.0 {
                problems.push(format!("{name} must be a non-negative number, got {value}"));
            }
        }
        if !(self.max_position_pct > 0.0 && self.max_position_pct <= 1.0) {
            problems.push(format!(
                "max_position_pct must be in (0, 1], got {}",
                self.max_position_pct
            ));
        }
        problems.extend(self.risk_per_trade.problems());
        problems.extend(self.threshold_adaptation.problems());
        for (tag, m) in &self.session_multipliers {
            if !m.is_finite() || *m <= 0.0 {
                problems.push(format!("session multiplier {tag} must be positive, got {m}"));
            }
        }
        for (name, hours) in [
            ("tokyo", self.sessions.tokyo),
            ("london", self.sessions.london),
            ("new_york", self.sessions.new_york),
        ] {
            if hours.open > 23 || hours.close > 24 {
                problems.push(format!("sessions.{name} hours must be within 0..24"));
            }
        }
        if let Some(limit) = self.max_relative_spread {
            if !limit.is_finite() || limit <= 0.0 {
                problems.push(format!("max_relative_spread must be positive, got {limit}"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub api_key: String,
    pub account_id: String,
    pub practice_mode: bool,
    /// Overrides the practice/live endpoint, e.g. for a local mock.
    pub base_url: Option<String>,
    pub max_concurrent_fetches: usize,
    pub request_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            account_id: String::new(),
            practice_mode: true,
            base_url: None,
            max_concurrent_fetches: 10,
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub policy: Policy,
    /// Append-only JSON lines file for trade records.
    pub history_path: Option<PathBuf>,
    /// Seconds; unlimited when absent.
    pub max_runtime: Option<u64>,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = match self.policy.validate() {
            Ok(()) => Vec::new(),
            Err(ConfigError::Invalid(p)) => p,
            Err(other) => return Err(other),
        };
        if self.broker.api_key.trim().is_empty() {
            problems.push("broker.api_key is required (or set OANDA_API_KEY)".to_string());
        }
        if self.broker.account_id.trim().is_empty() {
            problems.push("broker.account_id is required (or set OANDA_ACCOUNT_ID)".to_string());
        }
        if self.broker.max_concurrent_fetches == 0 {
            problems.push("broker.max_concurrent_fetches must be at least 1".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}

/// Defaults, then `<path>`, then a `.json` sibling, then `ARB_*` and the
/// OANDA credential variables.
pub fn load(path: &Path) -> Result<AppConfig, ConfigError> {
    if path.exists() {
        info!("loading configuration from {}", path.display());
    } else {
        warn!("configuration file {} not found, using defaults", path.display());
    }

    let config: AppConfig = Figment::from(Serialized::defaults(AppConfig::default()))
        .merge(Toml::file(path))
        .merge(Json::file(path.with_extension("json")))
        .merge(Env::prefixed("ARB_").split("__"))
        .merge(
            Env::raw()
                .only(&["OANDA_API_KEY", "OANDA_ACCOUNT_ID"])
                .map(|key| {
                    if key.as_str().eq_ignore_ascii_case("OANDA_API_KEY") {
                        "broker.api_key".into()
                    } else {
                        "broker.account_id".into()
                    }
                }),
        )
        .extract()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid_policy() {
        assert!(Policy::default().validate().is_ok());
    }

    #[test]
    fn validation_lists_every_problem() {
        let policy = Policy {
            max_length: 9,
            check_interval: 0,
            min_profit_threshold: -1.0,
            currencies_to_monitor: vec![CurrencyCode::new("EUR").unwrap()],
            ..Policy::default()
        };
        match policy.validate() {
            Err(ConfigError::Invalid(problems)) => {
                assert!(problems.len() >= 5, "{problems:?}");
                assert!(problems.iter().any(|p| p.contains("max_length")));
                assert!(problems.iter().any(|p| p.contains("account_currency")));
            }
            other => panic!("expected invalid config, got {other:?}"),
        }
    }

    #[test]
    fn credentials_are_required() {
        let err = AppConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("api_key"));
    }

    #[test]
    fn loads_toml_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arb.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
history_path = "trades.jsonl"

[broker]
api_key = "key"
account_id = "101-001"

[policy]
min_profit_threshold = 0.002
max_length = 4
currencies_to_monitor = ["usd", "eur", "gbp", "jpy"]
loss_window = "rolling24h"
cycle_selection = "best_per_start"

quiet_sessions = ["low_liquidity"]

[policy.session_multipliers]
tokyo = 0.6

[policy.threshold_adaptation]
enabled = false

[policy.risk_per_trade]
small_account = 0.015
medium_below = 20000.0
"#
        )
        .unwrap();

        let cfg = load(&path).unwrap();
        assert_eq!(cfg.broker.api_key, "key");
        assert!(cfg.broker.practice_mode);
        assert_eq!(cfg.policy.min_profit_threshold, 0.002);
        assert_eq!(cfg.policy.max_length, 4);
        assert_eq!(cfg.policy.currencies_to_monitor.len(), 4);
        assert_eq!(cfg.policy.loss_window, LossWindow::Rolling24h);
        assert_eq!(cfg.policy.cycle_selection, CycleSelection::BestPerStart);
        assert_eq!(cfg.policy.session_multipliers[&SessionTag::Tokyo], 0.6);
        assert_eq!(cfg.policy.max_consecutive_losses, 3);
        assert_eq!(cfg.policy.quiet_sessions, vec![SessionTag::LowLiquidity]);
        assert_eq!(cfg.policy.quiet_session_recency_secs, 300);
        assert!(!cfg.policy.threshold_adaptation.enabled);
        assert_eq!(cfg.policy.threshold_adaptation.lookback, 5);
        assert_eq!(cfg.policy.risk_per_trade.small, 0.015);
        assert_eq!(cfg.policy.risk_per_trade.medium, 0.02);
        assert_eq!(cfg.policy.risk_per_trade.medium_below, 20_000.0);
        assert_eq!(cfg.history_path, Some(PathBuf::from("trades.jsonl")));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn bad_currency_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arb.toml");
        std::fs::write(&path, "[policy]\ncurrencies_to_monitor = [\"DOLLAR\"]\n").unwrap();
        assert!(matches!(load(&path), Err(ConfigError::Load(_))));
    }
}
