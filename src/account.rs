use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// How the daily loss accumulator is windowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossWindow {
    /// Resets at the first decision after UTC midnight.
    #[default]
    CalendarDay,
    /// Resets at the first decision 24h or more after the window opened.
    Rolling24h,
}

impl LossWindow {
    pub fn start_of(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            LossWindow::CalendarDay => now.date_naive().and_time(NaiveTime::MIN).and_utc(),
            LossWindow::Rolling24h => now,
        }
    }

    pub fn has_elapsed(&self, start: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            LossWindow::CalendarDay => now.date_naive() > start.date_naive(),
            LossWindow::Rolling24h => now - start >= Duration::hours(24),
        }
    }
}

/// Read-only copy handed to the risk gate and the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AccountView {
    pub balance: f64,
    pub available_margin: f64,
    pub consecutive_losses: u32,
    pub daily_loss_accum: f64,
    pub daily_window_start: DateTime<Utc>,
    pub avg_recent_slippage: Option<f64>,
}

/// Process-wide account record. Only the execution coordinator holds it
/// mutably; everyone else works from an [`AccountView`].
#[derive(Debug, Clone)]
pub struct AccountState {
    balance: f64,
    available_margin: f64,
    consecutive_losses: u32,
    daily_loss_accum: f64,
    daily_window_start: DateTime<Utc>,
    recent_slippage: VecDeque<f64>,
    slippage_window: usize,
}

impl AccountState {
    pub fn new(
        balance: f64,
        available_margin: f64,
        now: DateTime<Utc>,
        window: LossWindow,
        slippage_window: usize,
    ) -> Self {
        Self {
            balance,
            available_margin,
            consecutive_losses: 0,
            daily_loss_accum: 0.0,
            daily_window_start: window.start_of(now),
            recent_slippage: VecDeque::with_capacity(slippage_window),
            slippage_window,
        }
    }

    pub fn view(&self) -> AccountView {
        let avg_recent_slippage = if self.slippage_window > 0
            && self.recent_slippage.len() == self.slippage_window
        {
            Some(self.recent_slippage.iter().sum::<f64>() / self.recent_slippage.len() as f64)
        } else {
            None
        };
        AccountView {
            balance: self.balance,
            available_margin: self.available_margin,
            consecutive_losses: self.consecutive_losses,
            daily_loss_accum: self.daily_loss_accum,
            daily_window_start: self.daily_window_start,
            avg_recent_slippage,
        }
    }

    /// Clears the loss accumulator once the window boundary has passed.
    /// Returns true only on the call that performed the reset.
    pub(crate) fn roll_loss_window(&mut self, now: DateTime<Utc>, window: LossWindow) -> bool {
        if !window.has_elapsed(self.daily_window_start, now) {
            return false;
        }
        self.daily_loss_accum = 0.0;
        self.daily_window_start = window.start_of(now);
        true
    }

    pub(crate) fn sync_balance(&mut self, balance: f64, available_margin: f64) {
        self.balance = balance;
        self.available_margin = available_margin;
    }

    /// Books one trade outcome. Anything that is not a gain counts as a loss.
    pub(crate) fn record_outcome(&mut self, realized_pnl: f64, slippage: Option<f64>) {
        if realized_pnl > 0.0 {
            self.consecutive_losses = 0;
        } else {
            self.consecutive_losses += 1;
        }
        if realized_pnl < 0.0 {
            self.daily_loss_accum += -realized_pnl;
        }
        self.balance += realized_pnl;
        self.available_margin = (self.available_margin + realized_pnl).max(0.0);

        if let Some(s) = slippage {
            if self.slippage_window > 0 {
                if self.recent_slippage.len() == self.slippage_window {
                    self.recent_slippage.pop_front();
                }
                self.recent_slippage.push_back(s);
            }
        }
    }

    /// An outcome whose PnL is unknown: counted against the streak only.
    pub(crate) fn record_unresolved(&mut self) {
        self.consecutive_losses += 1;
    }
}
