//! Trade journal and running performance figures.

use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

use crate::error::HistoryError;
use crate::execution::TradeRecord;
use crate::utils::pct;

pub trait TradeSink: Send {
    fn append(&mut self, record: &TradeRecord) -> Result<(), HistoryError>;
}

/// One JSON object per line, flushed after every record.
pub struct JsonlJournal {
    out: BufWriter<File>,
}

impl JsonlJournal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, HistoryError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!("journaling trades to {}", path.display());
        Ok(Self {
            out: BufWriter::new(file),
        })
    }
}

impl TradeSink for JsonlJournal {
    fn append(&mut self, record: &TradeRecord) -> Result<(), HistoryError> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }
}

/// Keeps records in memory.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryJournal {
    pub records: Vec<TradeRecord>,
}

#[cfg(test)]
impl TradeSink for MemoryJournal {
    fn append(&mut self, record: &TradeRecord) -> Result<(), HistoryError> {
        self.records.push(record.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceSummary {
    pub total_trades: u64,
    pub profitable_trades: u64,
    pub loss_trades: u64,
    pub total_profit: f64,
    profit_sum: f64,
    loss_sum: f64,
    slippage_sum: f64,
    slippage_count: u64,
}

impl PerformanceSummary {
    pub fn record(&mut self, record: &TradeRecord) {
        self.total_trades += 1;
        if record.realized_pnl > 0.0 {
            self.profitable_trades += 1;
            self.profit_sum += record.realized_pnl;
        } else {
            self.loss_trades += 1;
            self.loss_sum += record.realized_pnl;
        }
        self.total_profit += record.realized_pnl;
        if let Some(s) = record.slippage {
            self.slippage_sum += s;
            self.slippage_count += 1;
        }
    }

    pub fn win_rate(&self) -> f64 {
        ratio(self.profitable_trades as f64, self.total_trades)
    }

    pub fn avg_profit(&self) -> f64 {
        ratio(self.profit_sum, self.profitable_trades)
    }

    /// Zero or negative.
    pub fn avg_loss(&self) -> f64 {
        ratio(self.loss_sum, self.loss_trades)
    }

    pub fn avg_slippage(&self) -> f64 {
        ratio(self.slippage_sum, self.slippage_count)
    }

    pub fn log(&self) {
        info!(
            "performance: {} trades, {} won / {} lost, win rate {}, avg profit {:.4}, avg loss {:.4}, avg slippage {}, total {:.4}",
            self.total_trades,
            self.profitable_trades,
            self.loss_trades,
            pct(self.win_rate()),
            self.avg_profit(),
            self.avg_loss(),
            pct(self.avg_slippage()),
            self.total_profit
        );
    }
}

fn ratio(num: f64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num / den as f64
    }
}
