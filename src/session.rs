use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionTag {
    LondonNyOverlap,
    TokyoLondonOverlap,
    London,
    NewYork,
    Tokyo,
    LowLiquidity,
}

impl fmt::Display for SessionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionTag::LondonNyOverlap => "london_ny_overlap",
            SessionTag::TokyoLondonOverlap => "tokyo_london_overlap",
            SessionTag::London => "london",
            SessionTag::NewYork => "new_york",
            SessionTag::Tokyo => "tokyo",
            SessionTag::LowLiquidity => "low_liquidity",
        };
        f.write_str(name)
    }
}

/// UTC trading hours, `open` inclusive and `close` exclusive. A window with
/// `open > close` wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHours {
    pub open: u32,
    pub close: u32,
}

impl SessionHours {
    pub const fn new(open: u32, close: u32) -> Self {
        Self { open, close }
    }

    pub fn contains(&self, hour: u32) -> bool {
        if self.open <= self.close {
            self.open <= hour && hour < self.close
        } else {
            hour >= self.open || hour < self.close
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionWindows {
    pub tokyo: SessionHours,
    pub london: SessionHours,
    pub new_york: SessionHours,
}

impl Default for SessionWindows {
    fn default() -> Self {
        Self {
            tokyo: SessionHours::new(0, 9),
            london: SessionHours::new(8, 16),
            new_york: SessionHours::new(13, 22),
        }
    }
}

/// Overlaps take precedence over any single session.
pub fn select_session(at: DateTime<Utc>, windows: &SessionWindows) -> SessionTag {
    let hour = at.hour();
    let tokyo = windows.tokyo.contains(hour);
    let london = windows.london.contains(hour);
    let new_york = windows.new_york.contains(hour);

    match (tokyo, london, new_york) {
        (_, true, true) => SessionTag::LondonNyOverlap,
        (true, true, false) => SessionTag::TokyoLondonOverlap,
        (_, true, false) => SessionTag::London,
        (_, false, true) => SessionTag::NewYork,
        (true, false, false) => SessionTag::Tokyo,
        (false, false, false) => SessionTag::LowLiquidity,
    }
}

pub type SessionMultipliers = HashMap<SessionTag, f64>;

pub fn default_multipliers() -> SessionMultipliers {
    HashMap::from([
        (SessionTag::LondonNyOverlap, 1.2),
        (SessionTag::TokyoLondonOverlap, 1.1),
        (SessionTag::London, 1.0),
        (SessionTag::NewYork, 1.0),
        (SessionTag::Tokyo, 0.8),
        (SessionTag::LowLiquidity, 0.5),
    ])
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Session {
    pub tag: SessionTag,
    pub multiplier: f64,
}

impl Session {
    /// Unlisted sessions size at 1.0.
    pub fn resolve(
        at: DateTime<Utc>,
        windows: &SessionWindows,
        multipliers: &SessionMultipliers,
    ) -> Self {
        let tag = select_session(at, windows);
        Self {
            tag,
            multiplier: multipliers.get(&tag).copied().unwrap_or(1.0),
        }
    }
}
