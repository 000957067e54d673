use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::graph::{Edge, RateGraph};
use crate::models::CurrencyCode;

/// Closed conversion path: first and last code are the same.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cycle(Vec<CurrencyCode>);

impl Cycle {
    /// Needs at least three distinct codes and no repeated intermediate.
    pub fn new(codes: Vec<CurrencyCode>) -> Option<Self> {
        if codes.len() < 4 || codes.first() != codes.last() {
            return None;
        }
        let open = &codes[..codes.len() - 1];
        let distinct: HashSet<_> = open.iter().collect();
        if distinct.len() != open.len() {
            return None;
        }
        Some(Self(codes))
    }

    pub fn start(&self) -> CurrencyCode {
        self.0[0]
    }

    #[cfg(test)]
    pub fn codes(&self) -> &[CurrencyCode] {
        &self.0
    }

    pub fn leg_count(&self) -> usize {
        self.0.len() - 1
    }
}

impl fmt::Display for Cycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = self.0.iter().map(CurrencyCode::as_str).collect();
        f.write_str(&parts.join(" -> "))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub cycle: Cycle,
    pub gross_yield: f64,
    pub cost_estimate: f64,
    pub net_yield: f64,
    pub legs: Vec<Edge>,
}

impl Opportunity {
    pub fn start(&self) -> CurrencyCode {
        self.cycle.start()
    }
}

/// Gross yield and spread-derived cost of a chain of legs.
pub fn cycle_yield(legs: &[Edge], fee_per_leg: f64) -> (f64, f64) {
    let gross = legs.iter().map(|e| e.rate).product::<f64>() - 1.0;
    let cost = legs.iter().map(|e| e.half_spread + fee_per_leg).sum::<f64>();
    (gross, cost)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleSelection {
    #[default]
    All,
    BestPerStart,
}

#[derive(Debug, Clone, Copy)]
pub struct CycleFinder {
    max_length: usize,
    fee_per_leg: f64,
}

impl CycleFinder {
    /// `max_length` is the longest cycle, counted in legs.
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length: max_length.max(3),
            fee_per_leg: 0.0,
        }
    }

    pub fn with_fee_per_leg(mut self, fee_per_leg: f64) -> Self {
        self.fee_per_leg = fee_per_leg;
        self
    }

    /// Lazily walks every simple cycle from each of `currencies`. Call again
    /// with a fresh graph to restart.
    pub fn find<'g>(&self, graph: &'g RateGraph, currencies: &[CurrencyCode]) -> CycleSearch<'g> {
        let mut seen = HashSet::new();
        let origins: Vec<CurrencyCode> = currencies
            .iter()
            .copied()
            .filter(|c| seen.insert(*c))
            .collect();
        CycleSearch {
            graph,
            origins: origins.into_iter(),
            origin: None,
            frames: Vec::with_capacity(self.max_length),
            max_length: self.max_length,
            fee_per_leg: self.fee_per_leg,
        }
    }
}

struct Frame {
    code: CurrencyCode,
    // popped from the back, so stored in descending order
    pending: Vec<CurrencyCode>,
}

/// Depth-first search over an explicit stack; never holds more than
/// `max_length` frames.
pub struct CycleSearch<'g> {
    graph: &'g RateGraph,
    origins: std::vec::IntoIter<CurrencyCode>,
    origin: Option<CurrencyCode>,
    frames: Vec<Frame>,
    max_length: usize,
    fee_per_leg: f64,
}

impl CycleSearch<'_> {
    fn push(&mut self, code: CurrencyCode) {
        let mut pending: Vec<CurrencyCode> = self.graph.neighbors(code).into_iter().collect();
        pending.reverse();
        self.frames.push(Frame { code, pending });
    }

    fn close(&self, origin: CurrencyCode) -> Option<Opportunity> {
        let mut codes: Vec<CurrencyCode> = self.frames.iter().map(|f| f.code).collect();
        codes.push(origin);
        let legs = codes
            .windows(2)
            .map(|w| self.graph.edge(w[0], w[1]).copied())
            .collect::<Option<Vec<Edge>>>()?;

        let (gross_yield, cost_estimate) = cycle_yield(&legs, self.fee_per_leg);
        let net_yield = gross_yield - cost_estimate;
        if !net_yield.is_finite() || net_yield <= 0.0 {
            return None;
        }
        Some(Opportunity {
            cycle: Cycle::new(codes)?,
            gross_yield,
            cost_estimate,
            net_yield,
            legs,
        })
    }
}

impl Iterator for CycleSearch<'_> {
    type Item = Opportunity;

    fn next(&mut self) -> Option<Opportunity> {
        loop {
            let Some(origin) = self.origin else {
                let origin = self.origins.next()?;
                if self.graph.contains(origin) {
                    self.origin = Some(origin);
                    self.push(origin);
                }
                continue;
            };

            let depth = self.frames.len();
            let Some(frame) = self.frames.last_mut() else {
                self.origin = None;
                continue;
            };
            let Some(next) = frame.pending.pop() else {
                self.frames.pop();
                continue;
            };

            if next == origin {
                if depth >= 3 {
                    if let Some(found) = self.close(origin) {
                        return Some(found);
                    }
                }
                continue;
            }
            if depth < self.max_length && !self.frames.iter().any(|f| f.code == next) {
                self.push(next);
            }
        }
    }
}

/// Best first: higher `net_yield`, then fewer legs, then cycle order.
pub fn rank(opportunities: impl IntoIterator<Item = Opportunity>) -> Vec<Opportunity> {
    let mut out: Vec<Opportunity> = opportunities.into_iter().collect();
    out.sort_by(|a, b| {
        b.net_yield
            .total_cmp(&a.net_yield)
            .then(a.legs.len().cmp(&b.legs.len()))
            .then_with(|| a.cycle.cmp(&b.cycle))
    });
    out
}

/// Applies the selection policy to an already ranked list.
pub fn select(ranked: Vec<Opportunity>, selection: CycleSelection) -> Vec<Opportunity> {
    match selection {
        CycleSelection::All => ranked,
        CycleSelection::BestPerStart => {
            let mut seen = HashSet::new();
            ranked.into_iter().filter(|o| seen.insert(o.start())).collect()
        }
    }
}
