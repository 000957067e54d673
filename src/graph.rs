use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::models::{CurrencyCode, Quote, RateSnapshot};

/// One convertible direction, rebuilt from every snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: CurrencyCode,
    pub to: CurrencyCode,
    /// Units of `to` received per unit of `from` after crossing the spread.
    pub rate: f64,
    /// Mid-market multiplier, only used to value amounts.
    pub mid: f64,
    /// Half of the underlying quote's relative spread.
    pub half_spread: f64,
    /// Set when the edge comes from the reciprocal of a quote.
    pub derived: bool,
}

impl Edge {
    /// `from = base`, `to = quote`: paying `ask` base per quote unit.
    fn buying(q: &Quote) -> Self {
        Self {
            from: q.base,
            to: q.quote,
            rate: 1.0 / q.ask,
            mid: 1.0 / q.mid(),
            half_spread: q.relative_spread() / 2.0,
            derived: false,
        }
    }

    /// `from = quote`, `to = base`: the reciprocal quote's ask is `1/bid`.
    fn selling(q: &Quote) -> Self {
        let inv = q.inverse();
        Self {
            from: inv.base,
            to: inv.quote,
            rate: 1.0 / inv.ask,
            mid: q.mid(),
            half_spread: q.relative_spread() / 2.0,
            derived: true,
        }
    }
}

/// Directed conversion graph over a single snapshot. Pairs that were not
/// quoted have no edge at all.
#[derive(Debug, Clone, Default)]
pub struct RateGraph {
    adjacency: BTreeMap<CurrencyCode, BTreeMap<CurrencyCode, Edge>>,
}

impl RateGraph {
    #[cfg(test)]
    pub fn build(snapshot: &RateSnapshot) -> Self {
        Self::build_filtered(snapshot, None)
    }

    /// Like [`RateGraph::build`], dropping quotes wider than `max_relative_spread`.
    pub fn build_filtered(snapshot: &RateSnapshot, max_relative_spread: Option<f64>) -> Self {
        let usable: Vec<&Quote> = snapshot
            .quotes()
            .filter(|q| match max_relative_spread {
                Some(limit) => q.relative_spread() <= limit,
                None => true,
            })
            .collect();

        let mut adjacency: BTreeMap<CurrencyCode, BTreeMap<CurrencyCode, Edge>> = BTreeMap::new();

        // direct quotes first so a reciprocal never shadows a real market
        for q in &usable {
            if q.base == q.quote {
                continue;
            }
            let edge = Edge::buying(q);
            adjacency.entry(edge.from).or_default().insert(edge.to, edge);
        }
        for q in &usable {
            if q.base == q.quote {
                continue;
            }
            let edge = Edge::selling(q);
            adjacency
                .entry(edge.from)
                .or_default()
                .entry(edge.to)
                .or_insert(edge);
        }

        Self { adjacency }
    }

    pub fn edge(&self, from: CurrencyCode, to: CurrencyCode) -> Option<&Edge> {
        self.adjacency.get(&from).and_then(|m| m.get(&to))
    }

    pub fn neighbors(&self, code: CurrencyCode) -> BTreeSet<CurrencyCode> {
        self.adjacency
            .get(&code)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, code: CurrencyCode) -> bool {
        self.adjacency.contains_key(&code)
    }

    pub fn currencies(&self) -> impl Iterator<Item = CurrencyCode> + '_ {
        self.adjacency.keys().copied()
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.values().map(BTreeMap::len).sum()
    }

    /// Values `amount` of `from` in `to` at mid, over a direct edge only.
    pub fn convert(&self, amount: f64, from: CurrencyCode, to: CurrencyCode) -> Option<f64> {
        if from == to {
            return Some(amount);
        }
        self.edge(from, to).map(|e| amount * e.mid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ccy, quote};
    use chrono::Utc;

    fn snapshot(quotes: Vec<Quote>) -> RateSnapshot {
        RateSnapshot::new(quotes, Utc::now())
    }

    #[test]
    fn every_quote_populates_both_directions() {
        let g = RateGraph::build(&snapshot(vec![quote("USD", "EUR", 0.90, 0.905)]));
        let fwd = g.edge(ccy("USD"), ccy("EUR")).unwrap();
        let back = g.edge(ccy("EUR"), ccy("USD")).unwrap();
        assert!((fwd.rate - 1.0 / 0.905).abs() < 1e-12);
        assert!((back.rate - 0.90).abs() < 1e-12);
        assert!(!fwd.derived);
        assert!(back.derived);
        assert_eq!(g.edge_count(), 2);
    }

    #[test]
    fn round_trip_loses_the_spread() {
        let g = RateGraph::build(&snapshot(vec![
            quote("USD", "EUR", 0.90, 0.905),
            quote("EUR", "GBP", 0.85, 0.855),
            quote("GBP", "USD", 1.32, 1.325),
        ]));
        for (a, b) in [("USD", "EUR"), ("EUR", "GBP"), ("GBP", "USD")] {
            let ab = g.edge(ccy(a), ccy(b)).unwrap().rate;
            let ba = g.edge(ccy(b), ccy(a)).unwrap().rate;
            assert!(ab * ba < 1.0, "{a}/{b} round trip should cost the spread");
            // the reverse conversion never beats the reciprocal of the direct price
            assert!(1.0 / ba >= ab);
        }
    }

    #[test]
    fn zero_spread_round_trip_is_lossless() {
        let g = RateGraph::build(&snapshot(vec![quote("USD", "JPY", 150.0, 150.0)]));
        let ab = g.edge(ccy("USD"), ccy("JPY")).unwrap().rate;
        let ba = g.edge(ccy("JPY"), ccy("USD")).unwrap().rate;
        assert!((ab * ba - 1.0).abs() < 1e-12);
    }

    #[test]
    fn direct_quotes_win_over_reciprocals() {
        let g = RateGraph::build(&snapshot(vec![
            quote("USD", "EUR", 0.90, 0.905),
            quote("EUR", "USD", 1.08, 1.09),
        ]));
        let back = g.edge(ccy("EUR"), ccy("USD")).unwrap();
        assert!(!back.derived);
        assert!((back.rate - 1.0 / 1.09).abs() < 1e-12);
    }

    #[test]
    fn missing_pairs_have_no_edge() {
        let g = RateGraph::build(&snapshot(vec![quote("USD", "EUR", 0.90, 0.905)]));
        assert!(g.edge(ccy("USD"), ccy("GBP")).is_none());
        assert!(g.neighbors(ccy("GBP")).is_empty());
        assert_eq!(g.neighbors(ccy("USD")).into_iter().collect::<Vec<_>>(), vec![ccy("EUR")]);
        assert_eq!(g.convert(10.0, ccy("USD"), ccy("GBP")), None);
        assert_eq!(g.convert(10.0, ccy("USD"), ccy("USD")), Some(10.0));
    }

    #[test]
    fn wide_quotes_are_filtered_out() {
        let snap = snapshot(vec![
            quote("USD", "EUR", 0.90, 0.9001),
            quote("USD", "JPY", 140.0, 150.0),
        ]);
        let g = RateGraph::build_filtered(&snap, Some(0.001));
        assert!(g.edge(ccy("USD"), ccy("EUR")).is_some());
        assert!(g.edge(ccy("USD"), ccy("JPY")).is_none());
        assert!(!g.contains(ccy("JPY")));
    }

    #[test]
    fn half_spread_matches_quote() {
        let q = quote("EUR", "GBP", 0.85, 0.855);
        let g = RateGraph::build(&snapshot(vec![q]));
        let expected = 0.5 * (0.855 - 0.85) / 0.8525;
        assert!((g.edge(ccy("EUR"), ccy("GBP")).unwrap().half_spread - expected).abs() < 1e-12);
        assert!((g.edge(ccy("GBP"), ccy("EUR")).unwrap().half_spread - expected).abs() < 1e-12);
    }
}
