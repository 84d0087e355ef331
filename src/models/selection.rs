//! Provider ordering strategies.
//!
//! Each strategy is a plain function that sorts a snapshot of the available
//! providers best-first. The manager looks strategies up in a
//! [`StrategyTable`], so adding one means registering a function rather than
//! touching the dispatch code.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Scores closer than this are treated as equal by the adaptive strategy.
pub const SCORE_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    RoundRobin,
    LeastLoaded,
    Fastest,
    CostOptimal,
    Priority,
    Adaptive,
}

impl SelectionStrategy {
    pub const ALL: [SelectionStrategy; 6] = [
        SelectionStrategy::RoundRobin,
        SelectionStrategy::LeastLoaded,
        SelectionStrategy::Fastest,
        SelectionStrategy::CostOptimal,
        SelectionStrategy::Priority,
        SelectionStrategy::Adaptive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionStrategy::RoundRobin => "round_robin",
            SelectionStrategy::LeastLoaded => "least_loaded",
            SelectionStrategy::Fastest => "fastest",
            SelectionStrategy::CostOptimal => "cost_optimal",
            SelectionStrategy::Priority => "priority",
            SelectionStrategy::Adaptive => "adaptive",
        }
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        SelectionStrategy::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == normalized)
            .ok_or_else(|| Error::validation(format!("Unknown selection strategy: {}", s)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveWeights {
    pub response_time: f64,
    pub success_rate: f64,
    pub cost: f64,
    pub load: f64,
}

impl Default for AdaptiveWeights {
    fn default() -> Self {
        Self {
            response_time: 0.3,
            success_rate: 0.4,
            cost: 0.2,
            load: 0.1,
        }
    }
}

/// Point-in-time view of one available provider.
#[derive(Debug, Clone)]
pub struct ProviderSnapshot {
    pub name: String,
    pub priority: i32,
    pub weight: f64,
    pub avg_response_time: f64,
    pub success_rate: f64,
    pub cost_per_request: Decimal,
    pub in_flight: u32,
}

pub struct SelectionContext<'a> {
    /// Monotonic counter driving round-robin rotation.
    pub rotation: usize,
    pub weights: &'a AdaptiveWeights,
}

pub type SelectFn = fn(&mut Vec<ProviderSnapshot>, &SelectionContext<'_>);

pub struct StrategyTable {
    strategies: HashMap<SelectionStrategy, SelectFn>,
}

impl Default for StrategyTable {
    fn default() -> Self {
        let mut table = Self {
            strategies: HashMap::new(),
        };
        table.register(SelectionStrategy::RoundRobin, order_round_robin);
        table.register(SelectionStrategy::LeastLoaded, order_least_loaded);
        table.register(SelectionStrategy::Fastest, order_fastest);
        table.register(SelectionStrategy::CostOptimal, order_cost_optimal);
        table.register(SelectionStrategy::Priority, order_priority);
        table.register(SelectionStrategy::Adaptive, order_adaptive);
        table
    }
}

impl StrategyTable {
    pub fn register(&mut self, strategy: SelectionStrategy, select: SelectFn) {
        self.strategies.insert(strategy, select);
    }

    /// Provider names best-first. Unregistered strategies fall back to
    /// priority order.
    pub fn order(
        &self,
        strategy: SelectionStrategy,
        mut snapshots: Vec<ProviderSnapshot>,
        context: &SelectionContext<'_>,
    ) -> Vec<String> {
        // baseline ordering so every strategy starts from the same sequence
        snapshots.sort_by(by_priority);

        let select = self
            .strategies
            .get(&strategy)
            .copied()
            .unwrap_or(order_priority as SelectFn);
        select(&mut snapshots, context);

        snapshots.into_iter().map(|s| s.name).collect()
    }
}

fn by_priority(a: &ProviderSnapshot, b: &ProviderSnapshot) -> Ordering {
    a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name))
}

pub fn order_priority(snapshots: &mut Vec<ProviderSnapshot>, _context: &SelectionContext<'_>) {
    snapshots.sort_by(by_priority);
}

pub fn order_round_robin(snapshots: &mut Vec<ProviderSnapshot>, context: &SelectionContext<'_>) {
    if snapshots.is_empty() {
        return;
    }
    snapshots.sort_by(by_priority);
    let shift = context.rotation % snapshots.len();
    snapshots.rotate_left(shift);
}

pub fn order_least_loaded(snapshots: &mut Vec<ProviderSnapshot>, _context: &SelectionContext<'_>) {
    snapshots.sort_by(|a, b| a.in_flight.cmp(&b.in_flight).then_with(|| by_priority(a, b)));
}

pub fn order_fastest(snapshots: &mut Vec<ProviderSnapshot>, _context: &SelectionContext<'_>) {
    snapshots.sort_by(|a, b| {
        a.avg_response_time
            .total_cmp(&b.avg_response_time)
            .then_with(|| by_priority(a, b))
    });
}

pub fn order_cost_optimal(snapshots: &mut Vec<ProviderSnapshot>, _context: &SelectionContext<'_>) {
    snapshots.sort_by(|a, b| {
        a.cost_per_request
            .cmp(&b.cost_per_request)
            .then_with(|| by_priority(a, b))
    });
}

/// Weighted composite of latency, reliability, price and load, scaled by the
/// provider's configured weight. Higher is better.
pub fn adaptive_score(snapshot: &ProviderSnapshot, weights: &AdaptiveWeights) -> f64 {
    let latency = 1.0 / (1.0 + snapshot.avg_response_time.max(0.0));
    let reliability = snapshot.success_rate.clamp(0.0, 1.0);
    let cost = snapshot.cost_per_request.to_f64().unwrap_or(0.0).max(0.0);
    let price = 1.0 / (1.0 + 100.0 * cost);
    let load = 1.0 / (1.0 + snapshot.in_flight as f64);

    let composite = weights.response_time * latency
        + weights.success_rate * reliability
        + weights.cost * price
        + weights.load * load;

    snapshot.weight.max(0.0) * composite
}

/// Best score first. Providers whose scores differ by less than
/// [`SCORE_EPSILON`] keep their priority order.
pub fn order_adaptive(snapshots: &mut Vec<ProviderSnapshot>, context: &SelectionContext<'_>) {
    snapshots.sort_by(by_priority);
    let mut keyed: Vec<(f64, ProviderSnapshot)> = snapshots
        .drain(..)
        .map(|s| (adaptive_score(&s, context.weights), s))
        .collect();

    // stable insertion pass: an entry only moves ahead of one it clearly beats
    for i in 1..keyed.len() {
        let mut j = i;
        while j > 0 && keyed[j].0 - keyed[j - 1].0 >= SCORE_EPSILON {
            keyed.swap(j, j - 1);
            j -= 1;
        }
    }

    snapshots.extend(keyed.into_iter().map(|(_, s)| s));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(name: &str, priority: i32) -> ProviderSnapshot {
        ProviderSnapshot {
            name: name.to_string(),
            priority,
            weight: 1.0,
            avg_response_time: 1.0,
            success_rate: 1.0,
            cost_per_request: Decimal::new(1, 2),
            in_flight: 0,
        }
    }

    fn order(strategy: SelectionStrategy, snapshots: Vec<ProviderSnapshot>, rotation: usize) -> Vec<String> {
        let weights = AdaptiveWeights::default();
        let context = SelectionContext { rotation, weights: &weights };
        StrategyTable::default().order(strategy, snapshots, &context)
    }

    #[test]
    fn test_priority_order() {
        let result = order(
            SelectionStrategy::Priority,
            vec![snapshot("c", 3), snapshot("a", 1), snapshot("b", 2)],
            0,
        );
        assert_eq!(result, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_round_robin_rotates() {
        let providers = || vec![snapshot("a", 1), snapshot("b", 2), snapshot("c", 3)];
        assert_eq!(order(SelectionStrategy::RoundRobin, providers(), 0)[0], "a");
        assert_eq!(order(SelectionStrategy::RoundRobin, providers(), 1)[0], "b");
        assert_eq!(order(SelectionStrategy::RoundRobin, providers(), 5), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_least_loaded_and_fastest_and_cost() {
        let mut busy = snapshot("a", 1);
        busy.in_flight = 3;
        let mut slow = snapshot("b", 2);
        slow.avg_response_time = 9.0;
        let mut pricey = snapshot("c", 3);
        pricey.cost_per_request = Decimal::ONE;

        let all = vec![busy, slow, pricey];
        assert_eq!(order(SelectionStrategy::LeastLoaded, all.clone(), 0), vec!["b", "c", "a"]);
        assert_eq!(order(SelectionStrategy::Fastest, all.clone(), 0), vec!["a", "c", "b"]);
        assert_eq!(order(SelectionStrategy::CostOptimal, all, 0), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_adaptive_prefers_reliable_and_weighted() {
        let mut flaky = snapshot("a", 1);
        flaky.success_rate = 0.2;
        let steady = snapshot("b", 2);
        assert_eq!(order(SelectionStrategy::Adaptive, vec![flaky, steady], 0)[0], "b");

        let mut heavy = snapshot("z", 9);
        heavy.weight = 3.0;
        assert_eq!(order(SelectionStrategy::Adaptive, vec![snapshot("a", 1), heavy], 0)[0], "z");
    }

    #[test]
    fn test_adaptive_tie_breaks_on_priority() {
        let result = order(
            SelectionStrategy::Adaptive,
            vec![snapshot("late", 5), snapshot("early", 1), snapshot("mid", 3)],
            0,
        );
        assert_eq!(result, vec!["early", "mid", "late"]);
    }

    #[test]
    fn test_adaptive_near_equal_scores_keep_priority() {
        let weights = AdaptiveWeights {
            response_time: 0.0,
            success_rate: 1.0,
            cost: 0.0,
            load: 0.0,
        };
        let context = SelectionContext { rotation: 0, weights: &weights };
        let table = StrategyTable::default();

        let mut a = snapshot("a", 1);
        a.success_rate = 0.5000004999;
        let mut b = snapshot("b", 2);
        b.success_rate = 0.5000005001;
        assert_eq!(table.order(SelectionStrategy::Adaptive, vec![b.clone(), a.clone()], &context), vec!["a", "b"]);

        // a gap of at least epsilon still wins
        b.success_rate = 0.5000015;
        assert_eq!(table.order(SelectionStrategy::Adaptive, vec![a, b], &context), vec!["b", "a"]);
    }

    #[test]
    fn test_ordering_is_deterministic() {
        let mut a = snapshot("a", 2);
        a.avg_response_time = 0.4;
        let mut b = snapshot("b", 1);
        b.in_flight = 2;
        let c = snapshot("c", 3);
        let providers = vec![a, b, c];

        for strategy in SelectionStrategy::ALL {
            let first = order(strategy, providers.clone(), 7);
            for _ in 0..20 {
                assert_eq!(order(strategy, providers.clone(), 7), first);
            }
        }
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("round-robin".parse::<SelectionStrategy>().unwrap(), SelectionStrategy::RoundRobin);
        assert_eq!("Adaptive".parse::<SelectionStrategy>().unwrap(), SelectionStrategy::Adaptive);
        assert!("random".parse::<SelectionStrategy>().is_err());
    }

    #[test]
    fn test_custom_strategy_registration() {
        fn reverse(snapshots: &mut Vec<ProviderSnapshot>, _: &SelectionContext<'_>) {
            snapshots.reverse();
        }

        let mut table = StrategyTable::default();
        table.register(SelectionStrategy::Priority, reverse);
        let weights = AdaptiveWeights::default();
        let context = SelectionContext { rotation: 0, weights: &weights };
        let result = table.order(
            SelectionStrategy::Priority,
            vec![snapshot("a", 1), snapshot("b", 2)],
            &context,
        );
        assert_eq!(result, vec!["b", "a"]);
    }
}
