use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Milestone levels tracked per signal, in percent (10, 20, … 100).
pub const MILESTONE_LEVELS: [u32; 10] = [10, 20, 30, 40, 50, 60, 70, 80, 90, 100];

/// Per-signal idempotent milestone state. Each level in `profit_levels` or
/// `loss_levels` has already fired its one-shot event (spec.md §3, §4.3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartialState {
    pub profit_levels: BTreeSet<u32>,
    pub loss_levels: BTreeSet<u32>,
}

impl PartialState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Levels newly crossed by `revenue_pct` (signed, fees excluded) that
    /// have not yet fired. Mutates `self` to mark them fired.
    pub fn cross_profit(&mut self, revenue_pct: f64) -> Vec<u32> {
        if revenue_pct <= 0.0 {
            return Vec::new();
        }
        let pct = revenue_pct * 100.0;
        let mut newly_crossed = Vec::new();
        for level in MILESTONE_LEVELS {
            if (level as f64) <= pct && !self.profit_levels.contains(&level) {
                self.profit_levels.insert(level);
                newly_crossed.push(level);
            }
        }
        newly_crossed
    }

    pub fn cross_loss(&mut self, revenue_pct: f64) -> Vec<u32> {
        if revenue_pct >= 0.0 {
            return Vec::new();
        }
        let pct = revenue_pct.abs() * 100.0;
        let mut newly_crossed = Vec::new();
        for level in MILESTONE_LEVELS {
            if (level as f64) <= pct && !self.loss_levels.contains(&level) {
                self.loss_levels.insert(level);
                newly_crossed.push(level);
            }
        }
        newly_crossed
    }

    pub fn is_empty(&self) -> bool {
        self.profit_levels.is_empty() && self.loss_levels.is_empty()
    }
}
