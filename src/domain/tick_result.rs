use serde::{Deserialize, Serialize};

use crate::domain::types::{CloseReason, Pnl};

/// The outcome of one state-machine transition attempt. A Rust sum type
/// in place of the source's tagged struct verified at an accessor layer
/// (spec.md §9 REDESIGN FLAGS).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TickResult {
    /// Nothing happened: throttled, stopped, or `get_signal` returned nil.
    Idle,
    /// A scheduled (limit-style) signal now exists, awaiting activation.
    Scheduled { signal_id: String },
    /// A signal just filled at its VWAP entry price.
    Opened { signal_id: String, price_open: f64 },
    /// An opened signal is still being monitored; no transition this tick.
    Active { signal_id: String },
    /// A scheduled signal expired without ever touching its target.
    Cancelled { signal_id: String },
    /// A signal reached a terminal state.
    Closed {
        signal_id: String,
        close_reason: CloseReason,
        close_timestamp_ms: i64,
        pnl: Pnl,
    },
}

impl TickResult {
    pub fn action(&self) -> &'static str {
        match self {
            TickResult::Idle => "idle",
            TickResult::Scheduled { .. } => "scheduled",
            TickResult::Opened { .. } => "opened",
            TickResult::Active { .. } => "active",
            TickResult::Cancelled { .. } => "cancelled",
            TickResult::Closed { .. } => "closed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TickResult::Closed { .. } | TickResult::Cancelled { .. })
    }

    /// The subset of actions a Live driver yields to its consumer
    /// (spec.md §4.6): intermediate `active`/`scheduled`/`idle` results
    /// still flow through the event bus but are not yielded.
    pub fn is_live_yielded(&self) -> bool {
        matches!(self, TickResult::Opened { .. } | TickResult::Closed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_tags_match_spec_names() {
        assert_eq!(TickResult::Idle.action(), "idle");
        assert_eq!(
            TickResult::Scheduled {
                signal_id: "s1".into()
            }
            .action(),
            "scheduled"
        );
        assert_eq!(
            TickResult::Cancelled {
                signal_id: "s1".into()
            }
            .is_terminal(),
            true
        );
        assert_eq!(TickResult::Idle.is_terminal(), false);
    }

    #[test]
    fn live_yield_filters_intermediate_actions() {
        assert!(!TickResult::Idle.is_live_yielded());
        assert!(!TickResult::Active {
            signal_id: "s".into()
        }
        .is_live_yielded());
        assert!(TickResult::Opened {
            signal_id: "s".into(),
            price_open: 1.0
        }
        .is_live_yielded());
    }
}
