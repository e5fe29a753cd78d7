use serde::{Deserialize, Serialize};

use crate::domain::types::Position;

/// What a strategy's `get_signal` call-back returns when it wants to open
/// or schedule a new signal. Omitting `price_open_target` requests
/// immediate market entry at the next VWAP (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalCandidate {
    pub position: Position,
    pub price_take_profit: f64,
    pub price_stop_loss: f64,
    pub minute_estimated_time: i64,
    pub price_open_target: Option<f64>,
    pub note: Option<String>,
    pub id: Option<String>,
}

/// Fields common to every signal, scheduled or opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalCore {
    pub id: String,
    pub symbol: String,
    pub strategy_name: String,
    pub exchange_name: String,
    pub position: Position,
    pub price_take_profit: f64,
    pub price_stop_loss: f64,
    pub minute_estimated_time: i64,
    pub scheduled_at: i64,
    pub pending_at: i64,
    pub note: Option<String>,
}

/// The in-memory/on-disk representation of a signal. A signal is either
/// awaiting activation at a limit price (`Scheduled`) or already filled and
/// under TP/SL/time monitoring (`Opened`). This is the Rust sum type the
/// spec's REDESIGN FLAGS section invites in place of the source's
/// discriminated record verified at an accessor layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Signal {
    Scheduled {
        core: SignalCore,
        price_open_target: f64,
    },
    Opened {
        core: SignalCore,
        price_open: f64,
        opened_at: i64,
    },
}

impl Signal {
    pub fn core(&self) -> &SignalCore {
        match self {
            Signal::Scheduled { core, .. } => core,
            Signal::Opened { core, .. } => core,
        }
    }

    pub fn id(&self) -> &str {
        &self.core().id
    }
}

/// Invariants a candidate must satisfy before a signal is created from it
/// (spec.md §3). `price_open` is the VWAP the signal would fill at.
pub struct SignalRules {
    pub min_tp_pct: f64,
    pub max_sl_pct: f64,
    pub max_lifetime_min: i64,
}

impl SignalRules {
    pub fn validate(
        &self,
        candidate: &SignalCandidate,
        price_open: f64,
    ) -> Result<(), String> {
        if candidate.minute_estimated_time > self.max_lifetime_min {
            return Err(format!(
                "minute_estimated_time {} exceeds MAX_LIFETIME_MIN {}",
                candidate.minute_estimated_time, self.max_lifetime_min
            ));
        }
        if candidate.minute_estimated_time <= 0 {
            return Err("minute_estimated_time must be positive".to_string());
        }

        match candidate.position {
            Position::Long => {
                if !(candidate.price_take_profit > price_open
                    && price_open > candidate.price_stop_loss)
                {
                    return Err(format!(
                        "long invariant violated: tp={} open={} sl={}",
                        candidate.price_take_profit, price_open, candidate.price_stop_loss
                    ));
                }
            }
            Position::Short => {
                if !(candidate.price_take_profit < price_open
                    && price_open < candidate.price_stop_loss)
                {
                    return Err(format!(
                        "short invariant violated: tp={} open={} sl={}",
                        candidate.price_take_profit, price_open, candidate.price_stop_loss
                    ));
                }
            }
        }

        let tp_pct = (candidate.price_take_profit - price_open).abs() / price_open;
        if tp_pct < self.min_tp_pct {
            return Err(format!(
                "take-profit distance {:.4}% below MIN_TP_PCT {:.4}%",
                tp_pct * 100.0,
                self.min_tp_pct * 100.0
            ));
        }

        let sl_pct = (candidate.price_stop_loss - price_open).abs() / price_open;
        if sl_pct > self.max_sl_pct {
            return Err(format!(
                "stop-loss distance {:.4}% exceeds MAX_SL_PCT {:.4}%",
                sl_pct * 100.0,
                self.max_sl_pct * 100.0
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> SignalRules {
        SignalRules {
            min_tp_pct: 0.005,
            max_sl_pct: 0.50,
            max_lifetime_min: 10_080,
        }
    }

    fn candidate(position: Position, tp: f64, sl: f64, minutes: i64) -> SignalCandidate {
        SignalCandidate {
            position,
            price_take_profit: tp,
            price_stop_loss: sl,
            minute_estimated_time: minutes,
            price_open_target: None,
            note: None,
            id: None,
        }
    }

    #[test]
    fn long_requires_tp_above_open_above_sl() {
        let c = candidate(Position::Long, 102.0, 98.0, 60);
        assert!(rules().validate(&c, 100.0).is_ok());

        let bad = candidate(Position::Long, 98.0, 102.0, 60);
        assert!(rules().validate(&bad, 100.0).is_err());
    }

    #[test]
    fn short_requires_tp_below_open_below_sl() {
        let c = candidate(Position::Short, 95.0, 103.0, 60);
        assert!(rules().validate(&c, 100.0).is_ok());

        let bad = candidate(Position::Short, 103.0, 95.0, 60);
        assert!(rules().validate(&bad, 100.0).is_err());
    }

    #[test]
    fn rejects_tp_too_close() {
        let c = candidate(Position::Long, 100.1, 98.0, 60);
        assert!(rules().validate(&c, 100.0).is_err());
    }

    #[test]
    fn rejects_sl_too_far() {
        let c = candidate(Position::Long, 110.0, 10.0, 60);
        assert!(rules().validate(&c, 100.0).is_err());
    }

    #[test]
    fn rejects_lifetime_over_max() {
        let c = candidate(Position::Long, 102.0, 98.0, 20_000);
        assert!(rules().validate(&c, 100.0).is_err());
    }
}
