use serde::{Deserialize, Serialize};

/// A strategy's currently-open position as seen by a risk profile. Keyed
/// by `(strategy_name, symbol)` (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskPosition {
    pub strategy_name: String,
    pub symbol: String,
    pub exchange_name: String,
    pub opened_at: i64,
}

/// One entry a validation predicate sees: the signal plus who owns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivePosition {
    pub signal_id: String,
    pub strategy_name: String,
    pub exchange_name: String,
    pub opened_at: i64,
}

/// Everything a risk validation predicate receives (spec.md §4.2).
#[derive(Debug, Clone)]
pub struct RiskValidationRequest {
    pub symbol: String,
    pub strategy_name: String,
    pub exchange_name: String,
    pub current_price: f64,
    pub timestamp_ms: i64,
    pub pending_signal_id: Option<String>,
    pub active_position_count: usize,
    pub active_positions: Vec<ActivePosition>,
}
