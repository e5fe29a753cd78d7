use thiserror::Error;

/// The error taxonomy from spec.md §7. Every member is either fatal to a
/// single `(symbol, strategy)` pair (never to the whole engine) or fatal
/// only to the run that raised it at construction time.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing schema or unknown reference. Detected at execution start;
    /// fatal to that run.
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    /// Signal violates a price/time invariant from spec.md §3.
    #[error("signal validation failed for {symbol}/{strategy_name}: {reason}")]
    Validation {
        symbol: String,
        strategy_name: String,
        reason: String,
    },

    /// A risk predicate rejected the candidate, or raised instead of
    /// returning a verdict.
    #[error("risk rejected for {symbol}/{strategy_name}: {reason}")]
    RiskRejected {
        symbol: String,
        strategy_name: String,
        reason: String,
    },

    /// Upstream candle fetch kept failing after retries.
    #[error("candle fetch failed for {symbol} after {attempts} attempts: {reason}")]
    CandleFetch {
        symbol: String,
        attempts: u32,
        reason: String,
    },

    /// Liquidity is zero while computing VWAP.
    #[error("no liquidity for {symbol}: sum of volume over last {candles} candles is zero")]
    NoLiquidity { symbol: String, candles: usize },

    /// Disk full, permission denied, etc. Never crashes the engine; the
    /// operation is retried at the next tick.
    #[error("persistence error ({op}): {reason}")]
    Persistence { op: String, reason: String },

    /// Invariant breach or panic captured from a user callback. Terminates
    /// the affected `(symbol, strategy)` pair only.
    #[error("internal error in {component}: {reason}")]
    Internal { component: String, reason: String },
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::CandleFetch { .. } | EngineError::Persistence { .. }
        )
    }
}
