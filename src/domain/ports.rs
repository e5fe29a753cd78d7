use async_trait::async_trait;
use std::sync::Arc;

use crate::domain::errors::EngineError;
use crate::domain::risk::RiskValidationRequest;
use crate::domain::signal::SignalCandidate;
use crate::domain::types::{Candle, CandleInterval};

/// Explicit per-tick context passed into every Strategy/Exchange/Risk
/// call-back, replacing the source's async-local ("ambient") propagation
/// (spec.md §9 REDESIGN FLAGS).
#[derive(Debug, Clone)]
pub struct Context {
    pub symbol: String,
    pub strategy_name: String,
    pub exchange_name: String,
    pub when_ms: i64,
    pub backtest: bool,
}

/// A user-registered trading strategy. Opaque beyond this contract
/// (spec.md §6); `get_signal` is the only call the engine ever makes to
/// decide whether to open or schedule a new signal.
#[async_trait]
pub trait StrategySchema: Send + Sync {
    fn name(&self) -> &str;

    fn note(&self) -> Option<&str> {
        None
    }

    /// Minimum spacing between `get_signal` consultations (spec.md §4.4
    /// throttling rule). Restricted to `OneMin..=OneHour`.
    fn interval(&self) -> CandleInterval;

    async fn get_signal(
        &self,
        ctx: &Context,
        symbol: &str,
    ) -> Result<Option<SignalCandidate>, EngineError>;

    /// Name of the single risk profile this strategy is bound to, if any.
    fn risk_name(&self) -> Option<&str> {
        None
    }

    /// Ordered list of risk profiles this strategy is bound to (composes
    /// as logical AND). Mutually exclusive in practice with `risk_name`,
    /// though nothing in the engine enforces that.
    fn risk_list(&self) -> Option<Vec<String>> {
        None
    }

    async fn on_tick(&self, _ctx: &Context) {}
    async fn on_open(&self, _ctx: &Context, _signal_id: &str) {}
    async fn on_active(&self, _ctx: &Context, _signal_id: &str) {}
    async fn on_idle(&self, _ctx: &Context) {}
    async fn on_close(&self, _ctx: &Context, _signal_id: &str) {}
    async fn on_schedule(&self, _ctx: &Context, _signal_id: &str) {}
    async fn on_cancel(&self, _ctx: &Context, _signal_id: &str) {}
}

/// A user-registered exchange connector. The engine never speaks to a
/// real venue; it only calls `fetch_candles` and the formatting helpers.
#[async_trait]
pub trait ExchangeSchema: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: CandleInterval,
        since_ms: i64,
        limit: usize,
    ) -> Result<Vec<Candle>, EngineError>;

    fn format_price(&self, symbol: &str, price: f64) -> String {
        format!("{symbol}:{price:.8}")
    }

    fn format_quantity(&self, symbol: &str, quantity: f64) -> String {
        format!("{symbol}:{quantity:.8}")
    }

    async fn on_candle_data(&self, _symbol: &str, _candle: &Candle) {}
}

/// A named, closed timeline plus cadence used to drive backtest iteration.
pub trait FrameSchema: Send + Sync {
    fn name(&self) -> &str;
    fn interval(&self) -> CandleInterval;
    fn start_date_ms(&self) -> i64;
    fn end_date_ms(&self) -> i64;

    /// Monotone, inclusive sequence of tick timestamps at this frame's
    /// cadence (spec.md §4.5).
    fn timestamps(&self) -> Vec<i64> {
        let step = self.interval().to_ms();
        let mut out = Vec::new();
        let mut t = self.start_date_ms();
        while t <= self.end_date_ms() {
            out.push(t);
            t += step;
        }
        out
    }
}

/// A single risk validation predicate. Returns `Ok(())` to accept, or
/// `Err(reason)` to reject with a human-readable reason (spec.md §4.2).
#[async_trait]
pub trait RiskPredicate: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self, req: &RiskValidationRequest) -> Result<(), String>;
}

/// A named bundle of ordered validation predicates plus (via
/// `RiskValidator`, application layer) a shared position map.
pub struct RiskSchema {
    pub name: String,
    pub validations: Vec<Arc<dyn RiskPredicate>>,
}

impl RiskSchema {
    pub fn new(name: impl Into<String>, validations: Vec<Arc<dyn RiskPredicate>>) -> Self {
        Self {
            name: name.into(),
            validations,
        }
    }
}
