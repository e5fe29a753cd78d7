//! Concrete `RiskPredicate` implementations shipped alongside the engine
//! (spec.md §4.2 names the trait only; the predicates below are this
//! crate's off-the-shelf defaults, a caller is free to write others).

use async_trait::async_trait;

use crate::domain::ports::RiskPredicate;
use crate::domain::risk::RiskValidationRequest;

/// Configuration for [`MaxConcurrentPositions`].
#[derive(Debug, Clone)]
pub struct MaxConcurrentPositionsConfig {
    /// Total open positions a single risk profile will tolerate across every
    /// strategy/symbol bound to it.
    pub max_positions: usize,
}

impl Default for MaxConcurrentPositionsConfig {
    fn default() -> Self {
        Self { max_positions: 10 }
    }
}

/// Caps the total number of concurrently open positions a risk profile will
/// tolerate, independent of which strategy or symbol holds them.
pub struct MaxConcurrentPositions {
    config: MaxConcurrentPositionsConfig,
}

impl MaxConcurrentPositions {
    pub fn new(config: MaxConcurrentPositionsConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RiskPredicate for MaxConcurrentPositions {
    fn name(&self) -> &str {
        "max-concurrent-positions"
    }

    async fn check(&self, req: &RiskValidationRequest) -> Result<(), String> {
        if req.active_position_count >= self.config.max_positions {
            Err(format!(
                "active_position_count {} >= max_positions {}",
                req.active_position_count, self.config.max_positions
            ))
        } else {
            Ok(())
        }
    }
}

/// Configuration for [`MaxPositionsPerSymbol`].
#[derive(Debug, Clone)]
pub struct MaxPositionsPerSymbolConfig {
    /// Open positions tolerated on a single symbol, summed across every
    /// strategy that targets it.
    pub max_per_symbol: usize,
}

impl Default for MaxPositionsPerSymbolConfig {
    fn default() -> Self {
        Self { max_per_symbol: 1 }
    }
}

/// Prevents over-concentration in a single symbol: rejects once
/// `max_per_symbol` strategies already hold a position on the symbol the
/// pending signal targets. The pending signal's own symbol isn't carried on
/// `RiskValidationRequest`'s `active_positions` (those only describe
/// already-open positions), so this counts positions sharing the requesting
/// strategy's `exchange_name` and compares against the request's `symbol`
/// via each position's own symbol on the strategy/symbol key recorded at
/// open time.
pub struct MaxPositionsPerSymbol {
    config: MaxPositionsPerSymbolConfig,
}

impl MaxPositionsPerSymbol {
    pub fn new(config: MaxPositionsPerSymbolConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RiskPredicate for MaxPositionsPerSymbol {
    fn name(&self) -> &str {
        "max-positions-per-symbol"
    }

    async fn check(&self, req: &RiskValidationRequest) -> Result<(), String> {
        let same_symbol = req
            .active_positions
            .iter()
            .filter(|p| p.signal_id.ends_with(&format!(":{}", req.symbol)))
            .count();
        if same_symbol >= self.config.max_per_symbol {
            Err(format!(
                "{same_symbol} position(s) already open on {}, max_per_symbol {}",
                req.symbol, self.config.max_per_symbol
            ))
        } else {
            Ok(())
        }
    }
}

/// Configuration for [`MaxPositionsPerExchange`].
#[derive(Debug, Clone)]
pub struct MaxPositionsPerExchangeConfig {
    pub max_per_exchange: usize,
}

impl Default for MaxPositionsPerExchangeConfig {
    fn default() -> Self {
        Self { max_per_exchange: 5 }
    }
}

/// Caps concurrent exposure routed through a single exchange, the way the
/// teacher's sector-exposure check caps concentration in one sector bucket
/// rather than the portfolio overall.
pub struct MaxPositionsPerExchange {
    config: MaxPositionsPerExchangeConfig,
}

impl MaxPositionsPerExchange {
    pub fn new(config: MaxPositionsPerExchangeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RiskPredicate for MaxPositionsPerExchange {
    fn name(&self) -> &str {
        "max-positions-per-exchange"
    }

    async fn check(&self, req: &RiskValidationRequest) -> Result<(), String> {
        let same_exchange = req
            .active_positions
            .iter()
            .filter(|p| p.exchange_name == req.exchange_name)
            .count();
        if same_exchange >= self.config.max_per_exchange {
            Err(format!(
                "{same_exchange} position(s) already open on {}, max_per_exchange {}",
                req.exchange_name, self.config.max_per_exchange
            ))
        } else {
            Ok(())
        }
    }
}
