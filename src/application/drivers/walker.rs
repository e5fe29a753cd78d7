//! Walker Driver (spec.md §4.7): runs the Backtest Driver sequentially over
//! a list of candidate strategies and selects the one maximising a
//! declared metric. Each candidate gets a fresh Strategy Client (and a
//! fresh in-memory risk/partial state) so nothing leaks between runs
//! (invariant #7, walker isolation).

use std::sync::Arc;

use crate::application::drivers::backtest::BacktestDriver;
use crate::application::event_bus::EventBus;
use crate::application::exchange_client::ExchangeClient;
use crate::application::partial_tracker::PartialTracker;
use crate::application::risk_validator::RiskGate;
use crate::application::strategy_client::StrategyClient;
use crate::config::Config;
use crate::domain::errors::EngineError;
use crate::domain::event::{EngineEvent, EventMeta};
use crate::domain::ports::{FrameSchema, StrategySchema};
use crate::domain::tick_result::TickResult;
use crate::infrastructure::persistence::PersistenceLayer;

/// A metric function scores a completed backtest run's terminal results
/// (e.g. Sharpe, total return); higher is better. Left as a callback
/// because the engine has no opinion on which statistic a walker optimises.
pub type MetricFn = Arc<dyn Fn(&[TickResult]) -> f64 + Send + Sync>;

pub struct WalkerCandidate {
    pub strategy_name: String,
    pub strategy: Arc<dyn StrategySchema>,
    pub risk: Option<RiskGate>,
}

pub struct WalkerOutcome {
    pub winner_strategy: String,
    pub metric: f64,
    pub per_candidate: Vec<(String, f64)>,
}

pub struct WalkerDriver {
    symbol: String,
    exchange: Arc<ExchangeClient>,
    bus: Arc<EventBus>,
    config: Arc<Config>,
    metric: MetricFn,
}

impl WalkerDriver {
    pub fn new(
        symbol: impl Into<String>,
        exchange: Arc<ExchangeClient>,
        bus: Arc<EventBus>,
        config: Arc<Config>,
        metric: MetricFn,
    ) -> Self {
        Self { symbol: symbol.into(), exchange, bus, config, metric }
    }

    pub async fn run(
        &self,
        candidates: Vec<WalkerCandidate>,
        frame: &dyn FrameSchema,
    ) -> Result<WalkerOutcome, EngineError> {
        // Backtest mode bypasses persistence entirely, so an isolated
        // in-memory root per candidate is enough to guarantee isolation;
        // no file ever gets written to it.
        let scratch_persistence = Arc::new(PersistenceLayer::new(
            self.config.persistence_root.join("__walker_scratch__"),
        ));

        let mut best: Option<(String, f64)> = None;
        let mut per_candidate = Vec::new();

        for candidate in candidates {
            let partials = PartialTracker::new(scratch_persistence.clone(), self.bus.clone());
            let client = StrategyClient::new(
                self.symbol.clone(),
                true,
                candidate.strategy,
                self.exchange.clone(),
                candidate.risk,
                partials,
                self.bus.clone(),
                self.config.clone(),
                scratch_persistence.clone(),
            );

            let driver = BacktestDriver::new(client, self.exchange.clone(), self.bus.clone(), self.config.clone());
            let results = driver.run(frame).await?;
            let metric = (self.metric)(&results);

            per_candidate.push((candidate.strategy_name.clone(), metric));

            let improved = best.as_ref().is_none_or(|(_, m)| metric > *m);
            if improved {
                best = Some((candidate.strategy_name.clone(), metric));
            }
            let (best_name, best_metric) = best.clone().expect("best is set after first candidate");

            self.bus.publish(EngineEvent::WalkerStep {
                meta: EventMeta::new(0, true).with_symbol(&self.symbol),
                candidate_strategy: candidate.strategy_name,
                metric,
                best_so_far_strategy: best_name,
                best_so_far_metric: best_metric,
            });
        }

        let (winner_strategy, metric) = best.ok_or_else(|| EngineError::Configuration {
            reason: "walker run with an empty candidate list".to_string(),
        })?;

        self.bus.publish(EngineEvent::WalkerComplete {
            meta: EventMeta::new(0, true).with_symbol(&self.symbol),
            winner_strategy: winner_strategy.clone(),
            metric,
        });
        self.bus.publish(EngineEvent::DoneWalker {
            meta: EventMeta::new(0, true).with_symbol(&self.symbol),
        });

        Ok(WalkerOutcome { winner_strategy, metric, per_candidate })
    }
}

/// Total net PnL across closed signals — the simplest metric a host can
/// pass in without pulling in a statistics crate.
pub fn total_net_pnl_metric(results: &[TickResult]) -> f64 {
    results
        .iter()
        .filter_map(|r| match r {
            TickResult::Closed { pnl, .. } => Some(pnl.net_pct_after_fees_and_slippage),
            _ => None,
        })
        .sum()
}
