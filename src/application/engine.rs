//! Engine: the composition root that turns named registrations (strategies,
//! exchanges, frames, risk profiles, walkers) into running drivers
//! (spec.md §6's `Backtest.run`/`Live.run`/`Walker.run` entry points).
//!
//! Grounded on the teacher's `application/system/mod.rs` `Application`
//! (`build`/`start`), generalised here into a registry-backed facade:
//! registration happens up front, the registries freeze at first driver
//! start, and per-pair collaborators (`ExchangeClient`, `RiskValidator`,
//! `StrategyClient`) are built once per composite key and reused (spec.md
//! §9 REDESIGN FLAGS: "memoised factories keyed by a value type").

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::domain::errors::EngineError;
use crate::domain::ports::{ExchangeSchema, FrameSchema, RiskSchema, StrategySchema};
use crate::domain::tick_result::TickResult;
use crate::infrastructure::persistence::PersistenceLayer;

use super::drivers::backtest::BacktestDriver;
use super::drivers::live::LiveDriver;
use super::drivers::walker::{MetricFn, WalkerCandidate, WalkerDriver, WalkerOutcome};
use super::event_bus::EventBus;
use super::exchange_client::ExchangeClient;
use super::partial_tracker::PartialTracker;
use super::registry::Registry;
use super::risk_validator::{RiskGate, RiskValidator};
use super::strategy_client::StrategyClient;

/// A named sweep: a walker candidate list plus the metric used to rank them
/// (spec.md §4.7).
pub struct WalkerSchema {
    pub name: String,
    pub strategy_names: Vec<String>,
    pub metric: MetricFn,
}

impl WalkerSchema {
    pub fn new(name: impl Into<String>, strategy_names: Vec<String>, metric: MetricFn) -> Self {
        Self { name: name.into(), strategy_names, metric }
    }
}

/// Composite key for the memoised Strategy Client factory. A value type
/// rather than a `"symbol:strategy:backtest"`-concatenated string, so two
/// symbols that happen to share a separator character can never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    symbol: String,
    strategy_name: String,
    backtest: bool,
}

/// A running Live Driver plus the cancellation handle spec.md §6 calls
/// `.background(...)`/`.stop(...)`.
pub struct LiveHandle {
    client: Arc<StrategyClient>,
    task: JoinHandle<Vec<TickResult>>,
}

impl LiveHandle {
    /// Sets the client's stop flag; consulted at the driver's next safe
    /// point. Never aborts an in-flight signal.
    pub async fn stop(&self) {
        self.client.stop().await;
    }

    /// Awaits the driver's natural exit, returning every `opened`/`closed`
    /// result it yielded.
    pub async fn join(self) -> Result<Vec<TickResult>, EngineError> {
        self.task.await.map_err(|e| EngineError::Internal {
            component: "LiveDriver".into(),
            reason: format!("task join error: {e}"),
        })
    }
}

fn wall_clock_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub struct Engine {
    config: Arc<Config>,
    bus: Arc<EventBus>,
    persistence: Arc<PersistenceLayer>,

    strategies: Registry<dyn StrategySchema>,
    exchanges: Registry<dyn ExchangeSchema>,
    frames: Registry<dyn FrameSchema>,
    risks: Registry<RiskSchema>,
    walkers: Registry<WalkerSchema>,

    exchange_clients: Mutex<HashMap<String, Arc<ExchangeClient>>>,
    risk_validators: Mutex<HashMap<String, Arc<RiskValidator>>>,
    strategy_clients: Mutex<HashMap<ClientKey, Arc<StrategyClient>>>,
}

impl Engine {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        let persistence = Arc::new(PersistenceLayer::new(config.persistence_root.clone()));
        Arc::new(Self {
            config,
            bus: EventBus::new(),
            persistence,
            strategies: Registry::new(),
            exchanges: Registry::new(),
            frames: Registry::new(),
            risks: Registry::new(),
            walkers: Registry::new(),
            exchange_clients: Mutex::new(HashMap::new()),
            risk_validators: Mutex::new(HashMap::new()),
            strategy_clients: Mutex::new(HashMap::new()),
        })
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn persistence(&self) -> Arc<PersistenceLayer> {
        self.persistence.clone()
    }

    pub fn register_strategy(
        &self,
        name: impl Into<String>,
        strategy: Arc<dyn StrategySchema>,
    ) -> Result<(), EngineError> {
        self.strategies.register(name, strategy)
    }

    pub fn register_exchange(
        &self,
        name: impl Into<String>,
        exchange: Arc<dyn ExchangeSchema>,
    ) -> Result<(), EngineError> {
        self.exchanges.register(name, exchange)
    }

    pub fn register_frame(
        &self,
        name: impl Into<String>,
        frame: Arc<dyn FrameSchema>,
    ) -> Result<(), EngineError> {
        self.frames.register(name, frame)
    }

    pub fn register_risk(
        &self,
        name: impl Into<String>,
        schema: Arc<RiskSchema>,
    ) -> Result<(), EngineError> {
        self.risks.register(name, schema)
    }

    pub fn register_walker(
        &self,
        name: impl Into<String>,
        schema: Arc<WalkerSchema>,
    ) -> Result<(), EngineError> {
        self.walkers.register(name, schema)
    }

    /// One-way transition away from the registration phase. Called at the
    /// top of every entry point so registration can no longer race a
    /// running driver (spec.md §9 REDESIGN FLAGS).
    fn freeze(&self) {
        self.strategies.freeze();
        self.exchanges.freeze();
        self.frames.freeze();
        self.risks.freeze();
        self.walkers.freeze();
    }

    async fn exchange_client(&self, exchange_name: &str) -> Result<Arc<ExchangeClient>, EngineError> {
        let mut guard = self.exchange_clients.lock().await;
        if let Some(existing) = guard.get(exchange_name) {
            return Ok(existing.clone());
        }
        let schema = self.exchanges.require(exchange_name)?;
        let client = ExchangeClient::new(schema, self.config.clone());
        guard.insert(exchange_name.to_string(), client.clone());
        Ok(client)
    }

    async fn risk_validator(&self, risk_name: &str) -> Result<Arc<RiskValidator>, EngineError> {
        let mut guard = self.risk_validators.lock().await;
        if let Some(existing) = guard.get(risk_name) {
            return Ok(existing.clone());
        }
        let schema = self.risks.require(risk_name)?;
        let validator = RiskValidator::new(
            schema.name.clone(),
            schema.validations.clone(),
            self.persistence.clone(),
            self.bus.clone(),
        );
        guard.insert(risk_name.to_string(), validator.clone());
        Ok(validator)
    }

    /// Resolves a strategy's declared risk profile(s) into a gate using the
    /// shared, persisted validators (live/backtest entry points: positions
    /// legitimately accumulate across runs for the same named profile).
    async fn risk_gate(&self, strategy: &dyn StrategySchema) -> Result<Option<RiskGate>, EngineError> {
        if let Some(names) = strategy.risk_list() {
            let mut validators = Vec::with_capacity(names.len());
            for name in &names {
                validators.push(self.risk_validator(name).await?);
            }
            return Ok(Some(RiskGate::Composite(validators)));
        }
        if let Some(name) = strategy.risk_name() {
            return Ok(Some(RiskGate::Single(self.risk_validator(name).await?)));
        }
        Ok(None)
    }

    /// Builds a risk gate backed by throwaway `RiskValidator` instances
    /// whose position maps are never shared with `risk_gate`'s cache. A
    /// walker candidate's speculative `add()`/`remove()` calls still
    /// mutate an in-memory position map even though `backtest=true`
    /// skips persistence, so sharing the live validator here would leak a
    /// walker sweep's phantom positions into real risk accounting
    /// (invariant #7, walker isolation).
    async fn ephemeral_risk_gate(
        &self,
        strategy: &dyn StrategySchema,
    ) -> Result<Option<RiskGate>, EngineError> {
        if let Some(names) = strategy.risk_list() {
            let mut validators = Vec::with_capacity(names.len());
            for name in &names {
                let schema = self.risks.require(name)?;
                validators.push(RiskValidator::new(
                    schema.name.clone(),
                    schema.validations.clone(),
                    self.persistence.clone(),
                    self.bus.clone(),
                ));
            }
            return Ok(Some(RiskGate::Composite(validators)));
        }
        if let Some(name) = strategy.risk_name() {
            let schema = self.risks.require(name)?;
            return Ok(Some(RiskGate::Single(RiskValidator::new(
                schema.name.clone(),
                schema.validations.clone(),
                self.persistence.clone(),
                self.bus.clone(),
            ))));
        }
        Ok(None)
    }

    /// Memoised Strategy Client factory. The `strategy_clients` lock is
    /// held across the nested lookups below: they only ever touch the
    /// `exchange_clients`/`risk_validators` mutexes, never this one, so
    /// holding it cannot deadlock, and it guarantees at most one client is
    /// ever constructed per `(symbol, strategy, backtest)` key.
    async fn strategy_client(
        &self,
        symbol: &str,
        strategy_name: &str,
        exchange_name: &str,
        backtest: bool,
    ) -> Result<Arc<StrategyClient>, EngineError> {
        let key = ClientKey {
            symbol: symbol.to_string(),
            strategy_name: strategy_name.to_string(),
            backtest,
        };

        let mut guard = self.strategy_clients.lock().await;
        if let Some(existing) = guard.get(&key) {
            return Ok(existing.clone());
        }

        let strategy = self.strategies.require(strategy_name)?;
        let exchange = self.exchange_client(exchange_name).await?;
        let risk = self.risk_gate(strategy.as_ref()).await?;
        let partials = PartialTracker::new(self.persistence.clone(), self.bus.clone());

        let client = StrategyClient::new(
            symbol,
            backtest,
            strategy,
            exchange,
            risk,
            partials,
            self.bus.clone(),
            self.config.clone(),
            self.persistence.clone(),
        );
        guard.insert(key, client.clone());
        Ok(client)
    }

    fn validate_interval_pairing(
        &self,
        frame_name: &str,
        frame: &dyn FrameSchema,
        strategy_name: &str,
        strategy: &dyn StrategySchema,
    ) -> Result<(), EngineError> {
        if !strategy.interval().is_valid_signal_interval() {
            return Err(EngineError::Configuration {
                reason: format!(
                    "strategy '{strategy_name}' declares interval {} which exceeds the maximum \
                     signal-eligible interval of one hour",
                    strategy.interval()
                ),
            });
        }
        if !frame.interval().is_multiple_of(strategy.interval()) {
            return Err(EngineError::Configuration {
                reason: format!(
                    "frame '{frame_name}' interval {} is not an integer multiple of \
                     strategy '{strategy_name}' interval {}",
                    frame.interval(),
                    strategy.interval()
                ),
            });
        }
        Ok(())
    }

    /// spec.md §6 `Backtest.run(symbol, {strategy_name, exchange_name,
    /// frame_name})`. Resolves every named collaborator, enforces the
    /// frame/strategy interval pairing, runs the Backtest Driver to
    /// completion, and releases the per-pair client afterwards (spec.md
    /// §5: "all per-pair state is released when the driver completes").
    pub async fn backtest_run(
        self: &Arc<Self>,
        symbol: &str,
        strategy_name: &str,
        exchange_name: &str,
        frame_name: &str,
    ) -> Result<Vec<TickResult>, EngineError> {
        self.freeze();

        let frame = self.frames.require(frame_name)?;
        let strategy = self.strategies.require(strategy_name)?;
        self.validate_interval_pairing(frame_name, frame.as_ref(), strategy_name, strategy.as_ref())?;

        let exchange = self.exchange_client(exchange_name).await?;
        let client = self.strategy_client(symbol, strategy_name, exchange_name, true).await?;

        let driver = BacktestDriver::new(client, exchange, self.bus.clone(), self.config.clone());
        let result = driver.run(frame.as_ref()).await;

        let key = ClientKey {
            symbol: symbol.to_string(),
            strategy_name: strategy_name.to_string(),
            backtest: true,
        };
        self.strategy_clients.lock().await.remove(&key);

        result
    }

    /// spec.md §6 `Live.run(symbol, {strategy_name, exchange_name})`.
    /// Spawns the Live Driver in the background and returns a handle with
    /// `.stop()`/`.join()`, using the wall clock as `now_ms`.
    pub async fn live_run_background(
        self: &Arc<Self>,
        symbol: &str,
        strategy_name: &str,
        exchange_name: &str,
    ) -> Result<LiveHandle, EngineError> {
        self.freeze();

        let strategy = self.strategies.require(strategy_name)?;
        if !strategy.interval().is_valid_signal_interval() {
            return Err(EngineError::Configuration {
                reason: format!(
                    "strategy '{strategy_name}' declares interval {} which exceeds the maximum \
                     signal-eligible interval of one hour",
                    strategy.interval()
                ),
            });
        }

        let client = self.strategy_client(symbol, strategy_name, exchange_name, false).await?;
        let driver = LiveDriver::new(client.clone(), self.bus.clone(), self.config.clone());

        let task = tokio::spawn(async move { driver.run(wall_clock_ms).await });

        Ok(LiveHandle { client, task })
    }

    /// spec.md §6 `.stop(symbol, strategy_name)`: stops a client that is
    /// already tracked by the engine (e.g. a live run started by a prior
    /// call whose handle the caller no longer holds).
    pub async fn stop(&self, symbol: &str, strategy_name: &str, backtest: bool) -> Result<(), EngineError> {
        let key = ClientKey {
            symbol: symbol.to_string(),
            strategy_name: strategy_name.to_string(),
            backtest,
        };
        let client = self.strategy_clients.lock().await.get(&key).cloned();
        match client {
            Some(client) => {
                client.stop().await;
                Ok(())
            }
            None => Err(EngineError::Configuration {
                reason: format!(
                    "no tracked client for symbol '{symbol}' strategy '{strategy_name}' \
                     (backtest={backtest})"
                ),
            }),
        }
    }

    /// spec.md §6 `Walker.run(symbol, {walker_name, exchange_name,
    /// frame_name})`. Every candidate gets its own fresh `StrategyClient`
    /// and an ephemeral risk gate so nothing leaks across candidates or
    /// into live risk accounting (invariant #7).
    pub async fn walker_run(
        self: &Arc<Self>,
        symbol: &str,
        walker_name: &str,
        exchange_name: &str,
        frame_name: &str,
    ) -> Result<WalkerOutcome, EngineError> {
        self.freeze();

        let walker_schema = self.walkers.require(walker_name)?;
        let frame = self.frames.require(frame_name)?;
        let exchange = self.exchange_client(exchange_name).await?;

        if walker_schema.strategy_names.is_empty() {
            return Err(EngineError::Configuration {
                reason: format!("walker '{walker_name}' declares no candidate strategies"),
            });
        }

        let mut candidates = Vec::with_capacity(walker_schema.strategy_names.len());
        for strategy_name in &walker_schema.strategy_names {
            let strategy = self.strategies.require(strategy_name)?;
            self.validate_interval_pairing(frame_name, frame.as_ref(), strategy_name, strategy.as_ref())?;
            let risk = self.ephemeral_risk_gate(strategy.as_ref()).await?;
            candidates.push(WalkerCandidate {
                strategy_name: strategy_name.clone(),
                strategy,
                risk,
            });
        }

        let driver = WalkerDriver::new(
            symbol,
            exchange,
            self.bus.clone(),
            self.config.clone(),
            walker_schema.metric.clone(),
        );
        driver.run(candidates, frame.as_ref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tempfile::tempdir;

    use crate::domain::errors::EngineError as EngineErr;
    use crate::domain::ports::Context;
    use crate::domain::signal::SignalCandidate;
    use crate::domain::types::{Candle, CandleInterval, Position};

    struct FlatExchange;
    #[async_trait]
    impl ExchangeSchema for FlatExchange {
        fn name(&self) -> &str {
            "flat"
        }
        async fn fetch_candles(
            &self,
            _symbol: &str,
            _interval: CandleInterval,
            since_ms: i64,
            limit: usize,
        ) -> Result<Vec<Candle>, EngineErr> {
            Ok((0..limit)
                .map(|i| {
                    let ts = since_ms + (i as i64) * 60_000;
                    Candle { timestamp_ms: ts, open: 100.0, high: 100.0, low: 100.0, close: 100.0, volume: 1.0 }
                })
                .collect())
        }
    }

    struct NeverSignalStrategy {
        interval: CandleInterval,
    }
    #[async_trait]
    impl StrategySchema for NeverSignalStrategy {
        fn name(&self) -> &str {
            "never"
        }
        fn interval(&self) -> CandleInterval {
            self.interval
        }
        async fn get_signal(
            &self,
            _ctx: &Context,
            _symbol: &str,
        ) -> Result<Option<SignalCandidate>, EngineErr> {
            Ok(None)
        }
    }

    struct QuickWinStrategy;
    #[async_trait]
    impl StrategySchema for QuickWinStrategy {
        fn name(&self) -> &str {
            "quick-win"
        }
        fn interval(&self) -> CandleInterval {
            CandleInterval::OneMin
        }
        async fn get_signal(
            &self,
            _ctx: &Context,
            _symbol: &str,
        ) -> Result<Option<SignalCandidate>, EngineErr> {
            Ok(Some(SignalCandidate {
                position: Position::Long,
                price_take_profit: 103.0,
                price_stop_loss: 90.0,
                minute_estimated_time: 10,
                price_open_target: None,
                note: None,
                id: None,
            }))
        }
    }

    /// Climbs steadily so a long opened near the start comfortably clears
    /// both fees and slippage by the time it hits take-profit.
    struct RisingExchange;
    #[async_trait]
    impl ExchangeSchema for RisingExchange {
        fn name(&self) -> &str {
            "rising"
        }
        async fn fetch_candles(
            &self,
            _symbol: &str,
            _interval: CandleInterval,
            since_ms: i64,
            limit: usize,
        ) -> Result<Vec<Candle>, EngineErr> {
            Ok((0..limit)
                .map(|i| {
                    let ts = since_ms + (i as i64) * 60_000;
                    let close = 100.0 + (i as f64) * 0.5;
                    Candle {
                        timestamp_ms: ts,
                        open: close,
                        high: close + 0.1,
                        low: close - 0.1,
                        close,
                        volume: 1.0,
                    }
                })
                .collect())
        }
    }

    struct DailyFrame;
    impl FrameSchema for DailyFrame {
        fn name(&self) -> &str {
            "daily"
        }
        fn interval(&self) -> CandleInterval {
            CandleInterval::OneMin
        }
        fn start_date_ms(&self) -> i64 {
            0
        }
        fn end_date_ms(&self) -> i64 {
            10 * 60_000
        }
    }

    struct HourlyFrame;
    impl FrameSchema for HourlyFrame {
        fn name(&self) -> &str {
            "hourly"
        }
        fn interval(&self) -> CandleInterval {
            CandleInterval::OneHour
        }
        fn start_date_ms(&self) -> i64 {
            0
        }
        fn end_date_ms(&self) -> i64 {
            60 * 60_000
        }
    }

    fn engine(root: &std::path::Path) -> Arc<Engine> {
        let mut config = Config::default();
        config.persistence_root = root.to_path_buf();
        Engine::new(Arc::new(config))
    }

    #[tokio::test]
    async fn backtest_run_rejects_frame_strategy_interval_mismatch() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        engine
            .register_strategy("never", Arc::new(NeverSignalStrategy { interval: CandleInterval::FifteenMin }))
            .unwrap();
        engine.register_exchange("flat", Arc::new(FlatExchange)).unwrap();
        engine.register_frame("daily", Arc::new(DailyFrame)).unwrap();

        let err = engine
            .backtest_run("BTCUSDT", "never", "flat", "daily")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration { .. }));
    }

    #[tokio::test]
    async fn backtest_run_rejects_strategy_interval_above_one_hour() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        engine
            .register_strategy("never", Arc::new(NeverSignalStrategy { interval: CandleInterval::FourHour }))
            .unwrap();
        engine.register_exchange("flat", Arc::new(FlatExchange)).unwrap();
        engine.register_frame("hourly", Arc::new(HourlyFrame)).unwrap();

        let err = engine
            .backtest_run("BTCUSDT", "never", "flat", "hourly")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration { .. }));
    }

    #[tokio::test]
    async fn backtest_run_releases_client_after_completion() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        engine
            .register_strategy("never", Arc::new(NeverSignalStrategy { interval: CandleInterval::OneMin }))
            .unwrap();
        engine.register_exchange("flat", Arc::new(FlatExchange)).unwrap();
        engine.register_frame("daily", Arc::new(DailyFrame)).unwrap();

        engine.backtest_run("BTCUSDT", "never", "flat", "daily").await.unwrap();
        assert!(engine.strategy_clients.lock().await.is_empty());
    }

    #[tokio::test]
    async fn exchange_client_is_memoised_across_calls() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        engine.register_exchange("flat", Arc::new(FlatExchange)).unwrap();

        let a = engine.exchange_client("flat").await.unwrap();
        let b = engine.exchange_client("flat").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn walker_run_picks_the_winning_candidate() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        engine
            .register_strategy("never", Arc::new(NeverSignalStrategy { interval: CandleInterval::OneMin }))
            .unwrap();
        engine.register_strategy("quick-win", Arc::new(QuickWinStrategy)).unwrap();
        engine.register_exchange("rising", Arc::new(RisingExchange)).unwrap();
        engine.register_frame("daily", Arc::new(DailyFrame)).unwrap();
        engine
            .register_walker(
                "sweep",
                Arc::new(WalkerSchema::new(
                    "sweep",
                    vec!["never".to_string(), "quick-win".to_string()],
                    Arc::new(crate::application::drivers::walker::total_net_pnl_metric),
                )),
            )
            .unwrap();

        let outcome = engine.walker_run("BTCUSDT", "sweep", "rising", "daily").await.unwrap();
        assert_eq!(outcome.winner_strategy, "quick-win");
    }

    #[tokio::test]
    async fn walker_run_rejects_empty_candidate_list() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        engine.register_exchange("flat", Arc::new(FlatExchange)).unwrap();
        engine.register_frame("daily", Arc::new(DailyFrame)).unwrap();
        engine
            .register_walker("sweep", Arc::new(WalkerSchema::new("sweep", vec![], Arc::new(crate::application::drivers::walker::total_net_pnl_metric))))
            .unwrap();

        let err = engine.walker_run("BTCUSDT", "sweep", "flat", "daily").await.unwrap_err();
        assert!(matches!(err, EngineError::Configuration { .. }));
    }

    #[tokio::test]
    async fn registration_after_first_run_is_rejected() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        engine
            .register_strategy("never", Arc::new(NeverSignalStrategy { interval: CandleInterval::OneMin }))
            .unwrap();
        engine.register_exchange("flat", Arc::new(FlatExchange)).unwrap();
        engine.register_frame("daily", Arc::new(DailyFrame)).unwrap();

        engine.backtest_run("BTCUSDT", "never", "flat", "daily").await.unwrap();

        let err = engine.register_strategy("late", Arc::new(NeverSignalStrategy { interval: CandleInterval::OneMin }));
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn stop_reports_error_for_unknown_client() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        let err = engine.stop("BTCUSDT", "never", true).await.unwrap_err();
        assert!(matches!(err, EngineError::Configuration { .. }));
    }
}
