//! Headless demo: wires a synthetic exchange and two demo strategies through
//! the Backtest Driver, sharing one risk profile, and prints a report table.
//! Grounded on the teacher's `src/bin/server.rs` entry-point shape (dotenv,
//! tracing, `Config::from_env`).

use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use tracing::info;

use signal_lifecycle_engine::application::drivers::backtest::BacktestDriver;
use signal_lifecycle_engine::application::event_bus::EventBus;
use signal_lifecycle_engine::application::exchange_client::ExchangeClient;
use signal_lifecycle_engine::application::partial_tracker::PartialTracker;
use signal_lifecycle_engine::application::report_accumulator::ReportAccumulator;
use signal_lifecycle_engine::application::risk_predicates::{MaxConcurrentPositions, MaxConcurrentPositionsConfig};
use signal_lifecycle_engine::application::risk_validator::{RiskGate, RiskValidator};
use signal_lifecycle_engine::application::strategy_client::StrategyClient;
use signal_lifecycle_engine::config::Config;
use signal_lifecycle_engine::domain::errors::EngineError;
use signal_lifecycle_engine::domain::ports::{Context, ExchangeSchema, FrameSchema, StrategySchema};
use signal_lifecycle_engine::domain::signal::SignalCandidate;
use signal_lifecycle_engine::domain::types::{Candle, CandleInterval, Position};
use signal_lifecycle_engine::infrastructure::persistence::PersistenceLayer;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "DEMOUSDT")]
    symbol: String,

    #[arg(long, default_value_t = 600_000)]
    duration_ms: i64,
}

struct SineExchange;

#[async_trait]
impl ExchangeSchema for SineExchange {
    fn name(&self) -> &str {
        "sine-demo"
    }

    async fn fetch_candles(
        &self,
        _symbol: &str,
        _interval: CandleInterval,
        since_ms: i64,
        limit: usize,
    ) -> Result<Vec<Candle>, EngineError> {
        let candles = (0..limit)
            .map(|i| {
                let ts = since_ms + (i as i64) * 60_000;
                let wave = ((ts as f64) / 600_000.0).sin() * 2.0;
                let close = 100.0 + wave;
                Candle {
                    timestamp_ms: ts,
                    open: close,
                    high: close + 0.5,
                    low: close - 0.5,
                    close,
                    volume: 10.0,
                }
            })
            .collect();
        Ok(candles)
    }
}

struct MeanReversionDemo;

#[async_trait]
impl StrategySchema for MeanReversionDemo {
    fn name(&self) -> &str {
        "mean-reversion-demo"
    }

    fn interval(&self) -> CandleInterval {
        CandleInterval::FiveMin
    }

    fn risk_name(&self) -> Option<&str> {
        Some("demo-shared-cap")
    }

    async fn get_signal(
        &self,
        _ctx: &Context,
        _symbol: &str,
    ) -> Result<Option<SignalCandidate>, EngineError> {
        Ok(Some(SignalCandidate {
            position: Position::Long,
            price_take_profit: 101.5,
            price_stop_loss: 98.5,
            minute_estimated_time: 120,
            price_open_target: None,
            note: Some("demo long, fixed TP/SL band".to_string()),
            id: None,
        }))
    }
}

/// A second demo strategy that actually reads market data: a fast/slow SMA
/// crossover over the one-minute candles the exchange serves, grounded on
/// the teacher's `application/strategies/dual_sma.rs` golden-cross rule.
struct DualSmaCrossoverDemo {
    exchange: Arc<ExchangeClient>,
    fast_period: usize,
    slow_period: usize,
    threshold: f64,
}

#[async_trait]
impl StrategySchema for DualSmaCrossoverDemo {
    fn name(&self) -> &str {
        "dual-sma-crossover-demo"
    }

    fn interval(&self) -> CandleInterval {
        CandleInterval::OneMin
    }

    fn risk_name(&self) -> Option<&str> {
        Some("demo-shared-cap")
    }

    async fn get_signal(
        &self,
        ctx: &Context,
        symbol: &str,
    ) -> Result<Option<SignalCandidate>, EngineError> {
        let candles = self
            .exchange
            .get_candles(ctx, symbol, CandleInterval::OneMin, self.slow_period)
            .await?;
        if candles.len() < self.slow_period {
            return Ok(None);
        }

        let slow_sma = average_close(&candles);
        let fast_sma = average_close(&candles[candles.len() - self.fast_period..]);

        if fast_sma > slow_sma * (1.0 + self.threshold) {
            let price = candles.last().expect("checked non-empty above").close;
            Ok(Some(SignalCandidate {
                position: Position::Long,
                price_take_profit: price * 1.01,
                price_stop_loss: price * 0.985,
                minute_estimated_time: 90,
                price_open_target: None,
                note: Some(format!("golden cross fast={fast_sma:.3} slow={slow_sma:.3}")),
                id: None,
            }))
        } else {
            Ok(None)
        }
    }
}

fn average_close(candles: &[Candle]) -> f64 {
    candles.iter().map(|c| c.close).sum::<f64>() / candles.len() as f64
}

struct DemoFrame {
    end_ms: i64,
}

impl FrameSchema for DemoFrame {
    fn name(&self) -> &str {
        "demo-frame"
    }
    fn interval(&self) -> CandleInterval {
        CandleInterval::OneMin
    }
    fn start_date_ms(&self) -> i64 {
        0
    }
    fn end_date_ms(&self) -> i64 {
        self.end_ms
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Arc::new(Config::from_env()?);
    info!("starting demo run for {} over {}ms", cli.symbol, cli.duration_ms);

    let bus = EventBus::new();
    let persistence = Arc::new(PersistenceLayer::new(&config.persistence_root));
    let exchange = ExchangeClient::new(Arc::new(SineExchange), config.clone());

    let report = ReportAccumulator::new(config.report_ring_capacity);
    report.attach(&bus);

    let shared_risk = RiskValidator::new(
        "demo-shared-cap",
        vec![Arc::new(MaxConcurrentPositions::new(MaxConcurrentPositionsConfig { max_positions: 1 }))],
        persistence.clone(),
        bus.clone(),
    );

    let mean_reversion_client = StrategyClient::new(
        cli.symbol.clone(),
        true,
        Arc::new(MeanReversionDemo),
        exchange.clone(),
        Some(RiskGate::Single(shared_risk.clone())),
        PartialTracker::new(persistence.clone(), bus.clone()),
        bus.clone(),
        config.clone(),
        persistence.clone(),
    );
    let dual_sma_client = StrategyClient::new(
        cli.symbol.clone(),
        true,
        Arc::new(DualSmaCrossoverDemo { exchange: exchange.clone(), fast_period: 5, slow_period: 20, threshold: 0.002 }),
        exchange.clone(),
        Some(RiskGate::Single(shared_risk)),
        PartialTracker::new(persistence.clone(), bus.clone()),
        bus.clone(),
        config.clone(),
        persistence.clone(),
    );

    let frame = DemoFrame { end_ms: cli.duration_ms };

    let mean_reversion_driver = BacktestDriver::new(mean_reversion_client, exchange.clone(), bus.clone(), config.clone());
    let mean_reversion_results = mean_reversion_driver.run(&frame).await?;
    info!("mean-reversion-demo produced {} terminal results", mean_reversion_results.len());

    let dual_sma_driver = BacktestDriver::new(dual_sma_client, exchange, bus, config);
    let dual_sma_results = dual_sma_driver.run(&frame).await?;
    info!("dual-sma-crossover-demo produced {} terminal results", dual_sma_results.len());

    for result in mean_reversion_results.iter().chain(dual_sma_results.iter()) {
        println!("{result:?}");
    }

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    println!("{}", report.render_table().await);
    let summary = report.aggregate_summary().await;
    println!(
        "pairs_tracked={} profitable_pairs={} total_closed={} average_net_pnl={:.4}",
        summary.pairs_tracked, summary.profitable_pairs, summary.total_closed, summary.average_net_pnl
    );

    Ok(())
}
