//! End-to-end scenario tests exercising the public driver surface.

use std::sync::Arc;

use async_trait::async_trait;
use tempfile::tempdir;

use signal_lifecycle_engine::application::event_bus::EventBus;
use signal_lifecycle_engine::application::exchange_client::ExchangeClient;
use signal_lifecycle_engine::application::partial_tracker::PartialTracker;
use signal_lifecycle_engine::application::risk_validator::{RiskGate, RiskValidator};
use signal_lifecycle_engine::application::strategy_client::StrategyClient;
use signal_lifecycle_engine::config::Config;
use signal_lifecycle_engine::domain::errors::EngineError;
use signal_lifecycle_engine::domain::ports::{Context, ExchangeSchema, RiskPredicate, StrategySchema};
use signal_lifecycle_engine::domain::risk::RiskValidationRequest;
use signal_lifecycle_engine::domain::signal::SignalCandidate;
use signal_lifecycle_engine::domain::tick_result::TickResult;
use signal_lifecycle_engine::domain::types::{Candle, CandleInterval, CloseReason, Position};
use signal_lifecycle_engine::infrastructure::persistence::PersistenceLayer;

struct FlatExchange {
    close: f64,
}

#[async_trait]
impl ExchangeSchema for FlatExchange {
    fn name(&self) -> &str {
        "mock"
    }

    async fn fetch_candles(
        &self,
        _symbol: &str,
        _interval: CandleInterval,
        since_ms: i64,
        limit: usize,
    ) -> Result<Vec<Candle>, EngineError> {
        Ok((0..limit)
            .map(|i| {
                let ts = since_ms + (i as i64) * 60_000;
                Candle {
                    timestamp_ms: ts,
                    open: self.close,
                    high: self.close,
                    low: self.close,
                    close: self.close,
                    volume: 5.0,
                }
            })
            .collect())
    }
}

struct FixedSignalStrategy {
    position: Position,
    tp: f64,
    sl: f64,
    minutes: i64,
    target: Option<f64>,
}

#[async_trait]
impl StrategySchema for FixedSignalStrategy {
    fn name(&self) -> &str {
        "fixed"
    }
    fn interval(&self) -> CandleInterval {
        CandleInterval::OneMin
    }
    async fn get_signal(
        &self,
        _ctx: &Context,
        _symbol: &str,
    ) -> Result<Option<SignalCandidate>, EngineError> {
        Ok(Some(SignalCandidate {
            position: self.position,
            price_take_profit: self.tp,
            price_stop_loss: self.sl,
            minute_estimated_time: self.minutes,
            price_open_target: self.target,
            note: None,
            id: None,
        }))
    }
}

fn fresh_stack(close: f64) -> (Arc<ExchangeClient>, Arc<EventBus>, Arc<Config>, Arc<PersistenceLayer>, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let persistence = Arc::new(PersistenceLayer::new(dir.path()));
    let bus = EventBus::new();
    let config = Arc::new(Config::default());
    let exchange = ExchangeClient::new(Arc::new(FlatExchange { close }), config.clone());
    (exchange, bus, config, persistence, dir)
}

/// S1: an immediate-entry long whose TP band sits inside the flat candle
/// closes as `take_profit` on the very first monitored candle.
#[tokio::test]
async fn s1_immediate_take_profit() {
    let (exchange, bus, config, persistence, _dir) = fresh_stack(100.0);
    let partials = PartialTracker::new(persistence.clone(), bus.clone());

    let strategy = Arc::new(FixedSignalStrategy {
        position: Position::Long,
        tp: 100.3,
        sl: 99.0,
        minutes: 60,
        target: None,
    });

    let client = StrategyClient::new(
        "BTCUSDT", true, strategy, exchange, None, partials, bus, config, persistence,
    );

    let opened = client.tick(0).await.unwrap();
    assert!(matches!(opened, TickResult::Opened { .. }));

    // A candle whose high touches the take-profit band.
    let hit = Candle { timestamp_ms: 60_000, open: 100.0, high: 100.4, low: 99.9, close: 100.1, volume: 5.0 };
    let fold = client.backtest(&[hit], 60_000).await.unwrap();
    match fold {
        TickResult::Closed { close_reason, .. } => assert_eq!(close_reason, CloseReason::TakeProfit),
        other => panic!("expected closed, got {other:?}"),
    }
}

/// S2: a scheduled signal activates once its limit price is touched, then
/// is later closed on stop-loss.
#[tokio::test]
async fn s2_scheduled_activation_then_stop_loss() {
    let (exchange, bus, config, persistence, _dir) = fresh_stack(100.0);
    let partials = PartialTracker::new(persistence.clone(), bus.clone());

    let strategy = Arc::new(FixedSignalStrategy {
        position: Position::Long,
        tp: 105.0,
        sl: 95.0,
        minutes: 120,
        target: Some(99.0),
    });

    let client = StrategyClient::new(
        "ETHUSDT", true, strategy, exchange, None, partials, bus, config, persistence,
    );

    let scheduled = client.tick(0).await.unwrap();
    assert!(matches!(scheduled, TickResult::Scheduled { .. }));

    let touches_target = vec![Candle { timestamp_ms: 60_000, open: 100.0, high: 100.0, low: 98.5, close: 99.0, volume: 5.0 }];
    let activated = client.backtest(&touches_target, 60_000).await.unwrap();
    assert!(matches!(activated, TickResult::Opened { .. }));

    let drops_through_sl = vec![Candle { timestamp_ms: 120_000, open: 99.0, high: 99.0, low: 94.0, close: 94.5, volume: 5.0 }];
    let closed = client.backtest(&drops_through_sl, 120_000).await.unwrap();
    match closed {
        TickResult::Closed { close_reason, .. } => assert_eq!(close_reason, CloseReason::StopLoss),
        other => panic!("expected closed, got {other:?}"),
    }
}

/// S3: a scheduled signal that never touches its target within
/// `schedule_await_minutes` is cancelled.
#[tokio::test]
async fn s3_schedule_expires_uncancelled_target() {
    let dir = tempdir().unwrap();
    let persistence = Arc::new(PersistenceLayer::new(dir.path()));
    let bus = EventBus::new();
    let mut cfg = Config::default();
    cfg.schedule_await_minutes = 2;
    let config = Arc::new(cfg);
    let exchange = ExchangeClient::new(Arc::new(FlatExchange { close: 100.0 }), config.clone());
    let partials = PartialTracker::new(persistence.clone(), bus.clone());

    let strategy = Arc::new(FixedSignalStrategy {
        position: Position::Long,
        tp: 110.0,
        sl: 90.0,
        minutes: 60,
        target: Some(50.0), // never touched by a flat-100 market
    });

    let client = StrategyClient::new(
        "SOLUSDT", true, strategy, exchange, None, partials, bus, config, persistence,
    );
    let scheduled = client.tick(0).await.unwrap();
    assert!(matches!(scheduled, TickResult::Scheduled { .. }));

    let never_touches: Vec<Candle> = (1..10)
        .map(|i| Candle { timestamp_ms: i * 60_000, open: 100.0, high: 100.0, low: 100.0, close: 100.0, volume: 5.0 })
        .collect();
    let fold = client.backtest(&never_touches, 60_000).await.unwrap();
    assert!(matches!(fold, TickResult::Cancelled { .. }));
}

/// S4: two strategies sharing a risk profile capped at one position never
/// both hold a position at once.
#[tokio::test]
async fn s4_shared_risk_cap_is_never_exceeded() {
    struct CapOne;
    #[async_trait]
    impl RiskPredicate for CapOne {
        fn name(&self) -> &str {
            "cap-one"
        }
        async fn check(&self, req: &RiskValidationRequest) -> Result<(), String> {
            if req.active_position_count >= 1 {
                Err("cap reached".into())
            } else {
                Ok(())
            }
        }
    }

    let dir = tempdir().unwrap();
    let persistence = Arc::new(PersistenceLayer::new(dir.path()));
    let bus = EventBus::new();
    let config = Arc::new(Config::default());
    let exchange = ExchangeClient::new(Arc::new(FlatExchange { close: 100.0 }), config.clone());

    let shared_risk = RiskValidator::new("shared", vec![Arc::new(CapOne)], persistence.clone(), bus.clone());

    let client_a = StrategyClient::new(
        "BTCUSDT",
        true,
        Arc::new(FixedSignalStrategy { position: Position::Long, tp: 110.0, sl: 90.0, minutes: 60, target: None }),
        exchange.clone(),
        Some(RiskGate::Single(shared_risk.clone())),
        PartialTracker::new(persistence.clone(), bus.clone()),
        bus.clone(),
        config.clone(),
        persistence.clone(),
    );
    let client_b = StrategyClient::new(
        "ETHUSDT",
        true,
        Arc::new(FixedSignalStrategy { position: Position::Long, tp: 110.0, sl: 90.0, minutes: 60, target: None }),
        exchange,
        Some(RiskGate::Single(shared_risk)),
        PartialTracker::new(persistence.clone(), bus.clone()),
        bus,
        config,
        persistence,
    );

    let a = client_a.tick(0).await.unwrap();
    let b = client_b.tick(0).await.unwrap();

    assert!(matches!(a, TickResult::Opened { .. }));
    assert!(matches!(b, TickResult::Idle));
}

/// S4 concurrency variant: ten clients race to open against one shared
/// cap-of-3 risk profile at the same instant. Each predicate check yields
/// before returning, forcing the runtime to interleave callers mid-race;
/// the observed concurrent count must never exceed 3 (spec.md:254,270).
#[tokio::test]
async fn s4b_shared_risk_cap_never_exceeded_under_concurrency() {
    struct YieldingCap(usize);
    #[async_trait]
    impl RiskPredicate for YieldingCap {
        fn name(&self) -> &str {
            "yielding-cap"
        }
        async fn check(&self, req: &RiskValidationRequest) -> Result<(), String> {
            tokio::task::yield_now().await;
            if req.active_position_count >= self.0 {
                Err("cap reached".into())
            } else {
                Ok(())
            }
        }
    }

    let dir = tempdir().unwrap();
    let persistence = Arc::new(PersistenceLayer::new(dir.path()));
    let bus = EventBus::new();
    let config = Arc::new(Config::default());
    let exchange = ExchangeClient::new(Arc::new(FlatExchange { close: 100.0 }), config.clone());
    let cap = 3usize;
    let shared_risk =
        RiskValidator::new("shared", vec![Arc::new(YieldingCap(cap))], persistence.clone(), bus.clone());

    let mut handles = Vec::new();
    for i in 0..10 {
        let client = StrategyClient::new(
            format!("SYM{i}"),
            true,
            Arc::new(FixedSignalStrategy {
                position: Position::Long,
                tp: 110.0,
                sl: 90.0,
                minutes: 60,
                target: None,
            }),
            exchange.clone(),
            Some(RiskGate::Single(shared_risk.clone())),
            PartialTracker::new(persistence.clone(), bus.clone()),
            bus.clone(),
            config.clone(),
            persistence.clone(),
        );
        handles.push(tokio::spawn(async move { client.tick(0).await.unwrap() }));
    }

    let mut opened = 0usize;
    for handle in handles {
        if matches!(handle.await.unwrap(), TickResult::Opened { .. }) {
            opened += 1;
        }
    }

    assert_eq!(opened, cap);
    assert_eq!(shared_risk.active_position_count().await, cap);
}

/// S5: a signal opened before a simulated crash is recovered from disk by
/// a fresh `StrategyClient` in live mode, and closes correctly afterwards.
#[tokio::test]
async fn s5_crash_resume_reloads_open_signal_from_disk() {
    let dir = tempdir().unwrap();
    let persistence = Arc::new(PersistenceLayer::new(dir.path()));
    let bus = EventBus::new();
    let config = Arc::new(Config::default());
    let exchange = ExchangeClient::new(Arc::new(FlatExchange { close: 100.0 }), config.clone());

    let strategy = Arc::new(FixedSignalStrategy {
        position: Position::Long,
        tp: 110.0,
        sl: 90.0,
        minutes: 60,
        target: None,
    });

    {
        let partials = PartialTracker::new(persistence.clone(), bus.clone());
        let client = StrategyClient::new(
            "BTCUSDT",
            false, // live mode: persists to disk
            strategy.clone(),
            exchange.clone(),
            None,
            partials,
            bus.clone(),
            config.clone(),
            persistence.clone(),
        );
        let opened = client.tick(0).await.unwrap();
        assert!(matches!(opened, TickResult::Opened { .. }));
        // `client` is dropped here, simulating a process crash with no
        // graceful shutdown: the only record of the open signal is on disk.
    }

    let partials = PartialTracker::new(persistence.clone(), bus.clone());
    let resumed = StrategyClient::new(
        "BTCUSDT", false, strategy, exchange, None, partials, bus, config, persistence,
    );
    // First tick after restart must reload the persisted signal rather
    // than treating the pair as idle and opening a second position.
    let tick = resumed.tick(60_000).await.unwrap();
    assert!(matches!(tick, TickResult::Active { .. }));
}

/// S6: price drifts +12% -> +11% -> +22%; exactly two `PartialProfit`
/// events fire, for levels 10 and 20, in that order, with no duplicate for
/// the already-crossed 10% band on the dip back to +11%.
#[tokio::test]
async fn s6_partial_milestones_deduped_across_drift() {
    use signal_lifecycle_engine::domain::event::EngineEvent;
    use std::sync::Mutex as StdMutex;

    let (exchange, bus, config, persistence, _dir) = fresh_stack(100.0);
    let partials = PartialTracker::new(persistence.clone(), bus.clone());

    let seen = Arc::new(StdMutex::new(Vec::new()));
    let seen_clone = seen.clone();
    bus.subscribe(
        "PartialProfit",
        Arc::new(move |event| {
            let seen = seen_clone.clone();
            Box::pin(async move {
                if let EngineEvent::PartialProfit { level, .. } = event {
                    seen.lock().unwrap().push(level);
                }
            })
        }),
    );

    let strategy = Arc::new(FixedSignalStrategy {
        position: Position::Long,
        tp: 500.0,
        sl: 10.0,
        minutes: 1_000,
        target: None,
    });

    let client = StrategyClient::new(
        "BTCUSDT", true, strategy, exchange, None, partials, bus, config, persistence,
    );

    let opened = client.tick(0).await.unwrap();
    assert!(matches!(opened, TickResult::Opened { .. }));

    let batch = |base_ts: i64, close: f64| -> Vec<Candle> {
        (0..5)
            .map(|i| Candle {
                timestamp_ms: base_ts + i * 60_000,
                open: close,
                high: close,
                low: close,
                close,
                volume: 1.0,
            })
            .collect()
    };

    // +12% -> crosses level 10.
    let r1 = client.backtest(&batch(60_000, 112.0), 60_000).await.unwrap();
    assert!(matches!(r1, TickResult::Active { .. }));

    // +11% -> still above 10 but below 20; no new crossing.
    let r2 = client.backtest(&batch(360_000, 111.0), 360_000).await.unwrap();
    assert!(matches!(r2, TickResult::Active { .. }));

    // +22% -> crosses level 20.
    let r3 = client.backtest(&batch(660_000, 122.0), 660_000).await.unwrap();
    assert!(matches!(r3, TickResult::Active { .. }));

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let seen = seen.lock().unwrap();
    assert_eq!(*seen, vec![10, 20]);
}
