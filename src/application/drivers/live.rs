//! Live Driver (spec.md §4.6): a `TICK_TTL`-paced loop around the Strategy
//! Client, yielding only `opened`/`closed` to its caller while every result
//! still flows through the event bus.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::application::strategy_client::StrategyClient;
use crate::config::Config;
use crate::domain::errors::EngineError;
use crate::domain::event::{EngineEvent, EventMeta};
use crate::domain::tick_result::TickResult;

use crate::application::event_bus::EventBus;

pub struct LiveDriver {
    client: Arc<StrategyClient>,
    bus: Arc<EventBus>,
    config: Arc<Config>,
}

impl LiveDriver {
    pub fn new(client: Arc<StrategyClient>, bus: Arc<EventBus>, config: Arc<Config>) -> Self {
        Self { client, bus, config }
    }

    pub fn stop_handle(&self) -> Arc<StrategyClient> {
        self.client.clone()
    }

    /// Runs until `stop()` is called on the client or an unrecoverable
    /// fault publishes `Exit`. `now_ms` supplies wall-clock time per tick
    /// (injected so tests don't depend on real time).
    pub async fn run(&self, mut now_ms: impl FnMut() -> i64) -> Vec<TickResult> {
        let mut yielded = Vec::new();

        loop {
            let t0 = Instant::now();
            let when = now_ms();

            let result = match self.client.tick(when).await {
                Ok(r) => r,
                Err(e) => {
                    warn!("live tick error on {}: {e}", self.client.symbol());
                    self.bus.publish(EngineEvent::Error {
                        meta: EventMeta::new(when, false)
                            .with_symbol(self.client.symbol())
                            .with_strategy(self.client.strategy_name())
                            .with_exchange(self.client.exchange_name()),
                        message: e.to_string(),
                    });
                    if !e.is_transient() {
                        self.bus.publish(EngineEvent::Exit {
                            meta: EventMeta::new(when, false).with_symbol(self.client.symbol()),
                            reason: e.to_string(),
                        });
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(self.config.tick_ttl_ms)).await;
                    continue;
                }
            };

            self.bus.publish(EngineEvent::Performance {
                meta: EventMeta::new(when, false).with_symbol(self.client.symbol()),
                duration_ms: t0.elapsed().as_millis() as u64,
            });

            let stopped = self.client.is_stopped().await;
            match &result {
                TickResult::Idle => {
                    if stopped {
                        break;
                    }
                }
                TickResult::Opened { .. } => yielded.push(result.clone()),
                TickResult::Closed { .. } => {
                    yielded.push(result.clone());
                    if stopped {
                        break;
                    }
                }
                TickResult::Active { .. } | TickResult::Scheduled { .. } | TickResult::Cancelled { .. } => {}
            }

            tokio::time::sleep(Duration::from_millis(self.config.tick_ttl_ms)).await;
        }

        self.bus.publish(EngineEvent::DoneLive {
            meta: EventMeta::new(now_ms(), false)
                .with_symbol(self.client.symbol())
                .with_strategy(self.client.strategy_name())
                .with_exchange(self.client.exchange_name()),
        });

        yielded
    }
}

#[allow(dead_code)]
fn _assert_error_is_transient_usable(e: &EngineError) -> bool {
    e.is_transient()
}
