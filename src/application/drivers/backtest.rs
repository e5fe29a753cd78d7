//! Backtest Driver (spec.md §4.5): iterates a frame's timestamps, delegating
//! to the Strategy Client's `tick` to probe and `backtest` to fast-fold.

use std::sync::Arc;
use tracing::warn;

use crate::application::strategy_client::StrategyClient;
use crate::config::Config;
use crate::domain::errors::EngineError;
use crate::domain::event::{EngineEvent, EventMeta};
use crate::domain::ports::{Context, FrameSchema};
use crate::domain::tick_result::TickResult;
use crate::domain::types::CandleInterval;

use crate::application::event_bus::EventBus;
use crate::application::exchange_client::ExchangeClient;

pub struct BacktestDriver {
    client: Arc<StrategyClient>,
    exchange: Arc<ExchangeClient>,
    bus: Arc<EventBus>,
    config: Arc<Config>,
}

impl BacktestDriver {
    pub fn new(
        client: Arc<StrategyClient>,
        exchange: Arc<ExchangeClient>,
        bus: Arc<EventBus>,
        config: Arc<Config>,
    ) -> Self {
        Self { client, exchange, bus, config }
    }

    /// Runs the frame to completion, returning every `closed`/`cancelled`
    /// result in order (spec.md §4.5: "only closed and cancelled results
    /// are yielded"). Errors in a single tick are logged, published, and
    /// skip that frame index rather than aborting the whole run.
    pub async fn run(&self, frame: &dyn FrameSchema) -> Result<Vec<TickResult>, EngineError> {
        let timestamps = frame.timestamps();
        let n = timestamps.len();
        let mut yielded = Vec::new();
        let mut i = 0usize;

        while i < n {
            if self.client.is_stopped().await {
                break;
            }

            self.bus.publish(EngineEvent::ProgressBacktest {
                meta: EventMeta::new(timestamps[i], true),
                index: i,
                total: n,
            });

            let when = timestamps[i];
            let core_before_tick = self.client.current_core().await;

            let tick_result = match self.client.tick(when).await {
                Ok(r) => r,
                Err(e) => {
                    warn!("backtest tick error at {when} on {}: {e}", self.client.symbol());
                    self.bus.publish(EngineEvent::Error {
                        meta: EventMeta::new(when, true)
                            .with_symbol(self.client.symbol())
                            .with_strategy(self.client.strategy_name())
                            .with_exchange(self.client.exchange_name()),
                        message: e.to_string(),
                    });
                    i += 1;
                    continue;
                }
            };

            if !matches!(tick_result, TickResult::Opened { .. } | TickResult::Scheduled { .. }) {
                i += 1;
                continue;
            }

            let scheduled_at = core_before_tick
                .as_ref()
                .map(|c| c.scheduled_at)
                .unwrap_or(when);
            let minute_estimated_time = self
                .client
                .current_core()
                .await
                .map(|c| c.minute_estimated_time)
                .unwrap_or(self.config.max_lifetime_min);
            let is_scheduled = matches!(tick_result, TickResult::Scheduled { .. });

            let vwap_buffer = self.config.vwap_candle_count as i64;
            let fetch_from = when - (vwap_buffer.saturating_sub(1)) * 60_000;
            let mut limit = (minute_estimated_time + vwap_buffer).max(1) as usize;
            if is_scheduled {
                limit += (self.config.schedule_await_minutes).max(0) as usize;
            }

            let fetch_ctx = Context {
                symbol: self.client.symbol().to_string(),
                strategy_name: self.client.strategy_name().to_string(),
                exchange_name: self.client.exchange_name().to_string(),
                when_ms: fetch_from,
                backtest: true,
            };

            let buffer = match self
                .exchange
                .get_next_candles(&fetch_ctx, self.client.symbol(), CandleInterval::OneMin, limit)
                .await
            {
                Ok(c) => c,
                Err(e) => {
                    warn!("backtest buffer fetch error at {when}: {e}");
                    self.bus.publish(EngineEvent::Error {
                        meta: EventMeta::new(when, true).with_symbol(self.client.symbol()),
                        message: e.to_string(),
                    });
                    i += 1;
                    continue;
                }
            };

            let fold = match self.client.backtest(&buffer, when).await {
                Ok(r) => r,
                Err(e) => {
                    warn!("backtest fold error at {when}: {e}");
                    self.bus.publish(EngineEvent::Error {
                        meta: EventMeta::new(when, true).with_symbol(self.client.symbol()),
                        message: e.to_string(),
                    });
                    i += 1;
                    continue;
                }
            };

            let advance_to_ms = match &fold {
                TickResult::Closed { close_timestamp_ms, .. } => *close_timestamp_ms,
                TickResult::Cancelled { .. } => {
                    scheduled_at + self.config.schedule_await_minutes * 60_000
                }
                _ => when,
            };

            if matches!(fold, TickResult::Closed { .. } | TickResult::Cancelled { .. }) {
                yielded.push(fold);
            }

            let before = i;
            while i < n && timestamps[i] <= advance_to_ms {
                i += 1;
            }
            if i == before {
                i += 1;
            }
        }

        self.bus.publish(EngineEvent::DoneBacktest {
            meta: EventMeta::new(timestamps.last().copied().unwrap_or(0), true)
                .with_symbol(self.client.symbol())
                .with_strategy(self.client.strategy_name())
                .with_exchange(self.client.exchange_name()),
        });

        Ok(yielded)
    }
}
