//! Candle retrieval with temporal isolation and VWAP (spec.md §4.1).

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::Config;
use crate::domain::errors::EngineError;
use crate::domain::ports::{Context, ExchangeSchema};
use crate::domain::types::{Candle, CandleInterval};

/// Per-symbol rolling candle cache capacity. Bounds memory for long-lived
/// live sessions; unrelated to any particular strategy's lookback.
const BUFFER_CAPACITY: usize = 1_500;

pub struct ExchangeClient {
    schema: Arc<dyn ExchangeSchema>,
    config: Arc<Config>,
    buffers: RwLock<HashMap<String, Vec<Candle>>>,
}

impl ExchangeClient {
    pub fn new(schema: Arc<dyn ExchangeSchema>, config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            schema,
            config,
            buffers: RwLock::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        self.schema.name()
    }

    /// Fetch the last `limit` candles of `interval`, ending at
    /// `ctx.when_ms`. Never returns a candle with `timestamp_ms >
    /// ctx.when_ms` (invariant #3, spec.md §8), and drops candles whose
    /// O/H/L/C is zero, NaN, or infinite.
    ///
    /// One-minute requests are served from the per-symbol rolling buffer
    /// when it already covers `[since_ms, ctx.when_ms]`, so a strategy
    /// ticking every minute doesn't re-fetch the same window from the
    /// exchange on every call; a miss falls through to the schema and
    /// backfills the buffer.
    pub async fn get_candles(
        &self,
        ctx: &Context,
        symbol: &str,
        interval: CandleInterval,
        limit: usize,
    ) -> Result<Vec<Candle>, EngineError> {
        let since_ms = ctx.when_ms - (limit as i64) * interval.to_ms();

        if interval == CandleInterval::OneMin {
            if let Some(cached) = self.read_buffer(symbol, since_ms, ctx.when_ms, limit).await {
                return Ok(cached);
            }
        }

        let mut candles = self
            .fetch_with_retry(symbol, interval, since_ms, limit)
            .await?;

        candles.retain(|c| c.timestamp_ms <= ctx.when_ms && c.is_sane());
        candles.sort_by_key(|c| c.timestamp_ms);

        if interval == CandleInterval::OneMin {
            self.update_buffer(symbol, &candles).await;
        }

        Ok(candles)
    }

    /// Forward-looking fetch used only by the Backtest Driver's fast-fold
    /// (spec.md §4.5, §4.7, §9 open question 4). Must never be called
    /// from a live driver.
    pub async fn get_next_candles(
        &self,
        ctx: &Context,
        symbol: &str,
        interval: CandleInterval,
        limit: usize,
    ) -> Result<Vec<Candle>, EngineError> {
        if !ctx.backtest {
            return Err(EngineError::Internal {
                component: "ExchangeClient".into(),
                reason: "get_next_candles called outside backtest mode".into(),
            });
        }

        let mut candles = self
            .fetch_with_retry(symbol, interval, ctx.when_ms, limit)
            .await?;
        candles.retain(|c| c.is_sane());
        candles.sort_by_key(|c| c.timestamp_ms);
        Ok(candles)
    }

    /// VWAP over the most recent `VWAP_CANDLE_COUNT` one-minute candles.
    pub async fn get_average_price(&self, ctx: &Context, symbol: &str) -> Result<f64, EngineError> {
        let candles = self
            .get_candles(ctx, symbol, CandleInterval::OneMin, self.config.vwap_candle_count)
            .await?;
        vwap(&candles).ok_or_else(|| EngineError::NoLiquidity {
            symbol: symbol.to_string(),
            candles: self.config.vwap_candle_count,
        })
    }

    pub fn format_price(&self, symbol: &str, price: f64) -> String {
        self.schema.format_price(symbol, price)
    }

    pub fn format_quantity(&self, symbol: &str, quantity: f64) -> String {
        self.schema.format_quantity(symbol, quantity)
    }

    /// Returns a window from the rolling buffer only when it already holds
    /// at least `limit` candles at or before `since_ms` through `when_ms`;
    /// a buffer that hasn't been warmed up yet, or one whose oldest entry
    /// is newer than `since_ms`, is reported as a miss rather than served
    /// short.
    async fn read_buffer(
        &self,
        symbol: &str,
        since_ms: i64,
        when_ms: i64,
        limit: usize,
    ) -> Option<Vec<Candle>> {
        let buffers = self.buffers.read().await;
        let buf = buffers.get(symbol)?;
        let oldest = buf.first()?.timestamp_ms;
        if oldest > since_ms {
            return None;
        }
        let window: Vec<Candle> = buf
            .iter()
            .filter(|c| c.timestamp_ms > since_ms && c.timestamp_ms <= when_ms)
            .copied()
            .collect();
        if window.len() >= limit {
            Some(window)
        } else {
            None
        }
    }

    async fn update_buffer(&self, symbol: &str, candles: &[Candle]) {
        let mut buffers = self.buffers.write().await;
        let buf = buffers.entry(symbol.to_string()).or_default();
        for c in candles {
            if !buf.iter().any(|existing| existing.timestamp_ms == c.timestamp_ms) {
                buf.push(*c);
            }
        }
        buf.sort_by_key(|c| c.timestamp_ms);
        if buf.len() > BUFFER_CAPACITY {
            let overflow = buf.len() - BUFFER_CAPACITY;
            buf.drain(0..overflow);
        }
    }

    async fn fetch_with_retry(
        &self,
        symbol: &str,
        interval: CandleInterval,
        since_ms: i64,
        limit: usize,
    ) -> Result<Vec<Candle>, EngineError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.schema.fetch_candles(symbol, interval, since_ms, limit).await {
                Ok(candles) => return Ok(candles),
                Err(e) => {
                    if attempt > self.config.candle_fetch_retries {
                        return Err(EngineError::CandleFetch {
                            symbol: symbol.to_string(),
                            attempts: attempt,
                            reason: e.to_string(),
                        });
                    }
                    warn!(
                        "candle fetch for {symbol} failed (attempt {attempt}/{}): {e}; retrying",
                        self.config.candle_fetch_retries + 1
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(self.config.retry_delay_ms))
                        .await;
                }
            }
        }
    }
}

/// `Σ((H+L+C)/3 · V) / Σ(V)`. `None` when total volume is zero.
pub fn vwap(candles: &[Candle]) -> Option<f64> {
    let total_volume: f64 = candles.iter().map(|c| c.volume).sum();
    if total_volume == 0.0 {
        debug!("vwap: zero total volume over {} candles", candles.len());
        return None;
    }
    let weighted: f64 = candles.iter().map(|c| c.typical_price() * c.volume).sum();
    Some(weighted / total_volume)
}
