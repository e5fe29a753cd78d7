//! Partial profit/loss milestone tracking (spec.md §4.3).
//!
//! Wraps `domain::partial::PartialState` with the event-bus publication and
//! persistence side effects the domain type itself stays free of. State is
//! keyed per `(strategy_name, symbol, signal_id)`; a strategy/symbol pair
//! only ever has zero or one live signal at a time (invariant #1), but
//! keying by signal id lets a stale milestone set never leak onto the next
//! signal opened on that pair.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

use crate::domain::errors::EngineError;
use crate::domain::event::{EngineEvent, EventMeta};
use crate::domain::partial::PartialState;
use crate::infrastructure::persistence::PersistenceLayer;

use super::event_bus::EventBus;

type Key = (String, String);

pub struct PartialTracker {
    persistence: Arc<PersistenceLayer>,
    bus: Arc<EventBus>,
    cache: RwLock<HashMap<Key, HashMap<String, PartialState>>>,
}

impl PartialTracker {
    pub fn new(persistence: Arc<PersistenceLayer>, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            persistence,
            bus,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Computes newly crossed milestones for `revenue_pct` and publishes one
    /// `PartialProfit`/`PartialLoss` event per level crossed this call.
    /// Persists the updated map only when something changed and the mode is
    /// live — backtests never touch disk (spec.md §4.8).
    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
        backtest: bool,
        timestamp_ms: i64,
        symbol: &str,
        strategy_name: &str,
        exchange_name: &str,
        signal_id: &str,
        revenue_pct: f64,
    ) -> Result<(), EngineError> {
        let key = (strategy_name.to_string(), symbol.to_string());
        self.ensure_loaded(backtest, &key).await?;

        let (profit_crossed, loss_crossed) = {
            let mut cache = self.cache.write().await;
            let per_signal = cache.entry(key.clone()).or_default();
            let state = per_signal.entry(signal_id.to_string()).or_default();
            (state.cross_profit(revenue_pct), state.cross_loss(revenue_pct))
        };

        for level in &profit_crossed {
            self.bus.publish(EngineEvent::PartialProfit {
                meta: EventMeta::new(timestamp_ms, backtest)
                    .with_symbol(symbol)
                    .with_strategy(strategy_name)
                    .with_exchange(exchange_name),
                signal_id: signal_id.to_string(),
                level: *level,
            });
        }
        for level in &loss_crossed {
            self.bus.publish(EngineEvent::PartialLoss {
                meta: EventMeta::new(timestamp_ms, backtest)
                    .with_symbol(symbol)
                    .with_strategy(strategy_name)
                    .with_exchange(exchange_name),
                signal_id: signal_id.to_string(),
                level: *level,
            });
        }

        if !backtest && (!profit_crossed.is_empty() || !loss_crossed.is_empty()) {
            self.persist(&key).await?;
        }
        Ok(())
    }

    /// Drops in-memory and on-disk milestone state for a closed/cancelled
    /// signal so a future signal on the same pair starts from empty sets.
    pub async fn clear(
        &self,
        backtest: bool,
        strategy_name: &str,
        symbol: &str,
        signal_id: &str,
    ) -> Result<(), EngineError> {
        let key = (strategy_name.to_string(), symbol.to_string());
        self.ensure_loaded(backtest, &key).await?;

        {
            let mut cache = self.cache.write().await;
            if let Some(per_signal) = cache.get_mut(&key) {
                per_signal.remove(signal_id);
            }
        }

        if !backtest {
            self.persist(&key).await?;
        }
        Ok(())
    }

    async fn ensure_loaded(&self, backtest: bool, key: &Key) -> Result<(), EngineError> {
        if backtest {
            return Ok(());
        }
        if self.cache.read().await.contains_key(key) {
            return Ok(());
        }
        let loaded = self
            .persistence
            .load_partial(&key.0, &key.1)
            .await
            .unwrap_or_else(|e| {
                warn!("failed to load partial state for {}/{}: {e}", key.0, key.1);
                HashMap::new()
            });
        self.cache.write().await.entry(key.clone()).or_insert(loaded);
        Ok(())
    }

    async fn persist(&self, key: &Key) -> Result<(), EngineError> {
        let snapshot = self
            .cache
            .read()
            .await
            .get(key)
            .cloned()
            .unwrap_or_default();
        self.persistence.save_partial(&key.0, &key.1, &snapshot).await
    }
}
