//! Shared, composite portfolio-level risk gate (spec.md §4.2).

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::warn;

use crate::domain::errors::EngineError;
use crate::domain::event::{EngineEvent, EventMeta};
use crate::domain::ports::RiskPredicate;
use crate::domain::risk::{ActivePosition, RiskPosition, RiskValidationRequest};
use crate::infrastructure::persistence::PersistenceLayer;

use super::event_bus::EventBus;

/// One named risk profile: an ordered list of predicates plus the shared
/// position map every strategy bound to this profile sees.
///
/// `check_and_add` is the critical section spec.md §5 calls for: it holds
/// `positions`'s single mutex across both the predicate evaluation and the
/// commit, so two concurrent strategies racing to open against the same
/// cap can never both observe "room" and both commit. `check` and `add`
/// remain as separate point-in-time operations for callers that only need
/// one half (e.g. a read-only probe, or `remove`'s symmetric counterpart).
pub struct RiskValidator {
    name: String,
    predicates: Vec<Arc<dyn RiskPredicate>>,
    positions: Mutex<HashMap<(String, String), RiskPosition>>,
    persistence: Arc<PersistenceLayer>,
    bus: Arc<EventBus>,
    loaded: OnceCell<()>,
}

impl RiskValidator {
    pub fn new(
        name: impl Into<String>,
        predicates: Vec<Arc<dyn RiskPredicate>>,
        persistence: Arc<PersistenceLayer>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            predicates,
            positions: Mutex::new(HashMap::new()),
            persistence,
            bus,
            loaded: OnceCell::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Idempotent "once" load of persisted positions (spec.md §4.8 init
    /// contract). A no-op in backtest mode, where persistence is bypassed
    /// entirely.
    async fn ensure_loaded(&self, backtest: bool) {
        if backtest {
            return;
        }
        self.loaded
            .get_or_init(|| async {
                match self.persistence.load_risk(&self.name).await {
                    Ok(positions) => {
                        let mut guard = self.positions.lock().await;
                        for p in positions {
                            guard.insert((p.strategy_name.clone(), p.symbol.clone()), p);
                        }
                    }
                    Err(e) => warn!("failed to load risk positions for {}: {e}", self.name),
                }
            })
            .await;
    }

    /// Runs every predicate in declaration order against a snapshot of the
    /// shared position map. First rejection short-circuits and publishes
    /// `RiskRejected`.
    ///
    /// Does not hold `positions`'s lock across the predicate evaluation —
    /// on its own this is only a point-in-time read. Use `check_and_add`
    /// where a caller intends to add a position immediately upon
    /// acceptance; calling `check` then `add` as two separate calls leaves
    /// a window where two concurrent callers can both observe room and
    /// both commit.
    pub async fn check(
        &self,
        timestamp_ms: i64,
        backtest: bool,
        symbol: &str,
        strategy_name: &str,
        exchange_name: &str,
        current_price: f64,
        pending_signal_id: Option<String>,
    ) -> bool {
        self.ensure_loaded(backtest).await;
        let guard = self.positions.lock().await;
        self.evaluate(&guard, timestamp_ms, backtest, symbol, strategy_name, exchange_name, current_price, pending_signal_id)
            .await
    }

    /// Evaluates every predicate against `guard`'s current contents.
    /// Shared by `check` (read-only) and `check_and_add` (same snapshot,
    /// held under the same lock acquisition as the subsequent insert).
    #[allow(clippy::too_many_arguments)]
    async fn evaluate(
        &self,
        guard: &HashMap<(String, String), RiskPosition>,
        timestamp_ms: i64,
        backtest: bool,
        symbol: &str,
        strategy_name: &str,
        exchange_name: &str,
        current_price: f64,
        pending_signal_id: Option<String>,
    ) -> bool {
        let active_positions: Vec<ActivePosition> = guard
            .values()
            .map(|p| ActivePosition {
                signal_id: format!("{}:{}", p.strategy_name, p.symbol),
                strategy_name: p.strategy_name.clone(),
                exchange_name: p.exchange_name.clone(),
                opened_at: p.opened_at,
            })
            .collect();
        let count = active_positions.len();

        let request = RiskValidationRequest {
            symbol: symbol.to_string(),
            strategy_name: strategy_name.to_string(),
            exchange_name: exchange_name.to_string(),
            current_price,
            timestamp_ms,
            pending_signal_id,
            active_position_count: count,
            active_positions,
        };

        for predicate in &self.predicates {
            if let Err(reason) = predicate.check(&request).await {
                self.bus.publish(EngineEvent::RiskRejected {
                    meta: EventMeta::new(timestamp_ms, backtest)
                        .with_symbol(symbol)
                        .with_strategy(strategy_name)
                        .with_exchange(exchange_name),
                    active_position_count: count,
                    comment: format!("{}: {reason}", predicate.name()),
                });
                return false;
            }
        }

        true
    }

    /// Atomic check-then-commit: evaluates every predicate and, if all
    /// accept, inserts the new position, all under one acquisition of
    /// `positions`'s mutex. This is the critical section spec.md §5 calls
    /// for — two concurrent callers racing to open against the same cap
    /// can never both observe "room" and both commit, because the second
    /// one to acquire the lock sees the first one's insert before it runs
    /// its own predicates.
    #[allow(clippy::too_many_arguments)]
    pub async fn check_and_add(
        &self,
        timestamp_ms: i64,
        backtest: bool,
        symbol: &str,
        strategy_name: &str,
        exchange_name: &str,
        current_price: f64,
        pending_signal_id: Option<String>,
        opened_at: i64,
    ) -> Result<bool, EngineError> {
        self.ensure_loaded(backtest).await;

        let mut guard = self.positions.lock().await;
        let accepted = self
            .evaluate(&guard, timestamp_ms, backtest, symbol, strategy_name, exchange_name, current_price, pending_signal_id)
            .await;
        if !accepted {
            return Ok(false);
        }

        guard.insert(
            (strategy_name.to_string(), symbol.to_string()),
            RiskPosition {
                strategy_name: strategy_name.to_string(),
                symbol: symbol.to_string(),
                exchange_name: exchange_name.to_string(),
                opened_at,
            },
        );
        let snapshot: Vec<RiskPosition> = guard.values().cloned().collect();
        drop(guard);

        if !backtest {
            self.persistence.save_risk(&self.name, &snapshot).await?;
        }
        Ok(true)
    }

    pub async fn add(
        &self,
        backtest: bool,
        strategy_name: &str,
        symbol: &str,
        exchange_name: &str,
        opened_at: i64,
    ) -> Result<(), EngineError> {
        self.ensure_loaded(backtest).await;

        let snapshot = {
            let mut guard = self.positions.lock().await;
            guard.insert(
                (strategy_name.to_string(), symbol.to_string()),
                RiskPosition {
                    strategy_name: strategy_name.to_string(),
                    symbol: symbol.to_string(),
                    exchange_name: exchange_name.to_string(),
                    opened_at,
                },
            );
            guard.values().cloned().collect::<Vec<_>>()
        };

        if !backtest {
            self.persistence.save_risk(&self.name, &snapshot).await?;
        }
        Ok(())
    }

    pub async fn remove(
        &self,
        backtest: bool,
        strategy_name: &str,
        symbol: &str,
    ) -> Result<(), EngineError> {
        self.ensure_loaded(backtest).await;

        let snapshot = {
            let mut guard = self.positions.lock().await;
            guard.remove(&(strategy_name.to_string(), symbol.to_string()));
            guard.values().cloned().collect::<Vec<_>>()
        };

        if !backtest {
            self.persistence.save_risk(&self.name, &snapshot).await?;
        }
        Ok(())
    }

    pub async fn active_position_count(&self) -> usize {
        self.positions.lock().await.len()
    }
}

/// A strategy binds to either one profile or an ordered list, which
/// composes as logical AND: `check` accepts only if every child accepts;
/// `add`/`remove` fan out to every child (spec.md §4.2 composite form).
pub enum RiskGate {
    Single(Arc<RiskValidator>),
    Composite(Vec<Arc<RiskValidator>>),
}

impl RiskGate {
    pub async fn check(
        &self,
        timestamp_ms: i64,
        backtest: bool,
        symbol: &str,
        strategy_name: &str,
        exchange_name: &str,
        current_price: f64,
        pending_signal_id: Option<String>,
    ) -> bool {
        let validators: Vec<&Arc<RiskValidator>> = match self {
            RiskGate::Single(v) => vec![v],
            RiskGate::Composite(vs) => vs.iter().collect(),
        };

        for v in validators {
            let accepted = v
                .check(
                    timestamp_ms,
                    backtest,
                    symbol,
                    strategy_name,
                    exchange_name,
                    current_price,
                    pending_signal_id.clone(),
                )
                .await;
            if !accepted {
                return false;
            }
        }
        true
    }

    /// Atomic check-then-commit across every child validator. Each child's
    /// own `check_and_add` already closes the single-validator TOCTOU
    /// window; here, a rejection partway through a composite gate rolls
    /// back every child that already committed, so a composite rejection
    /// never leaves a partial position behind.
    #[allow(clippy::too_many_arguments)]
    pub async fn check_and_add(
        &self,
        timestamp_ms: i64,
        backtest: bool,
        symbol: &str,
        strategy_name: &str,
        exchange_name: &str,
        current_price: f64,
        pending_signal_id: Option<String>,
        opened_at: i64,
    ) -> Result<bool, EngineError> {
        let validators: Vec<&Arc<RiskValidator>> = match self {
            RiskGate::Single(v) => vec![v],
            RiskGate::Composite(vs) => vs.iter().collect(),
        };

        let mut committed: Vec<&Arc<RiskValidator>> = Vec::new();
        for v in validators {
            let accepted = v
                .check_and_add(
                    timestamp_ms,
                    backtest,
                    symbol,
                    strategy_name,
                    exchange_name,
                    current_price,
                    pending_signal_id.clone(),
                    opened_at,
                )
                .await?;
            if !accepted {
                for rollback in committed {
                    rollback.remove(backtest, strategy_name, symbol).await?;
                }
                return Ok(false);
            }
            committed.push(v);
        }
        Ok(true)
    }

    pub async fn add(
        &self,
        backtest: bool,
        strategy_name: &str,
        symbol: &str,
        exchange_name: &str,
        opened_at: i64,
    ) -> Result<(), EngineError> {
        let validators: Vec<&Arc<RiskValidator>> = match self {
            RiskGate::Single(v) => vec![v],
            RiskGate::Composite(vs) => vs.iter().collect(),
        };
        for v in validators {
            v.add(backtest, strategy_name, symbol, exchange_name, opened_at)
                .await?;
        }
        Ok(())
    }

    pub async fn remove(
        &self,
        backtest: bool,
        strategy_name: &str,
        symbol: &str,
    ) -> Result<(), EngineError> {
        let validators: Vec<&Arc<RiskValidator>> = match self {
            RiskGate::Single(v) => vec![v],
            RiskGate::Composite(vs) => vs.iter().collect(),
        };
        for v in validators {
            v.remove(backtest, strategy_name, symbol).await?;
        }
        Ok(())
    }
}
