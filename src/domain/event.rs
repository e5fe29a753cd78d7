use serde::{Deserialize, Serialize};

use crate::domain::tick_result::TickResult;

/// Fields every event carries at minimum (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMeta {
    pub timestamp_ms: i64,
    pub symbol: Option<String>,
    pub strategy_name: Option<String>,
    pub exchange_name: Option<String>,
    pub backtest: bool,
}

impl EventMeta {
    pub fn new(timestamp_ms: i64, backtest: bool) -> Self {
        Self {
            timestamp_ms,
            symbol: None,
            strategy_name: None,
            exchange_name: None,
            backtest,
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn with_strategy(mut self, strategy_name: impl Into<String>) -> Self {
        self.strategy_name = Some(strategy_name.into());
        self
    }

    pub fn with_exchange(mut self, exchange_name: impl Into<String>) -> Self {
        self.exchange_name = Some(exchange_name.into());
        self
    }
}

/// Every payload the Event Bus (application::event_bus) ever carries, one
/// variant per stable channel name from spec.md §4.9.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    Signal { meta: EventMeta, result: TickResult },
    SignalLive { meta: EventMeta, result: TickResult },
    SignalBacktest { meta: EventMeta, result: TickResult },
    DoneBacktest { meta: EventMeta },
    DoneLive { meta: EventMeta },
    DoneWalker { meta: EventMeta },
    ProgressBacktest { meta: EventMeta, index: usize, total: usize },
    ProgressWalker { meta: EventMeta, index: usize, total: usize },
    WalkerStep {
        meta: EventMeta,
        candidate_strategy: String,
        metric: f64,
        best_so_far_strategy: String,
        best_so_far_metric: f64,
    },
    WalkerComplete {
        meta: EventMeta,
        winner_strategy: String,
        metric: f64,
    },
    PartialProfit { meta: EventMeta, signal_id: String, level: u32 },
    PartialLoss { meta: EventMeta, signal_id: String, level: u32 },
    RiskRejected {
        meta: EventMeta,
        active_position_count: usize,
        comment: String,
    },
    Performance { meta: EventMeta, duration_ms: u64 },
    Validation { meta: EventMeta, reason: String },
    Error { meta: EventMeta, message: String },
    Exit { meta: EventMeta, reason: String },
}

impl EngineEvent {
    /// The stable channel name this event is published on.
    pub fn channel(&self) -> &'static str {
        match self {
            EngineEvent::Signal { .. } => "Signal",
            EngineEvent::SignalLive { .. } => "SignalLive",
            EngineEvent::SignalBacktest { .. } => "SignalBacktest",
            EngineEvent::DoneBacktest { .. } => "DoneBacktest",
            EngineEvent::DoneLive { .. } => "DoneLive",
            EngineEvent::DoneWalker { .. } => "DoneWalker",
            EngineEvent::ProgressBacktest { .. } => "ProgressBacktest",
            EngineEvent::ProgressWalker { .. } => "ProgressWalker",
            EngineEvent::WalkerStep { .. } => "WalkerStep",
            EngineEvent::WalkerComplete { .. } => "WalkerComplete",
            EngineEvent::PartialProfit { .. } => "PartialProfit",
            EngineEvent::PartialLoss { .. } => "PartialLoss",
            EngineEvent::RiskRejected { .. } => "RiskRejected",
            EngineEvent::Performance { .. } => "Performance",
            EngineEvent::Validation { .. } => "Validation",
            EngineEvent::Error { .. } => "Error",
            EngineEvent::Exit { .. } => "Exit",
        }
    }

    pub fn meta(&self) -> &EventMeta {
        match self {
            EngineEvent::Signal { meta, .. }
            | EngineEvent::SignalLive { meta, .. }
            | EngineEvent::SignalBacktest { meta, .. }
            | EngineEvent::DoneBacktest { meta }
            | EngineEvent::DoneLive { meta }
            | EngineEvent::DoneWalker { meta }
            | EngineEvent::ProgressBacktest { meta, .. }
            | EngineEvent::ProgressWalker { meta, .. }
            | EngineEvent::WalkerStep { meta, .. }
            | EngineEvent::WalkerComplete { meta, .. }
            | EngineEvent::PartialProfit { meta, .. }
            | EngineEvent::PartialLoss { meta, .. }
            | EngineEvent::RiskRejected { meta, .. }
            | EngineEvent::Performance { meta, .. }
            | EngineEvent::Validation { meta, .. }
            | EngineEvent::Error { meta, .. }
            | EngineEvent::Exit { meta, .. } => meta,
        }
    }
}
