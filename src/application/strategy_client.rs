//! Per-(symbol, strategy, mode) signal state machine (spec.md §4.4).
//!
//! Owns at most one non-terminal signal at a time (invariant #1). Exposes
//! `tick` for the Live Driver and the Backtest Driver's per-candle probe,
//! and `backtest` for the Backtest Driver's fast-fold once `tick` reports
//! `opened`/`scheduled`.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::application::exchange_client::{vwap, ExchangeClient};
use crate::application::partial_tracker::PartialTracker;
use crate::application::risk_validator::RiskGate;
use crate::config::Config;
use crate::domain::errors::EngineError;
use crate::domain::event::{EngineEvent, EventMeta};
use crate::domain::ports::{Context, StrategySchema};
use crate::domain::signal::{Signal, SignalCore, SignalRules};
use crate::domain::tick_result::TickResult;
use crate::domain::types::{Candle, CandleInterval, CloseReason, Pnl, Position};

use super::event_bus::EventBus;

struct ClientState {
    loaded: bool,
    stopped: bool,
    last_consult_ms: Option<i64>,
    signal: Option<Signal>,
}

pub struct StrategyClient {
    symbol: String,
    backtest_mode: bool,
    strategy: Arc<dyn StrategySchema>,
    exchange: Arc<ExchangeClient>,
    risk: Option<RiskGate>,
    partials: Arc<PartialTracker>,
    bus: Arc<EventBus>,
    config: Arc<Config>,
    persistence: Arc<crate::infrastructure::persistence::PersistenceLayer>,
    state: Mutex<ClientState>,
}

impl StrategyClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: impl Into<String>,
        backtest_mode: bool,
        strategy: Arc<dyn StrategySchema>,
        exchange: Arc<ExchangeClient>,
        risk: Option<RiskGate>,
        partials: Arc<PartialTracker>,
        bus: Arc<EventBus>,
        config: Arc<Config>,
        persistence: Arc<crate::infrastructure::persistence::PersistenceLayer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            symbol: symbol.into(),
            backtest_mode,
            strategy,
            exchange,
            risk,
            partials,
            bus,
            config,
            persistence,
            state: Mutex::new(ClientState {
                loaded: false,
                stopped: false,
                last_consult_ms: None,
                signal: None,
            }),
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    pub fn exchange_name(&self) -> &str {
        self.exchange.name()
    }

    /// Consulted by drivers at safe points (before a new tick, after
    /// `idle`, after `closed`). Never aborts an in-flight signal.
    pub async fn stop(&self) {
        self.state.lock().await.stopped = true;
    }

    pub async fn is_stopped(&self) -> bool {
        self.state.lock().await.stopped
    }

    /// Snapshot of the currently tracked signal's common fields, if any.
    /// Used by the Backtest Driver to size its forward-fetch buffer.
    pub async fn current_core(&self) -> Option<SignalCore> {
        match &self.state.lock().await.signal {
            Some(Signal::Scheduled { core, .. }) => Some(core.clone()),
            Some(Signal::Opened { core, .. }) => Some(core.clone()),
            None => None,
        }
    }

    fn context(&self, when_ms: i64) -> Context {
        Context {
            symbol: self.symbol.clone(),
            strategy_name: self.strategy.name().to_string(),
            exchange_name: self.exchange.name().to_string(),
            when_ms,
            backtest: self.backtest_mode,
        }
    }

    fn rules(&self) -> SignalRules {
        SignalRules {
            min_tp_pct: self.config.min_tp_pct,
            max_sl_pct: self.config.max_sl_pct,
            max_lifetime_min: self.config.max_lifetime_min,
        }
    }

    async fn ensure_loaded(&self, state: &mut ClientState) -> Result<(), EngineError> {
        if state.loaded || self.backtest_mode {
            state.loaded = true;
            return Ok(());
        }
        let strategy_name = self.strategy.name();
        if let Some(signal) = self.persistence.load_signal(strategy_name, &self.symbol).await? {
            state.signal = Some(signal);
        } else if let Some(signal) = self.persistence.load_schedule(strategy_name, &self.symbol).await? {
            state.signal = Some(signal);
        }
        state.loaded = true;
        Ok(())
    }

    /// One real-time-style transition attempt (spec.md §4.4 `tick`
    /// contract).
    pub async fn tick(&self, when_ms: i64) -> Result<TickResult, EngineError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;

        let ctx = self.context(when_ms);
        self.strategy.on_tick(&ctx).await;

        if state.stopped && state.signal.is_none() {
            return Ok(TickResult::Idle);
        }

        match state.signal.clone() {
            Some(Signal::Scheduled { core, price_open_target }) => {
                self.tick_scheduled(&mut state, &ctx, core, price_open_target).await
            }
            Some(Signal::Opened { core, price_open, opened_at }) => {
                self.tick_opened(&mut state, &ctx, core, price_open, opened_at).await
            }
            None => self.tick_idle(&mut state, &ctx).await,
        }
    }

    async fn tick_idle(
        &self,
        state: &mut ClientState,
        ctx: &Context,
    ) -> Result<TickResult, EngineError> {
        let interval_ms = self.strategy.interval().to_ms();
        let throttled = matches!(
            state.last_consult_ms,
            Some(last) if ctx.when_ms - last < interval_ms
        );
        if throttled {
            return Ok(TickResult::Idle);
        }
        state.last_consult_ms = Some(ctx.when_ms);

        let candidate = match self.strategy.get_signal(ctx, &self.symbol).await? {
            Some(c) => c,
            None => {
                self.strategy.on_idle(ctx).await;
                return Ok(TickResult::Idle);
            }
        };

        let reference_price = match candidate.price_open_target {
            Some(target) => target,
            None => self.exchange.get_average_price(ctx, &self.symbol).await?,
        };

        if let Err(reason) = self.rules().validate(&candidate, reference_price) {
            self.bus.publish(EngineEvent::Validation {
                meta: self.meta(ctx),
                reason,
            });
            self.strategy.on_idle(ctx).await;
            return Ok(TickResult::Idle);
        }

        let signal_id = candidate
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if let Some(target) = candidate.price_open_target {
            let core = SignalCore {
                id: signal_id.clone(),
                symbol: self.symbol.clone(),
                strategy_name: self.strategy.name().to_string(),
                exchange_name: self.exchange.name().to_string(),
                position: candidate.position,
                price_take_profit: candidate.price_take_profit,
                price_stop_loss: candidate.price_stop_loss,
                minute_estimated_time: candidate.minute_estimated_time,
                scheduled_at: ctx.when_ms,
                pending_at: 0,
                note: candidate.note.clone(),
            };
            let signal = Signal::Scheduled { core, price_open_target: target };
            if !self.backtest_mode {
                self.persistence
                    .save_schedule(&self.strategy.name().to_string(), &self.symbol, &signal)
                    .await?;
            }
            state.signal = Some(signal);
            self.strategy.on_schedule(ctx, &signal_id).await;
            self.publish_result(ctx, &TickResult::Scheduled { signal_id: signal_id.clone() });
            return Ok(TickResult::Scheduled { signal_id });
        }

        // `check` and `add` run as one atomic critical section: two
        // concurrent callers racing to open against the same cap can
        // never both observe room and both commit, since the gate holds
        // each validator's lock across the whole check-then-commit.
        let accepted = match &self.risk {
            Some(gate) => {
                gate.check_and_add(
                    ctx.when_ms,
                    ctx.backtest,
                    &self.symbol,
                    self.strategy.name(),
                    self.exchange.name(),
                    reference_price,
                    Some(signal_id.clone()),
                    ctx.when_ms,
                )
                .await?
            }
            None => true,
        };

        if !accepted {
            return Ok(TickResult::Idle);
        }

        let core = SignalCore {
            id: signal_id.clone(),
            symbol: self.symbol.clone(),
            strategy_name: self.strategy.name().to_string(),
            exchange_name: self.exchange.name().to_string(),
            position: candidate.position,
            price_take_profit: candidate.price_take_profit,
            price_stop_loss: candidate.price_stop_loss,
            minute_estimated_time: candidate.minute_estimated_time,
            scheduled_at: ctx.when_ms,
            pending_at: ctx.when_ms,
            note: candidate.note.clone(),
        };
        let signal = Signal::Opened { core, price_open: reference_price, opened_at: ctx.when_ms };
        if !self.backtest_mode {
            self.persistence
                .save_signal(&self.strategy.name().to_string(), &self.symbol, &signal)
                .await?;
        }
        state.signal = Some(signal);
        self.strategy.on_open(ctx, &signal_id).await;
        let result = TickResult::Opened { signal_id: signal_id.clone(), price_open: reference_price };
        self.publish_result(ctx, &result);
        Ok(result)
    }

    async fn tick_scheduled(
        &self,
        state: &mut ClientState,
        ctx: &Context,
        core: SignalCore,
        price_open_target: f64,
    ) -> Result<TickResult, EngineError> {
        let candles = self
            .exchange
            .get_candles(ctx, &self.symbol, CandleInterval::OneMin, 1)
            .await?;
        let touched = candles
            .last()
            .is_some_and(|c| c.low <= price_open_target && price_open_target <= c.high);

        if touched {
            let price_open = self.exchange.get_average_price(ctx, &self.symbol).await?;
            let mut opened_core = core.clone();
            opened_core.pending_at = ctx.when_ms;
            let signal = Signal::Opened { core: opened_core, price_open, opened_at: ctx.when_ms };
            if !self.backtest_mode {
                self.persistence.delete_schedule(&core.strategy_name, &self.symbol).await?;
                self.persistence.save_signal(&core.strategy_name, &self.symbol, &signal).await?;
            }
            state.signal = Some(signal);
            self.strategy.on_open(ctx, &core.id).await;
            let result = TickResult::Opened { signal_id: core.id.clone(), price_open };
            self.publish_result(ctx, &result);
            return Ok(result);
        }

        let await_ms = self.config.schedule_await_minutes * 60_000;
        if ctx.when_ms - core.scheduled_at > await_ms {
            if !self.backtest_mode {
                self.persistence.delete_schedule(&core.strategy_name, &self.symbol).await?;
            }
            state.signal = None;
            self.strategy.on_cancel(ctx, &core.id).await;
            let result = TickResult::Cancelled { signal_id: core.id.clone() };
            self.publish_result(ctx, &result);
            return Ok(result);
        }

        debug!("{}/{} still scheduled at {}", core.strategy_name, self.symbol, ctx.when_ms);
        Ok(TickResult::Scheduled { signal_id: core.id })
    }

    async fn tick_opened(
        &self,
        state: &mut ClientState,
        ctx: &Context,
        core: SignalCore,
        price_open: f64,
        opened_at: i64,
    ) -> Result<TickResult, EngineError> {
        let candles = self
            .exchange
            .get_candles(ctx, &self.symbol, CandleInterval::OneMin, 1)
            .await?;
        let current_vwap = self.exchange.get_average_price(ctx, &self.symbol).await.ok();

        let close = match candles.last() {
            Some(candle) => self.evaluate_close(&core, price_open, opened_at, ctx.when_ms, candle),
            None => None,
        };

        if let Some((close_reason, price_close)) = close {
            return self
                .close_signal(state, ctx, core, price_open, close_reason, price_close)
                .await;
        }

        if let Some(vwap_price) = current_vwap {
            let revenue_pct = signed_revenue_pct(core.position, price_open, vwap_price);
            self.partials
                .record(
                    ctx.backtest,
                    ctx.when_ms,
                    &self.symbol,
                    &core.strategy_name,
                    &core.exchange_name,
                    &core.id,
                    revenue_pct,
                )
                .await?;
        }

        self.strategy.on_active(ctx, &core.id).await;
        let result = TickResult::Active { signal_id: core.id.clone() };
        self.publish_result(ctx, &result);
        Ok(result)
    }

    /// Adverse-first: if a candle's range touches both TP and SL, assume
    /// the worse fill (stop-loss checked first).
    fn evaluate_close(
        &self,
        core: &SignalCore,
        price_open: f64,
        opened_at: i64,
        when_ms: i64,
        candle: &Candle,
    ) -> Option<(CloseReason, f64)> {
        let (tp_hit, sl_hit) = match core.position {
            Position::Long => (
                candle.high >= core.price_take_profit,
                candle.low <= core.price_stop_loss,
            ),
            Position::Short => (
                candle.low <= core.price_take_profit,
                candle.high >= core.price_stop_loss,
            ),
        };

        if sl_hit {
            return Some((CloseReason::StopLoss, core.price_stop_loss));
        }
        if tp_hit {
            return Some((CloseReason::TakeProfit, core.price_take_profit));
        }

        let lifetime_ms = core.minute_estimated_time * 60_000;
        if when_ms - opened_at >= lifetime_ms {
            let close_price = vwap(std::slice::from_ref(candle)).unwrap_or(price_open);
            return Some((CloseReason::TimeExpired, close_price));
        }

        None
    }

    async fn close_signal(
        &self,
        state: &mut ClientState,
        ctx: &Context,
        core: SignalCore,
        price_open: f64,
        close_reason: CloseReason,
        price_close: f64,
    ) -> Result<TickResult, EngineError> {
        let pnl = compute_pnl(core.position, price_open, price_close, self.config.slippage_pct, self.config.fee_pct);

        if !self.backtest_mode {
            self.persistence.delete_signal(&core.strategy_name, &self.symbol).await?;
        }
        if let Some(gate) = &self.risk {
            gate.remove(ctx.backtest, &core.strategy_name, &self.symbol).await?;
        }
        self.partials.clear(ctx.backtest, &core.strategy_name, &self.symbol, &core.id).await?;

        state.signal = None;
        self.strategy.on_close(ctx, &core.id).await;

        let result = TickResult::Closed {
            signal_id: core.id,
            close_reason,
            close_timestamp_ms: ctx.when_ms,
            pnl,
        };
        self.publish_result(ctx, &result);
        Ok(result)
    }

    fn meta(&self, ctx: &Context) -> EventMeta {
        EventMeta::new(ctx.when_ms, ctx.backtest)
            .with_symbol(&self.symbol)
            .with_strategy(self.strategy.name())
            .with_exchange(self.exchange.name())
    }

    fn publish_result(&self, ctx: &Context, result: &TickResult) {
        let meta = self.meta(ctx);
        self.bus.publish(EngineEvent::Signal { meta: meta.clone(), result: result.clone() });
        if ctx.backtest {
            self.bus.publish(EngineEvent::SignalBacktest { meta, result: result.clone() });
        } else {
            self.bus.publish(EngineEvent::SignalLive { meta, result: result.clone() });
        }
    }

    /// Fast-fold over a prefetched, already-sorted candle buffer (spec.md
    /// §4.4 `backtest` contract). Loops internally until a terminal result
    /// or the buffer is exhausted; never yields intermediate `active`
    /// results to the caller, matching the Backtest Driver's fast-forward.
    pub async fn backtest(&self, candles: &[Candle], from_when: i64) -> Result<TickResult, EngineError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;

        let mut sorted: Vec<Candle> = candles.iter().copied().filter(Candle::is_sane).collect();
        sorted.sort_by_key(|c| c.timestamp_ms);

        let window_cap = self.config.vwap_candle_count;
        let mut window: Vec<Candle> = Vec::new();

        for candle in sorted.into_iter().filter(|c| c.timestamp_ms >= from_when) {
            window.push(candle);
            if window.len() > window_cap {
                window.remove(0);
            }
            let current_vwap = vwap(&window);
            let ctx = self.context(candle.timestamp_ms);

            match state.signal.clone() {
                Some(Signal::Scheduled { core, price_open_target }) => {
                    if candle.low <= price_open_target && price_open_target <= candle.high {
                        let price_open = current_vwap.unwrap_or(price_open_target);
                        let mut opened_core = core.clone();
                        opened_core.pending_at = candle.timestamp_ms;
                        let signal = Signal::Opened {
                            core: opened_core,
                            price_open,
                            opened_at: candle.timestamp_ms,
                        };
                        state.signal = Some(signal);
                        self.strategy.on_open(&ctx, &core.id).await;
                        let result = TickResult::Opened { signal_id: core.id, price_open };
                        self.publish_result(&ctx, &result);
                        return Ok(result);
                    }
                    let await_ms = self.config.schedule_await_minutes * 60_000;
                    if candle.timestamp_ms - core.scheduled_at > await_ms {
                        state.signal = None;
                        self.strategy.on_cancel(&ctx, &core.id).await;
                        let result = TickResult::Cancelled { signal_id: core.id };
                        self.publish_result(&ctx, &result);
                        return Ok(result);
                    }
                }
                Some(Signal::Opened { core, price_open, opened_at }) => {
                    if let Some((close_reason, price_close)) =
                        self.evaluate_close(&core, price_open, opened_at, candle.timestamp_ms, &candle)
                    {
                        let pnl = compute_pnl(
                            core.position,
                            price_open,
                            price_close,
                            self.config.slippage_pct,
                            self.config.fee_pct,
                        );
                        if let Some(gate) = &self.risk {
                            gate.remove(true, &core.strategy_name, &self.symbol).await?;
                        }
                        self.partials.clear(true, &core.strategy_name, &self.symbol, &core.id).await?;
                        state.signal = None;
                        self.strategy.on_close(&ctx, &core.id).await;
                        let result = TickResult::Closed {
                            signal_id: core.id,
                            close_reason,
                            close_timestamp_ms: candle.timestamp_ms,
                            pnl,
                        };
                        self.publish_result(&ctx, &result);
                        return Ok(result);
                    }
                    if let Some(vwap_price) = current_vwap {
                        let revenue_pct = signed_revenue_pct(core.position, price_open, vwap_price);
                        self.partials
                            .record(
                                true,
                                candle.timestamp_ms,
                                &self.symbol,
                                &core.strategy_name,
                                &core.exchange_name,
                                &core.id,
                                revenue_pct,
                            )
                            .await?;
                    }
                }
                None => return Ok(TickResult::Idle),
            }
        }

        match &state.signal {
            Some(Signal::Opened { core, .. }) => Ok(TickResult::Active { signal_id: core.id.clone() }),
            Some(Signal::Scheduled { core, .. }) => Ok(TickResult::Scheduled { signal_id: core.id.clone() }),
            None => Ok(TickResult::Idle),
        }
    }
}

fn signed_revenue_pct(position: Position, price_open: f64, current_price: f64) -> f64 {
    match position {
        Position::Long => (current_price - price_open) / price_open,
        Position::Short => (price_open - current_price) / price_open,
    }
}

/// §4.4.1: effective entry/exit absorb slippage and fees symmetrically;
/// both `gross_pct` and `net_pct_after_fees_and_slippage` are normalised
/// against `price_open` so the round-trip law (`Po == Pc` ⇒ net =
/// `-2·(slip+fee)`) holds exactly rather than approximately.
fn compute_pnl(position: Position, price_open: f64, price_close: f64, slippage_pct: f64, fee_pct: f64) -> Pnl {
    let cost = slippage_pct + fee_pct;
    match position {
        Position::Long => {
            let gross_pct = (price_close - price_open) / price_open;
            let effective_entry = price_open * (1.0 + cost);
            let effective_exit = price_close * (1.0 - cost);
            let net_pct_after_fees_and_slippage = (effective_exit - effective_entry) / price_open;
            Pnl { gross_pct, net_pct_after_fees_and_slippage }
        }
        Position::Short => {
            let gross_pct = (price_open - price_close) / price_open;
            let effective_entry = price_open * (1.0 - cost);
            let effective_exit = price_close * (1.0 + cost);
            let net_pct_after_fees_and_slippage = (effective_entry - effective_exit) / price_open;
            Pnl { gross_pct, net_pct_after_fees_and_slippage }
        }
    }
}
