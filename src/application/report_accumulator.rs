//! Report Accumulators (spec.md §4.9): bounded per-`(symbol, strategy)`
//! ring buffers of every event, plus a rendered summary.

use std::collections::{HashMap, VecDeque};
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::domain::errors::EngineError;
use crate::domain::event::EngineEvent;

use super::event_bus::EventBus;

type Key = (String, String);

#[derive(Debug, Default, Clone)]
pub struct PairStats {
    pub opened: u64,
    pub closed: u64,
    pub cancelled: u64,
    pub risk_rejected: u64,
    pub partial_profit: u64,
    pub partial_loss: u64,
    pub errors: u64,
    pub wins: u64,
    pub losses: u64,
    pub net_pnl_sum: f64,
}

impl PairStats {
    /// Fraction of closed trades with a positive net PnL. `None` until at
    /// least one trade has closed.
    pub fn win_rate(&self) -> Option<f64> {
        if self.closed == 0 {
            None
        } else {
            Some(self.wins as f64 / self.closed as f64)
        }
    }

    /// Mean net PnL per closed trade. `None` until at least one trade has
    /// closed.
    pub fn average_net_pnl(&self) -> Option<f64> {
        if self.closed == 0 {
            None
        } else {
            Some(self.net_pnl_sum / self.closed as f64)
        }
    }
}

/// Aggregate view across every `(strategy, symbol)` pair a single
/// accumulator has seen, mirroring the kind of run-level rollup a
/// benchmark report renders once every scenario has finished.
#[derive(Debug, Default, Clone)]
pub struct AggregateSummary {
    pub pairs_tracked: usize,
    pub profitable_pairs: usize,
    pub total_closed: u64,
    pub average_net_pnl: f64,
    pub best_performer: Option<String>,
    pub worst_performer: Option<String>,
}

pub struct ReportAccumulator {
    capacity: usize,
    events: RwLock<HashMap<Key, VecDeque<EngineEvent>>>,
    stats: RwLock<HashMap<Key, PairStats>>,
}

impl ReportAccumulator {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            events: RwLock::new(HashMap::new()),
            stats: RwLock::new(HashMap::new()),
        })
    }

    /// Subscribes to every channel on `bus` and starts accumulating.
    pub fn attach(self: &Arc<Self>, bus: &Arc<EventBus>) {
        let this = self.clone();
        bus.subscribe_all(Arc::new(move |event| {
            let this = this.clone();
            Box::pin(async move {
                this.ingest(event).await;
            })
        }));
    }

    async fn ingest(&self, event: EngineEvent) {
        let meta = event.meta();
        let key = (
            meta.strategy_name.clone().unwrap_or_default(),
            meta.symbol.clone().unwrap_or_default(),
        );

        {
            let mut events = self.events.write().await;
            let buf = events.entry(key.clone()).or_default();
            buf.push_back(event.clone());
            while buf.len() > self.capacity {
                buf.pop_front();
            }
        }

        let mut stats_map = self.stats.write().await;
        let stats = stats_map.entry(key).or_default();
        match &event {
            EngineEvent::Signal { result, .. } => match result {
                crate::domain::tick_result::TickResult::Opened { .. } => stats.opened += 1,
                crate::domain::tick_result::TickResult::Closed { pnl, .. } => {
                    stats.closed += 1;
                    stats.net_pnl_sum += pnl.net_pct_after_fees_and_slippage;
                    if pnl.net_pct_after_fees_and_slippage > 0.0 {
                        stats.wins += 1;
                    } else {
                        stats.losses += 1;
                    }
                }
                crate::domain::tick_result::TickResult::Cancelled { .. } => stats.cancelled += 1,
                _ => {}
            },
            EngineEvent::RiskRejected { .. } => stats.risk_rejected += 1,
            EngineEvent::PartialProfit { .. } => stats.partial_profit += 1,
            EngineEvent::PartialLoss { .. } => stats.partial_loss += 1,
            EngineEvent::Error { .. } => stats.errors += 1,
            _ => {}
        }
    }

    pub async fn snapshot_stats(&self, strategy_name: &str, symbol: &str) -> PairStats {
        self.stats
            .read()
            .await
            .get(&(strategy_name.to_string(), symbol.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn render_report(&self, strategy_name: &str, symbol: &str) -> String {
        let stats = self.snapshot_stats(strategy_name, symbol).await;
        let win_rate = stats.win_rate().map(|r| format!("{:.1}%", r * 100.0)).unwrap_or_else(|| "n/a".into());
        format!(
            "{strategy_name}/{symbol}: opened={} closed={} cancelled={} risk_rejected={} \
             partial_profit={} partial_loss={} errors={} win_rate={win_rate} net_pnl_sum={:.4}",
            stats.opened,
            stats.closed,
            stats.cancelled,
            stats.risk_rejected,
            stats.partial_profit,
            stats.partial_loss,
            stats.errors,
            stats.net_pnl_sum,
        )
    }

    /// Every tracked pair rendered as one fixed-width table, header first.
    /// Grounded on the teacher's `OptimizeReporter::print_grid_info`
    /// formatted-section-over-a-result-set style.
    pub async fn render_table(&self) -> String {
        let stats_map = self.stats.read().await;
        let mut rows: Vec<(&Key, &PairStats)> = stats_map.iter().collect();
        rows.sort_by(|a, b| a.0.cmp(b.0));

        let mut out = String::new();
        out.push_str(&format!(
            "{:<16} {:<10} {:>7} {:>7} {:>7} {:>9} {:>9}\n",
            "strategy", "symbol", "opened", "closed", "cancel", "win_rate", "net_pnl"
        ));
        for ((strategy_name, symbol), stats) in rows {
            let win_rate = stats.win_rate().map(|r| format!("{:.1}%", r * 100.0)).unwrap_or_else(|| "n/a".into());
            out.push_str(&format!(
                "{:<16} {:<10} {:>7} {:>7} {:>7} {:>9} {:>9.4}\n",
                strategy_name, symbol, stats.opened, stats.closed, stats.cancelled, win_rate, stats.net_pnl_sum
            ));
        }
        out
    }

    /// Rolls every tracked pair's stats into one run-level summary: how many
    /// pairs turned a net profit, total closed trades, mean net PnL, and the
    /// best/worst performer by net PnL. Grounded on the teacher's
    /// `BenchmarkSummary` aggregate-counters shape.
    pub async fn aggregate_summary(&self) -> AggregateSummary {
        let stats_map = self.stats.read().await;
        let mut summary = AggregateSummary { pairs_tracked: stats_map.len(), ..Default::default() };
        let mut best: Option<(&Key, f64)> = None;
        let mut worst: Option<(&Key, f64)> = None;
        let mut pnl_total = 0.0;

        for (key, stats) in stats_map.iter() {
            if stats.net_pnl_sum > 0.0 {
                summary.profitable_pairs += 1;
            }
            summary.total_closed += stats.closed;
            pnl_total += stats.net_pnl_sum;

            if best.map(|(_, pnl)| stats.net_pnl_sum > pnl).unwrap_or(true) {
                best = Some((key, stats.net_pnl_sum));
            }
            if worst.map(|(_, pnl)| stats.net_pnl_sum < pnl).unwrap_or(true) {
                worst = Some((key, stats.net_pnl_sum));
            }
        }

        summary.average_net_pnl = if summary.pairs_tracked == 0 { 0.0 } else { pnl_total / summary.pairs_tracked as f64 };
        summary.best_performer = best.map(|((strategy_name, symbol), _)| format!("{strategy_name}/{symbol}"));
        summary.worst_performer = worst.map(|((strategy_name, symbol), _)| format!("{strategy_name}/{symbol}"));
        summary
    }

    pub async fn dump_to_file(&self, path: &Path) -> Result<(), EngineError> {
        let mut out = self.render_table().await;
        let summary = self.aggregate_summary().await;
        out.push_str(&format!(
            "\npairs_tracked={} profitable_pairs={} total_closed={} average_net_pnl={:.4} best={} worst={}\n",
            summary.pairs_tracked,
            summary.profitable_pairs,
            summary.total_closed,
            summary.average_net_pnl,
            summary.best_performer.as_deref().unwrap_or("n/a"),
            summary.worst_performer.as_deref().unwrap_or("n/a"),
        ));

        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let mut file = std::fs::File::create(&path).map_err(|e| EngineError::Persistence {
                op: "create report".into(),
                reason: e.to_string(),
            })?;
            file.write_all(out.as_bytes()).map_err(|e| EngineError::Persistence {
                op: "write report".into(),
                reason: e.to_string(),
            })
        })
        .await
        .map_err(|e| EngineError::Persistence {
            op: "write report".into(),
            reason: format!("task join error: {e}"),
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::EventMeta;
    use crate::domain::tick_result::TickResult;
    use crate::domain::types::{CloseReason, Pnl};
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn accumulates_closed_and_rejected_counts() {
        let bus = EventBus::new();
        let acc = ReportAccumulator::new(250);
        acc.attach(&bus);

        bus.publish(EngineEvent::Signal {
            meta: EventMeta::new(0, true).with_symbol("BTCUSDT").with_strategy("trend"),
            result: TickResult::Closed {
                signal_id: "s1".into(),
                close_reason: CloseReason::TakeProfit,
                close_timestamp_ms: 0,
                pnl: Pnl { gross_pct: 0.02, net_pct_after_fees_and_slippage: 0.018 },
            },
        });
        bus.publish(EngineEvent::RiskRejected {
            meta: EventMeta::new(0, true).with_symbol("BTCUSDT").with_strategy("trend"),
            active_position_count: 3,
            comment: "cap".into(),
        });

        tokio::time::sleep(Duration::from_millis(20)).await;

        let stats = acc.snapshot_stats("trend", "BTCUSDT").await;
        assert_eq!(stats.closed, 1);
        assert_eq!(stats.risk_rejected, 1);
        assert!((stats.net_pnl_sum - 0.018).abs() < 1e-9);
    }

    #[tokio::test]
    async fn ring_buffer_evicts_oldest() {
        let bus = EventBus::new();
        let acc = ReportAccumulator::new(2);
        acc.attach(&bus);

        for i in 0..5 {
            bus.publish(EngineEvent::Validation {
                meta: EventMeta::new(i, true).with_symbol("BTCUSDT").with_strategy("trend"),
                reason: format!("r{i}"),
            });
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let events = acc.events.read().await;
        let buf = &events[&("trend".to_string(), "BTCUSDT".to_string())];
        assert_eq!(buf.len(), 2);
    }

    #[tokio::test]
    async fn dump_to_file_writes_table_and_summary() {
        let bus = EventBus::new();
        let acc = ReportAccumulator::new(250);
        acc.attach(&bus);
        bus.publish(EngineEvent::PartialProfit {
            meta: EventMeta::new(0, true).with_symbol("BTCUSDT").with_strategy("trend"),
            signal_id: "s1".into(),
            level: 10,
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stats = acc.snapshot_stats("trend", "BTCUSDT").await;
        assert_eq!(stats.partial_profit, 1);

        let dir = tempdir().unwrap();
        let path = dir.path().join("report.txt");
        acc.dump_to_file(&path).await.unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("trend"));
        assert!(content.contains("BTCUSDT"));
        assert!(content.contains("pairs_tracked=1"));
    }

    #[tokio::test]
    async fn win_rate_and_aggregate_summary_reflect_closed_trades() {
        let bus = EventBus::new();
        let acc = ReportAccumulator::new(250);
        acc.attach(&bus);

        bus.publish(EngineEvent::Signal {
            meta: EventMeta::new(0, true).with_symbol("BTCUSDT").with_strategy("winner"),
            result: TickResult::Closed {
                signal_id: "s1".into(),
                close_reason: CloseReason::TakeProfit,
                close_timestamp_ms: 0,
                pnl: Pnl { gross_pct: 0.02, net_pct_after_fees_and_slippage: 0.02 },
            },
        });
        bus.publish(EngineEvent::Signal {
            meta: EventMeta::new(0, true).with_symbol("ETHUSDT").with_strategy("loser"),
            result: TickResult::Closed {
                signal_id: "s2".into(),
                close_reason: CloseReason::StopLoss,
                close_timestamp_ms: 0,
                pnl: Pnl { gross_pct: -0.03, net_pct_after_fees_and_slippage: -0.03 },
            },
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let winner = acc.snapshot_stats("winner", "BTCUSDT").await;
        assert_eq!(winner.win_rate(), Some(1.0));
        let loser = acc.snapshot_stats("loser", "ETHUSDT").await;
        assert_eq!(loser.win_rate(), Some(0.0));

        let summary = acc.aggregate_summary().await;
        assert_eq!(summary.pairs_tracked, 2);
        assert_eq!(summary.profitable_pairs, 1);
        assert_eq!(summary.best_performer.as_deref(), Some("winner/BTCUSDT"));
        assert_eq!(summary.worst_performer.as_deref(), Some("loser/ETHUSDT"));
    }
}
