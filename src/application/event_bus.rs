//! Typed multi-subscriber broadcast bus (spec.md §4.9).
//!
//! Publishers never block: `publish` only pushes onto each subscriber's
//! own unbounded mailbox. Each subscriber owns a single dedicated worker
//! task that drains its mailbox strictly in order, awaiting the
//! subscriber's (possibly async) callback before dequeuing the next
//! event — a single-slot FIFO queue per subscriber, as spec.md requires.
//! One slow subscriber never delays another: they each have their own
//! mailbox and worker.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

use crate::domain::event::EngineEvent;

pub const ALL_CHANNELS: &[&str] = &[
    "Signal",
    "SignalLive",
    "SignalBacktest",
    "DoneBacktest",
    "DoneLive",
    "DoneWalker",
    "ProgressBacktest",
    "ProgressWalker",
    "WalkerStep",
    "WalkerComplete",
    "PartialProfit",
    "PartialLoss",
    "RiskRejected",
    "Performance",
    "Validation",
    "Error",
    "Exit",
];

pub type AsyncCallback = Arc<dyn Fn(EngineEvent) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<&'static str, Vec<mpsc::UnboundedSender<EngineEvent>>>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Non-blocking: enqueues onto every subscriber of this event's
    /// channel. No drop policy — queues grow if a subscriber is slow,
    /// which is intentional given tick-bounded event volume.
    pub fn publish(&self, event: EngineEvent) {
        let channel = event.channel();
        let subscribers = self.subscribers.read().expect("event bus lock poisoned");
        if let Some(senders) = subscribers.get(channel) {
            for sender in senders {
                // A closed receiver means the subscriber's worker task
                // has exited; publishing to it is a silent no-op.
                let _ = sender.send(event.clone());
            }
        }
    }

    /// Subscribe to a single channel. `callback` runs once per event, in
    /// strict emission order, on a dedicated worker task.
    pub fn subscribe(self: &Arc<Self>, channel: &'static str, callback: AsyncCallback) {
        let (tx, mut rx) = mpsc::unbounded_channel::<EngineEvent>();
        self.subscribers
            .write()
            .expect("event bus lock poisoned")
            .entry(channel)
            .or_default()
            .push(tx);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                callback(event).await;
            }
        });
    }

    /// Subscribe to every channel (used by Report Accumulators).
    pub fn subscribe_all(self: &Arc<Self>, callback: AsyncCallback) {
        for channel in ALL_CHANNELS {
            self.subscribe(channel, callback.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::EventMeta;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn delivers_only_to_matching_channel() {
        let bus = EventBus::new();
        let profit_count = Arc::new(AtomicUsize::new(0));
        let loss_count = Arc::new(AtomicUsize::new(0));

        let pc = profit_count.clone();
        bus.subscribe(
            "PartialProfit",
            Arc::new(move |_event| {
                pc.fetch_add(1, Ordering::SeqCst);
                Box::pin(async {})
            }),
        );
        let lc = loss_count.clone();
        bus.subscribe(
            "PartialLoss",
            Arc::new(move |_event| {
                lc.fetch_add(1, Ordering::SeqCst);
                Box::pin(async {})
            }),
        );

        bus.publish(EngineEvent::PartialProfit {
            meta: EventMeta::new(0, true),
            signal_id: "s1".into(),
            level: 10,
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(profit_count.load(Ordering::SeqCst), 1);
        assert_eq!(loss_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn preserves_emission_order_per_subscriber() {
        let bus = EventBus::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        bus.subscribe(
            "Validation",
            Arc::new(move |event| {
                let seen = seen_clone.clone();
                Box::pin(async move {
                    if let EngineEvent::Validation { reason, .. } = event {
                        // Simulate uneven callback latency; order must
                        // still be preserved because this is a single
                        // worker draining one mailbox sequentially.
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        seen.lock().unwrap().push(reason);
                    }
                })
            }),
        );

        for i in 0..5 {
            bus.publish(EngineEvent::Validation {
                meta: EventMeta::new(i, true),
                reason: format!("r{i}"),
            });
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec!["r0", "r1", "r2", "r3", "r4"]);
    }
}
