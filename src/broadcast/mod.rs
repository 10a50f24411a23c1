//! Event batch broadcaster.
//!
//! Events pushed between two flush ticks accumulate in an [`EventQueue`];
//! each tick swaps the whole queue out and hands it, in push order, to
//! every connected [`Subscriber`] as one batch. Delivery failures are
//! logged per subscriber and never requeued.

pub mod subscriber;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::export::health::HealthMetrics;
use crate::source::HostSnapshot;
use crate::store::{HostHistory, LogKind, ProcessException};

pub use self::subscriber::{Batch, ChannelSubscriber, DeliveryError, Subscriber, WriterSubscriber};

/// One outbound `{method, args}` record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub method: String,
    pub args: Vec<Value>,
}

impl Event {
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            args,
        }
    }

    /// `onSystemData [snapshot]`.
    pub fn system_data(snapshot: &HostSnapshot) -> Self {
        Self::new("onSystemData", vec![to_value(snapshot)])
    }

    /// `onInfoLog` / `onErrorLog` with `[host, id, line]`.
    pub fn log(host: &str, id: u32, kind: LogKind, line: &str) -> Self {
        let method = match kind {
            LogKind::Info => "onInfoLog",
            LogKind::Error => "onErrorLog",
        };
        Self::new(method, vec![json!(host), json!(id), json!(line)])
    }

    /// `onProcessException [host, id, message, stack]`.
    pub fn process_exception(host: &str, id: u32, exception: &ProcessException) -> Self {
        Self::new(
            "onProcessException",
            vec![
                json!(host),
                json!(id),
                json!(exception.message),
                json!(exception.stack),
            ],
        )
    }

    /// `onConfig [config]`, sent to new subscribers.
    pub fn config(config: &impl Serialize) -> Self {
        Self::new("onConfig", vec![to_value(config)])
    }

    /// `onHosts [hosts]`, sent to new subscribers.
    pub fn hosts(hosts: &[Arc<HostHistory>]) -> Self {
        Self::new("onHosts", vec![to_value(hosts)])
    }
}

fn to_value(value: &(impl Serialize + ?Sized)) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        warn!(error = %e, "encoding event payload");
        Value::Null
    })
}

/// Whether the queue holds anything to flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastState {
    Idle,
    Accumulating,
}

/// FIFO of events pending the next flush.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: Mutex<Vec<Event>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event. Returns `true` when this moved the queue out of
    /// [`BroadcastState::Idle`].
    pub fn push(&self, event: Event) -> bool {
        let mut events = self.events.lock();
        events.push(event);
        events.len() == 1
    }

    /// Swaps the whole queue out, leaving it empty.
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self) -> BroadcastState {
        if self.is_empty() {
            BroadcastState::Idle
        } else {
            BroadcastState::Accumulating
        }
    }
}

pub type SubscriberId = u64;

/// Result of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Events in the flushed batch; 0 when the queue was empty.
    pub events: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Subscribers dropped because they reported closed.
    pub removed: usize,
}

/// Batches queued events and fans them out to subscribers.
pub struct Broadcaster {
    queue: EventQueue,
    subscribers: DashMap<SubscriberId, Box<dyn Subscriber>>,
    next_id: AtomicU64,
    health: Option<Arc<HealthMetrics>>,
    run_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Broadcaster {
    pub fn new(health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            queue: EventQueue::new(),
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            health,
            run_task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> BroadcastState {
        self.queue.state()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn push(&self, event: Event) {
        if self.queue.push(event) {
            debug!("broadcast queue accumulating");
        }
        if let Some(h) = &self.health {
            h.events_queued.inc();
        }
    }

    pub fn subscribe(&self, subscriber: Box<dyn Subscriber>) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        info!(id, subscriber = subscriber.name(), "subscriber connected");
        self.subscribers.insert(id, subscriber);
        self.update_subscriber_gauge();
        id
    }

    /// Delivers `greeting` straight to the new subscriber, bypassing the
    /// queue, then registers it for future batches.
    pub fn subscribe_with_greeting(
        &self,
        subscriber: Box<dyn Subscriber>,
        greeting: Vec<Event>,
    ) -> Result<SubscriberId, DeliveryError> {
        if !greeting.is_empty() {
            let batch: Batch = greeting.into();
            subscriber.deliver(&batch)?;
        }
        Ok(self.subscribe(subscriber))
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.remove(&id).is_some();
        if removed {
            info!(id, "subscriber disconnected");
            self.update_subscriber_gauge();
        }
        removed
    }

    /// Swaps out the pending queue and delivers it as one batch.
    ///
    /// An empty queue is a no-op. A failing subscriber is logged and
    /// skipped; the batch is never requeued.
    pub fn flush(&self) -> FlushOutcome {
        let events = self.queue.take();
        if events.is_empty() {
            return FlushOutcome::default();
        }

        let batch: Batch = events.into();
        let mut outcome = FlushOutcome {
            events: batch.len(),
            ..Default::default()
        };
        let mut closed = Vec::new();

        for entry in self.subscribers.iter() {
            match entry.value().deliver(&batch) {
                Ok(()) => outcome.delivered += 1,
                Err(e) => {
                    outcome.failed += 1;
                    warn!(
                        id = *entry.key(),
                        subscriber = entry.value().name(),
                        error = %e,
                        "batch delivery failed",
                    );
                    if let Some(h) = &self.health {
                        h.delivery_errors.with_label_values(&[e.reason()]).inc();
                    }
                    if matches!(e, DeliveryError::Closed) {
                        closed.push(*entry.key());
                    }
                }
            }
        }

        for id in closed {
            if self.unsubscribe(id) {
                outcome.removed += 1;
            }
        }

        if let Some(h) = &self.health {
            h.batches_flushed.inc();
            h.batch_size.observe(outcome.events as f64);
        }

        debug!(
            events = outcome.events,
            delivered = outcome.delivered,
            failed = outcome.failed,
            "batch flushed"
        );

        outcome
    }

    /// Spawns the flush loop on a fixed `frequency`, independent of
    /// ingestion. Cancellation runs one last flush.
    pub async fn start(self: &Arc<Self>, frequency: Duration, ctx: CancellationToken) {
        let this = Arc::clone(self);

        let run_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(frequency);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        let outcome = this.flush();
                        if outcome.events > 0 {
                            info!(events = outcome.events, "final flush");
                        }
                        return;
                    }
                    _ = ticker.tick() => {
                        this.flush();
                    }
                }
            }
        });
        *self.run_task.lock().await = Some(run_task);

        info!(frequency = ?frequency, "broadcaster started");
    }

    /// Waits for the flush loop to finish.
    pub async fn wait_for_shutdown(&self) {
        let run_task = { self.run_task.lock().await.take() };
        if let Some(run_task) = run_task {
            if let Err(e) = run_task.await {
                warn!(error = %e, "broadcaster task join failed");
            }
        }
    }

    fn update_subscriber_gauge(&self) {
        if let Some(h) = &self.health {
            h.subscribers.set(self.subscribers.len() as f64);
        }
    }
}
