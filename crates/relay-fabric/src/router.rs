use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use relay_core::envelope::Envelope;
use relay_core::errors::FabricError;
use relay_core::ids::{RoutingKey, SpanId, TerminalId, TraceId};
use relay_store::traces::SpanStatus;

use crate::config::FabricConfig;
use crate::registry::{ConnectionRegistry, RegistryEvent};
use crate::trace::TraceRecorder;

/// How a routed event left the router.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handed to the destination terminal's ordered channel.
    Delivered(TerminalId),
    /// Parked in the destination's FIFO queue (1-based position).
    Queued { position: usize },
}

struct QueuedDelivery {
    envelope: Envelope,
    trace_id: TraceId,
    span_id: SpanId,
    enqueued_at: Instant,
}

/// Routes stimuli to terminals by (department, clinician). A live destination
/// gets at-most-once delivery through its ordered channel; otherwise the
/// event waits in a bounded per-destination FIFO with a TTL. The delivery
/// span, and with it the owning trace, is resolved here. Drained keys are
/// evicted so the queue map only tracks destinations with waiting work.
pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    traces: Arc<TraceRecorder>,
    queues: DashMap<RoutingKey, Mutex<VecDeque<QueuedDelivery>>>,
    config: FabricConfig,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        traces: Arc<TraceRecorder>,
        config: FabricConfig,
    ) -> Self {
        Self {
            registry,
            traces,
            queues: DashMap::new(),
            config,
        }
    }

    /// Route one envelope to the destination key. Opens the delivery span
    /// under `trace`; the span and trace close when delivery resolves —
    /// immediately on handoff or failure, later for queued events.
    #[instrument(skip(self, envelope), fields(routing_key = %key, trace_id = %trace))]
    pub fn route(
        &self,
        key: &RoutingKey,
        envelope: Envelope,
        trace: &TraceId,
        parent: Option<&SpanId>,
    ) -> Result<DeliveryOutcome, FabricError> {
        let terminal = key.terminal_id();
        let span = self.traces.open_span(
            trace,
            parent,
            "deliver",
            Some(&terminal),
            false,
            Some(serde_json::json!({ "messageId": envelope.id })),
        )?;

        let queue_entry = self.queues.entry(key.clone()).or_default();
        let mut queue = queue_entry.lock();

        // A non-empty queue means earlier events are still waiting: go to the
        // back so per-terminal arrival order holds.
        if queue.is_empty() {
            if let Some(tx) = self.registry.sender(&terminal) {
                match tx.try_send(envelope) {
                    Ok(()) => {
                        drop(queue);
                        drop(queue_entry);
                        self.reap_if_empty(key);
                        self.traces.close_span(&span, SpanStatus::Success, None, None);
                        self.traces.close_trace(trace);
                        debug!(terminal_id = %terminal, "delivered");
                        return Ok(DeliveryOutcome::Delivered(terminal));
                    }
                    // Full or closed channel: fall through to the queue.
                    Err(TrySendError::Full(returned)) | Err(TrySendError::Closed(returned)) => {
                        return self.enqueue(&mut queue, key, returned, trace, span);
                    }
                }
            }
        }

        self.enqueue(&mut queue, key, envelope, trace, span)
    }

    fn enqueue(
        &self,
        queue: &mut VecDeque<QueuedDelivery>,
        key: &RoutingKey,
        envelope: Envelope,
        trace: &TraceId,
        span: SpanId,
    ) -> Result<DeliveryOutcome, FabricError> {
        if queue.len() >= self.config.queue_capacity {
            let reason = format!("queue full for {key}");
            self.traces
                .close_span(&span, SpanStatus::Failed, None, Some(&reason));
            self.traces.close_trace(trace);
            warn!(routing_key = %key, "delivery rejected: queue full");
            return Err(FabricError::DeliveryExpired(reason));
        }
        queue.push_back(QueuedDelivery {
            envelope,
            trace_id: trace.clone(),
            span_id: span,
            enqueued_at: Instant::now(),
        });
        debug!(routing_key = %key, depth = queue.len(), "queued for later delivery");
        Ok(DeliveryOutcome::Queued {
            position: queue.len(),
        })
    }

    /// Drain a destination's queue in FIFO order after it (re)connects.
    /// Entries past their TTL expire instead of delivering.
    #[instrument(skip(self), fields(routing_key = %key))]
    pub fn flush(&self, key: &RoutingKey) {
        let Some(queue_entry) = self.queues.get(key) else {
            return;
        };
        let terminal = key.terminal_id();
        let mut queue = queue_entry.lock();
        let mut delivered = 0usize;

        while let Some(item) = queue.pop_front() {
            if item.enqueued_at.elapsed() >= self.config.queue_ttl {
                self.expire(&item, "ttl elapsed before delivery");
                continue;
            }
            let Some(tx) = self.registry.sender(&terminal) else {
                queue.push_front(item);
                break;
            };
            let QueuedDelivery {
                envelope,
                trace_id,
                span_id,
                enqueued_at,
            } = item;
            match tx.try_send(envelope) {
                Ok(()) => {
                    self.traces.close_span(&span_id, SpanStatus::Success, None, None);
                    self.traces.close_trace(&trace_id);
                    delivered += 1;
                }
                Err(TrySendError::Full(envelope)) | Err(TrySendError::Closed(envelope)) => {
                    queue.push_front(QueuedDelivery {
                        envelope,
                        trace_id,
                        span_id,
                        enqueued_at,
                    });
                    break;
                }
            }
        }
        drop(queue);
        drop(queue_entry);
        self.reap_if_empty(key);
        if delivered > 0 {
            info!(routing_key = %key, delivered, "flushed queued deliveries");
        }
    }

    /// Expire queued entries past their TTL across all destinations.
    /// Entries are FIFO per key, so expiry only ever pops from the front.
    pub fn purge_expired(&self) -> usize {
        let mut expired = 0usize;
        let mut drained: Vec<RoutingKey> = Vec::new();
        for queue_entry in self.queues.iter() {
            let mut queue = queue_entry.lock();
            while queue
                .front()
                .is_some_and(|item| item.enqueued_at.elapsed() >= self.config.queue_ttl)
            {
                if let Some(item) = queue.pop_front() {
                    self.expire(&item, "ttl elapsed in queue");
                    expired += 1;
                }
            }
            if queue.is_empty() {
                drained.push(queue_entry.key().clone());
            }
        }
        // Removal waits until iteration ends; remove_if while holding a
        // shard guard would deadlock.
        for key in drained {
            self.reap_if_empty(&key);
        }
        expired
    }

    /// Cancel queued work for a destination that just disconnected.
    fn drop_queued(&self, key: &RoutingKey) {
        let Some(queue_entry) = self.queues.get(key) else {
            return;
        };
        let mut queue = queue_entry.lock();
        let dropped = queue.len();
        while let Some(item) = queue.pop_front() {
            self.traces.close_span(
                &item.span_id,
                SpanStatus::Timeout,
                None,
                Some("terminal disconnected"),
            );
            self.traces.close_trace(&item.trace_id);
        }
        drop(queue);
        drop(queue_entry);
        self.reap_if_empty(key);
        if dropped > 0 {
            warn!(routing_key = %key, dropped, "dropped queued deliveries on disconnect");
        }
    }

    // Emptiness is re-checked under the shard lock, so a racing enqueue
    // keeps its entry.
    fn reap_if_empty(&self, key: &RoutingKey) {
        self.queues.remove_if(key, |_, queue| queue.lock().is_empty());
    }

    fn expire(&self, item: &QueuedDelivery, reason: &str) {
        self.traces
            .close_span(&item.span_id, SpanStatus::Failed, None, Some(reason));
        self.traces.close_trace(&item.trace_id);
    }

    pub fn queue_depth(&self, key: &RoutingKey) -> usize {
        self.queues.get(key).map_or(0, |q| q.lock().len())
    }

    /// Consume registry lifecycle events: flush queues on connect, cancel
    /// queued work and force-close pending delivery spans on disconnect.
    pub fn spawn_event_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let router = Arc::clone(self);
        let mut events = router.registry.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(RegistryEvent::Connected(id)) => {
                        if let Some(key) = id.routing_key() {
                            router.flush(&key);
                        }
                    }
                    Ok(RegistryEvent::Disconnected { terminal, .. }) => {
                        router.traces.force_close_terminal_spans(&terminal);
                        if let Some(key) = terminal.routing_key() {
                            router.drop_queued(&key);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "registry event stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Spawn the periodic TTL purge.
    pub fn spawn_purger(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(router.config.sweep_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let expired = router.purge_expired();
                if expired > 0 {
                    warn!(expired, "expired queued deliveries");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::envelope::MessageKind;
    use relay_store::traces::{TraceRepo, TraceStatus};
    use relay_store::Database;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        traces: Arc<TraceRecorder>,
        router: MessageRouter,
    }

    fn fixture(config: FabricConfig) -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new(config.clone()));
        let traces = Arc::new(TraceRecorder::new(
            TraceRepo::new(Database::in_memory().unwrap()),
            config.clone(),
        ));
        let router = MessageRouter::new(Arc::clone(&registry), Arc::clone(&traces), config);
        Fixture {
            registry,
            traces,
            router,
        }
    }

    fn connect(fx: &Fixture, dept: &str, user: &str) -> (TerminalId, mpsc::Receiver<Envelope>) {
        let id = TerminalId::new(dept, user);
        let (tx, rx) = mpsc::channel(16);
        fx.registry.register(&id, user, dept, None, tx).unwrap();
        (id, rx)
    }

    fn envelope(n: u64) -> Envelope {
        Envelope::new(MessageKind::PatientData, serde_json::json!({ "seq": n }))
    }

    #[tokio::test]
    async fn delivers_to_connected_terminal() {
        let fx = fixture(FabricConfig::default());
        let (id, mut rx) = connect(&fx, "CARD", "D1001");
        let key = RoutingKey::new("CARD", "D1001");

        let trace = fx.traces.open_trace("his_push");
        let outcome = fx.router.route(&key, envelope(1), &trace, None).unwrap();
        assert_eq!(outcome, DeliveryOutcome::Delivered(id));
        assert_eq!(rx.recv().await.unwrap().data["seq"], 1);

        // Delivery resolution closed the trace.
        let (row, _) = fx.traces.load(&trace).unwrap();
        assert_eq!(row.status, TraceStatus::Success);
    }

    #[tokio::test]
    async fn queues_when_destination_absent_and_flushes_in_order() {
        let fx = fixture(FabricConfig::default());
        let key = RoutingKey::new("CARD", "D1001");

        for n in 1..=3 {
            let trace = fx.traces.open_trace("his_push");
            let outcome = fx.router.route(&key, envelope(n), &trace, None).unwrap();
            assert_eq!(outcome, DeliveryOutcome::Queued { position: n as usize });
        }
        assert_eq!(fx.router.queue_depth(&key), 3);

        let (_, mut rx) = connect(&fx, "CARD", "D1001");
        fx.router.flush(&key);

        for n in 1..=3 {
            assert_eq!(rx.recv().await.unwrap().data["seq"], n);
        }
        assert_eq!(fx.router.queue_depth(&key), 0);
    }

    #[tokio::test]
    async fn queue_full_is_delivery_expired() {
        let config = FabricConfig {
            queue_capacity: 2,
            ..FabricConfig::default()
        };
        let fx = fixture(config);
        let key = RoutingKey::new("CARD", "D1001");

        for n in 1..=2 {
            let trace = fx.traces.open_trace("his_push");
            fx.router.route(&key, envelope(n), &trace, None).unwrap();
        }
        let trace = fx.traces.open_trace("his_push");
        let err = fx.router.route(&key, envelope(3), &trace, None).unwrap_err();
        assert!(matches!(err, FabricError::DeliveryExpired(_)));

        // The rejected event's trace closed Failed.
        let (row, _) = fx.traces.load(&trace).unwrap();
        assert_eq!(row.status, TraceStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expiry_closes_span_failed() {
        let config = FabricConfig {
            queue_ttl: Duration::from_secs(120),
            ..FabricConfig::default()
        };
        let fx = fixture(config);
        let key = RoutingKey::new("CARD", "D1001");

        let trace = fx.traces.open_trace("his_push");
        fx.router.route(&key, envelope(1), &trace, None).unwrap();

        tokio::time::advance(Duration::from_secs(121)).await;
        assert_eq!(fx.router.purge_expired(), 1);
        assert_eq!(fx.router.queue_depth(&key), 0);
        assert_eq!(fx.router.queues.len(), 0);

        let (row, tree) = fx.traces.load(&trace).unwrap();
        assert_eq!(row.status, TraceStatus::Failed);
        assert_eq!(tree[0].span.error_message.as_deref(), Some("ttl elapsed in queue"));
    }

    #[tokio::test(start_paused = true)]
    async fn flush_expires_stale_entries_instead_of_delivering() {
        let fx = fixture(FabricConfig::default());
        let key = RoutingKey::new("CARD", "D1001");

        let stale_trace = fx.traces.open_trace("his_push");
        fx.router.route(&key, envelope(1), &stale_trace, None).unwrap();

        tokio::time::advance(Duration::from_secs(121)).await;
        let fresh_trace = fx.traces.open_trace("his_push");
        fx.router.route(&key, envelope(2), &fresh_trace, None).unwrap();

        let (_, mut rx) = connect(&fx, "CARD", "D1001");
        fx.router.flush(&key);

        // Only the fresh event arrives.
        assert_eq!(rx.recv().await.unwrap().data["seq"], 2);
        assert!(rx.try_recv().is_err());

        let (stale_row, _) = fx.traces.load(&stale_trace).unwrap();
        assert_eq!(stale_row.status, TraceStatus::Failed);
        let (fresh_row, _) = fx.traces.load(&fresh_trace).unwrap();
        assert_eq!(fresh_row.status, TraceStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_to_idle_terminal() {
        let fx = fixture(FabricConfig::default());
        let (id, mut rx) = connect(&fx, "CARD", "D1001");
        let key = RoutingKey::new("CARD", "D1001");

        // One missed heartbeat interval: Idle, but the socket is still open.
        tokio::time::advance(Duration::from_secs(35)).await;
        fx.registry.sweep();
        assert_eq!(
            fx.registry.state(&id),
            Some(crate::registry::TerminalState::Idle)
        );

        let trace = fx.traces.open_trace("his_push");
        let outcome = fx.router.route(&key, envelope(1), &trace, None).unwrap();
        assert_eq!(outcome, DeliveryOutcome::Delivered(id));
        assert_eq!(rx.recv().await.unwrap().data["seq"], 1);
    }

    #[tokio::test]
    async fn drained_queues_are_evicted() {
        let fx = fixture(FabricConfig::default());
        let key = RoutingKey::new("CARD", "D1001");

        let trace = fx.traces.open_trace("his_push");
        fx.router.route(&key, envelope(1), &trace, None).unwrap();
        assert_eq!(fx.router.queues.len(), 1);

        let (_, mut rx) = connect(&fx, "CARD", "D1001");
        fx.router.flush(&key);
        assert_eq!(rx.recv().await.unwrap().data["seq"], 1);
        assert_eq!(fx.router.queues.len(), 0);

        // Immediate delivery leaves nothing tracked either.
        let trace = fx.traces.open_trace("his_push");
        fx.router.route(&key, envelope(2), &trace, None).unwrap();
        assert_eq!(rx.recv().await.unwrap().data["seq"], 2);
        assert_eq!(fx.router.queues.len(), 0);

        // So does cancelling queued work on disconnect.
        let trace = fx.traces.open_trace("his_push");
        fx.router.route(&RoutingKey::new("RAD", "D2002"), envelope(3), &trace, None).unwrap();
        assert_eq!(fx.router.queues.len(), 1);
        fx.router.drop_queued(&RoutingKey::new("RAD", "D2002"));
        assert_eq!(fx.router.queues.len(), 0);
    }

    #[tokio::test]
    async fn different_destinations_do_not_interfere() {
        let fx = fixture(FabricConfig::default());
        let (_, mut rx_a) = connect(&fx, "CARD", "D1001");
        let key_a = RoutingKey::new("CARD", "D1001");
        let key_b = RoutingKey::new("RAD", "D2002");

        let trace_a = fx.traces.open_trace("his_push");
        let trace_b = fx.traces.open_trace("his_push");

        // B is absent: its event queues without affecting A's delivery.
        let outcome_b = fx.router.route(&key_b, envelope(9), &trace_b, None).unwrap();
        assert!(matches!(outcome_b, DeliveryOutcome::Queued { .. }));
        let outcome_a = fx.router.route(&key_a, envelope(1), &trace_a, None).unwrap();
        assert!(matches!(outcome_a, DeliveryOutcome::Delivered(_)));
        assert_eq!(rx_a.recv().await.unwrap().data["seq"], 1);
    }

    #[tokio::test]
    async fn arrival_after_queue_starts_stays_behind_it() {
        let fx = fixture(FabricConfig::default());
        let key = RoutingKey::new("CARD", "D1001");

        // First event queues (no destination yet).
        let trace1 = fx.traces.open_trace("his_push");
        fx.router.route(&key, envelope(1), &trace1, None).unwrap();

        // Destination connects, but the queue is non-empty: the next event
        // must not overtake the queued one.
        let (_, mut rx) = connect(&fx, "CARD", "D1001");
        let trace2 = fx.traces.open_trace("his_push");
        let outcome = fx.router.route(&key, envelope(2), &trace2, None).unwrap();
        assert_eq!(outcome, DeliveryOutcome::Queued { position: 2 });

        fx.router.flush(&key);
        assert_eq!(rx.recv().await.unwrap().data["seq"], 1);
        assert_eq!(rx.recv().await.unwrap().data["seq"], 2);
    }

    #[tokio::test]
    async fn disconnect_drops_queued_work_as_timeout() {
        let fx = fixture(FabricConfig::default());
        let key = RoutingKey::new("CARD", "D1001");

        let trace = fx.traces.open_trace("his_push");
        fx.router.route(&key, envelope(1), &trace, None).unwrap();
        fx.router.drop_queued(&key);

        assert_eq!(fx.router.queue_depth(&key), 0);
        let (row, tree) = fx.traces.load(&trace).unwrap();
        assert_eq!(row.status, TraceStatus::Failed);
        assert_eq!(tree[0].span.status, SpanStatus::Timeout);
    }
}
