// src/transport/memory/transport.rs

//! In-memory transport implementation.
//!
//! This file contains the concrete implementation of the domain-level
//! `Transport` trait using in-process data structures only: a routing table
//! standing in for the direct exchange, and one ready-deque per queue.
//!
//! Per-loop unacknowledged bookkeeping mirrors a broker channel: deliveries
//! move from the ready deque into the loop's unacked list, leave it on
//! accept/reject, and are pushed back to the front of the deque when the
//! loop stops.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;

use crate::domain::Disposition;
use crate::{
    //
    log_debug,
    log_trace,
    log_warn,
    Delivery,
    DeliverySink,
    Envelope,
    Error,
    QueueTopology,
    Result,
    Transport,
    TransportConfig,
    TransportPtr,
    WorkerHandle,
    WorkerId,
};

/// One in-process queue: ready messages plus a wakeup for idle consumers.
struct MemoryQueue {
    ready: Mutex<VecDeque<Envelope>>,
    wakeup: Notify,
}

impl MemoryQueue {
    fn new() -> Self {
        Self {
            ready: Mutex::new(VecDeque::new()),
            wakeup: Notify::new(),
        }
    }

    async fn push_back(&self, envelope: Envelope) {
        self.ready.lock().await.push_back(envelope);
        self.wakeup.notify_one();
    }

    async fn push_front(&self, envelope: Envelope) {
        self.ready.lock().await.push_front(envelope);
        self.wakeup.notify_one();
    }
}

/// In-memory transport.
///
/// Simulates the broker entirely within the process: queues are deques, the
/// exchange is a routing-key table, and channel affinity needs no state at
/// all. Intended for tests and for validating worker behavior without
/// broker, network, or timing variability.
struct MemoryTransport {
    // ---
    topology: QueueTopology,
    prefetch_count_per_worker: u16,
    delay_queue_prefetch_count: u16,
    queues: RwLock<HashMap<String, Arc<MemoryQueue>>>,
    bindings: RwLock<HashMap<String, BTreeSet<String>>>,
    // A cancelled token is permanent, so consumers racing with dispose still
    // observe the close.
    closed: CancellationToken,
}

impl MemoryTransport {
    // ---
    fn ensure_open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::Transport("transport is disposed".to_string()));
        }
        Ok(())
    }

    async fn ensure_queue(&self, name: &str) {
        // ---
        if self.queues.read().await.contains_key(name) {
            return;
        }

        let mut queues = self.queues.write().await;
        queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryQueue::new()));
    }

    async fn bind(&self, routing_key: &str, queue: &str) {
        // ---
        let mut bindings = self.bindings.write().await;
        bindings
            .entry(routing_key.to_string())
            .or_default()
            .insert(queue.to_string());
    }

    async fn publish(&self, routing_key: &str, envelope: &Envelope) -> Result<()> {
        // ---
        self.ensure_open()?;

        let targets: Vec<Arc<MemoryQueue>> = {
            let bindings = self.bindings.read().await;
            let Some(queue_names) = bindings.get(routing_key) else {
                // Direct-exchange semantics: unroutable messages vanish.
                log_trace!("no binding for {routing_key}, dropping {}", envelope.id);
                return Ok(());
            };

            let queues = self.queues.read().await;
            queue_names
                .iter()
                .filter_map(|name| queues.get(name).map(Arc::clone))
                .collect()
        };

        for queue in targets {
            queue.push_back(envelope.clone()).await;
        }

        log_trace!("sent {} to {routing_key}", envelope.id);
        Ok(())
    }

    async fn consume(
        &self,
        queue_name: &str,
        cumulative_ack: bool,
        prefetch: u16,
        signal: CancellationToken,
        sink: DeliverySink,
    ) -> Result<()> {
        // ---
        self.ensure_open()?;

        let queue = self
            .queues
            .read()
            .await
            .get(queue_name)
            .map(Arc::clone)
            .ok_or_else(|| Error::Transport(format!("unknown queue {queue_name}")))?;

        // Prefetch 0 means an unlimited window, as on the wire.
        let window = if prefetch == 0 {
            usize::MAX
        } else {
            usize::from(prefetch)
        };

        // Unacked bookkeeping is per loop, like a broker channel's.
        let mut unacked: Vec<(u64, Envelope)> = Vec::new();
        let mut next_tag: u64 = 0;

        log_debug!("consuming {queue_name} (prefetch {prefetch})");

        let outcome = loop {
            if signal.is_cancelled() {
                break Err(Error::Cancelled);
            }
            if let Err(error) = self.ensure_open() {
                break Err(error);
            }

            if unacked.len() >= window {
                // Window full of undisposed deliveries: nothing to do until
                // cancel or close.
                tokio::select! {
                    _ = signal.cancelled() => break Err(Error::Cancelled),
                    _ = self.closed.cancelled() => continue,
                };
            }

            let popped = queue.ready.lock().await.pop_front();
            let Some(envelope) = popped else {
                tokio::select! {
                    _ = signal.cancelled() => break Err(Error::Cancelled),
                    _ = self.closed.cancelled() => continue,
                    _ = queue.wakeup.notified() => continue,
                }
            };

            next_tag += 1;
            let tag = next_tag;
            unacked.push((tag, envelope.clone()));
            log_trace!("delivery {tag} on {queue_name}: {}", envelope.id);

            let (reply_tx, reply_rx) = oneshot::channel();
            let handoff = Delivery::new(envelope, reply_tx);

            tokio::select! {
                _ = signal.cancelled() => break Err(Error::Cancelled),
                sent = sink.send(handoff) => {
                    if sent.is_err() {
                        log_debug!("delivery sink for {queue_name} dropped, stopping");
                        break Ok(());
                    }
                }
            }

            // The disposition is settled before the next pull, so a stopping
            // loop leaves at most one undecided delivery behind.
            match reply_rx.await {
                Ok(Disposition::Accept) => {
                    if cumulative_ack {
                        unacked.retain(|(settled, _)| *settled > tag);
                    } else {
                        unacked.retain(|(settled, _)| *settled != tag);
                    }
                    log_trace!("acked {tag} on {queue_name}");
                }
                Ok(Disposition::Reject) => {
                    if let Some(index) = unacked.iter().position(|(held, _)| *held == tag) {
                        let (_, envelope) = unacked.remove(index);
                        queue.push_front(envelope).await;
                    }
                    log_trace!("requeued {tag} on {queue_name}");
                }
                Err(_) => {
                    // Dropped without a verdict: the delivery stays unacked
                    // and requeues when this loop stops.
                    log_warn!("delivery {tag} on {queue_name} dropped without a disposition");
                }
            }
        };

        if !unacked.is_empty() {
            log_debug!(
                "requeueing {} unacked deliveries on {queue_name}",
                unacked.len()
            );
            let mut ready = queue.ready.lock().await;
            for (_, envelope) in unacked.into_iter().rev() {
                ready.push_front(envelope);
            }
            drop(ready);
            queue.wakeup.notify_one();
        }

        outcome
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---
    fn topology(&self) -> &QueueTopology {
        &self.topology
    }

    async fn initialize_for_publishing(&self) -> Result<()> {
        // The in-process exchange always exists; nothing to declare.
        self.ensure_open()
    }

    async fn initialize_for_consuming(&self) -> Result<()> {
        // ---
        self.ensure_open()?;

        for name in self.topology.all() {
            self.ensure_queue(name).await;
            self.bind(name, name).await;
        }

        Ok(())
    }

    async fn register_subscription(&self, key: &str) -> Result<()> {
        // ---
        self.ensure_open()?;
        self.bind(key, self.topology.primary()).await;
        Ok(())
    }

    async fn send(
        &self,
        _worker: &WorkerHandle,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<()> {
        // Channel affinity is a broker concern; in-process publishing needs
        // no per-worker state.
        self.publish(routing_key, envelope).await
    }

    async fn get_messages(&self, signal: CancellationToken, sink: DeliverySink) -> Result<()> {
        // ---
        let prefetch = self.prefetch_count_per_worker;
        self.consume(self.topology.primary(), true, prefetch, signal, sink)
            .await
    }

    async fn get_delay_messages(
        &self,
        signal: CancellationToken,
        sink: DeliverySink,
    ) -> Result<()> {
        // ---
        let prefetch = self.delay_queue_prefetch_count;
        self.consume(self.topology.delay(), false, prefetch, signal, sink)
            .await
    }

    async fn release_worker(&self, _worker: WorkerId) -> Result<()> {
        // No per-worker channels exist in process.
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        // ---
        if !self.closed.is_cancelled() {
            log_debug!("disposing memory transport for {}", self.topology.primary());
        }
        self.closed.cancel();
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        // In process, disposing and shutting down coincide.
        self.dispose().await
    }
}

/// Create an in-memory transport for `base_queue`.
///
/// Always available and requires no broker. Connection-related settings in
/// `config` are accepted and ignored; the prefetch counts apply as they do
/// on the wire.
pub async fn create_transport(
    base_queue: impl Into<String>,
    config: TransportConfig,
) -> Result<TransportPtr> {
    // ---
    let transport = MemoryTransport {
        topology: QueueTopology::new(base_queue),
        prefetch_count_per_worker: config.prefetch_count_per_worker,
        delay_queue_prefetch_count: config.delay_queue_prefetch_count,
        queues: RwLock::new(HashMap::new()),
        bindings: RwLock::new(HashMap::new()),
        closed: CancellationToken::new(),
    };

    Ok(Arc::new(transport))
}
