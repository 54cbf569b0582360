// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the domain-level transport interface used by message
//! publishers and worker loops to exchange envelopes. It intentionally avoids
//! any reference to concrete protocols, brokers, or client libraries.
//!
//! A transport owns a three-queue reliability topology (primary, delay,
//! error) bound to one direct exchange, publishes envelopes with per-worker
//! channel affinity, and runs cancellable consume loops that hand deliveries
//! to the application over a bounded channel.
//!
//! Concrete implementations of this interface live under `src/transport/`.
//! The in-memory transport provides the reference semantics.

use crate::Result;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::envelope::Envelope;
use super::topology::QueueTopology;
use super::worker::{WorkerHandle, WorkerId};

/// Outcome the application chose for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// Acknowledge: the message is done and may be discarded by the broker.
    Accept,
    /// Reject and requeue: the message becomes deliverable again.
    Reject,
}

/// One in-flight delivery handed from a consume loop to the application.
///
/// The application must resolve every delivery exactly once by calling
/// [`accept`](Delivery::accept) or [`reject`](Delivery::reject); both take
/// the delivery by value, so the type system rules out double-settling.
/// Dropping a delivery unresolved leaves the message unacknowledged; it
/// returns to its queue when the consuming channel closes.
pub struct Delivery {
    // ---
    envelope: Envelope,
    reply: oneshot::Sender<Disposition>,
}

impl Delivery {
    // ---
    pub(crate) fn new(envelope: Envelope, reply: oneshot::Sender<Disposition>) -> Self {
        Self { envelope, reply }
    }

    /// The delivered envelope.
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Acknowledge the message.
    pub fn accept(self) {
        // The loop may already be gone; the broker then requeues on its own.
        let _ = self.reply.send(Disposition::Accept);
    }

    /// Reject the message and put it back on its queue.
    pub fn reject(self) {
        let _ = self.reply.send(Disposition::Reject);
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .finish_non_exhaustive()
    }
}

/// Sending half of the channel a consume loop delivers into.
///
/// The loop blocks (cancellably) when the application falls behind, so the
/// channel's capacity bounds in-process buffering on top of the broker's
/// prefetch window.
pub type DeliverySink = mpsc::Sender<Delivery>;

/// Transport abstraction.
///
/// A `Transport` moves envelopes through a fixed reliability topology:
///
/// - `{base}` is the primary work queue,
/// - `{base}_Delay` holds messages deferred for later redelivery,
/// - `{base}_Error` holds messages that exhausted processing.
///
/// Implementations must ensure that:
/// - Declaration calls are idempotent; re-running them against an existing
///   topology is a no-op.
/// - `send` routes by key through the direct exchange; a key with no bound
///   queue means the message is dropped, not an error.
/// - A consume loop resolves each delivery's disposition before pulling the
///   next one past the prefetch window, and requeues whatever is unresolved
///   when it stops.
///
/// # Notes
///
/// The trait goes through `async_trait` to stay object-safe, so rustdoc may
/// render boxed futures and explicit lifetimes. Call the methods as ordinary
/// `async fn`s.
///
/// # Example
///
/// ```no_run
/// use tokio_util::sync::CancellationToken;
/// use wave_amqp::{create_memory_transport, Envelope, TransportConfig, WorkerHandle};
///
/// # async fn example() -> wave_amqp::Result<()> {
/// let transport = create_memory_transport("Orders", TransportConfig::default()).await?;
/// transport.initialize_for_publishing().await?;
/// transport.initialize_for_consuming().await?;
///
/// let worker = WorkerHandle::new();
/// transport
///     .send_to_primary(&worker, &Envelope::new(r#"{"order_id": 42}"#))
///     .await?;
///
/// let (sink, mut inbox) = tokio::sync::mpsc::channel(16);
/// let signal = CancellationToken::new();
/// let consume = {
///     let transport = transport.clone();
///     let signal = signal.clone();
///     tokio::spawn(async move { transport.get_messages(signal, sink).await })
/// };
///
/// if let Some(delivery) = inbox.recv().await {
///     println!("got: {}", delivery.envelope().payload);
///     delivery.accept();
/// }
///
/// signal.cancel();
/// let _ = consume.await;
/// # Ok(())
/// # }
/// ```
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// The queue names this transport operates on.
    fn topology(&self) -> &QueueTopology;

    /// Ensure the exchange exists so that `send` has somewhere to route.
    ///
    /// Required before publishing from a process that never consumes.
    async fn initialize_for_publishing(&self) -> Result<()>;

    /// Declare the exchange, the three queues, and bind each queue under its
    /// own name as routing key.
    ///
    /// Idempotent: safe to call on every startup and after broker recovery.
    async fn initialize_for_consuming(&self) -> Result<()>;

    /// Bind the primary queue under an additional routing key.
    ///
    /// Messages sent to `key` are then delivered to this transport's primary
    /// queue alongside direct sends.
    async fn register_subscription(&self, key: &str) -> Result<()>;

    /// Publish an envelope to the exchange under `routing_key`.
    ///
    /// Uses the channel owned by `worker`, opening one on first use. A key
    /// nothing is bound to drops the message silently.
    async fn send(&self, worker: &WorkerHandle, routing_key: &str, envelope: &Envelope)
        -> Result<()>;

    /// Publish straight to this transport's primary queue.
    async fn send_to_primary(&self, worker: &WorkerHandle, envelope: &Envelope) -> Result<()> {
        self.send(worker, self.topology().primary(), envelope).await
    }

    /// Publish to the delay queue for deferred redelivery.
    async fn send_to_delay(&self, worker: &WorkerHandle, envelope: &Envelope) -> Result<()> {
        self.send(worker, self.topology().delay(), envelope).await
    }

    /// Publish to the error queue.
    async fn send_to_error(&self, worker: &WorkerHandle, envelope: &Envelope) -> Result<()> {
        self.send(worker, self.topology().error(), envelope).await
    }

    /// Consume the primary queue until cancelled.
    ///
    /// Acknowledgements are cumulative: accepting a delivery also settles any
    /// earlier deliveries of the same loop still awaiting their ack. Returns
    /// `Err(Error::Cancelled)` once `signal` fires, or `Ok(())` if the
    /// application dropped the receiving end of `sink`.
    async fn get_messages(&self, signal: CancellationToken, sink: DeliverySink) -> Result<()>;

    /// Consume the delay queue until cancelled.
    ///
    /// Acknowledgements are per-message: delay consumers settle deliveries in
    /// due-time order rather than delivery order, and a cumulative ack would
    /// double-settle predecessors.
    async fn get_delay_messages(&self, signal: CancellationToken, sink: DeliverySink)
        -> Result<()>;

    /// Release the publishing channel held for a worker, if any.
    ///
    /// Deterministic counterpart of the periodic sweep that reclaims channels
    /// of dropped handles.
    async fn release_worker(&self, worker: WorkerId) -> Result<()>;

    /// Release all publishing channels and stop background upkeep.
    ///
    /// Idempotent. A disposed transport rejects further operations; closing
    /// the broker connection itself is [`shutdown`](Transport::shutdown)'s
    /// job.
    async fn dispose(&self) -> Result<()>;

    /// Dispose, then close the broker connection itself.
    async fn shutdown(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// An `Arc<dyn Transport>`: clones are cheap, every clone talks to the same
/// broker resources (one connection, one channel registry), and concrete
/// transport types stay hidden behind the domain interface.
pub type TransportPtr = Arc<dyn Transport>;
