// src/transport/amqp/transport.rs

//! RabbitMQ-backed implementation of the `Transport` trait.
//!
//! ## Channel discipline
//!
//! Channels are never shared between concerns:
//!
//! - Declaration calls open a channel, declare, and close it again.
//! - Each publishing worker keeps one long-lived send channel, found closed
//!   channels are replaced once per send.
//! - Each consume loop owns its channel for the lifetime of the loop and
//!   closes it on the way out, which is also what returns unacknowledged
//!   deliveries to their queue.
//!
//! ## Background upkeep
//!
//! A sweeper task wakes every five minutes and closes send channels whose
//! workers dropped their handle without calling `release_worker`. The task
//! holds only a weak reference to the registry, so an abandoned transport is
//! still collectable.

use lapin::options::{
    //
    BasicAckOptions,
    BasicConsumeOptions,
    BasicNackOptions,
    BasicPublishOptions,
    BasicQosOptions,
    ExchangeDeclareOptions,
    QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, ExchangeKind};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use futures_lite::stream::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::channels::ChannelRegistry;
use super::codec;
use super::connection::ConnectionManager;
use crate::domain::Disposition;
use crate::{
    //
    log_debug,
    log_info,
    log_trace,
    log_warn,
    Delivery,
    DeliverySink,
    Envelope,
    Error,
    OnSendHook,
    PublishProperties,
    QueueArg,
    QueueTopology,
    Result,
    Transport,
    TransportConfig,
    TransportPtr,
    WorkerHandle,
    WorkerId,
};

/// Cadence of the dead send-channel sweep.
const SEND_CHANNEL_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

type Registry = ChannelRegistry<Arc<ConnectionManager>>;

struct AmqpTransport {
    // ---
    topology: QueueTopology,
    exchange: String,
    auto_delete_queues: bool,
    prefetch_count_per_worker: u16,
    delay_queue_prefetch_count: u16,
    content_type: String,
    encoding_name: String,
    on_send: Option<OnSendHook>,
    primary_queue_arguments: FieldTable,
    connection: Arc<ConnectionManager>,
    channels: Arc<Registry>,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

/// Creates a RabbitMQ-backed transport for `base_queue`.
///
/// The connection URI is validated here; the connection itself is dialled on
/// first use. A background task sweeps dead send channels every five minutes.
pub async fn create_transport(
    base_queue: impl Into<String>,
    config: TransportConfig,
) -> Result<TransportPtr> {
    // ---
    let connection = Arc::new(ConnectionManager::new(
        &config.connection_uri,
        config.heartbeat_secs,
    )?);
    let channels = Arc::new(ChannelRegistry::new(Arc::clone(&connection)));
    let sweeper = spawn_sweeper(Arc::downgrade(&channels));

    let transport = AmqpTransport {
        topology: QueueTopology::new(base_queue),
        exchange: config.exchange,
        auto_delete_queues: config.auto_delete_queues,
        prefetch_count_per_worker: config.prefetch_count_per_worker,
        delay_queue_prefetch_count: config.delay_queue_prefetch_count,
        content_type: config.content_type,
        encoding_name: config.encoding_name,
        on_send: config.on_send,
        primary_queue_arguments: queue_arguments(&config.primary_queue_arguments),
        connection,
        channels,
        sweeper: StdMutex::new(Some(sweeper)),
        disposed: AtomicBool::new(false),
    };

    log_info!(
        "created AMQP transport for queue {}",
        transport.topology.primary()
    );
    Ok(Arc::new(transport))
}

fn spawn_sweeper(channels: Weak<Registry>) -> JoinHandle<()> {
    // ---
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SEND_CHANNEL_SWEEP_INTERVAL);
        // An interval's first tick fires immediately; the sweep starts one
        // full period out.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(channels) = channels.upgrade() else {
                break;
            };
            match channels.sweep_dead().await {
                Ok(0) => {}
                Ok(swept) => {
                    log_debug!("swept {swept} dead send channels");
                }
                Err(error) => {
                    log_warn!("send channel sweep failed: {error}");
                }
            }
        }
    })
}

fn queue_arguments(arguments: &BTreeMap<String, QueueArg>) -> FieldTable {
    // ---
    let mut table = FieldTable::default();
    for (key, value) in arguments {
        let value = match value {
            QueueArg::Int(value) => AMQPValue::LongInt(*value),
            QueueArg::Str(value) => AMQPValue::LongString(value.as_str().into()),
            QueueArg::Bool(value) => AMQPValue::Boolean(*value),
        };
        table.insert(key.as_str().into(), value);
    }
    table
}

fn lock_ignore_poison<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl AmqpTransport {
    // ---
    fn ensure_usable(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Transport("transport is disposed".to_string()));
        }
        Ok(())
    }

    async fn declare_exchange(&self, channel: &Channel) -> Result<()> {
        // ---
        let options = ExchangeDeclareOptions {
            durable: true,
            ..ExchangeDeclareOptions::default()
        };

        channel
            .exchange_declare(
                &self.exchange,
                ExchangeKind::Direct,
                options,
                FieldTable::default(),
            )
            .await
            .map_err(Error::Declaration)
    }

    async fn declare_queue(
        &self,
        channel: &Channel,
        queue: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        // ---
        let options = QueueDeclareOptions {
            durable: true,
            exclusive: self.auto_delete_queues,
            auto_delete: self.auto_delete_queues,
            ..QueueDeclareOptions::default()
        };

        channel
            .queue_declare(queue, options, arguments)
            .await
            .map(|_| ())
            .map_err(Error::Declaration)
    }

    async fn bind_queue(&self, channel: &Channel, queue: &str, routing_key: &str) -> Result<()> {
        // ---
        channel
            .queue_bind(
                queue,
                &self.exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(Error::Declaration)
    }

    async fn declare_topology(&self, channel: &Channel) -> Result<()> {
        // ---
        // The exchange may be missing after a broker restart; declaring it
        // again costs nothing.
        self.declare_exchange(channel).await?;

        self.declare_queue(
            channel,
            self.topology.primary(),
            self.primary_queue_arguments.clone(),
        )
        .await?;
        self.declare_queue(channel, self.topology.delay(), FieldTable::default())
            .await?;
        self.declare_queue(channel, self.topology.error(), FieldTable::default())
            .await?;

        // Each queue is addressable under its own name.
        for queue in self.topology.all() {
            self.bind_queue(channel, queue, queue).await?;
        }

        log_info!("declared queues {:?}", self.topology.all());
        Ok(())
    }

    async fn publish(
        &self,
        worker: &WorkerHandle,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<()> {
        // ---
        let mut channel = self.channels.channel_for(worker).await?;

        // A worker's channel can die between sends. Replace it once; a
        // failure after that surfaces to the caller.
        if !channel.status().connected() {
            log_debug!("send channel of {} is closed, replacing", worker.id());
            channel = self.channels.replace(worker).await?;
        }

        let mut publish = PublishProperties::default();
        if let Some(hook) = &self.on_send {
            hook(&mut publish, &envelope.headers);
        }

        let (properties, body) = codec::encode(
            envelope,
            self.topology.primary(),
            &self.content_type,
            &self.encoding_name,
            &publish,
        );

        channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .map(|_| ())
            .map_err(Error::Connectivity)?;

        log_trace!("sent {} to {routing_key}", envelope.id);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        cumulative_ack: bool,
        prefetch: u16,
        signal: CancellationToken,
        sink: DeliverySink,
    ) -> Result<()> {
        // ---
        let channel = self.connection.acquire_channel().await?;

        let outcome = self
            .consume_on(&channel, queue, cumulative_ack, prefetch, &signal, &sink)
            .await;

        // The loop owns its channel. Closing it on every exit path is what
        // returns still-unacknowledged deliveries to the queue.
        let closed = super::close_channel(&channel).await;

        match (outcome, closed) {
            (Ok(()), Err(error)) => Err(error),
            (outcome, _) => outcome,
        }
    }

    async fn consume_on(
        &self,
        channel: &Channel,
        queue: &str,
        cumulative_ack: bool,
        prefetch: u16,
        signal: &CancellationToken,
        sink: &DeliverySink,
    ) -> Result<()> {
        // ---
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(Error::Connectivity)?;

        let mut deliveries = channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(Error::Connectivity)?;

        log_info!("consuming {queue} (prefetch {prefetch})");

        loop {
            let next = tokio::select! {
                _ = signal.cancelled() => return Err(Error::Cancelled),
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(error)) => return Err(Error::Connectivity(error)),
                None => return Err(Error::ConnectionLost),
            };

            let tag = delivery.delivery_tag;
            let envelope = codec::decode(&delivery.properties, &delivery.data)?;
            log_trace!("delivery {tag} on {queue}: {}", envelope.id);

            let (reply_tx, reply_rx) = oneshot::channel();
            let handoff = Delivery::new(envelope, reply_tx);

            tokio::select! {
                _ = signal.cancelled() => return Err(Error::Cancelled),
                sent = sink.send(handoff) => {
                    if sent.is_err() {
                        log_debug!("delivery sink for {queue} dropped, stopping");
                        return Ok(());
                    }
                }
            }

            // The disposition is settled before the next pull, so a stopping
            // loop leaves at most one undecided delivery behind.
            match reply_rx.await {
                Ok(Disposition::Accept) => {
                    channel
                        .basic_ack(
                            tag,
                            BasicAckOptions {
                                multiple: cumulative_ack,
                            },
                        )
                        .await
                        .map_err(Error::Connectivity)?;
                    log_trace!("acked {tag} on {queue}");
                }
                Ok(Disposition::Reject) => {
                    channel
                        .basic_nack(
                            tag,
                            BasicNackOptions {
                                multiple: false,
                                requeue: true,
                            },
                        )
                        .await
                        .map_err(Error::Connectivity)?;
                    log_trace!("requeued {tag} on {queue}");
                }
                Err(_) => {
                    // Dropped without a verdict: the delivery stays unacked
                    // and requeues when this channel closes.
                    log_warn!("delivery {tag} on {queue} dropped without a disposition");
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for AmqpTransport {
    // ---
    fn topology(&self) -> &QueueTopology {
        &self.topology
    }

    async fn initialize_for_publishing(&self) -> Result<()> {
        // ---
        self.ensure_usable()?;

        let channel = self.connection.acquire_channel().await?;
        let outcome = self.declare_exchange(&channel).await;
        let closed = super::close_channel(&channel).await;

        outcome.and(closed)
    }

    async fn initialize_for_consuming(&self) -> Result<()> {
        // ---
        self.ensure_usable()?;

        let channel = self.connection.acquire_channel().await?;
        let outcome = self.declare_topology(&channel).await;
        let closed = super::close_channel(&channel).await;

        outcome.and(closed)
    }

    async fn register_subscription(&self, key: &str) -> Result<()> {
        // ---
        self.ensure_usable()?;

        let channel = self.connection.acquire_channel().await?;
        let outcome = self
            .bind_queue(&channel, self.topology.primary(), key)
            .await;
        let closed = super::close_channel(&channel).await;

        if outcome.is_ok() {
            log_debug!("subscribed {} to {key}", self.topology.primary());
        }
        outcome.and(closed)
    }

    async fn send(
        &self,
        worker: &WorkerHandle,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<()> {
        // ---
        self.ensure_usable()?;
        self.publish(worker, routing_key, envelope).await
    }

    async fn get_messages(&self, signal: CancellationToken, sink: DeliverySink) -> Result<()> {
        // ---
        self.ensure_usable()?;

        // Primary deliveries settle in delivery order, so one cumulative ack
        // covers everything up to it.
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
        self.ensure_usable()?;

        // Delay deliveries settle in due-time order, not delivery order; a
        // cumulative ack would double-settle earlier tags.
        let prefetch = self.delay_queue_prefetch_count;
        self.consume(self.topology.delay(), false, prefetch, signal, sink)
            .await
    }

    async fn release_worker(&self, worker: WorkerId) -> Result<()> {
        // ---
        self.channels.release(worker).await
    }

    async fn dispose(&self) -> Result<()> {
        // ---
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(sweeper) = lock_ignore_poison(&self.sweeper).take() {
            sweeper.abort();
        }

        log_info!("disposing AMQP transport for {}", self.topology.primary());
        self.channels.dispose_all().await
    }

    async fn shutdown(&self) -> Result<()> {
        // ---
        self.dispose().await?;
        self.connection.shutdown().await
    }
}

// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::ShortString;

    #[test]
    fn queue_arguments_convert_to_field_table() {
        let mut arguments = BTreeMap::new();
        arguments.insert("x-max-priority".to_string(), QueueArg::Int(10));
        arguments.insert("x-queue-mode".to_string(), QueueArg::Str("lazy".into()));
        arguments.insert("x-single-active-consumer".to_string(), QueueArg::Bool(true));

        let table = queue_arguments(&arguments);

        assert_eq!(
            table.inner().get(&ShortString::from("x-max-priority")),
            Some(&AMQPValue::LongInt(10))
        );
        assert_eq!(
            table.inner().get(&ShortString::from("x-queue-mode")),
            Some(&AMQPValue::LongString("lazy".into()))
        );
        assert_eq!(
            table.inner().get(&ShortString::from("x-single-active-consumer")),
            Some(&AMQPValue::Boolean(true))
        );
    }

    #[test]
    fn empty_arguments_make_an_empty_table() {
        let table = queue_arguments(&BTreeMap::new());

        assert!(table.inner().is_empty());
    }
}
