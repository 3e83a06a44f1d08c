use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use lapin::options::{
    BasicCancelOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions, QueuePurgeOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use rand::Rng;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ReconnectOptions;
use crate::error::{BusError, Result};

/// Lifecycle notifications fanned out to every subscribing component.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A reconnect attempt has been scheduled
    Reconnecting { attempt: u32, delay: Duration },
    /// The connection is re-established; consumers re-declare and resume
    Reconnected,
    /// The transport dropped; channels are invalid until `Reconnected`
    Disconnected,
    /// Terminal failure (reconnection budget exhausted)
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Connection snapshot for health reporting.
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub url: String,
    pub state: ConnectionState,
    pub connected: bool,
}

/// Owns the AMQP connection: detects loss, schedules reconnects with
/// exponential backoff and jitter, and exposes the channel operations the
/// rest of the runtime is built on.
///
/// Cheap to clone; clones share the underlying connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    url: String,
    opts: ReconnectOptions,
    connection: RwLock<Option<Connection>>,
    state: std::sync::Mutex<ConnectionState>,
    manually_closed: AtomicBool,
    /// Monotonic id per established connection; stale loss signals are ignored
    generation: AtomicU64,
    loss: mpsc::UnboundedSender<u64>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(url: impl Into<String>, opts: ReconnectOptions) -> Self {
        let (loss_tx, loss_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let inner = Arc::new(Inner {
            url: url.into(),
            opts,
            connection: RwLock::new(None),
            state: std::sync::Mutex::new(ConnectionState::Disconnected),
            manually_closed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            loss: loss_tx,
            events,
        });
        tokio::spawn(supervise(Arc::downgrade(&inner), loss_rx));
        Self { inner }
    }

    /// Subscribe to lifecycle events. Each component holds its own receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn is_connected(&self) -> bool {
        let connection = self.inner.connection.read().await;
        connection
            .as_ref()
            .map(|c| c.status().connected())
            .unwrap_or(false)
    }

    /// Snapshot for health reporting.
    pub async fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            url: self.inner.url.clone(),
            state: self.state(),
            connected: self.is_connected().await,
        }
    }

    /// Establish the connection, retrying with backoff until it succeeds or
    /// the retry budget runs out.
    pub async fn connect(&self) -> Result<()> {
        self.inner.manually_closed.store(false, Ordering::SeqCst);
        if self.is_connected().await {
            return Ok(());
        }
        let mut attempt = 0u32;
        loop {
            match self.inner.establish().await {
                Ok(()) => {
                    info!("connected to AMQP broker at {}", self.inner.url);
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    if self.inner.opts.max_retries > 0 && attempt >= self.inner.opts.max_retries {
                        self.inner.set_state(ConnectionState::Disconnected);
                        let _ = self.inner.events.send(ConnectionEvent::Error(format!(
                            "reconnection exhausted after {attempt} attempts: {e}"
                        )));
                        return Err(BusError::ReconnectionExhausted { attempts: attempt });
                    }
                    let delay = backoff_delay(&self.inner.opts, attempt);
                    warn!(
                        "connection attempt {} failed, retrying in {}ms: {}",
                        attempt,
                        delay.as_millis(),
                        e
                    );
                    let _ = self
                        .inner
                        .events
                        .send(ConnectionEvent::Reconnecting { attempt, delay });
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Close the connection and suppress all reconnect scheduling. Transport
    /// close events observed afterwards are expected.
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.manually_closed.store(true, Ordering::SeqCst);
        let connection = self.inner.connection.write().await.take();
        if let Some(connection) = connection {
            if let Err(e) = connection.close(200, "client shutdown").await {
                debug!("close raced with teardown: {e}");
            }
        }
        self.inner.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    pub async fn open_channel(&self) -> Result<Channel> {
        let connection = self.inner.connection.read().await;
        let connection = connection
            .as_ref()
            .filter(|c| c.status().connected())
            .ok_or(BusError::NotConnected)?;
        Ok(connection.create_channel().await?)
    }

    pub async fn close_channel(&self, channel: Channel) {
        if let Err(e) = channel.close(200, "consumer closed").await {
            debug!("channel close raced with teardown: {e}");
        }
    }

    pub async fn set_prefetch(&self, channel: &Channel, count: u16) -> Result<()> {
        channel
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    pub async fn declare_exchange(
        &self,
        channel: &Channel,
        name: &str,
        kind: ExchangeKind,
    ) -> Result<()> {
        channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        debug!("declared exchange {name}");
        Ok(())
    }

    /// Declare a queue and return its effective (possibly server-assigned)
    /// name.
    pub async fn declare_queue(
        &self,
        channel: &Channel,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<String> {
        let queue = channel.queue_declare(name, options, arguments).await?;
        let actual = queue.name().as_str().to_string();
        debug!("declared queue {actual}");
        Ok(actual)
    }

    pub async fn bind_queue(
        &self,
        channel: &Channel,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<()> {
        channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        debug!("bound {queue} to {exchange} under {routing_key}");
        Ok(())
    }

    pub async fn unbind_queue(
        &self,
        channel: &Channel,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<()> {
        channel
            .queue_unbind(
                queue,
                exchange,
                routing_key,
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    /// Acknowledge a delivery.
    pub async fn ack(&self, delivery: &lapin::message::Delivery) -> Result<()> {
        delivery
            .acker
            .ack(lapin::options::BasicAckOptions::default())
            .await?;
        Ok(())
    }

    /// Reject a delivery, optionally requeueing it.
    pub async fn reject(&self, delivery: &lapin::message::Delivery, requeue: bool) -> Result<()> {
        delivery
            .acker
            .reject(lapin::options::BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }

    pub async fn cancel(&self, channel: &Channel, consumer_tag: &str) -> Result<()> {
        channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    pub async fn purge(&self, channel: &Channel, queue: &str) -> Result<()> {
        channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await?;
        Ok(())
    }

    /// Hand the message to the transport immediately; broker confirmation is
    /// not awaited.
    pub async fn publish(
        &self,
        channel: &Channel,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: lapin::BasicProperties,
    ) -> Result<()> {
        channel
            .basic_publish(
                exchange,
                routing_key,
                lapin::options::BasicPublishOptions::default(),
                body,
                properties,
            )
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.inner.url)
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// One connection attempt: dial, install the loss callback, store.
    async fn establish(&self) -> Result<()> {
        self.set_state(ConnectionState::Connecting);
        let connection = Connection::connect(
            &self.url,
            ConnectionProperties::default()
                .with_connection_name(format!("protobus-{}", Uuid::new_v4()).into()),
        )
        .await?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let loss = self.loss.clone();
        connection.on_error(move |err| {
            warn!("AMQP transport error: {err}");
            let _ = loss.send(generation);
        });

        *self.connection.write().await = Some(connection);
        self.set_state(ConnectionState::Connected);
        Ok(())
    }
}

/// Background task reacting to transport loss. Holds only a weak reference,
/// so a dropped manager (and its pending backoff timers) cannot keep the
/// process alive.
async fn supervise(inner: Weak<Inner>, mut loss: mpsc::UnboundedReceiver<u64>) {
    while let Some(generation) = loss.recv().await {
        let Some(strong) = inner.upgrade() else { return };
        if generation != strong.generation.load(Ordering::SeqCst) {
            continue;
        }
        if strong.manually_closed.load(Ordering::SeqCst) {
            continue;
        }

        strong.set_state(ConnectionState::Reconnecting);
        *strong.connection.write().await = None;
        let _ = strong.events.send(ConnectionEvent::Disconnected);
        info!("connection lost, scheduling reconnect");
        drop(strong);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let Some(strong) = inner.upgrade() else { return };
            if strong.manually_closed.load(Ordering::SeqCst) {
                break;
            }
            let delay = backoff_delay(&strong.opts, attempt);
            let _ = strong
                .events
                .send(ConnectionEvent::Reconnecting { attempt, delay });
            info!("reconnect attempt {} in {}ms", attempt, delay.as_millis());
            drop(strong);
            tokio::time::sleep(delay).await;

            let Some(strong) = inner.upgrade() else { return };
            if strong.manually_closed.load(Ordering::SeqCst) {
                break;
            }
            match strong.establish().await {
                Ok(()) => {
                    info!("reconnected to AMQP broker");
                    let _ = strong.events.send(ConnectionEvent::Reconnected);
                    break;
                }
                Err(e) => {
                    warn!("reconnect attempt {attempt} failed: {e}");
                    if strong.opts.max_retries > 0 && attempt >= strong.opts.max_retries {
                        strong.set_state(ConnectionState::Disconnected);
                        let _ = strong.events.send(ConnectionEvent::Error(format!(
                            "reconnection exhausted after {attempt} attempts: {e}"
                        )));
                        break;
                    }
                }
            }
        }
    }
}

/// `min(max_delay, initial * multiplier^(n-1))` plus uniform jitter in
/// `[0, 0.3 * delay)`.
fn backoff_delay(opts: &ReconnectOptions, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let base = opts.initial_delay.as_millis() as f64
        * opts.backoff_multiplier.powi(exponent as i32);
    let capped = base.min(opts.max_delay.as_millis() as f64);
    let jitter = rand::thread_rng().gen_range(0.0..0.3) * capped;
    Duration::from_millis((capped + jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> ReconnectOptions {
        ReconnectOptions {
            max_retries: 10,
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let opts = opts();
        for (attempt, base) in [(1u32, 1_000u64), (2, 2_000), (3, 4_000), (6, 30_000)] {
            for _ in 0..32 {
                let delay = backoff_delay(&opts, attempt).as_millis() as u64;
                assert!(delay >= base, "attempt {attempt}: {delay} < {base}");
                assert!(delay < base + (base * 3) / 10 + 1, "attempt {attempt}: {delay}");
            }
        }
    }

    #[test]
    fn backoff_survives_large_attempts() {
        let delay = backoff_delay(&opts(), u32::MAX);
        assert!(delay.as_millis() as u64 <= 30_000 + 9_000);
    }

    #[tokio::test]
    async fn starts_disconnected() {
        let manager = ConnectionManager::new("amqp://localhost:5672", opts());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.is_connected().await);
        assert!(matches!(
            manager.open_channel().await,
            Err(BusError::NotConnected)
        ));
    }
}
