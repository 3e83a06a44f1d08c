use std::sync::{Arc, Weak};
use std::time::Duration;

use lapin::{BasicProperties, Channel};
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::BusConfig;
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::consume::{OCTET_STREAM, PERSISTENT};
use crate::consumer::ReplyConsumer;
use crate::error::{BusError, Result};
use crate::pending::PendingCalls;

/// Issues RPC calls: publishes requests on the main exchange, parks the
/// caller on a pending handle keyed by correlation id, and completes it on
/// reply, timeout, or disconnect — whichever comes first.
#[derive(Clone)]
pub struct RpcDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    connection: ConnectionManager,
    config: BusConfig,
    channel: Mutex<Option<Channel>>,
    pending: Arc<PendingCalls>,
    reply: ReplyConsumer,
}

impl RpcDispatcher {
    pub fn new(connection: ConnectionManager, config: BusConfig) -> Self {
        let pending = Arc::new(PendingCalls::new());
        let reply = ReplyConsumer::new(
            connection.clone(),
            config.callbacks_exchange.clone(),
            config.message_timeout,
            pending.clone(),
        );
        let receiver = connection.subscribe();
        let inner = Arc::new(DispatcherInner {
            connection,
            config,
            channel: Mutex::new(None),
            pending,
            reply,
        });
        tokio::spawn(watch(Arc::downgrade(&inner), receiver));
        Self { inner }
    }

    /// Open the publisher channel and start the reply consumer.
    pub async fn init(&self) -> Result<()> {
        *self.inner.channel.lock().await = Some(self.inner.connection.open_channel().await?);
        self.inner.reply.init().await
    }

    /// Name of the reply queue requests carry as their `reply_to`.
    pub async fn reply_queue(&self) -> String {
        self.inner.reply.queue_name().await
    }

    /// Publish a request and await the correlated reply, bounded by the
    /// process-wide message timeout.
    pub async fn call(&self, body: &[u8], routing_key: &str) -> Result<Vec<u8>> {
        self.call_with_timeout(body, routing_key, self.inner.config.message_timeout)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        body: &[u8],
        routing_key: &str,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let correlation_id = Uuid::new_v4().to_string();
        let reply_to = self.inner.reply.queue_name().await;
        if reply_to.is_empty() {
            return Err(BusError::internal_error("dispatcher used before init"));
        }

        let (tx, rx) = oneshot::channel();
        // the broker may deliver the reply before publish returns control,
        // so the handle must already be in the table
        self.inner.pending.insert(correlation_id.clone(), tx);

        let properties = BasicProperties::default()
            .with_content_type(OCTET_STREAM.into())
            .with_delivery_mode(PERSISTENT)
            .with_correlation_id(correlation_id.as_str().into())
            .with_reply_to(reply_to.into());

        if let Err(e) = self.publish(routing_key, body, properties).await {
            self.inner.pending.cancel(&correlation_id);
            return Err(e);
        }
        debug!("rpc {} sent under {}", correlation_id, routing_key);

        let timeout_ms = timeout.as_millis() as u64;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                // handle dropped without completion; table was torn down
                self.inner.pending.cancel(&correlation_id);
                Err(BusError::Disconnected)
            }
            Err(_) => {
                self.inner.pending.cancel(&correlation_id);
                warn!("rpc {} timed out after {}ms", correlation_id, timeout_ms);
                Err(BusError::Timeout { timeout_ms })
            }
        }
    }

    /// Fire-and-forget publish on the main exchange; no reply is expected
    /// and no pending entry is created.
    pub async fn cast(&self, body: &[u8], routing_key: &str) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type(OCTET_STREAM.into())
            .with_delivery_mode(PERSISTENT)
            .with_correlation_id(Uuid::new_v4().to_string().into());
        self.publish(routing_key, body, properties).await
    }

    async fn publish(
        &self,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<()> {
        let channel = self.inner.channel.lock().await;
        let channel = channel.as_ref().ok_or(BusError::NotConnected)?;
        self.inner
            .connection
            .publish(
                channel,
                &self.inner.config.exchange,
                routing_key,
                body,
                properties,
            )
            .await
    }

    /// Number of calls currently awaiting replies.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    pub async fn close(&self) {
        self.inner.reply.close().await;
        if let Some(channel) = self.inner.channel.lock().await.take() {
            self.inner.connection.close_channel(channel).await;
        }
        self.inner
            .pending
            .fail_all(|| BusError::Disconnected);
    }
}

impl std::fmt::Debug for RpcDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcDispatcher")
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

/// Fails pending calls eagerly on disconnect and re-opens the publisher
/// channel on reconnect. The reply consumer restores itself through the
/// base consumer path.
async fn watch(inner: Weak<DispatcherInner>, mut events: broadcast::Receiver<ConnectionEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(strong) = inner.upgrade() else { return };
        match event {
            ConnectionEvent::Disconnected => {
                *strong.channel.lock().await = None;
                strong.pending.fail_all(|| BusError::Disconnected);
            }
            ConnectionEvent::Reconnected => match strong.connection.open_channel().await {
                Ok(channel) => *strong.channel.lock().await = Some(channel),
                Err(e) => error!("dispatcher channel re-open failed: {e}"),
            },
            ConnectionEvent::Reconnecting { .. } | ConnectionEvent::Error(_) => {}
        }
    }
}
