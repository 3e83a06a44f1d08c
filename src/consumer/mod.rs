//! Consumers: queue declaration, binding tracking, and resumption after
//! reconnects. `BaseConsumer` carries the shared lifecycle; the RPC, event,
//! and reply consumers compose it.

mod event;
mod reply;
mod rpc;

pub use self::event::{EventConsumer, EventContext, EventHandler};
pub use self::reply::ReplyConsumer;
pub use self::rpc::RpcConsumer;

use std::sync::{Arc, Weak};
use std::time::Duration;

use lapin::options::QueueDeclareOptions;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{Channel, ExchangeKind};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::RetryOptions;
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::consume::{ConsumePolicy, MessageHandler, RetryRoute};
use crate::error::{BusError, Result};

/// Suffixes of the helper queues a retrying consumer declares.
pub const RETRY_QUEUE_SUFFIX: &str = ".Retry";
pub const DLQ_SUFFIX: &str = ".DLQ";

/// Events a consumer emits about its own lifecycle.
#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    /// Queue re-declared, bindings re-applied, consumption resumed
    Reconnected,
    /// Restoring the consumer after a reconnect failed
    Error(String),
}

/// Static configuration of one consumer.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Exchange to declare and bind against; must be non-empty
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    /// Configured queue name; empty string requests a server-named
    /// (anonymous, exclusive, auto-delete) queue
    pub queue: String,
    /// Delay acknowledgement until the handler returns
    pub late_ack: bool,
    /// Prefetch bound applied in late-ack mode
    pub max_concurrent: Option<u16>,
    /// Optional per-queue message TTL
    pub message_ttl_ms: Option<u64>,
    /// Retry policy; requires a named queue and late-ack mode
    pub retry: Option<RetryOptions>,
    /// Exchange replies are published to
    pub callbacks_exchange: String,
    /// Bound on each handler invocation
    pub message_timeout: Duration,
}

#[derive(Default)]
struct ConsumerState {
    channel: Option<Channel>,
    /// Effective queue name, server-assigned for anonymous queues
    queue_name: String,
    consumer_tag: Option<String>,
    /// Routing keys to re-apply after a reconnect
    bindings: Vec<String>,
    started: bool,
    closed: bool,
    handler: Option<MessageHandler>,
    retry_route: Option<RetryRoute>,
}

struct ConsumerInner {
    connection: ConnectionManager,
    config: ConsumerConfig,
    state: Mutex<ConsumerState>,
    events: broadcast::Sender<ConsumerEvent>,
}

/// Shared consumer lifecycle. Cheap to clone.
#[derive(Clone)]
pub struct BaseConsumer {
    inner: Arc<ConsumerInner>,
}

impl BaseConsumer {
    pub fn new(connection: ConnectionManager, config: ConsumerConfig) -> Self {
        let receiver = connection.subscribe();
        let (events, _) = broadcast::channel(8);
        let inner = Arc::new(ConsumerInner {
            connection,
            config,
            state: Mutex::new(ConsumerState::default()),
            events,
        });
        tokio::spawn(watch(Arc::downgrade(&inner), receiver));
        Self { inner }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.inner.events.subscribe()
    }

    /// Declare the exchange and queue and install the handler. Bindings and
    /// consumption are applied separately.
    pub async fn init(&self, handler: MessageHandler) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        state.handler = Some(handler);
        state.closed = false;
        self.inner.initialize(&mut state).await
    }

    /// Bind the queue under `routing_key` and remember it for reconnects.
    pub async fn bind(&self, routing_key: &str) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let channel = state.channel.as_ref().ok_or(BusError::NotConnected)?;
        self.inner
            .connection
            .bind_queue(
                channel,
                &state.queue_name,
                &self.inner.config.exchange,
                routing_key,
            )
            .await?;
        if !state.bindings.iter().any(|b| b == routing_key) {
            state.bindings.push(routing_key.to_string());
        }
        Ok(())
    }

    /// Remove a binding and stop tracking it.
    pub async fn unbind(&self, routing_key: &str) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let channel = state.channel.as_ref().ok_or(BusError::NotConnected)?;
        self.inner
            .connection
            .unbind_queue(
                channel,
                &state.queue_name,
                &self.inner.config.exchange,
                routing_key,
            )
            .await?;
        state.bindings.retain(|b| b != routing_key);
        Ok(())
    }

    /// Declare the retry and dead-letter queues next to a named queue and
    /// route expired retries back through the main exchange.
    pub(crate) async fn ensure_retry_queues(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        self.inner.ensure_retry_queues(&mut state).await
    }

    /// Begin consuming under a fresh consumer tag.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        self.inner.start(&mut state).await
    }

    /// Cancel the consumer, release the channel, and drop retained state.
    pub async fn close(&self) {
        let mut state = self.inner.state.lock().await;
        state.closed = true;
        state.started = false;
        state.handler = None;
        state.bindings.clear();
        state.retry_route = None;
        let tag = state.consumer_tag.take();
        if let Some(channel) = state.channel.take() {
            if let Some(tag) = tag {
                if let Err(e) = self.inner.connection.cancel(&channel, &tag).await {
                    debug!("consumer cancel raced with teardown: {e}");
                }
            }
            self.inner.connection.close_channel(channel).await;
        }
    }

    /// Effective queue name, server-assigned for anonymous queues. Empty
    /// until `init` has run.
    pub async fn queue_name(&self) -> String {
        self.inner.state.lock().await.queue_name.clone()
    }

    pub async fn bindings(&self) -> Vec<String> {
        self.inner.state.lock().await.bindings.clone()
    }
}

impl ConsumerInner {
    /// Open a channel, declare exchange and queue, record the effective
    /// queue name. Requires the connection to be up.
    async fn initialize(&self, state: &mut ConsumerState) -> Result<()> {
        if self.config.exchange.is_empty() {
            return Err(BusError::config_error("consumer exchange is not configured"));
        }
        if !self.connection.is_connected().await {
            return Err(BusError::NotConnected);
        }

        let channel = self.connection.open_channel().await?;
        if self.config.late_ack {
            if let Some(prefetch) = self.config.max_concurrent {
                self.connection.set_prefetch(&channel, prefetch).await?;
            }
        }
        self.connection
            .declare_exchange(&channel, &self.config.exchange, self.config.exchange_kind.clone())
            .await?;

        let anonymous = self.config.queue.is_empty();
        let options = if anonymous {
            QueueDeclareOptions {
                durable: false,
                exclusive: true,
                auto_delete: true,
                ..Default::default()
            }
        } else {
            QueueDeclareOptions {
                durable: true,
                exclusive: false,
                auto_delete: false,
                ..Default::default()
            }
        };
        let mut arguments = FieldTable::default();
        if let Some(ttl) = self.config.message_ttl_ms {
            arguments.insert(
                ShortString::from("x-message-ttl"),
                AMQPValue::LongLongInt(ttl as i64),
            );
        }
        let queue_name = self
            .connection
            .declare_queue(&channel, &self.config.queue, options, arguments)
            .await?;

        // a direct exchange routes replies by queue name
        if self.config.exchange_kind == ExchangeKind::Direct {
            self.connection
                .bind_queue(&channel, &queue_name, &self.config.exchange, &queue_name)
                .await?;
        }

        state.channel = Some(channel);
        state.queue_name = queue_name;
        state.consumer_tag = None;
        Ok(())
    }

    async fn ensure_retry_queues(&self, state: &mut ConsumerState) -> Result<()> {
        let Some(retry) = self.config.retry.as_ref() else {
            return Ok(());
        };
        if self.config.queue.is_empty() {
            return Err(BusError::config_error(
                "retry requires a named queue",
            ));
        }
        let channel = state.channel.as_ref().ok_or(BusError::NotConnected)?;
        let retry_queue = format!("{}{}", state.queue_name, RETRY_QUEUE_SUFFIX);
        let dead_letter_queue = format!("{}{}", state.queue_name, DLQ_SUFFIX);

        let mut retry_args = FieldTable::default();
        retry_args.insert(
            ShortString::from("x-message-ttl"),
            AMQPValue::LongLongInt(retry.retry_delay_ms as i64),
        );
        retry_args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(self.config.exchange.as_str().into()),
        );
        let durable = QueueDeclareOptions {
            durable: true,
            ..Default::default()
        };
        self.connection
            .declare_queue(channel, &retry_queue, durable, retry_args)
            .await?;
        self.connection
            .declare_queue(
                channel,
                &dead_letter_queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        state.retry_route = Some(RetryRoute {
            max_retries: retry.max_retries,
            retry_queue: retry_queue.clone(),
            dead_letter_queue,
        });

        // expired retries dead-letter into the main exchange under the
        // retry queue's own name; this binding brings them home
        self.connection
            .bind_queue(
                state.channel.as_ref().ok_or(BusError::NotConnected)?,
                &state.queue_name,
                &self.config.exchange,
                &retry_queue,
            )
            .await?;
        if !state.bindings.iter().any(|b| b == &retry_queue) {
            state.bindings.push(retry_queue);
        }
        Ok(())
    }

    async fn start(&self, state: &mut ConsumerState) -> Result<()> {
        let channel = state.channel.as_ref().ok_or(BusError::NotConnected)?;
        let handler = state
            .handler
            .clone()
            .ok_or_else(|| BusError::internal_error("consumer started before init"))?;
        let consumer_tag = format!("ctag-{}", Uuid::new_v4());
        let policy = ConsumePolicy {
            queue: state.queue_name.clone(),
            late_ack: self.config.late_ack,
            retry: state.retry_route.clone(),
            callbacks_exchange: self.config.callbacks_exchange.clone(),
            message_timeout: self.config.message_timeout,
        };
        self.connection
            .consume(channel, &consumer_tag, policy, handler)
            .await?;
        state.consumer_tag = Some(consumer_tag);
        state.started = true;
        debug!("consuming {}", state.queue_name);
        Ok(())
    }

    /// Re-declare, re-bind, and resume after a reconnect.
    async fn restore(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed || state.handler.is_none() {
            return Ok(());
        }
        self.initialize(&mut state).await?;
        if state.retry_route.is_some() {
            self.ensure_retry_queues(&mut state).await?;
        }
        let bindings = state.bindings.clone();
        for routing_key in &bindings {
            let channel = state.channel.as_ref().ok_or(BusError::NotConnected)?;
            self.connection
                .bind_queue(channel, &state.queue_name, &self.config.exchange, routing_key)
                .await?;
        }
        if state.started {
            self.start(&mut state).await?;
        }
        info!(
            "consumer on {} restored with {} bindings",
            state.queue_name,
            bindings.len()
        );
        Ok(())
    }
}

/// Reacts to connection lifecycle events. Holds a weak reference so a
/// dropped consumer releases its watcher.
async fn watch(inner: Weak<ConsumerInner>, mut events: broadcast::Receiver<ConnectionEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("consumer watcher lagged by {skipped} events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(strong) = inner.upgrade() else { return };
        match event {
            ConnectionEvent::Disconnected => {
                let mut state = strong.state.lock().await;
                state.channel = None;
                state.consumer_tag = None;
            }
            ConnectionEvent::Reconnected => match strong.restore().await {
                Ok(()) => {
                    let _ = strong.events.send(ConsumerEvent::Reconnected);
                }
                Err(e) => {
                    error!("consumer restore failed: {e}");
                    let _ = strong.events.send(ConsumerEvent::Error(e.to_string()));
                }
            },
            ConnectionEvent::Reconnecting { .. } | ConnectionEvent::Error(_) => {}
        }
    }
}
