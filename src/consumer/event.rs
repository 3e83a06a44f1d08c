use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use lapin::ExchangeKind;
use serde_json::Value as Json;
use tracing::debug;

use crate::codec::Codec;
use crate::config::RetryOptions;
use crate::connection::ConnectionManager;
use crate::consume::{HandlerFailure, MessageHandler};
use crate::consumer::{BaseConsumer, ConsumerConfig};
use crate::error::Result;
use crate::router::TopicRouter;

/// Where an event came from, as seen by a subscriber.
#[derive(Debug, Clone)]
pub struct EventContext {
    pub type_name: String,
    pub topic: String,
}

type EventHandlerFn =
    Arc<dyn Fn(Json, EventContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// A subscriber callback with a stable identity, so the router can
/// de-duplicate a handler registered under several matching patterns.
#[derive(Clone)]
pub struct EventHandler {
    id: u64,
    callback: EventHandlerFn,
}

impl EventHandler {
    pub fn new<F, Fut>(callback: F) -> Self
    where
        F: Fn(Json, EventContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            id: NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed),
            callback: Arc::new(move |payload, ctx| Box::pin(callback(payload, ctx))),
        }
    }

    pub async fn invoke(&self, payload: Json, ctx: EventContext) -> Result<()> {
        (self.callback)(payload, ctx).await
    }
}

impl PartialEq for EventHandler {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl std::fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandler").field("id", &self.id).finish()
    }
}

/// Consumer on the events topic exchange. Deliveries are decoded and fanned
/// out through the topic router; each matched handler runs at most once per
/// delivery.
#[derive(Clone)]
pub struct EventConsumer {
    base: BaseConsumer,
    codec: Arc<Codec>,
    router: Arc<RwLock<TopicRouter<EventHandler>>>,
}

impl EventConsumer {
    /// An anonymous, per-instance queue on the events exchange. `queue` may
    /// name a durable queue instead when events must survive restarts;
    /// retry (which needs a named queue) switches the consumer to late-ack
    /// mode, so failed handlers drive the retry / dead-letter machinery.
    pub fn new(
        connection: ConnectionManager,
        codec: Arc<Codec>,
        events_exchange: String,
        callbacks_exchange: String,
        queue: String,
        retry: Option<RetryOptions>,
        message_timeout: Duration,
    ) -> Self {
        let config = ConsumerConfig {
            exchange: events_exchange,
            exchange_kind: ExchangeKind::Topic,
            queue,
            late_ack: retry.is_some(),
            max_concurrent: None,
            message_ttl_ms: None,
            retry,
            callbacks_exchange,
            message_timeout,
        };
        Self {
            base: BaseConsumer::new(connection, config),
            codec,
            router: Arc::new(RwLock::new(TopicRouter::new())),
        }
    }

    pub async fn init(&self) -> Result<()> {
        let codec = self.codec.clone();
        let router = self.router.clone();
        let handler: MessageHandler = Arc::new(move |incoming| {
            let codec = codec.clone();
            let router = router.clone();
            Box::pin(async move {
                let event = codec
                    .decode_event(&incoming.body)
                    .map_err(HandlerFailure::new)?;
                let topic = if event.topic.is_empty() {
                    incoming.routing_key.clone()
                } else {
                    event.topic.clone()
                };
                let matched = router
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .matches(&topic);
                debug!("event {} on {} matched {} handlers", event.type_name, topic, matched.len());
                let ctx = EventContext {
                    type_name: event.type_name.clone(),
                    topic,
                };
                let mut first_error = None;
                for handler in matched {
                    if let Err(e) = handler.invoke(event.payload.clone(), ctx.clone()).await {
                        first_error.get_or_insert(e);
                    }
                }
                match first_error {
                    Some(e) => Err(HandlerFailure::new(e)),
                    None => Ok(None),
                }
            })
        });
        self.base.init(handler).await?;
        self.base.ensure_retry_queues().await
    }

    /// Register a handler under a topic pattern: the queue is bound on the
    /// broker and the handler recorded in the in-process router.
    pub async fn subscribe(&self, pattern: &str, handler: EventHandler) -> Result<()> {
        self.router
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pattern, handler);
        self.base.bind(pattern).await
    }

    /// Drop one handler registration; the broker binding is released once no
    /// handler under that pattern remains.
    pub async fn unsubscribe(&self, pattern: &str, handler: &EventHandler) -> Result<()> {
        let now_empty = {
            let mut router = self.router.write().unwrap_or_else(|e| e.into_inner());
            router.remove(pattern, handler);
            !router.has_pattern(pattern)
        };
        if now_empty {
            self.base.unbind(pattern).await?;
        }
        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        self.base.start().await
    }

    pub async fn close(&self) {
        self.base.close().await
    }

    pub async fn queue_name(&self) -> String {
        self.base.queue_name().await
    }
}
