use std::sync::Arc;
use std::time::Duration;

use lapin::ExchangeKind;
use tracing::{debug, warn};

use crate::connection::ConnectionManager;
use crate::consume::MessageHandler;
use crate::consumer::{BaseConsumer, ConsumerConfig};
use crate::error::Result;
use crate::pending::PendingCalls;

/// Anonymous auto-delete queue on the callbacks exchange. Every received
/// message is matched against the dispatcher's pending table by correlation
/// id; replies that miss (timeout, cancellation) are dropped.
#[derive(Clone)]
pub struct ReplyConsumer {
    base: BaseConsumer,
    pending: Arc<PendingCalls>,
}

impl ReplyConsumer {
    pub fn new(
        connection: ConnectionManager,
        callbacks_exchange: String,
        message_timeout: Duration,
        pending: Arc<PendingCalls>,
    ) -> Self {
        let config = ConsumerConfig {
            exchange: callbacks_exchange.clone(),
            exchange_kind: ExchangeKind::Direct,
            queue: String::new(),
            late_ack: false,
            max_concurrent: None,
            message_ttl_ms: None,
            retry: None,
            callbacks_exchange,
            message_timeout,
        };
        Self {
            base: BaseConsumer::new(connection, config),
            pending,
        }
    }

    /// Declare the anonymous queue (bound to itself on the direct exchange)
    /// and begin resolving replies. The base consumer re-establishes the
    /// queue, with a fresh server-assigned name, after reconnects.
    pub async fn init(&self) -> Result<()> {
        let pending = self.pending.clone();
        let handler: MessageHandler = Arc::new(move |incoming| {
            let pending = pending.clone();
            Box::pin(async move {
                match incoming.correlation_id.as_deref() {
                    Some(correlation_id) => {
                        if !pending.complete(correlation_id, incoming.body) {
                            debug!("reply for unknown correlation id {correlation_id} dropped");
                        }
                    }
                    None => warn!("reply without correlation id dropped"),
                }
                Ok(None)
            })
        });
        self.base.init(handler).await?;
        self.base.start().await
    }

    /// Current reply queue name; RPC requests carry it as their `reply_to`.
    pub async fn queue_name(&self) -> String {
        self.base.queue_name().await
    }

    pub async fn close(&self) {
        self.base.close().await
    }
}
