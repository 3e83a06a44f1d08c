use lapin::ExchangeKind;
use tokio::sync::broadcast;
use tracing::info;

use crate::connection::ConnectionManager;
use crate::consume::MessageHandler;
use crate::consumer::{BaseConsumer, ConsumerConfig, ConsumerEvent};
use crate::error::{BusError, Result};

/// Consumer for a service's request queue on the main topic exchange.
/// Tracks routing-key patterns for reconnection and, when retry is enabled,
/// wires up the retry and dead-letter queues.
#[derive(Clone)]
pub struct RpcConsumer {
    base: BaseConsumer,
}

impl RpcConsumer {
    pub fn new(connection: ConnectionManager, config: ConsumerConfig) -> Result<Self> {
        if config.exchange_kind != ExchangeKind::Topic {
            return Err(BusError::config_error(
                "RPC consumers bind to a topic exchange",
            ));
        }
        if config.retry.is_some() && !config.late_ack {
            return Err(BusError::config_error(
                "retry requires late acknowledgement",
            ));
        }
        Ok(Self {
            base: BaseConsumer::new(connection, config),
        })
    }

    /// Declare exchange and queue, install the handler, and bind every
    /// pattern. With retry enabled the helper queues are declared last, once
    /// the effective queue name is known.
    pub async fn init(&self, handler: MessageHandler, patterns: &[String]) -> Result<()> {
        self.base.init(handler).await?;
        self.subscribe(patterns).await?;
        self.base.ensure_retry_queues().await?;
        info!(
            "service queue {} listening on {} patterns",
            self.base.queue_name().await,
            patterns.len()
        );
        Ok(())
    }

    /// Bind additional routing-key patterns; all of them are tracked and
    /// re-applied after a reconnect.
    pub async fn subscribe(&self, patterns: &[String]) -> Result<()> {
        for pattern in patterns {
            self.base.bind(pattern).await?;
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

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.base.subscribe_events()
    }
}
