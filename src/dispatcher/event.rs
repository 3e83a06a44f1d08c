use std::sync::{Arc, Weak};

use lapin::{BasicProperties, Channel};
use serde_json::Value as Json;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error};
use uuid::Uuid;

use crate::codec::Codec;
use crate::config::BusConfig;
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::consume::{OCTET_STREAM, PERSISTENT};
use crate::error::{BusError, Result};

/// Publishes events on the events topic exchange.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<EventDispatcherInner>,
}

struct EventDispatcherInner {
    connection: ConnectionManager,
    codec: Arc<Codec>,
    config: BusConfig,
    channel: Mutex<Option<Channel>>,
}

impl EventDispatcher {
    pub fn new(connection: ConnectionManager, codec: Arc<Codec>, config: BusConfig) -> Self {
        let receiver = connection.subscribe();
        let inner = Arc::new(EventDispatcherInner {
            connection,
            codec,
            config,
            channel: Mutex::new(None),
        });
        tokio::spawn(watch(Arc::downgrade(&inner), receiver));
        Self { inner }
    }

    pub async fn init(&self) -> Result<()> {
        let channel = self.inner.connection.open_channel().await?;
        self.inner
            .connection
            .declare_exchange(
                &channel,
                &self.inner.config.events_exchange,
                lapin::ExchangeKind::Topic,
            )
            .await?;
        *self.inner.channel.lock().await = Some(channel);
        Ok(())
    }

    /// Encode and publish one event. With no topic given, events travel
    /// under `EVENT.<type>`. Encoding failures surface as invalid-message
    /// errors; nothing is retried here.
    pub async fn publish(
        &self,
        type_name: &str,
        payload: &Json,
        topic: Option<&str>,
    ) -> Result<()> {
        let topic = topic
            .map(str::to_string)
            .unwrap_or_else(|| format!("EVENT.{type_name}"));
        let body = self.inner.codec.encode_event(type_name, payload, &topic)?;

        let properties = BasicProperties::default()
            .with_content_type(OCTET_STREAM.into())
            .with_delivery_mode(PERSISTENT)
            .with_correlation_id(Uuid::new_v4().to_string().into());

        let channel = self.inner.channel.lock().await;
        let channel = channel.as_ref().ok_or(BusError::NotConnected)?;
        self.inner
            .connection
            .publish(
                channel,
                &self.inner.config.events_exchange,
                &topic,
                &body,
                properties,
            )
            .await?;
        debug!("event {} published under {}", type_name, topic);
        Ok(())
    }

    pub async fn close(&self) {
        if let Some(channel) = self.inner.channel.lock().await.take() {
            self.inner.connection.close_channel(channel).await;
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("exchange", &self.inner.config.events_exchange)
            .finish()
    }
}

async fn watch(
    inner: Weak<EventDispatcherInner>,
    mut events: broadcast::Receiver<ConnectionEvent>,
) {
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
            }
            ConnectionEvent::Reconnected => match strong.connection.open_channel().await {
                Ok(channel) => *strong.channel.lock().await = Some(channel),
                Err(e) => error!("event dispatcher channel re-open failed: {e}"),
            },
            ConnectionEvent::Reconnecting { .. } | ConnectionEvent::Error(_) => {}
        }
    }
}
