//! Per-message pipeline installed by the connection manager for every
//! consumer: acknowledgement policy, handler timeout, reply publishing,
//! and the retry / dead-letter state machine.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicRejectOptions};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel};
use tracing::{debug, error, warn};

use crate::connection::ConnectionManager;
use crate::error::{BusError, Result};

pub const X_RETRY_COUNT: &str = "x-retry-count";
pub const X_ORIGINAL_ROUTING_KEY: &str = "x-original-routing-key";
pub const X_FIRST_FAILURE_TIME: &str = "x-first-failure-time";
pub const X_LAST_ERROR: &str = "x-last-error";
pub const X_ORIGINAL_QUEUE: &str = "x-original-queue";
pub const X_DLQ_TIME: &str = "x-dlq-time";

pub const OCTET_STREAM: &str = "application/octet-stream";
pub const PERSISTENT: u8 = 2;

/// What a consumer's handler sees for each delivery.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub body: Vec<u8>,
    pub routing_key: String,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub redelivered: bool,
    /// Redelivery attempts so far (0 on the first delivery)
    pub retry_count: u32,
}

/// A failed handler invocation. `reply` optionally carries a pre-encoded
/// error envelope published to the caller when the failure is terminal.
#[derive(Debug)]
pub struct HandlerFailure {
    pub error: BusError,
    pub reply: Option<Vec<u8>>,
}

impl HandlerFailure {
    pub fn new(error: BusError) -> Self {
        Self { error, reply: None }
    }

    pub fn with_reply(error: BusError, reply: Vec<u8>) -> Self {
        Self {
            error,
            reply: Some(reply),
        }
    }
}

/// `Ok(Some(bytes))` answers an RPC caller, `Ok(None)` completes silently.
pub type HandlerOutcome = std::result::Result<Option<Vec<u8>>, HandlerFailure>;

/// Handler invoked for every delivery a consumer receives.
pub type MessageHandler =
    Arc<dyn Fn(IncomingMessage) -> BoxFuture<'static, HandlerOutcome> + Send + Sync>;

/// Retry wiring for one consumer, resolved at queue-declaration time.
#[derive(Debug, Clone)]
pub struct RetryRoute {
    pub max_retries: u32,
    pub retry_queue: String,
    pub dead_letter_queue: String,
}

/// Everything the per-message pipeline needs to know about its consumer.
#[derive(Debug, Clone)]
pub struct ConsumePolicy {
    pub queue: String,
    pub late_ack: bool,
    pub retry: Option<RetryRoute>,
    pub callbacks_exchange: String,
    pub message_timeout: Duration,
}

/// Where a failed delivery goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureRoute {
    Retry,
    DeadLetter,
    /// Answered (when possible) and dropped; handled errors, codec
    /// failures, early-ack consumers, and consumers without retry
    Terminal,
}

fn classify_failure(policy: &ConsumePolicy, error: &BusError, retry_count: u32) -> FailureRoute {
    match &policy.retry {
        Some(retry) if policy.late_ack && retry.max_retries > 0 && !error.is_permanent() => {
            if retry_count < retry.max_retries {
                FailureRoute::Retry
            } else {
                FailureRoute::DeadLetter
            }
        }
        _ => FailureRoute::Terminal,
    }
}

impl ConnectionManager {
    /// Begin consuming `policy.queue` on `channel`, driving every delivery
    /// through the acknowledgement / timeout / retry pipeline before and
    /// after the handler runs. Returns once the consumer is registered; the
    /// loop itself runs on a spawned task that ends with the channel.
    pub async fn consume(
        &self,
        channel: &Channel,
        consumer_tag: &str,
        policy: ConsumePolicy,
        handler: MessageHandler,
    ) -> Result<()> {
        let consumer = channel
            .basic_consume(
                &policy.queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let channel = channel.clone();
        tokio::spawn(async move {
            let mut consumer = consumer;
            while let Some(next) = consumer.next().await {
                match next {
                    Ok(delivery) => {
                        tokio::spawn(process_delivery(
                            channel.clone(),
                            policy.clone(),
                            handler.clone(),
                            delivery,
                        ));
                    }
                    Err(e) => error!("consumer stream error on {}: {e}", policy.queue),
                }
            }
            debug!("consumer loop for {} ended", policy.queue);
        });
        Ok(())
    }
}

async fn process_delivery(
    channel: Channel,
    policy: ConsumePolicy,
    handler: MessageHandler,
    delivery: Delivery,
) {
    let properties = delivery.properties.clone();
    let headers = properties.headers().clone().unwrap_or_default();
    let correlation_id = properties
        .correlation_id()
        .as_ref()
        .map(|s| s.as_str().to_string());
    let reply_to = properties
        .reply_to()
        .as_ref()
        .map(|s| s.as_str().to_string());
    let routing_key = delivery.routing_key.as_str().to_string();

    let retry_count = header_u32(&headers, X_RETRY_COUNT).unwrap_or(0);
    let original_routing_key =
        header_string(&headers, X_ORIGINAL_ROUTING_KEY).unwrap_or_else(|| routing_key.clone());
    let first_failure_time = header_i64(&headers, X_FIRST_FAILURE_TIME);

    if !policy.late_ack {
        if let Err(e) = delivery.acker.ack(BasicAckOptions::default()).await {
            error!("early ack failed on {}: {e}", policy.queue);
            return;
        }
    }

    let incoming = IncomingMessage {
        body: delivery.data.clone(),
        routing_key,
        correlation_id: correlation_id.clone(),
        reply_to: reply_to.clone(),
        redelivered: delivery.redelivered,
        retry_count,
    };

    let timeout_ms = policy.message_timeout.as_millis() as u64;
    let outcome = match tokio::time::timeout(policy.message_timeout, handler(incoming)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(HandlerFailure::new(BusError::Timeout { timeout_ms })),
    };

    match outcome {
        Ok(reply) => {
            if policy.late_ack {
                if let Err(e) = delivery.acker.ack(BasicAckOptions::default()).await {
                    error!("ack failed on {}: {e}", policy.queue);
                    return;
                }
            }
            if let (Some(reply_to), Some(bytes)) = (reply_to.as_deref(), reply) {
                publish_reply(&channel, &policy, reply_to, correlation_id.as_deref(), &bytes)
                    .await;
            }
        }
        Err(failure) => {
            match classify_failure(&policy, &failure.error, retry_count) {
                FailureRoute::Retry => {
                    requeue_for_retry(
                        &channel,
                        &policy,
                        &delivery,
                        &properties,
                        retry_count,
                        &original_routing_key,
                        first_failure_time,
                        &failure.error,
                    )
                    .await;
                }
                FailureRoute::DeadLetter => {
                    dead_letter(
                        &channel,
                        &policy,
                        &delivery,
                        retry_count,
                        &original_routing_key,
                        &failure.error,
                    )
                    .await;
                }
                FailureRoute::Terminal => {
                    if let (Some(reply_to), Some(bytes)) = (reply_to.as_deref(), &failure.reply) {
                        publish_reply(
                            &channel,
                            &policy,
                            reply_to,
                            correlation_id.as_deref(),
                            bytes,
                        )
                        .await;
                    }
                    if policy.late_ack {
                        if let Err(e) = delivery
                            .acker
                            .reject(BasicRejectOptions { requeue: false })
                            .await
                        {
                            error!("reject failed on {}: {e}", policy.queue);
                        }
                    }
                    warn!(
                        "handler on {} failed terminally: {}",
                        policy.queue, failure.error
                    );
                }
            }
        }
    }
}

async fn publish_reply(
    channel: &Channel,
    policy: &ConsumePolicy,
    reply_to: &str,
    correlation_id: Option<&str>,
    bytes: &[u8],
) {
    let mut properties = BasicProperties::default()
        .with_content_type(OCTET_STREAM.into())
        .with_delivery_mode(PERSISTENT);
    if let Some(id) = correlation_id {
        properties = properties.with_correlation_id(id.into());
    }
    if let Err(e) = channel
        .basic_publish(
            &policy.callbacks_exchange,
            reply_to,
            Default::default(),
            bytes,
            properties,
        )
        .await
    {
        error!("reply publish to {reply_to} failed: {e}");
    }
}

/// Hand the original body to the retry queue with updated bookkeeping
/// headers, then ack the original delivery. Correlation id and reply-to
/// survive so a later attempt can still answer the caller.
#[allow(clippy::too_many_arguments)]
async fn requeue_for_retry(
    channel: &Channel,
    policy: &ConsumePolicy,
    delivery: &Delivery,
    properties: &BasicProperties,
    retry_count: u32,
    original_routing_key: &str,
    first_failure_time: Option<i64>,
    error: &BusError,
) {
    let Some(retry) = policy.retry.as_ref() else {
        return;
    };
    let mut headers = FieldTable::default();
    headers.insert(
        ShortString::from(X_RETRY_COUNT),
        AMQPValue::LongUInt(retry_count + 1),
    );
    headers.insert(
        ShortString::from(X_ORIGINAL_ROUTING_KEY),
        AMQPValue::LongString(original_routing_key.into()),
    );
    headers.insert(
        ShortString::from(X_FIRST_FAILURE_TIME),
        AMQPValue::LongLongInt(first_failure_time.unwrap_or_else(|| Utc::now().timestamp_millis())),
    );
    headers.insert(
        ShortString::from(X_LAST_ERROR),
        AMQPValue::LongString(error.to_string().into()),
    );

    let mut retry_properties = BasicProperties::default()
        .with_content_type(OCTET_STREAM.into())
        .with_delivery_mode(PERSISTENT)
        .with_headers(headers);
    if let Some(id) = properties.correlation_id() {
        retry_properties = retry_properties.with_correlation_id(id.clone());
    }
    if let Some(reply_to) = properties.reply_to() {
        retry_properties = retry_properties.with_reply_to(reply_to.clone());
    }

    let published = channel
        .basic_publish(
            "",
            &retry.retry_queue,
            Default::default(),
            &delivery.data,
            retry_properties,
        )
        .await;
    match published {
        Ok(_) => {
            debug!(
                "routed {} failure to {} (attempt {})",
                policy.queue,
                retry.retry_queue,
                retry_count + 1
            );
            if let Err(e) = delivery.acker.ack(BasicAckOptions::default()).await {
                error!("ack after retry publish failed: {e}");
            }
        }
        Err(e) => {
            error!("retry publish to {} failed: {e}", retry.retry_queue);
            let _ = delivery
                .acker
                .reject(BasicRejectOptions { requeue: true })
                .await;
        }
    }
}

async fn dead_letter(
    channel: &Channel,
    policy: &ConsumePolicy,
    delivery: &Delivery,
    retry_count: u32,
    original_routing_key: &str,
    error: &BusError,
) {
    let Some(retry) = policy.retry.as_ref() else {
        return;
    };
    let mut headers = FieldTable::default();
    headers.insert(
        ShortString::from(X_RETRY_COUNT),
        AMQPValue::LongUInt(retry_count),
    );
    headers.insert(
        ShortString::from(X_ORIGINAL_ROUTING_KEY),
        AMQPValue::LongString(original_routing_key.into()),
    );
    headers.insert(
        ShortString::from(X_ORIGINAL_QUEUE),
        AMQPValue::LongString(policy.queue.as_str().into()),
    );
    headers.insert(
        ShortString::from(X_DLQ_TIME),
        AMQPValue::LongLongInt(Utc::now().timestamp_millis()),
    );
    headers.insert(
        ShortString::from(X_LAST_ERROR),
        AMQPValue::LongString(error.to_string().into()),
    );

    let properties = BasicProperties::default()
        .with_content_type(OCTET_STREAM.into())
        .with_delivery_mode(PERSISTENT)
        .with_headers(headers);

    let published = channel
        .basic_publish(
            "",
            &retry.dead_letter_queue,
            Default::default(),
            &delivery.data,
            properties,
        )
        .await;
    match published {
        Ok(_) => {
            warn!(
                "retry budget exhausted on {}, dead-lettered to {}",
                policy.queue, retry.dead_letter_queue
            );
            if let Err(e) = delivery.acker.ack(BasicAckOptions::default()).await {
                error!("ack after dead-letter publish failed: {e}");
            }
        }
        Err(e) => {
            error!("dead-letter publish to {} failed: {e}", retry.dead_letter_queue);
            let _ = delivery
                .acker
                .reject(BasicRejectOptions { requeue: true })
                .await;
        }
    }
}

fn header_value<'h>(headers: &'h FieldTable, key: &str) -> Option<&'h AMQPValue> {
    headers
        .inner()
        .iter()
        .find(|(k, _)| k.as_str() == key)
        .map(|(_, v)| v)
}

pub(crate) fn header_u32(headers: &FieldTable, key: &str) -> Option<u32> {
    match header_value(headers, key)? {
        AMQPValue::LongUInt(v) => Some(*v),
        AMQPValue::LongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongLongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::ShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::ShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::ShortShortUInt(v) => Some(u32::from(*v)),
        _ => None,
    }
}

pub(crate) fn header_i64(headers: &FieldTable, key: &str) -> Option<i64> {
    match header_value(headers, key)? {
        AMQPValue::LongLongInt(v) => Some(*v),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::Timestamp(v) => i64::try_from(*v).ok(),
        _ => None,
    }
}

pub(crate) fn header_string(headers: &FieldTable, key: &str) -> Option<String> {
    match header_value(headers, key)? {
        AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::ShortString(v) => Some(v.as_str().to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(late_ack: bool, retry: Option<RetryRoute>) -> ConsumePolicy {
        ConsumePolicy {
            queue: "Demo.Math".to_string(),
            late_ack,
            retry,
            callbacks_exchange: "proto.bus.callback".to_string(),
            message_timeout: Duration::from_millis(100),
        }
    }

    fn retry_route(max_retries: u32) -> RetryRoute {
        RetryRoute {
            max_retries,
            retry_queue: "Demo.Math.Retry".to_string(),
            dead_letter_queue: "Demo.Math.DLQ".to_string(),
        }
    }

    #[test]
    fn unhandled_errors_are_retried_until_budget() {
        let policy = policy(true, Some(retry_route(3)));
        let error = BusError::unhandled("DB_DOWN", "boom");
        assert_eq!(classify_failure(&policy, &error, 0), FailureRoute::Retry);
        assert_eq!(classify_failure(&policy, &error, 2), FailureRoute::Retry);
        assert_eq!(
            classify_failure(&policy, &error, 3),
            FailureRoute::DeadLetter
        );
    }

    #[test]
    fn handled_errors_are_never_retried() {
        let policy = policy(true, Some(retry_route(3)));
        let error = BusError::handled("VALIDATION_ERROR", "bad");
        assert_eq!(classify_failure(&policy, &error, 0), FailureRoute::Terminal);
    }

    #[test]
    fn codec_failures_are_permanent() {
        let policy = policy(true, Some(retry_route(3)));
        let error = BusError::invalid_message("garbage");
        assert_eq!(classify_failure(&policy, &error, 0), FailureRoute::Terminal);
    }

    #[test]
    fn no_retry_without_late_ack_or_config() {
        let error = BusError::unhandled("X", "boom");
        assert_eq!(
            classify_failure(&policy(false, Some(retry_route(3))), &error, 0),
            FailureRoute::Terminal
        );
        assert_eq!(
            classify_failure(&policy(true, None), &error, 0),
            FailureRoute::Terminal
        );
        assert_eq!(
            classify_failure(&policy(true, Some(retry_route(0))), &error, 0),
            FailureRoute::Terminal
        );
    }

    #[test]
    fn header_helpers_cover_amqp_integer_widths() {
        let mut headers = FieldTable::default();
        headers.insert(ShortString::from(X_RETRY_COUNT), AMQPValue::LongUInt(2));
        headers.insert(
            ShortString::from(X_FIRST_FAILURE_TIME),
            AMQPValue::LongLongInt(1_700_000_000_000),
        );
        headers.insert(
            ShortString::from(X_ORIGINAL_ROUTING_KEY),
            AMQPValue::LongString("REQUEST.Demo.Math.add".into()),
        );
        assert_eq!(header_u32(&headers, X_RETRY_COUNT), Some(2));
        assert_eq!(
            header_i64(&headers, X_FIRST_FAILURE_TIME),
            Some(1_700_000_000_000)
        );
        assert_eq!(
            header_string(&headers, X_ORIGINAL_ROUTING_KEY).as_deref(),
            Some("REQUEST.Demo.Math.add")
        );
        assert_eq!(header_u32(&headers, "missing"), None);
    }
}
