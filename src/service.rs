//! Service definition and hosting: a method table wired to an RPC consumer,
//! plus per-service event subscriptions dispatched through the topic router.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use lapin::ExchangeKind;
use serde_json::Value as Json;
use tracing::{debug, info};

use crate::codec::Codec;
use crate::config::{BusConfig, ServiceOptions};
use crate::connection::ConnectionManager;
use crate::consume::{HandlerFailure, HandlerOutcome, IncomingMessage, MessageHandler};
use crate::consumer::{ConsumerConfig, EventConsumer, EventHandler, RpcConsumer};
use crate::error::{BusError, Result};

/// Request-scoped context handed to every method handler.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Caller identity from the request envelope
    pub actor: String,
    pub correlation_id: String,
}

/// One RPC method implementation.
#[async_trait]
pub trait ServiceMethod: Send + Sync {
    async fn call(&self, request: Json, ctx: RequestContext) -> Result<Json>;
}

struct FunctionMethod<F> {
    function: F,
}

#[async_trait]
impl<F, Fut> ServiceMethod for FunctionMethod<F>
where
    F: Fn(Json, RequestContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Json>> + Send,
{
    async fn call(&self, request: Json, ctx: RequestContext) -> Result<Json> {
        (self.function)(request, ctx).await
    }
}

/// Where a service's schema text comes from.
#[derive(Debug, Clone)]
pub enum SchemaSource {
    File(PathBuf),
    Inline(String),
}

/// A service definition: fully-qualified name, schema source, method table,
/// event subscriptions, and any extra routing-key patterns.
pub struct ServiceSchema {
    name: String,
    source: SchemaSource,
    methods: HashMap<String, Arc<dyn ServiceMethod>>,
    events: Vec<(String, EventHandler)>,
    extra_bindings: Vec<String>,
}

impl ServiceSchema {
    pub fn new(name: impl Into<String>, source: SchemaSource) -> Self {
        Self {
            name: name.into(),
            source,
            methods: HashMap::new(),
            events: Vec::new(),
            extra_bindings: Vec::new(),
        }
    }

    pub fn from_file(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::new(name, SchemaSource::File(path.into()))
    }

    pub fn from_text(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(name, SchemaSource::Inline(text.into()))
    }

    /// Register a method handler under its short name (`add`, not
    /// `Demo.Math.add`).
    pub fn method<F, Fut>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(Json, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Json>> + Send + 'static,
    {
        self.methods
            .insert(name.into(), Arc::new(FunctionMethod { function }));
        self
    }

    pub fn handler(mut self, name: impl Into<String>, handler: impl ServiceMethod + 'static) -> Self {
        self.methods.insert(name.into(), Arc::new(handler));
        self
    }

    /// Subscribe to events matching `topic` (AMQP topic-pattern rules).
    pub fn on_event<F, Fut>(mut self, topic: impl Into<String>, function: F) -> Self
    where
        F: Fn(Json, crate::consumer::EventContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.events.push((topic.into(), EventHandler::new(function)));
        self
    }

    /// Subscribe to a payload type under its default topic,
    /// `EVENT.<TypeName>`.
    pub fn on_event_type<F, Fut>(self, type_name: &str, function: F) -> Self
    where
        F: Fn(Json, crate::consumer::EventContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let topic = format!("EVENT.{type_name}");
        self.on_event(topic, function)
    }

    /// Bind an additional routing-key pattern beyond the default
    /// `REQUEST.<ServiceName>.*`.
    pub fn route(mut self, pattern: impl Into<String>) -> Self {
        self.extra_bindings.push(pattern.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for ServiceSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceSchema")
            .field("name", &self.name)
            .field("methods", &self.methods.len())
            .field("events", &self.events.len())
            .finish()
    }
}

/// A running service: its RPC consumer and, when it subscribes to events,
/// its event consumer.
pub struct ServiceHost {
    name: String,
    consumer: RpcConsumer,
    event_consumer: Option<EventConsumer>,
}

impl ServiceHost {
    /// Parse the schema, wire the method table to an RPC consumer bound
    /// under `REQUEST.<ServiceName>.*`, and start consuming.
    pub(crate) async fn start(
        connection: ConnectionManager,
        codec: Arc<Codec>,
        config: BusConfig,
        schema: ServiceSchema,
        options: ServiceOptions,
    ) -> Result<Self> {
        match &schema.source {
            SchemaSource::File(path) => codec.parse_file(path)?,
            SchemaSource::Inline(text) => codec.parse(text)?,
        }
        if !codec.has_service(&schema.name) {
            return Err(BusError::ServiceNotFound {
                service: schema.name.clone(),
            });
        }

        let late_ack = options.retry.is_some();
        let consumer = RpcConsumer::new(
            connection.clone(),
            ConsumerConfig {
                exchange: config.exchange.clone(),
                exchange_kind: ExchangeKind::Topic,
                queue: schema.name.clone(),
                late_ack,
                max_concurrent: options.max_concurrent,
                message_ttl_ms: options.retry.as_ref().and_then(|r| r.message_ttl_ms),
                retry: options.retry.clone(),
                callbacks_exchange: config.callbacks_exchange.clone(),
                message_timeout: config.message_timeout,
            },
        )?;

        let methods = Arc::new(schema.methods);
        let handler = request_handler(codec.clone(), schema.name.clone(), methods);
        let mut patterns = vec![format!("REQUEST.{}.*", schema.name)];
        patterns.extend(schema.extra_bindings.iter().cloned());
        consumer.init(handler, &patterns).await?;
        consumer.start().await?;

        let event_consumer = if schema.events.is_empty() {
            None
        } else {
            let events = EventConsumer::new(
                connection,
                codec,
                config.events_exchange.clone(),
                config.callbacks_exchange.clone(),
                String::new(),
                None,
                config.message_timeout,
            );
            events.init().await?;
            for (topic, handler) in &schema.events {
                events.subscribe(topic, handler.clone()).await?;
            }
            events.start().await?;
            Some(events)
        };

        info!("service {} is up", schema.name);
        Ok(Self {
            name: schema.name,
            consumer,
            event_consumer,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn queue_name(&self) -> String {
        self.consumer.queue_name().await
    }

    pub async fn close(&self) {
        if let Some(events) = &self.event_consumer {
            events.close().await;
        }
        self.consumer.close().await;
        info!("service {} closed", self.name);
    }
}

/// Build the consumer handler: decode, dispatch to the method table, encode
/// the response or a structured error. Failures still produce reply bytes;
/// whether the message is retried is the consume pipeline's decision.
fn request_handler(
    codec: Arc<Codec>,
    service_name: String,
    methods: Arc<HashMap<String, Arc<dyn ServiceMethod>>>,
) -> MessageHandler {
    Arc::new(move |incoming| {
        let codec = codec.clone();
        let service_name = service_name.clone();
        let methods = methods.clone();
        Box::pin(handle_request(codec, service_name, methods, incoming))
    })
}

async fn handle_request(
    codec: Arc<Codec>,
    service_name: String,
    methods: Arc<HashMap<String, Arc<dyn ServiceMethod>>>,
    incoming: IncomingMessage,
) -> HandlerOutcome {
    let request = match codec.decode_request(&incoming.body) {
        Ok(request) => request,
        Err(e) => {
            let reply = codec.encode_error(&e.to_string(), e.code(), false);
            return Err(HandlerFailure::with_reply(e, reply));
        }
    };
    let method_name = request
        .method
        .rsplit_once('.')
        .map(|(_, short)| short)
        .unwrap_or(request.method.as_str());

    let Some(method) = methods.get(method_name) else {
        let e = BusError::MethodNotFound {
            service: service_name,
            method: method_name.to_string(),
        };
        let reply = codec.encode_error(&e.to_string(), e.code(), false);
        return Err(HandlerFailure::with_reply(e, reply));
    };

    debug!(
        "dispatching {} for actor '{}'",
        request.method, request.actor
    );
    let ctx = RequestContext {
        actor: request.actor.clone(),
        correlation_id: incoming.correlation_id.clone().unwrap_or_default(),
    };
    match method.call(request.payload, ctx).await {
        Ok(response) => match codec.encode_response(&request.method, &response) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) => {
                let reply = codec.encode_error(&e.to_string(), e.code(), false);
                Err(HandlerFailure::with_reply(e, reply))
            }
        },
        Err(e) => {
            let (message, code, handled) = match &e {
                BusError::Handler {
                    message,
                    code,
                    handled,
                } => (message.clone(), code.clone(), *handled),
                other => (other.to_string(), other.code().to_string(), false),
            };
            let reply = codec.encode_error(&message, &code, handled);
            Err(HandlerFailure::with_reply(e, reply))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MATH_SCHEMA: &str = r#"
        syntax = "proto3";
        package Demo;
        service Math { rpc add (AddRequest) returns (AddResponse); }
        message AddRequest { int32 a = 1; int32 b = 2; }
        message AddResponse { int32 result = 1; }
    "#;

    fn incoming(body: Vec<u8>) -> IncomingMessage {
        IncomingMessage {
            body,
            routing_key: "REQUEST.Demo.Math.add".to_string(),
            correlation_id: Some("corr-1".to_string()),
            reply_to: Some("reply-q".to_string()),
            redelivered: false,
            retry_count: 0,
        }
    }

    fn math_methods() -> Arc<HashMap<String, Arc<dyn ServiceMethod>>> {
        let schema = ServiceSchema::from_text("Demo.Math", MATH_SCHEMA)
            .method("add", |request: Json, _ctx| async move {
                let a = request["a"].as_i64().unwrap_or(0);
                let b = request["b"].as_i64().unwrap_or(0);
                Ok(json!({ "result": a + b }))
            });
        Arc::new(schema.methods)
    }

    fn math_codec() -> Arc<Codec> {
        let codec = Arc::new(Codec::new());
        codec.parse(MATH_SCHEMA).unwrap();
        codec
    }

    #[tokio::test]
    async fn dispatches_and_encodes_response() {
        let codec = math_codec();
        let body = codec
            .encode_request("Demo.Math.add", &json!({"a": 1, "b": 2}), "tester")
            .unwrap();
        let outcome = handle_request(
            codec.clone(),
            "Demo.Math".to_string(),
            math_methods(),
            incoming(body),
        )
        .await;
        let reply = outcome.unwrap().unwrap();
        let record = codec.decode_response("Demo.Math.add", &reply).unwrap();
        assert_eq!(record.result, Some(json!({"result": 3})));
    }

    #[tokio::test]
    async fn unknown_method_returns_structured_error() {
        let codec = math_codec();
        let body = codec
            .encode_request("Demo.Math.add", &json!({"a": 1, "b": 2}), "")
            .unwrap();
        let methods: Arc<HashMap<String, Arc<dyn ServiceMethod>>> = Arc::new(HashMap::new());
        let failure = handle_request(codec.clone(), "Demo.Math".to_string(), methods, incoming(body))
            .await
            .unwrap_err();
        assert!(matches!(failure.error, BusError::MethodNotFound { .. }));
        let record = codec
            .decode_response("Demo.Math.add", &failure.reply.unwrap())
            .unwrap();
        assert_eq!(record.error.unwrap().code, "METHOD_NOT_FOUND");
    }

    #[tokio::test]
    async fn handled_errors_are_encoded_with_their_flag() {
        let codec = math_codec();
        let schema = ServiceSchema::from_text("Demo.Math", MATH_SCHEMA)
            .method("add", |_request: Json, _ctx| async move {
                Err::<Json, _>(BusError::handled("VALIDATION_ERROR", "bad"))
            });
        let body = codec
            .encode_request("Demo.Math.add", &json!({"a": 1, "b": 2}), "")
            .unwrap();
        let failure = handle_request(
            codec.clone(),
            "Demo.Math".to_string(),
            Arc::new(schema.methods),
            incoming(body),
        )
        .await
        .unwrap_err();
        assert!(failure.error.is_permanent());
        let record = codec
            .decode_response("Demo.Math.add", &failure.reply.unwrap())
            .unwrap();
        let error = record.error.unwrap();
        assert_eq!(error.message, "bad");
        assert_eq!(error.code, "VALIDATION_ERROR");
        assert!(error.handled);
    }

    #[tokio::test]
    async fn undecodable_requests_fail_permanently() {
        let codec = math_codec();
        let failure = handle_request(
            codec.clone(),
            "Demo.Math".to_string(),
            math_methods(),
            incoming(vec![0xff, 0xff, 0xff]),
        )
        .await
        .unwrap_err();
        assert!(failure.error.is_permanent());
        assert!(failure.reply.is_some());
    }
}
