//! # protobus — broker-native microservices over AMQP + Protobuf
//!
//! Services talk only through RabbitMQ: typed request/response RPC on a
//! topic exchange, durable topic-routed events, and consumers with retry
//! and dead-lettering. Payloads travel as Protobuf, framed by three small
//! envelopes any language can decode.
//!
//! ## A service in a few lines
//!
//! ```rust,no_run
//! use protobus::{Host, HostConfig, ServiceOptions, ServiceSchema};
//! use serde_json::json;
//!
//! const SCHEMA: &str = r#"
//!     syntax = "proto3";
//!     package Demo;
//!     service Math { rpc add (AddRequest) returns (AddResponse); }
//!     message AddRequest { int32 a = 1; int32 b = 2; }
//!     message AddResponse { int32 result = 1; }
//! "#;
//!
//! #[tokio::main]
//! async fn main() -> protobus::Result<()> {
//!     let host = Host::connect(HostConfig::new("amqp://localhost:5672")).await?;
//!
//!     let math = ServiceSchema::from_text("Demo.Math", SCHEMA)
//!         .method("add", |request, _ctx| async move {
//!             let a = request["a"].as_i64().unwrap_or(0);
//!             let b = request["b"].as_i64().unwrap_or(0);
//!             Ok(json!({ "result": a + b }))
//!         });
//!     host.serve(math, ServiceOptions::default()).await?;
//!
//!     // call it from anywhere on the bus
//!     let proxy = host.proxy("Demo.Math")?;
//!     let reply = proxy.call("add", &json!({"a": 1, "b": 2}), None).await?;
//!     assert_eq!(reply["result"], 3);
//!
//!     host.run().await // blocks until SIGINT/SIGTERM, then shuts down
//! }
//! ```
//!
//! ## What the runtime handles for you
//!
//! - **Connection lifecycle**: loss detection, exponential backoff with
//!   jitter, and re-declaration of every queue, binding, and consumer when
//!   the broker comes back.
//! - **The correlation plane**: requests carry a random correlation id and
//!   a private reply queue; the dispatcher parks each caller on a one-shot
//!   handle completed by reply, timeout, or disconnect — exactly once.
//! - **Retry and dead-lettering**: late-ack consumers route failures
//!   through a per-service retry queue (broker-side delay via message TTL)
//!   and on to `<Service>.DLQ` when the budget runs out. Business errors
//!   marked *handled* answer the caller and are never retried.
//! - **Typed payloads**: schemas are plain `.proto` files parsed at
//!   runtime; payloads are checked field by field, with extensible custom
//!   scalars (`bigint`, `timestamp`, and your own) travelling as
//!   single-field wrapper messages.
//! - **Event fan-out**: topic patterns (`*` one word, `#` zero or more)
//!   matched broker-side for queue routing and in-process for handler
//!   dispatch, with de-duplication.
//!
//! ## Exchanges and routing
//!
//! | Exchange | Kind | Default name | Carries |
//! |---|---|---|---|
//! | main | topic | `proto.bus` | `REQUEST.<Service>.<method>` |
//! | callbacks | direct | `proto.bus.callback` | replies, keyed by reply queue |
//! | events | topic | `proto.bus.events` | `EVENT.<Type>` or custom topics |
//!
//! Names are overridable via `BUS_EXCHANGE_NAME`, `CALLBACKS_EXCHANGE_NAME`,
//! and `EVENTS_EXCHANGE_NAME`; the per-message processing timeout via
//! `MESSAGE_PROCESSING_TIMEOUT` (milliseconds).

pub mod codec;
pub mod config;
pub mod connection;
pub mod consume;
pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod host;
mod pending;
pub mod proxy;
pub mod router;
pub mod service;

pub use codec::scalars::{ScalarDescriptor, WireKind};
pub use codec::{Codec, DecodedEvent, DecodedRequest, ErrorRecord, ResponseRecord};
pub use config::{BusConfig, ReconnectOptions, RetryOptions, ServiceOptions};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState, ConnectionStats};
pub use consume::{HandlerFailure, IncomingMessage};
pub use consumer::{EventConsumer, EventContext, EventHandler, ReplyConsumer, RpcConsumer};
pub use dispatcher::{EventDispatcher, RpcDispatcher};
pub use error::{BusError, Result};
pub use host::{Host, HostConfig};
pub use proxy::ServiceProxy;
pub use router::TopicRouter;
pub use service::{RequestContext, SchemaSource, ServiceHost, ServiceMethod, ServiceSchema};
