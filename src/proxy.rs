use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as Json;
use tracing::debug;

use crate::codec::Codec;
use crate::dispatcher::RpcDispatcher;
use crate::error::{BusError, Result};

/// Typed client for one target service: a method dispatcher keyed by the
/// names the schema declares. Statically typed surfaces are generated from
/// the exported type view; at runtime each call is a schema lookup, an
/// encode, a dispatch, and a decode.
#[derive(Clone)]
pub struct ServiceProxy {
    codec: Arc<Codec>,
    rpc: RpcDispatcher,
    service: String,
    methods: Vec<String>,
}

impl ServiceProxy {
    /// Resolve `service` against the schema registry; fails when the service
    /// is unknown.
    pub(crate) fn new(codec: Arc<Codec>, rpc: RpcDispatcher, service: &str) -> Result<Self> {
        let methods = codec.method_names(service)?;
        Ok(Self {
            codec,
            rpc,
            service: service.to_string(),
            methods,
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Method names the target service declares.
    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    /// Invoke `method` with `payload`. A structured error reply re-raises as
    /// [`BusError::Handler`] carrying the remote message, code, and handled
    /// flag.
    pub async fn call(&self, method: &str, payload: &Json, actor: Option<&str>) -> Result<Json> {
        self.dispatch(method, payload, actor, None).await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        payload: &Json,
        actor: Option<&str>,
        timeout: Duration,
    ) -> Result<Json> {
        self.dispatch(method, payload, actor, Some(timeout)).await
    }

    async fn dispatch(
        &self,
        method: &str,
        payload: &Json,
        actor: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Json> {
        if !self.methods.iter().any(|m| m == method) {
            return Err(BusError::MethodNotFound {
                service: self.service.clone(),
                method: method.to_string(),
            });
        }
        let full_method = format!("{}.{}", self.service, method);
        let routing_key = format!("REQUEST.{full_method}");
        let body = self
            .codec
            .encode_request(&full_method, payload, actor.unwrap_or_default())?;

        debug!("proxy call {}", full_method);
        let reply = match timeout {
            Some(timeout) => self.rpc.call_with_timeout(&body, &routing_key, timeout).await?,
            None => self.rpc.call(&body, &routing_key).await?,
        };

        let record = self.codec.decode_response(&full_method, &reply)?;
        if let Some(error) = record.error {
            return Err(BusError::Handler {
                message: error.message,
                code: error.code,
                handled: error.handled,
            });
        }
        record
            .result
            .ok_or_else(|| BusError::invalid_message("response carried no result"))
    }
}

impl std::fmt::Debug for ServiceProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProxy")
            .field("service", &self.service)
            .field("methods", &self.methods)
            .finish()
    }
}
