use thiserror::Error;

/// Result type alias for bus operations
pub type Result<T> = std::result::Result<T, BusError>;

/// Error taxonomy for the messaging runtime
#[derive(Error, Debug)]
pub enum BusError {
    /// AMQP transport errors
    #[error("AMQP transport error: {0}")]
    Transport(#[from] lapin::Error),

    /// Publishing while the connection is down or not yet established
    #[error("not connected to the broker")]
    NotConnected,

    /// A pending RPC was aborted because the connection was lost after publish
    #[error("connection lost while waiting for a reply")]
    Disconnected,

    /// An RPC call or consume handler exceeded the processing timeout
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The codec could not encode or decode a payload against its declared type
    #[error("invalid message: {reason}")]
    InvalidMessage { reason: String },

    /// A business-semantic failure raised by a service method.
    /// `handled` errors are propagated to the caller and never retried.
    #[error("service error [{code}]: {message}")]
    Handler {
        message: String,
        code: String,
        handled: bool,
    },

    /// Service not present in the schema registry
    #[error("service '{service}' not found")]
    ServiceNotFound { service: String },

    /// Method not declared by the target service
    #[error("method '{method}' not found in service '{service}'")]
    MethodNotFound { service: String, method: String },

    /// Schema compilation errors
    #[error("schema error: {0}")]
    Schema(#[from] protox::Error),

    /// Schema registry conflicts (duplicate or unresolvable descriptors)
    #[error("descriptor error: {0}")]
    Descriptor(#[from] prost_reflect::DescriptorError),

    /// Protobuf wire decode errors
    #[error("wire decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// The connection manager gave up after max_retries attempts
    #[error("reconnection exhausted after {attempts} attempts")]
    ReconnectionExhausted { attempts: u32 },

    /// Payload value (de)serialization errors
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal framework errors
    #[error("internal error: {0}")]
    Internal(String),

    /// Schema file I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors from user handlers
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BusError {
    /// Create a handled (business-semantic) error. Handled errors reach the
    /// caller as structured replies and are never retried.
    pub fn handled(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
            code: code.into(),
            handled: true,
        }
    }

    /// Create an unhandled service error, subject to the retry policy.
    pub fn unhandled(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
            code: code.into(),
            handled: false,
        }
    }

    pub fn invalid_message<T: ToString>(reason: T) -> Self {
        Self::InvalidMessage {
            reason: reason.to_string(),
        }
    }

    pub fn config_error<T: ToString>(message: T) -> Self {
        Self::Config(message.to_string())
    }

    pub fn internal_error<T: ToString>(message: T) -> Self {
        Self::Internal(message.to_string())
    }

    /// Whether the failure is permanent from the consume loop's point of
    /// view. Permanent failures are answered (when a reply channel exists)
    /// and never routed to the retry queue.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Handler { handled, .. } => *handled,
            Self::InvalidMessage { .. } => true,
            Self::Decode(_) => true,
            Self::MethodNotFound { .. } => true,
            Self::ServiceNotFound { .. } => true,
            _ => false,
        }
    }

    /// The error code carried on the wire in an error reply.
    pub fn code(&self) -> &str {
        match self {
            Self::Handler { code, .. } => code,
            Self::InvalidMessage { .. } => "INVALID_MESSAGE",
            Self::Decode(_) => "INVALID_MESSAGE",
            Self::MethodNotFound { .. } => "METHOD_NOT_FOUND",
            Self::ServiceNotFound { .. } => "SERVICE_NOT_FOUND",
            Self::Timeout { .. } => "TIMEOUT",
            _ => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handled_errors_are_permanent() {
        assert!(BusError::handled("VALIDATION_ERROR", "bad").is_permanent());
        assert!(!BusError::unhandled("DB_DOWN", "boom").is_permanent());
        assert!(BusError::invalid_message("garbage").is_permanent());
        assert!(!BusError::NotConnected.is_permanent());
        assert!(!BusError::Timeout { timeout_ms: 5 }.is_permanent());
    }

    #[test]
    fn error_codes() {
        assert_eq!(BusError::handled("E42", "x").code(), "E42");
        assert_eq!(BusError::invalid_message("x").code(), "INVALID_MESSAGE");
        assert_eq!(BusError::NotConnected.code(), "INTERNAL_ERROR");
    }
}
