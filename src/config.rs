use std::time::Duration;

/// Default name of the main topic exchange carrying RPC requests.
pub const DEFAULT_EXCHANGE: &str = "proto.bus";
/// Default name of the direct exchange carrying RPC replies.
pub const DEFAULT_CALLBACKS_EXCHANGE: &str = "proto.bus.callback";
/// Default name of the topic exchange carrying events.
pub const DEFAULT_EVENTS_EXCHANGE: &str = "proto.bus.events";

const DEFAULT_MESSAGE_TIMEOUT_MS: u64 = 600_000;

/// Process-level bus configuration: exchange names and the per-message
/// processing timeout. Fixed per process once constructed.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Main topic exchange for RPC requests
    pub exchange: String,
    /// Direct exchange for RPC replies
    pub callbacks_exchange: String,
    /// Topic exchange for events
    pub events_exchange: String,
    /// Bound on each in-flight handler and on each pending RPC wait
    pub message_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            exchange: DEFAULT_EXCHANGE.to_string(),
            callbacks_exchange: DEFAULT_CALLBACKS_EXCHANGE.to_string(),
            events_exchange: DEFAULT_EVENTS_EXCHANGE.to_string(),
            message_timeout: Duration::from_millis(DEFAULT_MESSAGE_TIMEOUT_MS),
        }
    }
}

impl BusConfig {
    /// Build a configuration from the environment, falling back to defaults.
    ///
    /// Recognised variables: `BUS_EXCHANGE_NAME`, `CALLBACKS_EXCHANGE_NAME`,
    /// `EVENTS_EXCHANGE_NAME`, `MESSAGE_PROCESSING_TIMEOUT` (milliseconds).
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            exchange: env_or("BUS_EXCHANGE_NAME", defaults.exchange),
            callbacks_exchange: env_or("CALLBACKS_EXCHANGE_NAME", defaults.callbacks_exchange),
            events_exchange: env_or("EVENTS_EXCHANGE_NAME", defaults.events_exchange),
            message_timeout: std::env::var("MESSAGE_PROCESSING_TIMEOUT")
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.message_timeout),
        }
    }

    pub fn message_timeout_ms(&self) -> u64 {
        self.message_timeout.as_millis() as u64
    }
}

fn env_or(name: &str, default: String) -> String {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => default,
    }
}

/// Reconnection policy for the connection manager.
#[derive(Debug, Clone)]
pub struct ReconnectOptions {
    /// Maximum reconnect attempts; 0 means unbounded
    pub max_retries: u32,
    /// Delay before the first reconnect attempt
    pub initial_delay: Duration,
    /// Upper bound on the computed delay, before jitter
    pub max_delay: Duration,
    /// Exponential growth factor
    pub backoff_multiplier: f64,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
        }
    }
}

/// Retry policy for a late-ack consumer. `max_retries: 0` disables retry.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Redelivery attempts before a message is dead-lettered
    pub max_retries: u32,
    /// Time a failed message waits on the retry queue
    pub retry_delay_ms: u64,
    /// Optional per-queue TTL applied to the service queue itself
    pub message_ttl_ms: Option<u64>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 5_000,
            message_ttl_ms: None,
        }
    }
}

/// Options a service is constructed with.
#[derive(Debug, Clone, Default)]
pub struct ServiceOptions {
    /// Prefetch bound on concurrent in-flight handlers (late-ack only).
    /// `None` leaves the channel unbounded.
    pub max_concurrent: Option<u16>,
    /// Retry policy; enabling it switches the consumer to late-ack mode
    pub retry: Option<RetryOptions>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = BusConfig::default();
        assert_eq!(config.exchange, "proto.bus");
        assert_eq!(config.callbacks_exchange, "proto.bus.callback");
        assert_eq!(config.events_exchange, "proto.bus.events");
        assert_eq!(config.message_timeout_ms(), 600_000);
    }

    #[test]
    fn env_overrides() {
        std::env::set_var("BUS_EXCHANGE_NAME", "acme.bus");
        std::env::set_var("MESSAGE_PROCESSING_TIMEOUT", "1500");
        let config = BusConfig::from_env();
        assert_eq!(config.exchange, "acme.bus");
        assert_eq!(config.message_timeout, Duration::from_millis(1500));
        std::env::remove_var("BUS_EXCHANGE_NAME");
        std::env::remove_var("MESSAGE_PROCESSING_TIMEOUT");
    }

    #[test]
    fn reconnect_defaults() {
        let opts = ReconnectOptions::default();
        assert_eq!(opts.max_retries, 10);
        assert_eq!(opts.initial_delay, Duration::from_millis(1_000));
        assert_eq!(opts.max_delay, Duration::from_millis(30_000));
        assert!((opts.backoff_multiplier - 2.0).abs() < f64::EPSILON);
    }
}
