//! Host bootstrap: constructs the runtime, connects, initialises services,
//! and shuts everything down on termination signals.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info};

use crate::codec::Codec;
use crate::config::{BusConfig, ReconnectOptions, ServiceOptions};
use crate::connection::ConnectionManager;
use crate::dispatcher::{EventDispatcher, RpcDispatcher};
use crate::error::Result;
use crate::proxy::ServiceProxy;
use crate::service::{ServiceHost, ServiceSchema};

/// Everything a host needs to come up.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub amqp_url: String,
    /// Directories scanned recursively for `.proto` schemas at startup
    pub schema_dirs: Vec<PathBuf>,
    pub bus: BusConfig,
    pub reconnect: ReconnectOptions,
}

impl HostConfig {
    /// Exchange names and the processing timeout come from the environment;
    /// reconnection uses the default backoff policy.
    pub fn new(amqp_url: impl Into<String>) -> Self {
        Self {
            amqp_url: amqp_url.into(),
            schema_dirs: Vec::new(),
            bus: BusConfig::from_env(),
            reconnect: ReconnectOptions::default(),
        }
    }

    pub fn schema_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.schema_dirs.push(dir.into());
        self
    }

    pub fn reconnect(mut self, reconnect: ReconnectOptions) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// The runtime: connection, codec, and both dispatchers, with the services
/// it hosts. Single owner of every component, handing each a reference to
/// the connection.
pub struct Host {
    config: BusConfig,
    connection: ConnectionManager,
    codec: Arc<Codec>,
    rpc: RpcDispatcher,
    events: EventDispatcher,
    services: Mutex<Vec<ServiceHost>>,
}

impl Host {
    /// Connect and bring up the runtime: connection manager, codec (with the
    /// configured schema directories), RPC dispatcher and its reply queue,
    /// event dispatcher.
    pub async fn connect(config: HostConfig) -> Result<Self> {
        let connection = ConnectionManager::new(&config.amqp_url, config.reconnect.clone());
        connection.connect().await?;

        let codec = Arc::new(Codec::new());
        if !config.schema_dirs.is_empty() {
            codec.init(&config.schema_dirs)?;
        }

        let rpc = RpcDispatcher::new(connection.clone(), config.bus.clone());
        rpc.init().await?;
        let events = EventDispatcher::new(connection.clone(), codec.clone(), config.bus.clone());
        events.init().await?;

        info!("protobus host up on {}", config.amqp_url);
        Ok(Self {
            config: config.bus,
            connection,
            codec,
            rpc,
            events,
            services: Mutex::new(Vec::new()),
        })
    }

    pub fn codec(&self) -> &Arc<Codec> {
        &self.codec
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Publisher for the events exchange.
    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// Dispatcher for raw, pre-encoded RPC calls; most callers want
    /// [`Host::proxy`] instead.
    pub fn rpc(&self) -> &RpcDispatcher {
        &self.rpc
    }

    /// Bring one service up and keep it until shutdown.
    pub async fn serve(&self, schema: ServiceSchema, options: ServiceOptions) -> Result<()> {
        let service = ServiceHost::start(
            self.connection.clone(),
            self.codec.clone(),
            self.config.clone(),
            schema,
            options,
        )
        .await?;
        self.services.lock().await.push(service);
        Ok(())
    }

    /// Typed client for a service known to the schema registry.
    pub fn proxy(&self, service: &str) -> Result<ServiceProxy> {
        ServiceProxy::new(self.codec.clone(), self.rpc.clone(), service)
    }

    /// Block until SIGINT/SIGTERM, then shut down.
    pub async fn run(&self) -> Result<()> {
        wait_for_shutdown_signal().await;
        info!("termination signal received, shutting down");
        self.shutdown().await
    }

    /// Close services, the dispatchers, and the connection. Failures are
    /// logged; shutdown continues regardless.
    pub async fn shutdown(&self) -> Result<()> {
        let services: Vec<ServiceHost> = self.services.lock().await.drain(..).collect();
        for service in services {
            service.close().await;
        }
        self.rpc.close().await;
        self.events.close().await;
        if let Err(e) = self.connection.disconnect().await {
            error!("disconnect failed during shutdown: {e}");
        }
        info!("protobus host stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("exchange", &self.config.exchange)
            .finish()
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("SIGTERM handler failed to install: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
