//! Server assembly and shutdown coordination.

use crate::api::{run_flight_server, FlightServerOptions, ShootsFlightService};
use crate::auth::TokenAuthority;
use crate::config::ServerConfig;
use crate::dispatch::ActionDispatcher;
use crate::service::BucketService;
use crate::storage::BucketStore;
use crate::{Error, Result};

use serde_json::Map;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

/// Cloneable one-shot shutdown signal.
///
/// Triggering is idempotent; every waiter, including ones that subscribe
/// after the trigger, observes it.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once [`trigger`](Self::trigger) has been called.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        if *rx.borrow_and_update() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow_and_update() {
                return;
            }
        }
    }
}

/// A configured Shoots server, ready to bind.
#[derive(Debug, Clone)]
pub struct ShootsServer {
    config: ServerConfig,
    store: BucketStore,
    tokens: Option<TokenAuthority>,
    shutdown: ShutdownHandle,
}

impl ShootsServer {
    /// Open the bucket root and prepare the token authority.
    pub async fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let store = BucketStore::open(config.bucket_dir.clone()).await?;
        let tokens = config
            .secret
            .as_deref()
            .map(|secret| TokenAuthority::new(secret, config.location()))
            .transpose()?;

        Ok(Self {
            config,
            store,
            tokens,
            shutdown: ShutdownHandle::new(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> &BucketStore {
        &self.store
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// A fresh admin token with the configured lifetime, when a secret is set.
    pub fn admin_token(&self) -> Result<Option<String>> {
        self.tokens
            .as_ref()
            .map(|tokens| tokens.issue(&Map::new(), self.config.token_ttl()))
            .transpose()
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr())
            .await
            .map_err(|e| {
                Error::Config(format!("failed to bind {}: {e}", self.config.bind_addr()))
            })?;
        self.serve_with_listener(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn serve_with_listener(self, listener: TcpListener) -> Result<()> {
        let service = BucketService::new(self.store.clone());
        let dispatcher = ActionDispatcher::new(
            service.clone(),
            self.tokens.clone(),
            self.config.token_ttl(),
            self.shutdown.clone(),
        );
        let flight = ShootsFlightService::new(service, dispatcher, self.tokens.clone());
        let options = FlightServerOptions {
            tls: self.config.tls_identity()?,
            max_message_bytes: self.config.max_message_bytes,
            shutdown_grace: self.config.shutdown_grace(),
        };

        info!(
            addr = %listener.local_addr()?,
            bucket_dir = %self.store.root().display(),
            tls = self.config.tls_enabled(),
            auth = self.tokens.is_some(),
            "Shoots Flight server listening"
        );
        run_flight_server(listener, flight, options, self.shutdown.clone()).await?;
        info!("Shoots Flight server stopped");
        Ok(())
    }
}
