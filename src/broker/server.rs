// Broker server: shared state, TCP listener, session lifecycle

use crate::broker::auth::{KeyMatchVerifier, SignatureVerifier};
use crate::broker::broker::{RegistryHandle, SubscriberRegistry};
use crate::broker::client::ClientSession;
use crate::broker::config::ServerConfig;
use crate::broker::ids::IdGenerator;
use crate::broker::message::MessageStore;
use crate::broker::storage::ConnectionStore;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Process-wide broker state shared by every client session: the id
/// generator, the message and connection stores, the subscriber
/// registry, and the signature verifier. One instance per broker; tests
/// build a fresh one per case.
pub struct BrokerState {
    pub config: ServerConfig,
    pub ids: IdGenerator,
    pub queues: MessageStore,
    pub connections: ConnectionStore,
    pub registry: RegistryHandle,
    pub verifier: Arc<dyn SignatureVerifier>,
}

impl BrokerState {
    /// Build fresh broker state with the placeholder verifier and spawn
    /// its registry fiber.
    pub fn start(config: ServerConfig) -> Arc<Self> {
        Self::start_with_verifier(config, Arc::new(KeyMatchVerifier))
    }

    /// Build fresh broker state with a custom signature verifier.
    pub fn start_with_verifier(
        config: ServerConfig,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Arc<Self> {
        let (registry, registry_handle) = SubscriberRegistry::new(config.tbq_size);
        tokio::spawn(registry.run());

        Arc::new(Self {
            ids: IdGenerator::new(),
            queues: MessageStore::new(config.tbq_size),
            connections: ConnectionStore::new(),
            registry: registry_handle,
            verifier,
            config,
        })
    }
}

/// A running broker bound to a TCP listener.
pub struct ServerInstance {
    state: Arc<BrokerState>,
    local_addr: SocketAddr,
    shutdown_tx: mpsc::UnboundedSender<()>,
}

impl ServerInstance {
    /// Bind the listener and start accepting client sessions.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        Self::bind_with_verifier(config, Arc::new(KeyMatchVerifier)).await
    }

    /// Bind with a custom signature verifier.
    pub async fn bind_with_verifier(
        config: ServerConfig,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.tcp_port))
            .await
            .context("failed to bind TCP listener")?;
        let local_addr = listener
            .local_addr()
            .context("listener has no local address")?;

        let state = BrokerState::start_with_verifier(config, verifier);
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();

        tracing::info!(%local_addr, "broker listening");

        tokio::spawn(accept_loop(listener, state.clone(), shutdown_rx));

        Ok(Self {
            state,
            local_addr,
            shutdown_tx,
        })
    }

    /// The bound listener address; useful with an ephemeral port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The broker state backing this instance.
    pub fn state(&self) -> Arc<BrokerState> {
        self.state.clone()
    }

    /// Stop accepting new sessions. Established sessions end with their
    /// transports.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Accept clients until shutdown, one session task per connection.
async fn accept_loop(
    listener: TcpListener,
    state: Arc<BrokerState>,
    mut shutdown_rx: mpsc::UnboundedReceiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "client connected");
                        let state = state.clone();
                        tokio::spawn(async move {
                            ClientSession::run(state, stream).await;
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::info!("listener shutting down");
                break;
            }
        }
    }
}

/// Run a broker until interrupted.
pub async fn run(config: ServerConfig) -> Result<()> {
    let server = ServerInstance::bind(config).await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("shutting down");
    server.shutdown();
    Ok(())
}
