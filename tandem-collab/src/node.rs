//! Wiring of one collaborating peer.

use std::sync::Arc;

use tandem_core::PeerId;
use thiserror::Error;

use crate::config::{CollabConfig, ConfigError};
use crate::dispatch::PacketDispatcher;
use crate::manager::SessionManager;
use crate::network::NetworkService;
use crate::transmitter::Transmitter;
use crate::transport::websocket::WebSocketTransport;
use crate::transport::{Transport, TransportError, TransportManager};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A peer with its network state, transports, packet dispatch and session
/// manager connected to each other.
pub struct CollabNode {
    config: CollabConfig,
    network: Arc<NetworkService>,
    transports: Arc<TransportManager>,
    dispatcher: Arc<PacketDispatcher>,
    sessions: Arc<SessionManager>,
}

impl CollabNode {
    /// Build a node over `transports`, main transport first. Must be called
    /// within a runtime.
    pub fn new(
        config: CollabConfig,
        transports: Vec<Arc<dyn Transport>>,
    ) -> Result<Self, NodeError> {
        config.validate()?;

        let transports = TransportManager::new(
            config.local_peer.clone(),
            transports,
            config.transport.clone(),
        );
        let dispatcher = PacketDispatcher::new();
        if let Some(incoming) = transports.take_incoming() {
            dispatcher.start(incoming);
        }
        let transmitter = Transmitter::new(transports.clone(), config.compression_threshold);
        let sessions = SessionManager::new(config.clone(), transmitter, dispatcher.clone());

        let network = Arc::new(NetworkService::new());
        network.add_observer(transports.clone());
        network.add_observer(sessions.clone());

        log::info!("node {} ({}) ready", config.local_peer, config.nickname);
        Ok(Self {
            config,
            network,
            transports,
            dispatcher,
            sessions,
        })
    }

    /// Build a node whose only transport is a WebSocket transport configured
    /// from `config.websocket`.
    pub async fn with_websocket(
        config: CollabConfig,
    ) -> Result<(Self, Arc<WebSocketTransport>), NodeError> {
        let websocket = Arc::new(WebSocketTransport::bind(config.websocket.clone()).await?);
        let node = Self::new(config, vec![websocket.clone() as Arc<dyn Transport>])?;
        Ok((node, websocket))
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    pub fn local(&self) -> &PeerId {
        &self.config.local_peer
    }

    pub fn network(&self) -> &Arc<NetworkService> {
        &self.network
    }

    pub fn transports(&self) -> &Arc<TransportManager> {
        &self.transports
    }

    pub fn dispatcher(&self) -> &Arc<PacketDispatcher> {
        &self.dispatcher
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Go online. Transports start accepting connections.
    pub fn connect(&self) {
        self.network.connect();
    }

    /// Leave the current session, then go offline.
    pub async fn disconnect(&self) {
        self.sessions.stop_session().await;
        self.network.disconnect();
    }
}

impl Drop for CollabNode {
    fn drop(&mut self) {
        self.dispatcher.shutdown();
        self.transports.detach();
    }
}
