//! Pluggable byte-stream transports.
//!
//! A [`Transport`] establishes [`ByteStreamConnection`]s to peers. Inbound
//! connections, closed connections and received data are reported through the
//! [`ConnectionListener`] the transport was initialised with, normally the
//! [`manager::TransportManager`].

pub mod manager;
pub mod memory;
pub mod websocket;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tandem_core::PeerId;
use thiserror::Error;

use crate::protocol::{ProtocolError, TransferDescription};

pub use manager::{TransportManager, TransportManagerConfig, DEFAULT_CONNECTION_ID};

/// How the bytes of a connection reach the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// No connection.
    None,
    /// Peer-to-peer stream.
    Direct,
    /// Stream relayed through an intermediary.
    Relay,
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferMode::None => f.write_str("none"),
            TransferMode::Direct => f.write_str("direct"),
            TransferMode::Relay => f.write_str("relay"),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("no transports available")]
    NoTransports,
    #[error("transport manager is not attached to the network")]
    NotAttached,
    #[error("peer {0} is unreachable")]
    Unreachable(PeerId),
    #[error("could not connect to {peer}: {}", .failures.join("; "))]
    AllTransportsFailed { peer: PeerId, failures: Vec<String> },
    #[error("no connection to {peer} with id `{connection_id}`")]
    NoConnection { peer: PeerId, connection_id: String },
    #[error("connection to {peer} with id `{connection_id}` is stale")]
    StaleConnection { peer: PeerId, connection_id: String },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("timed out connecting to {0}")]
    Timeout(PeerId),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("i/o error: {0}")]
    Io(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A bidirectional stream to one peer.
#[async_trait]
pub trait ByteStreamConnection: Send + Sync {
    fn peer(&self) -> &PeerId;
    fn connection_id(&self) -> &str;
    fn mode(&self) -> TransferMode;
    fn is_connected(&self) -> bool;
    async fn send(
        &self,
        description: &TransferDescription,
        payload: &[u8],
    ) -> Result<(), TransportError>;
    /// Close the connection. Listeners are told through `connection_closed`;
    /// closing twice is a no-op.
    fn close(&self);
}

impl fmt::Debug for dyn ByteStreamConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteStreamConnection")
            .field("peer", self.peer())
            .field("connection_id", &self.connection_id())
            .field("mode", &self.mode())
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Callbacks from transports.
pub trait ConnectionListener: Send + Sync {
    /// A connection was established. `incoming` is true when the remote peer
    /// initiated it.
    fn connection_changed(
        &self,
        connection_id: &str,
        peer: &PeerId,
        connection: Arc<dyn ByteStreamConnection>,
        incoming: bool,
    );
    fn connection_closed(
        &self,
        connection_id: &str,
        peer: &PeerId,
        connection: &Arc<dyn ByteStreamConnection>,
    );
    fn data_received(&self, description: TransferDescription, payload: Vec<u8>);
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        connection_id: &str,
        peer: &PeerId,
    ) -> Result<Arc<dyn ByteStreamConnection>, TransportError>;
    /// Start accepting inbound connections for `local`.
    fn initialize(&self, local: &PeerId, listener: Arc<dyn ConnectionListener>);
    fn uninitialize(&self);
    fn mode(&self) -> TransferMode;
}
