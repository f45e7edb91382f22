//! In-process transport.
//!
//! Peers attached to the same [`MemoryHub`] reach each other without sockets.
//! Used by tests and by embedders that run several nodes in one process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tandem_core::PeerId;

use super::{ByteStreamConnection, ConnectionListener, TransferMode, Transport, TransportError};
use crate::protocol::TransferDescription;

/// Registry of attached in-process endpoints.
#[derive(Default)]
pub struct MemoryHub {
    endpoints: Mutex<HashMap<(PeerId, TransferMode), Arc<dyn ConnectionListener>>>,
    opened: AtomicUsize,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, peer: &PeerId, mode: TransferMode, listener: Arc<dyn ConnectionListener>) {
        self.endpoints.lock().insert((peer.clone(), mode), listener);
    }

    fn unregister(&self, peer: &PeerId, mode: TransferMode) {
        self.endpoints.lock().remove(&(peer.clone(), mode));
    }

    /// Number of connections opened through this hub.
    pub fn connections_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Open a connection from `from` to `to` and return `from`'s end. `to` is
    /// told about it as an incoming connection.
    pub fn open(
        &self,
        from: &PeerId,
        to: &PeerId,
        mode: TransferMode,
        connection_id: &str,
    ) -> Result<Arc<dyn ByteStreamConnection>, TransportError> {
        let (from_listener, to_listener) = {
            let endpoints = self.endpoints.lock();
            let from_listener = endpoints
                .get(&(from.clone(), mode))
                .cloned()
                .ok_or(TransportError::NotAttached)?;
            let to_listener = endpoints
                .get(&(to.clone(), mode))
                .cloned()
                .ok_or_else(|| TransportError::Unreachable(to.clone()))?;
            (from_listener, to_listener)
        };

        let outgoing = MemoryConnection::new(
            to,
            connection_id,
            mode,
            from_listener.clone(),
            to_listener.clone(),
        );
        let incoming = MemoryConnection::new(
            from,
            connection_id,
            mode,
            to_listener.clone(),
            from_listener,
        );
        outgoing.link(&incoming);
        self.opened.fetch_add(1, Ordering::SeqCst);

        log::debug!("memory connection `{connection_id}` {from} -> {to} ({mode})");
        to_listener.connection_changed(connection_id, from, incoming, true);
        Ok(outgoing)
    }
}

/// One end of an in-process connection. Closing either end closes both.
pub struct MemoryConnection {
    peer: PeerId,
    connection_id: String,
    mode: TransferMode,
    closed: AtomicBool,
    /// Told when this end closes.
    local_listener: Arc<dyn ConnectionListener>,
    /// Receives what this end sends.
    remote_listener: Arc<dyn ConnectionListener>,
    counterpart: OnceLock<Weak<MemoryConnection>>,
    this: Weak<MemoryConnection>,
}

impl MemoryConnection {
    fn new(
        peer: &PeerId,
        connection_id: &str,
        mode: TransferMode,
        local_listener: Arc<dyn ConnectionListener>,
        remote_listener: Arc<dyn ConnectionListener>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            peer: peer.clone(),
            connection_id: connection_id.to_string(),
            mode,
            closed: AtomicBool::new(false),
            local_listener,
            remote_listener,
            counterpart: OnceLock::new(),
            this: this.clone(),
        })
    }

    fn link(self: &Arc<Self>, other: &Arc<Self>) {
        let _ = self.counterpart.set(Arc::downgrade(other));
        let _ = other.counterpart.set(Arc::downgrade(self));
    }
}

#[async_trait]
impl ByteStreamConnection for MemoryConnection {
    fn peer(&self) -> &PeerId {
        &self.peer
    }

    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn mode(&self) -> TransferMode {
        self.mode
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    async fn send(
        &self,
        description: &TransferDescription,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::ConnectionClosed);
        }
        self.remote_listener.data_received(description.clone(), payload.to_vec());
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(this) = self.this.upgrade() {
            let this: Arc<dyn ByteStreamConnection> = this;
            self.local_listener.connection_closed(&self.connection_id, &self.peer, &this);
        }
        if let Some(other) = self.counterpart.get().and_then(Weak::upgrade) {
            if other.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            let other_dyn: Arc<dyn ByteStreamConnection> = other.clone();
            other
                .local_listener
                .connection_closed(&other.connection_id, &other.peer, &other_dyn);
        }
    }
}

/// Transport over a [`MemoryHub`].
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    mode: TransferMode,
    local: Mutex<Option<PeerId>>,
}

impl MemoryTransport {
    pub fn new(hub: Arc<MemoryHub>, mode: TransferMode) -> Self {
        Self {
            hub,
            mode,
            local: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(
        &self,
        connection_id: &str,
        peer: &PeerId,
    ) -> Result<Arc<dyn ByteStreamConnection>, TransportError> {
        let local = self.local.lock().clone().ok_or(TransportError::NotAttached)?;
        self.hub.open(&local, peer, self.mode, connection_id)
    }

    fn initialize(&self, local: &PeerId, listener: Arc<dyn ConnectionListener>) {
        self.hub.register(local, self.mode, listener);
        *self.local.lock() = Some(local.clone());
    }

    fn uninitialize(&self) {
        if let Some(local) = self.local.lock().take() {
            self.hub.unregister(&local, self.mode);
        }
    }

    fn mode(&self) -> TransferMode {
        self.mode
    }
}
