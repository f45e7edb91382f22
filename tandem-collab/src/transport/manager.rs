//! Connection cache and transport selection.
//!
//! ```text
//!  connect(peer) ──▶ cache hit? ──yes──▶ canonical connection
//!                        │no
//!                        ▼
//!                 per-peer gate (one handshake per peer)
//!                        │
//!                        ▼
//!            main transport ──fail──▶ fallback transport ──fail──▶ error
//! ```
//!
//! The first connection registered for a peer, whether dialled locally or
//! accepted from the peer, becomes the canonical one and carries all outgoing
//! traffic. A connection that loses that race is kept as redundant: it still
//! delivers inbound data, is promoted when the canonical connection closes, and
//! is closed together with it on `close_connection`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Deserialize;
use tandem_core::PeerId;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use super::{ByteStreamConnection, ConnectionListener, TransferMode, Transport, TransportError};
use crate::events::same;
use crate::network::{ConnectionState, NetworkObserver};
use crate::protocol::TransferDescription;

pub const DEFAULT_CONNECTION_ID: &str = "default";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransportManagerConfig {
    /// Restrict connection attempts to transports of this mode.
    pub force_mode: Option<TransferMode>,
}

/// Data received on any connection, queued for the packet dispatcher.
#[derive(Debug, Clone)]
pub struct IncomingTransfer {
    pub description: TransferDescription,
    pub payload: Vec<u8>,
}

struct PeerConnections {
    canonical: Arc<dyn ByteStreamConnection>,
    redundant: Vec<Arc<dyn ByteStreamConnection>>,
}

pub struct TransportManager {
    local: PeerId,
    /// In priority order: main transport first.
    transports: Vec<Arc<dyn Transport>>,
    config: TransportManagerConfig,
    attached: AtomicBool,
    connections: Mutex<HashMap<PeerId, PeerConnections>>,
    connect_gates: Mutex<HashMap<PeerId, Arc<AsyncMutex<()>>>>,
    incoming_tx: mpsc::UnboundedSender<IncomingTransfer>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<IncomingTransfer>>>,
    this: Weak<TransportManager>,
}

impl TransportManager {
    pub fn new(
        local: PeerId,
        transports: Vec<Arc<dyn Transport>>,
        config: TransportManagerConfig,
    ) -> Arc<Self> {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|this| Self {
            local,
            transports,
            config,
            attached: AtomicBool::new(false),
            connections: Mutex::new(HashMap::new()),
            connect_gates: Mutex::new(HashMap::new()),
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
            this: this.clone(),
        })
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    /// Take the stream of received data. Only the first caller gets it.
    pub fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<IncomingTransfer>> {
        self.incoming_rx.lock().take()
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Initialise every transport so inbound connections are accepted.
    pub fn attach(&self) {
        if self.attached.swap(true, Ordering::AcqRel) {
            return;
        }
        let listener: Arc<dyn ConnectionListener> = Arc::new(ManagerListener {
            manager: self.this.clone(),
        });
        for transport in &self.transports {
            transport.initialize(&self.local, listener.clone());
        }
        log::info!("transport manager attached for {}", self.local);
    }

    /// Close every connection and shut the transports down.
    pub fn detach(&self) {
        if !self.attached.swap(false, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<PeerConnections> =
            self.connections.lock().drain().map(|(_, c)| c).collect();
        for entry in drained {
            close_all(entry);
        }
        self.connect_gates
            .lock()
            .retain(|_, gate| Arc::strong_count(gate) > 1);
        for transport in &self.transports {
            transport.uninitialize();
        }
        log::info!("transport manager detached for {}", self.local);
    }

    pub async fn connect(
        &self,
        peer: &PeerId,
    ) -> Result<Arc<dyn ByteStreamConnection>, TransportError> {
        self.connect_with_id(DEFAULT_CONNECTION_ID, peer).await
    }

    /// Return the cached connection to `peer` or establish one.
    ///
    /// Concurrent calls for the same peer perform a single handshake; calls
    /// for other peers are not blocked by it.
    pub async fn connect_with_id(
        &self,
        connection_id: &str,
        peer: &PeerId,
    ) -> Result<Arc<dyn ByteStreamConnection>, TransportError> {
        if !self.is_attached() {
            return Err(TransportError::NotAttached);
        }
        if let Some(connection) = self.cached(peer) {
            return Ok(connection);
        }

        let gate = self.gate(peer);
        let result = {
            let _guard = gate.lock().await;
            self.handshake(connection_id, peer).await
        };
        drop(gate);
        if result.is_err() {
            self.prune_gate(peer);
        }
        result
    }

    async fn handshake(
        &self,
        connection_id: &str,
        peer: &PeerId,
    ) -> Result<Arc<dyn ByteStreamConnection>, TransportError> {
        // Another caller, or the peer itself, may have connected meanwhile.
        if let Some(connection) = self.cached(peer) {
            return Ok(connection);
        }

        let candidates = self.candidates();
        if candidates.is_empty() {
            return Err(TransportError::NoTransports);
        }

        let mut failures = Vec::new();
        for transport in candidates {
            let mode = transport.mode();
            log::debug!("connecting to {peer} with {mode} transport");
            match transport.connect(connection_id, peer).await {
                Ok(connection) => {
                    log::info!("connected to {peer} using {mode} transport");
                    return Ok(self.register(peer, connection, false));
                }
                Err(e) => {
                    log::warn!("{mode} connection to {peer} failed: {e}");
                    failures.push(format!("{mode}: {e}"));
                }
            }
        }

        Err(TransportError::AllTransportsFailed {
            peer: peer.clone(),
            failures,
        })
    }

    /// Send over the connection with the given id to the description's recipient.
    pub async fn send_data(
        &self,
        connection_id: &str,
        description: &TransferDescription,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let peer = &description.recipient;
        let connection = self
            .cached_any(peer)
            .filter(|c| c.connection_id() == connection_id)
            .ok_or_else(|| TransportError::NoConnection {
                peer: peer.clone(),
                connection_id: connection_id.to_string(),
            })?;

        if !connection.is_connected() {
            return Err(TransportError::StaleConnection {
                peer: peer.clone(),
                connection_id: connection_id.to_string(),
            });
        }
        connection.send(description, payload).await
    }

    /// Send over the canonical connection to the description's recipient.
    pub async fn send(
        &self,
        description: &TransferDescription,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let peer = &description.recipient;
        let connection = self.cached(peer).ok_or_else(|| TransportError::NoConnection {
            peer: peer.clone(),
            connection_id: DEFAULT_CONNECTION_ID.to_string(),
        })?;
        connection.send(description, payload).await
    }

    /// Close every connection to `peer`, whichever side opened it.
    pub fn close_connection(&self, peer: &PeerId) -> bool {
        let removed = self.connections.lock().remove(peer);
        self.prune_gate(peer);
        match removed {
            Some(entry) => {
                log::debug!("closing connections to {peer}");
                close_all(entry);
                true
            }
            None => false,
        }
    }

    /// Mode of the connection used for sending to `peer`.
    pub fn transfer_mode(&self, peer: &PeerId) -> TransferMode {
        self.cached(peer).map_or(TransferMode::None, |c| c.mode())
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.cached(peer).is_some()
    }

    /// Number of connections held for `peer`, redundant ones included.
    pub fn connection_count(&self, peer: &PeerId) -> usize {
        self.connections
            .lock()
            .get(peer)
            .map_or(0, |entry| 1 + entry.redundant.len())
    }

    fn cached(&self, peer: &PeerId) -> Option<Arc<dyn ByteStreamConnection>> {
        self.cached_any(peer).filter(|c| c.is_connected())
    }

    fn cached_any(&self, peer: &PeerId) -> Option<Arc<dyn ByteStreamConnection>> {
        self.connections.lock().get(peer).map(|entry| entry.canonical.clone())
    }

    fn gate(&self, peer: &PeerId) -> Arc<AsyncMutex<()>> {
        self.connect_gates
            .lock()
            .entry(peer.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Forget the connect gate of `peer` unless a handshake is using it.
    fn prune_gate(&self, peer: &PeerId) {
        let mut gates = self.connect_gates.lock();
        if gates.get(peer).is_some_and(|gate| Arc::strong_count(gate) == 1) {
            gates.remove(peer);
        }
    }

    fn candidates(&self) -> Vec<Arc<dyn Transport>> {
        self.transports
            .iter()
            .filter(|t| self.config.force_mode.map_or(true, |mode| t.mode() == mode))
            .cloned()
            .collect()
    }

    /// Register a connection and return the canonical one for its peer.
    fn register(
        &self,
        peer: &PeerId,
        connection: Arc<dyn ByteStreamConnection>,
        incoming: bool,
    ) -> Arc<dyn ByteStreamConnection> {
        let mut connections = self.connections.lock();
        match connections.get_mut(peer) {
            Some(entry) if entry.canonical.is_connected() => {
                log::debug!(
                    "keeping {} connection to {peer} as redundant",
                    if incoming { "incoming" } else { "outgoing" }
                );
                entry.redundant.push(connection);
                entry.canonical.clone()
            }
            Some(entry) => {
                entry.canonical = connection.clone();
                connection
            }
            None => {
                connections.insert(
                    peer.clone(),
                    PeerConnections {
                        canonical: connection.clone(),
                        redundant: Vec::new(),
                    },
                );
                connection
            }
        }
    }

    fn on_connection_closed(&self, peer: &PeerId, connection: &Arc<dyn ByteStreamConnection>) {
        let mut connections = self.connections.lock();
        let Some(entry) = connections.get_mut(peer) else {
            return;
        };

        if same(&entry.canonical, connection) {
            entry.redundant.retain(|c| c.is_connected());
            if entry.redundant.is_empty() {
                connections.remove(peer);
                drop(connections);
                self.prune_gate(peer);
                log::debug!("last connection to {peer} closed");
            } else {
                log::debug!("promoting redundant connection to {peer}");
                entry.canonical = entry.redundant.remove(0);
            }
        } else {
            entry.redundant.retain(|c| !same(c, connection));
        }
    }
}

fn close_all(entry: PeerConnections) {
    entry.canonical.close();
    for connection in entry.redundant {
        connection.close();
    }
}

impl NetworkObserver for TransportManager {
    fn connection_state_changed(&self, state: ConnectionState) {
        match state {
            ConnectionState::Connected => self.attach(),
            ConnectionState::NotConnected | ConnectionState::Error => self.detach(),
            ConnectionState::Connecting | ConnectionState::Disconnecting => {}
        }
    }
}

struct ManagerListener {
    manager: Weak<TransportManager>,
}

impl ConnectionListener for ManagerListener {
    fn connection_changed(
        &self,
        connection_id: &str,
        peer: &PeerId,
        connection: Arc<dyn ByteStreamConnection>,
        incoming: bool,
    ) {
        let Some(manager) = self.manager.upgrade() else {
            connection.close();
            return;
        };
        if incoming {
            log::info!("accepted {} connection `{connection_id}` from {peer}", connection.mode());
            manager.register(peer, connection, true);
        }
    }

    fn connection_closed(
        &self,
        connection_id: &str,
        peer: &PeerId,
        connection: &Arc<dyn ByteStreamConnection>,
    ) {
        log::debug!("connection `{connection_id}` to {peer} closed");
        if let Some(manager) = self.manager.upgrade() {
            manager.on_connection_closed(peer, connection);
        }
    }

    fn data_received(&self, description: TransferDescription, payload: Vec<u8>) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        if manager
            .incoming_tx
            .send(IncomingTransfer { description, payload })
            .is_err()
        {
            log::debug!("dropping incoming data: nobody is listening");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::protocol::TransferKind;
    use crate::transport::memory::{MemoryHub, MemoryTransport};

    fn peer(name: &str) -> PeerId {
        PeerId::parse(format!("{name}@example.org/tandem")).unwrap()
    }

    /// A transport that always fails and counts attempts.
    struct FailingTransport {
        mode: TransferMode,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Transport for FailingTransport {
        async fn connect(
            &self,
            _connection_id: &str,
            peer: &PeerId,
        ) -> Result<Arc<dyn ByteStreamConnection>, TransportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Unreachable(peer.clone()))
        }

        fn initialize(&self, _local: &PeerId, _listener: Arc<dyn ConnectionListener>) {}

        fn uninitialize(&self) {}

        fn mode(&self) -> TransferMode {
            self.mode
        }
    }

    /// Wraps a transport and holds every handshake until released.
    struct GatedTransport {
        inner: Arc<MemoryTransport>,
        release: Notify,
        handshakes: AtomicUsize,
    }

    #[async_trait]
    impl Transport for GatedTransport {
        async fn connect(
            &self,
            connection_id: &str,
            peer: &PeerId,
        ) -> Result<Arc<dyn ByteStreamConnection>, TransportError> {
            self.handshakes.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            self.inner.connect(connection_id, peer).await
        }

        fn initialize(&self, local: &PeerId, listener: Arc<dyn ConnectionListener>) {
            self.inner.initialize(local, listener);
        }

        fn uninitialize(&self) {
            self.inner.uninitialize();
        }

        fn mode(&self) -> TransferMode {
            self.inner.mode()
        }
    }

    fn memory_manager(
        hub: &Arc<MemoryHub>,
        name: &str,
        modes: &[TransferMode],
        config: TransportManagerConfig,
    ) -> Arc<TransportManager> {
        let transports = modes
            .iter()
            .map(|mode| Arc::new(MemoryTransport::new(hub.clone(), *mode)) as Arc<dyn Transport>)
            .collect();
        let manager = TransportManager::new(peer(name), transports, config);
        manager.attach();
        manager
    }

    #[tokio::test]
    async fn test_connect_without_transports_fails() {
        let manager = TransportManager::new(
            peer("alice"),
            Vec::new(),
            TransportManagerConfig::default(),
        );
        manager.attach();
        let err = manager.connect(&peer("bob")).await.unwrap_err();
        assert!(matches!(err, TransportError::NoTransports));
    }

    #[tokio::test]
    async fn test_connect_requires_attach() {
        let hub = MemoryHub::new();
        let manager = TransportManager::new(
            peer("alice"),
            vec![Arc::new(MemoryTransport::new(hub, TransferMode::Direct)) as Arc<dyn Transport>],
            TransportManagerConfig::default(),
        );
        assert!(matches!(
            manager.connect(&peer("bob")).await,
            Err(TransportError::NotAttached)
        ));
    }

    #[tokio::test]
    async fn test_main_transport_preferred() {
        let hub = MemoryHub::new();
        let modes = [TransferMode::Direct, TransferMode::Relay];
        let alice = memory_manager(&hub, "alice", &modes, TransportManagerConfig::default());
        let _bob = memory_manager(&hub, "bob", &modes, TransportManagerConfig::default());

        alice.connect(&peer("bob")).await.unwrap();
        assert_eq!(alice.transfer_mode(&peer("bob")), TransferMode::Direct);
    }

    #[tokio::test]
    async fn test_fallback_when_main_fails() {
        let hub = MemoryHub::new();
        let failing = Arc::new(FailingTransport {
            mode: TransferMode::Direct,
            attempts: AtomicUsize::new(0),
        });
        let alice = TransportManager::new(
            peer("alice"),
            vec![
                failing.clone() as Arc<dyn Transport>,
                Arc::new(MemoryTransport::new(hub.clone(), TransferMode::Relay)),
            ],
            TransportManagerConfig::default(),
        );
        alice.attach();
        let _bob = memory_manager(
            &hub,
            "bob",
            &[TransferMode::Relay],
            TransportManagerConfig::default(),
        );

        alice.connect(&peer("bob")).await.unwrap();
        assert_eq!(failing.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(alice.transfer_mode(&peer("bob")), TransferMode::Relay);
    }

    #[tokio::test]
    async fn test_forced_mode_skips_main() {
        let hub = MemoryHub::new();
        let modes = [TransferMode::Direct, TransferMode::Relay];
        let alice = memory_manager(
            &hub,
            "alice",
            &modes,
            TransportManagerConfig {
                force_mode: Some(TransferMode::Relay),
            },
        );
        let _bob = memory_manager(&hub, "bob", &modes, TransportManagerConfig::default());

        alice.connect(&peer("bob")).await.unwrap();
        assert_eq!(alice.transfer_mode(&peer("bob")), TransferMode::Relay);
    }

    #[tokio::test]
    async fn test_all_transports_fail() {
        let hub = MemoryHub::new();
        let alice = memory_manager(
            &hub,
            "alice",
            &[TransferMode::Direct],
            TransportManagerConfig::default(),
        );
        let err = alice.connect(&peer("nobody")).await.unwrap_err();
        assert!(matches!(err, TransportError::AllTransportsFailed { .. }));
        assert_eq!(alice.transfer_mode(&peer("nobody")), TransferMode::None);
    }

    #[tokio::test]
    async fn test_connect_gates_are_released() {
        let hub = MemoryHub::new();
        let alice = memory_manager(
            &hub,
            "alice",
            &[TransferMode::Direct],
            TransportManagerConfig::default(),
        );
        let _bob = memory_manager(
            &hub,
            "bob",
            &[TransferMode::Direct],
            TransportManagerConfig::default(),
        );

        alice.connect(&peer("nobody")).await.unwrap_err();
        assert!(alice.connect_gates.lock().is_empty());

        alice.connect(&peer("bob")).await.unwrap();
        assert!(alice.close_connection(&peer("bob")));
        assert!(alice.connect_gates.lock().is_empty());

        alice.connect(&peer("bob")).await.unwrap();
        alice.detach();
        assert!(alice.connect_gates.lock().is_empty());
    }

    #[tokio::test]
    async fn test_connections_are_cached_per_peer() {
        let hub = MemoryHub::new();
        let alice = memory_manager(
            &hub,
            "alice",
            &[TransferMode::Direct],
            TransportManagerConfig::default(),
        );
        let _bob = memory_manager(
            &hub,
            "bob",
            &[TransferMode::Direct],
            TransportManagerConfig::default(),
        );
        let _carl = memory_manager(
            &hub,
            "carl",
            &[TransferMode::Direct],
            TransportManagerConfig::default(),
        );

        let first = alice.connect(&peer("bob")).await.unwrap();
        let second = alice.connect(&peer("bob")).await.unwrap();
        alice.connect(&peer("carl")).await.unwrap();

        assert!(same(&first, &second));
        assert_eq!(alice.connection_count(&peer("bob")), 1);
        assert_eq!(alice.connection_count(&peer("carl")), 1);
        assert_eq!(hub.connections_opened(), 2);
    }

    #[tokio::test]
    async fn test_unknown_peer_has_no_mode() {
        let manager = TransportManager::new(
            peer("alice"),
            Vec::new(),
            TransportManagerConfig::default(),
        );
        assert_eq!(manager.transfer_mode(&peer("bob")), TransferMode::None);
    }

    #[tokio::test]
    async fn test_send_data_checks_connection_id() {
        let hub = MemoryHub::new();
        let alice = memory_manager(
            &hub,
            "alice",
            &[TransferMode::Direct],
            TransportManagerConfig::default(),
        );
        let bob = memory_manager(
            &hub,
            "bob",
            &[TransferMode::Direct],
            TransportManagerConfig::default(),
        );
        let mut bob_rx = bob.take_incoming().unwrap();

        let description = TransferDescription::new(
            TransferKind::Custom,
            peer("alice"),
            peer("bob"),
        );

        let err = alice.send_data("foo", &description, b"x").await.unwrap_err();
        assert!(matches!(err, TransportError::NoConnection { .. }));

        alice.connect_with_id("foo", &peer("bob")).await.unwrap();
        let err = alice.send_data("bar", &description, b"x").await.unwrap_err();
        assert!(matches!(err, TransportError::NoConnection { .. }));

        alice.send_data("foo", &description, b"payload").await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(2), bob_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.payload, b"payload");
        assert_eq!(received.description.sender, peer("alice"));
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_handshake() {
        let hub = MemoryHub::new();
        let gated = Arc::new(GatedTransport {
            inner: Arc::new(MemoryTransport::new(hub.clone(), TransferMode::Direct)),
            release: Notify::new(),
            handshakes: AtomicUsize::new(0),
        });
        let alice = TransportManager::new(
            peer("alice"),
            vec![gated.clone() as Arc<dyn Transport>],
            TransportManagerConfig::default(),
        );
        alice.attach();
        let _bob = memory_manager(
            &hub,
            "bob",
            &[TransferMode::Direct],
            TransportManagerConfig::default(),
        );

        let first = tokio::spawn({
            let alice = alice.clone();
            async move { alice.connect(&peer("bob")).await }
        });
        let second = tokio::spawn({
            let alice = alice.clone();
            async move { alice.connect(&peer("bob")).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(gated.handshakes.load(Ordering::SeqCst), 1);
        gated.release.notify_one();

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert!(same(&first, &second));
        assert_eq!(gated.handshakes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_blocked_handshake_does_not_block_other_peers() {
        let hub = MemoryHub::new();
        let gated = Arc::new(GatedTransport {
            inner: Arc::new(MemoryTransport::new(hub.clone(), TransferMode::Direct)),
            release: Notify::new(),
            handshakes: AtomicUsize::new(0),
        });
        let alice = TransportManager::new(
            peer("alice"),
            vec![gated.clone() as Arc<dyn Transport>],
            TransportManagerConfig::default(),
        );
        alice.attach();
        let _bob = memory_manager(
            &hub,
            "bob",
            &[TransferMode::Direct],
            TransportManagerConfig::default(),
        );
        let carl = memory_manager(
            &hub,
            "carl",
            &[TransferMode::Direct],
            TransportManagerConfig::default(),
        );

        // carl dials alice, so alice holds a cached connection to carl.
        carl.connect(&peer("alice")).await.unwrap();
        assert!(alice.is_connected(&peer("carl")));

        let pending = tokio::spawn({
            let alice = alice.clone();
            async move { alice.connect(&peer("bob")).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let cached =
            tokio::time::timeout(Duration::from_millis(200), alice.connect(&peer("carl"))).await;
        assert!(cached.unwrap().is_ok());

        gated.release.notify_one();
        pending.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_remote_connection_is_reused() {
        let hub = MemoryHub::new();
        let alice = memory_manager(
            &hub,
            "alice",
            &[TransferMode::Direct],
            TransportManagerConfig::default(),
        );
        let bob = memory_manager(
            &hub,
            "bob",
            &[TransferMode::Direct],
            TransportManagerConfig::default(),
        );

        bob.connect(&peer("alice")).await.unwrap();
        alice.connect(&peer("bob")).await.unwrap();

        assert_eq!(hub.connections_opened(), 1);
        assert_eq!(alice.connection_count(&peer("bob")), 1);
    }

    #[tokio::test]
    async fn test_simultaneous_connect_keeps_one_canonical() {
        let hub = MemoryHub::new();
        let alice = memory_manager(
            &hub,
            "alice",
            &[TransferMode::Direct],
            TransportManagerConfig::default(),
        );
        let bob = memory_manager(
            &hub,
            "bob",
            &[TransferMode::Direct],
            TransportManagerConfig::default(),
        );
        let mut bob_rx = bob.take_incoming().unwrap();

        let (to_bob, to_alice) = (peer("bob"), peer("alice"));
        let (a, b) = tokio::join!(alice.connect(&to_bob), bob.connect(&to_alice));
        a.unwrap();
        b.unwrap();

        // Whichever connection won, sending works and reaches bob exactly once.
        let description = TransferDescription::new(
            TransferKind::Custom,
            peer("alice"),
            peer("bob"),
        );
        alice.send(&description, b"hello").await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(2), bob_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.payload, b"hello");
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_connection_closes_both_directions() {
        let hub = MemoryHub::new();
        let alice = memory_manager(
            &hub,
            "alice",
            &[TransferMode::Direct],
            TransportManagerConfig::default(),
        );
        let bob = memory_manager(
            &hub,
            "bob",
            &[TransferMode::Direct],
            TransportManagerConfig::default(),
        );

        let outgoing = alice.connect(&peer("bob")).await.unwrap();
        // A second, incoming connection from bob is kept as redundant.
        let incoming = hub
            .open(&peer("bob"), &peer("alice"), TransferMode::Direct, "extra")
            .unwrap();
        assert_eq!(alice.connection_count(&peer("bob")), 2);

        assert!(alice.close_connection(&peer("bob")));
        assert!(!outgoing.is_connected());
        assert!(!incoming.is_connected());
        assert_eq!(alice.transfer_mode(&peer("bob")), TransferMode::None);
        assert!(!bob.is_connected(&peer("alice")));
    }

    #[tokio::test]
    async fn test_not_connected_closes_everything() {
        let hub = MemoryHub::new();
        let alice = memory_manager(
            &hub,
            "alice",
            &[TransferMode::Direct],
            TransportManagerConfig::default(),
        );
        let _bob = memory_manager(
            &hub,
            "bob",
            &[TransferMode::Direct],
            TransportManagerConfig::default(),
        );
        let carl = memory_manager(
            &hub,
            "carl",
            &[TransferMode::Direct],
            TransportManagerConfig::default(),
        );

        let outgoing = alice.connect(&peer("bob")).await.unwrap();
        carl.connect(&peer("alice")).await.unwrap();

        alice.connection_state_changed(ConnectionState::NotConnected);

        assert!(!outgoing.is_connected());
        assert_eq!(alice.transfer_mode(&peer("bob")), TransferMode::None);
        assert_eq!(alice.transfer_mode(&peer("carl")), TransferMode::None);
        assert!(!carl.is_connected(&peer("alice")));
    }

    #[tokio::test]
    async fn test_redundant_connection_promoted_on_close() {
        let hub = MemoryHub::new();
        let alice = memory_manager(
            &hub,
            "alice",
            &[TransferMode::Direct],
            TransportManagerConfig::default(),
        );
        let _bob = memory_manager(
            &hub,
            "bob",
            &[TransferMode::Direct],
            TransportManagerConfig::default(),
        );

        let canonical = alice.connect(&peer("bob")).await.unwrap();
        let extra = hub.open(&peer("bob"), &peer("alice"), TransferMode::Direct, "extra").unwrap();

        canonical.close();
        assert!(alice.is_connected(&peer("bob")));
        assert_eq!(alice.connection_count(&peer("bob")), 1);

        extra.close();
        assert!(!alice.is_connected(&peer("bob")));
    }
}
