//! Direct peer-to-peer transport over WebSockets.
//!
//! The dialling side sends a `Hello` frame naming itself; afterwards both
//! sides exchange `Data` frames carrying a transfer description and payload.
//! Peers are reached through a configured address book (`peer → ws://…`).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tandem_core::PeerId;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::{ByteStreamConnection, ConnectionListener, TransferMode, Transport, TransportError};
use crate::protocol::{decode, encode, TransferDescription};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Address to accept connections on; `None` disables inbound connections.
    pub bind_addr: Option<String>,
    /// Where to reach known peers.
    pub peers: HashMap<PeerId, String>,
    /// Frames buffered per connection before senders wait.
    pub outgoing_capacity: usize,
    /// Upper bound for dialling a peer, WebSocket upgrade and `Hello` included.
    pub connect_timeout_ms: u64,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            bind_addr: None,
            peers: HashMap::new(),
            outgoing_capacity: 256,
            connect_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum Frame {
    Hello { peer: PeerId, connection_id: String },
    Data { description: TransferDescription, payload: Vec<u8> },
}

struct Attached {
    local: PeerId,
    listener: Arc<dyn ConnectionListener>,
    accept_task: Option<JoinHandle<()>>,
}

pub struct WebSocketTransport {
    addresses: RwLock<HashMap<PeerId, String>>,
    capacity: usize,
    connect_timeout: Duration,
    tcp: Option<Arc<TcpListener>>,
    state: Mutex<Option<Attached>>,
}

impl WebSocketTransport {
    /// Create the transport, binding the listening socket if configured.
    pub async fn bind(config: WebSocketConfig) -> Result<Self, TransportError> {
        let tcp = match &config.bind_addr {
            Some(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .map_err(|e| TransportError::Io(format!("bind {addr}: {e}")))?;
                log::info!("websocket transport listening on {addr}");
                Some(Arc::new(listener))
            }
            None => None,
        };

        Ok(Self {
            addresses: RwLock::new(config.peers),
            capacity: config.outgoing_capacity.max(1),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            tcp,
            state: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().and_then(|tcp| tcp.local_addr().ok())
    }

    /// URL other peers can use to reach this transport.
    pub fn url(&self) -> Option<String> {
        self.local_addr().map(|addr| format!("ws://{addr}"))
    }

    pub fn add_peer(&self, peer: PeerId, url: impl Into<String>) {
        self.addresses.write().insert(peer, url.into());
    }

    fn attached(&self) -> Result<(PeerId, Arc<dyn ConnectionListener>), TransportError> {
        self.state
            .lock()
            .as_ref()
            .map(|state| (state.local.clone(), state.listener.clone()))
            .ok_or(TransportError::NotAttached)
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(Attached { accept_task: Some(task), .. }) = self.state.get_mut().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(
        &self,
        connection_id: &str,
        peer: &PeerId,
    ) -> Result<Arc<dyn ByteStreamConnection>, TransportError> {
        let (local, listener) = self.attached()?;
        let url = self
            .addresses
            .read()
            .get(peer)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(peer.clone()))?;

        let hello = encode(&Frame::Hello {
            peer: local,
            connection_id: connection_id.to_string(),
        })?;
        let dial = async {
            let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| TransportError::Io(format!("{url}: {e}")))?;
            ws.send(Message::Binary(hello.into()))
                .await
                .map_err(|e| TransportError::Handshake(e.to_string()))?;
            Ok::<_, TransportError>(ws)
        };
        let ws = tokio::time::timeout(self.connect_timeout, dial)
            .await
            .map_err(|_| TransportError::Timeout(peer.clone()))??;

        log::debug!("websocket connection `{connection_id}` to {peer} at {url}");
        Ok(WebSocketConnection::spawn(
            peer.clone(),
            connection_id.to_string(),
            ws,
            listener,
            self.capacity,
        ))
    }

    fn initialize(&self, local: &PeerId, listener: Arc<dyn ConnectionListener>) {
        let accept_task = match (&self.tcp, tokio::runtime::Handle::try_current()) {
            (Some(tcp), Ok(runtime)) => Some(runtime.spawn(accept_loop(
                tcp.clone(),
                listener.clone(),
                self.capacity,
            ))),
            (Some(_), Err(e)) => {
                log::error!("cannot accept websocket connections outside a runtime: {e}");
                None
            }
            (None, _) => None,
        };

        let previous = self.state.lock().replace(Attached {
            local: local.clone(),
            listener,
            accept_task,
        });
        if let Some(Attached { accept_task: Some(task), .. }) = previous {
            task.abort();
        }
    }

    fn uninitialize(&self) {
        if let Some(Attached { accept_task: Some(task), .. }) = self.state.lock().take() {
            task.abort();
        }
    }

    fn mode(&self) -> TransferMode {
        TransferMode::Direct
    }
}

async fn accept_loop(
    tcp: Arc<TcpListener>,
    listener: Arc<dyn ConnectionListener>,
    capacity: usize,
) {
    loop {
        match tcp.accept().await {
            Ok((stream, addr)) => {
                log::debug!("new TCP connection from {addr}");
                tokio::spawn(handle_incoming(stream, listener.clone(), capacity));
            }
            Err(e) => log::warn!("accept failed: {e}"),
        }
    }
}

async fn handle_incoming(
    stream: TcpStream,
    listener: Arc<dyn ConnectionListener>,
    capacity: usize,
) {
    let mut ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            log::warn!("websocket handshake failed: {e}");
            return;
        }
    };

    let hello = match tokio::time::timeout(HANDSHAKE_TIMEOUT, ws.next()).await {
        Ok(Some(Ok(Message::Binary(data)))) => {
            let bytes: Vec<u8> = data.into();
            decode::<Frame>(&bytes)
        }
        Ok(other) => {
            log::warn!("expected hello frame, got {other:?}");
            return;
        }
        Err(_) => {
            log::warn!("peer did not introduce itself within {HANDSHAKE_TIMEOUT:?}");
            return;
        }
    };

    match hello {
        Ok(Frame::Hello { peer, connection_id }) => {
            let connection =
                WebSocketConnection::spawn(
                    peer.clone(),
                    connection_id.clone(),
                    ws,
                    listener.clone(),
                    capacity,
                );
            listener.connection_changed(&connection_id, &peer, connection, true);
        }
        Ok(Frame::Data { .. }) => log::warn!("data frame received before hello"),
        Err(e) => log::warn!("malformed hello frame: {e}"),
    }
}

pub struct WebSocketConnection {
    peer: PeerId,
    connection_id: String,
    outgoing: mpsc::Sender<Message>,
    closed: AtomicBool,
    listener: Arc<dyn ConnectionListener>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    this: Weak<WebSocketConnection>,
}

impl WebSocketConnection {
    fn spawn<S>(
        peer: PeerId,
        connection_id: String,
        ws: WebSocketStream<S>,
        listener: Arc<dyn ConnectionListener>,
        capacity: usize,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut writer, mut reader) = ws.split();
        let (outgoing, mut outgoing_rx) = mpsc::channel::<Message>(capacity);

        let connection = Arc::new_cyclic(|this| Self {
            peer,
            connection_id,
            outgoing,
            closed: AtomicBool::new(false),
            listener: listener.clone(),
            reader_task: Mutex::new(None),
            this: this.clone(),
        });

        // Writer task: forward the outgoing channel to the socket
        tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if writer.send(message).await.is_err() || closing {
                    break;
                }
            }
            let _ = writer.close().await;
        });

        // Reader task: hand data frames to the listener
        let weak = Arc::downgrade(&connection);
        let reader_task = tokio::spawn(async move {
            while let Some(message) = reader.next().await {
                match message {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match decode::<Frame>(&bytes) {
                            Ok(Frame::Data { description, payload }) => {
                                listener.data_received(description, payload)
                            }
                            Ok(Frame::Hello { .. }) => log::debug!("ignoring repeated hello"),
                            Err(e) => log::warn!("malformed frame: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            if let Some(connection) = weak.upgrade() {
                connection.mark_closed();
            }
        });
        *connection.reader_task.lock() = Some(reader_task);

        connection
    }

    fn mark_closed(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(this) = self.this.upgrade() {
            let this: Arc<dyn ByteStreamConnection> = this;
            self.listener
                .connection_closed(&self.connection_id, &self.peer, &this);
        }
    }
}

#[async_trait]
impl ByteStreamConnection for WebSocketConnection {
    fn peer(&self) -> &PeerId {
        &self.peer
    }

    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn mode(&self) -> TransferMode {
        TransferMode::Direct
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
        let frame = encode(&Frame::Data {
            description: description.clone(),
            payload: payload.to_vec(),
        })?;
        self.outgoing
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn close(&self) {
        if !self.is_connected() {
            return;
        }
        let _ = self.outgoing.try_send(Message::Close(None));
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
        self.mark_closed();
    }
}
