//! # tandem-collab — Session runtime for real-time collaborative editing
//!
//! Runs the sessions modelled by `tandem-core` over a peer-to-peer network.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐  lifecycle   ┌──────────────┐   activities   ┌───────────────────┐
//! │ SessionManager │ ───────────► │   Session    │ ─────────────► │ ActivitySequencer │
//! └───────┬────────┘              │ (OT client,  │ ◄───────────── └─────────┬─────────┘
//!         │ negotiations          │  host server)│                          │
//!         ▼                       └──────────────┘                          │
//! ┌────────────────┐                                                        │
//! │  Negotiations  │ ── Transmitter ──┐                 ┌── Transmitter ◄───┘
//! └────────────────┘                  ▼                 ▼
//!                               ┌──────────────────────────┐
//!                               │     TransportManager     │  one canonical
//!                               │ (websocket, memory, ...) │  connection per peer
//!                               └────────────┬─────────────┘
//!                                            ▼
//!                                    PacketDispatcher ──► by transfer kind
//! ```
//!
//! ## Modules
//!
//! - [`config`] — node configuration, loadable from TOML
//! - [`network`] — connectivity state and its observers
//! - [`transport`] — transports and the per-peer connection cache
//! - [`protocol`] — wire types, bincode encoding, lz4 compression
//! - [`dispatch`] — routing of received payloads by kind
//! - [`transmitter`] — typed sending over the transport manager
//! - [`sequencer`] — ordered, deduplicated activity delivery
//! - [`session`] — participants, resources and activity processing
//! - [`negotiation`] — invitation and resource-sharing handshakes
//! - [`manager`] — session lifecycle
//! - [`node`] — everything above wired together

pub mod config;
pub mod dispatch;
pub mod events;
pub mod host_alone;
pub mod manager;
pub mod negotiation;
pub mod network;
pub mod node;
pub mod protocol;
pub mod sequencer;
pub mod session;
pub mod transmitter;
pub mod transport;

pub use config::{CollabConfig, ConfigError, HostLeftAlonePolicy};
pub use dispatch::{DispatchStats, IncomingPacket, PacketDispatcher};
pub use events::ListenerRegistry;
pub use host_alone::HostLeftAloneHandler;
pub use manager::{SessionListener, SessionManager, SessionState};
pub use negotiation::{
    AutoAcceptHandler, CancelOption, IncomingProjectNegotiation, IncomingSessionNegotiation,
    Negotiation, NegotiationError, NegotiationHandler, NegotiationKind, NegotiationState,
    OutgoingProjectNegotiation, OutgoingSessionNegotiation, Progress,
};
pub use network::{ConnectionState, NetworkObserver, NetworkService};
pub use node::{CollabNode, NodeError};
pub use protocol::{
    ActivityPacket, NegotiationMessage, ParticipantInfo, ProtocolError, ResourceOffering,
    SessionControl, TransferDescription, TransferKind,
};
pub use sequencer::{ActivitySequencer, ActivitySink, SequencerError};
pub use session::{ActivityExecutor, Session, SessionError, SharedSessionListener};
pub use transmitter::Transmitter;
pub use transport::memory::{MemoryHub, MemoryTransport};
pub use transport::websocket::{WebSocketConfig, WebSocketTransport};
pub use transport::{
    ByteStreamConnection, ConnectionListener, TransferMode, Transport, TransportError,
    TransportManager, TransportManagerConfig,
};
