//! Wire protocol shared by all transports.
//!
//! Every transfer is a [`TransferDescription`] plus an opaque payload. The
//! payload is a bincode-encoded message selected by [`TransferKind`], optionally
//! lz4-compressed:
//!
//! ```text
//! ┌──────────────────────────────┬──────────────────────────────────────┐
//! │ TransferDescription          │ payload                              │
//! │ kind, sender, recipient,     │ ActivityPacket | NegotiationMessage  │
//! │ session id, compressed flag  │ | SessionControl   (bincode, lz4?)   │
//! └──────────────────────────────┴──────────────────────────────────────┘
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tandem_core::{ActivityData, ColorId, PeerId, ResourceId, User, UserRole};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("decompression error: {0}")]
    Decompression(String),
}

/// Payload type of a transfer, used to route incoming data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransferKind {
    /// An [`ActivityPacket`] for the activity sequencer.
    Activity = 1,
    /// A [`NegotiationMessage`] for a running negotiation.
    Negotiation = 2,
    /// A [`SessionControl`] message about session membership.
    SessionControl = 3,
    /// Application-defined payload.
    Custom = 4,
}

/// Metadata travelling with every payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDescription {
    pub kind: TransferKind,
    pub sender: PeerId,
    pub recipient: PeerId,
    pub session_id: Option<String>,
    pub compressed: bool,
}

impl TransferDescription {
    pub fn new(kind: TransferKind, sender: PeerId, recipient: PeerId) -> Self {
        Self {
            kind,
            sender,
            recipient,
            session_id: None,
            compressed: false,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Activities sent by one peer to another, numbered per (sender, recipient).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityPacket {
    pub session_id: String,
    pub sequence: u64,
    pub activities: Vec<ActivityData>,
}

/// A participant as announced by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub peer: PeerId,
    pub role: UserRole,
    pub color: Option<ColorId>,
}

impl From<&User> for ParticipantInfo {
    fn from(user: &User) -> Self {
        Self {
            peer: user.peer().clone(),
            role: user.role(),
            color: user.color(),
        }
    }
}

/// A resource offered to a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceOffering {
    pub resource_id: ResourceId,
    pub name: String,
    pub files: Vec<String>,
    pub size_hints: Vec<u64>,
}

/// Messages exchanged by negotiation processes. Every message names the
/// process it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationMessage {
    InvitationOffer {
        invitation_id: String,
        session_id: String,
        version: String,
        description: String,
    },
    InvitationAccepted {
        invitation_id: String,
    },
    SessionParameters {
        invitation_id: String,
        host_color: ColorId,
        client_color: Option<ColorId>,
        participants: Vec<ParticipantInfo>,
    },
    InvitationCompleted {
        invitation_id: String,
    },
    ResourceOffer {
        process_id: String,
        session_id: String,
        resources: Vec<ResourceOffering>,
    },
    ResourceAccepted {
        process_id: String,
    },
    Cancel {
        process_id: String,
        reason: Option<String>,
    },
}

impl NegotiationMessage {
    pub fn process_id(&self) -> &str {
        match self {
            NegotiationMessage::InvitationOffer { invitation_id, .. }
            | NegotiationMessage::InvitationAccepted { invitation_id }
            | NegotiationMessage::SessionParameters { invitation_id, .. }
            | NegotiationMessage::InvitationCompleted { invitation_id } => invitation_id,
            NegotiationMessage::ResourceOffer { process_id, .. }
            | NegotiationMessage::ResourceAccepted { process_id }
            | NegotiationMessage::Cancel { process_id, .. } => process_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            NegotiationMessage::InvitationOffer { .. } => "invitation offer",
            NegotiationMessage::InvitationAccepted { .. } => "invitation accepted",
            NegotiationMessage::SessionParameters { .. } => "session parameters",
            NegotiationMessage::InvitationCompleted { .. } => "invitation completed",
            NegotiationMessage::ResourceOffer { .. } => "resource offer",
            NegotiationMessage::ResourceAccepted { .. } => "resource accepted",
            NegotiationMessage::Cancel { .. } => "cancel",
        }
    }
}

/// Session membership changes announced outside of negotiations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionControl {
    /// Sent by the host to existing participants when someone joined.
    UserJoined(ParticipantInfo),
    /// Sent by the host to remaining participants when someone left.
    UserLeft(PeerId),
    /// Sent by a participant that leaves the session.
    Leave,
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Compress `payload` when it exceeds `threshold` bytes.
pub fn compress_if_large(payload: Vec<u8>, threshold: usize) -> (Vec<u8>, bool) {
    if payload.len() > threshold {
        (lz4_flex::compress_prepend_size(&payload), true)
    } else {
        (payload, false)
    }
}

pub fn decompress(payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    lz4_flex::decompress_size_prepended(payload)
        .map_err(|e| ProtocolError::Decompression(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::{JupiterTimestamp, Operation};

    fn peer(name: &str) -> PeerId {
        PeerId::parse(format!("{name}@example.org/tandem")).unwrap()
    }

    #[test]
    fn test_activity_packet_roundtrip() {
        let packet = ActivityPacket {
            session_id: "s1".into(),
            sequence: 7,
            activities: vec![ActivityData::Jupiter {
                source: peer("alice").to_string(),
                resource: ResourceId::new("r1"),
                path: "src/lib.rs".into(),
                timestamp: JupiterTimestamp { local: 3, remote: 1 },
                operation: Operation::split(Operation::delete(0, 2), Operation::insert(4, "é")),
            }],
        };
        let decoded: ActivityPacket = decode(&encode(&packet).unwrap()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_description_carries_session() {
        let description =
            TransferDescription::new(TransferKind::Activity, peer("alice"), peer("bob"))
                .with_session("s1");
        let decoded: TransferDescription = decode(&encode(&description).unwrap()).unwrap();
        assert_eq!(decoded.session_id.as_deref(), Some("s1"));
        assert_eq!(decoded.kind, TransferKind::Activity);
        assert!(!decoded.compressed);
    }

    #[test]
    fn test_decode_rejects_invalid_peer() {
        let bogus = encode(&String::from("not a peer")).unwrap();
        assert!(decode::<PeerId>(&bogus).is_err());
    }

    #[test]
    fn test_decode_garbage() {
        let result = decode::<NegotiationMessage>(&[0xFF, 0xFF, 0xFF]);
        assert!(matches!(result, Err(ProtocolError::Deserialization(_))));
    }

    #[test]
    fn test_process_id_routing_key() {
        let offer = NegotiationMessage::InvitationOffer {
            invitation_id: "inv-1".into(),
            session_id: "s1".into(),
            version: "0.1.0".into(),
            description: String::new(),
        };
        let cancel = NegotiationMessage::Cancel {
            process_id: "p-9".into(),
            reason: None,
        };
        assert_eq!(offer.process_id(), "inv-1");
        assert_eq!(cancel.process_id(), "p-9");
    }

    #[test]
    fn test_compression_threshold() {
        let small = vec![1u8; 16];
        let (out, compressed) = compress_if_large(small.clone(), 64);
        assert!(!compressed);
        assert_eq!(out, small);

        let large = vec![7u8; 4096];
        let (out, compressed) = compress_if_large(large.clone(), 64);
        assert!(compressed);
        assert!(out.len() < large.len());
        assert_eq!(decompress(&out).unwrap(), large);
    }

    #[test]
    fn test_decompress_garbage() {
        assert!(matches!(
            decompress(&[10, 0, 0, 0, 0xFF]),
            Err(ProtocolError::Decompression(_))
        ));
    }
}
