//! Typed sending on top of the transport manager.

use std::sync::Arc;

use serde::Serialize;
use tandem_core::PeerId;

use crate::protocol::{
    compress_if_large, encode, ActivityPacket, NegotiationMessage, SessionControl,
    TransferDescription, TransferKind,
};
use crate::transport::{TransportError, TransportManager};

/// Encodes messages, compresses large payloads and sends them over the
/// canonical connection to the recipient, connecting first if needed.
#[derive(Clone)]
pub struct Transmitter {
    transports: Arc<TransportManager>,
    compression_threshold: usize,
}

impl Transmitter {
    pub fn new(transports: Arc<TransportManager>, compression_threshold: usize) -> Self {
        Self {
            transports,
            compression_threshold,
        }
    }

    pub fn local(&self) -> &PeerId {
        self.transports.local()
    }

    pub fn transports(&self) -> &Arc<TransportManager> {
        &self.transports
    }

    pub async fn send(
        &self,
        recipient: &PeerId,
        kind: TransferKind,
        session_id: Option<&str>,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        let connection = self.transports.connect(recipient).await?;
        let (payload, compressed) = compress_if_large(payload, self.compression_threshold);

        let mut description = TransferDescription::new(
            kind,
            self.local().clone(),
            recipient.clone(),
        );
        description.session_id = session_id.map(str::to_string);
        description.compressed = compressed;

        log::trace!("sending {kind:?} to {recipient} ({} bytes)", payload.len());
        // Fails if the connection was closed or replaced since `connect`.
        self.transports
            .send_data(connection.connection_id(), &description, &payload)
            .await
    }

    async fn send_message<T: Serialize>(
        &self,
        recipient: &PeerId,
        kind: TransferKind,
        session_id: Option<&str>,
        message: &T,
    ) -> Result<(), TransportError> {
        let payload = encode(message)?;
        self.send(recipient, kind, session_id, payload).await
    }

    pub async fn send_negotiation(
        &self,
        recipient: &PeerId,
        message: &NegotiationMessage,
    ) -> Result<(), TransportError> {
        log::debug!("-> {recipient}: {} [{}]", message.name(), message.process_id());
        self.send_message(recipient, TransferKind::Negotiation, None, message).await
    }

    pub async fn send_activities(
        &self,
        recipient: &PeerId,
        packet: &ActivityPacket,
    ) -> Result<(), TransportError> {
        self.send_message(recipient, TransferKind::Activity, Some(&packet.session_id), packet)
            .await
    }

    pub async fn send_control(
        &self,
        recipient: &PeerId,
        session_id: &str,
        control: &SessionControl,
    ) -> Result<(), TransportError> {
        self.send_message(recipient, TransferKind::SessionControl, Some(session_id), control)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::protocol::decode;
    use crate::transport::memory::{MemoryHub, MemoryTransport};
    use crate::transport::{TransferMode, Transport, TransportManagerConfig};

    fn peer(name: &str) -> PeerId {
        PeerId::parse(format!("{name}@example.org/tandem")).unwrap()
    }

    fn manager(hub: &Arc<MemoryHub>, name: &str) -> Arc<TransportManager> {
        let transport =
            Arc::new(MemoryTransport::new(hub.clone(), TransferMode::Direct)) as Arc<dyn Transport>;
        let manager = TransportManager::new(
            peer(name),
            vec![transport],
            TransportManagerConfig::default(),
        );
        manager.attach();
        manager
    }

    #[tokio::test]
    async fn test_negotiation_message_arrives_decoded() {
        let hub = MemoryHub::new();
        let alice = Transmitter::new(manager(&hub, "alice"), 1024);
        let bob = manager(&hub, "bob");
        let mut incoming = bob.take_incoming().unwrap();

        let message = NegotiationMessage::InvitationAccepted {
            invitation_id: "inv-1".into(),
        };
        alice.send_negotiation(&peer("bob"), &message).await.unwrap();

        let transfer = tokio::time::timeout(Duration::from_secs(1), incoming.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(transfer.description.kind, TransferKind::Negotiation);
        assert!(!transfer.description.compressed);
        assert_eq!(decode::<NegotiationMessage>(&transfer.payload).unwrap(), message);
    }

    #[tokio::test]
    async fn test_large_payload_is_compressed() {
        let hub = MemoryHub::new();
        let alice = Transmitter::new(manager(&hub, "alice"), 16);
        let bob = manager(&hub, "bob");
        let mut incoming = bob.take_incoming().unwrap();

        alice
            .send(&peer("bob"), TransferKind::Custom, Some("s1"), vec![0u8; 512])
            .await
            .unwrap();

        let transfer = incoming.recv().await.unwrap();
        assert!(transfer.description.compressed);
        assert_eq!(transfer.description.session_id.as_deref(), Some("s1"));
        assert!(transfer.payload.len() < 512);
    }

    #[tokio::test]
    async fn test_sends_over_connection_opened_by_peer() {
        let hub = MemoryHub::new();
        let alice_transports = manager(&hub, "alice");
        let alice = Transmitter::new(alice_transports.clone(), 1024);
        let bob = manager(&hub, "bob");
        let mut incoming = bob.take_incoming().unwrap();

        // bob dialled first, under a non-default id; alice reuses that connection.
        let _from_bob = hub
            .open(&peer("bob"), &peer("alice"), TransferMode::Direct, "from-bob")
            .unwrap();
        alice
            .send_control(&peer("bob"), "s1", &SessionControl::Leave)
            .await
            .unwrap();

        let transfer = incoming.recv().await.unwrap();
        assert_eq!(transfer.description.kind, TransferKind::SessionControl);
        assert_eq!(hub.connections_opened(), 1);
        assert_eq!(alice_transports.connection_count(&peer("bob")), 1);
    }

    #[tokio::test]
    async fn test_unreachable_recipient() {
        let hub = MemoryHub::new();
        let alice = Transmitter::new(manager(&hub, "alice"), 1024);
        let result = alice
            .send_control(&peer("nobody"), "s1", &SessionControl::Leave)
            .await;
        assert!(matches!(result, Err(TransportError::AllTransportsFailed { .. })));
    }
}
