use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tandem_core::PeerId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::dispatch::IncomingPacket;
use crate::manager::SessionManager;
use crate::protocol::{decode, NegotiationMessage};
use crate::transmitter::Transmitter;

/// Routes negotiation messages to running negotiations and turns offers into
/// new ones.
///
/// While a session exists or an invitation is being handled, further
/// invitations are declined right away.
pub(crate) struct NegotiationPacketListener {
    manager: Weak<SessionManager>,
    transmitter: Transmitter,
    version: String,
    reject_invitations: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NegotiationPacketListener {
    pub(crate) fn new(
        manager: Weak<SessionManager>,
        transmitter: Transmitter,
        version: String,
    ) -> Self {
        Self {
            manager,
            transmitter,
            version,
            reject_invitations: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }

    pub(crate) fn start(self: &Arc<Self>, mut incoming: mpsc::UnboundedReceiver<IncomingPacket>) {
        let listener = Arc::downgrade(self);
        let worker = tokio::spawn(async move {
            while let Some(packet) = incoming.recv().await {
                let Some(listener) = listener.upgrade() else {
                    break;
                };
                listener.handle(packet);
            }
        });
        if let Some(previous) = self.worker.lock().replace(worker) {
            previous.abort();
        }
    }

    pub(crate) fn stop(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }

    pub(crate) fn set_reject_invitations(&self, reject: bool) {
        self.reject_invitations.store(reject, Ordering::Release);
    }

    pub(crate) fn is_rejecting_invitations(&self) -> bool {
        self.reject_invitations.load(Ordering::Acquire)
    }

    fn handle(&self, packet: IncomingPacket) {
        let sender = packet.description.sender;
        let message: NegotiationMessage = match decode(&packet.payload) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("malformed negotiation message from {sender}: {e}");
                return;
            }
        };
        log::debug!("<- {sender}: {} [{}]", message.name(), message.process_id());

        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        if let Some(negotiation) = manager.find_negotiation(&sender, message.process_id()) {
            negotiation.deliver(message);
            return;
        }

        match message {
            NegotiationMessage::InvitationOffer {
                invitation_id,
                session_id,
                version,
                description,
            } => {
                if version != self.version {
                    let reason = format!(
                        "incompatible version {version}, expected {}",
                        self.version
                    );
                    self.decline(sender, invitation_id, reason);
                    return;
                }
                if self.reject_invitations.swap(true, Ordering::AcqRel) {
                    self.decline(sender, invitation_id, String::from("already in a session"));
                    return;
                }
                if !manager.invitation_received(sender, invitation_id, session_id, description) {
                    self.reject_invitations.store(false, Ordering::Release);
                }
            }
            NegotiationMessage::ResourceOffer {
                process_id,
                session_id,
                resources,
            } => manager.incoming_project_received(sender, process_id, session_id, resources),
            NegotiationMessage::Cancel { process_id, .. } => {
                log::debug!("cancel from {sender} for unknown negotiation {process_id}");
            }
            other => {
                log::warn!(
                    "{} from {sender} for unknown negotiation {}",
                    other.name(),
                    other.process_id()
                );
            }
        }
    }

    fn decline(&self, peer: PeerId, process_id: String, reason: String) {
        log::info!("declining invitation {process_id} from {peer}: {reason}");
        let transmitter = self.transmitter.clone();
        tokio::spawn(async move {
            let cancel = NegotiationMessage::Cancel {
                process_id,
                reason: Some(reason),
            };
            if let Err(e) = transmitter.send_negotiation(&peer, &cancel).await {
                log::debug!("could not decline invitation from {peer}: {e}");
            }
        });
    }
}

impl Drop for NegotiationPacketListener {
    fn drop(&mut self) {
        self.stop();
    }
}
