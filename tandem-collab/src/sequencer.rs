//! Ordered activity delivery between session participants.
//!
//! ```text
//!  send_activity ──▶ outgoing queue ──▶ send worker ──┬─▶ loopback (local recipient)
//!                                                     └─▶ ActivityPacket { seq } ──▶ peer
//!
//!  peer ──▶ dispatcher ──▶ receive worker ──▶ reorder buffer ──▶ ActivitySink::exec
//! ```
//!
//! Packets are numbered per (sender, recipient). The receiver delivers them in
//! sequence order, buffering early packets and discarding duplicates.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tandem_core::{ActivityData, PeerId};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::dispatch::IncomingPacket;
use crate::protocol::{decode, ActivityPacket};
use crate::transmitter::Transmitter;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequencerError {
    #[error("activity has no recipients")]
    EmptyRecipients,
    #[error("activity sequencer is not running")]
    NotRunning,
}

/// Receives activities in the order their sender produced them.
pub trait ActivitySink: Send + Sync {
    fn exec(&self, sender: &PeerId, activities: Vec<ActivityData>);
}

struct Outgoing {
    recipient: PeerId,
    activities: Vec<ActivityData>,
}

#[derive(Default)]
struct Inbound {
    expected: u64,
    early: BTreeMap<u64, Vec<ActivityData>>,
}

pub struct ActivitySequencer {
    session_id: String,
    transmitter: Transmitter,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Outgoing>>>,
    next_sequence: Mutex<HashMap<PeerId, u64>>,
    inbound: Mutex<HashMap<PeerId, Inbound>>,
    sink: RwLock<Option<Weak<dyn ActivitySink>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ActivitySequencer {
    pub fn new(session_id: impl Into<String>, transmitter: Transmitter) -> Arc<Self> {
        Arc::new(Self {
            session_id: session_id.into(),
            transmitter,
            outgoing: Mutex::new(None),
            next_sequence: Mutex::new(HashMap::new()),
            inbound: Mutex::new(HashMap::new()),
            sink: RwLock::new(None),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn is_running(&self) -> bool {
        self.outgoing.lock().is_some()
    }

    /// Start the send and receive workers. Must be called within a runtime.
    pub fn start(
        self: &Arc<Self>,
        sink: Weak<dyn ActivitySink>,
        incoming: mpsc::UnboundedReceiver<IncomingPacket>,
    ) {
        let mut outgoing = self.outgoing.lock();
        if outgoing.is_some() {
            log::warn!("activity sequencer for session {} already running", self.session_id);
            return;
        }
        *self.sink.write() = Some(sink);

        let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();
        *outgoing = Some(tx);
        drop(outgoing);

        let this = Arc::downgrade(self);
        let sender = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                let Some(sequencer) = this.upgrade() else {
                    break;
                };
                sequencer.transmit(item).await;
            }
        });

        let this = Arc::downgrade(self);
        let mut incoming = incoming;
        let receiver = tokio::spawn(async move {
            while let Some(packet) = incoming.recv().await {
                let Some(sequencer) = this.upgrade() else {
                    break;
                };
                sequencer.receive(packet);
            }
        });

        self.workers.lock().extend([sender, receiver]);
        log::debug!("activity sequencer for session {} started", self.session_id);
    }

    /// Stop both workers. Queued but unsent activities are discarded.
    pub fn stop(&self) {
        self.outgoing.lock().take();
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }
        self.sink.write().take();
        log::debug!("activity sequencer for session {} stopped", self.session_id);
    }

    /// Queue `activity` for every recipient. Never blocks.
    pub fn send_activity(
        &self,
        recipients: &[PeerId],
        activity: ActivityData,
    ) -> Result<(), SequencerError> {
        if recipients.is_empty() {
            log::error!("refusing to send activity without recipients: {activity:?}");
            return Err(SequencerError::EmptyRecipients);
        }
        let outgoing = self.outgoing.lock();
        let tx = outgoing.as_ref().ok_or(SequencerError::NotRunning)?;
        for recipient in recipients {
            let item = Outgoing {
                recipient: recipient.clone(),
                activities: vec![activity.clone()],
            };
            tx.send(item).map_err(|_| SequencerError::NotRunning)?;
        }
        Ok(())
    }

    /// Forget ordering state for a peer that left.
    pub fn user_left(&self, peer: &PeerId) {
        self.next_sequence.lock().remove(peer);
        self.inbound.lock().remove(peer);
    }

    async fn transmit(&self, item: Outgoing) {
        if item.recipient == *self.transmitter.local() {
            let local = item.recipient;
            self.deliver(&local, item.activities);
            return;
        }

        let sequence = {
            let mut next = self.next_sequence.lock();
            let counter = next.entry(item.recipient.clone()).or_insert(0);
            let sequence = *counter;
            *counter += 1;
            sequence
        };
        let packet = ActivityPacket {
            session_id: self.session_id.clone(),
            sequence,
            activities: item.activities,
        };
        if let Err(e) = self.transmitter.send_activities(&item.recipient, &packet).await {
            log::warn!("failed to send activity #{sequence} to {}: {e}", item.recipient);
        }
    }

    /// Accept a packet from the network and deliver everything now in order.
    pub fn receive(&self, packet: IncomingPacket) {
        let sender = packet.description.sender;
        let decoded: ActivityPacket = match decode(&packet.payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::warn!("dropping activity packet from {sender}: {e}");
                return;
            }
        };
        if decoded.session_id != self.session_id {
            log::debug!(
                "dropping activity packet from {sender} for session {} (current {})",
                decoded.session_id,
                self.session_id
            );
            return;
        }

        let ready = {
            let mut inbound = self.inbound.lock();
            let state = inbound.entry(sender.clone()).or_default();
            if decoded.sequence < state.expected || state.early.contains_key(&decoded.sequence) {
                log::debug!("discarding duplicate activity #{} from {sender}", decoded.sequence);
                return;
            }
            state.early.insert(decoded.sequence, decoded.activities);

            let mut ready = Vec::new();
            while let Some(activities) = state.early.remove(&state.expected) {
                ready.push(activities);
                state.expected += 1;
            }
            if !state.early.is_empty() {
                log::trace!(
                    "holding {} early packet(s) from {sender}, waiting for #{}",
                    state.early.len(),
                    state.expected
                );
            }
            ready
        };

        for activities in ready {
            self.deliver(&sender, activities);
        }
    }

    fn deliver(&self, sender: &PeerId, activities: Vec<ActivityData>) {
        let sink = self.sink.read().as_ref().and_then(Weak::upgrade);
        match sink {
            Some(sink) => sink.exec(sender, activities),
            None => log::debug!("no sink for activities from {sender}"),
        }
    }
}

impl Drop for ActivitySequencer {
    fn drop(&mut self) {
        for worker in self.workers.get_mut().drain(..) {
            worker.abort();
        }
    }
}
