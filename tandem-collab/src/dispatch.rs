//! Routes received transfers to subscribers by [`TransferKind`].
//!
//! The transport manager funnels every received payload into one channel.
//! A single worker drains it, decompresses payloads and hands a copy to each
//! subscriber of the payload's kind. Subscribers whose receiver was dropped
//! are pruned on the next delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::{decompress, TransferDescription, TransferKind};
use crate::transport::manager::IncomingTransfer;

/// A received transfer with its payload already decompressed.
#[derive(Debug, Clone)]
pub struct IncomingPacket {
    pub description: TransferDescription,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub received: u64,
    pub delivered: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct AtomicDispatchStats {
    received: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Default)]
pub struct PacketDispatcher {
    subscribers: Mutex<HashMap<TransferKind, Vec<mpsc::UnboundedSender<IncomingPacket>>>>,
    stats: AtomicDispatchStats,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PacketDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(&self, kind: TransferKind) -> mpsc::UnboundedReceiver<IncomingPacket> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().entry(kind).or_default().push(tx);
        rx
    }

    /// Spawn the worker draining `incoming`. Must be called within a runtime.
    pub fn start(self: &Arc<Self>, mut incoming: mpsc::UnboundedReceiver<IncomingTransfer>) {
        let dispatcher: Weak<Self> = Arc::downgrade(self);
        let worker = tokio::spawn(async move {
            while let Some(transfer) = incoming.recv().await {
                let Some(dispatcher) = dispatcher.upgrade() else {
                    break;
                };
                dispatcher.dispatch(transfer);
            }
            log::debug!("packet dispatcher stopped");
        });
        if let Some(previous) = self.worker.lock().replace(worker) {
            previous.abort();
        }
    }

    /// Deliver one transfer. Returns the number of subscribers reached.
    pub fn dispatch(&self, transfer: IncomingTransfer) -> usize {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let IncomingTransfer { description, payload } = transfer;

        let payload = if description.compressed {
            match decompress(&payload) {
                Ok(payload) => payload,
                Err(e) => {
                    log::warn!(
                        "dropping {:?} transfer from {}: {e}",
                        description.kind,
                        description.sender
                    );
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    return 0;
                }
            }
        } else {
            payload
        };

        log::trace!(
            "{:?} transfer from {} ({} bytes)",
            description.kind,
            description.sender,
            payload.len()
        );

        let kind = description.kind;
        let packet = IncomingPacket { description, payload };
        let mut subscribers = self.subscribers.lock();
        let delivered = match subscribers.get_mut(&kind) {
            Some(senders) => {
                senders.retain(|tx| tx.send(packet.clone()).is_ok());
                senders.len()
            }
            None => 0,
        };
        drop(subscribers);

        if delivered == 0 {
            log::debug!("no subscriber for {kind:?} transfer from {}", packet.description.sender);
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.delivered.fetch_add(1, Ordering::Relaxed);
        }
        delivered
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            received: self.stats.received.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }

    pub fn shutdown(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}

impl Drop for PacketDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tandem_core::PeerId;

    use super::*;
    use crate::protocol::compress_if_large;

    fn transfer(kind: TransferKind, payload: &[u8]) -> IncomingTransfer {
        IncomingTransfer {
            description: TransferDescription::new(
                kind,
                PeerId::parse("alice@example.org/tandem").unwrap(),
                PeerId::parse("bob@example.org/tandem").unwrap(),
            ),
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_routes_by_kind() {
        let dispatcher = PacketDispatcher::new();
        let mut activities = dispatcher.subscribe(TransferKind::Activity);
        let mut negotiations = dispatcher.subscribe(TransferKind::Negotiation);

        assert_eq!(dispatcher.dispatch(transfer(TransferKind::Negotiation, b"offer")), 1);

        assert!(activities.try_recv().is_err());
        assert_eq!(negotiations.try_recv().unwrap().payload, b"offer");
    }

    #[test]
    fn test_fans_out_to_every_subscriber() {
        let dispatcher = PacketDispatcher::new();
        let mut first = dispatcher.subscribe(TransferKind::Custom);
        let mut second = dispatcher.subscribe(TransferKind::Custom);

        assert_eq!(dispatcher.dispatch(transfer(TransferKind::Custom, b"x")), 2);
        assert!(first.try_recv().is_ok());
        assert!(second.try_recv().is_ok());
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let dispatcher = PacketDispatcher::new();
        let gone = dispatcher.subscribe(TransferKind::Custom);
        let mut kept = dispatcher.subscribe(TransferKind::Custom);
        drop(gone);

        assert_eq!(dispatcher.dispatch(transfer(TransferKind::Custom, b"x")), 1);
        assert!(kept.try_recv().is_ok());
    }

    #[test]
    fn test_decompresses_payload() {
        let dispatcher = PacketDispatcher::new();
        let mut rx = dispatcher.subscribe(TransferKind::Activity);

        let original = vec![42u8; 2048];
        let (compressed, flag) = compress_if_large(original.clone(), 64);
        assert!(flag);
        let mut incoming = transfer(TransferKind::Activity, &compressed);
        incoming.description.compressed = true;

        dispatcher.dispatch(incoming);
        let packet = rx.try_recv().unwrap();
        assert_eq!(packet.payload, original);
    }

    #[test]
    fn test_corrupt_payload_is_dropped() {
        let dispatcher = PacketDispatcher::new();
        let mut rx = dispatcher.subscribe(TransferKind::Activity);

        let mut incoming = transfer(TransferKind::Activity, &[10, 0, 0, 0, 0xFF]);
        incoming.description.compressed = true;

        assert_eq!(dispatcher.dispatch(incoming), 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(
            dispatcher.stats(),
            DispatchStats {
                received: 1,
                delivered: 0,
                dropped: 1
            }
        );
    }

    #[tokio::test]
    async fn test_worker_drains_channel() {
        let dispatcher = PacketDispatcher::new();
        let mut rx = dispatcher.subscribe(TransferKind::Custom);
        let (tx, incoming) = mpsc::unbounded_channel();
        dispatcher.start(incoming);

        for i in 0..10u8 {
            tx.send(transfer(TransferKind::Custom, &[i])).unwrap();
        }
        for i in 0..10u8 {
            let packet = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(packet.payload, vec![i]);
        }
        assert_eq!(dispatcher.stats().delivered, 10);
        dispatcher.shutdown();
    }
}
