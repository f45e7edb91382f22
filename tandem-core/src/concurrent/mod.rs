//! Concurrent document management.
//!
//! ```text
//!   client A ──Jupiter──▶ ┌─────────────────────────┐ ──Jupiter──▶ client B
//!                         │ ConcurrentDocumentServer│
//!   host client ◀──────── │  one proxy per (file,   │ ──Jupiter──▶ client C
//!                         │  participant)           │
//!                         └─────────────────────────┘
//! ```
//!
//! Every participant, the host included, runs a [`ConcurrentDocumentClient`].
//! Only the host runs the [`ConcurrentDocumentServer`], which transforms each
//! edit against the proxy of its author and re-stamps it for everyone else.

mod client;
mod server;

pub use client::ConcurrentDocumentClient;
pub use server::ConcurrentDocumentServer;

use crate::activity::Activity;
use crate::peer::PeerId;

/// An activity addressed to a set of peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub recipients: Vec<PeerId>,
    pub activity: Activity,
}

impl QueueItem {
    pub fn new(recipients: Vec<PeerId>, activity: Activity) -> Self {
        if recipients.is_empty() {
            log::error!("queue item created with no recipients: {activity:?}");
        }
        Self { recipients, activity }
    }

    pub fn single(recipient: PeerId, activity: Activity) -> Self {
        Self {
            recipients: vec![recipient],
            activity,
        }
    }
}

/// Output of a transformation step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformationResult {
    /// Activities to apply on this peer.
    pub execute_locally: Vec<Activity>,
    /// Activities to forward to other peers.
    pub send_to_peers: Vec<QueueItem>,
}

impl TransformationResult {
    pub fn is_empty(&self) -> bool {
        self.execute_locally.is_empty() && self.send_to_peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};

    use super::*;
    use crate::operation::Operation;
    use crate::resource::{ResourceId, ResourcePath};

    fn peer(name: &str) -> PeerId {
        PeerId::parse(format!("{name}@example.org/tandem")).unwrap()
    }

    fn path() -> ResourcePath {
        ResourcePath::new(ResourceId::new("r1"), "notes.txt")
    }

    /// Host plus two clients exchanging Jupiter messages through FIFO links.
    struct Network {
        host: PeerId,
        participants: Vec<PeerId>,
        server: ConcurrentDocumentServer,
        clients: HashMap<PeerId, ConcurrentDocumentClient>,
        docs: HashMap<PeerId, String>,
        links: HashMap<PeerId, VecDeque<Activity>>,
    }

    impl Network {
        fn new(initial: &str) -> Self {
            let host = peer("host");
            let participants = vec![host.clone(), peer("a"), peer("b")];
            let clients = participants
                .iter()
                .map(|p| (p.clone(), ConcurrentDocumentClient::new(p.clone(), host.clone())))
                .collect();
            let docs = participants
                .iter()
                .map(|p| (p.clone(), initial.to_string()))
                .collect();
            let links = participants
                .iter()
                .map(|p| (p.clone(), VecDeque::new()))
                .collect();
            Self {
                server: ConcurrentDocumentServer::new(host.clone()),
                host,
                participants,
                clients,
                docs,
                links,
            }
        }

        fn edit(&mut self, who: &PeerId, operation: Operation) {
            let doc = self.docs.get_mut(who).unwrap();
            operation.apply(doc).unwrap();
            let activity = Activity::TextEdit {
                source: who.clone(),
                path: path(),
                operation,
            };
            let remote: Vec<PeerId> = self
                .participants
                .iter()
                .filter(|p| *p != who)
                .cloned()
                .collect();
            let items = self.clients.get_mut(who).unwrap().transform_outgoing(activity, &remote);
            for item in items {
                assert_eq!(item.recipients, vec![self.host.clone()]);
                self.host_receive(item.activity);
            }
        }

        fn host_receive(&mut self, activity: Activity) {
            let result = self.server.transform_incoming(vec![activity], &self.participants);
            for item in result.send_to_peers {
                for recipient in item.recipients {
                    self.links.get_mut(&recipient).unwrap().push_back(item.activity.clone());
                }
            }
            let host = self.host.clone();
            for activity in result.execute_locally {
                self.links.get_mut(&host).unwrap().push_back(activity);
            }
        }

        fn deliver_all(&mut self, who: &PeerId) {
            while let Some(activity) = self.links.get_mut(who).unwrap().pop_front() {
                let result = self.clients.get_mut(who).unwrap().transform_incoming(vec![activity]);
                for local in result.execute_locally {
                    if let Activity::TextEdit { operation, .. } = local {
                        operation.apply(self.docs.get_mut(who).unwrap()).unwrap();
                    }
                }
            }
        }
    }

    #[test]
    fn test_three_party_convergence() {
        let mut net = Network::new("hello");
        let (host, a, b) = (peer("host"), peer("a"), peer("b"));

        net.edit(&a, Operation::insert(0, "A"));
        net.edit(&b, Operation::insert(5, "B"));
        net.edit(&host, Operation::delete(1, 2));
        net.edit(&a, Operation::insert(6, "!"));

        for who in [&a, &b, &host] {
            net.deliver_all(who);
        }

        let reference = net.docs[&host].clone();
        assert_eq!(net.docs[&a], reference);
        assert_eq!(net.docs[&b], reference);
    }

    #[test]
    fn test_interleaved_delivery_converges() {
        let mut net = Network::new("0123456789");
        let (host, a, b) = (peer("host"), peer("a"), peer("b"));

        net.edit(&a, Operation::delete(2, 5));
        net.deliver_all(&b);
        net.edit(&b, Operation::insert(4, "xyz"));
        net.edit(&host, Operation::insert(3, "H"));
        net.deliver_all(&a);
        net.edit(&a, Operation::insert(0, ">"));

        for who in [&a, &b, &host] {
            net.deliver_all(who);
        }

        let reference = net.docs[&host].clone();
        assert_eq!(net.docs[&a], reference);
        assert_eq!(net.docs[&b], reference);
    }

    #[test]
    fn test_queue_item_single() {
        let item = QueueItem::single(
            peer("a"),
            Activity::TextEdit {
                source: peer("b"),
                path: path(),
                operation: Operation::NoOp,
            },
        );
        assert_eq!(item.recipients.len(), 1);
    }
}
