use std::sync::Arc;

use parking_lot::Mutex;
use tandem_core::PeerId;

use super::Negotiation;

/// Running negotiations of one direction, keyed by peer and process id.
pub struct NegotiationRegistry {
    name: &'static str,
    entries: Mutex<Vec<Arc<dyn Negotiation>>>,
}

impl NegotiationRegistry {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, negotiation: Arc<dyn Negotiation>) {
        log::debug!(
            "{} registry: added {} with {}",
            self.name,
            negotiation.process_id(),
            negotiation.peer()
        );
        self.entries.lock().push(negotiation);
    }

    pub fn remove(&self, process_id: &str) -> Option<Arc<dyn Negotiation>> {
        let mut entries = self.entries.lock();
        let index = entries.iter().position(|n| n.process_id() == process_id)?;
        let removed = entries.swap_remove(index);
        log::debug!("{} registry: removed {process_id}", self.name);
        Some(removed)
    }

    /// True if a negotiation with `peer` is registered.
    pub fn exists(&self, peer: &PeerId) -> bool {
        self.entries.lock().iter().any(|n| n.peer() == peer)
    }

    pub fn get(&self, peer: &PeerId, process_id: &str) -> Option<Arc<dyn Negotiation>> {
        self.entries
            .lock()
            .iter()
            .find(|n| n.peer() == peer && n.process_id() == process_id)
            .cloned()
    }

    pub fn list(&self) -> Vec<Arc<dyn Negotiation>> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
