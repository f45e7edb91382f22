//! Network connectivity state and its observers.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::events::ListenerRegistry;

/// Connectivity of the local node to the collaboration network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NotConnected,
    Connecting,
    Connected,
    /// About to go offline; sessions should wind down.
    Disconnecting,
    Error,
}

pub trait NetworkObserver: Send + Sync {
    fn connection_state_changed(&self, state: ConnectionState);
}

/// Owns the connection state and notifies observers of every change.
pub struct NetworkService {
    state: RwLock<ConnectionState>,
    observers: ListenerRegistry<dyn NetworkObserver>,
}

impl Default for NetworkService {
    fn default() -> Self {
        Self {
            state: RwLock::new(ConnectionState::NotConnected),
            observers: ListenerRegistry::new(),
        }
    }
}

impl NetworkService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn add_observer(&self, observer: Arc<dyn NetworkObserver>) {
        self.observers.add(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn NetworkObserver>) -> bool {
        self.observers.remove(observer)
    }

    /// Record a new state. Observers are only told about actual changes.
    pub fn set_state(&self, state: ConnectionState) {
        {
            let mut current = self.state.write();
            if *current == state {
                return;
            }
            log::info!("network state {:?} -> {:?}", *current, state);
            *current = state;
        }
        self.observers
            .notify("connection_state_changed", |o| o.connection_state_changed(state));
    }

    pub fn connect(&self) {
        if self.is_connected() {
            return;
        }
        self.set_state(ConnectionState::Connecting);
        self.set_state(ConnectionState::Connected);
    }

    pub fn disconnect(&self) {
        if self.state() == ConnectionState::NotConnected {
            return;
        }
        self.set_state(ConnectionState::Disconnecting);
        self.set_state(ConnectionState::NotConnected);
    }
}
