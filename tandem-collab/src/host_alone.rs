use std::sync::Weak;

use tandem_core::User;

use crate::manager::SessionManager;
use crate::session::SharedSessionListener;

/// Stops a hosted session once its last remote participant left.
pub struct HostLeftAloneHandler {
    manager: Weak<SessionManager>,
}

impl HostLeftAloneHandler {
    pub fn new(manager: Weak<SessionManager>) -> Self {
        Self { manager }
    }
}

impl SharedSessionListener for HostLeftAloneHandler {
    fn user_left(&self, user: &User) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let Some(session) = manager.session() else {
            return;
        };
        if session.is_host() && session.remote_users().is_empty() {
            log::info!(
                "{} was the last participant, closing session {}",
                user.peer(),
                session.id()
            );
            manager.spawn_stop(true);
        }
    }
}
