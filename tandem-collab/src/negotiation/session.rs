//! Inviting a peer into a session, from both ends.
//!
//! ```text
//!  host                                   invitee
//!   │── InvitationOffer ──────────────────▶│  handler decides
//!   │◀──────────────── InvitationAccepted ──│
//!   │── SessionParameters ────────────────▶│  join + start session
//!   │◀─────────────── InvitationCompleted ──│
//!   add user, announce, share resources
//! ```

use std::sync::Arc;

use tandem_core::{ColorId, PeerId, User, UserRole};

use super::{
    CancelOption, NegotiationCore, NegotiationEnv, NegotiationError, NegotiationKind,
    NegotiationState,
};
use crate::protocol::{NegotiationMessage, ParticipantInfo};
use crate::session::Session;

pub struct OutgoingSessionNegotiation {
    core: NegotiationCore,
    session: Arc<Session>,
    description: String,
}

impl_negotiation!(OutgoingSessionNegotiation);

impl OutgoingSessionNegotiation {
    pub(crate) fn new(
        peer: PeerId,
        process_id: String,
        session: Arc<Session>,
        description: String,
        env: NegotiationEnv,
    ) -> Self {
        Self {
            core: NegotiationCore::new(NegotiationKind::OutgoingSession, peer, process_id, env),
            session,
            description,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Run the invitation until the peer joined, or until it failed or was
    /// cancelled. A color handed out to the peer is returned on failure.
    pub async fn start(&self) -> NegotiationState {
        if let Err(e) = self.core.begin() {
            log::warn!("cannot start invitation of {}: {e}", self.core.peer());
            return self.core.state();
        }

        let mut color = None;
        let result = self.run(&mut color).await;
        if result.is_err() {
            if let Some(color) = color {
                self.session.return_color(color);
            }
        }
        self.core.finish(result).await
    }

    async fn run(&self, color: &mut Option<ColorId>) -> Result<(), NegotiationError> {
        let peer = self.core.peer().clone();
        let invitation_id = self.core.process_id().to_string();
        let progress = self.core.progress();

        progress.step("sending invitation");
        self.core
            .send(NegotiationMessage::InvitationOffer {
                invitation_id: invitation_id.clone(),
                session_id: self.session.id().to_string(),
                version: self.core.env().version.clone(),
                description: self.description.clone(),
            })
            .await?;

        progress.step("waiting for the invitee to accept");
        match self.core.next_message("invitation acceptance").await? {
            NegotiationMessage::InvitationAccepted { .. } => {}
            other => {
                return Err(NegotiationError::Unexpected {
                    expected: "invitation accepted",
                    actual: other.name(),
                })
            }
        }

        progress.step("sending session parameters");
        *color = self.session.free_color();
        let participants = self.session.participants().iter().map(ParticipantInfo::from).collect();
        self.core
            .send(NegotiationMessage::SessionParameters {
                invitation_id,
                host_color: ColorId::HOST,
                client_color: *color,
                participants,
            })
            .await?;

        progress.step("waiting for the invitee to join");
        match self.core.next_message("invitation completion").await? {
            NegotiationMessage::InvitationCompleted { .. } => {}
            other => {
                return Err(NegotiationError::Unexpected {
                    expected: "invitation completed",
                    actual: other.name(),
                })
            }
        }

        if self.session.is_stopped() {
            return Err(NegotiationError::Session(String::from(
                "session stopped during the invitation",
            )));
        }
        let user = User::new(peer.clone(), UserRole::Driver, *color);
        self.session
            .add_user(user)
            .map_err(|e| NegotiationError::Session(e.to_string()))?;
        self.session
            .user_invitation_completed(&peer)
            .map_err(|e| NegotiationError::Session(e.to_string()))?;

        progress.step("invitation completed");
        let manager = self.core.env().manager.upgrade();
        if let (Some(manager), Some(user)) = (manager, self.session.user(&peer)) {
            manager
                .outgoing_invitation_completed(&self.session, progress, &user)
                .await;
        }
        Ok(())
    }
}

pub struct IncomingSessionNegotiation {
    core: NegotiationCore,
    session_id: String,
    description: String,
}

impl_negotiation!(IncomingSessionNegotiation);

impl IncomingSessionNegotiation {
    pub(crate) fn new(
        peer: PeerId,
        process_id: String,
        session_id: String,
        description: String,
        env: NegotiationEnv,
    ) -> Self {
        Self {
            core: NegotiationCore::new(NegotiationKind::IncomingSession, peer, process_id, env),
            session_id,
            description,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Free text the inviter attached to the invitation.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Accept the invitation and join the session.
    pub async fn accept(&self) -> NegotiationState {
        if let Err(e) = self.core.begin() {
            log::warn!("cannot accept invitation from {}: {e}", self.core.peer());
            return self.core.state();
        }
        let result = self.run().await;
        self.core.finish(result).await
    }

    /// Decline the invitation. The inviter is told why.
    pub fn decline(&self, reason: &str) -> bool {
        self.core.local_cancel(reason, CancelOption::NotifyPeer)
    }

    async fn run(&self) -> Result<(), NegotiationError> {
        let host = self.core.peer().clone();
        let invitation_id = self.core.process_id().to_string();
        let progress = self.core.progress();

        progress.step("accepting invitation");
        self.core
            .send(NegotiationMessage::InvitationAccepted {
                invitation_id: invitation_id.clone(),
            })
            .await?;

        progress.step("waiting for session parameters");
        let parameters = self.core.next_message("session parameters").await?;
        let (client_color, participants) = match parameters {
            NegotiationMessage::SessionParameters {
                client_color,
                participants,
                ..
            } => (client_color, participants),
            other => {
                return Err(NegotiationError::Unexpected {
                    expected: "session parameters",
                    actual: other.name(),
                })
            }
        };

        progress.step("joining session");
        let manager = self
            .core
            .env()
            .manager
            .upgrade()
            .ok_or_else(|| NegotiationError::Session(String::from("session manager is gone")))?;
        let session = manager
            .join_session(&self.session_id, host, client_color, participants)
            .ok_or_else(|| NegotiationError::Session(String::from("could not join the session")))?;

        if let Err(e) = self
            .core
            .send(NegotiationMessage::InvitationCompleted { invitation_id })
            .await
        {
            log::warn!("joined session {} but could not confirm it, leaving", session.id());
            tokio::spawn(async move {
                manager.stop_session().await;
            });
            return Err(e);
        }
        progress.step("joined session");
        Ok(())
    }
}
