//! Offering shared resources to a participant.

use std::sync::Arc;

use tandem_core::{PeerId, ResourceId, ResourceTree};

use super::{
    CancelOption, NegotiationCore, NegotiationEnv, NegotiationError, NegotiationKind,
    NegotiationState,
};
use crate::protocol::{NegotiationMessage, ResourceOffering};
use crate::session::Session;

fn offered_ids(resources: &[ResourceOffering]) -> Vec<ResourceId> {
    resources.iter().map(|r| r.resource_id.clone()).collect()
}

pub struct OutgoingProjectNegotiation {
    core: NegotiationCore,
    session: Arc<Session>,
    resources: Vec<ResourceOffering>,
}

impl_negotiation!(OutgoingProjectNegotiation);

impl OutgoingProjectNegotiation {
    pub(crate) fn new(
        peer: PeerId,
        process_id: String,
        session: Arc<Session>,
        resources: Vec<ResourceOffering>,
        env: NegotiationEnv,
    ) -> Self {
        Self {
            core: NegotiationCore::new(NegotiationKind::OutgoingProject, peer, process_id, env),
            session,
            resources,
        }
    }

    pub fn resources(&self) -> &[ResourceOffering] {
        &self.resources
    }

    pub async fn start(&self) -> NegotiationState {
        if let Err(e) = self.core.begin() {
            log::warn!("cannot offer resources to {}: {e}", self.core.peer());
            return self.core.state();
        }
        let result = self.run().await;
        self.core.finish(result).await
    }

    async fn run(&self) -> Result<(), NegotiationError> {
        let progress = self.core.progress();

        progress.step(format!("offering {} resources", self.resources.len()));
        self.core
            .send(NegotiationMessage::ResourceOffer {
                process_id: self.core.process_id().to_string(),
                session_id: self.session.id().to_string(),
                resources: self.resources.clone(),
            })
            .await?;

        match self.core.next_message("resource acceptance").await? {
            NegotiationMessage::ResourceAccepted { .. } => {}
            other => {
                return Err(NegotiationError::Unexpected {
                    expected: "resource accepted",
                    actual: other.name(),
                })
            }
        }

        if !self.session.is_participant(self.core.peer()) {
            return Err(NegotiationError::Session(format!(
                "{} left before the resources were shared",
                self.core.peer()
            )));
        }
        self.session
            .resources_accepted(self.core.peer(), &offered_ids(&self.resources));
        progress.step("resources shared");
        Ok(())
    }
}

pub struct IncomingProjectNegotiation {
    core: NegotiationCore,
    session: Arc<Session>,
    resources: Vec<ResourceOffering>,
}

impl_negotiation!(IncomingProjectNegotiation);

impl IncomingProjectNegotiation {
    pub(crate) fn new(
        peer: PeerId,
        process_id: String,
        session: Arc<Session>,
        resources: Vec<ResourceOffering>,
        env: NegotiationEnv,
    ) -> Self {
        Self {
            core: NegotiationCore::new(NegotiationKind::IncomingProject, peer, process_id, env),
            session,
            resources,
        }
    }

    pub fn resources(&self) -> &[ResourceOffering] {
        &self.resources
    }

    /// Add the offered resources to the session and confirm them.
    pub async fn accept(&self) -> NegotiationState {
        if let Err(e) = self.core.begin() {
            log::warn!("cannot accept resources from {}: {e}", self.core.peer());
            return self.core.state();
        }
        let result = self.run().await;
        self.core.finish(result).await
    }

    pub fn decline(&self, reason: &str) -> bool {
        self.core.local_cancel(reason, CancelOption::NotifyPeer)
    }

    async fn run(&self) -> Result<(), NegotiationError> {
        let progress = self.core.progress();
        if self.session.is_stopped() {
            return Err(NegotiationError::Session(String::from("session is not running")));
        }

        for offering in &self.resources {
            if self.session.is_shared(&offering.resource_id) {
                continue;
            }
            let tree = ResourceTree::new(offering.name.clone(), offering.files.iter().cloned());
            self.session
                .add_resources(offering.resource_id.clone(), &tree)
                .map_err(|e| NegotiationError::Session(e.to_string()))?;
            progress.step(format!("added {}", offering.name));
        }
        let ids = offered_ids(&self.resources);
        self.session.resources_accepted(self.core.peer(), &ids);

        self.core
            .send(NegotiationMessage::ResourceAccepted {
                process_id: self.core.process_id().to_string(),
            })
            .await?;

        if let Some(manager) = self.core.env().manager.upgrade() {
            for id in &ids {
                manager.project_added(id);
            }
        }
        Ok(())
    }
}
