//! The single authority over the local session.
//!
//! ```text
//!               start_session / join_session
//!  NONE ──▶ STARTING ──▶ ACTIVE ──▶ STOPPING ──▶ NONE
//!                                 stop_session
//! ```
//!
//! Starting and stopping serialize on a lifecycle mutex acquired with a
//! bounded wait. Negotiation entry points only try the mutex and give up if it
//! is held, so a new negotiation never races a session that is being torn
//! down. Failures are logged and reported as `None`/`false`, never as errors.

use std::sync::{Arc, Weak};
use std::time::Instant;

use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use tandem_core::{ColorId, PeerId, ResourceId, ResourceTree, User};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{CollabConfig, HostLeftAlonePolicy};
use crate::dispatch::{IncomingPacket, PacketDispatcher};
use crate::events::{same, ListenerRegistry};
use crate::host_alone::HostLeftAloneHandler;
use crate::negotiation::packets::NegotiationPacketListener;
use crate::negotiation::{
    CancelOption, IncomingProjectNegotiation, IncomingSessionNegotiation, Negotiation,
    NegotiationEnv, NegotiationHandler, NegotiationKind, NegotiationListener, NegotiationRegistry,
    NegotiationState, OutgoingProjectNegotiation, OutgoingSessionNegotiation, Progress,
};
use crate::network::{ConnectionState, NetworkObserver};
use crate::protocol::{decode, ParticipantInfo, ResourceOffering, SessionControl, TransferKind};
use crate::session::Session;
use crate::transmitter::Transmitter;

/// Lifecycle events of the local session. Callbacks run synchronously on the
/// task driving the transition; a panicking listener is logged and skipped.
pub trait SessionListener: Send + Sync {
    fn session_starting(&self, _session: &Arc<Session>) {}
    fn session_started(&self, _session: &Arc<Session>) {}
    fn session_ending(&self, _session: &Arc<Session>) {}
    fn session_ended(&self, _session: &Arc<Session>) {}
    fn project_added(&self, _resource: &ResourceId) {}
    fn post_outgoing_invitation_completed(&self, _progress: &Progress, _user: &User) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    None,
    Starting,
    Active,
    Stopping,
}

/// Task that currently drives a start or stop.
struct Transition {
    task: Option<tokio::task::Id>,
}

pub struct SessionManager {
    config: CollabConfig,
    transmitter: Transmitter,
    dispatcher: Arc<PacketDispatcher>,
    lifecycle: AsyncMutex<()>,
    state: RwLock<SessionState>,
    transition: Mutex<Option<Transition>>,
    session: RwLock<Option<Arc<Session>>>,
    listeners: ListenerRegistry<dyn SessionListener>,
    handler: RwLock<Option<Arc<dyn NegotiationHandler>>>,
    session_negotiations: NegotiationRegistry,
    project_negotiations: NegotiationRegistry,
    packets: Arc<NegotiationPacketListener>,
    control_worker: Mutex<Option<JoinHandle<()>>>,
    this: Weak<SessionManager>,
}

impl SessionManager {
    /// Must be called within a runtime.
    pub fn new(
        config: CollabConfig,
        transmitter: Transmitter,
        dispatcher: Arc<PacketDispatcher>,
    ) -> Arc<Self> {
        let manager = Arc::new_cyclic(|this: &Weak<Self>| Self {
            packets: Arc::new(NegotiationPacketListener::new(
                this.clone(),
                transmitter.clone(),
                config.version.clone(),
            )),
            config,
            transmitter,
            dispatcher,
            lifecycle: AsyncMutex::new(()),
            state: RwLock::new(SessionState::None),
            transition: Mutex::new(None),
            session: RwLock::new(None),
            listeners: ListenerRegistry::new(),
            handler: RwLock::new(None),
            session_negotiations: NegotiationRegistry::new("session"),
            project_negotiations: NegotiationRegistry::new("project"),
            control_worker: Mutex::new(None),
            this: this.clone(),
        });
        manager
            .packets
            .start(manager.dispatcher.subscribe(TransferKind::Negotiation));
        manager.start_control_worker(manager.dispatcher.subscribe(TransferKind::SessionControl));
        manager
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    pub fn local(&self) -> &PeerId {
        self.transmitter.local()
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.read().clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn SessionListener>) -> bool {
        self.listeners.remove(listener)
    }

    /// Install the negotiation handler, replacing any previous one.
    pub fn set_negotiation_handler(&self, handler: Arc<dyn NegotiationHandler>) {
        if self.handler.write().replace(handler).is_some() {
            log::warn!("replacing the installed negotiation handler");
        }
    }

    pub fn remove_negotiation_handler(&self, handler: &Arc<dyn NegotiationHandler>) -> bool {
        let mut installed = self.handler.write();
        match installed.as_ref() {
            Some(current) if same(current, handler) => {
                installed.take();
                true
            }
            _ => false,
        }
    }

    fn negotiation_handler(&self, operation: &str) -> Option<Arc<dyn NegotiationHandler>> {
        let handler = self.handler.read().clone();
        if handler.is_none() {
            log::warn!("{operation}: no negotiation handler installed");
        }
        handler
    }

    pub fn negotiations(&self) -> Vec<Arc<dyn Negotiation>> {
        let mut all = self.session_negotiations.list();
        all.extend(self.project_negotiations.list());
        all
    }

    pub(crate) fn find_negotiation(
        &self,
        peer: &PeerId,
        process_id: &str,
    ) -> Option<Arc<dyn Negotiation>> {
        self.session_negotiations
            .get(peer, process_id)
            .or_else(|| self.project_negotiations.get(peer, process_id))
    }

    fn negotiation_env(&self) -> NegotiationEnv {
        let listener: Weak<dyn NegotiationListener> = self.this.clone();
        NegotiationEnv {
            transmitter: self.transmitter.clone(),
            response_timeout: self.config.negotiation_response_timeout(),
            version: self.config.version.clone(),
            listener,
            manager: self.this.clone(),
        }
    }

    // --- lifecycle --------------------------------------------------------

    /// A start or stop driven by the calling task is already in progress.
    /// Callers outside a task cannot be told apart and are never reentrant.
    fn is_reentrant(&self, operation: &str) -> bool {
        let Some(current) = tokio::task::try_id() else {
            return false;
        };
        let reentrant = self
            .transition
            .lock()
            .as_ref()
            .is_some_and(|t| t.task == Some(current));
        if reentrant {
            log::warn!("{operation} called from within a session start or stop");
        }
        reentrant
    }

    fn begin_transition(&self, state: SessionState) {
        *self.transition.lock() = Some(Transition {
            task: tokio::task::try_id(),
        });
        *self.state.write() = state;
    }

    fn end_transition(&self, state: SessionState) {
        *self.state.write() = state;
        self.transition.lock().take();
    }

    /// Host a new session sharing `resources`. Returns `None` if a session
    /// already exists or the lifecycle lock could not be acquired in time.
    pub async fn start_session(&self, resources: Vec<ResourceTree>) -> Option<Arc<Session>> {
        if self.is_reentrant("start_session") {
            return None;
        }
        let wait = self.config.lifecycle_lock_timeout();
        let Ok(_guard) = tokio::time::timeout(wait, self.lifecycle.lock()).await else {
            log::warn!("could not start a session: timed out waiting for the lifecycle lock");
            return None;
        };
        if self.session.read().is_some() {
            log::warn!("could not start a session: a session is already running");
            return None;
        }

        self.begin_transition(SessionState::Starting);
        self.packets.set_reject_invitations(true);

        let session = Session::hosted(
            Uuid::new_v4().to_string(),
            self.local().clone(),
            self.config.max_user_colors,
            self.transmitter.clone(),
            self.dispatcher.clone(),
        );
        if self.config.host_left_alone == HostLeftAlonePolicy::Always {
            session.add_listener(Arc::new(HostLeftAloneHandler::new(self.this.clone())));
        }
        *self.session.write() = Some(session.clone());

        self.listeners
            .notify("session_starting", |l| l.session_starting(&session));
        if let Err(e) = session.start() {
            log::error!("could not start session {}: {e}", session.id());
            self.session.write().take();
            self.packets.set_reject_invitations(false);
            self.end_transition(SessionState::None);
            return None;
        }
        self.listeners.notify("session_started", |l| l.session_started(&session));

        for tree in resources {
            let id = ResourceId::random();
            match session.add_resources(id.clone(), &tree) {
                Ok(()) => {
                    self.listeners.notify("project_added", |l| l.project_added(&id));
                }
                Err(e) => log::warn!("could not share {}: {e}", tree.name),
            }
        }

        self.end_transition(SessionState::Active);
        Some(session)
    }

    /// Leave or close the current session. Outstanding negotiations are
    /// cancelled first; the session is stopped even if some of them do not
    /// terminate in time. Returns `false` if there was nothing to stop or the
    /// lifecycle lock could not be acquired.
    pub async fn stop_session(&self) -> bool {
        self.stop(true).await
    }

    /// `announce` is false when the host already closed the session.
    async fn stop(&self, announce: bool) -> bool {
        if self.is_reentrant("stop_session") {
            return false;
        }
        let wait = self.config.lifecycle_lock_timeout();
        let Ok(_guard) = tokio::time::timeout(wait, self.lifecycle.lock()).await else {
            log::warn!("could not stop the session: timed out waiting for the lifecycle lock");
            return false;
        };
        let current = self.session.read().clone();
        let Some(session) = current else {
            log::debug!("no session to stop");
            return false;
        };

        self.begin_transition(SessionState::Stopping);
        if !self.terminate_negotiations().await {
            log::warn!("some negotiations did not terminate in time and may still be finishing");
        }

        self.listeners.notify("session_ending", |l| l.session_ending(&session));
        if announce {
            self.announce_leave(&session).await;
        }
        if let Err(e) = session.stop() {
            log::warn!("stopping session {}: {e}", session.id());
        }
        self.session.write().take();
        self.packets.set_reject_invitations(false);
        self.listeners.notify("session_ended", |l| l.session_ended(&session));

        self.end_transition(SessionState::None);
        true
    }

    /// Cancel every registered negotiation and poll until all of them have
    /// terminated. Returns `false` on timeout.
    async fn terminate_negotiations(&self) -> bool {
        for negotiation in self.negotiations() {
            negotiation.local_cancel("the session is closing", CancelOption::NotifyPeer);
        }

        let deadline = Instant::now() + self.config.negotiation_termination_timeout();
        loop {
            if self.session_negotiations.is_empty() && self.project_negotiations.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.negotiation_poll_interval()).await;
        }
    }

    /// Tell the other side we are leaving. Bounded by the leave timeout so an
    /// unresponsive peer cannot hold up teardown.
    async fn announce_leave(&self, session: &Session) {
        let recipients = if session.is_host() {
            session.remote_peers()
        } else {
            vec![session.host().clone()]
        };
        let limit = self.config.leave_timeout();
        let notifications = recipients.into_iter().map(|peer| async move {
            match tokio::time::timeout(
                limit,
                self.transmitter
                    .send_control(&peer, session.id(), &SessionControl::Leave),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::debug!("could not tell {peer} that we are leaving: {e}"),
                Err(_) => {
                    log::warn!("telling {peer} that we are leaving timed out after {limit:?}")
                }
            }
        });
        join_all(notifications).await;
    }

    /// Create and start the client side of session `session_id` hosted by
    /// `host`. Both happen under the lifecycle lock, so a concurrent stop sees
    /// either no session or a running one.
    pub fn join_session(
        &self,
        session_id: &str,
        host: PeerId,
        color: Option<ColorId>,
        participants: Vec<ParticipantInfo>,
    ) -> Option<Arc<Session>> {
        let Ok(_guard) = self.lifecycle.try_lock() else {
            log::warn!("could not join session {session_id}: the session lifecycle is busy");
            return None;
        };
        if self.session.read().is_some() {
            log::warn!("could not join session {session_id}: a session is already running");
            return None;
        }

        let local = self.local().clone();
        let session = Session::client(
            session_id,
            local.clone(),
            color,
            host.clone(),
            self.transmitter.clone(),
            self.dispatcher.clone(),
        );
        for info in participants {
            if info.peer == local || info.peer == host {
                continue;
            }
            let mut user = User::new(info.peer, info.role, info.color);
            user.mark_invitation_complete();
            if let Err(e) = session.add_user(user) {
                log::debug!("ignoring participant: {e}");
            }
        }

        self.begin_transition(SessionState::Starting);
        *self.session.write() = Some(session.clone());
        self.listeners
            .notify("session_starting", |l| l.session_starting(&session));
        if let Err(e) = session.start() {
            log::error!("could not start session {}: {e}", session.id());
            self.session.write().take();
            self.end_transition(SessionState::None);
            return None;
        }
        self.listeners.notify("session_started", |l| l.session_started(&session));
        self.end_transition(SessionState::Active);
        Some(session)
    }

    // --- negotiation entry points ----------------------------------------

    pub(crate) fn invitation_received(
        &self,
        peer: PeerId,
        invitation_id: String,
        session_id: String,
        description: String,
    ) -> bool {
        let Some(handler) = self.negotiation_handler("invitation received") else {
            return false;
        };
        let negotiation = {
            let Ok(_guard) = self.lifecycle.try_lock() else {
                log::warn!("ignoring invitation from {peer}: the session lifecycle is busy");
                return false;
            };
            log::info!("received invitation {invitation_id} to session {session_id} from {peer}");
            let negotiation = Arc::new(IncomingSessionNegotiation::new(
                peer,
                invitation_id,
                session_id,
                description,
                self.negotiation_env(),
            ));
            self.session_negotiations.add(negotiation.clone());
            negotiation
        };
        handler.handle_incoming_session_negotiation(negotiation);
        true
    }

    pub(crate) fn incoming_project_received(
        &self,
        peer: PeerId,
        process_id: String,
        session_id: String,
        resources: Vec<ResourceOffering>,
    ) {
        let Some(handler) = self.negotiation_handler("resource offer received") else {
            return;
        };
        let negotiation = {
            let Ok(_guard) = self.lifecycle.try_lock() else {
                log::warn!("ignoring resource offer from {peer}: the session lifecycle is busy");
                return;
            };
            let Some(session) = self.session() else {
                log::warn!("ignoring resource offer from {peer}: not in a session");
                return;
            };
            if session.id() != session_id {
                log::warn!("ignoring resource offer from {peer} for foreign session {session_id}");
                return;
            }
            if *session.host() != peer {
                log::warn!("ignoring resource offer from non-host {peer}");
                return;
            }
            let negotiation = Arc::new(IncomingProjectNegotiation::new(
                peer,
                process_id,
                session,
                resources,
                self.negotiation_env(),
            ));
            self.project_negotiations.add(negotiation.clone());
            negotiation
        };
        handler.handle_incoming_project_negotiation(negotiation);
    }

    /// Invite `peer` into the hosted session. Returns `false` if the peer is
    /// already a participant or a negotiation with it is running.
    pub fn invite(&self, peer: PeerId, description: &str) -> bool {
        let Some(handler) = self.negotiation_handler("invite") else {
            return false;
        };
        let negotiation = {
            let Ok(_guard) = self.lifecycle.try_lock() else {
                log::warn!("could not invite {peer}: the session lifecycle is busy");
                return false;
            };
            let Some(session) = self.session() else {
                log::warn!("could not invite {peer}: not in a session");
                return false;
            };
            if !session.is_host() {
                log::warn!("could not invite {peer}: only the host can invite");
                return false;
            }
            if session.is_participant(&peer) {
                log::warn!("{peer} is already a participant");
                return false;
            }
            if self.session_negotiations.exists(&peer) {
                log::warn!("an invitation for {peer} is already running");
                return false;
            }
            log::info!("inviting {peer} to session {}", session.id());
            let negotiation = Arc::new(OutgoingSessionNegotiation::new(
                peer,
                Uuid::new_v4().to_string(),
                session,
                description.to_string(),
                self.negotiation_env(),
            ));
            self.session_negotiations.add(negotiation.clone());
            negotiation
        };
        handler.handle_outgoing_session_negotiation(negotiation);
        true
    }

    /// Invite several peers. Returns how many invitations were started.
    pub fn invite_all(&self, peers: impl IntoIterator<Item = PeerId>, description: &str) -> usize {
        peers
            .into_iter()
            .filter(|peer| self.invite(peer.clone(), description))
            .count()
    }

    /// Share more resources with the running session. Every remote
    /// participant is offered the new resources. Host only.
    pub fn add_resources_to_session(&self, resources: Vec<ResourceTree>) -> Vec<ResourceId> {
        let Some(handler) = self.negotiation_handler("add resources") else {
            return Vec::new();
        };
        let (session, added) = {
            let Ok(_guard) = self.lifecycle.try_lock() else {
                log::warn!("could not add resources: the session lifecycle is busy");
                return Vec::new();
            };
            let Some(session) = self.session() else {
                log::warn!("could not add resources: not in a session");
                return Vec::new();
            };
            if !session.is_host() {
                log::warn!("could not add resources: only the host can share resources");
                return Vec::new();
            }

            let mut added = Vec::new();
            for tree in resources {
                let id = ResourceId::random();
                match session.add_resources(id.clone(), &tree) {
                    Ok(()) => {
                        self.listeners.notify("project_added", |l| l.project_added(&id));
                        added.push(offering(id, tree));
                    }
                    Err(e) => log::warn!("could not share {}: {e}", tree.name),
                }
            }
            (session, added)
        };

        if !added.is_empty() {
            for peer in session.remote_peers() {
                self.offer_resources(&handler, &session, peer, added.clone());
            }
        }
        added.into_iter().map(|o| o.resource_id).collect()
    }

    /// Offer every shared resource to `peer`, typically right after it joined.
    pub fn start_sharing_projects(&self, peer: &PeerId) -> bool {
        let Some(handler) = self.negotiation_handler("share resources") else {
            return false;
        };
        let (session, offerings) = {
            let Ok(_guard) = self.lifecycle.try_lock() else {
                log::warn!("could not share resources with {peer}: the session lifecycle is busy");
                return false;
            };
            let Some(session) = self.session() else {
                log::warn!("could not share resources with {peer}: not in a session");
                return false;
            };
            let mapping = session.resources();
            let offerings: Vec<ResourceOffering> = mapping
                .ids()
                .into_iter()
                .filter_map(|id| mapping.tree(&id).map(|tree| offering(id, tree)))
                .collect();
            (session, offerings)
        };

        if offerings.is_empty() {
            log::debug!("nothing to share with {peer}");
            return true;
        }
        self.offer_resources(&handler, &session, peer.clone(), offerings);
        true
    }

    fn offer_resources(
        &self,
        handler: &Arc<dyn NegotiationHandler>,
        session: &Arc<Session>,
        peer: PeerId,
        offerings: Vec<ResourceOffering>,
    ) {
        let negotiation = Arc::new(OutgoingProjectNegotiation::new(
            peer,
            Uuid::new_v4().to_string(),
            session.clone(),
            offerings,
            self.negotiation_env(),
        ));
        self.project_negotiations.add(negotiation.clone());
        handler.handle_outgoing_project_negotiation(negotiation);
    }

    /// Called by an outgoing session negotiation once its peer joined.
    pub(crate) async fn outgoing_invitation_completed(
        &self,
        session: &Arc<Session>,
        progress: &Progress,
        user: &User,
    ) {
        let joined = ParticipantInfo::from(user);
        for peer in session.remote_peers() {
            if peer == *user.peer() {
                continue;
            }
            let control = SessionControl::UserJoined(joined.clone());
            if let Err(e) = self.transmitter.send_control(&peer, session.id(), &control).await {
                log::warn!("could not announce {} to {peer}: {e}", user.peer());
            }
        }

        self.listeners.notify("post_outgoing_invitation_completed", |l| {
            l.post_outgoing_invitation_completed(progress, user)
        });
        self.start_sharing_projects(user.peer());
    }

    pub(crate) fn project_added(&self, resource: &ResourceId) {
        self.listeners.notify("project_added", |l| l.project_added(resource));
    }

    // --- session control --------------------------------------------------

    fn start_control_worker(&self, mut incoming: mpsc::UnboundedReceiver<IncomingPacket>) {
        let manager = self.this.clone();
        let worker = tokio::spawn(async move {
            while let Some(packet) = incoming.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.handle_control(packet).await;
            }
        });
        if let Some(previous) = self.control_worker.lock().replace(worker) {
            previous.abort();
        }
    }

    async fn handle_control(&self, packet: IncomingPacket) {
        let sender = packet.description.sender;
        let control: SessionControl = match decode(&packet.payload) {
            Ok(control) => control,
            Err(e) => {
                log::warn!("malformed session control message from {sender}: {e}");
                return;
            }
        };
        let Some(session) = self.session() else {
            log::debug!("{control:?} from {sender} outside a session");
            return;
        };
        if packet.description.session_id.as_deref() != Some(session.id()) {
            log::debug!("{control:?} from {sender} for another session");
            return;
        }

        match control {
            SessionControl::UserJoined(info) if sender == *session.host() && !session.is_host() => {
                let mut user = User::new(info.peer, info.role, info.color);
                user.mark_invitation_complete();
                if let Err(e) = session.add_user(user) {
                    log::debug!("{e}");
                }
            }
            SessionControl::UserLeft(peer) if sender == *session.host() && !session.is_host() => {
                session.remove_user(&peer);
            }
            SessionControl::Leave if sender == *session.host() && !session.is_host() => {
                log::info!("host {sender} closed session {}", session.id());
                self.spawn_stop(false);
            }
            SessionControl::Leave if session.is_host() => {
                if session.remove_user(&sender).is_none() {
                    return;
                }
                for peer in session.remote_peers() {
                    let control = SessionControl::UserLeft(sender.clone());
                    let sent = self.transmitter.send_control(&peer, session.id(), &control);
                    if let Err(e) = sent.await {
                        log::warn!("could not tell {peer} that {sender} left: {e}");
                    }
                }
            }
            other => log::warn!("unexpected {other:?} from {sender}"),
        }
    }

    /// Stop the session on a separate task.
    pub(crate) fn spawn_stop(&self, announce: bool) {
        let Some(manager) = self.this.upgrade() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    manager.stop(announce).await;
                });
            }
            Err(_) => log::warn!("cannot stop the session outside a runtime"),
        }
    }
}

fn offering(resource_id: ResourceId, tree: ResourceTree) -> ResourceOffering {
    ResourceOffering {
        resource_id,
        name: tree.name,
        files: tree.files,
        size_hints: Vec::new(),
    }
}

impl NegotiationListener for SessionManager {
    fn negotiation_terminated(
        &self,
        kind: NegotiationKind,
        peer: &PeerId,
        process_id: &str,
        state: NegotiationState,
    ) {
        let registry = if kind.is_session() {
            &self.session_negotiations
        } else {
            &self.project_negotiations
        };
        if registry.remove(process_id).is_none() {
            log::debug!("{kind} {process_id} with {peer} was not registered");
        }

        if kind == NegotiationKind::IncomingSession
            && state != NegotiationState::Completed
            && self.session.read().is_none()
        {
            self.packets.set_reject_invitations(false);
        }
    }
}

impl NetworkObserver for SessionManager {
    fn connection_state_changed(&self, state: ConnectionState) {
        if state == ConnectionState::Disconnecting && self.session.read().is_some() {
            log::info!("network is going down, stopping the session");
            self.spawn_stop(true);
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(worker) = self.control_worker.lock().take() {
            worker.abort();
        }
    }
}
