//! The live collaboration session.
//!
//! ```text
//!  local edit ──▶ activity_created ──▶ client.transform_outgoing ──▶ sequencer ──▶ host
//!
//!  sequencer ──▶ exec ──▶ [host: server.transform_incoming ──▶ forward]
//!                           ──▶ client.transform_incoming ──▶ queue ──▶ drain worker ──▶ executors
//! ```
//!
//! Every participant runs a document client; the host additionally runs the
//! document server that orders concurrent edits. Activities ready for local
//! application go through one queue drained by a single worker, so executors
//! see them strictly in the order they were produced.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tandem_core::{
    Activity, ActivityContext, ActivityData, ColorId, ColorPool, ConcurrentDocumentClient,
    ConcurrentDocumentServer, PeerId, QueueItem, ResourceError, ResourceId, ResourceMapping,
    ResourceTree, User, UserRole,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::dispatch::PacketDispatcher;
use crate::events::ListenerRegistry;
use crate::protocol::TransferKind;
use crate::sequencer::{ActivitySequencer, ActivitySink, SequencerError};
use crate::transmitter::Transmitter;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session is already started")]
    AlreadyStarted,
    #[error("session is already stopped")]
    AlreadyStopped,
    #[error("{0} is already a participant")]
    DuplicateUser(PeerId),
    #[error("{0} is not a participant")]
    UnknownUser(PeerId),
    #[error("only the host may do this")]
    NotHost,
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Sequencer(#[from] SequencerError),
}

/// Applies activities to editor state owned outside this crate.
pub trait ActivityExecutor: Send + Sync {
    fn exec(&self, activity: &Activity);
}

/// Membership events of one session.
pub trait SharedSessionListener: Send + Sync {
    fn user_joined(&self, _user: &User) {}
    fn user_left(&self, _user: &User) {}
    fn role_changed(&self, _user: &User) {}
    fn invitation_completed(&self, _user: &User) {}
}

pub struct Session {
    id: String,
    local: PeerId,
    host: PeerId,
    participants: RwLock<HashMap<PeerId, User>>,
    /// Host only.
    colors: Option<Mutex<ColorPool>>,
    resources: RwLock<ResourceMapping>,
    /// Participants that accepted each resource.
    holders: RwLock<HashMap<ResourceId, HashSet<PeerId>>>,
    client: Mutex<ConcurrentDocumentClient>,
    /// Host only.
    server: Option<Mutex<ConcurrentDocumentServer>>,
    sequencer: Arc<ActivitySequencer>,
    dispatcher: Arc<PacketDispatcher>,
    executors: ListenerRegistry<dyn ActivityExecutor>,
    listeners: ListenerRegistry<dyn SharedSessionListener>,
    queue: Mutex<Option<mpsc::UnboundedSender<Activity>>>,
    drain: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
    this: Weak<Session>,
}

impl Session {
    /// A session hosted by `local`.
    pub fn hosted(
        id: impl Into<String>,
        local: PeerId,
        max_colors: u8,
        transmitter: Transmitter,
        dispatcher: Arc<PacketDispatcher>,
    ) -> Arc<Self> {
        let users = vec![User::host(local.clone()).with_local(true)];
        Self::build(
            id.into(),
            local.clone(),
            local,
            users,
            Some(ColorPool::new(max_colors)),
            transmitter,
            dispatcher,
        )
    }

    /// A session joined by `local` and hosted by `host`.
    pub fn client(
        id: impl Into<String>,
        local: PeerId,
        local_color: Option<ColorId>,
        host: PeerId,
        transmitter: Transmitter,
        dispatcher: Arc<PacketDispatcher>,
    ) -> Arc<Self> {
        let mut me = User::new(local.clone(), UserRole::Driver, local_color).with_local(true);
        me.mark_invitation_complete();
        let users = vec![User::host(host.clone()), me];
        Self::build(id.into(), local, host, users, None, transmitter, dispatcher)
    }

    fn build(
        id: String,
        local: PeerId,
        host: PeerId,
        users: Vec<User>,
        colors: Option<ColorPool>,
        transmitter: Transmitter,
        dispatcher: Arc<PacketDispatcher>,
    ) -> Arc<Self> {
        let is_host = local == host;
        Arc::new_cyclic(|this| Self {
            participants: RwLock::new(users.into_iter().map(|u| (u.peer().clone(), u)).collect()),
            colors: colors.map(Mutex::new),
            resources: RwLock::new(ResourceMapping::new()),
            holders: RwLock::new(HashMap::new()),
            client: Mutex::new(ConcurrentDocumentClient::new(local.clone(), host.clone())),
            server: is_host.then(|| Mutex::new(ConcurrentDocumentServer::new(host.clone()))),
            sequencer: ActivitySequencer::new(id.clone(), transmitter),
            dispatcher,
            executors: ListenerRegistry::new(),
            listeners: ListenerRegistry::new(),
            queue: Mutex::new(None),
            drain: Mutex::new(None),
            stopped: AtomicBool::new(true),
            this: this.clone(),
            id,
            local,
            host,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Start the drain worker and the activity sequencer. Must be called
    /// within a runtime.
    pub fn start(&self) -> Result<(), SessionError> {
        if !self.stopped.swap(false, Ordering::AcqRel) {
            return Err(SessionError::AlreadyStarted);
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Activity>();
        let this = self.this.clone();
        let drain = tokio::spawn(async move {
            while let Some(activity) = rx.recv().await {
                let Some(session) = this.upgrade() else {
                    break;
                };
                session.apply(activity);
            }
        });
        *self.queue.lock() = Some(tx);
        *self.drain.lock() = Some(drain);

        let sink: Weak<dyn ActivitySink> = self.this.clone();
        self.sequencer
            .start(sink, self.dispatcher.subscribe(TransferKind::Activity));

        log::info!(
            "session {} started ({})",
            self.id,
            if self.is_host() { "host" } else { "client" }
        );
        Ok(())
    }

    pub fn stop(&self) -> Result<(), SessionError> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Err(SessionError::AlreadyStopped);
        }
        self.sequencer.stop();
        self.queue.lock().take();
        if let Some(drain) = self.drain.lock().take() {
            drain.abort();
        }
        log::info!("session {} stopped", self.id);
        Ok(())
    }

    // --- activities -------------------------------------------------------

    /// Entry point for activities produced by local editors.
    pub fn activity_created(&self, activity: Activity) {
        if self.is_stopped() {
            log::warn!("session {} is stopped, dropping {activity:?}", self.id);
            return;
        }
        if let Activity::TextEdit { path, .. } = &activity {
            if !self.has_write_access() {
                log::warn!("observers cannot edit {path}");
                return;
            }
        }

        let remote = self.remote_peers();
        // Jupiter stamps must reach the sequencer in the order they were issued.
        let mut client = self.client.lock();
        for item in client.transform_outgoing(activity, &remote) {
            self.forward(item);
        }
    }

    /// Send `activity` to `recipients`. An activity that cannot be converted
    /// to its wire form is logged and dropped.
    pub fn send_activity(
        &self,
        recipients: &[PeerId],
        activity: &Activity,
    ) -> Result<(), SessionError> {
        if recipients.is_empty() {
            log::error!("activity without recipients: {activity:?}");
            return Err(SequencerError::EmptyRecipients.into());
        }
        let data = match activity.to_data(self) {
            Ok(data) => data,
            Err(e) => {
                log::warn!("dropping activity that cannot be sent: {e}");
                return Ok(());
            }
        };
        self.sequencer.send_activity(recipients, data)?;
        Ok(())
    }

    pub fn add_activity_executor(&self, executor: Arc<dyn ActivityExecutor>) {
        self.executors.add(executor);
    }

    pub fn remove_activity_executor(&self, executor: &Arc<dyn ActivityExecutor>) -> bool {
        self.executors.remove(executor)
    }

    fn forward(&self, item: QueueItem) {
        if let Err(e) = self.send_activity(&item.recipients, &item.activity) {
            log::warn!("could not queue activity for {:?}: {e}", item.recipients);
        }
    }

    fn execute(&self, activities: Vec<Activity>) {
        let mut client = self.client.lock();
        let result = client.transform_incoming(activities);
        self.enqueue(result.execute_locally);
    }

    /// Queue activities for the drain worker.
    pub(crate) fn enqueue(&self, activities: Vec<Activity>) {
        let queue = self.queue.lock();
        let Some(tx) = queue.as_ref() else {
            log::debug!(
                "session {} is not running, dropping {} activities",
                self.id,
                activities.len()
            );
            return;
        };
        for activity in activities {
            if tx.send(activity).is_err() {
                log::debug!("drain worker of session {} is gone", self.id);
                return;
            }
        }
    }

    fn apply(&self, activity: Activity) {
        if let Activity::RoleChange { source, target, role } = &activity {
            if *source != self.host {
                log::warn!("ignoring role change issued by non-host {source}");
                return;
            }
            if let Err(e) = self.set_user_role(target, *role) {
                log::warn!("cannot apply role change: {e}");
            }
        }
        self.executors.notify("exec", |e| e.exec(&activity));
    }

    // --- participants -----------------------------------------------------

    pub fn add_user(&self, user: User) -> Result<(), SessionError> {
        {
            let mut participants = self.participants.write();
            if participants.contains_key(user.peer()) {
                return Err(SessionError::DuplicateUser(user.peer().clone()));
            }
            participants.insert(user.peer().clone(), user.clone());
        }
        log::info!("{} joined session {} as {}", user.peer(), self.id, user.role());
        self.listeners.notify("user_joined", |l| l.user_joined(&user));
        Ok(())
    }

    pub fn remove_user(&self, peer: &PeerId) -> Option<User> {
        let removed = self.participants.write().remove(peer);
        let Some(user) = removed else {
            log::warn!("cannot remove {peer}: not a participant of session {}", self.id);
            return None;
        };

        if let (Some(colors), Some(color)) = (&self.colors, user.color()) {
            colors.lock().release(color);
        }
        for holders in self.holders.write().values_mut() {
            holders.remove(peer);
        }
        if let Some(server) = &self.server {
            server.lock().user_left(peer);
        }
        self.sequencer.user_left(peer);

        log::info!("{peer} left session {}", self.id);
        self.listeners.notify("user_left", |l| l.user_left(&user));
        Some(user)
    }

    /// Change a participant's role everywhere. Host only.
    pub fn initiate_role_change(
        &self,
        target: &PeerId,
        role: UserRole,
    ) -> Result<(), SessionError> {
        if !self.is_host() {
            return Err(SessionError::NotHost);
        }
        if !self.is_participant(target) {
            return Err(SessionError::UnknownUser(target.clone()));
        }

        let remote = self.remote_peers();
        if !remote.is_empty() {
            let activity = Activity::RoleChange {
                source: self.local.clone(),
                target: target.clone(),
                role,
            };
            self.send_activity(&remote, &activity)?;
        }
        self.set_user_role(target, role)
    }

    pub fn set_user_role(&self, peer: &PeerId, role: UserRole) -> Result<(), SessionError> {
        let user = {
            let mut participants = self.participants.write();
            let user = participants
                .get_mut(peer)
                .ok_or_else(|| SessionError::UnknownUser(peer.clone()))?;
            user.set_role(role);
            user.clone()
        };
        log::info!("{peer} is now {role}");
        self.listeners.notify("role_changed", |l| l.role_changed(&user));
        Ok(())
    }

    pub fn user_invitation_completed(&self, peer: &PeerId) -> Result<(), SessionError> {
        let user = {
            let mut participants = self.participants.write();
            let user = participants
                .get_mut(peer)
                .ok_or_else(|| SessionError::UnknownUser(peer.clone()))?;
            user.mark_invitation_complete();
            user.clone()
        };
        self.listeners
            .notify("invitation_completed", |l| l.invitation_completed(&user));
        Ok(())
    }

    pub fn add_listener(&self, listener: Arc<dyn SharedSessionListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn SharedSessionListener>) -> bool {
        self.listeners.remove(listener)
    }

    /// Lowest free color, or `None` if the pool is exhausted or this peer is
    /// not the host.
    pub fn free_color(&self) -> Option<ColorId> {
        self.colors.as_ref().and_then(|colors| colors.lock().acquire())
    }

    pub fn return_color(&self, color: ColorId) -> bool {
        self.colors
            .as_ref()
            .is_some_and(|colors| colors.lock().release(color))
    }

    pub fn host(&self) -> &PeerId {
        &self.host
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn is_host(&self) -> bool {
        self.local == self.host
    }

    pub fn user(&self, peer: &PeerId) -> Option<User> {
        self.participants.read().get(peer).cloned()
    }

    pub fn local_user(&self) -> Option<User> {
        self.user(&self.local)
    }

    pub fn host_user(&self) -> Option<User> {
        self.user(&self.host)
    }

    pub fn is_participant(&self, peer: &PeerId) -> bool {
        self.participants.read().contains_key(peer)
    }

    /// All participants ordered by peer id.
    pub fn participants(&self) -> Vec<User> {
        let mut users: Vec<User> = self.participants.read().values().cloned().collect();
        users.sort_by(|a, b| a.peer().cmp(b.peer()));
        users
    }

    fn participants_where(&self, keep: impl Fn(&User) -> bool) -> Vec<User> {
        self.participants().into_iter().filter(|u| keep(u)).collect()
    }

    pub fn remote_users(&self) -> Vec<User> {
        self.participants_where(User::is_remote)
    }

    pub fn drivers(&self) -> Vec<User> {
        self.participants_where(User::is_driver)
    }

    pub fn observers(&self) -> Vec<User> {
        self.participants_where(User::is_observer)
    }

    pub fn remote_drivers(&self) -> Vec<User> {
        self.participants_where(|u| u.is_remote() && u.is_driver())
    }

    pub fn remote_observers(&self) -> Vec<User> {
        self.participants_where(|u| u.is_remote() && u.is_observer())
    }

    pub fn remote_peers(&self) -> Vec<PeerId> {
        self.remote_users().into_iter().map(|u| u.peer().clone()).collect()
    }

    pub fn has_write_access(&self) -> bool {
        self.local_user().is_some_and(|u| u.has_write_access())
    }

    /// True if the local user is the only driver.
    pub fn is_exclusive_driver(&self) -> bool {
        self.has_write_access() && self.remote_drivers().is_empty()
    }

    // --- resources --------------------------------------------------------

    pub fn add_resources(&self, id: ResourceId, tree: &ResourceTree) -> Result<(), SessionError> {
        self.resources.write().add(id.clone(), tree)?;
        self.holders
            .write()
            .entry(id)
            .or_default()
            .insert(self.local.clone());
        Ok(())
    }

    /// Record that `peer` accepted the given resources.
    pub fn resources_accepted(&self, peer: &PeerId, ids: &[ResourceId]) {
        let mut holders = self.holders.write();
        for id in ids {
            holders.entry(id.clone()).or_default().insert(peer.clone());
        }
    }

    /// Participants that hold a resource, ordered by peer id.
    pub fn holders(&self, id: &ResourceId) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .holders
            .read()
            .get(id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default();
        peers.sort();
        peers
    }

    pub fn resources(&self) -> ResourceMapping {
        self.resources.read().clone()
    }

    pub fn resource_id(&self, name: &str) -> Option<ResourceId> {
        self.resources.read().id_of(name).cloned()
    }

    pub fn is_shared(&self, id: &ResourceId) -> bool {
        self.resources.read().contains(id)
    }
}

impl ActivityContext for Session {
    fn is_participant(&self, peer: &PeerId) -> bool {
        Session::is_participant(self, peer)
    }

    fn is_shared_resource(&self, resource: &ResourceId) -> bool {
        self.is_shared(resource)
    }
}

impl ActivitySink for Session {
    fn exec(&self, sender: &PeerId, activities: Vec<ActivityData>) {
        if self.is_stopped() {
            log::debug!("session {} is stopped, ignoring activities from {sender}", self.id);
            return;
        }

        let activities: Vec<Activity> = activities
            .iter()
            .filter_map(|data| match data.to_activity(self) {
                Ok(activity) => Some(activity),
                Err(e) => {
                    log::warn!("dropping activity from {sender}: {e}");
                    None
                }
            })
            .collect();

        match &self.server {
            Some(server) => {
                // Held until every stamp is queued: exec runs on both sequencer
                // workers, and the host's own client receives stamps too.
                let mut server = server.lock();
                let mut local = Vec::new();
                for activity in activities {
                    let recipients = match activity.path() {
                        Some(path) => self.holders(&path.resource),
                        None => self.participants().iter().map(|u| u.peer().clone()).collect(),
                    };
                    let result = server.transform_incoming(vec![activity], &recipients);
                    for item in result.send_to_peers {
                        self.forward(item);
                    }
                    local.extend(result.execute_locally);
                }
                self.execute(local);
            }
            None => self.execute(activities),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(drain) = self.drain.get_mut().take() {
            drain.abort();
        }
    }
}
