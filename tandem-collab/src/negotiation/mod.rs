//! Cancellable handshakes that add participants and resources to a session.
//!
//! ```text
//!  CREATED ──start/accept──▶ RUNNING ──▶ COMPLETED
//!     │                         ├──────▶ CANCELLED   (local or remote cancel)
//!     │                         └──────▶ FAILED      (timeout, transport, protocol)
//!     └──local/remote cancel──▶ CANCELLED
//! ```
//!
//! Every negotiation reaches exactly one terminal state and then reports to its
//! [`NegotiationListener`]. The session manager uses that callback to drop the
//! negotiation from its registry, which is how session teardown learns that
//! all negotiations have ended.

macro_rules! impl_negotiation {
    ($ty:ty) => {
        impl $crate::negotiation::Negotiation for $ty {
            fn kind(&self) -> $crate::negotiation::NegotiationKind {
                self.core.kind()
            }

            fn peer(&self) -> &tandem_core::PeerId {
                self.core.peer()
            }

            fn process_id(&self) -> &str {
                self.core.process_id()
            }

            fn state(&self) -> $crate::negotiation::NegotiationState {
                self.core.state()
            }

            fn error(&self) -> Option<$crate::negotiation::NegotiationError> {
                self.core.error()
            }

            fn progress(&self) -> &$crate::negotiation::Progress {
                self.core.progress()
            }

            fn local_cancel(
                &self,
                reason: &str,
                option: $crate::negotiation::CancelOption,
            ) -> bool {
                self.core.local_cancel(reason, option)
            }

            fn deliver(&self, message: $crate::protocol::NegotiationMessage) {
                self.core.deliver(message)
            }
        }

        impl $ty {
            /// Wait until the negotiation reached a terminal state.
            pub async fn wait(&self) -> $crate::negotiation::NegotiationState {
                self.core.wait().await
            }
        }
    };
}

pub mod handler;
pub(crate) mod packets;
pub mod project;
pub mod registry;
pub mod session;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tandem_core::PeerId;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};

use crate::manager::SessionManager;
use crate::protocol::NegotiationMessage;
use crate::transmitter::Transmitter;
use crate::transport::TransportError;

pub use handler::AutoAcceptHandler;
pub use project::{IncomingProjectNegotiation, OutgoingProjectNegotiation};
pub use registry::NegotiationRegistry;
pub use session::{IncomingSessionNegotiation, OutgoingSessionNegotiation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Created,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NegotiationState::Completed | NegotiationState::Cancelled | NegotiationState::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationKind {
    OutgoingSession,
    IncomingSession,
    OutgoingProject,
    IncomingProject,
}

impl NegotiationKind {
    pub fn is_session(self) -> bool {
        matches!(self, NegotiationKind::OutgoingSession | NegotiationKind::IncomingSession)
    }
}

impl fmt::Display for NegotiationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NegotiationKind::OutgoingSession => "outgoing session negotiation",
            NegotiationKind::IncomingSession => "incoming session negotiation",
            NegotiationKind::OutgoingProject => "outgoing project negotiation",
            NegotiationKind::IncomingProject => "incoming project negotiation",
        })
    }
}

/// Whether a local cancellation is announced to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOption {
    NotifyPeer,
    DoNotNotifyPeer,
}

#[derive(Debug, Clone, Error)]
pub enum NegotiationError {
    #[error("cancelled locally: {0}")]
    LocalCancel(String),
    #[error("cancelled by peer: {0}")]
    RemoteCancel(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("received {actual} while waiting for {expected}")]
    Unexpected {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("negotiation was already started")]
    AlreadyStarted,
    #[error("session error: {0}")]
    Session(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl NegotiationError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, NegotiationError::LocalCancel(_) | NegotiationError::RemoteCancel(_))
    }
}

/// Named steps a negotiation went through, for progress reporting.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    steps: Arc<Mutex<Vec<String>>>,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(&self, step: impl Into<String>) {
        let step = step.into();
        log::debug!("progress: {step}");
        self.steps.lock().push(step);
    }

    pub fn steps(&self) -> Vec<String> {
        self.steps.lock().clone()
    }
}

/// A running or finished negotiation as seen by registries and the manager.
pub trait Negotiation: Send + Sync {
    fn kind(&self) -> NegotiationKind;
    fn peer(&self) -> &PeerId;
    fn process_id(&self) -> &str;
    fn state(&self) -> NegotiationState;
    /// Why the negotiation did not complete, once terminated.
    fn error(&self) -> Option<NegotiationError>;
    fn progress(&self) -> &Progress;
    /// Request cancellation. Returns `false` if the negotiation already ended
    /// or was already asked to cancel.
    fn local_cancel(&self, reason: &str, option: CancelOption) -> bool;
    /// Hand over a message from the peer.
    fn deliver(&self, message: NegotiationMessage);
}

pub trait NegotiationListener: Send + Sync {
    fn negotiation_terminated(
        &self,
        kind: NegotiationKind,
        peer: &PeerId,
        process_id: &str,
        state: NegotiationState,
    );
}

/// Decides what to do with new negotiations, typically by asking the user.
/// Implementations drive the negotiation by calling `start`, `accept` or
/// `decline` on it.
pub trait NegotiationHandler: Send + Sync {
    fn handle_outgoing_session_negotiation(&self, negotiation: Arc<OutgoingSessionNegotiation>);
    fn handle_incoming_session_negotiation(&self, negotiation: Arc<IncomingSessionNegotiation>);
    fn handle_outgoing_project_negotiation(&self, negotiation: Arc<OutgoingProjectNegotiation>);
    fn handle_incoming_project_negotiation(&self, negotiation: Arc<IncomingProjectNegotiation>);
}

/// What every negotiation needs from its surroundings.
#[derive(Clone)]
pub(crate) struct NegotiationEnv {
    pub transmitter: Transmitter,
    pub response_timeout: Duration,
    pub version: String,
    pub listener: Weak<dyn NegotiationListener>,
    pub manager: Weak<SessionManager>,
}

#[derive(Debug, Clone)]
enum Cancellation {
    Local { option: CancelOption, reason: String },
    Remote { reason: String },
}

impl Cancellation {
    fn to_error(&self) -> NegotiationError {
        match self {
            Cancellation::Local { reason, .. } => NegotiationError::LocalCancel(reason.clone()),
            Cancellation::Remote { reason } => NegotiationError::RemoteCancel(reason.clone()),
        }
    }
}

/// State, inbox and cancellation shared by all negotiation kinds.
pub(crate) struct NegotiationCore {
    kind: NegotiationKind,
    peer: PeerId,
    process_id: String,
    env: NegotiationEnv,
    state: watch::Sender<NegotiationState>,
    cancellation: watch::Sender<Option<Cancellation>>,
    inbox_tx: mpsc::UnboundedSender<NegotiationMessage>,
    inbox: AsyncMutex<mpsc::UnboundedReceiver<NegotiationMessage>>,
    terminated: AtomicBool,
    error: Mutex<Option<NegotiationError>>,
    progress: Progress,
}

impl NegotiationCore {
    pub(crate) fn new(
        kind: NegotiationKind,
        peer: PeerId,
        process_id: String,
        env: NegotiationEnv,
    ) -> Self {
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        Self {
            kind,
            peer,
            process_id,
            env,
            state: watch::Sender::new(NegotiationState::Created),
            cancellation: watch::Sender::new(None),
            inbox_tx,
            inbox: AsyncMutex::new(inbox),
            terminated: AtomicBool::new(false),
            error: Mutex::new(None),
            progress: Progress::new(),
        }
    }

    pub(crate) fn kind(&self) -> NegotiationKind {
        self.kind
    }

    pub(crate) fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub(crate) fn process_id(&self) -> &str {
        &self.process_id
    }

    pub(crate) fn env(&self) -> &NegotiationEnv {
        &self.env
    }

    pub(crate) fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    pub(crate) fn error(&self) -> Option<NegotiationError> {
        self.error.lock().clone()
    }

    pub(crate) fn progress(&self) -> &Progress {
        &self.progress
    }

    /// Move from `Created` to `Running`.
    pub(crate) fn begin(&self) -> Result<(), NegotiationError> {
        let started = self.state.send_if_modified(|state| {
            if *state == NegotiationState::Created {
                *state = NegotiationState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(NegotiationError::AlreadyStarted);
        }
        log::info!("{} {} with {} started", self.kind, self.process_id, self.peer);
        Ok(())
    }

    fn check_cancelled(&self) -> Result<(), NegotiationError> {
        match &*self.cancellation.borrow() {
            Some(cancellation) => Err(cancellation.to_error()),
            None => Ok(()),
        }
    }

    pub(crate) async fn send(&self, message: NegotiationMessage) -> Result<(), NegotiationError> {
        self.check_cancelled()?;
        self.env.transmitter.send_negotiation(&self.peer, &message).await?;
        Ok(())
    }

    /// Wait for the next message from the peer, giving up on cancellation or
    /// after the response timeout.
    pub(crate) async fn next_message(
        &self,
        expected: &'static str,
    ) -> Result<NegotiationMessage, NegotiationError> {
        self.check_cancelled()?;
        let cancelled = wait_for_cancellation(self.cancellation.subscribe());
        let mut inbox = self.inbox.lock().await;

        tokio::select! {
            message = inbox.recv() => message.ok_or(NegotiationError::Timeout(expected)),
            error = cancelled => Err(error),
            _ = tokio::time::sleep(self.env.response_timeout) => {
                Err(NegotiationError::Timeout(expected))
            }
        }
    }

    /// Terminate with the outcome of the negotiation's run. The peer is told
    /// about failures and about local cancellations that asked for it.
    pub(crate) async fn finish(&self, result: Result<(), NegotiationError>) -> NegotiationState {
        match result {
            Ok(()) => self.terminate(NegotiationState::Completed, None),
            Err(error) => {
                if self.should_notify_peer(&error) {
                    let cancel = NegotiationMessage::Cancel {
                        process_id: self.process_id.clone(),
                        reason: Some(error.to_string()),
                    };
                    let sent = self.env.transmitter.send_negotiation(&self.peer, &cancel);
                    if let Err(e) = sent.await {
                        log::debug!("could not tell {} about the cancellation: {e}", self.peer);
                    }
                }
                let state = if error.is_cancellation() {
                    NegotiationState::Cancelled
                } else {
                    NegotiationState::Failed
                };
                self.terminate(state, Some(error));
            }
        }
        self.state()
    }

    fn should_notify_peer(&self, error: &NegotiationError) -> bool {
        match error {
            NegotiationError::RemoteCancel(_) => false,
            NegotiationError::LocalCancel(_) => matches!(
                *self.cancellation.borrow(),
                Some(Cancellation::Local {
                    option: CancelOption::NotifyPeer,
                    ..
                })
            ),
            _ => true,
        }
    }

    fn terminate(&self, state: NegotiationState, error: Option<NegotiationError>) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        match &error {
            None => log::info!("{} {} with {} completed", self.kind, self.process_id, self.peer),
            Some(e) if state == NegotiationState::Cancelled => {
                log::info!("{} {} with {} cancelled: {e}", self.kind, self.process_id, self.peer)
            }
            Some(e) => log::warn!(
                "{} {} with {} failed: {e}",
                self.kind,
                self.process_id,
                self.peer
            ),
        }
        *self.error.lock() = error;
        self.state.send_replace(state);

        if let Some(listener) = self.env.listener.upgrade() {
            listener.negotiation_terminated(self.kind, &self.peer, &self.process_id, state);
        }
    }

    /// Cancel a negotiation that was never started. Nobody else will observe
    /// the request, so terminate here.
    fn claim_unstarted(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == NegotiationState::Created {
                *state = NegotiationState::Cancelled;
                true
            } else {
                false
            }
        })
    }

    fn request_cancellation(&self, cancellation: Cancellation) -> bool {
        if self.state().is_terminal() {
            return false;
        }
        self.cancellation.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(cancellation);
            true
        })
    }

    pub(crate) fn local_cancel(&self, reason: &str, option: CancelOption) -> bool {
        let cancellation = Cancellation::Local {
            option,
            reason: reason.to_string(),
        };
        if !self.request_cancellation(cancellation) {
            return false;
        }
        log::info!("cancelling {} {} with {}: {reason}", self.kind, self.process_id, self.peer);

        if self.claim_unstarted() {
            if option == CancelOption::NotifyPeer {
                self.notify_peer_detached(reason.to_string());
            }
            self.terminate(
                NegotiationState::Cancelled,
                Some(NegotiationError::LocalCancel(reason.to_string())),
            );
        }
        true
    }

    fn remote_cancel(&self, reason: String) {
        if !self.request_cancellation(Cancellation::Remote { reason: reason.clone() }) {
            return;
        }
        if self.claim_unstarted() {
            self.terminate(
                NegotiationState::Cancelled,
                Some(NegotiationError::RemoteCancel(reason)),
            );
        }
    }

    pub(crate) fn deliver(&self, message: NegotiationMessage) {
        if let NegotiationMessage::Cancel { reason, .. } = message {
            self.remote_cancel(reason.unwrap_or_else(|| String::from("no reason given")));
            return;
        }
        if self.state().is_terminal() {
            log::debug!(
                "{} {} already ended, dropping {}",
                self.kind,
                self.process_id,
                message.name()
            );
            return;
        }
        let _ = self.inbox_tx.send(message);
    }

    fn notify_peer_detached(&self, reason: String) {
        let transmitter = self.env.transmitter.clone();
        let peer = self.peer.clone();
        let cancel = NegotiationMessage::Cancel {
            process_id: self.process_id.clone(),
            reason: Some(reason),
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = transmitter.send_negotiation(&peer, &cancel).await {
                        log::debug!("could not tell {peer} about the cancellation: {e}");
                    }
                });
            }
            Err(_) => log::warn!("cannot notify {peer} of cancellation outside a runtime"),
        }
    }

    pub(crate) async fn wait(&self) -> NegotiationState {
        let mut state = self.state.subscribe();
        loop {
            let current = *state.borrow_and_update();
            if current.is_terminal() {
                return current;
            }
            if state.changed().await.is_err() {
                return self.state();
            }
        }
    }
}

async fn wait_for_cancellation(
    mut cancellation: watch::Receiver<Option<Cancellation>>,
) -> NegotiationError {
    loop {
        let current = cancellation.borrow_and_update().clone();
        if let Some(cancellation) = current {
            return cancellation.to_error();
        }
        if cancellation.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}
