use std::sync::Arc;

use super::{
    IncomingProjectNegotiation, IncomingSessionNegotiation, NegotiationHandler,
    OutgoingProjectNegotiation, OutgoingSessionNegotiation,
};

/// Runs every negotiation without asking anyone. Useful for headless peers
/// and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoAcceptHandler;

impl NegotiationHandler for AutoAcceptHandler {
    fn handle_outgoing_session_negotiation(&self, negotiation: Arc<OutgoingSessionNegotiation>) {
        tokio::spawn(async move {
            negotiation.start().await;
        });
    }

    fn handle_incoming_session_negotiation(&self, negotiation: Arc<IncomingSessionNegotiation>) {
        tokio::spawn(async move {
            negotiation.accept().await;
        });
    }

    fn handle_outgoing_project_negotiation(&self, negotiation: Arc<OutgoingProjectNegotiation>) {
        tokio::spawn(async move {
            negotiation.start().await;
        });
    }

    fn handle_incoming_project_negotiation(&self, negotiation: Arc<IncomingProjectNegotiation>) {
        tokio::spawn(async move {
            negotiation.accept().await;
        });
    }
}
