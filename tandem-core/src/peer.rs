//! Network identities of session participants.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while parsing a [`PeerId`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerIdError {
    #[error("peer id is empty")]
    Empty,
    #[error("peer id `{0}` contains whitespace")]
    Whitespace(String),
    #[error("peer id `{0}` has no `@` separating name and domain")]
    MissingDomain(String),
}

/// Address of a peer on the network, formatted `name@domain[/resource]`.
///
/// A peer id without a resource part is a "bare" id. Session participants are
/// always addressed by their resource-qualified id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, PeerIdError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(PeerIdError::Empty);
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(PeerIdError::Whitespace(raw));
        }
        match raw.find('@') {
            Some(at) if at > 0 && at + 1 < raw.len() => Ok(Self(raw)),
            _ => Err(PeerIdError::MissingDomain(raw)),
        }
    }

    /// Placeholder identity used before a real one is configured.
    pub fn anonymous() -> Self {
        Self(String::from("anonymous@localhost/tandem"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `name@domain` part of this id.
    pub fn bare(&self) -> &str {
        match self.0.find('/') {
            Some(slash) => &self.0[..slash],
            None => &self.0,
        }
    }

    pub fn resource(&self) -> Option<&str> {
        self.0.find('/').map(|slash| &self.0[slash + 1..])
    }

    pub fn is_bare(&self) -> bool {
        self.resource().is_none()
    }

    pub fn name(&self) -> &str {
        let bare = self.bare();
        bare.split('@').next().unwrap_or(bare)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PeerId {
    type Error = PeerIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<PeerId> for String {
    fn from(value: PeerId) -> Self {
        value.0
    }
}
