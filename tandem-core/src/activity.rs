//! Session activities and their wire representation.
//!
//! [`Activity`] is the in-session form: peers and resources it refers to are
//! known participants and shared resources. [`ActivityData`] is what travels
//! between peers; converting it back requires the session context and fails
//! when the sender or resource is not part of the session.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::jupiter::JupiterTimestamp;
use crate::operation::Operation;
use crate::peer::{PeerId, PeerIdError};
use crate::resource::{ResourceId, ResourcePath};
use crate::user::UserRole;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActivityError {
    #[error("invalid peer id: {0}")]
    InvalidPeer(#[from] PeerIdError),
    #[error("{0} is not a session participant")]
    UnknownUser(PeerId),
    #[error("resource {0} is not shared in this session")]
    UnknownResource(ResourceId),
}

/// Lookups an activity needs while converting to or from its wire form.
pub trait ActivityContext {
    fn is_participant(&self, peer: &PeerId) -> bool;
    fn is_shared_resource(&self, resource: &ResourceId) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activity {
    /// A local, untransformed edit of a shared file.
    TextEdit {
        source: PeerId,
        path: ResourcePath,
        operation: Operation,
    },
    /// An edit stamped by the Jupiter algorithm for transport.
    Jupiter {
        source: PeerId,
        path: ResourcePath,
        timestamp: JupiterTimestamp,
        operation: Operation,
    },
    RoleChange {
        source: PeerId,
        target: PeerId,
        role: UserRole,
    },
}

impl Activity {
    pub fn source(&self) -> &PeerId {
        match self {
            Activity::TextEdit { source, .. }
            | Activity::Jupiter { source, .. }
            | Activity::RoleChange { source, .. } => source,
        }
    }

    pub fn path(&self) -> Option<&ResourcePath> {
        match self {
            Activity::TextEdit { path, .. } | Activity::Jupiter { path, .. } => Some(path),
            Activity::RoleChange { .. } => None,
        }
    }

    /// Convert to the wire form.
    pub fn to_data(&self, context: &impl ActivityContext) -> Result<ActivityData, ActivityError> {
        if let Some(path) = self.path() {
            if !context.is_shared_resource(&path.resource) {
                return Err(ActivityError::UnknownResource(path.resource.clone()));
            }
        }

        Ok(match self {
            Activity::TextEdit { source, path, operation } => ActivityData::TextEdit {
                source: source.to_string(),
                resource: path.resource.clone(),
                path: path.path.clone(),
                operation: operation.clone(),
            },
            Activity::Jupiter { source, path, timestamp, operation } => ActivityData::Jupiter {
                source: source.to_string(),
                resource: path.resource.clone(),
                path: path.path.clone(),
                timestamp: *timestamp,
                operation: operation.clone(),
            },
            Activity::RoleChange { source, target, role } => ActivityData::RoleChange {
                source: source.to_string(),
                target: target.to_string(),
                role: *role,
            },
        })
    }
}

/// Wire form of an [`Activity`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityData {
    TextEdit {
        source: String,
        resource: ResourceId,
        path: String,
        operation: Operation,
    },
    Jupiter {
        source: String,
        resource: ResourceId,
        path: String,
        timestamp: JupiterTimestamp,
        operation: Operation,
    },
    RoleChange {
        source: String,
        target: String,
        role: UserRole,
    },
}

impl ActivityData {
    /// Resolve against the session. Every referenced peer must be a participant
    /// and every referenced resource must be shared.
    pub fn to_activity(&self, context: &impl ActivityContext) -> Result<Activity, ActivityError> {
        let participant = |raw: &str| -> Result<PeerId, ActivityError> {
            let peer = PeerId::parse(raw)?;
            if !context.is_participant(&peer) {
                return Err(ActivityError::UnknownUser(peer));
            }
            Ok(peer)
        };
        let shared = |resource: &ResourceId, path: &str| -> Result<ResourcePath, ActivityError> {
            if !context.is_shared_resource(resource) {
                return Err(ActivityError::UnknownResource(resource.clone()));
            }
            Ok(ResourcePath::new(resource.clone(), path))
        };

        Ok(match self {
            ActivityData::TextEdit { source, resource, path, operation } => Activity::TextEdit {
                source: participant(source)?,
                path: shared(resource, path)?,
                operation: operation.clone(),
            },
            ActivityData::Jupiter { source, resource, path, timestamp, operation } => {
                Activity::Jupiter {
                    source: participant(source)?,
                    path: shared(resource, path)?,
                    timestamp: *timestamp,
                    operation: operation.clone(),
                }
            }
            ActivityData::RoleChange { source, target, role } => Activity::RoleChange {
                source: participant(source)?,
                target: participant(target)?,
                role: *role,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Context {
        participants: Vec<PeerId>,
        resources: Vec<ResourceId>,
    }

    impl ActivityContext for Context {
        fn is_participant(&self, peer: &PeerId) -> bool {
            self.participants.contains(peer)
        }

        fn is_shared_resource(&self, resource: &ResourceId) -> bool {
            self.resources.contains(resource)
        }
    }

    fn alice() -> PeerId {
        PeerId::parse("alice@example.org/tandem").unwrap()
    }

    fn context() -> Context {
        Context {
            participants: vec![alice()],
            resources: vec![ResourceId::new("r1")],
        }
    }

    #[test]
    fn test_text_edit_conversion() {
        let activity = Activity::TextEdit {
            source: alice(),
            path: ResourcePath::new(ResourceId::new("r1"), "src/lib.rs"),
            operation: Operation::insert(0, "fn"),
        };
        let data = activity.to_data(&context()).unwrap();
        assert_eq!(data.to_activity(&context()).unwrap(), activity);
    }

    #[test]
    fn test_unknown_sender_rejected() {
        let data = ActivityData::RoleChange {
            source: "mallory@example.org/tandem".to_string(),
            target: alice().to_string(),
            role: UserRole::Observer,
        };
        assert!(matches!(
            data.to_activity(&context()),
            Err(ActivityError::UnknownUser(_))
        ));
    }

    #[test]
    fn test_unshared_resource_rejected() {
        let activity = Activity::TextEdit {
            source: alice(),
            path: ResourcePath::new(ResourceId::new("r2"), "a.txt"),
            operation: Operation::delete(0, 1),
        };
        assert_eq!(
            activity.to_data(&context()),
            Err(ActivityError::UnknownResource(ResourceId::new("r2")))
        );
    }

    #[test]
    fn test_malformed_peer_rejected() {
        let data = ActivityData::TextEdit {
            source: "garbage".to_string(),
            resource: ResourceId::new("r1"),
            path: "a.txt".to_string(),
            operation: Operation::NoOp,
        };
        assert!(matches!(
            data.to_activity(&context()),
            Err(ActivityError::InvalidPeer(_))
        ));
    }
}
