//! # tandem-core
//!
//! Runtime-free model of a real-time collaborative editing session:
//!
//! - [`peer`]: network identities (`name@domain/resource`)
//! - [`user`]: participants, driver/observer roles, color pool
//! - [`resource`]: shared resources and the name ↔ id mapping
//! - [`operation`]: text operations and their inclusion transformation
//! - [`jupiter`]: two-party Jupiter synchronisation
//! - [`activity`]: session activities and their wire form
//! - [`concurrent`]: host-side server and per-participant client
//!
//! Everything here is synchronous and deterministic; networking, lifecycle
//! and negotiation live in `tandem-collab`.

pub mod activity;
pub mod concurrent;
pub mod jupiter;
pub mod operation;
pub mod peer;
pub mod resource;
pub mod user;

pub use activity::{Activity, ActivityContext, ActivityData, ActivityError};
pub use concurrent::{
    ConcurrentDocumentClient, ConcurrentDocumentServer, QueueItem, TransformationResult,
};
pub use jupiter::{Jupiter, JupiterTimestamp};
pub use operation::{OtError, Operation};
pub use peer::{PeerId, PeerIdError};
pub use resource::{ResourceError, ResourceId, ResourceMapping, ResourcePath, ResourceTree};
pub use user::{ColorId, ColorPool, User, UserRole};
