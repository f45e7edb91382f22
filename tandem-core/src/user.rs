//! Participants, roles and the session color pool.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::peer::PeerId;

/// Write-access role of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UserRole {
    /// May edit shared resources.
    Driver,
    /// Read-only participant.
    Observer,
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserRole::Driver => f.write_str("driver"),
            UserRole::Observer => f.write_str("observer"),
        }
    }
}

/// Display color assigned to a participant. The host always owns color 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColorId(pub u8);

impl ColorId {
    pub const HOST: ColorId = ColorId(0);
}

/// A session participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    peer: PeerId,
    role: UserRole,
    color: Option<ColorId>,
    host: bool,
    local: bool,
    invitation_complete: bool,
}

impl User {
    pub fn new(peer: PeerId, role: UserRole, color: Option<ColorId>) -> Self {
        Self {
            peer,
            role,
            color,
            host: false,
            local: false,
            invitation_complete: false,
        }
    }

    /// The session host. Hosts are drivers and always own [`ColorId::HOST`].
    pub fn host(peer: PeerId) -> Self {
        Self {
            peer,
            role: UserRole::Driver,
            color: Some(ColorId::HOST),
            host: true,
            local: false,
            invitation_complete: true,
        }
    }

    pub fn with_local(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn role(&self) -> UserRole {
        self.role
    }

    pub fn set_role(&mut self, role: UserRole) {
        self.role = role;
    }

    pub fn color(&self) -> Option<ColorId> {
        self.color
    }

    pub fn is_host(&self) -> bool {
        self.host
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn is_remote(&self) -> bool {
        !self.local
    }

    pub fn is_driver(&self) -> bool {
        self.role == UserRole::Driver
    }

    pub fn is_observer(&self) -> bool {
        self.role == UserRole::Observer
    }

    pub fn has_write_access(&self) -> bool {
        self.is_driver()
    }

    pub fn is_invitation_complete(&self) -> bool {
        self.invitation_complete
    }

    pub fn mark_invitation_complete(&mut self) {
        self.invitation_complete = true;
    }
}

/// Pool of free participant colors, owned by the host.
///
/// Colors `1..max` are handed out lowest first; color 0 belongs to the host
/// and never enters the pool.
#[derive(Debug, Clone)]
pub struct ColorPool {
    max: u8,
    free: BTreeSet<ColorId>,
}

impl ColorPool {
    pub fn new(max: u8) -> Self {
        Self {
            max,
            free: (1..max).map(ColorId).collect(),
        }
    }

    /// Take the lowest free color, or `None` when all are in use.
    pub fn acquire(&mut self) -> Option<ColorId> {
        self.free.pop_first()
    }

    /// Return a color to the pool. Returns `false` if the color is not a pool
    /// color or was already free.
    pub fn release(&mut self, color: ColorId) -> bool {
        if color == ColorId::HOST || color.0 >= self.max {
            return false;
        }
        self.free.insert(color)
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str) -> PeerId {
        PeerId::parse(format!("{name}@example.org/tandem")).unwrap()
    }

    #[test]
    fn test_host_user_defaults() {
        let host = User::host(peer("alice")).with_local(true);
        assert!(host.is_host());
        assert!(host.is_local());
        assert!(host.has_write_access());
        assert_eq!(host.color(), Some(ColorId::HOST));
    }

    #[test]
    fn test_role_change() {
        let mut user = User::new(peer("bob"), UserRole::Driver, Some(ColorId(1)));
        assert!(user.is_driver());
        user.set_role(UserRole::Observer);
        assert!(user.is_observer());
        assert!(!user.has_write_access());
    }

    #[test]
    fn test_color_pool_exhaustion() {
        let mut pool = ColorPool::new(5);
        let taken: Vec<_> = std::iter::from_fn(|| pool.acquire()).collect();
        assert_eq!(taken, vec![ColorId(1), ColorId(2), ColorId(3), ColorId(4)]);
        assert_eq!(pool.acquire(), None);
    }

    #[test]
    fn test_color_pool_release() {
        let mut pool = ColorPool::new(5);
        let first = pool.acquire().unwrap();
        let _second = pool.acquire().unwrap();
        assert!(pool.release(first));
        assert!(!pool.release(first));
        assert!(!pool.release(ColorId::HOST));
        assert!(!pool.release(ColorId(9)));
        assert_eq!(pool.acquire(), Some(first));
    }
}
