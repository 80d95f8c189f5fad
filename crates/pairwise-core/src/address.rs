//! Session endpoint addressing.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One session endpoint: a user and one of their devices.
///
/// All session and trust state is keyed by the full address, never by the
/// user alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress {
    user_id: String,
    device_id: u32,
}

impl PeerAddress {
    /// Create an address.
    pub fn new(user_id: impl Into<String>, device_id: u32) -> Self {
        Self { user_id: user_id.into(), device_id }
    }

    /// User identifier.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Device identifier.
    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    /// Storage key: `[user_id_len: u32 BE][user_id][device_id: u32 BE]`.
    ///
    /// Length-prefixed so no two addresses share a key.
    pub fn storage_key(&self) -> Vec<u8> {
        let user = self.user_id.as_bytes();
        let mut key = Vec::with_capacity(8 + user.len());
        key.extend_from_slice(&(user.len() as u32).to_be_bytes());
        key.extend_from_slice(user);
        key.extend_from_slice(&self.device_id.to_be_bytes());
        key
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.user_id, self.device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_keys_do_not_collide() {
        let a = PeerAddress::new("ab", 1);
        let b = PeerAddress::new("a", u32::from_be_bytes([b'b', 0, 0, 0]));

        assert_ne!(a.storage_key(), b.storage_key());
    }

    #[test]
    fn devices_of_one_user_are_distinct() {
        assert_ne!(PeerAddress::new("alice", 1), PeerAddress::new("alice", 2));
        assert_eq!(PeerAddress::new("alice", 1).to_string(), "alice.1");
    }
}
