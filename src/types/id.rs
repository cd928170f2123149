//! Task identifiers -- persistent and temporary.
//!
//! A [`TaskId`] is either *persistent* (assigned by the store on insert,
//! opaque to clients) or *temporary* (minted client-side, valid only until
//! a [`crate::reconcile::Reconciler`] maps it to a persistent id). The two
//! namespaces are distinguished by a fixed prefix so a caller can never
//! confuse one for the other by accident.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix tagging a client-minted id that has not yet been reconciled.
pub const TEMP_ID_PREFIX: &str = "tmp-";

/// Prefix tagging a store-assigned, durable id.
pub const PERSISTENT_ID_PREFIX: &str = "t-";

/// A task identifier, either persistent (`t-<uuid>`) or temporary (`tmp-<token>`).
///
/// # Examples
///
/// ```
/// use taskgraph_engine::types::TaskId;
///
/// let temp = TaskId::new_temporary("client-token-1");
/// assert!(temp.is_temporary());
///
/// let persistent = TaskId::new_persistent();
/// assert!(persistent.is_persistent());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Mints a fresh persistent id (`t-<uuidv4>`).
    pub fn new_persistent() -> Self {
        Self(format!("{PERSISTENT_ID_PREFIX}{}", Uuid::new_v4()))
    }

    /// Wraps an already-known persistent id string. Does not validate the
    /// prefix -- used when rehydrating ids from storage.
    pub fn from_persistent(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Mints a temporary id from a caller-supplied opaque token. The token
    /// is namespaced under [`TEMP_ID_PREFIX`] so it can never collide with
    /// a persistent id.
    pub fn new_temporary(token: impl AsRef<str>) -> Self {
        Self(format!("{TEMP_ID_PREFIX}{}", token.as_ref()))
    }

    /// Returns `true` if this id has not yet been reconciled to a
    /// persistent identity.
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }

    /// Returns `true` if this id was assigned by the store.
    pub fn is_persistent(&self) -> bool {
        !self.is_temporary()
    }

    /// Borrows the underlying string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for TaskId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistent_ids_carry_the_persistent_prefix() {
        let id = TaskId::new_persistent();
        assert!(id.as_str().starts_with(PERSISTENT_ID_PREFIX));
        assert!(id.is_persistent());
        assert!(!id.is_temporary());
    }

    #[test]
    fn temporary_ids_carry_the_temp_prefix() {
        let id = TaskId::new_temporary("client-token");
        assert_eq!(id.as_str(), "tmp-client-token");
        assert!(id.is_temporary());
        assert!(!id.is_persistent());
    }

    #[test]
    fn display_round_trips_the_raw_string() {
        let id = TaskId::from("t-abc123");
        assert_eq!(id.to_string(), "t-abc123");
    }

    #[test]
    fn two_fresh_persistent_ids_never_collide() {
        let a = TaskId::new_persistent();
        let b = TaskId::new_persistent();
        assert_ne!(a, b);
    }
}
