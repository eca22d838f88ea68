//! Action identifiers and payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Ordered, opaque argument list carried by every dispatch.
pub type Payload = Vec<Value>;

/// Numeric identifier routed by the [`Dispatcher`](crate::Dispatcher).
///
/// Two ids at the top of the range are reserved:
/// - [`ActionId::ANY`] matches any action lacking a more specific subscriber
/// - [`ActionId::UNDO`] triggers [`UndoManager::undo`](crate::UndoManager::undo)
///
/// Application ids may use any other value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(pub u32);

impl ActionId {
    /// Wildcard action.
    pub const ANY: ActionId = ActionId(u32::MAX);

    /// Reserved action that undoes the last committed group.
    pub const UNDO: ActionId = ActionId(u32::MAX - 1);

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Whether this id belongs to the reserved range.
    pub const fn is_reserved(self) -> bool {
        self.0 == Self::ANY.0 || self.0 == Self::UNDO.0
    }
}

impl From<u32> for ActionId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ANY => f.write_str("__ANY__"),
            Self::UNDO => f.write_str("UNDO"),
            Self(id) => write!(f, "{}", id),
        }
    }
}
