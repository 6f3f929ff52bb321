pub mod config;

pub use config::{ChainBehavior, ConfigError, LedgerConfig};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one unit of speculative work.
///
/// Ids are handed out by a ledger in strictly increasing order, so a
/// dependent key always compares greater than its base. The zero value is
/// reserved for "no key".
///
/// # Examples
/// ```
/// # use common::KeyId;
/// assert!(!KeyId::INVALID.is_valid());
/// assert!(KeyId::from_raw(7).is_valid());
/// assert!(KeyId::from_raw(7) > KeyId::from_raw(3));
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(u64);

impl KeyId {
    /// The "not predicting" sentinel.
    pub const INVALID: KeyId = KeyId(0);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Returns `None` for the invalid sentinel, so callers can use `?`-style
    /// chaining on "current key" lookups.
    pub fn valid(self) -> Option<Self> {
        self.is_valid().then_some(self)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "K{}", self.0)
        } else {
            f.write_str("K-")
        }
    }
}

/// How the root of a key's chain was allocated.
///
/// Dependents inherit the origin of their base, so the classification is a
/// property of the whole chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum KeyOrigin {
    /// Generated locally by the predicting client.
    LocalClient = 0,
    /// Received already tagged by the authority.
    ServerInitiated = 1,
}

/// Resolution state of a key. `Accepted` and `Rejected` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum KeyState {
    Pending = 0,
    Accepted = 1,
    Rejected = 2,
}

impl KeyState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, KeyState::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KeyState::Pending => "pending",
            KeyState::Accepted => "accepted",
            KeyState::Rejected => "rejected",
        }
    }
}

impl fmt::Display for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the fixed callback slots carried by every key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CallbackSlot {
    /// Fires when the key is accepted.
    Accepted = 0,
    /// Fires when the key is rejected.
    Rejected = 1,
    /// Fires on either terminal transition.
    Resolved = 2,
}

impl CallbackSlot {
    pub const ALL: [CallbackSlot; 3] = [
        CallbackSlot::Accepted,
        CallbackSlot::Rejected,
        CallbackSlot::Resolved,
    ];

    /// Whether a callback in this slot should fire for a key that reached `state`.
    pub fn fires_for(self, state: KeyState) -> bool {
        match self {
            CallbackSlot::Accepted => state == KeyState::Accepted,
            CallbackSlot::Rejected => state == KeyState::Rejected,
            CallbackSlot::Resolved => state.is_terminal(),
        }
    }

    /// Position of this slot in a `[_; 3]` slot table.
    pub fn table_index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for CallbackSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackSlot::Accepted => f.write_str("on_accepted"),
            CallbackSlot::Rejected => f.write_str("on_rejected"),
            CallbackSlot::Resolved => f.write_str("on_resolved"),
        }
    }
}
