//! Error types for ledger operations.

use common::{CallbackSlot, KeyId, KeyState};
use thiserror::Error;

/// Errors returned synchronously by allocation, registration and resolution.
///
/// Every variant is a usage error or a contradiction; benign no-ops (resolving
/// a key to the state it already has, rejecting an accepted key) are `Ok`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// The zero key was passed where a real key is required.
    #[error("invalid prediction key")]
    InvalidKey,

    /// The key was never allocated, or has been forgotten.
    #[error("unknown prediction key {key}")]
    UnknownKey {
        /// The missing key.
        key: KeyId,
    },

    /// A dependent was requested on a base that is not in the ledger.
    #[error("cannot depend on unknown base key {base}")]
    UnknownBase {
        /// The missing base.
        base: KeyId,
    },

    /// `catch_up_to` was called on a key already known to have failed.
    #[error("cannot accept {key}: it is already rejected")]
    AcceptRejected {
        /// The rejected key.
        key: KeyId,
    },

    /// A second callback was registered on an occupied slot.
    #[error("{slot} already registered on {key}")]
    SlotOccupied {
        /// The key owning the slot.
        key: KeyId,
        /// The occupied slot.
        slot: CallbackSlot,
    },

    /// A silent drop was requested for a key that already resolved.
    #[error("cannot forget {key}: it is already {state}")]
    NotPending {
        /// The terminal key.
        key: KeyId,
        /// Its terminal state.
        state: KeyState,
    },

    /// Acceptance was asserted for a key whose ancestor is rejected.
    #[error("contradiction: {key} accepted on top of rejected ancestor {rejected_ancestor}")]
    Contradiction {
        /// The key being accepted.
        key: KeyId,
        /// The nearest rejected ancestor.
        rejected_ancestor: KeyId,
    },
}

impl LedgerError {
    /// Whether this error indicates broken bookkeeping rather than caller misuse.
    pub fn is_contradiction(&self) -> bool {
        matches!(self, LedgerError::Contradiction { .. })
    }
}
