//! Serializable point-in-time view of a ledger, for logs and tooling.

use crate::Ledger;
use common::{KeyId, KeyOrigin, KeyState};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySnapshot {
    pub id: KeyId,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub base: Option<KeyId>,
    pub origin: KeyOrigin,
    pub state: KeyState,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub dependents: Vec<KeyId>,
}

/// All keys held by a ledger, ascending by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub keys: Vec<KeySnapshot>,
}

impl LedgerSnapshot {
    pub fn state_of(&self, id: KeyId) -> Option<KeyState> {
        self.keys
            .binary_search_by_key(&id, |key| key.id)
            .ok()
            .map(|idx| self.keys[idx].state)
    }

    /// Counts of `(pending, accepted, rejected)` keys.
    pub fn counts(&self) -> (usize, usize, usize) {
        self.keys
            .iter()
            .fold((0, 0, 0), |(p, a, r), key| match key.state {
                KeyState::Pending => (p + 1, a, r),
                KeyState::Accepted => (p, a + 1, r),
                KeyState::Rejected => (p, a, r + 1),
            })
    }
}

impl Ledger {
    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            keys: self
                .keys()
                .map(|node| KeySnapshot {
                    id: node.id(),
                    base: node.base(),
                    origin: node.origin(),
                    state: node.state(),
                    dependents: node.dependents().to_vec(),
                })
                .collect(),
        }
    }
}
