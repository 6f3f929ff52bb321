use crate::Ledger;
use common::{CallbackSlot, KeyId, KeyOrigin, KeyState};
use std::fmt;

/// One-shot resolution callback.
///
/// Receives the ledger mutably so it can allocate, accept or reject other
/// keys; nothing in the ledger is borrowed while it runs.
pub type Callback = Box<dyn FnOnce(&mut Ledger, KeyId)>;

/// Fixed callback table: one optional entry per [`CallbackSlot`].
#[derive(Default)]
pub(crate) struct CallbackSlots([Option<Callback>; 3]);

impl CallbackSlots {
    pub(crate) fn is_occupied(&self, slot: CallbackSlot) -> bool {
        self.0[slot.table_index()].is_some()
    }

    pub(crate) fn set(&mut self, slot: CallbackSlot, callback: Callback) {
        self.0[slot.table_index()] = Some(callback);
    }

    pub(crate) fn take(&mut self, slot: CallbackSlot) -> Option<Callback> {
        self.0[slot.table_index()].take()
    }

    /// Empties the table, returning the callbacks that fire for `state`:
    /// the matching slot first, then `Resolved`. The other slot is dropped.
    pub(crate) fn drain_for(&mut self, state: KeyState) -> Vec<Callback> {
        let matching = match state {
            KeyState::Accepted => CallbackSlot::Accepted,
            KeyState::Rejected => CallbackSlot::Rejected,
            KeyState::Pending => return Vec::new(),
        };
        let fired = [matching, CallbackSlot::Resolved]
            .into_iter()
            .filter_map(|slot| self.take(slot))
            .collect();
        *self = Self::default();
        fired
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.iter().all(Option::is_none)
    }
}

impl fmt::Debug for CallbackSlots {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(CallbackSlot::ALL.iter().filter(|s| self.is_occupied(**s)))
            .finish()
    }
}

/// A single allocated key and its bookkeeping.
#[derive(Debug)]
pub struct KeyNode {
    pub(crate) id: KeyId,
    pub(crate) base: Option<KeyId>,
    pub(crate) origin: KeyOrigin,
    pub(crate) state: KeyState,
    /// Keys whose base is this node, ascending.
    pub(crate) dependents: Vec<KeyId>,
    pub(crate) callbacks: CallbackSlots,
    /// Hidden from the `CatchUpEarlier` sweep; inherited by dependents.
    pub(crate) detached: bool,
}

impl KeyNode {
    pub(crate) fn new(id: KeyId, base: Option<KeyId>, origin: KeyOrigin, state: KeyState) -> Self {
        Self {
            id,
            base,
            origin,
            state,
            dependents: Vec::new(),
            callbacks: CallbackSlots::default(),
            detached: false,
        }
    }

    pub fn id(&self) -> KeyId {
        self.id
    }

    /// The key this one depends on; `None` for a root.
    pub fn base(&self) -> Option<KeyId> {
        self.base
    }

    pub fn origin(&self) -> KeyOrigin {
        self.origin
    }

    pub fn state(&self) -> KeyState {
        self.state
    }

    pub fn dependents(&self) -> &[KeyId] {
        &self.dependents
    }

    pub fn is_root(&self) -> bool {
        self.base.is_none()
    }

    /// Whether a callback is waiting in `slot`.
    pub fn has_callback(&self, slot: CallbackSlot) -> bool {
        self.callbacks.is_occupied(slot)
    }

    pub fn has_callbacks(&self) -> bool {
        !self.callbacks.is_empty()
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }
}

/// What the ledger remembers about a reclaimed key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tombstone {
    pub(crate) base: Option<KeyId>,
    pub(crate) origin: KeyOrigin,
    pub(crate) state: KeyState,
}
