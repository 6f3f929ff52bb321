//! # Prediction Key Ledger
//!
//! Owns every allocated prediction key and resolves them as confirmations
//! arrive. Keys form a forest: each dependent key names the key it was
//! predicted on top of (its base).
//!
//! Acceptance travels toward the root ([`Ledger::catch_up_to`]); rejection
//! travels toward dependents ([`Ledger::reject`]). Each key resolves at most
//! once and each of its callback slots fires at most once.
//!
//! The ledger is a plain value: construct one per predicting session and
//! pass it by reference. It is single-threaded; callbacks receive
//! `&mut Ledger` and may re-enter any operation.

mod engine;
pub mod error;
pub mod node;
pub mod snapshot;

pub use common::{CallbackSlot, ChainBehavior, KeyId, KeyOrigin, KeyState, LedgerConfig};
pub use error::LedgerError;
pub use node::{Callback, KeyNode};
pub use snapshot::{KeySnapshot, LedgerSnapshot};

use node::Tombstone;
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use tracing::debug;

/// Key registry and resolution engine.
pub struct Ledger {
    nodes: BTreeMap<KeyId, KeyNode>,
    /// Reclaimed keys keep answering with their terminal state.
    reclaimed: BTreeMap<KeyId, Tombstone>,
    /// Next raw id to hand out. Ids are never reused, even after reclaim.
    next_id: u64,
    config: LedgerConfig,
    /// Nesting level of resolution calls and callback invocations.
    dispatch_depth: usize,
}

impl Ledger {
    /// Creates an empty ledger with the default configuration.
    pub fn new() -> Self {
        Self::with_config(LedgerConfig::default())
    }

    pub fn with_config(config: LedgerConfig) -> Self {
        Self {
            nodes: BTreeMap::new(),
            reclaimed: BTreeMap::new(),
            next_id: 1,
            config,
            dispatch_depth: 0,
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    // --- allocation ---

    /// Allocates a new locally generated root key.
    pub fn allocate_root(&mut self) -> KeyId {
        self.insert_root(KeyOrigin::LocalClient)
    }

    /// Allocates a new root key tagged as initiated by the authority.
    pub fn allocate_server_initiated(&mut self) -> KeyId {
        self.insert_root(KeyOrigin::ServerInitiated)
    }

    /// Allocates a key that causally depends on `base`.
    ///
    /// `base` may already be resolved, or even reclaimed. A dependent of an
    /// accepted base starts `Pending`; a dependent of a rejected base is born
    /// `Rejected`, since nothing predicated on a known failure can succeed.
    ///
    /// # Examples
    /// ```
    /// # use ledger::{Ledger, KeyState};
    /// let mut ledger = Ledger::new();
    /// let root = ledger.allocate_root();
    /// let child = ledger.allocate_dependent(root).unwrap();
    /// assert!(child > root);
    /// assert_eq!(ledger.state(child), Some(KeyState::Pending));
    /// ```
    pub fn allocate_dependent(&mut self, base: KeyId) -> Result<KeyId, LedgerError> {
        if !base.is_valid() {
            return Err(LedgerError::InvalidKey);
        }
        let found = (self.nodes.get(&base), self.reclaimed.get(&base));
        let (origin, base_state, detached) = match found {
            (Some(node), _) => (node.origin, node.state, node.detached),
            (None, Some(tomb)) => (tomb.origin, tomb.state, false),
            (None, None) => return Err(LedgerError::UnknownBase { base }),
        };
        let state = if base_state == KeyState::Rejected {
            KeyState::Rejected
        } else {
            KeyState::Pending
        };

        let id = self.next_key();
        let mut node = KeyNode::new(id, Some(base), origin, state);
        node.detached = detached;
        self.nodes.insert(id, node);
        if let Some(base_node) = self.nodes.get_mut(&base) {
            base_node.dependents.push(id);
        }
        debug!(key = %id, %base, %state, "allocated dependent key");
        Ok(id)
    }

    fn insert_root(&mut self, origin: KeyOrigin) -> KeyId {
        let id = self.next_key();
        self.nodes
            .insert(id, KeyNode::new(id, None, origin, KeyState::Pending));
        debug!(key = %id, ?origin, "allocated root key");
        id
    }

    fn next_key(&mut self) -> KeyId {
        let id = KeyId::from_raw(self.next_id);
        self.next_id += 1;
        id
    }

    // --- queries ---

    pub fn get(&self, id: KeyId) -> Option<&KeyNode> {
        self.nodes.get(&id)
    }

    /// State of `id`. Reclaimed keys keep reporting their terminal state;
    /// forgotten and never-allocated keys yield `None`.
    pub fn state(&self, id: KeyId) -> Option<KeyState> {
        self.link(id).map(|(_, state)| state)
    }

    /// Whether the key is still held (not forgotten, not reclaimed).
    pub fn contains(&self, id: KeyId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Returns the number of keys currently held.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if the ledger holds no keys.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|node| node.state == KeyState::Pending)
            .count()
    }

    /// Iterates over all held keys in ascending id order.
    pub fn keys(&self) -> impl Iterator<Item = &KeyNode> {
        self.nodes.values()
    }

    pub fn is_reclaimed(&self, id: KeyId) -> bool {
        self.reclaimed.contains_key(&id)
    }

    pub fn is_valid(&self, id: KeyId) -> bool {
        id.is_valid()
    }

    pub fn is_local_client_key(&self, id: KeyId) -> bool {
        self.origin(id) == Some(KeyOrigin::LocalClient)
    }

    pub fn is_server_initiated_key(&self, id: KeyId) -> bool {
        self.origin(id) == Some(KeyOrigin::ServerInitiated)
    }

    /// Whether further predictions may be stacked on `id`: it must be a
    /// locally generated key that has not resolved yet.
    pub fn is_valid_for_more_prediction(&self, id: KeyId) -> bool {
        self.nodes.get(&id).is_some_and(|node| {
            node.origin == KeyOrigin::LocalClient && node.state == KeyState::Pending
        })
    }

    /// Hides a pending key from the `CatchUpEarlier` sweep. Keys predicted
    /// on it later inherit the mark. Explicit confirmations still resolve
    /// it; a resolved key is left as is.
    pub fn detach(&mut self, id: KeyId) -> Result<(), LedgerError> {
        self.require(id)?;
        if let Some(node) = self.nodes.get_mut(&id) {
            if node.state == KeyState::Pending {
                node.detached = true;
            }
        }
        Ok(())
    }

    fn origin(&self, id: KeyId) -> Option<KeyOrigin> {
        match self.nodes.get(&id) {
            Some(node) => Some(node.origin),
            None => self.reclaimed.get(&id).map(|tomb| tomb.origin),
        }
    }

    /// `(base, state)` of a held or reclaimed key.
    fn link(&self, id: KeyId) -> Option<(Option<KeyId>, KeyState)> {
        match self.nodes.get(&id) {
            Some(node) => Some((node.base, node.state)),
            None => self.reclaimed.get(&id).map(|tomb| (tomb.base, tomb.state)),
        }
    }

    /// Looks up the state of `key`, rejecting the sentinel and unknown ids.
    fn require(&self, key: KeyId) -> Result<KeyState, LedgerError> {
        if !key.is_valid() {
            return Err(LedgerError::InvalidKey);
        }
        self.state(key).ok_or(LedgerError::UnknownKey { key })
    }

    // --- callbacks ---

    /// Registers `callback` in `slot` of `id`.
    ///
    /// If `id` has already resolved the callback runs immediately (when the
    /// slot matches the outcome) instead of being stored, so late
    /// registrations never miss the notification.
    pub fn register_callback(
        &mut self,
        id: KeyId,
        slot: CallbackSlot,
        callback: Callback,
    ) -> Result<(), LedgerError> {
        let state = self.require(id)?;
        if state.is_terminal() {
            if slot.fires_for(state) {
                self.invoke(callback, id);
            } else {
                debug!(key = %id, %slot, %state, "slot cannot fire for resolved key; dropped");
            }
            return Ok(());
        }

        let node = self
            .nodes
            .get_mut(&id)
            .ok_or(LedgerError::UnknownKey { key: id })?;
        if node.callbacks.is_occupied(slot) {
            return Err(LedgerError::SlotOccupied { key: id, slot });
        }
        node.callbacks.set(slot, callback);
        Ok(())
    }

    pub fn on_accepted<F>(&mut self, id: KeyId, f: F) -> Result<(), LedgerError>
    where
        F: FnOnce(&mut Ledger, KeyId) + 'static,
    {
        self.register_callback(id, CallbackSlot::Accepted, Box::new(f))
    }

    pub fn on_rejected<F>(&mut self, id: KeyId, f: F) -> Result<(), LedgerError>
    where
        F: FnOnce(&mut Ledger, KeyId) + 'static,
    {
        self.register_callback(id, CallbackSlot::Rejected, Box::new(f))
    }

    /// Registers a callback fired on either outcome.
    pub fn on_resolved<F>(&mut self, id: KeyId, f: F) -> Result<(), LedgerError>
    where
        F: FnOnce(&mut Ledger, KeyId) + 'static,
    {
        self.register_callback(id, CallbackSlot::Resolved, Box::new(f))
    }

    /// Removes a stored callback so the slot can be registered again.
    pub fn clear_callback(&mut self, id: KeyId, slot: CallbackSlot) -> Option<Callback> {
        self.nodes.get_mut(&id)?.callbacks.take(slot)
    }

    fn invoke(&mut self, callback: Callback, key: KeyId) {
        let mut dispatch = self.enter_dispatch();
        callback(&mut *dispatch, key);
    }

    fn enter_dispatch(&mut self) -> Dispatch<'_> {
        self.dispatch_depth += 1;
        Dispatch { ledger: self }
    }
}

/// Holds `dispatch_depth` raised until dropped, unwinding included.
struct Dispatch<'a> {
    ledger: &'a mut Ledger,
}

impl Deref for Dispatch<'_> {
    type Target = Ledger;

    fn deref(&self) -> &Ledger {
        &*self.ledger
    }
}

impl DerefMut for Dispatch<'_> {
    fn deref_mut(&mut self) -> &mut Ledger {
        &mut *self.ledger
    }
}

impl Drop for Dispatch<'_> {
    fn drop(&mut self) {
        self.ledger.dispatch_depth -= 1;
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("keys", &self.nodes.len())
            .field("reclaimed", &self.reclaimed.len())
            .field("next_id", &self.next_id)
            .field("config", &self.config)
            .finish()
    }
}
