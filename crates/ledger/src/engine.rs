//! Resolution engine: acceptance, rejection, silent removal and reclamation.
//!
//! ## Dispatch order
//! - `catch_up_to` accepts **root-first**: the oldest pending ancestor fires
//!   its callbacks before its dependents do, ending with the confirmed key.
//! - `reject` cascades **depth-first pre-order**: a node fires before any of
//!   its dependents; dependents are visited in ascending id order.
//! - Within one node the matching slot fires before `on_resolved`.
//!
//! Every propagation runs from an explicit work-list of ids. A node is
//! transitioned and its callbacks are moved out before they run, so a callback
//! may re-enter the ledger freely; entries changed by a reentrant call are
//! skipped when the work-list reaches them.

use crate::node::Tombstone;
use crate::{Ledger, LedgerError};
use common::{ChainBehavior, KeyId, KeyState};
use tracing::{debug, error};

impl Ledger {
    /// Confirms `key` and every pending key it depends on.
    ///
    /// Idempotent for an accepted key. Fails without changing anything when
    /// `key` is already rejected: [`LedgerError::Contradiction`] if the
    /// failure came from a rejected ancestor, [`LedgerError::AcceptRejected`]
    /// otherwise.
    pub fn catch_up_to(&mut self, key: KeyId) -> Result<(), LedgerError> {
        let outcome = self.accept_chain(key);
        self.after_dispatch();
        outcome
    }

    /// Fails `key` and, transitively, everything that depends on it.
    ///
    /// A no-op for a key that is already rejected or already accepted: a
    /// stale rejection never overturns a confirmation. Ancestors are never
    /// touched.
    pub fn reject(&mut self, key: KeyId) -> Result<(), LedgerError> {
        let outcome = self.reject_subtree(key);
        self.after_dispatch();
        outcome
    }

    /// Removes a pending key and its whole dependent subtree without any
    /// transition and without firing callbacks.
    ///
    /// Returns the number of removed keys.
    pub fn forget(&mut self, key: KeyId) -> Result<usize, LedgerError> {
        let outcome = self.forget_subtree(key);
        self.after_dispatch();
        outcome
    }

    /// Removes every tree whose keys have all resolved.
    ///
    /// Resolved keys hold no callbacks, so a fully resolved tree has nothing
    /// left to notify. Each removed key leaves a tombstone behind, so it
    /// keeps answering queries and confirmations with its terminal state.
    /// Returns the number of removed keys.
    pub fn reclaim(&mut self) -> usize {
        // Trees hanging off an already reclaimed base count as roots.
        let roots: Vec<KeyId> = self
            .nodes
            .values()
            .filter(|node| node.base.map_or(true, |base| !self.nodes.contains_key(&base)))
            .map(|node| node.id)
            .collect();

        let mut removed = 0usize;
        for root in roots {
            let Some(tree) = self.resolved_tree(root) else {
                continue;
            };
            for id in &tree {
                if let Some(node) = self.nodes.remove(id) {
                    self.reclaimed.insert(
                        *id,
                        Tombstone {
                            base: node.base,
                            origin: node.origin,
                            state: node.state,
                        },
                    );
                }
            }
            removed += tree.len();
        }
        if removed > 0 {
            debug!(removed, remaining = self.nodes.len(), "reclaimed resolved keys");
        }
        removed
    }

    // --- private ---

    fn accept_chain(&mut self, key: KeyId) -> Result<(), LedgerError> {
        match self.require(key)? {
            KeyState::Accepted => {
                debug!(%key, "already accepted");
                return Ok(());
            }
            KeyState::Rejected => {
                return Err(match self.rejected_ancestor(key) {
                    Some(rejected_ancestor) => LedgerError::Contradiction {
                        key,
                        rejected_ancestor,
                    },
                    None => LedgerError::AcceptRejected { key },
                });
            }
            KeyState::Pending => {}
        }

        let chain = match self.pending_chain(key) {
            Ok(chain) => chain,
            Err((rejected_ancestor, topmost_pending)) => {
                error!(
                    %key,
                    %rejected_ancestor,
                    "pending key found above a rejected ancestor; rejecting the chain"
                );
                self.reject_subtree(topmost_pending)?;
                return Err(LedgerError::Contradiction {
                    key,
                    rejected_ancestor,
                });
            }
        };

        {
            let mut dispatch = self.enter_dispatch();
            for id in chain.into_iter().rev() {
                dispatch.transition(id, KeyState::Accepted);
            }
            if dispatch.config.chain_behavior == ChainBehavior::CatchUpEarlier {
                dispatch.catch_up_earlier(key);
            }
        }

        // A callback fired on the way may have rejected or forgotten `key`.
        match self.state(key) {
            Some(KeyState::Rejected) => Err(LedgerError::AcceptRejected { key }),
            Some(_) => Ok(()),
            None => Err(LedgerError::UnknownKey { key }),
        }
    }

    fn reject_subtree(&mut self, key: KeyId) -> Result<(), LedgerError> {
        match self.require(key)? {
            KeyState::Accepted => {
                debug!(%key, "ignoring rejection of accepted key");
                return Ok(());
            }
            KeyState::Rejected => return Ok(()),
            KeyState::Pending => {}
        }

        let mut dispatch = self.enter_dispatch();
        let mut stack = vec![key];
        while let Some(id) = stack.pop() {
            // Non-pending entries already carry the cascade below them.
            if !dispatch.transition(id, KeyState::Rejected) {
                continue;
            }
            if let Some(node) = dispatch.nodes.get(&id) {
                stack.extend(node.dependents.iter().rev().copied());
            }
        }
        Ok(())
    }

    fn forget_subtree(&mut self, key: KeyId) -> Result<usize, LedgerError> {
        let state = self.require(key)?;
        if state.is_terminal() {
            return Err(LedgerError::NotPending { key, state });
        }

        if let Some(base) = self.nodes.get(&key).and_then(|node| node.base) {
            if let Some(base_node) = self.nodes.get_mut(&base) {
                base_node.dependents.retain(|dependent| *dependent != key);
            }
        }

        let mut removed = 0usize;
        let mut stack = vec![key];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.remove(&id) {
                removed += 1;
                stack.extend(node.dependents);
            }
        }
        debug!(%key, removed, "forgot key");
        Ok(removed)
    }

    /// Moves `id` from `Pending` to `target` and fires its callbacks.
    ///
    /// Returns `false` (and does nothing) when `id` is gone or not pending.
    fn transition(&mut self, id: KeyId, target: KeyState) -> bool {
        let callbacks = match self.nodes.get_mut(&id) {
            Some(node) if node.state == KeyState::Pending => {
                node.state = target;
                node.callbacks.drain_for(target)
            }
            _ => return false,
        };
        debug!(key = %id, state = %target, "key resolved");
        for callback in callbacks {
            self.invoke(callback, id);
        }
        true
    }

    /// Collects `key` and its pending ancestors, nearest first.
    ///
    /// `Err((rejected_ancestor, topmost_pending))` when the walk meets a
    /// rejected ancestor.
    fn pending_chain(&self, key: KeyId) -> Result<Vec<KeyId>, (KeyId, KeyId)> {
        let mut chain = vec![key];
        let mut cursor = self.link(key).and_then(|(base, _)| base);
        while let Some(id) = cursor {
            let Some((base, state)) = self.link(id) else {
                break;
            };
            match state {
                KeyState::Pending => {
                    chain.push(id);
                    cursor = base;
                }
                KeyState::Accepted => break,
                KeyState::Rejected => {
                    let topmost = chain.last().copied().unwrap_or(key);
                    return Err((id, topmost));
                }
            }
        }
        Ok(chain)
    }

    fn rejected_ancestor(&self, key: KeyId) -> Option<KeyId> {
        let mut cursor = self.link(key)?.0;
        while let Some(id) = cursor {
            let (base, state) = self.link(id)?;
            if state == KeyState::Rejected {
                return Some(id);
            }
            cursor = base;
        }
        None
    }

    /// Accepts earlier pending keys of the same origin. Detached keys are
    /// left alone.
    fn catch_up_earlier(&mut self, key: KeyId) {
        let Some(origin) = self.nodes.get(&key).map(|node| node.origin) else {
            return;
        };
        let earlier: Vec<KeyId> = self
            .nodes
            .range(..key)
            .filter(|(_, node)| {
                node.state == KeyState::Pending && node.origin == origin && !node.detached
            })
            .map(|(id, _)| *id)
            .collect();
        for id in earlier {
            self.transition(id, KeyState::Accepted);
        }
    }

    /// Ids of the tree under `root`, or `None` if any of them is pending.
    fn resolved_tree(&self, root: KeyId) -> Option<Vec<KeyId>> {
        let mut tree = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let node = self.nodes.get(&id)?;
            if node.state == KeyState::Pending {
                return None;
            }
            tree.push(id);
            stack.extend(node.dependents.iter().copied());
        }
        Some(tree)
    }

    fn after_dispatch(&mut self) {
        if self.dispatch_depth == 0 && self.config.auto_reclaim {
            self.reclaim();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Ledger, LedgerConfig, LedgerError};
    use common::{ChainBehavior, KeyId, KeyOrigin, KeyState};
    use std::cell::RefCell;
    use std::rc::Rc;

    type EventLog = Rc<RefCell<Vec<(KeyId, &'static str)>>>;

    /// Registers all three slots on `key`, each appending to `log`.
    fn watch(ledger: &mut Ledger, key: KeyId, log: &EventLog) {
        let l = Rc::clone(log);
        ledger
            .on_accepted(key, move |_, k| l.borrow_mut().push((k, "accepted")))
            .unwrap();
        let l = Rc::clone(log);
        ledger
            .on_rejected(key, move |_, k| l.borrow_mut().push((k, "rejected")))
            .unwrap();
        let l = Rc::clone(log);
        ledger
            .on_resolved(key, move |_, k| l.borrow_mut().push((k, "resolved")))
            .unwrap();
    }

    fn chain(ledger: &mut Ledger, len: usize) -> Vec<KeyId> {
        let mut keys = vec![ledger.allocate_root()];
        for _ in 1..len {
            let base = *keys.last().unwrap();
            keys.push(ledger.allocate_dependent(base).unwrap());
        }
        keys
    }

    fn states(ledger: &Ledger, keys: &[KeyId]) -> Vec<KeyState> {
        keys.iter().map(|k| ledger.state(*k).unwrap()).collect()
    }

    use KeyState::{Accepted as A, Pending as P, Rejected as R};

    #[test]
    fn test_catch_up_accepts_ancestors() {
        let mut ledger = Ledger::new();
        let keys = chain(&mut ledger, 3);
        ledger.catch_up_to(keys[2]).unwrap();
        assert_eq!(states(&ledger, &keys), vec![A, A, A]);
    }

    #[test]
    fn test_catch_up_stops_at_accepted_ancestor() {
        let mut ledger = Ledger::new();
        let keys = chain(&mut ledger, 4);
        ledger.catch_up_to(keys[1]).unwrap();
        assert_eq!(states(&ledger, &keys), vec![A, A, P, P]);

        let log: EventLog = Rc::default();
        watch(&mut ledger, keys[3], &log);
        ledger.catch_up_to(keys[3]).unwrap();
        assert_eq!(states(&ledger, &keys), vec![A, A, A, A]);
        assert_eq!(
            *log.borrow(),
            vec![(keys[3], "accepted"), (keys[3], "resolved")]
        );
    }

    #[test]
    fn test_accept_does_not_touch_dependents() {
        let mut ledger = Ledger::new();
        let root = ledger.allocate_root();
        let left = ledger.allocate_dependent(root).unwrap();
        let right = ledger.allocate_dependent(root).unwrap();
        let grandchild = ledger.allocate_dependent(left).unwrap();

        ledger.catch_up_to(left).unwrap();
        assert_eq!(ledger.state(root), Some(A));
        assert_eq!(ledger.state(left), Some(A));
        assert_eq!(ledger.state(right), Some(P));
        assert_eq!(ledger.state(grandchild), Some(P));
    }

    #[test]
    fn test_reject_cascades_down_only() {
        let mut ledger = Ledger::new();
        let keys = chain(&mut ledger, 3);
        ledger.reject(keys[1]).unwrap();
        assert_eq!(states(&ledger, &keys), vec![P, R, R]);
    }

    #[test]
    fn test_reject_leaves_siblings() {
        let mut ledger = Ledger::new();
        let root = ledger.allocate_root();
        let a = ledger.allocate_dependent(root).unwrap();
        let b = ledger.allocate_dependent(root).unwrap();
        ledger.reject(a).unwrap();
        assert_eq!(ledger.state(root), Some(P));
        assert_eq!(ledger.state(b), Some(P));
    }

    #[test]
    fn test_idempotence() {
        let mut ledger = Ledger::new();
        let keys = chain(&mut ledger, 2);
        let other = ledger.allocate_root();

        let log: EventLog = Rc::default();
        watch(&mut ledger, keys[1], &log);
        watch(&mut ledger, other, &log);

        ledger.catch_up_to(keys[1]).unwrap();
        ledger.catch_up_to(keys[1]).unwrap();
        ledger.reject(other).unwrap();
        ledger.reject(other).unwrap();

        assert_eq!(
            *log.borrow(),
            vec![
                (keys[1], "accepted"),
                (keys[1], "resolved"),
                (other, "rejected"),
                (other, "resolved"),
            ]
        );
    }

    #[test]
    fn test_accept_wins_over_late_reject() {
        let mut ledger = Ledger::new();
        let key = ledger.allocate_root();
        let log: EventLog = Rc::default();
        watch(&mut ledger, key, &log);

        ledger.catch_up_to(key).unwrap();
        ledger.reject(key).unwrap();
        assert_eq!(ledger.state(key), Some(A));
        assert_eq!(log.borrow().len(), 2);
    }

    #[test]
    fn test_accept_rejected_root_is_usage_error() {
        let mut ledger = Ledger::new();
        let key = ledger.allocate_root();
        ledger.reject(key).unwrap();
        assert_eq!(
            ledger.catch_up_to(key),
            Err(LedgerError::AcceptRejected { key })
        );
        assert_eq!(ledger.state(key), Some(R));
    }

    #[test]
    fn test_exactly_once_per_key() {
        let mut ledger = Ledger::new();
        let keys = chain(&mut ledger, 4);
        let log: EventLog = Rc::default();
        for key in &keys {
            watch(&mut ledger, *key, &log);
        }

        ledger.reject(keys[2]).unwrap();
        ledger.catch_up_to(keys[1]).unwrap();
        ledger.reject(keys[0]).unwrap();
        ledger.reject(keys[3]).unwrap();
        assert!(ledger.catch_up_to(keys[3]).is_err());

        for key in &keys {
            let events: Vec<&str> = log
                .borrow()
                .iter()
                .filter(|(k, _)| k == key)
                .map(|(_, e)| *e)
                .collect();
            assert_eq!(events.len(), 2, "{key}: {events:?}");
            assert_eq!(events[1], "resolved");
        }
    }

    #[test]
    fn test_catch_up_fires_root_first() {
        let mut ledger = Ledger::new();
        let keys = chain(&mut ledger, 3);
        let log: EventLog = Rc::default();
        for key in &keys {
            watch(&mut ledger, *key, &log);
        }

        ledger.catch_up_to(keys[2]).unwrap();
        assert_eq!(
            *log.borrow(),
            vec![
                (keys[0], "accepted"),
                (keys[0], "resolved"),
                (keys[1], "accepted"),
                (keys[1], "resolved"),
                (keys[2], "accepted"),
                (keys[2], "resolved"),
            ]
        );
    }

    #[test]
    fn test_reject_fires_preorder() {
        let mut ledger = Ledger::new();
        let root = ledger.allocate_root();
        let a = ledger.allocate_dependent(root).unwrap();
        let b = ledger.allocate_dependent(root).unwrap();
        let a1 = ledger.allocate_dependent(a).unwrap();

        let log: EventLog = Rc::default();
        for key in [root, a, b, a1] {
            let l = Rc::clone(&log);
            ledger
                .on_rejected(key, move |_, k| l.borrow_mut().push((k, "rejected")))
                .unwrap();
        }

        ledger.reject(root).unwrap();
        let order: Vec<KeyId> = log.borrow().iter().map(|(k, _)| *k).collect();
        assert_eq!(order, vec![root, a, a1, b]);
    }

    #[test]
    fn test_scenario_fan_out() {
        // K0 <- K1 <- {K2, K3}
        let mut ledger = Ledger::new();
        let k0 = ledger.allocate_root();
        let k1 = ledger.allocate_dependent(k0).unwrap();
        let k2 = ledger.allocate_dependent(k1).unwrap();
        let k3 = ledger.allocate_dependent(k1).unwrap();
        let keys = [k0, k1, k2, k3];

        ledger.reject(k3).unwrap();
        assert_eq!(states(&ledger, &keys), vec![P, P, P, R]);

        ledger.catch_up_to(k2).unwrap();
        assert_eq!(states(&ledger, &keys), vec![A, A, A, R]);
    }

    #[test]
    fn test_scenario_contradiction() {
        // K0 <- K1 <- K2 <- K3
        let mut ledger = Ledger::new();
        let keys = chain(&mut ledger, 4);

        ledger.reject(keys[1]).unwrap();
        assert_eq!(states(&ledger, &keys), vec![P, R, R, R]);

        let err = ledger.catch_up_to(keys[3]).unwrap_err();
        assert_eq!(
            err,
            LedgerError::Contradiction {
                key: keys[3],
                rejected_ancestor: keys[1]
            }
        );
        assert!(err.is_contradiction());
        assert_eq!(states(&ledger, &keys), vec![P, R, R, R]);
    }

    #[test]
    fn test_pending_above_rejected_ancestor_fails_safe() {
        let mut ledger = Ledger::new();
        let keys = chain(&mut ledger, 3);
        // Corrupt the ledger: reject the root without cascading.
        ledger.nodes.get_mut(&keys[0]).unwrap().state = R;

        let err = ledger.catch_up_to(keys[2]).unwrap_err();
        assert_eq!(
            err,
            LedgerError::Contradiction {
                key: keys[2],
                rejected_ancestor: keys[0]
            }
        );
        assert_eq!(states(&ledger, &keys), vec![R, R, R]);
    }

    #[test]
    fn test_unknown_and_invalid_keys() {
        let mut ledger = Ledger::new();
        let ghost = KeyId::from_raw(3);
        assert_eq!(ledger.catch_up_to(ghost), Err(LedgerError::UnknownKey { key: ghost }));
        assert_eq!(ledger.reject(ghost), Err(LedgerError::UnknownKey { key: ghost }));
        assert_eq!(ledger.catch_up_to(KeyId::INVALID), Err(LedgerError::InvalidKey));
        assert_eq!(ledger.reject(KeyId::INVALID), Err(LedgerError::InvalidKey));
    }

    #[test]
    fn test_callback_allocates_and_accepts() {
        let mut ledger = Ledger::new();
        let root = ledger.allocate_root();
        let spawned: Rc<RefCell<Option<KeyId>>> = Rc::default();

        let slot = Rc::clone(&spawned);
        ledger
            .on_accepted(root, move |ledger, key| {
                let child = ledger.allocate_dependent(key).unwrap();
                ledger.catch_up_to(child).unwrap();
                *slot.borrow_mut() = Some(child);
            })
            .unwrap();

        ledger.catch_up_to(root).unwrap();
        let child = spawned.borrow().unwrap();
        assert_eq!(ledger.state(child), Some(A));
        assert_eq!(ledger.get(child).unwrap().base(), Some(root));
    }

    #[test]
    fn test_callback_rejects_descendant_mid_catch_up() {
        let mut ledger = Ledger::new();
        let keys = chain(&mut ledger, 3);
        let target = keys[2];
        ledger
            .on_accepted(keys[0], move |ledger, _| ledger.reject(target).unwrap())
            .unwrap();

        assert_eq!(
            ledger.catch_up_to(target),
            Err(LedgerError::AcceptRejected { key: target })
        );
        assert_eq!(states(&ledger, &keys), vec![A, A, R]);
    }

    #[test]
    fn test_callback_rejects_sibling_during_cascade() {
        let mut ledger = Ledger::new();
        let root = ledger.allocate_root();
        let a = ledger.allocate_dependent(root).unwrap();
        let b = ledger.allocate_dependent(root).unwrap();
        let other = ledger.allocate_root();
        let count = Rc::new(RefCell::new(0));

        ledger
            .on_rejected(a, move |ledger, _| {
                ledger.reject(b).unwrap();
                ledger.catch_up_to(other).unwrap();
            })
            .unwrap();
        let c = Rc::clone(&count);
        ledger
            .on_rejected(b, move |_, _| *c.borrow_mut() += 1)
            .unwrap();

        ledger.reject(root).unwrap();
        assert_eq!(ledger.state(b), Some(R));
        assert_eq!(ledger.state(other), Some(A));
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn test_callback_forgets_pending_dependent() {
        let mut ledger = Ledger::new();
        let root = ledger.allocate_root();
        let child = ledger.allocate_dependent(root).unwrap();
        ledger
            .on_rejected(child, |_, _| panic!("forgotten key fired"))
            .unwrap();
        ledger
            .on_rejected(root, move |ledger, _| {
                ledger.forget(child).unwrap();
            })
            .unwrap();

        ledger.reject(root).unwrap();
        assert!(!ledger.contains(child));
    }

    #[test]
    fn test_deep_chain_does_not_overflow() {
        let mut ledger = Ledger::new();
        let keys = chain(&mut ledger, 20_000);
        ledger.reject(keys[0]).unwrap();
        assert_eq!(ledger.pending_count(), 0);

        let keys = chain(&mut ledger, 20_000);
        ledger.catch_up_to(*keys.last().unwrap()).unwrap();
        assert!(keys.iter().all(|k| ledger.state(*k) == Some(A)));
    }

    #[test]
    fn test_catch_up_earlier_behavior() {
        let mut ledger = Ledger::with_config(LedgerConfig {
            chain_behavior: ChainBehavior::CatchUpEarlier,
            ..LedgerConfig::default()
        });
        let first = ledger.allocate_root();
        let server = ledger.allocate_server_initiated();
        let dropped = ledger.allocate_root();
        let second = ledger.allocate_root();
        let later = ledger.allocate_root();
        ledger.reject(dropped).unwrap();

        ledger.catch_up_to(second).unwrap();
        assert_eq!(ledger.state(first), Some(A));
        assert_eq!(ledger.state(second), Some(A));
        assert_eq!(ledger.state(dropped), Some(R));
        assert_eq!(ledger.state(server), Some(P));
        assert_eq!(ledger.state(later), Some(P));
        assert_eq!(ledger.get(server).unwrap().origin(), KeyOrigin::ServerInitiated);
    }

    #[test]
    fn test_forget_removes_subtree_silently() {
        let mut ledger = Ledger::new();
        let root = ledger.allocate_root();
        let child = ledger.allocate_dependent(root).unwrap();
        let grandchild = ledger.allocate_dependent(child).unwrap();
        let sibling = ledger.allocate_dependent(root).unwrap();
        let log: EventLog = Rc::default();
        watch(&mut ledger, child, &log);
        watch(&mut ledger, grandchild, &log);

        assert_eq!(ledger.forget(child), Ok(2));
        assert!(log.borrow().is_empty());
        assert!(!ledger.contains(child));
        assert!(!ledger.contains(grandchild));
        assert_eq!(ledger.get(root).unwrap().dependents(), &[sibling]);
        assert_eq!(
            ledger.allocate_dependent(child),
            Err(LedgerError::UnknownBase { base: child })
        );
    }

    #[test]
    fn test_forget_resolved_key_fails() {
        let mut ledger = Ledger::new();
        let key = ledger.allocate_root();
        ledger.reject(key).unwrap();
        assert_eq!(
            ledger.forget(key),
            Err(LedgerError::NotPending { key, state: R })
        );
    }

    #[test]
    fn test_reclaim_only_fully_resolved_trees() {
        let mut ledger = Ledger::new();
        let done = chain(&mut ledger, 3);
        let partial = chain(&mut ledger, 3);
        ledger.catch_up_to(done[2]).unwrap();
        ledger.catch_up_to(partial[1]).unwrap();

        assert_eq!(ledger.reclaim(), 3);
        assert!(done.iter().all(|k| !ledger.contains(*k)));
        assert!(partial.iter().all(|k| ledger.contains(*k)));

        ledger.reject(partial[2]).unwrap();
        assert_eq!(ledger.reclaim(), 3);
        assert!(ledger.is_empty());

        // Ids keep increasing after reclaim.
        assert!(ledger.allocate_root() > partial[2]);
    }

    #[test]
    fn test_auto_reclaim_after_outermost_call() {
        let mut ledger = Ledger::with_config(LedgerConfig {
            auto_reclaim: true,
            ..LedgerConfig::default()
        });
        let keys = chain(&mut ledger, 2);
        let seen = Rc::new(RefCell::new(None));

        let s = Rc::clone(&seen);
        ledger
            .on_accepted(keys[0], move |ledger, key| {
                // Still present while dispatch is in flight.
                *s.borrow_mut() = ledger.state(key);
            })
            .unwrap();

        ledger.catch_up_to(keys[1]).unwrap();
        assert_eq!(*seen.borrow(), Some(A));
        assert!(ledger.is_empty());
    }

    fn reclaiming() -> Ledger {
        Ledger::with_config(LedgerConfig {
            auto_reclaim: true,
            ..LedgerConfig::default()
        })
    }

    #[test]
    fn test_reclaimed_key_keeps_terminal_state() {
        let mut ledger = reclaiming();
        let key = ledger.allocate_root();
        ledger.catch_up_to(key).unwrap();
        assert!(!ledger.contains(key));
        assert!(ledger.is_reclaimed(key));

        assert_eq!(ledger.catch_up_to(key), Ok(()));
        assert_eq!(ledger.reject(key), Ok(()));
        assert_eq!(ledger.state(key), Some(A));
        assert!(ledger.is_local_client_key(key));
        assert_eq!(
            ledger.forget(key),
            Err(LedgerError::NotPending { key, state: A })
        );

        let log: EventLog = Rc::default();
        watch(&mut ledger, key, &log);
        assert_eq!(*log.borrow(), vec![(key, "accepted"), (key, "resolved")]);
    }

    #[test]
    fn test_dependent_of_reclaimed_base() {
        let mut ledger = reclaiming();
        let accepted = ledger.allocate_root();
        let rejected = ledger.allocate_root();
        ledger.catch_up_to(accepted).unwrap();
        ledger.reject(rejected).unwrap();
        assert!(ledger.is_empty());

        let child = ledger.allocate_dependent(accepted).unwrap();
        assert_eq!(ledger.state(child), Some(P));
        ledger.catch_up_to(child).unwrap();
        assert_eq!(ledger.state(child), Some(A));
        assert!(ledger.is_reclaimed(child));

        let doomed = ledger.allocate_dependent(rejected).unwrap();
        assert_eq!(ledger.state(doomed), Some(R));
        let contradiction = LedgerError::Contradiction {
            key: doomed,
            rejected_ancestor: rejected,
        };
        assert_eq!(ledger.catch_up_to(doomed), Err(contradiction.clone()));
        assert!(ledger.is_reclaimed(doomed));
        assert_eq!(ledger.catch_up_to(doomed), Err(contradiction));
    }

    #[test]
    fn test_forget_lets_resolved_tree_reclaim() {
        let mut ledger = reclaiming();
        let root = ledger.allocate_root();
        let child = ledger.allocate_dependent(root).unwrap();
        let stray = ledger.allocate_dependent(root).unwrap();
        ledger.catch_up_to(child).unwrap();
        assert!(ledger.contains(root));

        ledger.forget(stray).unwrap();
        assert!(ledger.is_empty());
        assert_eq!(ledger.state(root), Some(A));
        assert_eq!(ledger.state(stray), None);
    }

    #[test]
    fn test_callback_forgets_key_being_accepted() {
        let mut ledger = Ledger::new();
        let root = ledger.allocate_root();
        let child = ledger.allocate_dependent(root).unwrap();
        ledger
            .on_accepted(child, |_, _| panic!("forgotten key fired"))
            .unwrap();
        ledger
            .on_accepted(root, move |ledger, _| {
                ledger.forget(child).unwrap();
            })
            .unwrap();

        assert_eq!(
            ledger.catch_up_to(child),
            Err(LedgerError::UnknownKey { key: child })
        );
        assert_eq!(ledger.state(root), Some(A));
        assert!(!ledger.contains(child));
    }

    #[test]
    fn test_catch_up_earlier_skips_detached_keys() {
        let mut ledger = Ledger::with_config(LedgerConfig {
            chain_behavior: ChainBehavior::CatchUpEarlier,
            ..LedgerConfig::default()
        });
        let hidden = ledger.allocate_root();
        ledger.detach(hidden).unwrap();
        let hidden_child = ledger.allocate_dependent(hidden).unwrap();
        let visible = ledger.allocate_root();
        let later = ledger.allocate_root();
        let log: EventLog = Rc::default();
        watch(&mut ledger, hidden, &log);

        ledger.catch_up_to(later).unwrap();
        assert_eq!(ledger.state(visible), Some(A));
        assert_eq!(ledger.state(hidden), Some(P));
        assert_eq!(ledger.state(hidden_child), Some(P));
        assert!(ledger.get(hidden_child).unwrap().is_detached());
        assert!(log.borrow().is_empty());

        // An explicit confirmation still resolves it.
        ledger.catch_up_to(hidden).unwrap();
        assert_eq!(ledger.state(hidden), Some(A));
    }

    #[test]
    fn test_panicking_callback_releases_dispatch() {
        let mut ledger = reclaiming();
        let key = ledger.allocate_root();
        ledger
            .on_accepted(key, |_, _| panic!("callback failed"))
            .unwrap();

        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            ledger.catch_up_to(key)
        }));
        assert!(caught.is_err());
        assert_eq!(ledger.dispatch_depth, 0);

        let next = ledger.allocate_root();
        ledger.catch_up_to(next).unwrap();
        assert!(ledger.is_empty());
        assert_eq!(ledger.state(key), Some(A));
    }
}
