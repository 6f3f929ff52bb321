use crate::PredictionContext;
use common::{KeyId, KeyState};
use ledger::LedgerError;
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};
use tracing::{debug, error};

/// How a discard scope resolves its key on exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardPolicy {
    /// Remove the key (and anything predicted on it inside the scope) without
    /// resolving it. Nobody waiting on the key is ever notified.
    SilentlyDrop,
    /// Confirm the key as if the authority had accepted it.
    AutoAccept,
    /// Fail the key and everything predicted on it.
    AutoReject,
}

/// Guard installing a throwaway key for the duration of a scope.
///
/// Resolution happens before the previous key is restored. Use
/// [`ScopedDiscard::finish`] to observe resolution errors; a plain drop
/// resolves the same way and logs any error.
pub struct ScopedDiscard<'c, 'l> {
    ctx: &'c mut PredictionContext<'l>,
    key: KeyId,
    previous: KeyId,
    policy: DiscardPolicy,
    resolved: bool,
}

impl<'c, 'l> ScopedDiscard<'c, 'l> {
    pub(crate) fn new(
        ctx: &'c mut PredictionContext<'l>,
        key: KeyId,
        previous: KeyId,
        policy: DiscardPolicy,
    ) -> Self {
        Self {
            ctx,
            key,
            previous,
            policy,
            resolved: false,
        }
    }

    pub fn key(&self) -> KeyId {
        self.key
    }

    pub fn previous_key(&self) -> KeyId {
        self.previous
    }

    pub fn policy(&self) -> DiscardPolicy {
        self.policy
    }

    /// Resolves the key now and restores the previous current key.
    pub fn finish(mut self) -> Result<(), LedgerError> {
        self.resolve()
    }

    fn resolve(&mut self) -> Result<(), LedgerError> {
        self.resolved = true;
        let ledger = self.ctx.ledger_mut();
        match self.policy {
            DiscardPolicy::AutoAccept => ledger.catch_up_to(self.key),
            DiscardPolicy::AutoReject => ledger.reject(self.key),
            DiscardPolicy::SilentlyDrop => match ledger.state(self.key) {
                Some(KeyState::Pending) => ledger.forget(self.key).map(|removed| {
                    debug!(key = %self.key, removed, "discarded prediction dropped");
                }),
                Some(state) => {
                    debug!(key = %self.key, %state, "discarded prediction already resolved");
                    Ok(())
                }
                None => Ok(()),
            },
        }
    }
}

impl<'l> Deref for ScopedDiscard<'_, 'l> {
    type Target = PredictionContext<'l>;

    fn deref(&self) -> &Self::Target {
        &*self.ctx
    }
}

impl<'l> DerefMut for ScopedDiscard<'_, 'l> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.ctx
    }
}

impl Drop for ScopedDiscard<'_, '_> {
    fn drop(&mut self) {
        if !self.resolved {
            if let Err(e) = self.resolve() {
                error!(
                    context = %self.ctx.label(),
                    key = %self.key,
                    policy = ?self.policy,
                    "discard scope failed to resolve its key: {e}"
                );
            }
        }
        self.ctx.restore(self.previous);
    }
}
