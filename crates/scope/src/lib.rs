//! # Prediction Scopes
//!
//! A [`PredictionContext`] is the thing that predicts (typically one gameplay
//! entity). It carries the "current prediction key" that speculative side
//! effects get tagged with.
//!
//! Keys are installed by scope guards:
//! - [`ScopedWindow`]: allocates a fresh key (a root, or a dependent of the
//!   active key when nested) and leaves it pending for the authority.
//! - [`ScopedDiscard`]: allocates a throwaway key and resolves it on exit
//!   according to a [`DiscardPolicy`].
//!
//! Both guards restore the previous current key when they drop, on every exit
//! path, and both dereference to the context so nested scopes open through
//! the guard.

mod discard;
mod window;

pub use discard::{DiscardPolicy, ScopedDiscard};
pub use window::ScopedWindow;

use common::KeyId;
use ledger::{Ledger, LedgerError};
use tracing::debug;

/// Owner of a "current prediction key" backed by a ledger.
pub struct PredictionContext<'l> {
    ledger: &'l mut Ledger,
    current: KeyId,
    label: String,
}

impl<'l> PredictionContext<'l> {
    pub fn new(ledger: &'l mut Ledger, label: impl Into<String>) -> Self {
        Self {
            ledger,
            current: KeyId::INVALID,
            label: label.into(),
        }
    }

    /// The key predicted side effects should carry, or [`KeyId::INVALID`]
    /// outside any scope.
    pub fn current_key(&self) -> KeyId {
        self.current
    }

    pub fn is_predicting(&self) -> bool {
        self.current.is_valid()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn ledger(&self) -> &Ledger {
        &*self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut Ledger {
        &mut *self.ledger
    }

    /// Opens a prediction window and installs its key as current.
    ///
    /// # Examples
    /// ```
    /// # use ledger::Ledger;
    /// # use scope::PredictionContext;
    /// let mut ledger = Ledger::new();
    /// let mut ctx = PredictionContext::new(&mut ledger, "hero");
    /// let outer = {
    ///     let mut window = ctx.open_window().unwrap();
    ///     let inner = window.open_window().unwrap();
    ///     assert_eq!(inner.ledger().get(inner.key()).unwrap().base(), Some(inner.previous_key()));
    ///     inner.previous_key()
    /// };
    /// assert!(!ctx.is_predicting());
    /// assert!(ctx.ledger().contains(outer));
    /// ```
    pub fn open_window(&mut self) -> Result<ScopedWindow<'_, 'l>, LedgerError> {
        let (key, previous) = self.install_new_key()?;
        Ok(ScopedWindow::new(self, key, previous))
    }

    /// Opens a discard scope whose key is resolved by `policy` on exit.
    ///
    /// A `SilentlyDrop` key is detached, so no ordering sweep can resolve
    /// it while the scope is open.
    pub fn open_discard(
        &mut self,
        policy: DiscardPolicy,
    ) -> Result<ScopedDiscard<'_, 'l>, LedgerError> {
        let (key, previous) = self.install_new_key()?;
        if policy == DiscardPolicy::SilentlyDrop {
            if let Err(e) = self.ledger.detach(key) {
                self.restore(previous);
                return Err(e);
            }
        }
        Ok(ScopedDiscard::new(self, key, previous, policy))
    }

    /// Allocates the next key (dependent on the current one when predicting),
    /// makes it current and returns `(new, previous)`.
    fn install_new_key(&mut self) -> Result<(KeyId, KeyId), LedgerError> {
        let previous = self.current;
        let key = match previous.valid() {
            Some(base) => self.ledger.allocate_dependent(base)?,
            None => self.ledger.allocate_root(),
        };
        self.current = key;
        debug!(context = %self.label, %key, %previous, "prediction key installed");
        Ok((key, previous))
    }

    fn restore(&mut self, previous: KeyId) {
        debug!(context = %self.label, from = %self.current, to = %previous, "prediction key restored");
        self.current = previous;
    }
}

impl std::fmt::Debug for PredictionContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictionContext")
            .field("label", &self.label)
            .field("current", &self.current)
            .finish()
    }
}
