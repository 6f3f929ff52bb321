use crate::PredictionContext;
use common::KeyId;
use std::ops::{Deref, DerefMut};

/// Guard exposing a freshly allocated key as the context's current key.
///
/// The key is left pending in the ledger when the guard drops; resolving it
/// is the authority's job.
pub struct ScopedWindow<'c, 'l> {
    ctx: &'c mut PredictionContext<'l>,
    key: KeyId,
    previous: KeyId,
}

impl<'c, 'l> ScopedWindow<'c, 'l> {
    pub(crate) fn new(ctx: &'c mut PredictionContext<'l>, key: KeyId, previous: KeyId) -> Self {
        Self { ctx, key, previous }
    }

    /// The key this window installed.
    pub fn key(&self) -> KeyId {
        self.key
    }

    /// The key that was current before the window opened.
    pub fn previous_key(&self) -> KeyId {
        self.previous
    }
}

impl<'l> Deref for ScopedWindow<'_, 'l> {
    type Target = PredictionContext<'l>;

    fn deref(&self) -> &Self::Target {
        &*self.ctx
    }
}

impl<'l> DerefMut for ScopedWindow<'_, 'l> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.ctx
    }
}

impl Drop for ScopedWindow<'_, '_> {
    fn drop(&mut self) {
        self.ctx.restore(self.previous);
    }
}
