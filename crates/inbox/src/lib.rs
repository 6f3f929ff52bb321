//! # Inbound Confirmations
//!
//! The boundary where the replication layer hands decoded confirmations to
//! the ledger. Transport, framing and reliability live on the other side of
//! [`ConfirmationSink`]; by the time a confirmation gets here it is just a
//! key id and a verdict.

pub mod script;

pub use script::{load_script, parse_script, ScriptLine, ScriptOp, ScriptReport, ScriptRunner, StepFailure};

use common::KeyId;
use ledger::{Ledger, LedgerError};
use serde::{Deserialize, Serialize};

/// Errors from confirmation and script ingestion.
#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Ledger error: {0}")]
    LedgerError(#[from] LedgerError),
    #[error("Unknown key label: {0}")]
    UnknownLabel(String),
    #[error("Duplicate key label: {0}")]
    DuplicateLabel(String),
}

/// The authority's decision about one predicted key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accept,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub key: KeyId,
    pub verdict: Verdict,
}

impl Confirmation {
    pub fn accept(key: KeyId) -> Self {
        Self {
            key,
            verdict: Verdict::Accept,
        }
    }

    pub fn reject(key: KeyId) -> Self {
        Self {
            key,
            verdict: Verdict::Reject,
        }
    }
}

/// Receiver of server confirmations.
pub trait ConfirmationSink {
    /// The authority confirmed `key`.
    fn on_server_accept(&mut self, key: KeyId) -> Result<(), LedgerError>;

    /// The authority refused `key`.
    fn on_server_reject(&mut self, key: KeyId) -> Result<(), LedgerError>;
}

impl ConfirmationSink for Ledger {
    fn on_server_accept(&mut self, key: KeyId) -> Result<(), LedgerError> {
        self.catch_up_to(key)
    }

    fn on_server_reject(&mut self, key: KeyId) -> Result<(), LedgerError> {
        self.reject(key)
    }
}

/// Routes one confirmation to the matching sink entry point.
pub fn apply_confirmation<S>(sink: &mut S, confirmation: Confirmation) -> Result<(), LedgerError>
where
    S: ConfirmationSink + ?Sized,
{
    match confirmation.verdict {
        Verdict::Accept => sink.on_server_accept(confirmation.key),
        Verdict::Reject => sink.on_server_reject(confirmation.key),
    }
}

/// Applies a batch in arrival order, returning the confirmations that failed.
///
/// A failing confirmation does not stop the batch: later confirmations are
/// independent facts from the authority.
pub fn apply_batch<S>(
    sink: &mut S,
    confirmations: impl IntoIterator<Item = Confirmation>,
) -> Vec<(Confirmation, LedgerError)>
where
    S: ConfirmationSink + ?Sized,
{
    confirmations
        .into_iter()
        .filter_map(|c| apply_confirmation(&mut *sink, c).err().map(|e| (c, e)))
        .collect()
}
