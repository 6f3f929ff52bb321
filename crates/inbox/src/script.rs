//! JSON-lines op scripts: allocate keys under labels, then feed the ledger
//! the confirmations an authority would send.
//!
//! ```text
//! {"op": "root", "label": "k0"}
//! {"op": "dependent", "label": "k1", "base": "k0"}
//! {"op": "reject", "key": "k1"}
//! {"op": "accept", "key": "k0"}
//! ```
//!
//! Blank lines and lines starting with `#` are ignored. Lines that fail to
//! parse are logged and skipped; ops that fail against the ledger are
//! recorded in the [`ScriptReport`] and the run continues.

use crate::{apply_confirmation, Confirmation, InboxError};
use common::KeyId;
use ledger::Ledger;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use tracing::warn;

/// One scripted step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScriptOp {
    Root { label: String },
    ServerRoot { label: String },
    Dependent { label: String, base: String },
    Accept { key: String },
    Reject { key: String },
    Forget { key: String },
    Reclaim,
}

impl ScriptOp {
    pub fn name(&self) -> &'static str {
        match self {
            ScriptOp::Root { .. } => "root",
            ScriptOp::ServerRoot { .. } => "server_root",
            ScriptOp::Dependent { .. } => "dependent",
            ScriptOp::Accept { .. } => "accept",
            ScriptOp::Reject { .. } => "reject",
            ScriptOp::Forget { .. } => "forget",
            ScriptOp::Reclaim => "reclaim",
        }
    }
}

/// A parsed op together with its 1-based source line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptLine {
    pub line: usize,
    pub op: ScriptOp,
}

/// An op that the ledger refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepFailure {
    pub line: usize,
    pub op: &'static str,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScriptReport {
    pub applied: usize,
    pub skipped_lines: usize,
    pub failures: Vec<StepFailure>,
}

impl ScriptReport {
    pub fn is_clean(&self) -> bool {
        self.skipped_lines == 0 && self.failures.is_empty()
    }
}

/// Parses a script, skipping (and logging) malformed lines.
///
/// Returns the parsed ops and the number of skipped lines.
pub fn parse_script<R: Read>(reader: R) -> Result<(Vec<ScriptLine>, usize), InboxError> {
    let mut ops = Vec::new();
    let mut skipped = 0usize;

    for (idx, line) in BufReader::new(reader).lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match serde_json::from_str::<ScriptOp>(trimmed) {
            Ok(op) => ops.push(ScriptLine { line: idx + 1, op }),
            Err(e) => {
                warn!(line = idx + 1, "skipping malformed script line: {e}");
                skipped += 1;
            }
        }
    }

    Ok((ops, skipped))
}

/// Opens and parses a script file.
pub fn load_script(path: &Path) -> Result<(Vec<ScriptLine>, usize), InboxError> {
    let file = File::open(path)?;
    parse_script(file)
}

/// Applies script ops to a ledger, tracking label → key bindings.
pub struct ScriptRunner<'l> {
    ledger: &'l mut Ledger,
    labels: BTreeMap<String, KeyId>,
}

impl<'l> ScriptRunner<'l> {
    pub fn new(ledger: &'l mut Ledger) -> Self {
        Self {
            ledger,
            labels: BTreeMap::new(),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &*self.ledger
    }

    pub fn labels(&self) -> &BTreeMap<String, KeyId> {
        &self.labels
    }

    /// Resolves a label to its key.
    pub fn key(&self, label: &str) -> Result<KeyId, InboxError> {
        self.labels
            .get(label)
            .copied()
            .ok_or_else(|| InboxError::UnknownLabel(label.to_string()))
    }

    /// Reverse lookup, for reports.
    pub fn label_of(&self, key: KeyId) -> Option<&str> {
        self.labels
            .iter()
            .find(|(_, k)| **k == key)
            .map(|(label, _)| label.as_str())
    }

    /// Applies a single op.
    pub fn apply(&mut self, op: &ScriptOp) -> Result<(), InboxError> {
        match op {
            ScriptOp::Root { label } => {
                self.ensure_fresh(label)?;
                let key = self.ledger.allocate_root();
                self.labels.insert(label.clone(), key);
            }
            ScriptOp::ServerRoot { label } => {
                self.ensure_fresh(label)?;
                let key = self.ledger.allocate_server_initiated();
                self.labels.insert(label.clone(), key);
            }
            ScriptOp::Dependent { label, base } => {
                self.ensure_fresh(label)?;
                let base = self.key(base)?;
                let key = self.ledger.allocate_dependent(base)?;
                self.labels.insert(label.clone(), key);
            }
            ScriptOp::Accept { key } => {
                let key = self.key(key)?;
                apply_confirmation(&mut *self.ledger, Confirmation::accept(key))?;
            }
            ScriptOp::Reject { key } => {
                let key = self.key(key)?;
                apply_confirmation(&mut *self.ledger, Confirmation::reject(key))?;
            }
            ScriptOp::Forget { key } => {
                let key = self.key(key)?;
                self.ledger.forget(key)?;
            }
            ScriptOp::Reclaim => {
                self.ledger.reclaim();
            }
        }
        Ok(())
    }

    /// Applies every line, collecting failures instead of stopping.
    pub fn run(&mut self, lines: &[ScriptLine]) -> ScriptReport {
        let mut report = ScriptReport::default();
        for line in lines {
            match self.apply(&line.op) {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    warn!(line = line.line, op = line.op.name(), "script step failed: {e}");
                    report.failures.push(StepFailure {
                        line: line.line,
                        op: line.op.name(),
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Loads and runs a script file; skipped lines are counted in the report.
    pub fn run_file(&mut self, path: &Path) -> Result<ScriptReport, InboxError> {
        let (lines, skipped) = load_script(path)?;
        let mut report = self.run(&lines);
        report.skipped_lines = skipped;
        Ok(report)
    }

    fn ensure_fresh(&self, label: &str) -> Result<(), InboxError> {
        if self.labels.contains_key(label) {
            return Err(InboxError::DuplicateLabel(label.to_string()));
        }
        Ok(())
    }
}
