//! # Ledger Configuration
//!
//! Runtime knobs for a ledger. Binaries fill these from `.env` / CLI flags;
//! library callers construct them directly.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Errors from parsing configuration values.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown chain behavior: {0} (expected `ancestors-only` or `catch-up-earlier`)")]
    UnknownChainBehavior(String),
}

/// What `catch_up_to` resolves besides the key itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChainBehavior {
    /// Accept the key and its pending ancestors only. Dependents and
    /// siblings are untouched.
    #[default]
    AncestorsOnly,
    /// Additionally accept every pending key of the same origin whose id is
    /// lower than the confirmed key, in ascending order. Models an authority
    /// that confirms predictions strictly in allocation order.
    CatchUpEarlier,
}

impl ChainBehavior {
    pub fn as_str(self) -> &'static str {
        match self {
            ChainBehavior::AncestorsOnly => "ancestors-only",
            ChainBehavior::CatchUpEarlier => "catch-up-earlier",
        }
    }
}

impl fmt::Display for ChainBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainBehavior {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "ancestors-only" | "ancestors" | "0" => Ok(ChainBehavior::AncestorsOnly),
            "catch-up-earlier" | "earlier" | "1" => Ok(ChainBehavior::CatchUpEarlier),
            _ => Err(ConfigError::UnknownChainBehavior(s.to_string())),
        }
    }
}

/// Ledger-wide settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub chain_behavior: ChainBehavior,
    /// Reclaim fully resolved trees after every outermost resolution call.
    ///
    /// Off by default: a reclaimed key is unknown to the ledger, so late
    /// callback registrations on it fail instead of firing immediately.
    pub auto_reclaim: bool,
}
