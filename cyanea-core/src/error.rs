//! Structured error types for the Cyanea ecosystem.

use thiserror::Error;

/// Unified error type for all Cyanea operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CyaneaError {
    /// Parse error (malformed input data)
    #[error("parse error: {0}")]
    Parse(String),

    /// Invalid input (bad arguments, mismatched dimensions, inconsistent masks)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Numerically invalid state reached while evaluating a proposal.
    ///
    /// Samplers treat this as a rejected move rather than a failure.
    #[error("numerical error: {0}")]
    Numerical(String),

    /// Caller broke an API contract (stale cache, unknown node, unbalanced store/restore)
    #[error("contract violation: {0}")]
    Contract(String),
}

impl CyaneaError {
    /// True for errors an MCMC chain should absorb by rejecting the current proposal.
    pub fn is_rejectable(&self) -> bool {
        matches!(self, CyaneaError::Numerical(_))
    }
}

/// Convenience alias used throughout the Cyanea ecosystem.
pub type Result<T> = std::result::Result<T, CyaneaError>;
