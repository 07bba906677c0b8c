//! Errors that can occur while recording ledger commands

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of resource a command depended on but could not find
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotFoundKind {
    LedgerAccount,
    LedgerTransaction,
    UsageMeter,
    BillingRun,
    UsageCredit,
    UsageCreditApplication,
    UsageEvent,
}

impl fmt::Display for NotFoundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NotFoundKind::LedgerAccount => "ledger account",
            NotFoundKind::LedgerTransaction => "ledger transaction",
            NotFoundKind::UsageMeter => "usage meter",
            NotFoundKind::BillingRun => "billing run",
            NotFoundKind::UsageCredit => "usage credit",
            NotFoundKind::UsageCreditApplication => "usage credit application",
            NotFoundKind::UsageEvent => "usage event",
        };
        f.write_str(name)
    }
}

/// Errors that can occur in the ledger system
///
/// `NotFound`, `ScopeMismatch`, `Validation` and `Conflict` are expected runtime
/// conditions the caller can report or retry. `Invariant` and `Storage` mean the
/// ambient database transaction must be abandoned.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: NotFoundKind, id: String },

    /// Resolved record count differs from the count the command referenced
    #[error("Scope mismatch for {kind}: expected {expected}, resolved {resolved}")]
    ScopeMismatch {
        kind: NotFoundKind,
        expected: usize,
        resolved: usize,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Ledger invariant violated: {0}")]
    Invariant(String),

    /// Uniqueness violation raised by the store, e.g. two first-time commits
    /// of the same idempotency key
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    pub fn not_found(kind: NotFoundKind, id: impl Into<String>) -> Self {
        LedgerError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        LedgerError::Invariant(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        LedgerError::Validation(message.into())
    }

    /// Whether the error is an expected condition rather than a data-integrity bug
    pub fn is_recoverable(&self) -> bool {
        match self {
            LedgerError::NotFound { .. }
            | LedgerError::ScopeMismatch { .. }
            | LedgerError::Validation(_)
            | LedgerError::Conflict(_) => true,
            LedgerError::Invariant(_) | LedgerError::Storage(_) => false,
        }
    }

    /// Scope mismatches are reported through the not-found channel
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            LedgerError::NotFound { .. } | LedgerError::ScopeMismatch { .. }
        )
    }
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let missing = LedgerError::not_found(NotFoundKind::BillingRun, "br_1");
        assert!(missing.is_recoverable());
        assert!(missing.is_not_found());
        assert_eq!(missing.to_string(), "billing run not found: br_1");

        let mismatch = LedgerError::ScopeMismatch {
            kind: NotFoundKind::LedgerAccount,
            expected: 2,
            resolved: 1,
        };
        assert!(mismatch.is_not_found());
        assert!(mismatch.is_recoverable());

        let broken = LedgerError::invariant("application for unmapped meter");
        assert!(!broken.is_recoverable());
        assert!(!broken.is_not_found());

        assert!(LedgerError::Conflict("dup".to_string()).is_recoverable());
        assert!(!LedgerError::Storage("io".to_string()).is_recoverable());
    }
}
