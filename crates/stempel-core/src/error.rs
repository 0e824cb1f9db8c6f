// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Stempel.

use thiserror::Error;

/// Top-level error type for all Stempel operations.
#[derive(Debug, Error)]
pub enum StempelError {
    // -- Request errors --
    #[error("source document '{0}' not found")]
    SourceNotFound(String),

    #[error("invalid source name: {0}")]
    InvalidName(String),

    // -- Transform errors --
    #[error("transform failed: {0}")]
    Transform(String),

    #[error("PDF operation failed: {0}")]
    PdfError(String),

    #[error("operation cancelled")]
    Cancelled,

    // -- Overflow queue --
    #[error("malformed queue message: {0}")]
    MalformedMessage(String),

    #[error("database error: {0}")]
    Database(String),

    // -- Server --
    #[error("watermark server error: {0}")]
    Server(String),

    // -- Storage / persistence --
    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StempelError {
    /// Whether a failed queue message should be acknowledged rather than left
    /// for redelivery. A missing source or a payload that cannot be decoded
    /// will not be fixed by running the same message again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StempelError::SourceNotFound(_)
                | StempelError::InvalidName(_)
                | StempelError::MalformedMessage(_)
        )
    }
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, StempelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        assert!(StempelError::SourceNotFound("a.pdf".into()).is_terminal());
        assert!(StempelError::MalformedMessage("not json".into()).is_terminal());
        assert!(!StempelError::Transform("broken xref".into()).is_terminal());
        assert!(!StempelError::Io(std::io::Error::other("disk")).is_terminal());
    }
}
