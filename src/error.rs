// ⚠️ Error Types - Fatal ingestion and configuration errors
// "No match" is a result, not an error, and never appears here

use crate::correspondence::VersionId;
use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, MappingError>;

#[derive(Error, Debug)]
pub enum MappingError {
    /// Unparseable multiplier, bad version tuple, negative share...
    #[error("Malformed input in {context}: {message}")]
    MalformedInput { context: String, message: String },

    /// A mandatory logical column has none of its aliases in the header row
    #[error("Missing mandatory column '{column}' in {table} (tried: {tried})")]
    MissingColumn {
        table: String,
        column: String,
        tried: String,
    },

    /// Same FROM/TO pair twice in one correspondence table
    #[error("Duplicate correspondence row in {table} at line {line}: {from} -> {to}")]
    DuplicateRow {
        table: String,
        line: usize,
        from: String,
        to: String,
    },

    /// Chain interlinking did not converge within the hop cap
    #[error("Interlinking {from} -> {to} exceeded {cap} hops (cyclic or inconsistent correspondence tables)")]
    HopLimitExceeded {
        from: VersionId,
        to: VersionId,
        cap: usize,
    },

    #[error("No correspondence table continues from version {at} toward {target}")]
    NoCorrespondencePath { at: VersionId, target: VersionId },

    #[error("Similarity oracle failed: {0}")]
    Oracle(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MappingError {
    pub fn malformed(context: impl Into<String>, message: impl Into<String>) -> Self {
        MappingError::MalformedInput {
            context: context.into(),
            message: message.into(),
        }
    }

    /// True when the fault lies in the loaded table set rather than one input row
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            MappingError::HopLimitExceeded { .. } | MappingError::NoCorrespondencePath { .. }
        )
    }
}
