// src/errors.rs

use std::path::PathBuf;

use thiserror::Error;

/// Crate-wide error type. Each failure class keeps the exit code the
/// command-line tools signal for it, so callers can distinguish a malformed
/// report from a malformed assignment line or a broken taxonomy dump.
#[derive(Debug, Error)]
pub enum KrakenMergeError {
    /// Report file with a column count other than 6 or 8, or a row whose
    /// fields cannot be parsed.
    #[error("kraken report file {file:?} badly formatted - {reason}")]
    ReportFormat { file: PathBuf, reason: String },

    /// Assignment line with the wrong field count or unparsable fields.
    #[error("kraken assignment line {line:?} badly formatted - {reason}")]
    AssignmentFormat { line: String, reason: String },

    /// A reference taxonomy table that should exist does not.
    #[error("taxonomy file {file:?} not found")]
    TaxonomyMissingFile { file: PathBuf },

    /// A reference taxonomy table exists but its content is not parsable.
    #[error("taxonomy file {file:?} corrupt: {reason}")]
    TaxonomyCorruptFile { file: PathBuf, reason: String },

    /// More reads assigned to a host taxon than the caller allows.
    #[error(
        "found {count} reads corresponding to host {name} with taxon_id {taxon_id}, max allowed is {max_count}"
    )]
    HostLimitExceeded {
        taxon_id: String,
        name: String,
        count: u64,
        max_count: u64,
    },

    /// Internal consistency violations: mismatched file-pair stems, strict
    /// assignment/report count mismatches, disagreeing entry metadata,
    /// count underflow during delta replay, and the like.
    #[error("consistency error: {0}")]
    Consistency(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl KrakenMergeError {
    /// Exit code signalled by the CLI for this failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            KrakenMergeError::ReportFormat { .. } => 2,
            KrakenMergeError::AssignmentFormat { .. } => 11,
            KrakenMergeError::TaxonomyMissingFile { .. } => 4,
            KrakenMergeError::TaxonomyCorruptFile { .. } => 4,
            KrakenMergeError::HostLimitExceeded { .. } => 2,
            KrakenMergeError::Consistency(_) => 1,
            KrakenMergeError::Io(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_per_failure_class() {
        let err = KrakenMergeError::ReportFormat {
            file: PathBuf::from("sample.kraken_report.txt"),
            reason: "must have 6 or 8 columns".to_string(),
        };
        assert_eq!(err.exit_code(), 2);

        let err = KrakenMergeError::AssignmentFormat {
            line: "C\tread".to_string(),
            reason: "must have 5 fields".to_string(),
        };
        assert_eq!(err.exit_code(), 11);

        let err = KrakenMergeError::TaxonomyMissingFile {
            file: PathBuf::from("taxonomy/nodes.dmp"),
        };
        assert_eq!(err.exit_code(), 4);

        let err = KrakenMergeError::TaxonomyCorruptFile {
            file: PathBuf::from("taxonomy/names.dmp"),
            reason: "truncated row".to_string(),
        };
        assert_eq!(err.exit_code(), 4);

        let err = KrakenMergeError::HostLimitExceeded {
            taxon_id: "9606".to_string(),
            name: "Homo sapiens".to_string(),
            count: 200,
            max_count: 100,
        };
        assert_eq!(err.exit_code(), 2);

        let err = KrakenMergeError::Consistency("stem mismatch".to_string());
        assert_eq!(err.exit_code(), 1);
    }
}
