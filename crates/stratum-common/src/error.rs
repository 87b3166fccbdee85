//! Error types for the stratum ingestion pipeline
//!
//! The taxonomy mirrors the phases of an ingestion: layout validation never
//! touches the target repository, precondition checks run before any
//! transaction is opened, and transactional errors map one-to-one onto the
//! `cvmfs_server` primitives that failed. Each category carries a distinct
//! process exit code so callers (and cron wrappers) can tell them apart.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for stratum operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// A tarball whose name or internal layout does not match the distribution
/// tree's conventions. Always recoverable; no transaction has been opened.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("malformed tarball name '{0}': expected <prefix>-<version>-<class>[-<os>-<arch>][-<extra>]-<timestamp>.tar.{{gz,zst}}")]
    MalformedName(String),

    #[error("version mismatch: tarball name says '{name_version}' but its top-level directory is '{top_level}'")]
    VersionMismatch {
        name_version: String,
        top_level: String,
    },

    #[error("unknown content class '{0}': expected one of compat, init, scripts, software")]
    UnknownContentClass(String),

    #[error("unknown operating system '{0}': expected one of linux, macos")]
    UnknownOs(String),

    #[error("unknown architecture '{0}': expected one of x86_64, aarch64, riscv64, ppc64le")]
    UnknownArch(String),
}

/// A failed `cvmfs_server` primitive. `PublishFailed` has already been
/// compensated with an abort; `AbortFailed` means the repository may be left
/// with an open transaction and needs manual intervention.
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("failed to open transaction on repository '{repo}': {detail}")]
    BeginFailed { repo: String, detail: String },

    #[error("failed to ingest into repository '{repo}': {detail}")]
    IngestFailed { repo: String, detail: String },

    #[error("failed to publish repository '{repo}': {detail}")]
    PublishFailed { repo: String, detail: String },

    #[error("failed to abort transaction on repository '{repo}': {detail}; the repository may be left with an open transaction, manual intervention required")]
    AbortFailed { repo: String, detail: String },

    #[error("compatibility layer replacement failed on repository '{repo}': {detail}")]
    CompatReplacementFailed { repo: String, detail: String },
}

/// A check that failed before any transaction was opened. Never retried
/// within a run; the environment has to change first.
#[derive(Error, Debug)]
pub enum PreconditionError {
    #[error("repository '{0}' is not served by this host (not in `cvmfs_server list`)")]
    RepositoryNotFound(String),

    #[error("tarball does not exist locally: {0}")]
    TarballNotFound(PathBuf),

    #[error("unsupported tarball extension on '{0}': expected .tar.gz or .tar.zst")]
    UnsupportedExtension(String),

    #[error("decompressor '{program}' for {codec} tarballs not found on PATH")]
    MissingDecompressor { codec: String, program: String },

    #[error("checksum mismatch for '{file}': metadata says {expected}, downloaded file has {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },
}

/// Top-level error for one ingestion attempt.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Process exit code for a successful ingestion.
pub const EXIT_OK: i32 = 0;
/// Exit code for layout validation failures.
pub const EXIT_VALIDATION: i32 = 2;
/// Exit code for failed preconditions (nothing was attempted).
pub const EXIT_PRECONDITION: i32 = 3;
/// Exit code for transactional failures (an abort was issued).
pub const EXIT_TRANSACTION: i32 = 4;
/// Exit code when even the abort failed; the repository needs manual care.
pub const EXIT_ABORT_FAILED: i32 = 5;

impl IngestError {
    /// Map this error onto the process exit code contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            IngestError::Validation(_) => EXIT_VALIDATION,
            IngestError::Precondition(_) => EXIT_PRECONDITION,
            IngestError::Transaction(TransactionError::AbortFailed { .. }) => EXIT_ABORT_FAILED,
            IngestError::Transaction(_) => EXIT_TRANSACTION,
            IngestError::Io(_) => EXIT_PRECONDITION,
        }
    }

    /// True when the failure left (or may have left) the repository with an
    /// open transaction, which must halt further automated ingestion.
    pub fn is_fatal_for_repository(&self) -> bool {
        matches!(
            self,
            IngestError::Transaction(TransactionError::AbortFailed { .. })
        )
    }
}
