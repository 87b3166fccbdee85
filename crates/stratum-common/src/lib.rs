//! Stratum Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the stratum workspace.
//!
//! # Overview
//!
//! This crate provides the pieces both the publishing and orchestration
//! crates rely on:
//!
//! - **Error Handling**: the validation / precondition / transaction error
//!   taxonomy and its exit-code mapping
//! - **Checksums**: sha256 verification of downloaded tarballs
//! - **Logging**: `tracing` setup shared by the binaries

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{
    IngestError, PreconditionError, Result, TransactionError, ValidationError,
};
