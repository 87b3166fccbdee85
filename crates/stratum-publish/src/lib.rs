//! Stratum Publish Library
//!
//! Validation and transactional publishing of distribution tarballs into a
//! CernVM-FS style target tree.
//!
//! # Pipeline
//!
//! - [`layout`]: tarball naming and internal path conventions (the wire
//!   format shared with producers) and the validator for them
//! - [`tarball`]: member listing, contents overview, extraction
//! - [`cvmfs`]: the `cvmfs_server` command primitives with timeouts and
//!   error translation
//! - [`publisher`]: transaction sequencing, catalog regeneration, and the
//!   compat-layer replacement policy
//! - [`executor`]: preconditions plus per-content-class dispatch
//!
//! # Example
//!
//! ```no_run
//! use stratum_publish::executor::{ExecutorConfig, IngestExecutor};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let executor = IngestExecutor::new(ExecutorConfig::default());
//!     executor
//!         .ingest_tarball(
//!             "software.example.org",
//!             std::path::Path::new("./eessi-2023.06-init-1700000000.tar.gz"),
//!         )
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod cvmfs;
pub mod executor;
pub mod layout;
pub mod publisher;
pub mod tarball;

pub use executor::{ExecutorConfig, IngestExecutor};
pub use layout::{validate, ContentClass, Compression, LayoutRules, TarballId};
