//! Transactional publishing into a target repository
//!
//! Sequencing and compensating action on top of the [`CvmfsServer`]
//! primitives. Two shapes matter:
//!
//! - the standard path: `ingest` (transaction implicit) followed by an empty
//!   `transaction` + `publish` pass, because raw ingestion does not rebuild
//!   nested directory catalogs;
//! - the compat-layer replacement path: rename the live layer to a versioned
//!   backup, extract the new layer, and publish, all inside one transaction,
//!   so readers see either the old or the new layer, never a mix.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};

use stratum_common::error::TransactionError;

use crate::cvmfs::CvmfsServer;
use crate::layout::LayoutRules;
use crate::tarball::Tarball;

/// Marker file that every published compat layer contains at its root; its
/// presence is the signal that a live layer is already installed.
pub const LIVE_LAYER_MARKER: &str = "startprak";

/// Publisher for one target repository tree.
#[derive(Debug, Clone)]
pub struct Publisher {
    cvmfs: CvmfsServer,
    rules: LayoutRules,
}

impl Publisher {
    pub fn new(cvmfs: CvmfsServer, rules: LayoutRules) -> Self {
        Self { cvmfs, rules }
    }

    pub fn cvmfs(&self) -> &CvmfsServer {
        &self.cvmfs
    }

    pub fn rules(&self) -> LayoutRules {
        self.rules
    }

    /// Directory that tarballs unpack into: `/cvmfs/<repo>/<base_dir>`.
    pub fn unpack_root(&self, repo: &str, project: Option<&str>) -> PathBuf {
        self.cvmfs.repo_path(repo).join(self.rules.base_dir(project))
    }

    /// Install location of a compat layer for one (version, os, arch).
    pub fn compat_layer_dir(
        &self,
        repo: &str,
        project: Option<&str>,
        version: &str,
        os: &str,
        arch: &str,
    ) -> PathBuf {
        self.unpack_root(repo, project)
            .join(version)
            .join("compat")
            .join(os)
            .join(arch)
    }

    /// Whether a live compat layer is installed at `layer_dir`.
    pub fn live_layer_exists(layer_dir: &Path) -> bool {
        layer_dir.join(LIVE_LAYER_MARKER).is_file()
    }

    /// Stream a tarball into the repository (transaction implicit in the
    /// `ingest` primitive).
    pub async fn ingest(
        &self,
        repo: &str,
        tarball: &Tarball,
        project: Option<&str>,
    ) -> Result<(), TransactionError> {
        let base_dir = self.rules.base_dir(project);
        info!(repo, base_dir, tarball = %tarball.path().display(), "ingesting tarball");
        self.cvmfs
            .ingest(repo, &base_dir, tarball.path(), tarball.compression())
            .await
    }

    /// Force a catalog rebuild with an empty transaction + publish pass.
    pub async fn regenerate_catalogs(
        &self,
        repo: &str,
        message: &str,
    ) -> Result<(), TransactionError> {
        info!(repo, "regenerating catalogs");
        self.cvmfs.transaction(repo).await?;
        if let Err(publish_err) = self.cvmfs.publish(repo, message).await {
            self.cvmfs.abort(repo).await?;
            return Err(publish_err);
        }
        Ok(())
    }

    /// Replace a live compat layer with the contents of `tarball`.
    ///
    /// The live directory is renamed to a dot-hidden backup whose numeric
    /// suffix is the highest existing one plus one (`001` when none exist);
    /// suffixes are never reused. The new layer is then extracted in place
    /// and the transaction published. Any failed step aborts the transaction,
    /// which discards the rename and extraction, so the previously published
    /// state (live layer and older backups included) stays visible.
    pub async fn replace_compat_layer(
        &self,
        repo: &str,
        tarball: &Tarball,
        project: Option<&str>,
        layer_dir: &Path,
        message: &str,
    ) -> Result<(), TransactionError> {
        self.cvmfs.transaction(repo).await?;

        let steps = async {
            let backup = next_backup_path(layer_dir)?;
            info!(
                live = %layer_dir.display(),
                backup = %backup.display(),
                "renaming live compat layer to backup"
            );
            std::fs::rename(layer_dir, &backup)?;

            let unpack_root = self.unpack_root(repo, project);
            debug!(dest = %unpack_root.display(), "extracting replacement layer");
            tarball
                .unpack_into(&unpack_root)
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            Ok::<(), std::io::Error>(())
        };

        if let Err(step_err) = steps.await {
            return Err(self.abort_replacement(repo, step_err.to_string()).await);
        }

        if let Err(publish_err) = self.cvmfs.publish(repo, message).await {
            return Err(self.abort_replacement(repo, publish_err.to_string()).await);
        }
        Ok(())
    }

    /// Run the module-cache regeneration script inside its own transaction.
    /// The script's contract is "exit 0 on success"; anything else aborts.
    pub async fn regenerate_module_cache(
        &self,
        repo: &str,
        script: &Path,
        version_root: &Path,
    ) -> Result<(), TransactionError> {
        info!(repo, script = %script.display(), "regenerating module caches");
        self.cvmfs.transaction(repo).await?;

        let mut cmd = Command::new(script);
        cmd.arg(version_root);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        let out = self
            .cvmfs
            .run_external("module cache regeneration", cmd)
            .await
            .map_err(|e| TransactionError::IngestFailed {
                repo: repo.to_string(),
                detail: format!("module cache script failed to start: {e}"),
            });

        let failure = match out {
            Ok(out) if out.success() => None,
            Ok(out) => Some(TransactionError::IngestFailed {
                repo: repo.to_string(),
                detail: format!("module cache script failed: {}", out.diagnostic()),
            }),
            Err(e) => Some(e),
        };
        if let Some(err) = failure {
            self.cvmfs.abort(repo).await?;
            return Err(err);
        }

        if let Err(publish_err) = self
            .cvmfs
            .publish(repo, "update module caches")
            .await
        {
            self.cvmfs.abort(repo).await?;
            return Err(publish_err);
        }
        Ok(())
    }

    /// Abort after a failed replacement step. The abort error wins when even
    /// that fails; the repository then needs manual intervention.
    async fn abort_replacement(&self, repo: &str, cause: String) -> TransactionError {
        match self.cvmfs.abort(repo).await {
            Ok(()) => TransactionError::CompatReplacementFailed {
                repo: repo.to_string(),
                detail: cause,
            },
            Err(abort_err) => abort_err,
        }
    }
}

/// Compute the next backup path for a live layer directory: dot-hidden,
/// suffixed with the highest existing backup number plus one, zero-padded to
/// three digits. Suffixes grow monotonically and are never reused.
pub fn next_backup_path(layer_dir: &Path) -> std::io::Result<PathBuf> {
    let parent = layer_dir
        .parent()
        .ok_or_else(|| std::io::Error::other("compat layer directory has no parent"))?;
    let name = layer_dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| std::io::Error::other("compat layer directory has no name"))?;

    let prefix = format!(".{name}-");
    let mut highest = 0u32;
    for entry in std::fs::read_dir(parent)? {
        let entry = entry?;
        let entry_name = entry.file_name();
        if let Some(suffix) = entry_name.to_string_lossy().strip_prefix(&prefix) {
            if let Ok(n) = suffix.parse::<u32>() {
                highest = highest.max(n);
            }
        }
    }

    Ok(parent.join(format!(".{name}-{:03}", highest + 1)))
}
