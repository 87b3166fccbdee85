//! End-to-end ingestion of one tarball
//!
//! The executor composes the layout validator and the transactional
//! publisher: preconditions first (nothing is attempted against a repository
//! that is not served here, and a missing decompressor is fatal, not
//! retried), then validation, then the content-class-specific procedure.
//!
//! The downloaded tarball is left on disk afterwards; cleanup belongs to the
//! caller.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{info, warn};

use stratum_common::error::{PreconditionError, Result};

use crate::cvmfs::{CvmfsServer, CvmfsSettings};
use crate::layout::{self, ContentClass, LayoutRules, TarballId};
use crate::publisher::Publisher;
use crate::tarball::Tarball;

/// Everything the executor needs to know about the host and the target tree.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub cvmfs: CvmfsSettings,

    /// Multi-tenant trees carry one extra project path segment.
    pub tenant: bool,

    /// Module caches are only regenerated for this repository; all other
    /// repositories skip that step.
    pub primary_repo: Option<String>,

    /// External script that rebuilds the module caches, invoked with the
    /// repository's version-rooted path.
    pub module_cache_script: Option<PathBuf>,
}

/// Executes single-tarball ingestions against one host.
#[derive(Debug, Clone)]
pub struct IngestExecutor {
    publisher: Publisher,
    primary_repo: Option<String>,
    module_cache_script: Option<PathBuf>,
}

impl IngestExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        let rules = LayoutRules {
            tenant: config.tenant,
        };
        Self {
            publisher: Publisher::new(CvmfsServer::new(config.cvmfs), rules),
            primary_repo: config.primary_repo,
            module_cache_script: config.module_cache_script,
        }
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// Validate and publish one local tarball into `repo`.
    ///
    /// Returns the tarball's content class on success. Validation and
    /// precondition failures are reported without opening any transaction;
    /// transactional failures have already been compensated with an abort
    /// wherever possible.
    pub async fn ingest_tarball(&self, repo: &str, tarball_path: &Path) -> Result<ContentClass> {
        let tarball = Tarball::open(tarball_path)?;
        let name = tarball_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        // Preconditions: fail fast, before any transaction.
        let (program, _) = tarball.compression().decompressor();
        if find_on_path(program).is_none() {
            return Err(PreconditionError::MissingDecompressor {
                codec: tarball.compression().extension().trim_start_matches('.').to_string(),
                program: program.to_string(),
            }
            .into());
        }
        let repositories = self.publisher.cvmfs().list_repositories().await?;
        if !repositories.iter().any(|r| r == repo) {
            return Err(PreconditionError::RepositoryNotFound(repo.to_string()).into());
        }

        // Validation: name fields against the member listing.
        let member_paths = tarball.member_paths()?;
        let contents = self.publisher.rules().descriptor(&member_paths);
        let class = layout::validate(&name, &contents)?;
        let id = TarballId::parse(&name)?;
        let project = contents.project.as_deref();

        info!(repo, tarball = %name, class = %class, "tarball accepted for ingestion");

        match class {
            ContentClass::Init | ContentClass::Scripts => {
                self.ingest_and_regenerate(repo, &tarball, project, &name).await?;
            }
            ContentClass::Software => {
                self.ingest_and_regenerate(repo, &tarball, project, &name).await?;
                self.maybe_regenerate_module_cache(repo, project, &id).await?;
            }
            ContentClass::Compat => {
                self.ingest_compat(repo, &tarball, project, &contents, &id, &name)
                    .await?;
            }
        }

        info!(repo, tarball = %name, "ingestion complete");
        Ok(class)
    }

    async fn ingest_and_regenerate(
        &self,
        repo: &str,
        tarball: &Tarball,
        project: Option<&str>,
        name: &str,
    ) -> Result<()> {
        self.publisher.ingest(repo, tarball, project).await?;
        self.publisher
            .regenerate_catalogs(repo, &format!("update catalogs after ingesting {name}"))
            .await?;
        Ok(())
    }

    async fn maybe_regenerate_module_cache(
        &self,
        repo: &str,
        project: Option<&str>,
        id: &TarballId,
    ) -> Result<()> {
        if self.primary_repo.as_deref() != Some(repo) {
            info!(repo, "not the primary repository, skipping module cache regeneration");
            return Ok(());
        }
        let Some(script) = self.module_cache_script.as_deref() else {
            warn!(repo, "no module cache script configured, skipping regeneration");
            return Ok(());
        };
        let version_root = self.publisher.unpack_root(repo, project).join(&id.version);
        self.publisher
            .regenerate_module_cache(repo, script, &version_root)
            .await?;
        Ok(())
    }

    async fn ingest_compat(
        &self,
        repo: &str,
        tarball: &Tarball,
        project: Option<&str>,
        contents: &layout::ContentsDescriptor,
        id: &TarballId,
        name: &str,
    ) -> Result<()> {
        // os/arch have been validated; they come from the member listing.
        let os = contents.os_dir.clone().unwrap_or_default();
        let arch = contents.arch_dir.clone().unwrap_or_default();
        let layer_dir = self
            .publisher
            .compat_layer_dir(repo, project, &id.version, &os, &arch);

        if Publisher::live_layer_exists(&layer_dir) {
            info!(
                repo,
                layer = %layer_dir.display(),
                "live compat layer found, applying replacement policy"
            );
            self.publisher
                .replace_compat_layer(
                    repo,
                    tarball,
                    project,
                    &layer_dir,
                    &format!("replace compat layer from {name}"),
                )
                .await?;
        } else {
            self.publisher.ingest(repo, tarball, project).await?;
        }
        Ok(())
    }
}

/// Locate a program on PATH, the way a shell would.
pub fn find_on_path(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_find_on_path_locates_sh() {
        assert!(find_on_path("sh").is_some());
        assert!(find_on_path("no-such-program-stratum").is_none());
    }

    #[tokio::test]
    async fn test_missing_tarball_is_a_precondition_failure() {
        let executor = IngestExecutor::new(ExecutorConfig::default());
        let err = executor
            .ingest_tarball(
                "software.example.org",
                Path::new("/nonexistent/eessi-2000.01-init-1.tar.gz"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), stratum_common::error::EXIT_PRECONDITION);
    }
}
