//! Wrapper around the `cvmfs_server` command interface
//!
//! The four primitives (`transaction`, `ingest`, `publish`, `abort`) are
//! assumed to apply atomically on the server side; this module only does
//! sequencing, logging, timeouts, and error translation. Every invocation
//! runs under an explicit timeout; a hung publish counts as a failed
//! publish, never as a stuck pipeline.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use stratum_common::error::TransactionError;

use crate::layout::Compression;

/// Default timeout for a single `cvmfs_server` invocation. Ingesting a large
/// software tarball can legitimately take a long time.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 3600;

/// How the `cvmfs_server` command is invoked on this host.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CvmfsSettings {
    /// Command name or path; tests point this at a stub script.
    pub command: String,

    /// Publish operations usually need root on a stratum 0.
    pub ingest_as_root: bool,

    /// Mount point of the repositories, normally `/cvmfs`.
    pub repo_root: PathBuf,

    /// Timeout applied to every single command invocation.
    pub command_timeout_secs: u64,
}

impl Default for CvmfsSettings {
    fn default() -> Self {
        Self {
            command: "cvmfs_server".to_string(),
            ingest_as_root: true,
            repo_root: PathBuf::from("/cvmfs"),
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
        }
    }
}

/// Captured outcome of one external command.
#[derive(Debug)]
pub struct CommandOutput {
    /// The command line that ran, for diagnostics and tracking issues.
    pub command: String,
    pub status_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == Some(0)
    }

    /// Diagnostic used in error details and tracking issues: the command,
    /// its return code, and both output streams.
    pub fn diagnostic(&self) -> String {
        format!(
            "command: {}; return code: {}; stdout: {}; stderr: {}",
            self.command,
            self.status_code
                .map_or_else(|| "none".to_string(), |c| c.to_string()),
            self.stdout.trim(),
            self.stderr.trim()
        )
    }
}

/// Client for one host's `cvmfs_server` installation.
#[derive(Debug, Clone)]
pub struct CvmfsServer {
    settings: CvmfsSettings,
}

impl CvmfsServer {
    pub fn new(settings: CvmfsSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &CvmfsSettings {
        &self.settings
    }

    /// Mounted path of a repository (`/cvmfs/<repo>`).
    pub fn repo_path(&self, repo: &str) -> PathBuf {
        self.settings.repo_root.join(repo)
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = if self.settings.ingest_as_root {
            let mut c = Command::new("sudo");
            c.arg(&self.settings.command);
            c
        } else {
            Command::new(&self.settings.command)
        };
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.settings.command_timeout_secs)
    }

    async fn run(&self, description: &str, mut cmd: Command) -> std::io::Result<CommandOutput> {
        let command = format!("{:?}", cmd.as_std());
        debug!("exec ({description}): {command}");
        let child = cmd.spawn()?;
        let output = match tokio::time::timeout(self.timeout(), child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                warn!("{description} timed out after {}s", self.settings.command_timeout_secs);
                return Ok(CommandOutput {
                    command,
                    status_code: None,
                    stdout: String::new(),
                    stderr: format!(
                        "timed out after {}s",
                        self.settings.command_timeout_secs
                    ),
                });
            }
        };
        Ok(CommandOutput {
            command,
            status_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run a caller-built external command under this host's timeout policy.
    /// Used for collaborator scripts that share the transaction bracket.
    pub(crate) async fn run_external(
        &self,
        description: &str,
        cmd: Command,
    ) -> std::io::Result<CommandOutput> {
        self.run(description, cmd).await
    }

    /// Open a transaction on a repository.
    pub async fn transaction(&self, repo: &str) -> Result<(), TransactionError> {
        let out = self
            .run("open transaction", self.command(&["transaction", repo]))
            .await
            .map_err(|e| TransactionError::BeginFailed {
                repo: repo.to_string(),
                detail: e.to_string(),
            })?;
        if out.success() {
            Ok(())
        } else {
            Err(TransactionError::BeginFailed {
                repo: repo.to_string(),
                detail: out.diagnostic(),
            })
        }
    }

    /// Publish the currently open transaction.
    pub async fn publish(&self, repo: &str, message: &str) -> Result<(), TransactionError> {
        let out = self
            .run(
                "publish transaction",
                self.command(&["publish", "-m", message, repo]),
            )
            .await
            .map_err(|e| TransactionError::PublishFailed {
                repo: repo.to_string(),
                detail: e.to_string(),
            })?;
        if out.success() {
            Ok(())
        } else {
            Err(TransactionError::PublishFailed {
                repo: repo.to_string(),
                detail: out.diagnostic(),
            })
        }
    }

    /// Abort the currently open transaction. A failure here is fatal for the
    /// repository: it may be left with an open transaction.
    pub async fn abort(&self, repo: &str) -> Result<(), TransactionError> {
        let out = self
            .run("abort transaction", self.command(&["abort", "-f", repo]))
            .await
            .map_err(|e| TransactionError::AbortFailed {
                repo: repo.to_string(),
                detail: e.to_string(),
            })?;
        if out.success() {
            Ok(())
        } else {
            Err(TransactionError::AbortFailed {
                repo: repo.to_string(),
                detail: out.diagnostic(),
            })
        }
    }

    /// Stream a tarball into a repository: the decompressor for its codec is
    /// piped straight into `cvmfs_server ingest -t - -b <base_dir>`.
    ///
    /// The transaction bracket is implicit inside the `ingest` primitive, but
    /// raw ingestion does not rebuild nested catalogs; callers follow up with
    /// a [`CvmfsServer::transaction`] + [`CvmfsServer::publish`] pass.
    pub async fn ingest(
        &self,
        repo: &str,
        base_dir: &str,
        tarball: &Path,
        compression: Compression,
    ) -> Result<(), TransactionError> {
        let ingest_failed = |detail: String| TransactionError::IngestFailed {
            repo: repo.to_string(),
            detail,
        };

        let (program, args) = compression.decompressor();
        let mut decompress = Command::new(program);
        decompress.args(args);
        decompress.arg(tarball);
        decompress.stdin(Stdio::null());
        decompress.stdout(Stdio::piped());
        decompress.stderr(Stdio::piped());
        decompress.kill_on_drop(true);
        debug!("exec (decompress tarball): {decompress:?}");
        let mut decompress = decompress
            .spawn()
            .map_err(|e| ingest_failed(format!("failed to spawn {program}: {e}")))?;
        let stream = decompress
            .stdout
            .take()
            .ok_or_else(|| ingest_failed("decompressor stdout not captured".to_string()))?;

        let mut cmd = self.command(&["ingest", "-t", "-", "-b", base_dir, repo]);
        let stdin: Stdio = stream
            .try_into()
            .map_err(|_| ingest_failed("failed to wire decompressor pipe".to_string()))?;
        cmd.stdin(stdin);

        let out = self
            .run("ingest tarball", cmd)
            .await
            .map_err(|e| ingest_failed(e.to_string()))?;

        // Reap the decompressor; a corrupt download shows up here, not in
        // cvmfs_server's exit code.
        let dec_out = match tokio::time::timeout(self.timeout(), decompress.wait_with_output())
            .await
        {
            Ok(Ok(o)) => o,
            Ok(Err(e)) => return Err(ingest_failed(format!("{program} failed: {e}"))),
            Err(_) => {
                return Err(ingest_failed(format!(
                    "{program} timed out after {}s",
                    self.settings.command_timeout_secs
                )))
            }
        };
        if !dec_out.status.success() {
            return Err(ingest_failed(format!(
                "{program} exited with {:?}: {}",
                dec_out.status.code(),
                String::from_utf8_lossy(&dec_out.stderr).trim()
            )));
        }

        if out.success() {
            Ok(())
        } else {
            Err(ingest_failed(out.diagnostic()))
        }
    }

    /// Repositories served by this host, from `cvmfs_server list`.
    ///
    /// Used as a precondition probe, so failures surface as plain IO errors
    /// rather than transactional ones; nothing has been opened yet.
    pub async fn list_repositories(&self) -> std::io::Result<Vec<String>> {
        let out = self.run("list repositories", self.command(&["list"])).await?;
        if !out.success() {
            return Err(std::io::Error::other(format!(
                "cvmfs_server list failed: {}",
                out.diagnostic()
            )));
        }
        Ok(out
            .stdout
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .map(str::to_string)
            .collect())
    }
}
