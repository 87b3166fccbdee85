//! Exit-code contract of the stratum-publish binary.
//!
//! Success is 0; validation, precondition, and transactional failures each
//! get their own non-zero code so cron wrappers and the orchestrator can
//! tell them apart without parsing output.

use std::fs::File;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use flate2::write::GzEncoder;
use predicates::prelude::*;

const REPO: &str = "software.example.org";

fn write_stub_cvmfs_server(dir: &Path) -> PathBuf {
    let stub = dir.join("cvmfs_server");
    let script = format!(
        "#!/bin/sh\ncase \"$1\" in\n    list) echo \"{REPO}\" ;;\n    ingest) cat > /dev/null ;;\nesac\nexit 0\n"
    );
    std::fs::write(&stub, script).expect("write stub");
    let mut perms = std::fs::metadata(&stub).expect("stat").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&stub, perms).expect("chmod");
    stub
}

fn build_tarball(dir: &Path, name: &str, member: &str) -> PathBuf {
    let path = dir.join(name);
    let encoder = GzEncoder::new(
        File::create(&path).expect("create"),
        flate2::Compression::default(),
    );
    let mut builder = tar::Builder::new(encoder);
    let mut header = tar::Header::new_gnu();
    header.set_size(0);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, member, std::io::empty())
        .expect("append");
    builder
        .into_inner()
        .expect("finish tar")
        .finish()
        .expect("finish gzip");
    path
}

fn publish_cmd(dir: &Path) -> Command {
    let stub = write_stub_cvmfs_server(dir);
    let repo_root = dir.join("cvmfs");
    std::fs::create_dir_all(repo_root.join(REPO).join("versions")).expect("repo tree");

    let mut cmd = Command::cargo_bin("stratum-publish").expect("binary");
    cmd.arg("--no-sudo")
        .arg("--cvmfs-command")
        .arg(&stub)
        .arg("--repo-root")
        .arg(&repo_root);
    cmd
}

#[test]
fn successful_ingest_exits_zero() {
    let dir = tempfile::tempdir().expect("tempdir");
    let tarball = build_tarball(
        dir.path(),
        "eessi-2000.01-init-1700000000.tar.gz",
        "2000.01/init/bashrc",
    );

    publish_cmd(dir.path())
        .arg(REPO)
        .arg(&tarball)
        .assert()
        .success();
}

#[test]
fn version_mismatch_exits_with_validation_code() {
    let dir = tempfile::tempdir().expect("tempdir");
    // top-level directory is the class, not the version
    let tarball = build_tarball(
        dir.path(),
        "eessi-2000.01-compat-1700000000.tar.gz",
        "compat/linux/x86_64/startprak",
    );

    publish_cmd(dir.path())
        .arg(REPO)
        .arg(&tarball)
        .assert()
        .code(2);
}

#[test]
fn missing_tarball_exits_with_precondition_code() {
    let dir = tempfile::tempdir().expect("tempdir");
    publish_cmd(dir.path())
        .arg(REPO)
        .arg(dir.path().join("eessi-2000.01-init-1.tar.gz"))
        .assert()
        .code(3);
}

#[test]
fn unknown_repository_exits_with_precondition_code() {
    let dir = tempfile::tempdir().expect("tempdir");
    let tarball = build_tarball(
        dir.path(),
        "eessi-2000.01-init-1700000000.tar.gz",
        "2000.01/init/bashrc",
    );

    publish_cmd(dir.path())
        .arg("missing.example.org")
        .arg(&tarball)
        .assert()
        .code(3)
        .stdout(predicate::str::contains("missing.example.org"));
}
