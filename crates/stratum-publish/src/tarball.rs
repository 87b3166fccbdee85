//! Tarball inspection and extraction
//!
//! Everything here works from the member listing; nothing is unpacked except
//! through [`Tarball::unpack_into`], which the publisher only calls inside an
//! open transaction.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;

use stratum_common::error::{PreconditionError, Result};

use crate::layout::Compression;

/// GitHub caps issue/PR bodies at 65536 characters; leave headroom for the
/// text around the listing.
const OVERVIEW_MAX_CHARS: usize = 60_000;

/// Full member listings are only readable up to this many entries; beyond it
/// the overview switches to a summarized view.
const OVERVIEW_FULL_LISTING_LIMIT: usize = 100;

/// One entry of a tarball's member listing.
#[derive(Debug, Clone)]
pub struct Member {
    pub path: String,
    pub is_dir: bool,
}

/// A local tarball plus its detected compression codec.
#[derive(Debug, Clone)]
pub struct Tarball {
    path: PathBuf,
    compression: Compression,
}

impl Tarball {
    /// Open a local tarball, detecting the codec from its extension.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_file() {
            return Err(PreconditionError::TarballNotFound(path).into());
        }
        let name = path.to_string_lossy();
        let compression = Compression::from_name(&name)
            .ok_or_else(|| PreconditionError::UnsupportedExtension(name.into_owned()))?;
        Ok(Self { path, compression })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    fn reader(&self) -> Result<Box<dyn Read>> {
        let file = File::open(&self.path)?;
        Ok(match self.compression {
            Compression::Gzip => Box::new(GzDecoder::new(file)),
            Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(file)?),
        })
    }

    /// List the members without extracting anything.
    pub fn members(&self) -> Result<Vec<Member>> {
        let mut archive = Archive::new(self.reader()?);
        let mut members = Vec::new();
        for entry in archive.entries()? {
            let entry = entry?;
            members.push(Member {
                path: entry
                    .path()?
                    .to_string_lossy()
                    .trim_end_matches('/')
                    .to_string(),
                is_dir: entry.header().entry_type().is_dir(),
            });
        }
        Ok(members)
    }

    /// Member paths only, in archive order.
    pub fn member_paths(&self) -> Result<Vec<String>> {
        Ok(self.members()?.into_iter().map(|m| m.path).collect())
    }

    /// Unpack the whole archive under `dest`.
    pub fn unpack_into(&self, dest: impl AsRef<Path>) -> Result<()> {
        let mut archive = Archive::new(self.reader()?);
        archive.set_preserve_permissions(true);
        archive.unpack(dest)?;
        Ok(())
    }

    /// Human-readable overview of the contents, for review pull requests.
    ///
    /// Tarballs with up to 100 members get a full listing. Larger ones are
    /// summarized down to software installation directories, module files,
    /// and whatever falls outside those two trees. The result is clamped
    /// below the review host's comment size limit.
    pub fn contents_overview(&self, url: &str) -> Result<String> {
        let members = self.members()?;
        Ok(render_overview(&members, url))
    }
}

fn render_overview(members: &[Member], url: &str) -> String {
    let mut paths: Vec<&str> = members.iter().map(|m| m.path.as_str()).collect();
    paths.sort_unstable();

    let (description, listing) = if members.len() < OVERVIEW_FULL_LISTING_LIMIT {
        (
            "Full listing of the contents of the tarball:",
            paths.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
        )
    } else {
        (
            "Summarized overview of the contents of the tarball:",
            summarize_members(members),
        )
    };

    let mut overview = format!(
        "Total number of items in the tarball: {}\nURL to the tarball: {}\n{}\n```\n{}\n```",
        members.len(),
        url,
        description,
        listing.join("\n"),
    );

    if overview.len() > OVERVIEW_MAX_CHARS {
        overview.truncate(OVERVIEW_MAX_CHARS);
        overview.push_str("\n\nWARNING: output exceeded the maximum length and was truncated!\n```");
    }
    overview
}

/// Summarize a large member list: software installation directories
/// (`software/<name>/<version>`), module files (`modules/**/*.lua`), and
/// everything outside those two trees.
fn summarize_members(members: &[Member]) -> Vec<String> {
    let split: Vec<Vec<&str>> = members
        .iter()
        .map(|m| m.path.split('/').filter(|s| !s.is_empty()).collect())
        .collect();
    let prefix_len = common_prefix_len(&split);

    let mut summary: Vec<String> = Vec::new();
    for (member, segments) in members.iter().zip(&split) {
        let rel = &segments[prefix_len.min(segments.len())..];
        let keep = match rel.first().copied() {
            Some("software") => member.is_dir && rel.len() == 3,
            Some("modules") => !member.is_dir && rel.last().is_some_and(|f| f.ends_with(".lua")),
            _ => true,
        };
        if keep {
            summary.push(member.path.clone());
        }
    }
    summary.sort_unstable();
    summary
}

/// Number of leading path segments shared by every member.
fn common_prefix_len(split_paths: &[Vec<&str>]) -> usize {
    let Some(first) = split_paths.first() else {
        return 0;
    };
    let mut len = first.len();
    for segments in &split_paths[1..] {
        let mut common = 0;
        while common < len.min(segments.len()) && segments[common] == first[common] {
            common += 1;
        }
        len = common;
        if len == 0 {
            break;
        }
    }
    len
}
