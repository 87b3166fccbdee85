//! Layout rules for the distribution tree
//!
//! Producers name their tarballs
//! `<prefix>-<version>-<class>[-<os>-<arch>][-<extra>]-<timestamp>.tar.{gz,zst}`
//! and lay out the contents as `<version>/<class>/[<os>/<arch>/]...`. Both
//! conventions are the wire format shared with every existing producer, so
//! the parser here extracts fixed delimiter-separated fields rather than
//! guessing.
//!
//! [`validate`] cross-checks the name against the member listing: the version
//! in the name must be the top-level directory, the content class directory
//! must be one of the four recognized classes, and compat/software tarballs
//! must sit under known os/arch directories. It never reads file contents,
//! only names.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use stratum_common::error::ValidationError;

/// Version strings are either release series (`YYYY.MM`) or snapshot dates
/// (`YYYYMMDD`).
static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4}\.\d{2}|\d{8})$").expect("version grammar regex is valid")
});

/// Content class of a tarball, determining its ingestion procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentClass {
    /// OS/architecture-specific compatibility runtime bundle
    Compat,
    /// Bootstrap/init scripts
    Init,
    /// Utility scripts
    Scripts,
    /// Software installations plus their module files
    Software,
}

impl ContentClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentClass::Compat => "compat",
            ContentClass::Init => "init",
            ContentClass::Scripts => "scripts",
            ContentClass::Software => "software",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "compat" => Some(ContentClass::Compat),
            "init" => Some(ContentClass::Init),
            "scripts" => Some(ContentClass::Scripts),
            "software" => Some(ContentClass::Software),
            _ => None,
        }
    }

    /// Classes whose contents are partitioned by os/arch directories.
    pub fn is_arch_specific(&self) -> bool {
        matches!(self, ContentClass::Compat | ContentClass::Software)
    }
}

impl fmt::Display for ContentClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operating systems the tree distributes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Linux,
    Macos,
}

impl OsFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsFamily::Linux => "linux",
            OsFamily::Macos => "macos",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "linux" => Some(OsFamily::Linux),
            "macos" => Some(OsFamily::Macos),
            _ => None,
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU architectures the tree distributes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuArch {
    X86_64,
    Aarch64,
    Riscv64,
    Ppc64le,
}

impl CpuArch {
    pub fn as_str(&self) -> &'static str {
        match self {
            CpuArch::X86_64 => "x86_64",
            CpuArch::Aarch64 => "aarch64",
            CpuArch::Riscv64 => "riscv64",
            CpuArch::Ppc64le => "ppc64le",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "x86_64" => Some(CpuArch::X86_64),
            "aarch64" => Some(CpuArch::Aarch64),
            "riscv64" => Some(CpuArch::Riscv64),
            "ppc64le" => Some(CpuArch::Ppc64le),
            _ => None,
        }
    }
}

impl fmt::Display for CpuArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier fields parsed out of a tarball filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarballId {
    pub prefix: String,
    pub version: String,
    /// Raw class field; not yet checked against the known classes
    pub class: String,
    pub os: Option<String>,
    pub arch: Option<String>,
    pub extra: Vec<String>,
    pub timestamp: String,
    pub compression: Compression,
}

/// Supported tarball compression codecs and the external decompressor each
/// one needs on the ingesting host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Zstd,
}

impl Compression {
    /// Detect the codec from a filename, if it carries a supported extension.
    pub fn from_name(name: &str) -> Option<Self> {
        if name.ends_with(".tar.gz") {
            Some(Compression::Gzip)
        } else if name.ends_with(".tar.zst") {
            Some(Compression::Zstd)
        } else {
            None
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Compression::Gzip => ".tar.gz",
            Compression::Zstd => ".tar.zst",
        }
    }

    /// The decompressor program piped into `cvmfs_server ingest`.
    pub fn decompressor(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            Compression::Gzip => ("gzip", &["-cd"]),
            Compression::Zstd => ("zstd", &["-dc"]),
        }
    }
}

impl TarballId {
    /// Parse a tarball filename into its identifier fields.
    ///
    /// Only the structure and the version grammar are enforced here; class,
    /// os and arch are validated against the tarball contents by
    /// [`validate`].
    pub fn parse(name: &str) -> Result<Self, ValidationError> {
        let malformed = || ValidationError::MalformedName(name.to_string());

        let compression = Compression::from_name(name).ok_or_else(malformed)?;
        let stem = name
            .rsplit('/')
            .next()
            .and_then(|base| base.strip_suffix(compression.extension()))
            .ok_or_else(malformed)?;

        let fields: Vec<&str> = stem.split('-').collect();
        // prefix, version, class, timestamp at minimum
        if fields.len() < 4 {
            return Err(malformed());
        }

        let version = fields[1];
        if !VERSION_RE.is_match(version) {
            return Err(malformed());
        }

        let class = fields[2];
        let timestamp = fields[fields.len() - 1];
        if timestamp.is_empty() || !timestamp.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }

        // os/arch fields are only present on arch-specific tarballs, and only
        // when there is room for them between the class and the timestamp
        let (os, arch, extra_start) = match ContentClass::parse(class) {
            Some(c) if c.is_arch_specific() && fields.len() >= 6 => {
                (Some(fields[3]), Some(fields[4]), 5)
            }
            _ => (None, None, 3),
        };

        Ok(TarballId {
            prefix: fields[0].to_string(),
            version: version.to_string(),
            class: class.to_string(),
            os: os.map(str::to_string),
            arch: arch.map(str::to_string),
            extra: fields[extra_start..fields.len() - 1]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            timestamp: timestamp.to_string(),
            compression,
        })
    }
}

/// Depth conventions of the target tree.
///
/// A multi-tenant tree prefixes every member path with one project segment
/// (`<project>/<version>/<class>/...`), shifting every fixed depth by one.
/// That single offset is the only knob; the relative layout is identical.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayoutRules {
    pub tenant: bool,
}

impl LayoutRules {
    pub fn depth_offset(&self) -> usize {
        usize::from(self.tenant)
    }

    /// Directory under the repository root that `cvmfs_server ingest`
    /// unpacks into, optionally qualified by the tenant project.
    pub fn base_dir(&self, project: Option<&str>) -> String {
        match (self.tenant, project) {
            (true, Some(project)) => format!("{project}/versions"),
            _ => "versions".to_string(),
        }
    }

    /// Derive the contents descriptor from a tarball's member paths.
    pub fn descriptor(&self, member_paths: &[String]) -> ContentsDescriptor {
        let off = self.depth_offset();
        let segment_at = |depth: usize| -> Option<String> {
            member_paths.iter().find_map(|p| {
                p.split('/')
                    .filter(|s| !s.is_empty())
                    .nth(depth)
                    .map(str::to_string)
            })
        };

        ContentsDescriptor {
            project: if self.tenant { segment_at(0) } else { None },
            top_level: segment_at(off),
            class_dir: segment_at(off + 1),
            os_dir: segment_at(off + 2),
            arch_dir: segment_at(off + 3),
        }
    }
}

/// What the tarball's member listing says about its layout: the directory
/// names at each of the fixed depths. Derived from names only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentsDescriptor {
    pub project: Option<String>,
    pub top_level: Option<String>,
    pub class_dir: Option<String>,
    pub os_dir: Option<String>,
    pub arch_dir: Option<String>,
}

/// Decide whether a tarball is well-formed for ingestion and what content
/// class it is.
///
/// Checks, in order: the name parses and its version matches the grammar;
/// the version equals the top-level directory; the content class directory is
/// recognized and agrees with the name; for compat/software, the os and arch
/// directories are members of the known sets.
pub fn validate(
    tarball_name: &str,
    contents: &ContentsDescriptor,
) -> Result<ContentClass, ValidationError> {
    let id = TarballId::parse(tarball_name)?;

    let top_level = contents
        .top_level
        .clone()
        .unwrap_or_default();
    if id.version != top_level {
        return Err(ValidationError::VersionMismatch {
            name_version: id.version,
            top_level,
        });
    }

    let class_dir = contents.class_dir.clone().unwrap_or_default();
    let class = ContentClass::parse(&class_dir)
        .filter(|c| c.as_str() == id.class)
        .ok_or(ValidationError::UnknownContentClass(class_dir))?;

    if class.is_arch_specific() {
        let os_dir = contents.os_dir.clone().unwrap_or_default();
        OsFamily::parse(&os_dir).ok_or(ValidationError::UnknownOs(os_dir))?;

        let arch_dir = contents.arch_dir.clone().unwrap_or_default();
        CpuArch::parse(&arch_dir).ok_or(ValidationError::UnknownArch(arch_dir))?;
    }

    Ok(class)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn descriptor(paths: &[&str]) -> ContentsDescriptor {
        let paths: Vec<String> = paths.iter().map(|s| s.to_string()).collect();
        LayoutRules::default().descriptor(&paths)
    }

    #[test]
    fn test_parse_compat_name() {
        let id = TarballId::parse("eessi-2000.01-compat-linux-x86_64-123456.tar.gz").unwrap();
        assert_eq!(id.prefix, "eessi");
        assert_eq!(id.version, "2000.01");
        assert_eq!(id.class, "compat");
        assert_eq!(id.os.as_deref(), Some("linux"));
        assert_eq!(id.arch.as_deref(), Some("x86_64"));
        assert!(id.extra.is_empty());
        assert_eq!(id.timestamp, "123456");
        assert_eq!(id.compression, Compression::Gzip);
    }

    #[test]
    fn test_parse_init_name_without_os_arch() {
        let id = TarballId::parse("eessi-20260101-init-1700000000.tar.zst").unwrap();
        assert_eq!(id.version, "20260101");
        assert_eq!(id.class, "init");
        assert_eq!(id.os, None);
        assert_eq!(id.arch, None);
        assert_eq!(id.compression, Compression::Zstd);
    }

    #[test]
    fn test_parse_software_name_with_extra_field() {
        let id =
            TarballId::parse("eessi-2023.06-software-linux-aarch64-generic-1700000000.tar.gz")
                .unwrap();
        assert_eq!(id.os.as_deref(), Some("linux"));
        assert_eq!(id.arch.as_deref(), Some("aarch64"));
        assert_eq!(id.extra, vec!["generic".to_string()]);
    }

    #[test]
    fn test_parse_strips_object_key_prefix() {
        let id = TarballId::parse("staging/eessi-2000.01-scripts-42.tar.gz").unwrap();
        assert_eq!(id.class, "scripts");
    }

    #[test]
    fn test_parse_rejects_bad_version_grammar() {
        for name in [
            "eessi-v2.0-compat-linux-x86_64-123456.tar.gz",
            "eessi-2000.1-compat-linux-x86_64-123456.tar.gz",
            "eessi-200001-compat-linux-x86_64-123456.tar.gz",
        ] {
            assert!(matches!(
                TarballId::parse(name),
                Err(ValidationError::MalformedName(_))
            ));
        }
    }

    #[test]
    fn test_parse_rejects_unsupported_extension() {
        assert!(matches!(
            TarballId::parse("eessi-2000.01-compat-linux-x86_64-123456.tar.xz"),
            Err(ValidationError::MalformedName(_))
        ));
    }

    #[test]
    fn test_validate_accepts_compat_tarball() {
        let contents = descriptor(&["2000.01/compat/linux/x86_64/startprak"]);
        let class =
            validate("eessi-2000.01-compat-linux-x86_64-123456.tar.gz", &contents).unwrap();
        assert_eq!(class, ContentClass::Compat);
    }

    #[test]
    fn test_validate_accepts_each_class() {
        for (name, paths, expected) in [
            (
                "eessi-2000.01-init-123456.tar.gz",
                vec!["2000.01/init/bashrc"],
                ContentClass::Init,
            ),
            (
                "eessi-2000.01-scripts-123456.tar.gz",
                vec!["2000.01/scripts/setup.sh"],
                ContentClass::Scripts,
            ),
            (
                "eessi-2000.01-software-linux-x86_64-123456.tar.gz",
                vec!["2000.01/software/linux/x86_64/GCC/13.2.0/bin/gcc"],
                ContentClass::Software,
            ),
        ] {
            let contents = descriptor(&paths);
            assert_eq!(validate(name, &contents).unwrap(), expected);
        }
    }

    #[test]
    fn test_validate_version_mismatch() {
        // top-level dir is the class instead of the version
        let contents = descriptor(&["compat/linux/x86_64/startprak"]);
        let err = validate("eessi-2000.01-compat-123456.tar.gz", &contents).unwrap_err();
        assert_eq!(
            err,
            ValidationError::VersionMismatch {
                name_version: "2000.01".to_string(),
                top_level: "compat".to_string(),
            }
        );
    }

    #[test]
    fn test_validate_unknown_content_class() {
        let contents = descriptor(&["2000.01/tools/foo"]);
        let err = validate("eessi-2000.01-tools-123456.tar.gz", &contents).unwrap_err();
        assert_eq!(err, ValidationError::UnknownContentClass("tools".to_string()));
    }

    #[test]
    fn test_validate_class_disagreement_between_name_and_contents() {
        let contents = descriptor(&["2000.01/init/bashrc"]);
        let err = validate("eessi-2000.01-scripts-123456.tar.gz", &contents).unwrap_err();
        assert_eq!(err, ValidationError::UnknownContentClass("init".to_string()));
    }

    #[test]
    fn test_validate_unknown_os_and_arch() {
        let contents = descriptor(&["2000.01/compat/windows/x86_64/startprak"]);
        let err = validate("eessi-2000.01-compat-windows-x86_64-1.tar.gz", &contents).unwrap_err();
        assert_eq!(err, ValidationError::UnknownOs("windows".to_string()));

        let contents = descriptor(&["2000.01/compat/linux/sparc64/startprak"]);
        let err = validate("eessi-2000.01-compat-linux-sparc64-1.tar.gz", &contents).unwrap_err();
        assert_eq!(err, ValidationError::UnknownArch("sparc64".to_string()));
    }

    #[test]
    fn test_validate_os_arch_not_checked_for_flat_classes() {
        // init/scripts tarballs have no os/arch depth to check
        let contents = descriptor(&["2000.01/init/Magic/extra/deep/tree"]);
        assert_eq!(
            validate("eessi-2000.01-init-123456.tar.gz", &contents).unwrap(),
            ContentClass::Init
        );
    }

    #[test]
    fn test_tenant_offset_shifts_depths() {
        let rules = LayoutRules { tenant: true };
        let paths = vec!["genomics/2000.01/compat/linux/x86_64/startprak".to_string()];
        let contents = rules.descriptor(&paths);
        assert_eq!(contents.project.as_deref(), Some("genomics"));
        assert_eq!(contents.top_level.as_deref(), Some("2000.01"));

        let class =
            validate("eessi-2000.01-compat-linux-x86_64-123456.tar.gz", &contents).unwrap();
        assert_eq!(class, ContentClass::Compat);
        assert_eq!(rules.base_dir(contents.project.as_deref()), "genomics/versions");
        assert_eq!(LayoutRules::default().base_dir(None), "versions");
    }
}
