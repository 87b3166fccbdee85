//! Checksum utilities for tarball verification
//!
//! Producer metadata carries a sha256 for every payload; the orchestrator
//! refuses to ingest a download whose digest does not match.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{PreconditionError, Result};

/// Compute the sha256 checksum of a file, hex-encoded.
pub fn sha256_file(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    sha256_reader(&mut file)
}

/// Compute the sha256 checksum of any readable source, hex-encoded.
pub fn sha256_reader<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Verify that a file's sha256 matches the expected digest.
pub fn verify_sha256(path: impl AsRef<Path>, expected: &str) -> Result<()> {
    let path = path.as_ref();
    let actual = sha256_file(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(PreconditionError::ChecksumMismatch {
            file: path.display().to_string(),
            expected: expected.to_string(),
            actual,
        }
        .into())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_sha256_reader() {
        let mut cursor = Cursor::new(b"hello world");
        let checksum = sha256_reader(&mut cursor).unwrap();
        assert_eq!(
            checksum,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_verify_sha256_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.tar.gz");
        std::fs::write(&path, b"not the right bytes").unwrap();

        let err = verify_sha256(&path, "00").unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_verify_sha256_accepts_uppercase_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.tar.gz");
        std::fs::write(&path, b"hello world").unwrap();

        verify_sha256(
            &path,
            "B94D27B9934D3E08A52E52D7DA7DABFAC484EFE37A5380EE9088F7ACE2EFCDE9",
        )
        .unwrap();
    }
}
