//! Content digests.

use std::{fmt, io, path::Path};

use twox_hash::XxHash64;

const DIGEST_SEED: u64 = 0;

/// A fingerprint of a byte sequence.
///
/// Digests are only compared within a single process, so a fast non-cryptographic hash is sufficient.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContentDigest(u64);

impl ContentDigest {
    /// Computes the digest of the given bytes.
    pub fn of(data: &[u8]) -> Self {
        Self(XxHash64::oneshot(DIGEST_SEED, data))
    }

    /// Computes the digest of the file at `path`.
    ///
    /// # Errors
    ///
    /// If the file cannot be read, an error is returned.
    pub async fn of_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let data = tokio::fs::read(path).await?;
        Ok(Self::of(&data))
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    #[test]
    fn equal_content_equal_digest() {
        assert_eq!(ContentDigest::of(b"init_config: []"), ContentDigest::of(b"init_config: []"));
        assert_ne!(ContentDigest::of(b"instances: []"), ContentDigest::of(b"instances: [] "));
    }

    #[test]
    fn display_is_fixed_width_hex() {
        let rendered = ContentDigest::of(b"").to_string();
        assert_eq!(rendered.len(), 16);
        assert!(rendered.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn file_digest_matches_content_digest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"---\ninit_config: []\n").unwrap();

        let digest = ContentDigest::of_file(file.path()).await.unwrap();
        assert_eq!(digest, ContentDigest::of(b"---\ninit_config: []\n"));
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        assert!(ContentDigest::of_file("/nonexistent/php_fpm.yaml").await.is_err());
    }
}
