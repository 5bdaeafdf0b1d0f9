use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
};

use confd_common::hash::ContentDigest;
use confd_error::{FailureScope, ScopedFailure};
use snafu::{ResultExt as _, Snafu};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncSeekExt as _, AsyncWriteExt as _},
};
use tracing::{debug, info};

/// A configuration file error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum CommitError {
    #[snafu(display("Failed to open check configuration file '{}': {}", path.display(), source))]
    Open { path: PathBuf, source: std::io::Error },

    #[snafu(display("Failed to write check configuration file '{}': {}", path.display(), source))]
    Write { path: PathBuf, source: std::io::Error },

    #[snafu(display("Failed to sync check configuration file '{}': {}", path.display(), source))]
    Persist { path: PathBuf, source: std::io::Error },
}

impl ScopedFailure for CommitError {
    fn scope(&self) -> FailureScope {
        match self {
            Self::Open { .. } => FailureScope::Process,
            Self::Write { .. } | Self::Persist { .. } => FailureScope::Pass,
        }
    }
}

/// Result of a successful commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The file content changed and was written.
    Committed {
        previous: Option<ContentDigest>,
        current: ContentDigest,
    },

    /// The file already held this content. Nothing was written.
    Unchanged { digest: ContentDigest },
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }
}

/// Owns one check configuration file and writes to it only when its content changes.
///
/// The digest of the last content known to be on disk is kept in memory. It is seeded from the file when the committer
/// is opened and only advanced after a write has been flushed and synced, so a failed write is retried on the next
/// commit.
#[derive(Debug)]
pub struct ConfigCommitter {
    path: PathBuf,
    file: File,
    digest: Option<ContentDigest>,
}

impl ConfigCommitter {
    /// Opens the file at `path`, creating it if missing.
    ///
    /// Existing content is left in place until the first commit that changes it.
    ///
    /// # Errors
    ///
    /// If the file cannot be opened for writing, an error is returned.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, CommitError> {
        let path = path.as_ref().to_path_buf();

        let digest = match ContentDigest::of_file(&path).await {
            Ok(digest) => Some(digest),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "No readable check configuration on disk.");
                None
            }
        };

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await
            .context(Open { path: path.clone() })?;

        Ok(Self { path, file, digest })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Digest of the content last known to be on disk.
    pub fn digest(&self) -> Option<ContentDigest> {
        self.digest
    }

    /// Makes the file hold `content`.
    ///
    /// # Errors
    ///
    /// If writing or syncing the file fails, an error is returned and the in-memory digest is left unchanged.
    pub async fn commit(&mut self, content: &[u8]) -> Result<CommitOutcome, CommitError> {
        let current = ContentDigest::of(content);
        if self.digest == Some(current) {
            return Ok(CommitOutcome::Unchanged { digest: current });
        }

        self.write_all(content).await?;
        self.file.sync_all().await.context(Persist { path: self.path.clone() })?;

        let previous = self.digest.replace(current);
        info!(
            path = %self.path.display(),
            previous = ?previous.map(|d| d.to_string()),
            current = %current,
            "Wrote check configuration."
        );

        Ok(CommitOutcome::Committed { previous, current })
    }

    async fn write_all(&mut self, content: &[u8]) -> Result<(), CommitError> {
        let file = &mut self.file;
        let result = async {
            file.set_len(0).await?;
            file.seek(SeekFrom::Start(0)).await?;
            file.write_all(content).await?;
            file.flush().await
        }
        .await;

        result.context(Write { path: self.path.clone() })
    }
}
