//! Raw provider downloads and processed intake files kept on disk.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

/// Hex digest prefix used in download file names.
const HASH_PREFIX_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct KeptDownload {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
    /// Same bytes were already on disk for that provider and day.
    pub already_present: bool,
}

#[derive(Debug, Clone)]
pub struct ArchivedFile {
    pub archived_path: PathBuf,
    pub byte_size: u64,
}

#[derive(Debug, Clone)]
pub struct RawArchive {
    root: PathBuf,
}

impl RawArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn content_hash(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// `downloads/<provider>/<YYYY-MM-DD>/<hash prefix>.<ext>`
    fn download_path(&self, fetched_at: DateTime<Utc>, provider: &str, hash: &str, extension: &str) -> PathBuf {
        let ext = match extension.trim().trim_start_matches('.') {
            "" => "bin",
            ext => ext,
        };
        let prefix = &hash[..hash.len().min(HASH_PREFIX_LEN)];
        self.root
            .join("downloads")
            .join(provider)
            .join(fetched_at.format("%Y-%m-%d").to_string())
            .join(format!("{prefix}.{ext}"))
    }

    /// Keep a provider payload. Identical bytes fetched the same day are
    /// stored once; new files appear only after a complete write.
    pub async fn keep_download(
        &self,
        fetched_at: DateTime<Utc>,
        provider: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<KeptDownload> {
        let content_hash = Self::content_hash(bytes);
        let path = self.download_path(fetched_at, provider, &content_hash, extension);
        let mut kept = KeptDownload {
            path: path.clone(),
            content_hash,
            byte_size: bytes.len(),
            already_present: false,
        };
        if fs::try_exists(&path).await.unwrap_or(false) {
            kept.already_present = true;
            return Ok(kept);
        }

        let dir = path.parent().unwrap_or(self.root.as_path()).to_path_buf();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating download directory {}", dir.display()))?;
        let partial = dir.join(format!(".{}.partial", Uuid::new_v4()));
        let written = async {
            let mut file = fs::File::create(&partial).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            fs::rename(&partial, &path).await
        }
        .await;
        if let Err(err) = written {
            let _ = fs::remove_file(&partial).await;
            return Err(err).with_context(|| format!("writing download {}", path.display()));
        }
        Ok(kept)
    }

    /// `<stem>_<YYYYmmdd_HHMMSS><.ext>`
    pub fn archived_name(path: &Path, processed_at: DateTime<Utc>) -> String {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "input".to_string());
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        format!("{stem}_{}{ext}", processed_at.format("%Y%m%d_%H%M%S"))
    }

    /// Move an ingested intake file into the archive directory.
    pub async fn archive_processed(&self, path: &Path, processed_at: DateTime<Utc>) -> anyhow::Result<ArchivedFile> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating archive directory {}", self.root.display()))?;
        let byte_size = fs::metadata(path)
            .await
            .with_context(|| format!("reading metadata of {}", path.display()))?
            .len();
        let archived_path = self.root.join(Self::archived_name(path, processed_at));

        if let Err(err) = fs::rename(path, &archived_path).await {
            debug!(error = %err, "rename failed; copying then removing");
            fs::copy(path, &archived_path)
                .await
                .with_context(|| format!("copying {} into the archive", path.display()))?;
            fs::remove_file(path)
                .await
                .with_context(|| format!("removing {}", path.display()))?;
        }
        Ok(ArchivedFile {
            archived_path,
            byte_size,
        })
    }
}
