//! Durable artifact storage
//!
//! Captures written by an executor land in a staging directory; the store
//! moves them into the archive under a date-partitioned layout and records
//! the SHA-256 of the stored bytes.

use crate::StrataError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Where and how an artifact was stored
#[derive(Debug, Clone, PartialEq)]
pub struct StorageMetadata {
    pub filename: String,
    /// Backend-specific location of the stored file
    pub location: String,
    pub backend: String,
    pub file_size: u64,
    /// Lowercase hex SHA-256 of the stored bytes
    pub file_hash: String,
}

/// Durable storage for capture artifacts
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Identifier recorded on artifact rows
    fn backend(&self) -> &'static str;

    /// Stores a local capture file
    ///
    /// Stored artifacts are never overwritten: if the destination already
    /// exists the call fails.
    ///
    /// # Arguments
    ///
    /// * `local_path` - Capture file written by the executor
    /// * `project_code` - Code of the project the capture belongs to
    /// * `captured_at` - Capture time, used for naming and layout
    /// * `job_id` - Job that produced the capture
    async fn store(
        &self,
        local_path: &Path,
        project_code: &str,
        captured_at: DateTime<Utc>,
        job_id: &str,
    ) -> Result<StorageMetadata, StrataError>;

    /// Recomputes the hash of a stored artifact and compares it
    async fn verify(&self, metadata: &StorageMetadata) -> Result<bool, StrataError>;
}

/// Stores artifacts on the local filesystem under `YYYY/MM/DD/`
pub struct LocalArtifactStore {
    base_path: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn destination(&self, captured_at: &DateTime<Utc>, filename: &str) -> PathBuf {
        self.base_path
            .join(captured_at.format("%Y").to_string())
            .join(captured_at.format("%m").to_string())
            .join(captured_at.format("%d").to_string())
            .join(filename)
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    fn backend(&self) -> &'static str {
        "local"
    }

    async fn store(
        &self,
        local_path: &Path,
        project_code: &str,
        captured_at: DateTime<Utc>,
        job_id: &str,
    ) -> Result<StorageMetadata, StrataError> {
        let filename = artifact_filename(project_code, &captured_at, job_id);
        let destination = self.destination(&captured_at, &filename);

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut out = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&destination)
            .await
            .map_err(|e| {
                StrataError::Artifact(format!(
                    "cannot create {}: {}",
                    destination.display(),
                    e
                ))
            })?;

        if let Err(e) = copy_into(local_path, &mut out).await {
            drop(out);
            let _ = fs::remove_file(&destination).await;
            return Err(e);
        }
        drop(out);

        let (file_hash, file_size) = hash_file(&destination).await?;
        tracing::debug!(
            "Stored {} ({} bytes, sha256 {})",
            destination.display(),
            file_size,
            file_hash
        );

        Ok(StorageMetadata {
            filename,
            location: destination.to_string_lossy().into_owned(),
            backend: self.backend().to_string(),
            file_size,
            file_hash,
        })
    }

    async fn verify(&self, metadata: &StorageMetadata) -> Result<bool, StrataError> {
        let (hash, size) = hash_file(Path::new(&metadata.location)).await?;
        Ok(hash == metadata.file_hash && size == metadata.file_size)
    }
}

async fn copy_into(source: &Path, out: &mut fs::File) -> Result<(), StrataError> {
    let mut input = fs::File::open(source).await?;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = input.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).await?;
    }
    out.sync_all().await?;
    Ok(())
}

/// Streams a file through SHA-256
///
/// # Returns
///
/// The lowercase hex digest and the number of bytes read
pub async fn hash_file(path: &Path) -> Result<(String, u64), StrataError> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}

/// Artifact filename: `{project_code}_{YYYYMMDD_HHMMSS}_{job8}.warc`
///
/// Characters outside `[A-Za-z0-9._-]` in the project code become `_`.
pub fn artifact_filename(project_code: &str, captured_at: &DateTime<Utc>, job_id: &str) -> String {
    let code: String = project_code
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let job8: String = job_id.chars().filter(|c| *c != '-').take(8).collect();
    format!(
        "{}_{}_{}.warc",
        code,
        captured_at.format("%Y%m%d_%H%M%S"),
        job8
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn staged(dir: &TempDir, content: &[u8]) -> PathBuf {
        let path = dir.path().join("staged.warc");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_artifact_filename() {
        let at = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        assert_eq!(
            artifact_filename("BTC", &at, "0f1e2d3c-4b5a-6978-8796-a5b4c3d2e1f0"),
            "BTC_20240506_070809_0f1e2d3c.warc"
        );
        assert_eq!(
            artifact_filename("my coin/x", &at, "abc"),
            "my_coin_x_20240506_070809_abc.warc"
        );
    }

    #[tokio::test]
    async fn test_store_layout_and_hash() {
        let staging = TempDir::new().unwrap();
        let archive = TempDir::new().unwrap();
        let source = staged(&staging, b"warc bytes");
        let store = LocalArtifactStore::new(archive.path());
        let at = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();

        let meta = store
            .store(&source, "ETH", at, "12345678-aaaa")
            .await
            .unwrap();

        let expected = archive
            .path()
            .join("2024/05/06/ETH_20240506_070809_12345678.warc");
        assert_eq!(PathBuf::from(&meta.location), expected);
        assert_eq!(meta.backend, "local");
        assert_eq!(meta.file_size, 10);
        assert_eq!(meta.file_hash, hex::encode(Sha256::digest(b"warc bytes")));
        assert_eq!(std::fs::read(&expected).unwrap(), b"warc bytes");
        assert!(store.verify(&meta).await.unwrap());
    }

    #[tokio::test]
    async fn test_store_refuses_overwrite() {
        let staging = TempDir::new().unwrap();
        let archive = TempDir::new().unwrap();
        let source = staged(&staging, b"first");
        let store = LocalArtifactStore::new(archive.path());
        let at = Utc::now();

        let meta = store.store(&source, "SOL", at, "job").await.unwrap();
        std::fs::write(&source, b"second").unwrap();
        assert!(store.store(&source, "SOL", at, "job").await.is_err());
        assert_eq!(std::fs::read(&meta.location).unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_verify_detects_tampering() {
        let staging = TempDir::new().unwrap();
        let archive = TempDir::new().unwrap();
        let source = staged(&staging, b"original");
        let store = LocalArtifactStore::new(archive.path());

        let meta = store.store(&source, "ADA", Utc::now(), "job").await.unwrap();
        std::fs::write(&meta.location, b"tampered").unwrap();
        assert!(!store.verify(&meta).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_source_leaves_no_file() {
        let archive = TempDir::new().unwrap();
        let store = LocalArtifactStore::new(archive.path());
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();

        let result = store
            .store(Path::new("/nonexistent/capture.warc"), "DOT", at, "job")
            .await;
        assert!(result.is_err());
        assert!(!archive
            .path()
            .join("2024/01/02/DOT_20240102_030405_job.warc")
            .exists());
    }
}
