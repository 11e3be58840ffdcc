//! Downloading images into the cache.
//!
//! Bytes are staged in a hidden temp file inside the cache root and fed to
//! SHA-256 and SHA-512 hashers as they arrive. The file only takes its final
//! name once both digests match the catalog.

use std::path::PathBuf;

use tempfile::TempPath;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::cache::{ImageCache, VerifiedPath};
use super::hasher::{HashAlgorithm, Hasher, hasher_for};
use super::models::Image;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Failed to fetch {url}: {source}")]
    Http {
        url: String,
        source: reqwest::Error,
    },
    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{algorithm} mismatch for {name}: expected {expected}, got {actual}")]
    Integrity {
        name: String,
        algorithm: HashAlgorithm,
        expected: String,
        actual: String,
    },
}

/// Writes a download to a staging file while hashing it.
pub struct VerifyingWriter {
    image: Image,
    destination: PathBuf,
    file: tokio::fs::File,
    temp_path: TempPath,
    sha256: Box<dyn Hasher>,
    sha512: Box<dyn Hasher>,
    bytes_written: u64,
}

impl VerifyingWriter {
    /// Stage a new download of `image` inside the cache root.
    pub async fn create(cache: &ImageCache, image: &Image) -> Result<Self, DownloadError> {
        let root = cache.root().to_path_buf();
        let io_error = |source| DownloadError::Io {
            path: root.clone(),
            source,
        };

        tokio::fs::create_dir_all(&root).await.map_err(io_error)?;

        let staging = tempfile::Builder::new()
            .prefix(".download-")
            .tempfile_in(&root)
            .map_err(io_error)?;
        let (file, temp_path) = staging.into_parts();

        Ok(Self {
            image: image.clone(),
            destination: cache.path_for(image),
            file: tokio::fs::File::from_std(file),
            temp_path,
            sha256: hasher_for(HashAlgorithm::Sha256),
            sha512: hasher_for(HashAlgorithm::Sha512),
            bytes_written: 0,
        })
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), DownloadError> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|source| DownloadError::Io {
                path: self.temp_path.to_path_buf(),
                source,
            })?;
        self.sha256.update(chunk);
        self.sha512.update(chunk);
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Check both digests and move the file into place.
    ///
    /// On mismatch the staging file is deleted and nothing lands in the cache.
    pub async fn finish(mut self) -> Result<VerifiedPath, DownloadError> {
        let staging = self.temp_path.to_path_buf();
        let io_error = |source| DownloadError::Io {
            path: staging.clone(),
            source,
        };

        self.file.flush().await.map_err(io_error)?;
        self.file.sync_all().await.map_err(io_error)?;
        drop(self.file);

        for (algorithm, hasher) in [
            (HashAlgorithm::Sha256, self.sha256),
            (HashAlgorithm::Sha512, self.sha512),
        ] {
            let actual = hasher.finalize();
            let expected = self.image.digest(algorithm);
            if !actual.eq_ignore_ascii_case(expected) {
                warn!(image = %self.image.name, %algorithm, "Downloaded image failed verification");
                return Err(DownloadError::Integrity {
                    name: self.image.name.clone(),
                    algorithm,
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        self.temp_path
            .persist(&self.destination)
            .map_err(|e| DownloadError::Io {
                path: self.destination.clone(),
                source: e.error,
            })?;

        Ok(VerifiedPath::new(self.destination))
    }
}

/// Fetch `image.url` into the cache.
///
/// `on_progress` receives the bytes received so far and the total when the
/// server reports one.
pub async fn download_image<F>(
    cache: &ImageCache,
    image: &Image,
    mut on_progress: F,
) -> Result<VerifiedPath, DownloadError>
where
    F: FnMut(u64, Option<u64>),
{
    let http_error = |source| DownloadError::Http {
        url: image.url.clone(),
        source,
    };

    let _guard = cache.lock_root().await;
    info!(image = %image.name, url = %image.url, "Downloading image");

    let mut response = reqwest::get(&image.url)
        .await
        .and_then(|r| r.error_for_status())
        .map_err(http_error)?;
    let total = response.content_length();

    let mut writer = VerifyingWriter::create(cache, image).await?;
    while let Some(chunk) = response.chunk().await.map_err(http_error)? {
        writer.write_chunk(&chunk).await?;
        on_progress(writer.bytes_written(), total);
    }

    debug!(image = %image.name, bytes = writer.bytes_written(), "Download complete, verifying");
    let path = writer.finish().await?;
    info!(image = %image.name, path = %path, "Image downloaded and verified");
    Ok(path)
}
