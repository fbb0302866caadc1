use std::io;
use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use reqwest::header::CONTENT_RANGE;
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use stratus_core::Resource;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::debug;
use url::Url;

use super::filter::PathFilter;
use super::hash::to_hex;

/// Chunk size for session uploads, also the cutoff below which a file goes
/// up as a single PUT.
pub(crate) const UPLOAD_CHUNK_SIZE: u64 = 10 << 20;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("download integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
}

/// Moves file bytes over pre-authorized transfer links. Metadata and retry
/// policy live in [`super::remote::Remote`]; this client only streams bodies.
#[derive(Clone)]
pub struct TransferClient {
    http: Client,
}

impl TransferClient {
    pub fn new() -> Self {
        Self { http: Client::new() }
    }

    /// Streams `href` into a hidden partial file next to `target`, verifies
    /// the digest when one is expected, then renames into place. Returns the
    /// number of bytes written.
    pub async fn download_to_path(
        &self,
        href: &str,
        target: &Path,
        expected_sha256: Option<&str>,
    ) -> Result<u64, TransferError> {
        let url = Url::parse(href)?;
        let response = self.http.get(url).send().await?.error_for_status()?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(target);
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut stream = response.bytes_stream();
        let mut hasher = expected_sha256.map(|_| Sha256::new());
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&chunk);
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let (Some(expected), Some(hasher)) = (expected_sha256, hasher) {
            let actual = to_hex(&hasher.finalize());
            if actual != expected.to_ascii_lowercase() {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(TransferError::IntegrityMismatch {
                    expected: expected.to_ascii_lowercase(),
                    actual,
                });
            }
        }

        tokio::fs::rename(partial, target).await?;
        Ok(written)
    }

    /// Single-request upload for small files.
    pub async fn upload_from_path(&self, href: &str, source: &Path) -> Result<(), TransferError> {
        let url = Url::parse(href)?;
        let file = tokio::fs::File::open(source).await?;
        let stream = ReaderStream::new(file);
        let body = reqwest::Body::wrap_stream(stream);
        self.http
            .put(url)
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Session upload for large files: sequential `Content-Range` chunks
    /// against the session link. Intermediate chunks answer 202; the final
    /// one returns the created item's metadata.
    pub async fn upload_chunked(
        &self,
        href: &str,
        source: &Path,
        total: u64,
        chunk_size: u64,
    ) -> Result<Option<Resource>, TransferError> {
        let url = Url::parse(href)?;
        let chunk_size = chunk_size.max(1);
        let parts = total.div_ceil(chunk_size);
        let mut file = tokio::fs::File::open(source).await?;
        let mut offset = 0u64;
        let mut part = 0u64;
        let mut created = None;

        while offset < total {
            let len = chunk_size.min(total - offset) as usize;
            let mut buf = vec![0u8; len];
            file.read_exact(&mut buf).await?;
            let end = offset + len as u64 - 1;
            part += 1;
            debug!(part, parts, "uploading chunk");
            let response = self
                .http
                .put(url.clone())
                .header(CONTENT_RANGE, format!("bytes {offset}-{end}/{total}"))
                .body(buf)
                .send()
                .await?
                .error_for_status()?;
            if response.status() != StatusCode::ACCEPTED {
                created = Some(response.json::<Resource>().await?);
            }
            offset += len as u64;
        }
        Ok(created)
    }
}

impl Default for TransferClient {
    fn default() -> Self {
        Self::new()
    }
}

fn partial_path(target: &Path) -> PathBuf {
    match target.file_name() {
        Some(name) => target.with_file_name(PathFilter::temp_name(&name.to_string_lossy())),
        None => target.with_extension("stratuspart"),
    }
}
