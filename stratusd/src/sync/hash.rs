use std::collections::HashMap;
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use super::paths::file_mtime_unix;

const READ_BUF_SIZE: usize = 64 * 1024;

pub async fn sha256_hex(path: &Path) -> io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(to_hex(&hasher.finalize()))
}

pub(crate) fn to_hex(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[derive(Debug, Clone)]
struct CachedHash {
    size: u64,
    mtime: i64,
    hex: String,
}

/// Memoizes file digests keyed by (size, mtime) so one reconciliation pass
/// hashes each file at most once. Entries invalidate themselves when the file
/// changes.
#[derive(Default)]
pub struct HashCache {
    inner: Mutex<HashMap<PathBuf, CachedHash>>,
}

impl HashCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, path: &Path) -> io::Result<String> {
        let metadata = tokio::fs::metadata(path).await?;
        let size = metadata.len();
        let mtime = file_mtime_unix(&metadata)?;
        {
            let cache = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = cache.get(path)
                && entry.size == size
                && entry.mtime == mtime
            {
                return Ok(entry.hex.clone());
            }
        }
        let hex = sha256_hex(path).await?;
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf(), CachedHash { size, mtime, hex: hex.clone() });
        Ok(hex)
    }

    /// Drops cached digests for `path` and anything under it. Deletion and
    /// rename sites call this; the (size, mtime) guard alone cannot tell a
    /// replaced file from an unchanged one.
    pub fn forget(&self, path: &Path) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|cached, _| !cached.starts_with(path));
    }

    /// True when the file's digest equals `expected` (case-insensitive hex).
    /// `None` never matches.
    pub async fn matches(&self, path: &Path, expected: Option<&str>) -> io::Result<bool> {
        let Some(expected) = expected else {
            return Ok(false);
        };
        Ok(self.get(path).await? == expected.to_ascii_lowercase())
    }
}
