use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("relative path contains unsupported component")]
    UnsupportedComponent,
    #[error("path is outside the sync root")]
    OutsideRoot,
}

/// Drive-relative paths are POSIX-like: `""` for the drive root, `"/Docs/A.txt"`
/// for children. Maps one onto the local sync root.
pub fn local_path_for(root: &Path, rel_path: &str) -> Result<PathBuf, PathError> {
    let mut out = root.to_path_buf();
    for component in Path::new(rel_path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir => continue,
            Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}

/// The remote API form of a relative path: the drive root is `/`.
pub fn drive_path(rel_path: &str) -> &str {
    if rel_path.is_empty() { "/" } else { rel_path }
}

pub fn child_rel(parent_rel: &str, name: &str) -> String {
    format!("{parent_rel}/{name}")
}

/// Splits `"/Docs/A.txt"` into `("/Docs", "A.txt")`. The drive root has no name.
pub fn split_rel(rel_path: &str) -> (&str, &str) {
    match rel_path.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", rel_path),
    }
}

/// Maps a local absolute path back to its drive-relative form. `None` when the
/// path lies outside the root or is not valid UTF-8.
pub fn rel_from_local(root: &Path, path: &Path) -> Option<String> {
    let suffix = path.strip_prefix(root).ok()?;
    let mut rel = String::new();
    for component in suffix.components() {
        match component {
            Component::Normal(part) => {
                rel.push('/');
                rel.push_str(part.to_str()?);
            }
            Component::CurDir => continue,
            _ => return None,
        }
    }
    Some(rel)
}

pub fn system_time_unix(value: SystemTime) -> i64 {
    match value.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs() as i64,
        Err(err) => -(err.duration().as_secs() as i64),
    }
}

pub fn unix_to_system_time(unix: i64) -> SystemTime {
    if unix >= 0 {
        SystemTime::UNIX_EPOCH + Duration::from_secs(unix as u64)
    } else {
        SystemTime::UNIX_EPOCH - Duration::from_secs(unix.unsigned_abs())
    }
}

pub fn file_mtime_unix(metadata: &std::fs::Metadata) -> std::io::Result<i64> {
    Ok(system_time_unix(metadata.modified()?))
}

pub fn set_file_mtime(path: &Path, unix: i64) -> std::io::Result<()> {
    let file = std::fs::File::options().write(true).open(path)?;
    file.set_modified(unix_to_system_time(unix))
}
