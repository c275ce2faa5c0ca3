//! Crash-safe file primitives for daemon state.
//!
//! Everything the daemon persists (the durable submit backlog, orchestrator
//! state, the pid file) goes through these helpers:
//!
//! - [`atomic_write`] / [`atomic_write_json`]: temp file in the same
//!   directory, fsync, rename over the target, fsync the directory. A crash
//!   leaves either the old file or the new one, never a torn one.
//! - [`safe_open`]: refuses symlinks (`O_NOFOLLOW`) and non-regular files.
//! - [`bounded_read_json`]: size-capped read before deserializing.
//! - [`remove_if_exists`]: unlink that treats a missing file as success.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Upper bound for any state file read.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 16 * 1024 * 1024;

/// Errors from safe filesystem operations.
#[derive(Debug, thiserror::Error)]
pub enum FsSafeError {
    /// File exceeds the size cap.
    #[error("file too large: {size} bytes exceeds maximum of {max} bytes")]
    FileTooLarge {
        /// Actual size.
        size: u64,
        /// Cap.
        max: u64,
    },

    /// The path is a symlink.
    #[error("refusing to open symlink at {}", path.display())]
    SymlinkRefused {
        /// Offending path.
        path: PathBuf,
    },

    /// The path is not a regular file.
    #[error("not a regular file at {}", path.display())]
    NotRegularFile {
        /// Offending path.
        path: PathBuf,
    },

    /// The path has no parent directory to hold the temp file.
    #[error("path has no parent directory: {}", path.display())]
    NoParentDirectory {
        /// Offending path.
        path: PathBuf,
    },

    /// JSON serialization failed.
    #[error("json serialization failed: {0}")]
    SerializeFailed(#[source] serde_json::Error),

    /// JSON deserialization failed.
    #[error("json deserialization failed: {0}")]
    DeserializeFailed(#[source] serde_json::Error),

    /// I/O error.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Operation that failed.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl FsSafeError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether the file was present but could not be parsed.
    #[must_use]
    pub const fn is_corrupt(&self) -> bool {
        matches!(self, Self::DeserializeFailed(_))
    }

    /// Whether the file exceeds the size cap.
    #[must_use]
    pub const fn is_too_large(&self) -> bool {
        matches!(self, Self::FileTooLarge { .. })
    }

    /// Whether the file does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Write `data` to `path` atomically (temp + fsync + rename + dir fsync).
///
/// The parent directory is created with mode 0700 if missing.
///
/// # Errors
///
/// Returns [`FsSafeError`] if any filesystem operation fails.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), FsSafeError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        Some(_) => Path::new("."),
        None => {
            return Err(FsSafeError::NoParentDirectory {
                path: path.to_path_buf(),
            });
        },
    };
    ensure_dir(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| FsSafeError::io("create temp file", e))?;
    tmp.write_all(data)
        .map_err(|e| FsSafeError::io("write to temp file", e))?;
    tmp.flush()
        .map_err(|e| FsSafeError::io("flush temp file", e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| FsSafeError::io("fsync temp file", e))?;
    tmp.persist(path)
        .map_err(|e| FsSafeError::io("atomic rename to final path", e.error))?;

    fsync_directory(parent)
}

/// Serialize `value` as pretty JSON and [`atomic_write`] it.
///
/// # Errors
///
/// Returns [`FsSafeError::SerializeFailed`] or any error from
/// [`atomic_write`].
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), FsSafeError> {
    let json = serde_json::to_vec_pretty(value).map_err(FsSafeError::SerializeFailed)?;
    atomic_write(path, &json)
}

/// Like [`atomic_write_json`], but refuses to write more than `max_size`
/// bytes so the file stays within what [`bounded_read_json`] accepts.
///
/// # Errors
///
/// Returns [`FsSafeError::FileTooLarge`] without touching `path` when the
/// serialized value exceeds `max_size`.
pub fn atomic_write_json_capped<T: Serialize>(path: &Path, value: &T, max_size: u64) -> Result<(), FsSafeError> {
    let json = serde_json::to_vec_pretty(value).map_err(FsSafeError::SerializeFailed)?;
    let size = u64::try_from(json.len()).unwrap_or(u64::MAX);
    if size > max_size {
        return Err(FsSafeError::FileTooLarge { size, max: max_size });
    }
    atomic_write(path, &json)
}

/// Open `path` read-only, refusing symlinks and non-regular files.
///
/// # Errors
///
/// Returns [`FsSafeError::SymlinkRefused`], [`FsSafeError::NotRegularFile`]
/// or [`FsSafeError::Io`].
pub fn safe_open(path: &Path) -> Result<File, FsSafeError> {
    use std::os::unix::fs::OpenOptionsExt;

    let file = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOFOLLOW)
        .open(path)
        .map_err(|e| {
            if e.raw_os_error() == Some(libc::ELOOP) {
                FsSafeError::SymlinkRefused {
                    path: path.to_path_buf(),
                }
            } else {
                FsSafeError::io(format!("open {}", path.display()), e)
            }
        })?;

    let metadata = file
        .metadata()
        .map_err(|e| FsSafeError::io("fstat after open", e))?;
    if !metadata.is_file() {
        return Err(FsSafeError::NotRegularFile {
            path: path.to_path_buf(),
        });
    }
    Ok(file)
}

/// Read and deserialize a JSON file no larger than `max_size` bytes.
///
/// # Errors
///
/// Returns [`FsSafeError::FileTooLarge`], [`FsSafeError::DeserializeFailed`]
/// or any error from [`safe_open`].
pub fn bounded_read_json<T: DeserializeOwned>(path: &Path, max_size: u64) -> Result<T, FsSafeError> {
    let file = safe_open(path)?;
    let size = file
        .metadata()
        .map_err(|e| FsSafeError::io("fstat for size check", e))?
        .len();
    if size > max_size {
        return Err(FsSafeError::FileTooLarge {
            size,
            max: max_size,
        });
    }

    let reader = BufReader::new(file.take(max_size.saturating_add(1)));
    serde_json::from_reader(reader).map_err(FsSafeError::DeserializeFailed)
}

/// Remove `path`; a missing file is not an error.
///
/// # Errors
///
/// Returns [`FsSafeError::Io`] for any other failure.
pub fn remove_if_exists(path: &Path) -> Result<(), FsSafeError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FsSafeError::io(format!("remove {}", path.display()), e)),
    }
}

fn ensure_dir(dir: &Path) -> Result<(), FsSafeError> {
    if dir.exists() {
        return Ok(());
    }

    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .map_err(|e| FsSafeError::io("create directory with mode 0700", e))
}

fn fsync_directory(dir: &Path) -> Result<(), FsSafeError> {
    File::open(dir)
        .and_then(|dir| dir.sync_all())
        .map_err(|e| FsSafeError::io("fsync directory", e))
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs as unix_fs;

    use serde::Deserialize;
    use tempfile::TempDir;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Backlog {
        items: Vec<String>,
    }

    #[test]
    fn test_atomic_write_creates_parent_and_replaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.json");

        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
        // No temp files left behind
        let entries: Vec<_> = fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_json_roundtrip_through_bounded_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backlog.json");
        let value = Backlog {
            items: vec!["a".to_string(), "b".to_string()],
        };

        atomic_write_json(&path, &value).unwrap();
        let loaded: Backlog = bounded_read_json(&path, DEFAULT_MAX_FILE_SIZE).unwrap();
        assert_eq!(loaded, value);
    }

    #[test]
    fn test_bounded_read_rejects_large_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.json");
        fs::write(&path, vec![b' '; 2048]).unwrap();

        let err = bounded_read_json::<Backlog>(&path, 1024).unwrap_err();
        assert!(matches!(err, FsSafeError::FileTooLarge { size: 2048, max: 1024 }));
    }

    #[test]
    fn test_capped_write_refuses_oversized_value() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backlog.json");
        let small = Backlog {
            items: vec!["a".to_string()],
        };
        atomic_write_json_capped(&path, &small, 1024).unwrap();

        let big = Backlog {
            items: vec!["x".repeat(4096)],
        };
        let err = atomic_write_json_capped(&path, &big, 1024).unwrap_err();
        assert!(err.is_too_large());

        // Previous contents untouched and still readable under the same cap
        let loaded: Backlog = bounded_read_json(&path, 1024).unwrap();
        assert_eq!(loaded, small);
    }

    #[test]
    fn test_malformed_json_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("torn.json");
        fs::write(&path, b"[{\"items\": [").unwrap();

        let err = bounded_read_json::<Backlog>(&path, DEFAULT_MAX_FILE_SIZE).unwrap_err();
        assert!(err.is_corrupt());
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = bounded_read_json::<Backlog>(&dir.path().join("absent.json"), 1024).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_symlink_is_refused() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("target.json");
        let link = dir.path().join("link.json");
        fs::write(&target, b"{}").unwrap();
        unix_fs::symlink(&target, &link).unwrap();

        assert!(matches!(
            safe_open(&link),
            Err(FsSafeError::SymlinkRefused { .. })
        ));
    }

    #[test]
    fn test_directory_is_not_regular_file() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            safe_open(dir.path()),
            Err(FsSafeError::NotRegularFile { .. })
        ));
    }

    #[test]
    fn test_remove_if_exists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone.json");

        remove_if_exists(&path).unwrap();
        fs::write(&path, b"[]").unwrap();
        remove_if_exists(&path).unwrap();
        assert!(!path.exists());
    }
}
