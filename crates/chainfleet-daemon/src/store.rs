//! Durable submit store.
//!
//! Submit jobs that cannot run yet (an open is pending, or a drained retry
//! failed) are persisted to a single JSON file so they survive restarts.
//! Every operation is serialized by one lock, and every write goes through
//! [`fs_safe::atomic_write_json_capped`], so readers never see a torn list.
//!
//! An empty backlog is represented by the file's absence. Writes are capped
//! at the same size reads accept; a backlog that would grow past it is
//! refused with [`StoreError::Full`] and the file on disk stays loadable.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chainfleet_core::restart::BackoffConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::fs_safe::{self, DEFAULT_MAX_FILE_SIZE, FsSafeError};

/// File name of the backlog inside the state directory.
pub const STORE_FILE: &str = "submit_requests.json";

/// A deferred submit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJob {
    /// Stable record id used to reconcile drains with concurrent appends.
    pub id: Uuid,
    /// Target chain.
    pub chain_id: String,
    /// Target application.
    pub app_id: String,
    /// Opaque match result.
    pub payload: serde_json::Value,
    /// Failed drain attempts so far.
    #[serde(default)]
    pub attempts: u32,
    /// Error of the most recent failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Earliest time the next drain may retry this record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_eligible_at: Option<DateTime<Utc>>,
    /// When the job was first accepted.
    pub created_at: DateTime<Utc>,
}

impl SubmitJob {
    /// New job with a fresh id.
    #[must_use]
    pub fn new(chain_id: impl Into<String>, app_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            chain_id: chain_id.into(),
            app_id: app_id.into(),
            payload,
            attempts: 0,
            last_error: None,
            next_eligible_at: None,
            created_at: Utc::now(),
        }
    }

    /// Record a failed drain attempt and push the next eligibility out.
    pub fn record_failure(&mut self, error: impl Into<String>, backoff: &BackoffConfig, now: DateTime<Utc>) {
        self.attempts = self.attempts.saturating_add(1);
        self.last_error = Some(error.into());
        let delay = backoff.delay_after_failures(self.attempts.saturating_sub(1));
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        self.next_eligible_at = now.checked_add_signed(delay);
    }

    /// Whether a drain at `now` may retry this record.
    #[must_use]
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.next_eligible_at.is_none_or(|at| at <= now)
    }
}

/// Store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("durable store I/O failed: {0}")]
    Fs(#[from] FsSafeError),

    /// The backlog would exceed its size cap.
    #[error("durable store is full: backlog of {size} bytes exceeds {max} bytes")]
    Full {
        /// Serialized backlog size.
        size: u64,
        /// Cap in bytes.
        max: u64,
    },
}

impl StoreError {
    /// Whether the write was refused for size.
    #[must_use]
    pub const fn is_full(&self) -> bool {
        matches!(self, Self::Full { .. })
    }
}

/// File-backed backlog of deferred submits.
#[derive(Debug)]
pub struct DurableSubmitStore {
    path: PathBuf,
    max_bytes: u64,
    lock: Mutex<()>,
}

impl DurableSubmitStore {
    /// Store backed by `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_bytes: DEFAULT_MAX_FILE_SIZE,
            lock: Mutex::new(()),
        }
    }

    /// Cap the backlog file at `max_bytes` for both reads and writes.
    #[must_use]
    pub const fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Store at [`STORE_FILE`] inside `state_dir`.
    #[must_use]
    pub fn in_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join(STORE_FILE))
    }

    /// Backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one job.
    pub fn append(&self, job: SubmitJob) -> Result<(), StoreError> {
        let _guard = self.guard();
        let mut jobs = self.read_locked()?;
        debug!(job_id = %job.id, chain_id = %job.chain_id, backlog = jobs.len() + 1, "Persisting submit");
        jobs.push(job);
        self.write_locked(&jobs)
    }

    /// Every persisted job, oldest first.
    ///
    /// A missing file is an empty backlog. So is a corrupt one: it is moved
    /// aside and logged.
    pub fn load_all(&self) -> Result<Vec<SubmitJob>, StoreError> {
        let _guard = self.guard();
        self.read_locked()
    }

    /// Replace the whole backlog. An empty list deletes the file.
    pub fn replace_all(&self, jobs: &[SubmitJob]) -> Result<(), StoreError> {
        let _guard = self.guard();
        self.write_locked(jobs)
    }

    /// Read-modify-write under the store lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut Vec<SubmitJob>) -> R) -> Result<R, StoreError> {
        let _guard = self.guard();
        let mut jobs = self.read_locked()?;
        let before = jobs.clone();
        let result = f(&mut jobs);
        if jobs != before {
            self.write_locked(&jobs)?;
        }
        Ok(result)
    }

    /// Number of persisted jobs.
    pub fn len(&self) -> Result<usize, StoreError> {
        self.load_all().map(|jobs| jobs.len())
    }

    /// Whether the backlog is empty.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        self.len().map(|n| n == 0)
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_locked(&self) -> Result<Vec<SubmitJob>, StoreError> {
        match fs_safe::bounded_read_json(&self.path, self.max_bytes) {
            Ok(jobs) => Ok(jobs),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) if e.is_corrupt() || e.is_too_large() => {
                error!(path = %self.path.display(), error = %e, "Durable submit store is corrupt, treating as empty");
                self.quarantine();
                Ok(Vec::new())
            },
            Err(e) => Err(e.into()),
        }
    }

    fn write_locked(&self, jobs: &[SubmitJob]) -> Result<(), StoreError> {
        if jobs.is_empty() {
            fs_safe::remove_if_exists(&self.path)?;
        } else {
            fs_safe::atomic_write_json_capped(&self.path, &jobs, self.max_bytes).map_err(|e| match e {
                FsSafeError::FileTooLarge { size, max } => StoreError::Full { size, max },
                other => StoreError::Fs(other),
            })?;
        }
        Ok(())
    }

    /// Move an unreadable file aside so the next append does not overwrite the
    /// evidence.
    fn quarantine(&self) {
        let mut aside = self.path.clone().into_os_string();
        aside.push(format!(".corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S%.3f")));
        if let Err(e) = std::fs::rename(&self.path, &aside) {
            warn!(path = %self.path.display(), error = %e, "Failed to move corrupt store aside");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    fn job(chain: &str) -> SubmitJob {
        SubmitJob::new(chain, "app", json!({"matchId": chain}))
    }

    #[test]
    fn test_append_and_load_preserve_order() {
        let dir = TempDir::new().unwrap();
        let store = DurableSubmitStore::in_dir(dir.path());

        store.append(job("a")).unwrap();
        store.append(job("b")).unwrap();

        let chains: Vec<_> = store
            .load_all()
            .unwrap()
            .into_iter()
            .map(|j| j.chain_id)
            .collect();
        assert_eq!(chains, vec!["a", "b"]);
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = DurableSubmitStore::in_dir(dir.path());
        assert!(store.load_all().unwrap().is_empty());
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_empty_replace_deletes_file() {
        let dir = TempDir::new().unwrap();
        let store = DurableSubmitStore::in_dir(dir.path());

        store.append(job("a")).unwrap();
        assert!(store.path().exists());

        store.replace_all(&[]).unwrap();
        assert!(!store.path().exists());
    }

    #[test]
    fn test_corrupt_file_is_empty_and_moved_aside() {
        let dir = TempDir::new().unwrap();
        let store = DurableSubmitStore::in_dir(dir.path());
        std::fs::write(store.path(), b"[{\"id\": ").unwrap();

        assert!(store.load_all().unwrap().is_empty());
        assert!(!store.path().exists());

        let quarantined = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .any(|e| e.file_name().to_string_lossy().contains(".corrupt-"));
        assert!(quarantined);

        // The store keeps working afterwards.
        store.append(job("fresh")).unwrap();
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_oversized_append_is_refused_and_backlog_stays_usable() {
        let dir = TempDir::new().unwrap();
        let store = DurableSubmitStore::in_dir(dir.path()).with_max_bytes(2048);
        store.append(job("a")).unwrap();

        let huge = SubmitJob::new("big", "app", json!({"blob": "x".repeat(4096)}));
        let err = store.append(huge).unwrap_err();
        assert!(err.is_full(), "{err}");

        // Nothing was written, and the prior record still loads.
        let jobs = store.load_all().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].chain_id, "a");

        store.append(job("b")).unwrap();
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn test_file_over_cap_is_moved_aside() {
        let dir = TempDir::new().unwrap();
        let store = DurableSubmitStore::in_dir(dir.path()).with_max_bytes(1024);
        std::fs::write(store.path(), vec![b' '; 2048]).unwrap();

        assert!(store.load_all().unwrap().is_empty());
        assert!(!store.path().exists());
        store.append(job("a")).unwrap();
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_interrupted_write_leaves_prior_backlog_loadable() {
        use std::io::Write as _;

        let dir = TempDir::new().unwrap();
        let store = DurableSubmitStore::in_dir(dir.path());
        store.append(job("a")).unwrap();
        store.append(job("b")).unwrap();

        // A writer that died mid-write leaves a partial temp file next to
        // the backlog; the backlog itself was never replaced.
        let mut stray = tempfile::Builder::new()
            .prefix(".tmp")
            .tempfile_in(dir.path())
            .unwrap();
        stray.write_all(b"[{\"id\": \"0000").unwrap();
        let (_file, _stray_path) = stray.keep().unwrap();

        let chains: Vec<_> = store
            .load_all()
            .unwrap()
            .into_iter()
            .map(|j| j.chain_id)
            .collect();
        assert_eq!(chains, vec!["a", "b"]);

        store.append(job("c")).unwrap();
        assert_eq!(store.len().unwrap(), 3);
    }

    #[test]
    fn test_update_removes_by_id() {
        let dir = TempDir::new().unwrap();
        let store = DurableSubmitStore::in_dir(dir.path());
        let first = job("a");
        let first_id = first.id;
        store.append(first).unwrap();
        store.append(job("b")).unwrap();

        let removed = store
            .update(|jobs| {
                let before = jobs.len();
                jobs.retain(|j| j.id != first_id);
                before - jobs.len()
            })
            .unwrap();

        assert_eq!(removed, 1);
        let left = store.load_all().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].chain_id, "b");
    }

    #[test]
    fn test_concurrent_appends_are_not_lost() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(DurableSubmitStore::in_dir(dir.path()));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for j in 0..5 {
                        store.append(job(&format!("c{i}-{j}"))).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len().unwrap(), 40);
    }

    #[test]
    fn test_record_failure_defers_eligibility() {
        let backoff = BackoffConfig::Fixed {
            delay: Duration::from_secs(10),
        };
        let now = Utc::now();
        let mut j = job("a");
        assert!(j.is_eligible(now));

        j.record_failure("503", &backoff, now);
        assert_eq!(j.attempts, 1);
        assert_eq!(j.last_error.as_deref(), Some("503"));
        assert!(!j.is_eligible(now));
        assert!(j.is_eligible(now + chrono::Duration::seconds(10)));
    }

    #[test]
    fn test_backlog_file_uses_camel_case() {
        let dir = TempDir::new().unwrap();
        let store = DurableSubmitStore::in_dir(dir.path());
        store.append(job("a")).unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(raw[0]["chainId"], "a");
        assert_eq!(raw[0]["appId"], "app");
        assert!(raw[0].get("createdAt").is_some());
    }
}
