use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use cycpep_core::{is_atomic_temp_file_name, lock_unpoisoned, write_text_atomic};

use crate::error::{JobError, JobsResult};
use crate::record::JobRecord;

const JOB_METADATA_FILE: &str = "metadata.json";
const JOB_LOG_FILE: &str = "job.log";
const JOB_WORK_DIR: &str = "work";
const JOB_ID_MAX_CHARS: usize = 64;

/// Durable, crash-safe mapping from job id to [`JobRecord`].
///
/// Every job owns one directory under the store root:
///
/// ```text
/// <root>/<job_id>/metadata.json   record, replaced atomically on every write
/// <root>/<job_id>/job.log         append-only combined stdout/stderr
/// <root>/<job_id>/work/           working directory of the job process
/// ```
///
/// Records are always read from disk, so a freshly opened store sees exactly
/// what a previous process persisted. Updates to one job id are serialized by
/// a per-key lock; unrelated jobs never share a lock.
#[derive(Debug)]
pub struct JobStore {
    root: PathBuf,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl JobStore {
    /// Opens (creating if needed) the store rooted at `root`.
    ///
    /// A relative root is resolved against the current directory so persisted
    /// log and work paths stay valid for later processes.
    pub fn open(root: impl Into<PathBuf>) -> JobsResult<Self> {
        let mut root = root.into();
        if root.is_relative() {
            let cwd = std::env::current_dir().map_err(|source| JobError::StoreUnavailable {
                path: root.clone(),
                source,
            })?;
            root = cwd.join(root);
        }
        std::fs::create_dir_all(&root).map_err(|source| JobError::StoreUnavailable {
            path: root.clone(),
            source,
        })?;
        Ok(Self {
            root,
            key_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id)
    }

    pub fn metadata_path(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join(JOB_METADATA_FILE)
    }

    pub fn log_path(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join(JOB_LOG_FILE)
    }

    pub fn work_dir(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join(JOB_WORK_DIR)
    }

    /// Lays out the job directory and persists `record`.
    ///
    /// The job directory is claimed with an exclusive `create_dir`, so a
    /// duplicate id fails with [`JobError::Conflict`] even across processes.
    /// The work directory and empty log are created before the metadata file,
    /// which means a listed record always has both.
    pub fn create(&self, record: &JobRecord) -> JobsResult<()> {
        let job_id = record.job_id();
        validate_job_id(job_id)?;
        self.with_key_lock(job_id, || self.create_locked(record))
    }

    fn create_locked(&self, record: &JobRecord) -> JobsResult<()> {
        let job_id = record.job_id();
        let job_dir = self.job_dir(job_id);
        match std::fs::create_dir(&job_dir) {
            Ok(()) => {}
            Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                return Err(JobError::Conflict {
                    job_id: job_id.to_string(),
                });
            }
            Err(source) => return Err(JobError::persistence(job_id, job_dir, source)),
        }

        if let Err(error) = self.populate_job_dir(record) {
            let _ = std::fs::remove_dir_all(&job_dir);
            return Err(error);
        }
        tracing::debug!(job_id, path = %job_dir.display(), "job record created");
        Ok(())
    }

    /// Applies `mutate` to the current record and persists the result atomically.
    ///
    /// Nothing is written when `mutate` fails; its error is returned as-is.
    pub fn update<F>(&self, job_id: &str, mutate: F) -> JobsResult<JobRecord>
    where
        F: FnOnce(&mut JobRecord) -> JobsResult<()>,
    {
        validate_job_id(job_id).map_err(|_| JobError::NotFound {
            job_id: job_id.to_string(),
        })?;
        self.with_key_lock(job_id, || {
            let mut record = self.read_unlocked(job_id)?;
            mutate(&mut record)?;
            self.write_record(&record)?;
            Ok(record)
        })
    }

    /// Returns the current record for `job_id`.
    pub fn read(&self, job_id: &str) -> JobsResult<JobRecord> {
        if validate_job_id(job_id).is_err() {
            return Err(JobError::NotFound {
                job_id: job_id.to_string(),
            });
        }
        self.read_unlocked(job_id)
    }

    /// Returns every persisted record, in directory-name order.
    ///
    /// Directories without a metadata file (a create in progress) and
    /// unreadable records are skipped; the latter are reported through
    /// tracing so one damaged job cannot hide the rest.
    pub fn list(&self) -> JobsResult<Vec<JobRecord>> {
        let entries =
            std::fs::read_dir(&self.root).map_err(|source| JobError::StoreUnavailable {
                path: self.root.clone(),
                source,
            })?;
        let mut job_ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| JobError::StoreUnavailable {
                path: self.root.clone(),
                source,
            })?;
            let Some(job_id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if is_atomic_temp_file_name(&job_id) || !entry.path().is_dir() {
                continue;
            }
            if validate_job_id(&job_id).is_ok() {
                job_ids.push(job_id);
            }
        }
        job_ids.sort();

        let mut records = Vec::with_capacity(job_ids.len());
        for job_id in job_ids {
            match self.read_unlocked(&job_id) {
                Ok(record) => records.push(record),
                Err(JobError::NotFound { .. }) => continue,
                Err(error) => {
                    tracing::warn!(job_id = %job_id, %error, "skipping unreadable job record");
                }
            }
        }
        Ok(records)
    }

    fn populate_job_dir(&self, record: &JobRecord) -> JobsResult<()> {
        let job_id = record.job_id();
        let work_dir = self.work_dir(job_id);
        std::fs::create_dir_all(&work_dir)
            .map_err(|source| JobError::persistence(job_id, &work_dir, source))?;
        let log_path = self.log_path(job_id);
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|source| JobError::persistence(job_id, &log_path, source))?;
        self.write_record(record)
    }

    fn write_record(&self, record: &JobRecord) -> JobsResult<()> {
        let job_id = record.job_id();
        let path = self.metadata_path(job_id);
        let mut payload = serde_json::to_string_pretty(record).map_err(|error| {
            JobError::persistence(job_id, &path, std::io::Error::other(error))
        })?;
        payload.push('\n');
        write_text_atomic(&path, &payload)
            .map_err(|source| JobError::persistence(job_id, &path, source))
    }

    fn read_unlocked(&self, job_id: &str) -> JobsResult<JobRecord> {
        let path = self.metadata_path(job_id);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Err(JobError::NotFound {
                    job_id: job_id.to_string(),
                });
            }
            Err(source) => return Err(JobError::persistence(job_id, path, source)),
        };
        let record = serde_json::from_str::<JobRecord>(&raw).map_err(|error| {
            JobError::CorruptRecord {
                job_id: job_id.to_string(),
                path: path.clone(),
                reason: error.to_string(),
            }
        })?;
        if record.job_id() != job_id {
            return Err(JobError::CorruptRecord {
                job_id: job_id.to_string(),
                path,
                reason: format!("record belongs to job '{}'", record.job_id()),
            });
        }
        record.validate().map_err(|reason| JobError::CorruptRecord {
            job_id: job_id.to_string(),
            path,
            reason,
        })?;
        Ok(record)
    }

    /// Runs `locked` while holding the lock for `job_id`.
    ///
    /// The lock entry is dropped again once no other caller holds or waits
    /// on it, so the table only tracks keys with writes in progress.
    fn with_key_lock<T>(&self, job_id: &str, locked: impl FnOnce() -> T) -> T {
        let lock = lock_unpoisoned(&self.key_locks)
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let outcome = {
            let _guard = lock_unpoisoned(&lock);
            locked()
        };
        let mut locks = lock_unpoisoned(&self.key_locks);
        // One reference in the table plus ours.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(job_id);
        }
        outcome
    }

    #[cfg(test)]
    fn tracked_key_locks(&self) -> usize {
        lock_unpoisoned(&self.key_locks).len()
    }
}

/// Job ids double as directory names; only short ASCII tokens are accepted.
fn validate_job_id(job_id: &str) -> JobsResult<()> {
    let valid = !job_id.is_empty()
        && job_id.len() <= JOB_ID_MAX_CHARS
        && job_id
            .chars()
            .all(|value| value.is_ascii_alphanumeric() || matches!(value, '-' | '_'));
    if valid {
        return Ok(());
    }
    Err(JobError::InvalidRequest {
        reason: format!(
            "job id '{job_id}' must be 1-{JOB_ID_MAX_CHARS} ASCII letters, digits, '-' or '_'"
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::JobStore;
    use crate::error::JobError;
    use crate::record::{JobCommand, JobRecord, JobResult, JobStatus};
    use std::sync::Arc;

    fn pending_record(store: &JobStore, job_id: &str, submitted_at: u64) -> JobRecord {
        JobRecord::new_pending(
            job_id,
            format!("job_{job_id}"),
            JobCommand::new("echo", vec!["hello".to_string()]),
            submitted_at,
            store.log_path(job_id),
            store.work_dir(job_id),
        )
    }

    #[test]
    fn functional_create_lays_out_job_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JobStore::open(temp.path().join("jobs")).expect("store");
        let record = pending_record(&store, "job-a", 10);
        store.create(&record).expect("create");

        assert!(store.metadata_path("job-a").is_file());
        assert!(store.log_path("job-a").is_file());
        assert!(store.work_dir("job-a").is_dir());
        assert_eq!(store.read("job-a").expect("read"), record);
    }

    #[test]
    fn regression_create_rejects_duplicate_job_id_with_conflict() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JobStore::open(temp.path()).expect("store");
        let record = pending_record(&store, "dup", 10);
        store.create(&record).expect("first create");
        let error = store.create(&record).expect_err("second create");
        assert!(matches!(error, JobError::Conflict { ref job_id } if job_id == "dup"));
    }

    #[test]
    fn unit_read_and_update_unknown_job_fail_with_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JobStore::open(temp.path()).expect("store");
        assert!(matches!(store.read("missing"), Err(JobError::NotFound { .. })));
        assert!(matches!(
            store.update("missing", |_| Ok(())),
            Err(JobError::NotFound { .. })
        ));
        assert!(matches!(
            store.read("../escape"),
            Err(JobError::NotFound { .. })
        ));
    }

    #[test]
    fn functional_failed_mutator_leaves_record_untouched() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JobStore::open(temp.path()).expect("store");
        store.create(&pending_record(&store, "job-b", 10)).expect("create");
        store
            .update("job-b", |record| {
                record.mark_running(20)?;
                record.mark_completed(30, JobResult::empty())
            })
            .expect("complete");

        let error = store
            .update("job-b", |record| record.mark_cancelled(40))
            .expect_err("terminal");
        assert!(matches!(error, JobError::InvalidState { .. }));
        let persisted = store.read("job-b").expect("read");
        assert_eq!(persisted.status(), JobStatus::Completed);
        assert_eq!(persisted.completed_at(), Some(30));
    }

    #[test]
    fn integration_reopened_store_reproduces_records() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("jobs");
        let expected = {
            let store = JobStore::open(&root).expect("store");
            store.create(&pending_record(&store, "job-1", 10)).expect("create 1");
            store.create(&pending_record(&store, "job-2", 11)).expect("create 2");
            store
                .update("job-2", |record| {
                    record.mark_running(12)?;
                    record.mark_failed(13, "boom")
                })
                .expect("fail job-2");
            store.list().expect("list")
        };

        let reopened = JobStore::open(&root).expect("reopen");
        assert_eq!(reopened.list().expect("list"), expected);
        assert_eq!(expected.len(), 2);
    }

    #[test]
    fn regression_list_skips_temp_files_incomplete_dirs_and_corrupt_records() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JobStore::open(temp.path()).expect("store");
        store.create(&pending_record(&store, "good", 10)).expect("create");
        std::fs::create_dir_all(store.job_dir("half-created")).expect("bare dir");
        std::fs::create_dir_all(store.job_dir("corrupt")).expect("corrupt dir");
        std::fs::write(store.metadata_path("corrupt"), "{\"job_id\":").expect("write");
        std::fs::write(temp.path().join(".stray.tmp-1-1"), "partial").expect("write temp");

        let listed = store.list().expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].job_id(), "good");
        assert!(matches!(
            store.read("corrupt"),
            Err(JobError::CorruptRecord { .. })
        ));
    }

    #[test]
    fn integration_concurrent_updates_to_one_job_are_not_lost() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(JobStore::open(temp.path()).expect("store"));
        store.create(&pending_record(&store, "contended", 10)).expect("create");

        let handles = (0..8)
            .map(|index| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .update("contended", |record| {
                            if record.status() == JobStatus::Pending {
                                record.mark_running(20 + index)?;
                            }
                            record.mark_cancelled(40)
                        })
                        .is_ok()
                })
            })
            .collect::<Vec<_>>();
        let winners = handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1, "exactly one cancel should win the transition");
        assert_eq!(
            store.read("contended").expect("read").status(),
            JobStatus::Cancelled
        );
        assert_eq!(store.tracked_key_locks(), 0);
    }

    #[test]
    fn regression_key_locks_are_released_after_each_write() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JobStore::open(temp.path()).expect("store");
        for index in 0..50 {
            let job_id = format!("job-{index}");
            store
                .create(&pending_record(&store, &job_id, 10))
                .expect("create");
            store
                .update(&job_id, |record| record.mark_cancelled(20))
                .expect("cancel");
            let _ = store.update(&job_id, |record| record.mark_cancelled(30));
        }
        let _ = store.create(&pending_record(&store, "job-0", 10));
        assert_eq!(store.tracked_key_locks(), 0);
        assert_eq!(store.list().expect("list").len(), 50);
    }
}
