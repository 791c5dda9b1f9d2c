use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use cycpep_core::{current_unix_timestamp_ms, lock_unpoisoned};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{JobError, JobsResult};
use crate::id::generate_job_id;
use crate::log::{read_log_tail, JobLog};
use crate::record::{JobCommand, JobRecord, JobResult, JobStatus, JobStatusFilter};
use crate::runner::{run_process, ProcessSpec, RunOutcome};
use crate::store::JobStore;

const DEFAULT_JOBS_ROOT: &str = ".cycpep/jobs";
const DEFAULT_ERROR_TAIL_LINES: usize = 20;
const DEFAULT_RESULT_FILE_NAME: &str = "result.json";
const MAX_JOB_ID_ATTEMPTS: usize = 8;
const INTERRUPTED_BY_RESTART_MESSAGE: &str = "job interrupted by manager restart";

/// Configuration for [`JobManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobManagerConfig {
    pub jobs_root: PathBuf,
    /// Trailing output lines quoted in the error of a failed job.
    pub error_tail_lines: usize,
    /// Name of the optional result file a job writes into its work directory.
    pub result_file_name: String,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            jobs_root: PathBuf::from(DEFAULT_JOBS_ROOT),
            error_tail_lines: DEFAULT_ERROR_TAIL_LINES,
            result_file_name: DEFAULT_RESULT_FILE_NAME.to_string(),
        }
    }
}

impl JobManagerConfig {
    pub fn with_jobs_root(jobs_root: impl Into<PathBuf>) -> Self {
        Self {
            jobs_root: jobs_root.into(),
            ..Self::default()
        }
    }
}

/// A request to run one external command as a background job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub executable: String,
    pub args: Vec<String>,
    /// Optional label; `job-<job_id>` when absent or blank.
    pub job_name: Option<String>,
}

impl SubmitRequest {
    pub fn new(executable: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            executable: executable.into(),
            args,
            job_name: None,
        }
    }

    pub fn with_job_name(mut self, job_name: impl Into<String>) -> Self {
        self.job_name = Some(job_name.into());
        self
    }
}

/// What [`JobManager::recover_interrupted`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Jobs left `running` by a previous process, now `failed`.
    pub failed: Vec<String>,
    /// Jobs left `pending` by a previous process, launched again.
    pub relaunched: Vec<String>,
}

#[derive(Debug)]
struct InFlightJob {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
struct JobManagerInner {
    config: JobManagerConfig,
    store: JobStore,
    in_flight: Mutex<BTreeMap<String, InFlightJob>>,
}

/// Orchestrates the lifecycle of background jobs.
///
/// Every submitted job runs on its own tokio task; queries read the store
/// directly and never wait on execution. Cloning is cheap and clones share
/// the same store and in-flight table.
#[derive(Debug, Clone)]
pub struct JobManager {
    inner: Arc<JobManagerInner>,
}

impl JobManager {
    /// Opens the job store described by `config`. No job is launched.
    pub fn open(config: JobManagerConfig) -> JobsResult<Self> {
        let store = JobStore::open(&config.jobs_root)?;
        Ok(Self {
            inner: Arc::new(JobManagerInner {
                config,
                store,
                in_flight: Mutex::new(BTreeMap::new()),
            }),
        })
    }

    pub fn config(&self) -> &JobManagerConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    /// Persists a `pending` job and launches it in the background.
    ///
    /// Returns as soon as the record is durable; the process runs afterwards.
    #[tracing::instrument(
        name = "cycpep_jobs.manager.submit",
        skip(self, request),
        fields(executable = %request.executable, arg_count = request.args.len())
    )]
    pub async fn submit(&self, request: SubmitRequest) -> JobsResult<JobRecord> {
        let SubmitRequest {
            executable,
            args,
            job_name,
        } = request;
        if executable.trim().is_empty() {
            return Err(JobError::InvalidRequest {
                reason: "executable must not be empty".to_string(),
            });
        }
        let job_name = job_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());
        let command = JobCommand::new(executable, args);

        let mut last_job_id = String::new();
        for attempt in 1..=MAX_JOB_ID_ATTEMPTS {
            let job_id = generate_job_id();
            let record = JobRecord::new_pending(
                job_id.as_str(),
                job_name
                    .clone()
                    .unwrap_or_else(|| format!("job-{job_id}")),
                command.clone(),
                current_unix_timestamp_ms(),
                self.inner.store.log_path(&job_id),
                self.inner.store.work_dir(&job_id),
            );
            match self.inner.store.create(&record) {
                Ok(()) => {
                    self.launch(&job_id);
                    tracing::info!(
                        job_id = %job_id,
                        job_name = %record.job_name(),
                        command = %record.command().display_line(),
                        "job submitted"
                    );
                    return Ok(record);
                }
                Err(JobError::Conflict { .. }) => {
                    tracing::debug!(job_id = %job_id, attempt, "job id collision; regenerating");
                    last_job_id = job_id;
                }
                Err(error) => return Err(error),
            }
        }
        Err(JobError::Conflict {
            job_id: last_job_id,
        })
    }

    /// Point-in-time snapshot of one job.
    pub fn get_status(&self, job_id: &str) -> JobsResult<JobRecord> {
        self.inner.store.read(job_id)
    }

    /// Result payload of a completed job.
    ///
    /// Any other status, `failed` included, is `NotReady` naming that status;
    /// the failure cause is on the record returned by [`Self::get_status`].
    pub fn get_result(&self, job_id: &str) -> JobsResult<JobResult> {
        let record = self.inner.store.read(job_id)?;
        if let Some(result) = record.result() {
            return Ok(result.clone());
        }
        Err(JobError::NotReady {
            job_id: job_id.to_string(),
            status: record.status(),
        })
    }

    /// Snapshot of the job log; `tail_lines == 0` returns every line.
    pub fn get_log(&self, job_id: &str, tail_lines: usize) -> JobsResult<JobLog> {
        let record = self.inner.store.read(job_id)?;
        let log_path = record.log_path();
        read_log_tail(log_path, tail_lines).map_err(|error| {
            if error.kind() == std::io::ErrorKind::NotFound {
                JobError::LogNotFound {
                    job_id: job_id.to_string(),
                    path: log_path.to_path_buf(),
                }
            } else {
                JobError::persistence(job_id, log_path, error)
            }
        })
    }

    /// Marks a `pending` or `running` job `cancelled` and signals its process.
    ///
    /// The record change is authoritative; killing the process is best effort.
    #[tracing::instrument(name = "cycpep_jobs.manager.cancel", skip(self))]
    pub fn cancel(&self, job_id: &str) -> JobsResult<JobRecord> {
        let record = self
            .inner
            .store
            .update(job_id, |record| record.mark_cancelled(current_unix_timestamp_ms()))?;
        if let Some(job) = lock_unpoisoned(&self.inner.in_flight).get(job_id) {
            let _ = job.cancel.send(true);
        }
        tracing::info!(job_id, "job cancelled");
        Ok(record)
    }

    /// Every job, optionally filtered, ordered by submission time then id.
    pub fn list(&self, filter: Option<JobStatusFilter>) -> JobsResult<Vec<JobRecord>> {
        let mut records = self.inner.store.list()?;
        if let Some(filter) = filter {
            records.retain(|record| filter.matches(record.status()));
        }
        records.sort_by(|left, right| {
            left.submitted_at()
                .cmp(&right.submitted_at())
                .then_with(|| left.job_id().cmp(right.job_id()))
        });
        Ok(records)
    }

    /// Ids of jobs whose background task has not finished.
    pub fn in_flight(&self) -> Vec<String> {
        lock_unpoisoned(&self.inner.in_flight)
            .keys()
            .cloned()
            .collect()
    }

    /// Repairs jobs a previous manager process left unfinished.
    ///
    /// `running` records have lost their process and become `failed`;
    /// `pending` records never started and are launched again. Jobs owned by
    /// this manager are left alone.
    #[tracing::instrument(name = "cycpep_jobs.manager.recover_interrupted", skip(self))]
    pub async fn recover_interrupted(&self) -> JobsResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for record in self.list(Some(JobStatusFilter::Active))? {
            let job_id = record.job_id();
            if lock_unpoisoned(&self.inner.in_flight).contains_key(job_id) {
                continue;
            }
            match record.status() {
                JobStatus::Running => {
                    let updated = self.inner.store.update(job_id, |record| {
                        record.mark_failed(
                            current_unix_timestamp_ms(),
                            INTERRUPTED_BY_RESTART_MESSAGE,
                        )
                    });
                    match updated {
                        Ok(_) => {
                            tracing::warn!(job_id, "marked interrupted job failed");
                            report.failed.push(job_id.to_string());
                        }
                        Err(JobError::InvalidState { status, .. }) => {
                            tracing::debug!(job_id, %status, "job finished before recovery");
                        }
                        Err(error) => return Err(error),
                    }
                }
                JobStatus::Pending => {
                    self.launch(job_id);
                    tracing::warn!(job_id, "relaunched pending job");
                    report.relaunched.push(job_id.to_string());
                }
                _ => {}
            }
        }
        Ok(report)
    }

    /// Cancels every in-flight job and waits for their tasks to finish.
    ///
    /// Returns the ids that were still in flight.
    #[tracing::instrument(name = "cycpep_jobs.manager.shutdown", skip(self))]
    pub async fn shutdown(&self) -> Vec<String> {
        let jobs = std::mem::take(&mut *lock_unpoisoned(&self.inner.in_flight));
        let mut handles = Vec::with_capacity(jobs.len());
        for (job_id, job) in jobs {
            match self
                .inner
                .store
                .update(&job_id, |record| record.mark_cancelled(current_unix_timestamp_ms()))
            {
                Ok(_) => tracing::info!(job_id = %job_id, "job cancelled by shutdown"),
                Err(JobError::InvalidState { status, .. }) => {
                    tracing::debug!(job_id = %job_id, %status, "job already finished at shutdown");
                }
                Err(error) => {
                    tracing::warn!(job_id = %job_id, %error, "failed to record shutdown cancel");
                }
            }
            let _ = job.cancel.send(true);
            handles.push((job_id, job.handle));
        }

        let mut drained = Vec::with_capacity(handles.len());
        for (job_id, handle) in handles {
            if let Err(error) = handle.await {
                tracing::warn!(job_id = %job_id, %error, "job task ended abnormally");
            }
            drained.push(job_id);
        }
        drained
    }

    fn launch(&self, job_id: &str) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut in_flight = lock_unpoisoned(&self.inner.in_flight);
        // Inserted under the lock so the task cannot deregister before it is registered.
        let handle = tokio::spawn(run_job(
            self.inner.clone(),
            job_id.to_string(),
            cancel_rx,
        ));
        in_flight.insert(
            job_id.to_string(),
            InFlightJob {
                cancel: cancel_tx,
                handle,
            },
        );
    }
}

async fn run_job(inner: Arc<JobManagerInner>, job_id: String, mut cancel: watch::Receiver<bool>) {
    execute_job(&inner, &job_id, &mut cancel).await;
    lock_unpoisoned(&inner.in_flight).remove(&job_id);
}

async fn execute_job(inner: &JobManagerInner, job_id: &str, cancel: &mut watch::Receiver<bool>) {
    let record = match inner
        .store
        .update(job_id, |record| record.mark_running(current_unix_timestamp_ms()))
    {
        Ok(record) => record,
        Err(JobError::InvalidState { status, .. }) => {
            tracing::debug!(job_id, %status, "job left pending before it started");
            return;
        }
        Err(error) => {
            tracing::warn!(job_id, %error, "failed to start job");
            return;
        }
    };
    tracing::info!(job_id, "job started");

    let spec = ProcessSpec {
        executable: record.command().executable.clone(),
        args: record.command().args.clone(),
        work_dir: record.work_dir().to_path_buf(),
        log_path: record.log_path().to_path_buf(),
        result_file: record.work_dir().join(&inner.config.result_file_name),
        error_tail_lines: inner.config.error_tail_lines,
    };
    let outcome = run_process(&spec, cancel).await;
    let now = current_unix_timestamp_ms();
    let (label, applied) = match outcome {
        RunOutcome::Completed(result) => (
            "completed",
            inner
                .store
                .update(job_id, |record| record.mark_completed(now, result)),
        ),
        RunOutcome::Failed(message) => {
            let failure = JobError::ExecutionFailure {
                job_id: job_id.to_string(),
                message: message.clone(),
            };
            tracing::warn!(error = %failure, "job failed");
            (
                "failed",
                inner
                    .store
                    .update(job_id, |record| record.mark_failed(now, message)),
            )
        }
        RunOutcome::Cancelled => (
            "cancelled",
            inner
                .store
                .update(job_id, |record| record.mark_cancelled(now)),
        ),
    };
    match applied {
        Ok(_) => tracing::info!(job_id, outcome = label, "job finished"),
        Err(JobError::InvalidState { status, .. }) => {
            tracing::debug!(job_id, outcome = label, %status, "job outcome lost race with cancel");
        }
        Err(error) => {
            tracing::warn!(job_id, outcome = label, %error, "failed to persist job outcome");
        }
    }
}
