use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{JobError, JobsResult};

const JOB_RECORD_SCHEMA_VERSION: u32 = 1;

fn job_record_schema_version() -> u32 {
    JOB_RECORD_SCHEMA_VERSION
}

/// Enumerates the lifecycle states of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is persisted and its background task has not started the process yet.
    Pending,
    /// Job process has been launched and is currently active.
    Running,
    /// Job process exited with status zero.
    Completed,
    /// Job process exited non-zero, could not be launched, or was interrupted.
    Failed,
    /// Job was cancelled before completion.
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Returns the stable snake_case wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns true when the job cannot transition any further.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true when `next` is a legal edge of the job state machine.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enumerates list filters used by the job query APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatusFilter {
    /// Matches exactly one status.
    Status(JobStatus),
    /// Matches `pending` and `running` jobs.
    Active,
    /// Matches any terminal job (`completed`, `failed`, `cancelled`).
    Terminal,
}

impl JobStatusFilter {
    /// Parses a filter token used by the tool surface.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Status(JobStatus::Pending)),
            "running" => Some(Self::Status(JobStatus::Running)),
            "completed" => Some(Self::Status(JobStatus::Completed)),
            "failed" => Some(Self::Status(JobStatus::Failed)),
            "cancelled" | "canceled" => Some(Self::Status(JobStatus::Cancelled)),
            "active" => Some(Self::Active),
            "terminal" => Some(Self::Terminal),
            _ => None,
        }
    }

    /// Evaluates whether a status satisfies this filter.
    pub fn matches(self, status: JobStatus) -> bool {
        match self {
            Self::Status(expected) => status == expected,
            Self::Active => !status.is_terminal(),
            Self::Terminal => status.is_terminal(),
        }
    }
}

impl From<JobStatus> for JobStatusFilter {
    fn from(status: JobStatus) -> Self {
        Self::Status(status)
    }
}

/// External command a job runs: an executable plus its argument list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobCommand {
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl JobCommand {
    pub fn new(executable: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            executable: executable.into(),
            args,
        }
    }

    /// Renders the command as one shell-like line for logs and status payloads.
    pub fn display_line(&self) -> String {
        let mut line = self.executable.clone();
        for arg in &self.args {
            line.push(' ');
            if arg.is_empty() || arg.chars().any(char::is_whitespace) {
                line.push_str(&format!("{arg:?}"));
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

/// Structured payload a prediction script reports on success.
///
/// The JSON object is stored exactly as the script emitted it; the
/// well-known keys are read through accessors and never normalised.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct JobResult {
    payload: Map<String, Value>,
}

impl JobResult {
    /// Result used when a job exits zero without emitting structured output.
    pub fn empty() -> Self {
        let mut payload = Map::new();
        payload.insert("success".to_string(), Value::Bool(true));
        payload.insert("output_files".to_string(), Value::Array(Vec::new()));
        Self { payload }
    }

    /// Wraps a script's JSON output; returns `None` unless `value` is an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(payload) => Some(Self { payload }),
            _ => None,
        }
    }

    /// The `success` flag; missing or non-boolean counts as success.
    pub fn success(&self) -> bool {
        self.payload
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    /// String entries of `output_files`; anything else is ignored.
    pub fn output_files(&self) -> Vec<&str> {
        self.payload
            .get("output_files")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    pub fn metadata(&self) -> Option<&Map<String, Value>> {
        self.payload.get("metadata").and_then(Value::as_object)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.payload
    }
}

/// Terminal outcome of a job: a result payload or a failure message, never both.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobOutcome {
    Success { result: JobResult },
    Failure { message: String },
}

/// Durable metadata persisted for each job.
///
/// Lifecycle fields are private; they only change through the `mark_*`
/// transitions, which reject every edge outside the job state machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    #[serde(default = "job_record_schema_version")]
    schema_version: u32,
    job_id: String,
    job_name: String,
    command: JobCommand,
    status: JobStatus,
    submitted_at: u64,
    #[serde(default)]
    started_at: Option<u64>,
    #[serde(default)]
    completed_at: Option<u64>,
    #[serde(default)]
    outcome: Option<JobOutcome>,
    log_path: PathBuf,
    work_dir: PathBuf,
}

impl JobRecord {
    /// Builds a freshly submitted record in the `pending` state.
    pub fn new_pending(
        job_id: impl Into<String>,
        job_name: impl Into<String>,
        command: JobCommand,
        submitted_at: u64,
        log_path: PathBuf,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            schema_version: JOB_RECORD_SCHEMA_VERSION,
            job_id: job_id.into(),
            job_name: job_name.into(),
            command,
            status: JobStatus::Pending,
            submitted_at,
            started_at: None,
            completed_at: None,
            outcome: None,
            log_path,
            work_dir,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn command(&self) -> &JobCommand {
        &self.command
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn submitted_at(&self) -> u64 {
        self.submitted_at
    }

    pub fn started_at(&self) -> Option<u64> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<u64> {
        self.completed_at
    }

    pub fn outcome(&self) -> Option<&JobOutcome> {
        self.outcome.as_ref()
    }

    /// Result payload; present only for completed jobs.
    pub fn result(&self) -> Option<&JobResult> {
        match &self.outcome {
            Some(JobOutcome::Success { result }) => Some(result),
            _ => None,
        }
    }

    /// Failure message; present only for failed jobs.
    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            Some(JobOutcome::Failure { message }) => Some(message.as_str()),
            _ => None,
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// `pending -> running`; stamps `started_at`.
    pub fn mark_running(&mut self, now_ms: u64) -> JobsResult<()> {
        self.ensure_transition(JobStatus::Running, "start")?;
        self.status = JobStatus::Running;
        self.started_at = Some(now_ms.max(self.submitted_at));
        Ok(())
    }

    /// `running -> completed` with the decoded result payload.
    pub fn mark_completed(&mut self, now_ms: u64, result: JobResult) -> JobsResult<()> {
        self.ensure_transition(JobStatus::Completed, "complete")?;
        self.finish(
            JobStatus::Completed,
            now_ms,
            Some(JobOutcome::Success { result }),
        );
        Ok(())
    }

    /// `running -> failed` with a human-readable cause.
    pub fn mark_failed(&mut self, now_ms: u64, message: impl Into<String>) -> JobsResult<()> {
        self.ensure_transition(JobStatus::Failed, "fail")?;
        self.finish(
            JobStatus::Failed,
            now_ms,
            Some(JobOutcome::Failure {
                message: message.into(),
            }),
        );
        Ok(())
    }

    /// `pending|running -> cancelled`.
    ///
    /// A job cancelled straight from `pending` gets `started_at` equal to its
    /// cancellation time, so every record that left `pending` carries one.
    pub fn mark_cancelled(&mut self, now_ms: u64) -> JobsResult<()> {
        self.ensure_transition(JobStatus::Cancelled, "cancel")?;
        if self.started_at.is_none() {
            self.started_at = Some(now_ms.max(self.submitted_at));
        }
        self.finish(JobStatus::Cancelled, now_ms, None);
        Ok(())
    }

    /// Checks the cross-field invariants of a record loaded from disk.
    pub fn validate(&self) -> Result<(), String> {
        match (self.status, &self.outcome) {
            (JobStatus::Completed, Some(JobOutcome::Success { .. }))
            | (JobStatus::Failed, Some(JobOutcome::Failure { .. }))
            | (JobStatus::Pending | JobStatus::Running | JobStatus::Cancelled, None) => {}
            (status, _) => {
                return Err(format!("outcome does not match status '{status}'"));
            }
        }
        if self.status != JobStatus::Pending && self.started_at.is_none() {
            return Err(format!("status '{}' requires started_at", self.status));
        }
        if self.status.is_terminal() != self.completed_at.is_some() {
            return Err(format!(
                "completed_at presence does not match status '{}'",
                self.status
            ));
        }
        let ordered = match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => {
                self.submitted_at <= started && started <= completed
            }
            (Some(started), None) => self.submitted_at <= started,
            (None, Some(_)) => false,
            (None, None) => true,
        };
        if !ordered {
            return Err("timestamps are not monotonically ordered".to_string());
        }
        Ok(())
    }

    fn ensure_transition(&self, next: JobStatus, operation: &'static str) -> JobsResult<()> {
        if self.status.can_transition_to(next) {
            return Ok(());
        }
        Err(JobError::InvalidState {
            job_id: self.job_id.clone(),
            status: self.status,
            operation,
        })
    }

    fn finish(&mut self, status: JobStatus, now_ms: u64, outcome: Option<JobOutcome>) {
        let floor = self.started_at.unwrap_or(self.submitted_at);
        self.status = status;
        self.completed_at = Some(now_ms.max(floor));
        self.outcome = outcome;
    }
}
