use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Result};
use cycpep_jobs::{JobError, JobManager, JobRecord, JobStatusFilter, SubmitRequest};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::mcp_server_runtime::MCP_SERVER_NAME;
use crate::prediction_commands::PredictionScripts;
use crate::tool_args::{
    optional_raw_string_array, optional_string, optional_string_array, optional_usize,
    required_string,
};

pub const TOOL_SUBMIT_JOB: &str = "submit_job";
pub const TOOL_SUBMIT_STRUCTURE: &str = "submit_structure_prediction";
pub const TOOL_SUBMIT_MULTIMER: &str = "submit_multimer_prediction";
pub const TOOL_SUBMIT_AFFINITY: &str = "submit_affinity_prediction";
pub const TOOL_SUBMIT_MODIFIED: &str = "submit_modified_peptide_prediction";
pub const TOOL_GET_JOB_STATUS: &str = "get_job_status";
pub const TOOL_GET_JOB_RESULT: &str = "get_job_result";
pub const TOOL_GET_JOB_LOG: &str = "get_job_log";
pub const TOOL_CANCEL_JOB: &str = "cancel_job";
pub const TOOL_LIST_JOBS: &str = "list_jobs";
pub const TOOL_LIST_MODIFICATIONS: &str = "list_available_modifications";
pub const TOOL_GET_SERVER_INFO: &str = "get_server_info";

const DEFAULT_LOG_TAIL_LINES: usize = 50;
const LIST_MODIFICATIONS_TIMEOUT: Duration = Duration::from_secs(60);
const STATUS_FILTER_VALUES: &str =
    "pending, running, completed, failed, cancelled, active, terminal";

/// Outcome of one tool call: a JSON payload plus whether it reports an error.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolExecutionResult {
    pub content: Value,
    pub is_error: bool,
}

impl ToolExecutionResult {
    pub fn ok(content: Value) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    pub fn error(content: Value) -> Self {
        Self {
            content,
            is_error: true,
        }
    }
}

/// Name, description and JSON schema advertised by `tools/list`.
#[derive(Debug, Clone, PartialEq)]
pub struct McpToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Error)]
enum ToolCallError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    Script(String),
    #[error(transparent)]
    Job(#[from] JobError),
}

impl From<String> for ToolCallError {
    fn from(message: String) -> Self {
        Self::InvalidArgument(message)
    }
}

impl ToolCallError {
    fn payload(&self) -> Value {
        let mut payload = Map::new();
        payload.insert("status".to_string(), json!("error"));
        payload.insert("error".to_string(), json!(self.to_string()));
        match self {
            Self::InvalidArgument(_) => {
                payload.insert("kind".to_string(), json!("invalid_argument"));
            }
            Self::Script(_) => {
                payload.insert("kind".to_string(), json!("execution_failure"));
            }
            Self::Job(error) => {
                payload.insert("kind".to_string(), json!(error.kind().as_str()));
                if let Some(job_id) = error.job_id() {
                    payload.insert("job_id".to_string(), json!(job_id));
                }
            }
        }
        Value::Object(payload)
    }
}

/// The job tools exposed over MCP, backed by one [`JobManager`].
#[derive(Debug, Clone)]
pub struct JobToolbox {
    manager: JobManager,
    scripts: PredictionScripts,
}

impl JobToolbox {
    pub fn new(manager: JobManager, scripts: PredictionScripts) -> Self {
        Self { manager, scripts }
    }

    pub fn manager(&self) -> &JobManager {
        &self.manager
    }

    pub fn scripts(&self) -> &PredictionScripts {
        &self.scripts
    }

    /// Runs `tool_name`; unknown tools are a protocol error, everything else a tool result.
    pub async fn call(&self, tool_name: &str, arguments: &Value) -> Result<ToolExecutionResult> {
        let outcome = match tool_name {
            TOOL_SUBMIT_JOB => self.submit_job(arguments).await,
            TOOL_SUBMIT_STRUCTURE => self.submit_structure(arguments).await,
            TOOL_SUBMIT_MULTIMER => self.submit_multimer(arguments).await,
            TOOL_SUBMIT_AFFINITY => self.submit_affinity(arguments).await,
            TOOL_SUBMIT_MODIFIED => self.submit_modified(arguments).await,
            TOOL_GET_JOB_STATUS => self.get_job_status(arguments),
            TOOL_GET_JOB_RESULT => self.get_job_result(arguments),
            TOOL_GET_JOB_LOG => self.get_job_log(arguments),
            TOOL_CANCEL_JOB => self.cancel_job(arguments),
            TOOL_LIST_JOBS => self.list_jobs(arguments),
            TOOL_LIST_MODIFICATIONS => self.list_available_modifications().await,
            TOOL_GET_SERVER_INFO => Ok(server_info_payload()),
            other => bail!("unknown mcp tool '{}'", other),
        };
        Ok(match outcome {
            Ok(content) => ToolExecutionResult::ok(content),
            Err(error) => {
                tracing::debug!(tool = tool_name, %error, "tool call returned error");
                ToolExecutionResult::error(error.payload())
            }
        })
    }

    async fn submit_job(&self, arguments: &Value) -> Result<Value, ToolCallError> {
        let executable = required_string(arguments, "executable")?;
        let args = optional_raw_string_array(arguments, "args")?;
        let mut request = SubmitRequest::new(executable, args);
        request.job_name = optional_string(arguments, "job_name")?;
        self.submit(request).await
    }

    async fn submit_structure(&self, arguments: &Value) -> Result<Value, ToolCallError> {
        let sequence = required_string(arguments, "sequence")?;
        let output_dir = optional_string(arguments, "output_dir")?;
        let job_name = optional_string(arguments, "job_name")?;
        let request = self
            .scripts
            .structure(&sequence, output_dir.as_deref(), job_name);
        self.submit(request).await
    }

    async fn submit_multimer(&self, arguments: &Value) -> Result<Value, ToolCallError> {
        let sequences = optional_string_array(arguments, "sequences")?;
        if sequences.is_empty() {
            return Err(ToolCallError::InvalidArgument(
                "'sequences' must contain at least one non-empty sequence".to_string(),
            ));
        }
        let chain_ids = optional_string_array(arguments, "chain_ids")?;
        let output_dir = optional_string(arguments, "output_dir")?;
        let job_name = optional_string(arguments, "job_name")?;
        let request =
            self.scripts
                .multimer(&sequences, &chain_ids, output_dir.as_deref(), job_name);
        self.submit(request).await
    }

    async fn submit_affinity(&self, arguments: &Value) -> Result<Value, ToolCallError> {
        let peptide_sequence = required_string(arguments, "peptide_sequence")?;
        let target_sequence = required_string(arguments, "target_sequence")?;
        let output_dir = optional_string(arguments, "output_dir")?;
        let job_name = optional_string(arguments, "job_name")?;
        let request = self.scripts.affinity(
            &peptide_sequence,
            &target_sequence,
            output_dir.as_deref(),
            job_name,
        );
        self.submit(request).await
    }

    async fn submit_modified(&self, arguments: &Value) -> Result<Value, ToolCallError> {
        let sequence = required_string(arguments, "sequence")?;
        let modifications = optional_string(arguments, "modifications")?;
        let output_dir = optional_string(arguments, "output_dir")?;
        let job_name = optional_string(arguments, "job_name")?;
        let request = self.scripts.modified_peptide(
            &sequence,
            modifications.as_deref(),
            output_dir.as_deref(),
            job_name,
        );
        self.submit(request).await
    }

    async fn submit(&self, request: SubmitRequest) -> Result<Value, ToolCallError> {
        let record = self.manager.submit(request).await?;
        Ok(json!({
            "status": "submitted",
            "job_id": record.job_id(),
            "job_name": record.job_name(),
            "message": format!(
                "Job submitted. Use get_job_status with job_id '{}' to check progress.",
                record.job_id()
            ),
        }))
    }

    fn get_job_status(&self, arguments: &Value) -> Result<Value, ToolCallError> {
        let job_id = required_string(arguments, "job_id")?;
        let record = self.manager.get_status(&job_id)?;
        Ok(job_status_payload(&record))
    }

    fn get_job_result(&self, arguments: &Value) -> Result<Value, ToolCallError> {
        let job_id = required_string(arguments, "job_id")?;
        let result = self.manager.get_result(&job_id)?;
        Ok(json!({
            "status": "success",
            "job_id": job_id,
            "result": result,
        }))
    }

    fn get_job_log(&self, arguments: &Value) -> Result<Value, ToolCallError> {
        let job_id = required_string(arguments, "job_id")?;
        let tail = optional_usize(arguments, "tail", DEFAULT_LOG_TAIL_LINES)?;
        let log = self.manager.get_log(&job_id, tail)?;
        Ok(json!({
            "status": "success",
            "job_id": job_id,
            "log_lines": log.lines,
            "total_lines": log.total_lines,
        }))
    }

    fn cancel_job(&self, arguments: &Value) -> Result<Value, ToolCallError> {
        let job_id = required_string(arguments, "job_id")?;
        let record = self.manager.cancel(&job_id)?;
        Ok(json!({
            "status": "success",
            "acknowledged": true,
            "job_id": record.job_id(),
            "job_status": record.status().as_str(),
            "message": format!("Job {} cancelled", record.job_id()),
        }))
    }

    fn list_jobs(&self, arguments: &Value) -> Result<Value, ToolCallError> {
        let filter = match optional_string(arguments, "status")? {
            Some(raw) => Some(JobStatusFilter::parse(&raw).ok_or_else(|| {
                ToolCallError::InvalidArgument(format!(
                    "unsupported status filter '{raw}'; expected one of {STATUS_FILTER_VALUES}"
                ))
            })?),
            None => None,
        };
        let jobs = self
            .manager
            .list(filter)?
            .iter()
            .map(job_status_payload)
            .collect::<Vec<_>>();
        Ok(json!({
            "status": "success",
            "total": jobs.len(),
            "jobs": jobs,
        }))
    }
}

impl JobToolbox {
    /// Runs `predict_modified.py --list-modifications` inline; it is a quick
    /// catalogue lookup, not a prediction, so it bypasses the job manager.
    async fn list_available_modifications(&self) -> Result<Value, ToolCallError> {
        let mut command = tokio::process::Command::new(&self.scripts.python);
        command
            .args(self.scripts.list_modifications_args())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if !self.scripts.base_dir.as_os_str().is_empty() {
            command.current_dir(&self.scripts.base_dir);
        }
        let output = match tokio::time::timeout(LIST_MODIFICATIONS_TIMEOUT, command.output()).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(error)) => {
                return Err(ToolCallError::Script(format!(
                    "failed to launch '{}': {error}",
                    self.scripts.python
                )));
            }
            Err(_) => {
                return Err(ToolCallError::Script(format!(
                    "listing modifications timed out after {}s",
                    LIST_MODIFICATIONS_TIMEOUT.as_secs()
                )));
            }
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .collect::<Vec<_>>()
                .join(" | ");
            return Err(ToolCallError::Script(format!(
                "failed to list modifications ({}): {detail}",
                output.status
            )));
        }
        Ok(json!({
            "status": "success",
            "modifications": String::from_utf8_lossy(&output.stdout).trim(),
        }))
    }
}

/// Static description of the server and the tools it offers.
pub fn server_info_payload() -> Value {
    let tools = job_tool_descriptors()
        .into_iter()
        .map(|tool| tool.name)
        .collect::<Vec<_>>();
    json!({
        "status": "success",
        "server_name": MCP_SERVER_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "description": "MCP server running cyclic peptide structure predictions as background jobs",
        "capabilities": {
            "structure_prediction": "3D structure prediction for cyclic peptides",
            "multimer_prediction": "Multi-peptide complex structure prediction",
            "affinity_prediction": "Peptide-target binding affinity",
            "modified_peptides": "Structure prediction with non-canonical amino acids"
        },
        "job_management": {
            "status_check": "get_job_status(job_id)",
            "get_results": "get_job_result(job_id)",
            "view_logs": "get_job_log(job_id, tail)",
            "cancel": "cancel_job(job_id)",
            "list_all": "list_jobs(status)"
        },
        "tools": tools,
    })
}

/// Status view of a record: lifecycle fields only, never the result payload.
pub fn job_status_payload(record: &JobRecord) -> Value {
    let mut payload = Map::new();
    payload.insert("job_id".to_string(), json!(record.job_id()));
    payload.insert("job_name".to_string(), json!(record.job_name()));
    payload.insert("status".to_string(), json!(record.status().as_str()));
    payload.insert(
        "command".to_string(),
        json!(record.command().display_line()),
    );
    payload.insert("submitted_at".to_string(), json!(record.submitted_at()));
    if let Some(started_at) = record.started_at() {
        payload.insert("started_at".to_string(), json!(started_at));
    }
    if let Some(completed_at) = record.completed_at() {
        payload.insert("completed_at".to_string(), json!(completed_at));
    }
    if let Some(error) = record.error() {
        payload.insert("error".to_string(), json!(error));
    }
    Value::Object(payload)
}

/// Descriptors for every job tool, sorted by name.
pub fn job_tool_descriptors() -> Vec<McpToolDescriptor> {
    let job_id_schema = json!({
        "type": "object",
        "properties": {
            "job_id": {"type": "string", "description": "Job id returned by a submit tool"}
        },
        "required": ["job_id"],
        "additionalProperties": false
    });
    let mut tools = vec![
        descriptor(
            TOOL_SUBMIT_JOB,
            "Submit an arbitrary command as a background job",
            json!({
                "type": "object",
                "properties": {
                    "executable": {"type": "string"},
                    "args": {"type": "array", "items": {"type": "string"}},
                    "job_name": {"type": "string"}
                },
                "required": ["executable"],
                "additionalProperties": false
            }),
        ),
        descriptor(
            TOOL_SUBMIT_STRUCTURE,
            "Submit a cyclic peptide structure prediction for one sequence",
            json!({
                "type": "object",
                "properties": {
                    "sequence": {"type": "string", "description": "Amino acid sequence"},
                    "output_dir": {"type": "string"},
                    "job_name": {"type": "string"}
                },
                "required": ["sequence"],
                "additionalProperties": false
            }),
        ),
        descriptor(
            TOOL_SUBMIT_MULTIMER,
            "Submit a multimer prediction for several peptide chains",
            json!({
                "type": "object",
                "properties": {
                    "sequences": {"type": "array", "items": {"type": "string"}, "minItems": 1},
                    "chain_ids": {"type": "array", "items": {"type": "string"}},
                    "output_dir": {"type": "string"},
                    "job_name": {"type": "string"}
                },
                "required": ["sequences"],
                "additionalProperties": false
            }),
        ),
        descriptor(
            TOOL_SUBMIT_AFFINITY,
            "Submit a peptide-target binding affinity prediction",
            json!({
                "type": "object",
                "properties": {
                    "peptide_sequence": {"type": "string"},
                    "target_sequence": {"type": "string"},
                    "output_dir": {"type": "string"},
                    "job_name": {"type": "string"}
                },
                "required": ["peptide_sequence", "target_sequence"],
                "additionalProperties": false
            }),
        ),
        descriptor(
            TOOL_SUBMIT_MODIFIED,
            "Submit a structure prediction for a chemically modified peptide",
            json!({
                "type": "object",
                "properties": {
                    "sequence": {"type": "string"},
                    "modifications": {"type": "string"},
                    "output_dir": {"type": "string"},
                    "job_name": {"type": "string"}
                },
                "required": ["sequence"],
                "additionalProperties": false
            }),
        ),
        descriptor(
            TOOL_GET_JOB_STATUS,
            "Get the lifecycle status of a job",
            job_id_schema.clone(),
        ),
        descriptor(
            TOOL_GET_JOB_RESULT,
            "Get the result payload of a completed job",
            job_id_schema.clone(),
        ),
        descriptor(
            TOOL_GET_JOB_LOG,
            "Get the last lines of a job's combined output (tail 0 returns everything)",
            json!({
                "type": "object",
                "properties": {
                    "job_id": {"type": "string"},
                    "tail": {"type": "integer", "minimum": 0, "default": DEFAULT_LOG_TAIL_LINES}
                },
                "required": ["job_id"],
                "additionalProperties": false
            }),
        ),
        descriptor(
            TOOL_CANCEL_JOB,
            "Cancel a pending or running job",
            job_id_schema,
        ),
        descriptor(
            TOOL_LIST_MODIFICATIONS,
            "List the non-canonical amino acid modifications the modified-peptide script supports",
            no_arguments_schema(),
        ),
        descriptor(
            TOOL_GET_SERVER_INFO,
            "Describe this server, its capabilities and job management tools",
            no_arguments_schema(),
        ),
        descriptor(
            TOOL_LIST_JOBS,
            "List jobs, optionally filtered by status",
            json!({
                "type": "object",
                "properties": {
                    "status": {
                        "type": "string",
                        "description": format!("One of {STATUS_FILTER_VALUES}")
                    }
                },
                "additionalProperties": false
            }),
        ),
    ];
    tools.sort_by(|left, right| left.name.cmp(&right.name));
    tools
}

fn no_arguments_schema() -> Value {
    json!({
        "type": "object",
        "properties": {},
        "additionalProperties": false
    })
}

fn descriptor(name: &str, description: &str, input_schema: Value) -> McpToolDescriptor {
    McpToolDescriptor {
        name: name.to_string(),
        description: description.to_string(),
        input_schema,
    }
}
