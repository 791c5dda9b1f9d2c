//! MCP tool surface for CycPep prediction jobs.
//!
//! Maps the `submit_*`, `get_job_*`, `cancel_job` and `list_jobs` tools onto a
//! [`cycpep_jobs::JobManager`], adds the `get_server_info` and
//! `list_available_modifications` utilities, and serves them over
//! `Content-Length` framed JSON-RPC on stdio.

pub mod job_tools;
pub mod mcp_server_runtime;
pub mod prediction_commands;
mod tool_args;

pub use job_tools::{
    job_status_payload, job_tool_descriptors, server_info_payload, JobToolbox, ToolExecutionResult,
};
pub use mcp_server_runtime::*;
pub use prediction_commands::PredictionScripts;
