use std::path::PathBuf;

use clap::{ArgAction, Parser};
use cycpep_jobs::JobManagerConfig;
use cycpep_tools::PredictionScripts;

#[derive(Debug, Parser)]
#[command(
    name = "cycpep-server",
    about = "MCP server running cyclic peptide prediction jobs in the background",
    version
)]
pub(crate) struct Cli {
    #[arg(
        long = "jobs-dir",
        env = "CYCPEP_JOBS_DIR",
        default_value = ".cycpep/jobs",
        help = "Directory holding one metadata/log/work directory per job"
    )]
    pub jobs_dir: PathBuf,

    #[arg(
        long = "scripts-dir",
        env = "CYCPEP_SCRIPTS_DIR",
        default_value = "scripts",
        help = "Directory containing predict_structure.py and the other prediction scripts; relative to the launch directory"
    )]
    pub scripts_dir: PathBuf,

    #[arg(
        long = "python",
        env = "CYCPEP_PYTHON",
        default_value = "python",
        help = "Interpreter used to run the prediction scripts"
    )]
    pub python: String,

    #[arg(
        long = "error-tail-lines",
        env = "CYCPEP_ERROR_TAIL_LINES",
        default_value_t = 20,
        help = "Trailing output lines quoted in the error of a failed job"
    )]
    pub error_tail_lines: usize,

    #[arg(
        long = "result-file-name",
        env = "CYCPEP_RESULT_FILE_NAME",
        default_value = "result.json",
        help = "Result file a job may write into its work directory"
    )]
    pub result_file_name: String,

    #[arg(
        long = "recover-interrupted",
        env = "CYCPEP_RECOVER_INTERRUPTED",
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        help = "Fail jobs left running and relaunch jobs left pending by a previous server"
    )]
    pub recover_interrupted: bool,
}

impl Cli {
    pub(crate) fn job_manager_config(&self) -> JobManagerConfig {
        JobManagerConfig {
            jobs_root: self.jobs_dir.clone(),
            error_tail_lines: self.error_tail_lines,
            result_file_name: self.result_file_name.clone(),
        }
    }

    pub(crate) fn prediction_scripts(&self) -> PredictionScripts {
        PredictionScripts::new(self.python.clone(), self.scripts_dir.clone())
    }
}
