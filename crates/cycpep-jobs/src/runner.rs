use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use serde_json::Value;
use tokio::process::Command;
use tokio::sync::watch;

use crate::log::read_log_tail;
use crate::record::JobResult;

/// Everything the runner needs to execute one job process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub executable: String,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
    pub log_path: PathBuf,
    /// File the process may write its JSON result to, relative paths resolved by the caller.
    pub result_file: PathBuf,
    /// Number of trailing output lines quoted in failure messages.
    pub error_tail_lines: usize,
}

/// How a job process ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(JobResult),
    Failed(String),
    Cancelled,
}

/// Runs `spec` to completion, appending combined stdout/stderr to its log.
///
/// Output is written straight into the log file by the child, so readers can
/// observe partial output while the process runs. Setting the `cancel`
/// channel to `true` kills the child and yields [`RunOutcome::Cancelled`];
/// dropping the sender is not a cancellation.
pub async fn run_process(spec: &ProcessSpec, cancel: &mut watch::Receiver<bool>) -> RunOutcome {
    let stdout_file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&spec.log_path)
    {
        Ok(file) => file,
        Err(error) => {
            return RunOutcome::Failed(format!(
                "failed to open job log {}: {error}",
                spec.log_path.display()
            ));
        }
    };
    let stderr_file = match stdout_file.try_clone() {
        Ok(file) => file,
        Err(error) => {
            return RunOutcome::Failed(format!(
                "failed to share job log {}: {error}",
                spec.log_path.display()
            ));
        }
    };

    let mut command = Command::new(&spec.executable);
    command.args(&spec.args);
    command.current_dir(&spec.work_dir);
    command.kill_on_drop(true);
    command.stdin(Stdio::null());
    command.stdout(Stdio::from(stdout_file));
    command.stderr(Stdio::from(stderr_file));

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(error) => {
            let message = format!("failed to launch '{}': {error}", spec.executable);
            append_runner_note(&spec.log_path, &message);
            return RunOutcome::Failed(message);
        }
    };
    tracing::debug!(
        executable = %spec.executable,
        pid = child.id().unwrap_or_default(),
        "job process spawned"
    );

    let waited = tokio::select! {
        status = child.wait() => Some(status),
        () = cancellation_requested(cancel) => None,
    };
    let status = match waited {
        Some(Ok(status)) => status,
        Some(Err(error)) => {
            return RunOutcome::Failed(format!("failed to wait for job process: {error}"));
        }
        None => {
            if let Err(error) = child.kill().await {
                tracing::warn!(%error, "failed to kill cancelled job process");
            }
            return RunOutcome::Cancelled;
        }
    };

    if status.success() {
        return RunOutcome::Completed(decode_job_result(&spec.result_file, &spec.log_path));
    }
    RunOutcome::Failed(failure_message(status, &spec.log_path, spec.error_tail_lines))
}

/// Decodes the structured result of a successful run.
///
/// `result_file` wins when it holds a JSON object; otherwise the captured
/// output is tried as a whole, then line by line from the end. A run without
/// structured output yields [`JobResult::empty`].
pub fn decode_job_result(result_file: &Path, log_path: &Path) -> JobResult {
    if result_file.is_file() {
        match std::fs::read_to_string(result_file) {
            Ok(raw) => match serde_json::from_str::<Value>(&raw).map(JobResult::from_value) {
                Ok(Some(result)) => return result,
                Ok(None) => tracing::warn!(
                    path = %result_file.display(),
                    "job result file is not a JSON object; falling back to stdout"
                ),
                Err(error) => tracing::warn!(
                    path = %result_file.display(),
                    %error,
                    "job result file is not valid JSON; falling back to stdout"
                ),
            },
            Err(error) => tracing::warn!(
                path = %result_file.display(),
                %error,
                "failed to read job result file; falling back to stdout"
            ),
        }
    }

    let output = match std::fs::read(log_path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(error) => {
            tracing::warn!(path = %log_path.display(), %error, "failed to read job log");
            return JobResult::empty();
        }
    };
    decode_json_object(output.trim())
        .or_else(|| {
            output
                .lines()
                .rev()
                .map(str::trim)
                .filter(|line| line.starts_with('{'))
                .find_map(decode_json_object)
        })
        .unwrap_or_else(JobResult::empty)
}

fn decode_json_object(raw: &str) -> Option<JobResult> {
    serde_json::from_str::<Value>(raw)
        .ok()
        .and_then(JobResult::from_value)
}

fn failure_message(status: ExitStatus, log_path: &Path, tail_lines: usize) -> String {
    let headline = match status.code() {
        Some(code) => format!("process exited with status {code}"),
        None => format!("process terminated by signal ({status})"),
    };
    let tail = if tail_lines == 0 {
        Vec::new()
    } else {
        read_log_tail(log_path, tail_lines)
            .map(|log| log.lines)
            .unwrap_or_default()
    };
    let tail = tail
        .iter()
        .map(|line| line.trim_end())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>();
    if tail.is_empty() {
        return headline;
    }
    // Errors stay on one line; the full output remains in the job log.
    format!("{headline}: {}", tail.join(" | "))
}

fn append_runner_note(log_path: &Path, note: &str) {
    let appended = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .and_then(|mut file| writeln!(file, "{note}"));
    if let Err(error) = appended {
        tracing::warn!(path = %log_path.display(), %error, "failed to append runner note");
    }
}

async fn cancellation_requested(cancel: &mut watch::Receiver<bool>) {
    let requested = cancel.wait_for(|requested| *requested).await.is_ok();
    if !requested {
        std::future::pending::<()>().await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::{decode_job_result, run_process, ProcessSpec, RunOutcome};
    use crate::record::JobResult;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::watch;

    fn shell_spec(temp: &tempfile::TempDir, script: &str) -> ProcessSpec {
        let work_dir = temp.path().join("work");
        std::fs::create_dir_all(&work_dir).expect("work dir");
        ProcessSpec {
            executable: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            result_file: work_dir.join("result.json"),
            work_dir,
            log_path: temp.path().join("job.log"),
            error_tail_lines: 20,
        }
    }

    #[tokio::test]
    async fn functional_stdout_json_becomes_result_payload() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = shell_spec(
            &temp,
            r#"echo starting; echo '{"success": true, "output_files": ["a.out"]}'"#,
        );
        let (_cancel_tx, mut cancel_rx) = watch::channel(false);
        let outcome = run_process(&spec, &mut cancel_rx).await;
        let RunOutcome::Completed(result) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(
            serde_json::to_value(&result).expect("encode"),
            json!({"success": true, "output_files": ["a.out"]})
        );
    }

    #[tokio::test]
    async fn functional_result_file_takes_precedence_over_stdout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = shell_spec(
            &temp,
            r#"printf '{"success": true, "output_files": ["model_0.cif"]}' > result.json; echo '{"success": false}'"#,
        );
        let (_cancel_tx, mut cancel_rx) = watch::channel(false);
        let outcome = run_process(&spec, &mut cancel_rx).await;
        let RunOutcome::Completed(result) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert!(result.success());
        assert_eq!(result.output_files(), vec!["model_0.cif"]);
    }

    #[tokio::test]
    async fn functional_non_zero_exit_reports_stderr_tail() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = shell_spec(&temp, "echo boom >&2; exit 1");
        let (_cancel_tx, mut cancel_rx) = watch::channel(false);
        let outcome = run_process(&spec, &mut cancel_rx).await;
        let RunOutcome::Failed(message) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(message.starts_with("process exited with status 1"), "{message}");
        assert!(message.contains("boom"), "{message}");
    }

    #[tokio::test]
    async fn regression_multi_line_output_tail_is_flattened_into_one_line() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = shell_spec(&temp, "echo step1; echo boom >&2; exit 1");
        let (_cancel_tx, mut cancel_rx) = watch::channel(false);
        let outcome = run_process(&spec, &mut cancel_rx).await;
        let RunOutcome::Failed(message) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(!message.contains('\n'), "{message:?}");
        assert_eq!(message, "process exited with status 1: step1 | boom");
    }

    #[tokio::test]
    async fn regression_missing_executable_fails_with_launch_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut spec = shell_spec(&temp, "true");
        spec.executable = temp
            .path()
            .join("does-not-exist")
            .display()
            .to_string();
        let (_cancel_tx, mut cancel_rx) = watch::channel(false);
        let outcome = run_process(&spec, &mut cancel_rx).await;
        let RunOutcome::Failed(message) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(message.starts_with("failed to launch"), "{message}");
        let log = std::fs::read_to_string(&spec.log_path).expect("log");
        assert!(log.contains("failed to launch"));
    }

    #[tokio::test]
    async fn functional_cancel_signal_kills_running_process() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = shell_spec(&temp, "echo started; sleep 30");
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let started = tokio::time::Instant::now();
        let run = tokio::spawn(async move { run_process(&spec, &mut cancel_rx).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel_tx.send(true).expect("send cancel");
        let outcome = run.await.expect("join");
        assert_eq!(outcome, RunOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn regression_dropped_cancel_sender_does_not_cancel() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = shell_spec(&temp, "sleep 0.2; echo done");
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        drop(cancel_tx);
        let outcome = run_process(&spec, &mut cancel_rx).await;
        assert_eq!(outcome, RunOutcome::Completed(JobResult::empty()));
    }

    #[test]
    fn unit_decode_prefers_last_json_line_in_mixed_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log_path = temp.path().join("job.log");
        std::fs::write(
            &log_path,
            "{\"progress\": 1}\nwarning: slow\n{\"success\": true, \"output_files\": []}\n",
        )
        .expect("write log");
        let result = decode_job_result(&temp.path().join("missing.json"), &log_path);
        assert_eq!(
            serde_json::to_value(&result).expect("encode"),
            json!({"success": true, "output_files": []})
        );
        assert!(result.get("progress").is_none());
    }
}
