use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use cycpep_jobs::{JobCommand, JobManager, JobManagerConfig, JobRecord, JobStore};
use cycpep_tools::{
    jsonrpc_request_frame, read_jsonrpc_content_length_frame, serve_mcp_jsonrpc_reader,
    JobToolbox, PredictionScripts,
};
use serde_json::{json, Value};

static WORKSPACE_COUNTER: AtomicU64 = AtomicU64::new(1);

struct IsolatedWorkspace {
    root: PathBuf,
}

impl IsolatedWorkspace {
    fn new(label: &str) -> Self {
        let tick = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after unix epoch")
            .as_nanos();
        let count = WORKSPACE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let root = std::env::temp_dir().join(format!(
            "cycpep-it-{label}-{}-{tick}-{count}",
            std::process::id()
        ));
        fs::create_dir_all(&root).expect("must create isolated workspace root");
        Self { root }
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn jobs_dir(&self) -> PathBuf {
        self.root.join("jobs")
    }

    fn toolbox(&self) -> JobToolbox {
        let manager = JobManager::open(JobManagerConfig::with_jobs_root(self.jobs_dir()))
            .expect("job manager should open");
        JobToolbox::new(manager, PredictionScripts::new("sh", self.root.join("scripts")))
    }
}

impl Drop for IsolatedWorkspace {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

/// Sends one `tools/call` frame through the MCP serve loop and returns its `result`.
async fn call_tool(toolbox: &JobToolbox, name: &str, arguments: Value) -> Value {
    let request = jsonrpc_request_frame(
        json!(format!("call-{name}")),
        "tools/call",
        json!({"name": name, "arguments": arguments}),
    );
    let body = serde_json::to_vec(&request).expect("encode request");
    let mut input = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    input.extend_from_slice(&body);

    let mut reader = tokio::io::BufReader::new(input.as_slice());
    let mut output = Vec::new();
    let report = serve_mcp_jsonrpc_reader(&mut reader, &mut output, toolbox)
        .await
        .expect("serve loop should not fail");
    assert_eq!(report.processed_frames, 1);

    let mut responses = tokio::io::BufReader::new(output.as_slice());
    let response = read_jsonrpc_content_length_frame(&mut responses)
        .await
        .expect("response frame")
        .expect("one response");
    assert!(
        response.get("error").is_none(),
        "unexpected protocol error: {response}"
    );
    response["result"].clone()
}

async fn wait_for_job_status(toolbox: &JobToolbox, job_id: &str, wanted: &[&str]) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let result = call_tool(toolbox, "get_job_status", json!({"job_id": job_id})).await;
        let payload = result["structuredContent"].clone();
        let status = payload["status"].as_str().unwrap_or_default().to_string();
        if wanted.contains(&status.as_str()) {
            return payload;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job_id} stayed {status}"
        );
        tokio::time::sleep(Duration::from_millis(40)).await;
    }
}

#[tokio::test]
async fn integration_mcp_submit_poll_and_fetch_result() {
    let workspace = IsolatedWorkspace::new("submit-poll");
    let toolbox = workspace.toolbox();

    let submitted = call_tool(
        &toolbox,
        "submit_job",
        json!({
            "executable": "sh",
            "args": ["-c", "echo predicting >&2; echo '{\"success\": true, \"output_files\": [\"a.out\"]}'"],
            "job_name": "e2e"
        }),
    )
    .await;
    assert_eq!(submitted["isError"], false);
    let job_id = submitted["structuredContent"]["job_id"]
        .as_str()
        .expect("job id")
        .to_string();

    let status = wait_for_job_status(&toolbox, &job_id, &["completed", "failed"]).await;
    assert_eq!(status["status"], "completed");
    assert_eq!(status["job_name"], "e2e");
    assert!(status["started_at"].as_u64() >= status["submitted_at"].as_u64());

    let result = call_tool(&toolbox, "get_job_result", json!({"job_id": job_id})).await;
    assert_eq!(
        result["structuredContent"]["result"],
        json!({"success": true, "output_files": ["a.out"]})
    );

    let log = call_tool(&toolbox, "get_job_log", json!({"job_id": job_id, "tail": 0})).await;
    assert_eq!(log["structuredContent"]["total_lines"], 2);
    assert_eq!(log["structuredContent"]["log_lines"][0], "predicting");
}

#[tokio::test]
async fn integration_mcp_failed_job_surfaces_stderr_in_error() {
    let workspace = IsolatedWorkspace::new("failed-job");
    let toolbox = workspace.toolbox();
    let submitted = call_tool(
        &toolbox,
        "submit_job",
        json!({"executable": "sh", "args": ["-c", "echo boom >&2; exit 1"]}),
    )
    .await;
    let job_id = submitted["structuredContent"]["job_id"]
        .as_str()
        .expect("job id")
        .to_string();

    let status = wait_for_job_status(&toolbox, &job_id, &["completed", "failed"]).await;
    assert_eq!(status["status"], "failed");
    assert!(status["error"].as_str().expect("error").contains("boom"));

    let result = call_tool(&toolbox, "get_job_result", json!({"job_id": job_id})).await;
    assert_eq!(result["isError"], true);
    assert_eq!(result["structuredContent"]["kind"], "invalid_state");
    assert_eq!(
        result["structuredContent"]["error"],
        format!("job '{job_id}' is failed; result is not available")
    );
}

#[tokio::test]
async fn integration_mcp_cancel_running_job_and_filter_listing() {
    let workspace = IsolatedWorkspace::new("cancel-running");
    let toolbox = workspace.toolbox();
    let submitted = call_tool(
        &toolbox,
        "submit_job",
        json!({"executable": "sh", "args": ["-c", "sleep 30"], "job_name": "long"}),
    )
    .await;
    let job_id = submitted["structuredContent"]["job_id"]
        .as_str()
        .expect("job id")
        .to_string();
    wait_for_job_status(&toolbox, &job_id, &["running"]).await;

    let active = call_tool(&toolbox, "list_jobs", json!({"status": "active"})).await;
    assert_eq!(active["structuredContent"]["total"], 1);

    let cancelled = call_tool(&toolbox, "cancel_job", json!({"job_id": job_id})).await;
    assert_eq!(cancelled["isError"], false);
    assert_eq!(cancelled["structuredContent"]["acknowledged"], true);

    let listed = call_tool(&toolbox, "list_jobs", json!({"status": "cancelled"})).await;
    assert_eq!(listed["structuredContent"]["total"], 1);
    assert_eq!(listed["structuredContent"]["jobs"][0]["job_id"], job_id);

    let again = call_tool(&toolbox, "cancel_job", json!({"job_id": job_id})).await;
    assert_eq!(again["isError"], true);
    assert_eq!(again["structuredContent"]["kind"], "invalid_state");
    assert!(toolbox.manager().shutdown().await.len() <= 1);
}

#[tokio::test]
async fn integration_restarted_server_sees_and_repairs_previous_jobs() {
    let workspace = IsolatedWorkspace::new("restart");
    let completed_job_id = {
        let toolbox = workspace.toolbox();
        let submitted = call_tool(
            &toolbox,
            "submit_job",
            json!({"executable": "sh", "args": ["-c", "echo '{\"success\": true}'"]}),
        )
        .await;
        let job_id = submitted["structuredContent"]["job_id"]
            .as_str()
            .expect("job id")
            .to_string();
        wait_for_job_status(&toolbox, &job_id, &["completed"]).await;
        toolbox.manager().shutdown().await;
        job_id
    };

    // A record the previous server left running when it died.
    let store = JobStore::open(workspace.jobs_dir()).expect("store");
    let stale = JobRecord::new_pending(
        "stale-run",
        "stale",
        JobCommand::new("sh", vec!["-c".to_string(), "sleep 30".to_string()]),
        1,
        store.log_path("stale-run"),
        store.work_dir("stale-run"),
    );
    store.create(&stale).expect("create stale");
    store
        .update("stale-run", |record| record.mark_running(2))
        .expect("mark stale running");

    let toolbox = workspace.toolbox();
    let report = toolbox
        .manager()
        .recover_interrupted()
        .await
        .expect("recover");
    assert_eq!(report.failed, vec!["stale-run".to_string()]);
    assert!(report.relaunched.is_empty());

    let listed = call_tool(&toolbox, "list_jobs", json!({})).await;
    let jobs = listed["structuredContent"]["jobs"]
        .as_array()
        .expect("jobs")
        .clone();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0]["job_id"], "stale-run");
    assert_eq!(jobs[0]["status"], "failed");
    assert_eq!(jobs[0]["error"], "job interrupted by manager restart");
    assert_eq!(jobs[1]["job_id"], completed_job_id);
    assert_eq!(jobs[1]["status"], "completed");
    assert!(workspace.root().join("jobs").join("stale-run").join("work").is_dir());
}
