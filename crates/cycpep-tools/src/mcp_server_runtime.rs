use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::job_tools::{job_tool_descriptors, JobToolbox};

pub const MCP_JSONRPC_VERSION: &str = "2.0";
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
pub const MCP_SERVER_NAME: &str = "cycpep-tools";
pub const MCP_ERROR_PARSE: i64 = -32700;
pub const MCP_ERROR_INVALID_REQUEST: i64 = -32600;
pub const MCP_ERROR_METHOD_NOT_FOUND: i64 = -32601;
pub const MCP_ERROR_INVALID_PARAMS: i64 = -32602;
const MCP_CONTENT_TYPE_TEXT: &str = "text";
const MCP_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Counters reported when the serve loop reaches end of input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct McpServeReport {
    pub processed_frames: usize,
    pub error_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct McpJsonRpcRequest {
    pub id: Value,
    pub method: String,
    pub params: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct McpDispatchError {
    pub id: Value,
    pub code: i64,
    pub message: String,
}

impl McpDispatchError {
    fn new(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            code,
            message: message.into(),
        }
    }
}

/// Serves MCP over the process stdin/stdout until stdin closes.
pub async fn serve_mcp_stdio(toolbox: &JobToolbox) -> Result<McpServeReport> {
    let mut reader = tokio::io::BufReader::new(tokio::io::stdin());
    let mut writer = tokio::io::stdout();
    serve_mcp_jsonrpc_reader(&mut reader, &mut writer, toolbox).await
}

/// Reads `Content-Length` framed JSON-RPC requests and answers each one.
///
/// Notifications get no response. A body that is not JSON is answered with a
/// parse error and serving continues; a broken header or a truncated body
/// ends the loop because the next frame boundary is unknown.
pub async fn serve_mcp_jsonrpc_reader<R, W>(
    reader: &mut R,
    writer: &mut W,
    toolbox: &JobToolbox,
) -> Result<McpServeReport>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut report = McpServeReport::default();

    loop {
        let body = match read_jsonrpc_content_length_body(reader).await {
            Ok(Some(body)) => body,
            Ok(None) => break,
            Err(error) => {
                let response = jsonrpc_error_frame(
                    Value::Null,
                    MCP_ERROR_PARSE,
                    format!("failed to read mcp frame: {error:#}"),
                );
                write_jsonrpc_content_length_frame(writer, &response).await?;
                report.error_count = report.error_count.saturating_add(1);
                break;
            }
        };
        report.processed_frames = report.processed_frames.saturating_add(1);
        let frame = match serde_json::from_slice::<Value>(&body) {
            Ok(frame) => frame,
            Err(error) => {
                let response = jsonrpc_error_frame(
                    Value::Null,
                    MCP_ERROR_PARSE,
                    format!("failed to parse mcp JSON frame: {error}"),
                );
                write_jsonrpc_content_length_frame(writer, &response).await?;
                report.error_count = report.error_count.saturating_add(1);
                continue;
            }
        };

        if is_jsonrpc_notification(&frame) {
            tracing::debug!(method = ?frame.get("method"), "ignoring mcp notification");
            continue;
        }

        let response = match parse_jsonrpc_request(&frame) {
            Ok(request) => match dispatch_jsonrpc_request(&request, toolbox).await {
                Ok(result) => jsonrpc_result_frame(request.id, result),
                Err(error) => {
                    report.error_count = report.error_count.saturating_add(1);
                    jsonrpc_error_frame(error.id, error.code, error.message)
                }
            },
            Err(error) => {
                report.error_count = report.error_count.saturating_add(1);
                jsonrpc_error_frame(error.id, error.code, error.message)
            }
        };
        write_jsonrpc_content_length_frame(writer, &response).await?;
    }

    Ok(report)
}

/// Validates the JSON-RPC envelope of one decoded frame.
pub fn parse_jsonrpc_request(value: &Value) -> Result<McpJsonRpcRequest, McpDispatchError> {
    let Some(object) = value.as_object() else {
        return Err(McpDispatchError::new(
            Value::Null,
            MCP_ERROR_INVALID_REQUEST,
            "jsonrpc request must be an object",
        ));
    };
    let id = object.get("id").cloned().ok_or_else(|| {
        McpDispatchError::new(
            Value::Null,
            MCP_ERROR_INVALID_REQUEST,
            "jsonrpc request must include id",
        )
    })?;
    let jsonrpc = object
        .get("jsonrpc")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if jsonrpc != MCP_JSONRPC_VERSION {
        return Err(McpDispatchError::new(
            id,
            MCP_ERROR_INVALID_REQUEST,
            format!("jsonrpc must be '{MCP_JSONRPC_VERSION}'"),
        ));
    }
    let method = object
        .get("method")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            McpDispatchError::new(
                id.clone(),
                MCP_ERROR_INVALID_REQUEST,
                "jsonrpc request must include non-empty method",
            )
        })?;
    let params = match object.get("params") {
        Some(Value::Object(params)) => params.clone(),
        Some(Value::Null) | None => serde_json::Map::new(),
        Some(_) => {
            return Err(McpDispatchError::new(
                id,
                MCP_ERROR_INVALID_PARAMS,
                "jsonrpc request params must be an object",
            ))
        }
    };
    Ok(McpJsonRpcRequest {
        id,
        method: method.to_string(),
        params,
    })
}

/// A request object carrying a method but no `id` is a notification.
fn is_jsonrpc_notification(value: &Value) -> bool {
    let Some(object) = value.as_object() else {
        return false;
    };
    !object.contains_key("id") && object.get("method").is_some_and(Value::is_string)
}

async fn dispatch_jsonrpc_request(
    request: &McpJsonRpcRequest,
    toolbox: &JobToolbox,
) -> Result<Value, McpDispatchError> {
    match request.method.as_str() {
        "initialize" => Ok(handle_initialize()),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(handle_tools_list()),
        "tools/call" => handle_tools_call(toolbox, &request.params)
            .await
            .map_err(|error| {
                McpDispatchError::new(
                    request.id.clone(),
                    MCP_ERROR_INVALID_PARAMS,
                    error.to_string(),
                )
            }),
        other => Err(McpDispatchError::new(
            request.id.clone(),
            MCP_ERROR_METHOD_NOT_FOUND,
            format!("unsupported method '{other}'"),
        )),
    }
}

fn handle_initialize() -> Value {
    json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "serverInfo": {
            "name": MCP_SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION")
        },
        "capabilities": {
            "tools": {
                "listChanged": false
            }
        }
    })
}

fn handle_tools_list() -> Value {
    json!({
        "tools": job_tool_descriptors()
            .into_iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": tool.input_schema
                })
            })
            .collect::<Vec<_>>()
    })
}

async fn handle_tools_call(
    toolbox: &JobToolbox,
    params: &serde_json::Map<String, Value>,
) -> Result<Value> {
    let tool_name = params
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow!("tools/call requires non-empty field 'name'"))?;
    let arguments = match params.get("arguments") {
        Some(Value::Object(arguments)) => Value::Object(arguments.clone()),
        Some(Value::Null) | None => Value::Object(serde_json::Map::new()),
        Some(_) => bail!("tools/call field 'arguments' must be an object when provided"),
    };

    let execution = toolbox.call(tool_name, &arguments).await?;
    Ok(mcp_tool_call_result(execution.content, execution.is_error))
}

fn mcp_tool_call_result(content: Value, is_error: bool) -> Value {
    let text = serde_json::to_string_pretty(&content)
        .unwrap_or_else(|_| "{\"error\":\"failed to serialize tool result\"}".to_string());
    json!({
        "content": [{
            "type": MCP_CONTENT_TYPE_TEXT,
            "text": text
        }],
        "isError": is_error,
        "structuredContent": content,
    })
}

/// Reads one framed message and decodes it; `Ok(None)` on a clean end of input.
pub async fn read_jsonrpc_content_length_frame<R>(reader: &mut R) -> Result<Option<Value>>
where
    R: AsyncBufRead + Unpin,
{
    let Some(body) = read_jsonrpc_content_length_body(reader).await? else {
        return Ok(None);
    };
    let value = serde_json::from_slice::<Value>(&body).context("failed to parse mcp JSON frame")?;
    Ok(Some(value))
}

/// Reads the raw body of one framed message without decoding it.
pub async fn read_jsonrpc_content_length_body<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;
    loop {
        let mut line = String::new();
        let bytes = reader
            .read_line(&mut line)
            .await
            .context("failed to read mcp frame header line")?;
        if bytes == 0 {
            if saw_header {
                bail!("unexpected eof while reading mcp frame headers");
            }
            return Ok(None);
        }
        saw_header = true;
        if line == "\n" || line == "\r\n" {
            break;
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let (name, value) = trimmed.split_once(':').ok_or_else(|| {
            anyhow!("invalid mcp header '{trimmed}': expected 'Name: value' format")
        })?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            let parsed = value
                .trim()
                .parse::<usize>()
                .context("invalid Content-Length header value")?;
            content_length = Some(parsed);
        }
    }

    let content_length =
        content_length.ok_or_else(|| anyhow!("mcp frame is missing Content-Length header"))?;
    if content_length > MCP_MAX_FRAME_BYTES {
        bail!("mcp frame of {content_length} bytes exceeds limit of {MCP_MAX_FRAME_BYTES} bytes");
    }
    let mut body = vec![0_u8; content_length];
    reader
        .read_exact(&mut body)
        .await
        .context("failed to read mcp frame body bytes")?;
    Ok(Some(body))
}

pub async fn write_jsonrpc_content_length_frame<W>(writer: &mut W, value: &Value) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded = serde_json::to_vec(value).context("failed to encode mcp jsonrpc response")?;
    writer
        .write_all(format!("Content-Length: {}\r\n\r\n", encoded.len()).as_bytes())
        .await
        .context("failed to write mcp frame header")?;
    writer
        .write_all(&encoded)
        .await
        .context("failed to write mcp frame body")?;
    writer
        .flush()
        .await
        .context("failed to flush mcp frame output")?;
    Ok(())
}

pub fn jsonrpc_request_frame(id: Value, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": MCP_JSONRPC_VERSION,
        "id": id,
        "method": method,
        "params": params,
    })
}

pub fn jsonrpc_result_frame(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": MCP_JSONRPC_VERSION,
        "id": id,
        "result": result,
    })
}

pub fn jsonrpc_error_frame(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": MCP_JSONRPC_VERSION,
        "id": id,
        "error": {
            "code": code,
            "message": message.into(),
        }
    })
}
