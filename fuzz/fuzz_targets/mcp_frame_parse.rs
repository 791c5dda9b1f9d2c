#![no_main]

use cycpep_tools::{
    jsonrpc_error_frame, parse_jsonrpc_request, read_jsonrpc_content_length_frame,
    MCP_ERROR_PARSE, MCP_JSONRPC_VERSION,
};
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

fuzz_target!(|data: &[u8]| {
    let Ok(runtime) = tokio::runtime::Builder::new_current_thread().build() else {
        return;
    };
    runtime.block_on(async {
        let mut reader = tokio::io::BufReader::new(data);
        loop {
            match read_jsonrpc_content_length_frame(&mut reader).await {
                Ok(Some(frame)) => match parse_jsonrpc_request(&frame) {
                    Ok(request) => {
                        assert!(!request.method.trim().is_empty());
                        assert_eq!(request.method, request.method.trim());
                    }
                    Err(error) => {
                        assert!(error.code < 0);
                        let response = jsonrpc_error_frame(error.id, error.code, error.message);
                        assert_eq!(response["jsonrpc"], MCP_JSONRPC_VERSION);
                    }
                },
                Ok(None) => break,
                Err(error) => {
                    let response =
                        jsonrpc_error_frame(Value::Null, MCP_ERROR_PARSE, error.to_string());
                    assert!(response["error"]["message"].is_string());
                    break;
                }
            }
        }
    });
});
