//! One-shot Model Context Protocol tool calls over a child's stdio.
//!
//! Spawns the configured server, performs the MCP initialize handshake,
//! issues a single `tools/call` and returns the server's JSON response
//! object. The whole exchange is bounded by one timeout.

use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use serde_json::json;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Command;
use tracing::debug;

use crate::config::McpServerConfig;

pub const MCP_CALL_TIMEOUT: Duration = Duration::from_secs(25);
const PROTOCOL_VERSION: &str = "2025-03-26";

/// Call `tool` on the configured server with `args`. Errors are
/// model-facing strings.
pub async fn mcp_call(
    server_name: &str,
    config: &McpServerConfig,
    tool: &str,
    args: Value,
) -> Result<Value, String> {
    tokio::time::timeout(MCP_CALL_TIMEOUT, exchange(server_name, config, tool, args))
        .await
        .map_err(|_| {
            format!(
                "MCP call to {server_name}/{tool} timed out after {}s",
                MCP_CALL_TIMEOUT.as_secs()
            )
        })?
}

async fn exchange(
    server_name: &str,
    config: &McpServerConfig,
    tool: &str,
    args: Value,
) -> Result<Value, String> {
    let mut child = Command::new(&config.command)
        .args(&config.args)
        .envs(&config.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn MCP server {server_name}: {e}"))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| format!("MCP server {server_name}: stdin not captured"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| format!("MCP server {server_name}: stdout not captured"))?;
    let mut reader = BufReader::new(stdout).lines();

    let initialize = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "pilot", "version": env!("CARGO_PKG_VERSION")},
        }
    });
    send_line(&mut stdin, &initialize, server_name).await?;
    let init_response = read_response(&mut reader, 1, server_name).await?;
    debug!("MCP {server_name} initialized: {init_response}");

    let initialized = json!({
        "jsonrpc": "2.0",
        "method": "notifications/initialized",
    });
    send_line(&mut stdin, &initialized, server_name).await?;

    let call = json!({
        "jsonrpc": "2.0",
        "id": 2,
        "method": "tools/call",
        "params": {"name": tool, "arguments": args},
    });
    send_line(&mut stdin, &call, server_name).await?;
    let response = read_response(&mut reader, 2, server_name).await?;

    let _ = child.start_kill();

    if let Some(error) = response.get("error") {
        return Err(format!("MCP server {server_name} returned an error: {error}"));
    }
    Ok(response.get("result").cloned().unwrap_or(Value::Null))
}

async fn send_line(
    stdin: &mut tokio::process::ChildStdin,
    message: &Value,
    server_name: &str,
) -> Result<(), String> {
    let mut line = message.to_string();
    line.push('\n');
    stdin
        .write_all(line.as_bytes())
        .await
        .map_err(|e| format!("failed to write to MCP server {server_name}: {e}"))
}

/// Read JSON-RPC lines until the one with the matching id arrives;
/// notifications and unrelated responses are skipped.
async fn read_response(
    reader: &mut tokio::io::Lines<BufReader<tokio::process::ChildStdout>>,
    id: u64,
    server_name: &str,
) -> Result<Value, String> {
    loop {
        let line = reader
            .next_line()
            .await
            .map_err(|e| format!("failed to read from MCP server {server_name}: {e}"))?
            .ok_or_else(|| format!("MCP server {server_name} closed its stdout"))?;
        if line.trim().is_empty() {
            continue;
        }
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        if message.get("id").and_then(Value::as_u64) == Some(id) {
            return Ok(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A stub server written in shell: replies to the two requests the
    /// client sends, in order.
    fn stub_server() -> McpServerConfig {
        McpServerConfig {
            command: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                concat!(
                    "read line; printf '%s\\n' '{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}'; ",
                    "read line; read line; ",
                    "printf '%s\\n' '{\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"content\":[{\"type\":\"text\",\"text\":\"pong\"}]}}'"
                )
                .to_string(),
            ],
            env: Default::default(),
        }
    }

    #[tokio::test]
    async fn handshake_and_call_round_trip() {
        let result = mcp_call("stub", &stub_server(), "ping", json!({}))
            .await
            .expect("call");
        assert_eq!(
            result.pointer("/content/0/text").and_then(Value::as_str),
            Some("pong")
        );
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let config = McpServerConfig {
            command: "definitely-not-a-real-binary".to_string(),
            args: Vec::new(),
            env: Default::default(),
        };
        let err = mcp_call("ghost", &config, "x", json!({})).await.expect_err("err");
        assert!(err.contains("failed to spawn"));
    }
}
