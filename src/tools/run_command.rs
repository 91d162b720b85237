use super::{Tool, ToolSpec};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const MAX_CAPTURE_BYTES: usize = 65_536;

pub struct RunCommand;

#[async_trait]
impl Tool for RunCommand {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "run_command".into(),
            description: "Run a shell command and capture its output".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "Command line to run via the shell" },
                    "cwd": { "type": "string", "description": "Working directory" },
                    "timeout_ms": { "type": "integer", "minimum": 1, "default": DEFAULT_TIMEOUT_MS }
                },
                "required": ["command"],
                "additionalProperties": false
            }),
            read_only: false,
        }
    }

    async fn call(&self, args: &Value) -> Result<Value> {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("missing 'command'"))?;
        let timeout_ms = args
            .get("timeout_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_TIMEOUT_MS);

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command);
        if let Some(cwd) = args.get("cwd").and_then(|v| v.as_str()) {
            cmd.current_dir(cwd);
        }

        let output = tokio::time::timeout(Duration::from_millis(timeout_ms), cmd.output())
            .await
            .map_err(|_| anyhow!("command timed out after {timeout_ms}ms"))??;

        Ok(json!({
            "status": output.status.code(),
            "stdout": clip(&output.stdout),
            "stderr": clip(&output.stderr),
        }))
    }
}

fn clip(bytes: &[u8]) -> String {
    let end = bytes.len().min(MAX_CAPTURE_BYTES);
    String::from_utf8_lossy(&bytes[..end]).to_string()
}
