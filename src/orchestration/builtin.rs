//! Built-in operations available to every registry.
//!
//! - `noop`: succeeds with no outputs
//! - `echo`: succeeds with its inputs as outputs
//! - `sleep`: waits `ms` milliseconds, honoring cancellation
//! - `fail`: reports a runtime failure (`kind`, `message` inputs)
//! - `shell`: runs `command` through `sh -c` and captures its output

use futures::future::BoxFuture;
use serde_json::json;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::core::task::Payload;
use crate::orchestration::handler::{Handler, HandlerFault, HandlerOutput, HandlerRegistry, HandlerResult};

pub fn register_builtins(registry: &mut HandlerRegistry) {
    registry
        .register("noop", NoopHandler)
        .register("echo", EchoHandler)
        .register("sleep", SleepHandler)
        .register("fail", FailHandler)
        .register("shell", ShellHandler);
}

pub struct NoopHandler;

impl Handler for NoopHandler {
    fn execute(&self, _inputs: Payload, _cancel: CancellationToken) -> BoxFuture<'_, HandlerResult> {
        Box::pin(async { Ok(HandlerOutput::ok(Payload::new())) })
    }
}

pub struct EchoHandler;

impl Handler for EchoHandler {
    fn execute(&self, inputs: Payload, _cancel: CancellationToken) -> BoxFuture<'_, HandlerResult> {
        Box::pin(async move { Ok(HandlerOutput::ok(inputs)) })
    }
}

pub struct SleepHandler;

impl Handler for SleepHandler {
    fn execute(&self, inputs: Payload, cancel: CancellationToken) -> BoxFuture<'_, HandlerResult> {
        Box::pin(async move {
            let ms = inputs.get("ms").and_then(|v| v.as_u64()).unwrap_or(0);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                    let mut out = Payload::new();
                    out.insert("slept_ms".to_string(), json!(ms));
                    Ok(HandlerOutput::ok(out))
                }
                _ = cancel.cancelled() => Ok(HandlerOutput::failed("cancelled", "sleep interrupted")),
            }
        })
    }
}

pub struct FailHandler;

impl Handler for FailHandler {
    fn execute(&self, inputs: Payload, _cancel: CancellationToken) -> BoxFuture<'_, HandlerResult> {
        Box::pin(async move {
            let kind = inputs
                .get("kind")
                .and_then(|v| v.as_str())
                .unwrap_or("failure");
            let message = inputs
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("requested failure");
            Ok(HandlerOutput::failed(kind, message))
        })
    }
}

pub struct ShellHandler;

impl Handler for ShellHandler {
    fn execute(&self, inputs: Payload, cancel: CancellationToken) -> BoxFuture<'_, HandlerResult> {
        Box::pin(async move {
            let command = inputs
                .get("command")
                .and_then(|v| v.as_str())
                .ok_or_else(|| HandlerFault::new("shell: missing string input `command`"))?;

            let mut cmd = Command::new("sh");
            cmd.arg("-c")
                .arg(command)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            if let Some(dir) = inputs.get("cwd").and_then(|v| v.as_str()) {
                cmd.current_dir(dir);
            }

            let child = cmd
                .spawn()
                .map_err(|e| HandlerFault::new(format!("shell: spawn failed: {}", e)))?;

            let output = tokio::select! {
                result = child.wait_with_output() => result,
                _ = cancel.cancelled() => {
                    return Ok(HandlerOutput::failed("cancelled", "shell command cancelled"));
                }
            };

            let output = match output {
                Ok(output) => output,
                Err(e) => return Ok(HandlerOutput::failed("io", e.to_string())),
            };

            let mut out = Payload::new();
            out.insert(
                "stdout".to_string(),
                json!(String::from_utf8_lossy(&output.stdout).into_owned()),
            );
            out.insert(
                "stderr".to_string(),
                json!(String::from_utf8_lossy(&output.stderr).into_owned()),
            );
            out.insert("exit_code".to_string(), json!(output.status.code()));

            if output.status.success() {
                Ok(HandlerOutput::ok(out))
            } else {
                let mut failed = HandlerOutput::failed(
                    "exit_status",
                    format!("command exited with {}", output.status),
                );
                failed.outputs = out;
                Ok(failed)
            }
        })
    }
}
