//! Process isolation: one `voldrive-executor` child per invocation.
//!
//! The invocation is written as JSON to the child's stdin, the response is
//! read as JSON from its stdout, and stderr is kept as diagnostics. Each
//! child leads its own process group. When the context ends first, the whole
//! group is killed and the child reaped before `run` returns.

use std::process::{ExitStatus, Stdio};

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use voldrive_shared::errors::{VoldriveError, VoldriveResult};
use voldrive_shared::executor::{ExecutorInvocation, ExecutorResponse, ExecutorStatus, WireError};

use super::ExecutorCommand;
use crate::config::env::vars;
use crate::context::Context;
use crate::util::kill_process_group;

/// Diagnostics kept from stderr.
const MAX_DIAGNOSTICS: usize = 16 * 1024;

pub(super) async fn run(
    command: &ExecutorCommand,
    ctx: &Context,
    invocation: &ExecutorInvocation,
) -> VoldriveResult<Value> {
    let executor = invocation.executor.as_str();
    let operation = invocation.operation.name();
    let payload = serde_json::to_vec(invocation)?;

    let mut child = spawn(command, ctx, executor, operation)?;
    let pid = child.id();
    let mut group = GroupGuard(pid);
    tracing::debug!(
        executor,
        operation,
        pid = ?pid,
        program = %command.program.display(),
        "Spawned executor process"
    );

    let outcome = {
        let exchange = exchange(&mut child, payload);
        tokio::select! {
            biased;
            _ = ctx.done() => None,
            result = exchange => Some(result),
        }
    };

    let (status, stdout, stderr) = match outcome {
        Some(result) => result.map_err(|e| failed(executor, operation, None, e.to_string(), String::new()))?,
        None => {
            group.kill();
            // kill() sends SIGKILL and waits, so the child is reaped here.
            if let Err(e) = child.kill().await {
                tracing::debug!(executor, operation, pid = ?pid, error = %e, "Executor process already gone");
            }
            tracing::warn!(executor, operation, pid = ?pid, "Executor process stopped by context");
            return Err(ctx
                .err_for(&format!("executor {} {}", executor, operation))
                .unwrap_or_else(|| VoldriveError::Cancelled(executor.to_string())));
        }
    };

    group.disarm();

    let diagnostics = truncate(String::from_utf8_lossy(&stderr).into_owned());
    let code = status.code();

    match serde_json::from_slice::<ExecutorResponse>(&stdout) {
        Ok(response) if status.success() => response.into_result(executor, operation, code, diagnostics),
        Ok(mut response) => {
            // A non-zero exit fails the call whatever the payload claimed.
            response.status = ExecutorStatus::Failed;
            if response.error.is_none() {
                response.error = Some(WireError {
                    kind: "internal".to_string(),
                    message: describe(status),
                });
            }
            response.into_result(executor, operation, code, diagnostics)
        }
        Err(e) if status.success() => Err(failed(
            executor,
            operation,
            code,
            format!("unreadable response: {}", e),
            diagnostics,
        )),
        Err(_) => Err(failed(executor, operation, code, describe(status), diagnostics)),
    }
}

fn spawn(
    command: &ExecutorCommand,
    ctx: &Context,
    executor: &str,
    operation: &str,
) -> VoldriveResult<Child> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args);

    // The child rebuilds its paths from the environment.
    if let Some(paths) = ctx.path_config() {
        cmd.env(vars::VOLDRIVE_HOME, &paths.home);
        cmd.env(vars::LIBVOL_HOME, &paths.home);
        cmd.env(vars::APP_TOKEN, &paths.token);
    }

    // Pass RUST_LOG to the child if set
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        cmd.env("RUST_LOG", rust_log);
    }

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    cmd.process_group(0);

    cmd.spawn().map_err(|e| {
        let message = format!(
            "failed to spawn executor at {}: {}",
            command.program.display(),
            e
        );
        tracing::error!("{}", message);
        failed(executor, operation, None, message, String::new())
    })
}

/// Kills the child's process group on drop unless disarmed. A `run` dropped
/// mid-flight still takes the executor's descendants down with it.
struct GroupGuard(Option<u32>);

impl GroupGuard {
    fn kill(&mut self) {
        if let Some(pgid) = self.0.take() {
            if let Err(e) = kill_process_group(pgid) {
                tracing::warn!(pgid, error = %e, "Failed to kill executor process group");
            }
        }
    }

    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Feed stdin, drain both output pipes, wait for exit.
async fn exchange(
    child: &mut Child,
    payload: Vec<u8>,
) -> std::io::Result<(ExitStatus, Vec<u8>, Vec<u8>)> {
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let write = async move {
        if let Some(mut stdin) = stdin {
            // A child that exits without reading its input is not an error here.
            match stdin.write_all(&payload).await {
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e),
                _ => {}
            }
            let _ = stdin.shutdown().await;
        }
        Ok(())
    };

    let (written, out, err) = tokio::join!(write, read_all(stdout), read_all(stderr));
    written?;
    let (out, err) = (out?, err?);
    let status = child.wait().await?;
    Ok((status, out, err))
}

async fn read_all<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

fn failed(
    executor: &str,
    operation: &str,
    status: Option<i32>,
    message: String,
    diagnostics: String,
) -> VoldriveError {
    VoldriveError::ExecutorFailed {
        executor: executor.to_string(),
        operation: operation.to_string(),
        status,
        message,
        diagnostics,
    }
}

fn describe(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("executor exited with status {}", code),
        None => format!("executor terminated: {}", status),
    }
}

fn truncate(mut s: String) -> String {
    if s.len() > MAX_DIAGNOSTICS {
        let mut cut = MAX_DIAGNOSTICS;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push_str("...");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use voldrive_shared::executor::{ExecutorOp, InvocationContext};

    fn invocation() -> ExecutorInvocation {
        ExecutorInvocation {
            executor: "stub".into(),
            operation: ExecutorOp::Supported,
            context: InvocationContext::default(),
            config: Default::default(),
        }
    }

    fn sh(script: &str) -> ExecutorCommand {
        ExecutorCommand::new("/bin/sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_ok_response() {
        let cmd = sh(r#"cat >/dev/null; echo '{"status":"ok","result":true}'"#);
        let value = run(&cmd, &Context::background(), &invocation()).await.unwrap();
        assert_eq!(value, Value::Bool(true));
    }

    #[tokio::test]
    async fn test_child_sees_invocation_on_stdin() {
        let cmd = sh(r#"input=$(cat); printf '{"status":"ok","result":%s}' "$input""#);
        let value = run(&cmd, &Context::background(), &invocation()).await.unwrap();
        assert_eq!(value["executor"], "stub");
        assert_eq!(value["operation"]["op"], "supported");
    }

    #[tokio::test]
    async fn test_failed_response_carries_status_and_stderr() {
        let cmd = sh(
            r#"cat >/dev/null; echo "device busy" >&2; echo '{"status":"failed","error":{"kind":"storage","message":"busy"}}'; exit 1"#,
        );
        let err = run(&cmd, &Context::background(), &invocation()).await.unwrap_err();
        match err {
            VoldriveError::ExecutorFailed {
                status,
                message,
                diagnostics,
                ..
            } => {
                assert_eq!(status, Some(1));
                assert_eq!(message, "busy");
                assert!(diagnostics.contains("device busy"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit_without_response() {
        let cmd = sh("exit 3");
        let err = run(&cmd, &Context::background(), &invocation()).await.unwrap_err();
        assert!(matches!(
            err,
            VoldriveError::ExecutorFailed { status: Some(3), .. }
        ));
    }

    #[tokio::test]
    async fn test_garbage_output() {
        let cmd = sh("cat >/dev/null; echo not-json");
        let err = run(&cmd, &Context::background(), &invocation()).await.unwrap_err();
        assert!(matches!(
            err,
            VoldriveError::ExecutorFailed { ref message, .. } if message.contains("unreadable")
        ));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let cmd = ExecutorCommand::new("/nonexistent/voldrive-executor");
        let err = run(&cmd, &Context::background(), &invocation()).await.unwrap_err();
        assert!(matches!(err, VoldriveError::ExecutorFailed { status: None, .. }));
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        let long = "é".repeat(MAX_DIAGNOSTICS);
        let cut = truncate(long);
        assert!(cut.ends_with("..."));
        assert!(cut.len() <= MAX_DIAGNOSTICS + 3);
    }
}
