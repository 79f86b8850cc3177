//! In-process isolation: the executor runs on its own task.

use serde_json::Value;
use tokio::task::{AbortHandle, JoinError};
use voldrive_shared::errors::{VoldriveError, VoldriveResult};
use voldrive_shared::executor::ExecutorOp;

use super::{ExecutorRegistry, execute};
use crate::config::Config;
use crate::context::Context;

/// Aborts the task when the invocation future is dropped early.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub(super) async fn run(
    registry: &ExecutorRegistry,
    ctx: &Context,
    driver: &str,
    config: Config,
    op: ExecutorOp,
) -> VoldriveResult<Value> {
    let executor = registry.new_executor(driver)?;
    let operation = op.name();

    let task_ctx = ctx.clone();
    let mut task = tokio::spawn(async move {
        execute(executor.as_ref(), &task_ctx, &config, &op).await
    });
    let _guard = AbortOnDrop(task.abort_handle());

    let joined = tokio::select! {
        biased;
        _ = ctx.done() => None,
        joined = &mut task => Some(joined),
    };

    match joined {
        Some(Ok(result)) => result,
        Some(Err(e)) => Err(join_error(driver, operation, e)),
        None => {
            task.abort();
            // Wait for the abort to land so nothing keeps running.
            let _ = task.await;
            Err(ctx
                .err_for(&format!("executor {} {}", driver, operation))
                .unwrap_or_else(|| VoldriveError::Cancelled(driver.to_string())))
        }
    }
}

fn join_error(driver: &str, operation: &str, e: JoinError) -> VoldriveError {
    let diagnostics = if e.is_panic() {
        let payload = e.into_panic();
        payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string())
    } else {
        e.to_string()
    };
    VoldriveError::ExecutorFailed {
        executor: driver.to_string(),
        operation: operation.to_string(),
        status: None,
        message: "executor task did not complete".to_string(),
        diagnostics,
    }
}
