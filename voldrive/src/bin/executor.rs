//! `voldrive-executor`: runs one executor operation per process.
//!
//! Reads an `ExecutorInvocation` as JSON from stdin and writes an
//! `ExecutorResponse` as JSON to stdout. Logs go to stderr, which the
//! dispatcher keeps as diagnostics. Exit status: 0 ok, 1 operation failed,
//! 2 unusable invocation.

use std::io::{Read, Write};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context as _;
use tracing::level_filters::LevelFilter;
use voldrive::config::{Config, EnvSnapshot};
use voldrive::context::{Context, TransactionId, keys};
use voldrive::executor::{ExecutorRegistry, execute};
use voldrive::logging::{init_stderr_logging, parse_level};
use voldrive::paths::PathConfig;
use voldrive::registry::OverridePolicy;
use voldrive_shared::errors::VoldriveError;
use voldrive_shared::executor::{ExecutorInvocation, ExecutorResponse, exit_codes};

fn main() -> ExitCode {
    let invocation = match read_invocation() {
        Ok(invocation) => invocation,
        Err(e) => {
            eprintln!("voldrive-executor: {:#}", e);
            let err = VoldriveError::InvalidArgument(format!("{:#}", e));
            return respond(&ExecutorResponse::failed(&err), exit_codes::BAD_INVOCATION);
        }
    };

    let level = invocation
        .context
        .log_level
        .as_deref()
        .and_then(parse_level)
        .unwrap_or(LevelFilter::WARN);
    init_stderr_logging(level);

    let registry = match ExecutorRegistry::linked(OverridePolicy::Reject) {
        Ok(mut registry) => {
            registry.seal();
            registry
        }
        Err(e) => return respond(&ExecutorResponse::failed(&e), exit_codes::BAD_INVOCATION),
    };
    let executor = match registry.new_executor(&invocation.executor) {
        Ok(executor) => executor,
        Err(e) => {
            tracing::error!(executor = %invocation.executor, error = %e, "Unknown executor");
            return respond(&ExecutorResponse::failed(&e), exit_codes::BAD_INVOCATION);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let err = VoldriveError::Internal(format!("tokio runtime: {}", e));
            return respond(&ExecutorResponse::failed(&err), exit_codes::FAILED);
        }
    };

    let operation = invocation.operation.name();
    let result = runtime.block_on(async {
        let (ctx, _cancel) = root_context(&invocation);
        let config = Config::from_snapshot(invocation.config.clone());
        tracing::debug!(
            executor = %invocation.executor,
            operation,
            tx = ?ctx.transaction_id().map(|t| t.as_str()),
            "Executing"
        );
        ctx.run(
            operation,
            execute(executor.as_ref(), &ctx, &config, &invocation.operation),
        )
        .await
    });

    match result {
        Ok(value) => respond(&ExecutorResponse::ok(value), exit_codes::OK),
        Err(e) => {
            tracing::warn!(executor = %invocation.executor, operation, error = %e, "Operation failed");
            respond(&ExecutorResponse::failed(&e), exit_codes::FAILED)
        }
    }
}

fn read_invocation() -> anyhow::Result<ExecutorInvocation> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("reading invocation from stdin")?;
    serde_json::from_str(&input).context("parsing invocation")
}

/// Context carrying the caller's transaction id, remaining time and paths.
fn root_context(invocation: &ExecutorInvocation) -> (Context, Option<voldrive::CancelHandle>) {
    let mut ctx = Context::background();
    if let Some(id) = &invocation.context.transaction_id {
        ctx = ctx.with_transaction_id(TransactionId::from(id.clone()));
    }
    match PathConfig::from_env(&EnvSnapshot::from_process().with_aliases()) {
        Ok(paths) => ctx = ctx.with_value(keys::PATH_CONFIG, paths),
        Err(e) => tracing::warn!(error = %e, "No path configuration"),
    }
    match invocation.context.timeout_ms {
        Some(ms) => {
            let (ctx, cancel) = ctx.with_timeout(Duration::from_millis(ms));
            (ctx, Some(cancel))
        }
        None => (ctx, None),
    }
}

fn respond(response: &ExecutorResponse, code: i32) -> ExitCode {
    let mut stdout = std::io::stdout().lock();
    let written = serde_json::to_writer(&mut stdout, response)
        .map_err(std::io::Error::from)
        .and_then(|()| stdout.write_all(b"\n"))
        .and_then(|()| stdout.flush());
    if let Err(e) = written {
        eprintln!("voldrive-executor: cannot write response: {}", e);
    }
    ExitCode::from(code as u8)
}
