//! Dispatch of executor operations across the isolation boundary.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use voldrive_shared::errors::{VoldriveError, VoldriveResult};
use voldrive_shared::executor::{
    DeviceScanType, ExecutorInvocation, ExecutorOp, InstanceId, InvocationContext, LocalDevices,
};

use super::{EXECUTOR_BINARY, ExecutorRegistry, in_process, process};
use crate::config::{Config, keys};
use crate::context::Context;
use crate::metrics::RouterMetricsStorage;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Where executor operations run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Isolation {
    /// A `voldrive-executor` child process per invocation.
    #[default]
    Process,
    /// A separately spawned task in this process.
    InProcess,
}

impl FromStr for Isolation {
    type Err = VoldriveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" => Ok(Self::Process),
            "inprocess" | "in_process" | "in-process" => Ok(Self::InProcess),
            other => Err(VoldriveError::InvalidConfig(format!(
                "{}: unknown isolation '{}', expected process or inprocess",
                keys::EXECUTOR_ISOLATION,
                other
            ))),
        }
    }
}

impl std::fmt::Display for Isolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Process => f.write_str("process"),
            Self::InProcess => f.write_str("inprocess"),
        }
    }
}

/// Program started for process isolation. The invocation goes to its stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ExecutorCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

pub struct ExecutorDispatcher {
    registry: Arc<ExecutorRegistry>,
    isolation: Isolation,
    /// `None` locates `voldrive-executor` at invocation time.
    command: Option<ExecutorCommand>,
    default_timeout: Duration,
    metrics: Arc<RouterMetricsStorage>,
}

impl ExecutorDispatcher {
    pub fn new(registry: Arc<ExecutorRegistry>, isolation: Isolation) -> Self {
        Self {
            registry,
            isolation,
            command: None,
            default_timeout: DEFAULT_TIMEOUT,
            metrics: Arc::new(RouterMetricsStorage::new()),
        }
    }

    /// Isolation, executor path and default timeout from `libvol.executor.*`.
    pub fn from_config(registry: Arc<ExecutorRegistry>, config: &Config) -> VoldriveResult<Self> {
        let isolation = match config.get_string(keys::EXECUTOR_ISOLATION) {
            Some(s) if !s.is_empty() => s.parse()?,
            _ => Isolation::default(),
        };
        let mut dispatcher = Self::new(registry, isolation);
        if let Some(path) = config.get_string(keys::EXECUTOR_PATH).filter(|p| !p.is_empty()) {
            dispatcher = dispatcher.with_command(ExecutorCommand::new(path));
        }
        if let Some(timeout) = config.get_duration_ms(keys::EXECUTOR_TIMEOUT)? {
            dispatcher = dispatcher.with_default_timeout(timeout);
        }
        Ok(dispatcher)
    }

    pub fn with_command(mut self, command: ExecutorCommand) -> Self {
        self.command = Some(command);
        self
    }

    /// Bound applied when the request context carries no deadline.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<RouterMetricsStorage>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    /// Run `op` with the executor bound to `driver`.
    ///
    /// `config` is the driver's configuration scope; its snapshot travels
    /// with the invocation. Returns `DeadlineExceeded` or `Cancelled` when
    /// the context ends first, after the work has been stopped.
    pub async fn invoke(
        &self,
        ctx: &Context,
        driver: &str,
        config: &Config,
        op: ExecutorOp,
    ) -> VoldriveResult<Value> {
        if !self.registry.contains(driver) {
            return Err(VoldriveError::NotFound(format!("executor {}", driver)));
        }

        let (ctx, _cancel) = match ctx.deadline() {
            Some(_) => ctx.with_cancel(),
            None => ctx.with_timeout(self.default_timeout),
        };
        let operation = op.name();

        tracing::debug!(
            executor = %driver,
            operation,
            isolation = %self.isolation,
            tx = ?ctx.transaction_id().map(|t| t.as_str()),
            timeout_ms = ?ctx.remaining().map(|d| d.as_millis()),
            "Invoking executor"
        );

        let result = match self.isolation {
            Isolation::Process => {
                let invocation = ExecutorInvocation {
                    executor: driver.to_string(),
                    operation: op,
                    context: invocation_context(&ctx),
                    config: config.snapshot(),
                };
                let command = self.command()?;
                process::run(&command, &ctx, &invocation).await
            }
            Isolation::InProcess => {
                in_process::run(&self.registry, &ctx, driver, config.clone(), op).await
            }
        };

        let timed_out = matches!(result, Err(VoldriveError::DeadlineExceeded(_)));
        self.metrics.record_invocation(result.is_err(), timed_out);
        match &result {
            Ok(_) => tracing::debug!(executor = %driver, operation, "Executor completed"),
            Err(e) => tracing::warn!(executor = %driver, operation, error = %e, "Executor failed"),
        }
        result
    }

    fn command(&self) -> VoldriveResult<ExecutorCommand> {
        match &self.command {
            Some(command) => Ok(command.clone()),
            None => crate::util::find_binary(EXECUTOR_BINARY).map(ExecutorCommand::new),
        }
    }
}

impl std::fmt::Debug for ExecutorDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorDispatcher")
            .field("isolation", &self.isolation)
            .field("command", &self.command)
            .field("default_timeout", &self.default_timeout)
            .field("executors", &self.registry.names())
            .finish()
    }
}

fn invocation_context(ctx: &Context) -> InvocationContext {
    InvocationContext {
        transaction_id: ctx.transaction_id().map(|t| t.to_string()),
        timeout_ms: ctx.remaining().map(|d| d.as_millis() as u64),
        log_level: ctx.log_level().map(|l| l.to_string().to_lowercase()),
    }
}

/// A dispatcher bound to one driver and its configuration scope.
///
/// The router places one in every request context under
/// [`keys::EXECUTOR`](crate::context::keys::EXECUTOR).
#[derive(Clone)]
pub struct ExecutorHandle {
    dispatcher: Arc<ExecutorDispatcher>,
    driver: String,
    config: Config,
}

impl ExecutorHandle {
    pub fn new(dispatcher: Arc<ExecutorDispatcher>, driver: impl Into<String>, config: Config) -> Self {
        Self {
            dispatcher,
            driver: driver.into(),
            config,
        }
    }

    pub fn driver(&self) -> &str {
        &self.driver
    }

    pub async fn invoke(&self, ctx: &Context, op: ExecutorOp) -> VoldriveResult<Value> {
        self.dispatcher
            .invoke(ctx, &self.driver, &self.config, op)
            .await
    }

    async fn invoke_as<T: DeserializeOwned>(&self, ctx: &Context, op: ExecutorOp) -> VoldriveResult<T> {
        let operation = op.name();
        let value = self.invoke(ctx, op).await?;
        serde_json::from_value(value).map_err(|e| {
            VoldriveError::Serialization(format!(
                "executor {} {} result: {}",
                self.driver, operation, e
            ))
        })
    }

    pub async fn supported(&self, ctx: &Context) -> VoldriveResult<bool> {
        self.invoke_as(ctx, ExecutorOp::Supported).await
    }

    pub async fn instance_id(&self, ctx: &Context) -> VoldriveResult<InstanceId> {
        self.invoke_as(ctx, ExecutorOp::InstanceId).await
    }

    pub async fn next_device(&self, ctx: &Context) -> VoldriveResult<Option<String>> {
        self.invoke_as(ctx, ExecutorOp::NextDevice).await
    }

    pub async fn local_devices(&self, ctx: &Context, scan: DeviceScanType) -> VoldriveResult<LocalDevices> {
        self.invoke_as(ctx, ExecutorOp::LocalDevices { scan }).await
    }

    pub async fn mount(
        &self,
        ctx: &Context,
        device: &str,
        target: &Path,
        read_only: bool,
    ) -> VoldriveResult<()> {
        let op = ExecutorOp::Mount {
            device: device.to_string(),
            target: target.to_path_buf(),
            read_only,
        };
        self.invoke(ctx, op).await.map(|_| ())
    }

    pub async fn unmount(&self, ctx: &Context, target: &Path) -> VoldriveResult<()> {
        let op = ExecutorOp::Unmount {
            target: target.to_path_buf(),
        };
        self.invoke(ctx, op).await.map(|_| ())
    }
}

impl std::fmt::Debug for ExecutorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorHandle")
            .field("driver", &self.driver)
            .field("isolation", &self.dispatcher.isolation)
            .finish()
    }
}
