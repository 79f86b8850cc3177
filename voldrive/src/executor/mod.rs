//! Host-local executors.
//!
//! An executor is the privileged half of a backend. It runs on the host that
//! consumes storage and performs device and filesystem work (identify the
//! host, find devices, mount, unmount). The orchestrating process reaches it
//! only through the [`ExecutorDispatcher`], either in a child process or on a
//! separate task.

mod dispatcher;
mod in_process;
mod process;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use voldrive_shared::errors::{VoldriveError, VoldriveResult};
use voldrive_shared::executor::{DeviceScanType, ExecutorOp, InstanceId, LocalDevices};

use crate::config::Config;
use crate::context::Context;
use crate::registry::{OverridePolicy, Registry};

pub use dispatcher::{ExecutorCommand, ExecutorDispatcher, ExecutorHandle, Isolation};

pub const EXECUTOR_BINARY: &str = "voldrive-executor";

/// Capability surface of a host-local executor.
///
/// Operations must be idempotent: the dispatcher does not deduplicate
/// concurrent identical invocations.
#[async_trait]
pub trait StorageExecutor: Send + Sync {
    fn name(&self) -> &str;

    async fn init(&self, ctx: &Context, config: &Config) -> VoldriveResult<()>;

    /// Whether the executor can do its work on this host.
    async fn supported(&self, ctx: &Context) -> VoldriveResult<bool>;

    async fn instance_id(&self, ctx: &Context) -> VoldriveResult<InstanceId>;

    async fn next_device(&self, _ctx: &Context) -> VoldriveResult<Option<String>> {
        Ok(None)
    }

    async fn local_devices(&self, ctx: &Context, scan: DeviceScanType)
    -> VoldriveResult<LocalDevices>;

    async fn mount(
        &self,
        _ctx: &Context,
        device: &str,
        _target: &Path,
        _read_only: bool,
    ) -> VoldriveResult<()> {
        Err(VoldriveError::Unsupported(format!(
            "executor {} cannot mount {}",
            self.name(),
            device
        )))
    }

    async fn unmount(&self, _ctx: &Context, target: &Path) -> VoldriveResult<()> {
        Err(VoldriveError::Unsupported(format!(
            "executor {} cannot unmount {}",
            self.name(),
            target.display()
        )))
    }
}

/// Initialize `executor` with `config` and run `op`, returning its JSON result.
pub async fn execute(
    executor: &dyn StorageExecutor,
    ctx: &Context,
    config: &Config,
    op: &ExecutorOp,
) -> VoldriveResult<Value> {
    executor.init(ctx, config).await?;

    let value = match op {
        ExecutorOp::Supported => serde_json::to_value(executor.supported(ctx).await?)?,
        ExecutorOp::InstanceId => serde_json::to_value(executor.instance_id(ctx).await?)?,
        ExecutorOp::NextDevice => serde_json::to_value(executor.next_device(ctx).await?)?,
        ExecutorOp::LocalDevices { scan } => {
            serde_json::to_value(executor.local_devices(ctx, *scan).await?)?
        }
        ExecutorOp::Mount {
            device,
            target,
            read_only,
        } => {
            executor.mount(ctx, device, target, *read_only).await?;
            Value::Null
        }
        ExecutorOp::Unmount { target } => {
            executor.unmount(ctx, target).await?;
            Value::Null
        }
    };
    Ok(value)
}

pub type ExecutorConstructor = Arc<dyn Fn() -> Box<dyn StorageExecutor> + Send + Sync>;

/// Executor contributed by a linked backend module, keyed by driver name.
pub struct ExecutorRegistration {
    pub name: &'static str,
    pub constructor: fn() -> Box<dyn StorageExecutor>,
}

inventory::collect!(ExecutorRegistration);

pub struct ExecutorRegistry {
    inner: Registry<ExecutorConstructor>,
}

impl ExecutorRegistry {
    pub fn new(policy: OverridePolicy) -> Self {
        Self {
            inner: Registry::new("executor", policy),
        }
    }

    pub fn linked(policy: OverridePolicy) -> VoldriveResult<Self> {
        let mut registry = Self::new(policy);
        for reg in inventory::iter::<ExecutorRegistration> {
            let constructor = reg.constructor;
            registry.register(reg.name, move || constructor())?;
        }
        Ok(registry)
    }

    pub fn register<F>(&mut self, name: &str, constructor: F) -> VoldriveResult<()>
    where
        F: Fn() -> Box<dyn StorageExecutor> + Send + Sync + 'static,
    {
        self.inner.register(name, Arc::new(constructor))?;
        tracing::debug!(executor = %name, "Registered storage executor");
        Ok(())
    }

    pub fn new_executor(&self, name: &str) -> VoldriveResult<Box<dyn StorageExecutor>> {
        let constructor = self
            .inner
            .get(name)
            .ok_or_else(|| VoldriveError::NotFound(format!("executor {}", name)))?;
        Ok(constructor())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.inner.names()
    }

    pub fn seal(&mut self) {
        self.inner.seal();
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.is_sealed()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("executors", &self.names())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::Echo;
    use super::*;

    #[tokio::test]
    async fn test_execute_passes_config_to_init() {
        let mut config = Config::default();
        config.set("echo.id", "host-7");

        let value = execute(Echo::boxed().as_ref(), &Context::background(), &config, &ExecutorOp::InstanceId)
            .await
            .unwrap();
        let id: InstanceId = serde_json::from_value(value).unwrap();
        assert_eq!(id, InstanceId::new("host-7", "echo"));
    }

    #[tokio::test]
    async fn test_default_mount_is_unsupported() {
        let op = ExecutorOp::Mount {
            device: "/dev/x".into(),
            target: "/mnt/x".into(),
            read_only: false,
        };
        let err = execute(Echo::boxed().as_ref(), &Context::background(), &Config::default(), &op)
            .await
            .unwrap_err();
        assert!(matches!(err, VoldriveError::Unsupported(_)));
    }

    #[test]
    fn test_registry_not_found() {
        let mut registry = ExecutorRegistry::new(OverridePolicy::Reject);
        registry.register("echo", Echo::boxed).unwrap();
        assert!(registry.contains("ECHO"));
        assert!(matches!(
            registry.new_executor("missing"),
            Err(VoldriveError::NotFound(_))
        ));
    }
}
