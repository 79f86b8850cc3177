//! Request routing: service name to driver instance to operation.
//!
//! Each request walks `Received → DriverResolved → DriverInitialized →
//! Executing → Completed | Failed`. Driver instances are created lazily, one
//! per service, and live as long as the router.

mod request;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::Instrument;
use voldrive_shared::errors::{VoldriveError, VoldriveResult};

use crate::config::{Config, keys as config_keys};
use crate::context::{Context, TransactionId, keys};
use crate::driver::{
    DriverInstance, DriverRegistry, MountInfo, Volume, VolumeAttachOpts, VolumeAttachment,
    VolumeCreateOpts, VolumeDetachOpts, VolumeInspectOpts, VolumeMountOpts, VolumeRemoveOpts,
    VolumeUnmountOpts, VolumesOpts,
};
use crate::executor::{ExecutorDispatcher, ExecutorHandle};
use crate::metrics::{RouterMetrics, RouterMetricsStorage};

pub use request::{RequestState, VolumeOp, VolumeReply, VolumeRequest};

pub struct Router {
    drivers: Arc<DriverRegistry>,
    dispatcher: Arc<ExecutorDispatcher>,
    config: Config,
    /// Keyed by lowercased service name.
    instances: RwLock<HashMap<String, Arc<DriverInstance>>>,
    metrics: Arc<RouterMetricsStorage>,
}

impl Router {
    /// Build a router over a sealed driver registry.
    ///
    /// The dispatcher should share `metrics` so executor counters land in
    /// the same snapshot.
    pub fn new(
        drivers: Arc<DriverRegistry>,
        dispatcher: Arc<ExecutorDispatcher>,
        config: Config,
        metrics: Arc<RouterMetricsStorage>,
    ) -> VoldriveResult<Self> {
        if !drivers.is_sealed() {
            return Err(VoldriveError::InvalidState(
                "driver registry must be sealed before routing".into(),
            ));
        }
        Ok(Self {
            drivers,
            dispatcher,
            config,
            instances: RwLock::new(HashMap::new()),
            metrics,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<ExecutorDispatcher> {
        &self.dispatcher
    }

    /// Services resolved so far, sorted.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .instances
            .read()
            .values()
            .map(|i| i.service().to_string())
            .collect();
        names.sort();
        names
    }

    pub fn metrics(&self) -> RouterMetrics {
        self.metrics.snapshot()
    }

    /// Route one request to its service's driver.
    pub async fn handle(&self, ctx: &Context, request: VolumeRequest) -> VoldriveResult<VolumeReply> {
        let ctx = match ctx.transaction_id() {
            Some(_) => ctx.clone(),
            None => ctx.with_transaction_id(TransactionId::new()),
        };
        let ctx = ctx.with_value(keys::SERVICE, request.service.clone());
        let operation = request.op.name();

        let span = ctx.span();
        let result = async {
            tracing::trace!(state = %RequestState::Received, operation, "Request");
            let instance = self.resolve(&request.service)?;

            let ctx = ctx
                .with_value(keys::DRIVER, instance.driver_name().to_string())
                .with_value(
                    keys::EXECUTOR,
                    ExecutorHandle::new(
                        Arc::clone(&self.dispatcher),
                        instance.driver_name(),
                        instance.config().clone(),
                    ),
                );
            tracing::trace!(
                state = %RequestState::DriverResolved,
                driver = %instance.driver_name(),
                "Request"
            );

            instance.ensure_initialized(&ctx).await?;
            tracing::trace!(state = %RequestState::DriverInitialized, "Request");

            tracing::trace!(state = %RequestState::Executing, operation, "Request");
            ctx.run(operation, execute(&instance, &ctx, request.op))
                .await
        }
        .instrument(span.clone())
        .await;

        self.metrics.record_request(result.is_err());
        let _enter = span.enter();
        match &result {
            Ok(_) => tracing::debug!(state = %RequestState::Completed, operation, "Request"),
            Err(e) => tracing::warn!(
                state = %RequestState::Failed,
                operation,
                error = %e,
                "Request"
            ),
        }
        result
    }

    /// The instance serving `service`, constructing it on first use.
    fn resolve(&self, service: &str) -> VoldriveResult<Arc<DriverInstance>> {
        if service.is_empty() {
            return Err(VoldriveError::InvalidArgument("service name is empty".into()));
        }
        let key = service.to_lowercase();
        if let Some(instance) = self.instances.read().get(&key) {
            return Ok(Arc::clone(instance));
        }

        let driver_name = self
            .config
            .get_string(&config_keys::service_driver(service))
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| service.to_string());

        let mut instances = self.instances.write();
        // Another request may have won the race while we waited.
        if let Some(instance) = instances.get(&key) {
            return Ok(Arc::clone(instance));
        }

        let driver = self.drivers.new_driver(&driver_name).map_err(|e| match e {
            VoldriveError::NotFound(_) => VoldriveError::NotFound(format!(
                "service {} (driver {})",
                service, driver_name
            )),
            other => other,
        })?;
        let scope = self
            .config
            .scope(&format!("{}.{}", config_keys::SERVICES, service));
        let instance = Arc::new(
            DriverInstance::new(service, driver, scope).with_metrics(Arc::clone(&self.metrics)),
        );
        tracing::debug!(service, driver = %driver_name, "Driver instance created");
        instances.insert(key, Arc::clone(&instance));
        Ok(instance)
    }

    // ========================================================================
    // CONVENIENCE
    // ========================================================================

    pub async fn volumes(
        &self,
        ctx: &Context,
        service: &str,
        opts: VolumesOpts,
    ) -> VoldriveResult<Vec<Volume>> {
        match self
            .handle(ctx, VolumeRequest::new(service, VolumeOp::Volumes { opts }))
            .await?
        {
            VolumeReply::Volumes(volumes) => Ok(volumes),
            other => Err(unexpected("volumes", &other)),
        }
    }

    pub async fn inspect(
        &self,
        ctx: &Context,
        service: &str,
        volume: &str,
        opts: VolumeInspectOpts,
    ) -> VoldriveResult<Volume> {
        let op = VolumeOp::Inspect {
            volume: volume.to_string(),
            opts,
        };
        expect_volume("inspect", self.handle(ctx, VolumeRequest::new(service, op)).await?)
    }

    pub async fn create(
        &self,
        ctx: &Context,
        service: &str,
        name: &str,
        opts: VolumeCreateOpts,
    ) -> VoldriveResult<Volume> {
        let op = VolumeOp::Create {
            name: name.to_string(),
            opts,
        };
        expect_volume("create", self.handle(ctx, VolumeRequest::new(service, op)).await?)
    }

    pub async fn remove(
        &self,
        ctx: &Context,
        service: &str,
        volume: &str,
        opts: VolumeRemoveOpts,
    ) -> VoldriveResult<()> {
        let op = VolumeOp::Remove {
            volume: volume.to_string(),
            opts,
        };
        match self.handle(ctx, VolumeRequest::new(service, op)).await? {
            VolumeReply::Removed => Ok(()),
            other => Err(unexpected("remove", &other)),
        }
    }

    pub async fn attach(
        &self,
        ctx: &Context,
        service: &str,
        volume: &str,
        opts: VolumeAttachOpts,
    ) -> VoldriveResult<VolumeAttachment> {
        let op = VolumeOp::Attach {
            volume: volume.to_string(),
            opts,
        };
        match self.handle(ctx, VolumeRequest::new(service, op)).await? {
            VolumeReply::Attachment(attachment) => Ok(attachment),
            other => Err(unexpected("attach", &other)),
        }
    }

    pub async fn detach(
        &self,
        ctx: &Context,
        service: &str,
        volume: &str,
        opts: VolumeDetachOpts,
    ) -> VoldriveResult<Volume> {
        let op = VolumeOp::Detach {
            volume: volume.to_string(),
            opts,
        };
        expect_volume("detach", self.handle(ctx, VolumeRequest::new(service, op)).await?)
    }

    pub async fn mount(
        &self,
        ctx: &Context,
        service: &str,
        volume: &str,
        opts: VolumeMountOpts,
    ) -> VoldriveResult<MountInfo> {
        let op = VolumeOp::Mount {
            volume: volume.to_string(),
            opts,
        };
        match self.handle(ctx, VolumeRequest::new(service, op)).await? {
            VolumeReply::Mount(info) => Ok(info),
            other => Err(unexpected("mount", &other)),
        }
    }

    pub async fn unmount(
        &self,
        ctx: &Context,
        service: &str,
        volume: &str,
        opts: VolumeUnmountOpts,
    ) -> VoldriveResult<Volume> {
        let op = VolumeOp::Unmount {
            volume: volume.to_string(),
            opts,
        };
        expect_volume("unmount", self.handle(ctx, VolumeRequest::new(service, op)).await?)
    }

    pub async fn path(
        &self,
        ctx: &Context,
        service: &str,
        volume: &str,
    ) -> VoldriveResult<Option<PathBuf>> {
        let op = VolumeOp::Path {
            volume: volume.to_string(),
        };
        match self.handle(ctx, VolumeRequest::new(service, op)).await? {
            VolumeReply::Path(path) => Ok(path),
            other => Err(unexpected("path", &other)),
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("drivers", &self.drivers)
            .field("dispatcher", &self.dispatcher)
            .field("services", &self.services())
            .finish()
    }
}

async fn execute(
    instance: &DriverInstance,
    ctx: &Context,
    op: VolumeOp,
) -> VoldriveResult<VolumeReply> {
    let reply = match op {
        VolumeOp::Volumes { opts } => VolumeReply::Volumes(instance.volumes(ctx, &opts).await?),
        VolumeOp::Inspect { volume, opts } => {
            VolumeReply::Volume(instance.inspect(ctx, &volume, &opts).await?)
        }
        VolumeOp::Create { name, opts } => {
            VolumeReply::Volume(instance.create(ctx, &name, &opts).await?)
        }
        VolumeOp::Remove { volume, opts } => {
            instance.remove(ctx, &volume, &opts).await?;
            VolumeReply::Removed
        }
        VolumeOp::Attach { volume, opts } => {
            VolumeReply::Attachment(instance.attach(ctx, &volume, &opts).await?)
        }
        VolumeOp::Detach { volume, opts } => {
            VolumeReply::Volume(instance.detach(ctx, &volume, &opts).await?)
        }
        VolumeOp::Mount { volume, opts } => {
            VolumeReply::Mount(instance.mount(ctx, &volume, &opts).await?)
        }
        VolumeOp::Unmount { volume, opts } => {
            VolumeReply::Volume(instance.unmount(ctx, &volume, &opts).await?)
        }
        VolumeOp::Path { volume } => VolumeReply::Path(instance.path(ctx, &volume).await?),
    };
    Ok(reply)
}

fn expect_volume(operation: &str, reply: VolumeReply) -> VoldriveResult<Volume> {
    match reply {
        VolumeReply::Volume(volume) => Ok(volume),
        other => Err(unexpected(operation, &other)),
    }
}

fn unexpected(operation: &str, reply: &VolumeReply) -> VoldriveError {
    VoldriveError::Internal(format!("{} returned an unexpected reply: {:?}", operation, reply))
}
