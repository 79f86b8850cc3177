//! A driver bound to one service.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::OnceCell;
use voldrive_shared::errors::{VoldriveError, VoldriveResult};

use super::{
    MountInfo, StorageDriver, Volume, VolumeAttachOpts, VolumeAttachment, VolumeCreateOpts,
    VolumeDetachOpts, VolumeInspectOpts, VolumeMountOpts, VolumeRemoveOpts, VolumeUnmountOpts,
    VolumesOpts,
};
use crate::config::Config;
use crate::context::Context;
use crate::metrics::RouterMetricsStorage;

/// Owns a driver, the configuration scope it was built for, and the outcome
/// of its one `init` call.
///
/// Concurrent first-use callers share a single `init`; whatever it returns,
/// success or error, is what every later caller observes. `init` runs on its
/// own task, so a caller that stops waiting does not abort it.
pub struct DriverInstance {
    service: String,
    driver: Box<dyn StorageDriver>,
    config: Config,
    init: OnceCell<VoldriveResult<()>>,
    metrics: Option<Arc<RouterMetricsStorage>>,
}

impl DriverInstance {
    pub fn new(service: impl Into<String>, driver: Box<dyn StorageDriver>, config: Config) -> Self {
        Self {
            service: service.into(),
            driver,
            config,
            init: OnceCell::new(),
            metrics: None,
        }
    }

    /// Count init attempts in `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<RouterMetricsStorage>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn driver_name(&self) -> &str {
        self.driver.name()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run `init` unless it already ran, and return its outcome.
    ///
    /// Only the wait is bounded by `ctx`. `init` itself sees `ctx`'s values
    /// without its deadline and keeps going after this caller gives up.
    pub async fn ensure_initialized(self: &Arc<Self>, ctx: &Context) -> VoldriveResult<()> {
        if let Some(outcome) = self.init.get() {
            return outcome.clone();
        }
        if let Some(err) = ctx.err_for("driver init") {
            return Err(err);
        }

        let instance = Arc::clone(self);
        let init_ctx = ctx.without_cancel();
        let task = tokio::spawn(async move { instance.init_once(&init_ctx).await });
        ctx.run("driver init", async move {
            task.await.unwrap_or_else(|e| {
                Err(VoldriveError::Internal(format!("driver init task: {}", e)))
            })
        })
        .await
    }

    async fn init_once(&self, ctx: &Context) -> VoldriveResult<()> {
        self.init
            .get_or_init(|| async {
                tracing::debug!(
                    service = %self.service,
                    driver = %self.driver.name(),
                    "Initializing driver"
                );
                let outcome = self.driver.init(ctx, &self.config).await;
                if let Some(metrics) = &self.metrics {
                    metrics.record_driver_init(outcome.is_err());
                }
                match &outcome {
                    Ok(()) => tracing::info!(
                        service = %self.service,
                        driver = %self.driver.name(),
                        "Driver initialized"
                    ),
                    Err(e) => tracing::error!(
                        service = %self.service,
                        driver = %self.driver.name(),
                        error = %e,
                        "Driver initialization failed"
                    ),
                }
                outcome
            })
            .await
            .clone()
    }

    /// True once `init` has completed successfully.
    pub fn is_initialized(&self) -> bool {
        matches!(self.init.get(), Some(Ok(())))
    }

    /// The driver, refusing use before a successful `init`.
    fn ready(&self) -> VoldriveResult<&dyn StorageDriver> {
        match self.init.get() {
            Some(Ok(())) => Ok(self.driver.as_ref()),
            Some(Err(e)) => Err(VoldriveError::UninitializedDriver(format!(
                "{} (service {}): init failed: {}",
                self.driver.name(),
                self.service,
                e
            ))),
            None => Err(VoldriveError::UninitializedDriver(format!(
                "{} (service {})",
                self.driver.name(),
                self.service
            ))),
        }
    }

    pub async fn volumes(&self, ctx: &Context, opts: &VolumesOpts) -> VoldriveResult<Vec<Volume>> {
        self.ready()?.volumes(ctx, opts).await
    }

    pub async fn inspect(
        &self,
        ctx: &Context,
        volume: &str,
        opts: &VolumeInspectOpts,
    ) -> VoldriveResult<Volume> {
        self.ready()?.inspect(ctx, volume, opts).await
    }

    pub async fn create(
        &self,
        ctx: &Context,
        name: &str,
        opts: &VolumeCreateOpts,
    ) -> VoldriveResult<Volume> {
        self.ready()?.create(ctx, name, opts).await
    }

    pub async fn remove(
        &self,
        ctx: &Context,
        volume: &str,
        opts: &VolumeRemoveOpts,
    ) -> VoldriveResult<()> {
        self.ready()?.remove(ctx, volume, opts).await
    }

    pub async fn attach(
        &self,
        ctx: &Context,
        volume: &str,
        opts: &VolumeAttachOpts,
    ) -> VoldriveResult<VolumeAttachment> {
        self.ready()?.attach(ctx, volume, opts).await
    }

    pub async fn detach(
        &self,
        ctx: &Context,
        volume: &str,
        opts: &VolumeDetachOpts,
    ) -> VoldriveResult<Volume> {
        self.ready()?.detach(ctx, volume, opts).await
    }

    pub async fn mount(
        &self,
        ctx: &Context,
        volume: &str,
        opts: &VolumeMountOpts,
    ) -> VoldriveResult<MountInfo> {
        self.ready()?.mount(ctx, volume, opts).await
    }

    pub async fn unmount(
        &self,
        ctx: &Context,
        volume: &str,
        opts: &VolumeUnmountOpts,
    ) -> VoldriveResult<Volume> {
        self.ready()?.unmount(ctx, volume, opts).await
    }

    pub async fn path(&self, ctx: &Context, volume: &str) -> VoldriveResult<Option<PathBuf>> {
        self.ready()?.path(ctx, volume).await
    }
}

impl std::fmt::Debug for DriverInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverInstance")
            .field("service", &self.service)
            .field("driver", &self.driver.name())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
