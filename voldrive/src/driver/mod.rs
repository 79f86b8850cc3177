//! Storage drivers and their registry.
//!
//! A driver is the API-facing half of a backend: it owns policy and the
//! provider's control plane, and delegates host-local work to the executor
//! bound to the same name (see [`crate::executor`]).

mod instance;
pub mod types;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use voldrive_shared::errors::{VoldriveError, VoldriveResult};

use crate::config::Config;
use crate::context::Context;
use crate::registry::{OverridePolicy, Registry};

pub use instance::DriverInstance;
pub use types::{
    AttachmentState, MountInfo, Volume, VolumeAttachOpts, VolumeAttachment, VolumeCreateOpts,
    VolumeDetachOpts, VolumeInspectOpts, VolumeMountOpts, VolumeRemoveOpts, VolumeUnmountOpts,
    VolumesOpts,
};

/// Capability surface of a storage backend.
///
/// `init` is called exactly once, before any other operation, with the
/// configuration scoped to the service the instance serves. Operations a
/// provider cannot perform keep the default `Unsupported` implementation.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    fn name(&self) -> &str;

    async fn init(&self, ctx: &Context, config: &Config) -> VoldriveResult<()>;

    async fn volumes(&self, ctx: &Context, opts: &VolumesOpts) -> VoldriveResult<Vec<Volume>>;

    /// Look up a volume by id or name.
    async fn inspect(
        &self,
        ctx: &Context,
        volume: &str,
        opts: &VolumeInspectOpts,
    ) -> VoldriveResult<Volume>;

    async fn create(
        &self,
        ctx: &Context,
        name: &str,
        opts: &VolumeCreateOpts,
    ) -> VoldriveResult<Volume>;

    async fn remove(&self, ctx: &Context, volume: &str, opts: &VolumeRemoveOpts)
    -> VoldriveResult<()>;

    async fn attach(
        &self,
        _ctx: &Context,
        volume: &str,
        _opts: &VolumeAttachOpts,
    ) -> VoldriveResult<VolumeAttachment> {
        Err(unsupported(self.name(), "attach", volume))
    }

    async fn detach(
        &self,
        _ctx: &Context,
        volume: &str,
        _opts: &VolumeDetachOpts,
    ) -> VoldriveResult<Volume> {
        Err(unsupported(self.name(), "detach", volume))
    }

    async fn mount(
        &self,
        _ctx: &Context,
        volume: &str,
        _opts: &VolumeMountOpts,
    ) -> VoldriveResult<MountInfo> {
        Err(unsupported(self.name(), "mount", volume))
    }

    async fn unmount(
        &self,
        _ctx: &Context,
        volume: &str,
        _opts: &VolumeUnmountOpts,
    ) -> VoldriveResult<Volume> {
        Err(unsupported(self.name(), "unmount", volume))
    }

    /// Mount point of a volume on this host, `None` when not mounted.
    async fn path(&self, _ctx: &Context, volume: &str) -> VoldriveResult<Option<PathBuf>> {
        Err(unsupported(self.name(), "path", volume))
    }
}

fn unsupported(driver: &str, op: &str, volume: &str) -> VoldriveError {
    VoldriveError::Unsupported(format!("driver {} cannot {} {}", driver, op, volume))
}

pub type DriverConstructor = Arc<dyn Fn() -> Box<dyn StorageDriver> + Send + Sync>;

/// Driver contributed by a linked backend module.
pub struct DriverRegistration {
    pub name: &'static str,
    pub constructor: fn() -> Box<dyn StorageDriver>,
}

inventory::collect!(DriverRegistration);

/// Driver name -> constructor, populated during bring-up and then sealed.
pub struct DriverRegistry {
    inner: Registry<DriverConstructor>,
}

impl DriverRegistry {
    pub fn new(policy: OverridePolicy) -> Self {
        Self {
            inner: Registry::new("driver", policy),
        }
    }

    /// A registry holding every driver linked into this binary.
    pub fn linked(policy: OverridePolicy) -> VoldriveResult<Self> {
        let mut registry = Self::new(policy);
        for reg in inventory::iter::<DriverRegistration> {
            let constructor = reg.constructor;
            registry.register(reg.name, move || constructor())?;
        }
        Ok(registry)
    }

    pub fn register<F>(&mut self, name: &str, constructor: F) -> VoldriveResult<()>
    where
        F: Fn() -> Box<dyn StorageDriver> + Send + Sync + 'static,
    {
        self.inner.register(name, Arc::new(constructor))?;
        tracing::debug!(driver = %name, "Registered storage driver");
        Ok(())
    }

    /// A fresh, uninitialized driver.
    pub fn new_driver(&self, name: &str) -> VoldriveResult<Box<dyn StorageDriver>> {
        let constructor = self
            .inner
            .get(name)
            .ok_or_else(|| VoldriveError::NotFound(format!("driver {}", name)))?;
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

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.names())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Remembers the volumes created through it.
    struct Counting {
        name: &'static str,
        created: Mutex<Vec<Volume>>,
    }

    #[async_trait]
    impl StorageDriver for Counting {
        fn name(&self) -> &str {
            self.name
        }

        async fn init(&self, _ctx: &Context, _config: &Config) -> VoldriveResult<()> {
            Ok(())
        }

        async fn volumes(&self, _ctx: &Context, _opts: &VolumesOpts) -> VoldriveResult<Vec<Volume>> {
            Ok(self.created.lock().clone())
        }

        async fn inspect(
            &self,
            _ctx: &Context,
            volume: &str,
            _opts: &VolumeInspectOpts,
        ) -> VoldriveResult<Volume> {
            Err(VoldriveError::NotFound(volume.to_string()))
        }

        async fn create(
            &self,
            _ctx: &Context,
            name: &str,
            opts: &VolumeCreateOpts,
        ) -> VoldriveResult<Volume> {
            let volume = Volume {
                id: format!("{}-{}", self.name, name),
                name: name.to_string(),
                size_gb: opts.size_gb,
                volume_type: None,
                iops: None,
                availability_zone: None,
                encrypted: false,
                attachments: Vec::new(),
                fields: Default::default(),
                created_at: chrono::Utc::now(),
            };
            self.created.lock().push(volume.clone());
            Ok(volume)
        }

        async fn remove(
            &self,
            _ctx: &Context,
            _volume: &str,
            _opts: &VolumeRemoveOpts,
        ) -> VoldriveResult<()> {
            Ok(())
        }
    }

    fn counting(name: &'static str) -> impl Fn() -> Box<dyn StorageDriver> + Send + Sync {
        move || -> Box<dyn StorageDriver> {
            Box::new(Counting {
                name,
                created: Mutex::new(Vec::new()),
            })
        }
    }

    #[test]
    fn test_new_driver_case_insensitive() {
        let mut registry = DriverRegistry::new(OverridePolicy::Reject);
        registry.register("Alpha", counting("alpha")).unwrap();

        assert_eq!(registry.new_driver("ALPHA").unwrap().name(), "alpha");
        assert!(matches!(
            registry.new_driver("beta"),
            Err(VoldriveError::NotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_keeps_original() {
        let mut registry = DriverRegistry::new(OverridePolicy::Reject);
        registry.register("alpha", counting("first")).unwrap();
        let err = registry.register("ALPHA", counting("second")).unwrap_err();

        assert!(matches!(err, VoldriveError::DuplicateDriver(_)));
        assert_eq!(registry.new_driver("alpha").unwrap().name(), "first");
    }

    #[test]
    fn test_replace_policy() {
        let mut registry = DriverRegistry::new(OverridePolicy::Replace);
        registry.register("alpha", counting("first")).unwrap();
        registry.register("alpha", counting("second")).unwrap();
        assert_eq!(registry.new_driver("alpha").unwrap().name(), "second");
        assert_eq!(registry.names(), vec!["alpha"]);
    }

    #[tokio::test]
    async fn test_distinct_names_never_share_state() {
        let mut registry = DriverRegistry::new(OverridePolicy::Reject);
        registry.register("a", counting("a")).unwrap();
        registry.register("b", counting("b")).unwrap();

        let ctx = Context::background();
        let a = registry.new_driver("a").unwrap();
        let b = registry.new_driver("b").unwrap();
        let a2 = registry.new_driver("a").unwrap();
        a.create(&ctx, "v", &VolumeCreateOpts::default()).await.unwrap();
        a.create(&ctx, "w", &VolumeCreateOpts::default()).await.unwrap();

        let names = |volumes: Vec<Volume>| volumes.into_iter().map(|v| v.name).collect::<Vec<_>>();
        let opts = VolumesOpts::default();
        assert_eq!(names(a.volumes(&ctx, &opts).await.unwrap()), vec!["v", "w"]);
        // Neither another name nor a second value of the same name sees them.
        assert!(b.volumes(&ctx, &opts).await.unwrap().is_empty());
        assert!(a2.volumes(&ctx, &opts).await.unwrap().is_empty());

        b.create(&ctx, "x", &VolumeCreateOpts::default()).await.unwrap();
        assert_eq!(names(a.volumes(&ctx, &opts).await.unwrap()), vec!["v", "w"]);
        assert_eq!(names(b.volumes(&ctx, &opts).await.unwrap()), vec!["x"]);
    }

    #[test]
    fn test_sealed_registry_rejects_register() {
        let mut registry = DriverRegistry::new(OverridePolicy::Reject);
        registry.seal();
        assert!(matches!(
            registry.register("late", counting("late")),
            Err(VoldriveError::InvalidState(_))
        ));
    }

    #[cfg(feature = "driver-vfs")]
    #[test]
    fn test_linked_contains_vfs() {
        let registry = DriverRegistry::linked(OverridePolicy::Reject).unwrap();
        assert!(registry.contains("vfs"));
    }
}
