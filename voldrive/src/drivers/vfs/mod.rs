//! `vfs`: a local-filesystem backend.
//!
//! Volumes are rows in `<root>/vfs.db`; each volume's device is the
//! directory `<root>/dev/<volume-id>`. Attachments are recorded against the
//! instance id the executor reports, and mounts are symlinks the executor
//! creates. Useful for development and as the shape other backends follow.

mod executor;

use std::path::PathBuf;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::Utc;
use voldrive_shared::errors::{VoldriveError, VoldriveResult};
use voldrive_shared::executor::InstanceId;

use crate::config::schema::{ConfigRegistration, KeyType, LinkedConfig};
use crate::config::Config;
use crate::context::Context;
use crate::db::{Database, VolumeStore};
use crate::driver::{
    AttachmentState, DriverRegistration, MountInfo, StorageDriver, Volume, VolumeAttachOpts,
    VolumeAttachment, VolumeCreateOpts, VolumeDetachOpts, VolumeInspectOpts, VolumeMountOpts,
    VolumeRemoveOpts, VolumeUnmountOpts, VolumesOpts,
};
use crate::executor::ExecutorRegistration;

pub use executor::VfsExecutor;

pub const NAME: &str = "vfs";
const DB_FILE: &str = "vfs.db";

pub mod config_keys {
    pub const ROOT: &str = "vfs.root";
    pub const INSTANCE_ID: &str = "vfs.instanceId";
}

inventory::submit! {
    DriverRegistration { name: NAME, constructor: VfsDriver::boxed }
}

inventory::submit! {
    ExecutorRegistration { name: NAME, constructor: VfsExecutor::boxed }
}

inventory::submit! {
    LinkedConfig { register: config_registration }
}

pub fn config_registration() -> ConfigRegistration {
    ConfigRegistration::new("vfs")
        .key(
            KeyType::String,
            None,
            serde_json::Value::Null,
            "Directory holding vfs volumes, default <lib>/vfs",
            config_keys::ROOT,
        )
        .key(
            KeyType::String,
            None,
            serde_json::Value::Null,
            "Instance id reported by the vfs executor, default the host name",
            config_keys::INSTANCE_ID,
        )
}

/// `vfs.root`, else `<paths.lib>/vfs` from the context.
pub(crate) fn resolve_root(ctx: &Context, config: &Config) -> VoldriveResult<PathBuf> {
    if let Some(root) = config.get_string(config_keys::ROOT).filter(|s| !s.is_empty()) {
        return Ok(PathBuf::from(root));
    }
    ctx.path_config()
        .map(|paths| paths.lib.join(NAME))
        .ok_or_else(|| {
            VoldriveError::InvalidConfig(format!(
                "{} is not set and no path configuration is available",
                config_keys::ROOT
            ))
        })
}

#[derive(Clone)]
struct State {
    root: PathBuf,
    store: VolumeStore,
}

impl State {
    fn device_path(&self, volume_id: &str) -> PathBuf {
        self.root.join("dev").join(volume_id)
    }
}

#[derive(Default)]
pub struct VfsDriver {
    state: OnceLock<State>,
}

impl VfsDriver {
    pub fn boxed() -> Box<dyn StorageDriver> {
        Box::new(Self::default())
    }

    fn state(&self) -> VoldriveResult<&State> {
        self.state
            .get()
            .ok_or_else(|| VoldriveError::UninitializedDriver(NAME.to_string()))
    }

    /// Run `f` against the store and volume tree on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> VoldriveResult<T>
    where
        F: FnOnce(&State) -> VoldriveResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let state = self.state()?.clone();
        run_blocking(move || f(&state)).await
    }

    async fn local_instance(&self, ctx: &Context) -> VoldriveResult<InstanceId> {
        ctx.require_executor()?.instance_id(ctx).await
    }
}

async fn run_blocking<T, F>(f: F) -> VoldriveResult<T>
where
    F: FnOnce() -> VoldriveResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| VoldriveError::Internal(format!("{} blocking task: {}", NAME, e)))?
}

fn strip_attachments(mut volume: Volume, keep: bool) -> Volume {
    if !keep {
        volume.attachments.clear();
    }
    volume
}

fn validate_name(name: &str) -> VoldriveResult<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(VoldriveError::InvalidArgument(format!(
            "invalid volume name '{}'",
            name
        )));
    }
    Ok(())
}

#[async_trait]
impl StorageDriver for VfsDriver {
    fn name(&self) -> &str {
        NAME
    }

    async fn init(&self, ctx: &Context, config: &Config) -> VoldriveResult<()> {
        let root = resolve_root(ctx, config)?;
        let state = run_blocking(move || {
            for dir in [root.join("dev"), root.join("mnt")] {
                std::fs::create_dir_all(&dir).map_err(|e| {
                    VoldriveError::Storage(format!("failed to create {}: {}", dir.display(), e))
                })?;
            }
            let store = VolumeStore::new(Database::open(&root.join(DB_FILE))?);
            Ok(State { root, store })
        })
        .await?;

        tracing::info!(root = %state.root.display(), "vfs driver ready");
        self.state
            .set(state)
            .map_err(|_| VoldriveError::InvalidState(format!("{} already initialized", NAME)))
    }

    async fn volumes(&self, ctx: &Context, opts: &VolumesOpts) -> VoldriveResult<Vec<Volume>> {
        let mine = match opts.mine {
            true => Some(self.local_instance(ctx).await?),
            false => None,
        };
        let volumes = self
            .blocking(move |state| match mine {
                Some(instance) => state.store.attached_to(&instance.id),
                None => state.store.list(),
            })
            .await?;
        Ok(volumes
            .into_iter()
            .map(|v| strip_attachments(v, opts.attachments))
            .collect())
    }

    async fn inspect(
        &self,
        _ctx: &Context,
        volume: &str,
        opts: &VolumeInspectOpts,
    ) -> VoldriveResult<Volume> {
        let volume = volume.to_string();
        let found = self.blocking(move |state| state.store.require(&volume)).await?;
        Ok(strip_attachments(found, opts.attachments))
    }

    async fn create(
        &self,
        _ctx: &Context,
        name: &str,
        opts: &VolumeCreateOpts,
    ) -> VoldriveResult<Volume> {
        validate_name(name)?;
        let volume = Volume {
            id: ulid::Ulid::new().to_string().to_lowercase(),
            name: name.to_string(),
            size_gb: opts.size_gb,
            volume_type: opts.volume_type.clone(),
            iops: opts.iops,
            availability_zone: opts.availability_zone.clone(),
            encrypted: opts.encrypted,
            attachments: Vec::new(),
            fields: opts.fields.clone(),
            created_at: Utc::now(),
        };

        let volume = self
            .blocking(move |state| {
                if let Some(existing) = state.store.get(&volume.name)? {
                    return Err(VoldriveError::AlreadyExists(format!(
                        "volume {} (id {})",
                        volume.name, existing.id
                    )));
                }
                let device = state.device_path(&volume.id);
                std::fs::create_dir_all(&device)?;
                if let Err(e) = state.store.insert(&volume) {
                    let _ = std::fs::remove_dir_all(&device);
                    return Err(e);
                }
                Ok(volume)
            })
            .await?;

        tracing::info!(volume = %volume.name, id = %volume.id, "Created vfs volume");
        Ok(volume)
    }

    async fn remove(
        &self,
        _ctx: &Context,
        volume: &str,
        opts: &VolumeRemoveOpts,
    ) -> VoldriveResult<()> {
        let volume = volume.to_string();
        let force = opts.force;
        let removed = self
            .blocking(move |state| {
                let found = state.store.require(&volume)?;
                if found.is_attached() {
                    if !force {
                        return Err(VoldriveError::InvalidState(format!(
                            "volume {} is attached",
                            found.name
                        )));
                    }
                    tracing::warn!(volume = %found.name, "Force-removing attached vfs volume");
                }

                match std::fs::remove_dir_all(state.device_path(&found.id)) {
                    Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                    _ => {}
                }
                state.store.delete(&found.id)?;
                Ok(found)
            })
            .await?;

        tracing::info!(volume = %removed.name, id = %removed.id, "Removed vfs volume");
        Ok(())
    }

    async fn attach(
        &self,
        ctx: &Context,
        volume: &str,
        opts: &VolumeAttachOpts,
    ) -> VoldriveResult<VolumeAttachment> {
        let instance = self.local_instance(ctx).await?;
        let volume = volume.to_string();
        let opts = opts.clone();

        let (name, attachment, created) = self
            .blocking(move |state| {
                let mut found = state.store.require(&volume)?;
                if let Some(existing) = found.attachment_for(&instance) {
                    return Ok((found.name.clone(), existing.clone(), false));
                }
                if let Some(other) = found
                    .attachments
                    .iter()
                    .find(|a| a.state == AttachmentState::Attached)
                {
                    if !opts.force {
                        return Err(VoldriveError::InvalidState(format!(
                            "volume {} is attached to {}",
                            found.name, other.instance_id
                        )));
                    }
                    tracing::warn!(volume = %found.name, from = %other.instance_id, "Forcing vfs attachment");
                }

                let device = state.device_path(&found.id);
                let attachment = VolumeAttachment {
                    volume_id: found.id.clone(),
                    instance_id: instance,
                    device_name: Some(
                        opts.next_device
                            .unwrap_or_else(|| device.to_string_lossy().into_owned()),
                    ),
                    mount_point: None,
                    state: AttachmentState::Attached,
                };
                found.attachments = vec![attachment.clone()];
                state.store.update(&found)?;
                Ok((found.name, attachment, true))
            })
            .await?;

        if created {
            tracing::info!(volume = %name, instance = %attachment.instance_id, "Attached vfs volume");
        }
        Ok(attachment)
    }

    async fn detach(
        &self,
        ctx: &Context,
        volume: &str,
        opts: &VolumeDetachOpts,
    ) -> VoldriveResult<Volume> {
        let instance = self.local_instance(ctx).await?;
        let lookup = volume.to_string();
        let mut found = self.blocking(move |state| state.store.require(&lookup)).await?;

        let Some(attachment) = found
            .attachments
            .iter()
            .find(|a| a.state == AttachmentState::Attached)
            .cloned()
        else {
            return Ok(found);
        };
        if attachment.instance_id.id != instance.id && !opts.force {
            return Err(VoldriveError::InvalidState(format!(
                "volume {} is attached to {}",
                found.name, attachment.instance_id
            )));
        }
        if let Some(mount_point) = &attachment.mount_point {
            if attachment.instance_id.id == instance.id {
                ctx.require_executor()?.unmount(ctx, mount_point).await?;
            }
        }

        found.attachments.clear();
        let found = self
            .blocking(move |state| state.store.update(&found).map(|()| found))
            .await?;
        tracing::info!(volume = %found.name, "Detached vfs volume");
        Ok(found)
    }

    async fn mount(
        &self,
        ctx: &Context,
        volume: &str,
        opts: &VolumeMountOpts,
    ) -> VoldriveResult<MountInfo> {
        let attachment = self
            .attach(ctx, volume, &VolumeAttachOpts::default())
            .await?;
        let lookup = volume.to_string();
        let mut found = self.blocking(move |state| state.store.require(&lookup)).await?;
        let state = self.state()?;

        let target = match &opts.target {
            Some(target) => target.clone(),
            None => state.root.join("mnt").join(&found.name),
        };
        if let Some(current) = &attachment.mount_point {
            if *current != target {
                return Err(VoldriveError::InvalidState(format!(
                    "volume {} is already mounted at {}",
                    found.name,
                    current.display()
                )));
            }
        }

        let device = state.device_path(&found.id);
        ctx.require_executor()?
            .mount(ctx, &device.to_string_lossy(), &target, opts.read_only)
            .await?;

        for a in found.attachments.iter_mut() {
            if a.instance_id.id == attachment.instance_id.id {
                a.mount_point = Some(target.clone());
            }
        }
        let found = self
            .blocking(move |state| state.store.update(&found).map(|()| found))
            .await?;

        tracing::info!(volume = %found.name, target = %target.display(), "Mounted vfs volume");
        Ok(MountInfo {
            volume: found,
            mount_point: target,
        })
    }

    async fn unmount(
        &self,
        ctx: &Context,
        volume: &str,
        _opts: &VolumeUnmountOpts,
    ) -> VoldriveResult<Volume> {
        let instance = self.local_instance(ctx).await?;
        let lookup = volume.to_string();
        let mut found = self.blocking(move |state| state.store.require(&lookup)).await?;

        let mount_point = found
            .attachment_for(&instance)
            .and_then(|a| a.mount_point.clone());
        let Some(mount_point) = mount_point else {
            return Ok(found);
        };

        ctx.require_executor()?.unmount(ctx, &mount_point).await?;
        for a in found.attachments.iter_mut() {
            if a.instance_id.id == instance.id {
                a.mount_point = None;
            }
        }
        let found = self
            .blocking(move |state| state.store.update(&found).map(|()| found))
            .await?;

        tracing::info!(volume = %found.name, "Unmounted vfs volume");
        Ok(found)
    }

    async fn path(&self, ctx: &Context, volume: &str) -> VoldriveResult<Option<PathBuf>> {
        let instance = self.local_instance(ctx).await?;
        let volume = volume.to_string();
        let found = self.blocking(move |state| state.store.require(&volume)).await?;
        Ok(found
            .attachment_for(&instance)
            .and_then(|a| a.mount_point.clone()))
    }
}
