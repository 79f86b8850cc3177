//! Host-local half of the vfs backend.
//!
//! Devices are directories under `<root>/dev`; mounting one means pointing a
//! symlink at it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use voldrive_shared::errors::{VoldriveError, VoldriveResult};
use voldrive_shared::executor::{DeviceScanType, InstanceId, LocalDevices};

use super::{NAME, config_keys, resolve_root};
use crate::config::Config;
use crate::context::Context;
use crate::executor::StorageExecutor;

#[derive(Debug, Clone)]
struct Settings {
    root: PathBuf,
    instance_id: String,
}

#[derive(Default)]
pub struct VfsExecutor {
    settings: RwLock<Option<Settings>>,
}

impl VfsExecutor {
    pub fn boxed() -> Box<dyn StorageExecutor> {
        Box::new(Self::default())
    }

    fn settings(&self) -> VoldriveResult<Settings> {
        self.settings
            .read()
            .clone()
            .ok_or_else(|| VoldriveError::UninitializedDriver(format!("{} executor", NAME)))
    }
}

#[async_trait]
impl StorageExecutor for VfsExecutor {
    fn name(&self) -> &str {
        NAME
    }

    async fn init(&self, ctx: &Context, config: &Config) -> VoldriveResult<()> {
        let root = resolve_root(ctx, config)?;
        let instance_id = match config.get_string(config_keys::INSTANCE_ID).filter(|s| !s.is_empty()) {
            Some(id) => id,
            None => hostname()?,
        };
        tracing::trace!(root = %root.display(), instance_id = %instance_id, "vfs executor initialized");
        *self.settings.write() = Some(Settings { root, instance_id });
        Ok(())
    }

    async fn supported(&self, _ctx: &Context) -> VoldriveResult<bool> {
        let settings = self.settings()?;
        Ok(std::fs::create_dir_all(settings.root.join("dev")).is_ok())
    }

    async fn instance_id(&self, _ctx: &Context) -> VoldriveResult<InstanceId> {
        Ok(InstanceId::new(self.settings()?.instance_id, NAME))
    }

    async fn local_devices(
        &self,
        _ctx: &Context,
        scan: DeviceScanType,
    ) -> VoldriveResult<LocalDevices> {
        let dev_dir = self.settings()?.root.join("dev");
        let mut devices = LocalDevices {
            driver: NAME.to_string(),
            ..Default::default()
        };

        let entries = match std::fs::read_dir(&dev_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(devices),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            // A deep scan also checks the device is usable.
            if scan == DeviceScanType::Deep && !entry.file_type()?.is_dir() {
                continue;
            }
            let volume_id = entry.file_name().to_string_lossy().into_owned();
            devices
                .device_map
                .insert(entry.path().to_string_lossy().into_owned(), volume_id);
        }
        Ok(devices)
    }

    async fn mount(
        &self,
        _ctx: &Context,
        device: &str,
        target: &Path,
        read_only: bool,
    ) -> VoldriveResult<()> {
        let device = Path::new(device);
        if !device.is_dir() {
            return Err(VoldriveError::NotFound(format!("device {}", device.display())));
        }

        match std::fs::symlink_metadata(target) {
            Ok(meta) if meta.file_type().is_symlink() => {
                let current = std::fs::read_link(target)?;
                if current == device {
                    return Ok(());
                }
                return Err(VoldriveError::AlreadyExists(format!(
                    "{} is mounted from {}",
                    target.display(),
                    current.display()
                )));
            }
            Ok(_) => {
                return Err(VoldriveError::InvalidState(format!(
                    "mount point {} exists and is not a vfs mount",
                    target.display()
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::os::unix::fs::symlink(device, target)?;
        tracing::debug!(
            device = %device.display(),
            target = %target.display(),
            read_only,
            "Mounted vfs device"
        );
        Ok(())
    }

    async fn unmount(&self, _ctx: &Context, target: &Path) -> VoldriveResult<()> {
        match std::fs::symlink_metadata(target) {
            Ok(meta) if meta.file_type().is_symlink() => {
                std::fs::remove_file(target)?;
                tracing::debug!(target = %target.display(), "Unmounted vfs device");
                Ok(())
            }
            Ok(_) => Err(VoldriveError::InvalidState(format!(
                "{} is not a vfs mount",
                target.display()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn hostname() -> VoldriveResult<String> {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn executor(root: &Path) -> VfsExecutor {
        let mut config = Config::default();
        config.set(config_keys::ROOT, root.to_string_lossy().into_owned());
        config.set(config_keys::INSTANCE_ID, "node-1");
        let executor = VfsExecutor::default();
        executor.init(&Context::background(), &config).await.unwrap();
        executor
    }

    #[tokio::test]
    async fn test_uninitialized() {
        let executor = VfsExecutor::default();
        assert!(matches!(
            executor.instance_id(&Context::background()).await,
            Err(VoldriveError::UninitializedDriver(_))
        ));
    }

    #[tokio::test]
    async fn test_instance_id_and_supported() {
        let tmp = TempDir::new().unwrap();
        let ex = executor(tmp.path()).await;
        let ctx = Context::background();

        assert_eq!(ex.instance_id(&ctx).await.unwrap(), InstanceId::new("node-1", "vfs"));
        assert!(ex.supported(&ctx).await.unwrap());
        assert!(tmp.path().join("dev").is_dir());
    }

    #[tokio::test]
    async fn test_hostname_fallback() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.set(config_keys::ROOT, tmp.path().to_string_lossy().into_owned());
        let ex = VfsExecutor::default();
        ex.init(&Context::background(), &config).await.unwrap();
        assert!(!ex.instance_id(&Context::background()).await.unwrap().id.is_empty());
    }

    #[tokio::test]
    async fn test_local_devices() {
        let tmp = TempDir::new().unwrap();
        let ex = executor(tmp.path()).await;
        let ctx = Context::background();

        assert!(ex.local_devices(&ctx, DeviceScanType::Quick).await.unwrap().device_map.is_empty());

        std::fs::create_dir_all(tmp.path().join("dev/vol-a")).unwrap();
        std::fs::write(tmp.path().join("dev/stray"), b"").unwrap();

        let quick = ex.local_devices(&ctx, DeviceScanType::Quick).await.unwrap();
        assert_eq!(quick.device_map.len(), 2);
        let deep = ex.local_devices(&ctx, DeviceScanType::Deep).await.unwrap();
        assert_eq!(deep.device_map.len(), 1);
        let dev = tmp.path().join("dev/vol-a").to_string_lossy().into_owned();
        assert_eq!(deep.device_map.get(&dev).map(String::as_str), Some("vol-a"));
    }

    #[tokio::test]
    async fn test_mount_unmount_idempotent() {
        let tmp = TempDir::new().unwrap();
        let ex = executor(tmp.path()).await;
        let ctx = Context::background();
        let device = tmp.path().join("dev/vol-a");
        std::fs::create_dir_all(&device).unwrap();
        let target = tmp.path().join("mnt/data");
        let device_str = device.to_string_lossy().into_owned();

        ex.mount(&ctx, &device_str, &target, false).await.unwrap();
        ex.mount(&ctx, &device_str, &target, false).await.unwrap();
        assert_eq!(std::fs::read_link(&target).unwrap(), device);

        ex.unmount(&ctx, &target).await.unwrap();
        ex.unmount(&ctx, &target).await.unwrap();
        assert!(std::fs::symlink_metadata(&target).is_err());
    }

    #[tokio::test]
    async fn test_mount_refuses_foreign_target() {
        let tmp = TempDir::new().unwrap();
        let ex = executor(tmp.path()).await;
        let ctx = Context::background();
        std::fs::create_dir_all(tmp.path().join("dev/a")).unwrap();
        std::fs::create_dir_all(tmp.path().join("dev/b")).unwrap();
        let target = tmp.path().join("mnt/x");
        let dev = |n: &str| tmp.path().join("dev").join(n).to_string_lossy().into_owned();

        ex.mount(&ctx, &dev("a"), &target, false).await.unwrap();
        assert!(matches!(
            ex.mount(&ctx, &dev("b"), &target, false).await,
            Err(VoldriveError::AlreadyExists(_))
        ));

        let plain = tmp.path().join("plain");
        std::fs::create_dir_all(&plain).unwrap();
        assert!(matches!(
            ex.mount(&ctx, &dev("a"), &plain, false).await,
            Err(VoldriveError::InvalidState(_))
        ));
        assert!(matches!(
            ex.unmount(&ctx, &plain).await,
            Err(VoldriveError::InvalidState(_))
        ));
        assert!(matches!(
            ex.mount(&ctx, &dev("missing"), &tmp.path().join("mnt/y"), false).await,
            Err(VoldriveError::NotFound(_))
        ));
    }
}
