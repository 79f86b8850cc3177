//! Executor dispatch across the process boundary.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::TempDir;
use voldrive::config::Config;
use voldrive::context::Context;
use voldrive::executor::{
    ExecutorCommand, ExecutorDispatcher, ExecutorHandle, ExecutorRegistry, Isolation,
    StorageExecutor,
};
use voldrive::registry::OverridePolicy;
use voldrive::util::is_process_alive;
use voldrive::VoldriveError;
use voldrive_shared::executor::{DeviceScanType, InstanceId, LocalDevices};

/// Registered so the dispatcher accepts the name; the process never runs it.
struct Placeholder;

#[async_trait]
impl StorageExecutor for Placeholder {
    fn name(&self) -> &str {
        "stub"
    }

    async fn init(&self, _ctx: &Context, _config: &Config) -> voldrive::VoldriveResult<()> {
        Ok(())
    }

    async fn supported(&self, _ctx: &Context) -> voldrive::VoldriveResult<bool> {
        Ok(true)
    }

    async fn instance_id(&self, _ctx: &Context) -> voldrive::VoldriveResult<InstanceId> {
        Ok(InstanceId::new("placeholder", "stub"))
    }

    async fn local_devices(
        &self,
        _ctx: &Context,
        _scan: DeviceScanType,
    ) -> voldrive::VoldriveResult<LocalDevices> {
        Ok(LocalDevices::default())
    }
}

fn registry() -> Arc<ExecutorRegistry> {
    let mut executors = ExecutorRegistry::new(OverridePolicy::Reject);
    executors
        .register("stub", || -> Box<dyn StorageExecutor> { Box::new(Placeholder) })
        .unwrap();
    executors.seal();
    Arc::new(executors)
}

fn sh_handle(script: String) -> ExecutorHandle {
    let dispatcher = ExecutorDispatcher::new(registry(), Isolation::Process)
        .with_command(ExecutorCommand::new("/bin/sh").arg("-c").arg(script));
    ExecutorHandle::new(Arc::new(dispatcher), "stub", Config::default())
}

fn read_pid(path: &Path) -> u32 {
    // The child writes its pid before sleeping; give it a moment on slow hosts.
    for _ in 0..50 {
        if let Ok(s) = std::fs::read_to_string(path) {
            if let Ok(pid) = s.trim().parse() {
                return pid;
            }
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("child never wrote {}", path.display());
}

/// Whether `pid` is gone within a short grace period. An orphaned
/// grandchild is reaped by init, not by us, so a zombie counts as gone.
fn gone_soon(pid: u32) -> bool {
    for _ in 0..100 {
        let zombie = std::fs::read_to_string(format!("/proc/{}/stat", pid))
            .ok()
            .and_then(|stat| stat.rsplit(')').next().map(|rest| rest.trim_start().starts_with('Z')))
            .unwrap_or(false);
        if !is_process_alive(pid) || zombie {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

/// A shell that backgrounds a sleeper and waits on it instead of exec'ing.
fn forking_script(dir: &Path) -> (String, PathBuf, PathBuf) {
    let pidfile = dir.join("pid");
    let gpidfile = dir.join("gpid");
    let script = format!(
        "echo $$ > {}; sleep 30 & echo $! > {}; wait",
        pidfile.display(),
        gpidfile.display()
    );
    (script, pidfile, gpidfile)
}

#[tokio::test]
async fn test_deadline_kills_executor_process() {
    let dir = TempDir::new().unwrap();
    let pidfile = dir.path().join("pid");
    let handle = sh_handle(format!("echo $$ > {}; exec sleep 10", pidfile.display()));

    let (ctx, _cancel) = Context::background().with_timeout(Duration::from_millis(300));
    let started = Instant::now();
    let err = handle.supported(&ctx).await.unwrap_err();

    assert!(matches!(err, VoldriveError::DeadlineExceeded(_)), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
    let pid = read_pid(&pidfile);
    assert!(!is_process_alive(pid), "executor process {} still running", pid);
}

#[tokio::test]
async fn test_cancel_kills_executor_process() {
    let dir = TempDir::new().unwrap();
    let pidfile = dir.path().join("pid");
    let handle = sh_handle(format!("echo $$ > {}; exec sleep 10", pidfile.display()));

    let (ctx, cancel) = Context::background().with_cancel();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
    });
    let err = handle.supported(&ctx).await.unwrap_err();
    canceller.await.unwrap();

    assert!(matches!(err, VoldriveError::Cancelled(_)), "got {err:?}");
    assert!(!is_process_alive(read_pid(&pidfile)));
}

#[tokio::test]
async fn test_deadline_kills_background_work_of_executor() {
    let dir = TempDir::new().unwrap();
    let (script, pidfile, gpidfile) = forking_script(dir.path());
    let handle = sh_handle(script);

    let (ctx, _cancel) = Context::background().with_timeout(Duration::from_millis(300));
    let err = handle.supported(&ctx).await.unwrap_err();

    assert!(matches!(err, VoldriveError::DeadlineExceeded(_)), "got {err:?}");
    assert!(!is_process_alive(read_pid(&pidfile)));
    let grandchild = read_pid(&gpidfile);
    assert!(gone_soon(grandchild), "background pid {} outlived the deadline", grandchild);
}

#[tokio::test]
async fn test_cancel_kills_background_work_of_executor() {
    let dir = TempDir::new().unwrap();
    let (script, pidfile, gpidfile) = forking_script(dir.path());
    let handle = sh_handle(script);

    let (ctx, cancel) = Context::background().with_cancel();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
    });
    let err = handle.supported(&ctx).await.unwrap_err();
    canceller.await.unwrap();

    assert!(matches!(err, VoldriveError::Cancelled(_)), "got {err:?}");
    assert!(!is_process_alive(read_pid(&pidfile)));
    assert!(gone_soon(read_pid(&gpidfile)));
}

#[tokio::test]
async fn test_default_timeout_applies_without_deadline() {
    let dir = TempDir::new().unwrap();
    let (script, pidfile, gpidfile) = forking_script(dir.path());
    let dispatcher = ExecutorDispatcher::new(registry(), Isolation::Process)
        .with_command(ExecutorCommand::new("/bin/sh").arg("-c").arg(script))
        .with_default_timeout(Duration::from_millis(200));
    let handle = ExecutorHandle::new(Arc::new(dispatcher), "stub", Config::default());

    let err = handle.supported(&Context::background()).await.unwrap_err();
    assert!(matches!(err, VoldriveError::DeadlineExceeded(_)));
    assert!(!is_process_alive(read_pid(&pidfile)));
    assert!(gone_soon(read_pid(&gpidfile)));
}

#[tokio::test]
async fn test_typed_result_from_process() {
    let handle = sh_handle(
        r#"cat >/dev/null; echo '{"status":"ok","result":{"id":"node-7","driver":"stub"}}'"#
            .to_string(),
    );
    let id = handle.instance_id(&Context::background()).await.unwrap();
    assert_eq!(id.id, "node-7");
    assert_eq!(id.driver, "stub");
}

#[tokio::test]
async fn test_unregistered_executor_is_not_found() {
    let dispatcher = ExecutorDispatcher::new(registry(), Isolation::Process);
    let handle = ExecutorHandle::new(Arc::new(dispatcher), "ebs", Config::default());
    let err = handle.supported(&Context::background()).await.unwrap_err();
    assert!(matches!(err, VoldriveError::NotFound(_)));
}
