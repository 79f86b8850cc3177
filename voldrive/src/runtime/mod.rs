//! Process bring-up.
//!
//! [`VoldriveRuntime::new`] does all setup before returning: environment,
//! paths, configuration, logging, registries and the router. Nothing is
//! lazily half-built afterwards except driver instances, which the router
//! creates on first use.

mod options;

use std::path::Path;
use std::sync::Arc;

use tracing::level_filters::LevelFilter;
use voldrive_shared::errors::{VoldriveError, VoldriveResult};

use crate::config::{Config, ConfigSchema, EnvSnapshot, keys as config_keys};
use crate::context::{Context, TransactionId, keys};
use crate::driver::DriverRegistry;
use crate::executor::{ExecutorDispatcher, ExecutorRegistry};
use crate::logging::{init_logging, resolve_log_level};
use crate::metrics::RouterMetricsStorage;
use crate::paths::PathConfig;
use crate::router::Router;

pub use options::VoldriveOptions;

/// A configured router plus the root context requests derive from.
///
/// Cheap to clone; clones share the router.
#[derive(Clone)]
pub struct VoldriveRuntime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    paths: PathConfig,
    config: Config,
    log_level: LevelFilter,
    router: Router,
    context: Context,
}

impl VoldriveRuntime {
    /// Bring up with every backend linked into the binary.
    pub fn new(options: VoldriveOptions, env: EnvSnapshot) -> VoldriveResult<Self> {
        let drivers = DriverRegistry::linked(options.override_policy)?;
        let executors = ExecutorRegistry::linked(options.override_policy)?;
        Self::with_registries(options, env, drivers, executors)
    }

    /// Bring up with caller-built registries. Both are sealed here.
    pub fn with_registries(
        options: VoldriveOptions,
        env: EnvSnapshot,
        mut drivers: DriverRegistry,
        mut executors: ExecutorRegistry,
    ) -> VoldriveResult<Self> {
        let mut env = env.with_aliases();
        if let Some(level) = &options.log_level {
            env = env.with_log_level(level);
        }

        let mut paths = PathConfig::from_env(&env)?;
        if let Some(user_home) = &options.user_home {
            paths = PathConfig::new(&paths.home, &paths.token, user_home);
        }

        let mut config = ConfigSchema::linked().new_config(env)?;
        read_config_files(&mut config, &options, &paths)?;
        apply_overrides(&mut config, &options);

        let log_level = resolve_log_level(&config);
        if options.init_logging {
            init_logging(log_level, &paths);
        }
        tracing::debug!(
            home = %paths.home.display(),
            token = %paths.token,
            level = %log_level,
            files = ?config.files_read(),
            "Configuration resolved"
        );

        let known_hosts = paths.ensure_known_hosts().inspect_err(|e| {
            tracing::error!(error = %e, "Runtime bring-up failed at known_hosts setup");
        })?;
        tracing::debug!(path = %known_hosts.display(), "Known hosts file ready");

        drivers.seal();
        executors.seal();
        tracing::info!(
            drivers = ?drivers.names(),
            executors = ?executors.names(),
            "Backends registered"
        );

        let metrics = Arc::new(RouterMetricsStorage::new());
        let dispatcher = ExecutorDispatcher::from_config(Arc::new(executors), &config)?
            .with_metrics(Arc::clone(&metrics));
        let router = Router::new(
            Arc::new(drivers),
            Arc::new(dispatcher),
            config.clone(),
            metrics,
        )?;

        let mut context = Context::background()
            .with_value(keys::PATH_CONFIG, paths.clone())
            .with_value(keys::LOG_LEVEL, log_level);
        if let Some(host) = config.get_string(config_keys::HOST).filter(|h| !h.is_empty()) {
            context = context.with_value(keys::HOST, host);
        }

        Ok(Self {
            inner: Arc::new(RuntimeInner {
                paths,
                config,
                log_level,
                router,
                context,
            }),
        })
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    /// Root context: path configuration, log level and host.
    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    /// A root-derived context with a fresh transaction id.
    pub fn request_context(&self) -> Context {
        self.inner
            .context
            .with_transaction_id(TransactionId::new())
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn paths(&self) -> &PathConfig {
        &self.inner.paths
    }

    pub fn log_level(&self) -> LevelFilter {
        self.inner.log_level
    }

    /// `voldrive.service`, when configured.
    pub fn default_service(&self) -> Option<String> {
        self.inner
            .config
            .get_string(config_keys::SERVICE)
            .filter(|s| !s.is_empty())
    }
}

impl std::fmt::Debug for VoldriveRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoldriveRuntime")
            .field("home", &self.inner.paths.home)
            .field("log_level", &self.inner.log_level)
            .field("router", &self.inner.router)
            .finish()
    }
}

fn read_config_files(
    config: &mut Config,
    options: &VoldriveOptions,
    paths: &PathConfig,
) -> VoldriveResult<()> {
    if let Some(file) = &options.config_file {
        if !file.is_file() {
            return Err(VoldriveError::InvalidConfig(format!(
                "config file not found: {}",
                file.display()
            )));
        }
        return config.read_config_file(file);
    }

    for file in paths.default_config_files() {
        if Path::new(&file).is_file() {
            config.read_config_file(&file)?;
        }
    }
    Ok(())
}

fn apply_overrides(config: &mut Config, options: &VoldriveOptions) {
    if let Some(level) = &options.log_level {
        config.set(config_keys::LOG_LEVEL, level.as_str());
    }
    if let Some(host) = &options.host {
        config.set(config_keys::HOST, host.as_str());
    }
    if let Some(service) = &options.service {
        config.set(config_keys::SERVICE, service.as_str());
    }
    if let Some(isolation) = options.isolation {
        config.set(config_keys::EXECUTOR_ISOLATION, isolation.to_string());
    }
    if let Some(path) = &options.executor_path {
        config.set(config_keys::EXECUTOR_PATH, path.display().to_string());
    }
    for (key, value) in &options.overrides {
        config.set(key, value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::env::vars;
    use crate::executor::Isolation;
    use tempfile::TempDir;

    struct Fixture {
        home: TempDir,
        user: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                home: TempDir::new().unwrap(),
                user: TempDir::new().unwrap(),
            }
        }

        fn env(&self) -> EnvSnapshot {
            EnvSnapshot::from_pairs([(vars::VOLDRIVE_HOME, self.home.path().display().to_string())])
        }

        fn options(&self) -> VoldriveOptions {
            VoldriveOptions {
                user_home: Some(self.user.path().to_path_buf()),
                init_logging: false,
                ..Default::default()
            }
        }
    }

    #[test]
    fn test_bring_up_defaults() {
        let fx = Fixture::new();
        let rt = VoldriveRuntime::new(fx.options(), fx.env()).unwrap();

        assert_eq!(rt.paths().home, fx.home.path());
        assert_eq!(rt.paths().token, "voldrive");
        assert!(rt.paths().user_default_tls_known_hosts.is_file());
        assert_eq!(rt.log_level(), LevelFilter::WARN);
        assert_eq!(rt.router().dispatcher().isolation(), Isolation::Process);
        assert!(rt.context().path_config().is_some());
        assert_eq!(rt.context().log_level(), Some(LevelFilter::WARN));
        assert!(rt.default_service().is_none());
    }

    #[test]
    fn test_options_override_file() {
        let fx = Fixture::new();
        let file = fx.home.path().join("custom.yml");
        std::fs::write(
            &file,
            "voldrive:\n  service: fromfile\n  logLevel: info\nlibvol:\n  executor:\n    isolation: inprocess\n",
        )
        .unwrap();

        let options = VoldriveOptions {
            config_file: Some(file),
            service: Some("fromflag".into()),
            host: Some("unix:///run/voldrive.sock".into()),
            ..fx.options()
        };
        let rt = VoldriveRuntime::new(options, fx.env()).unwrap();

        assert_eq!(rt.default_service().as_deref(), Some("fromflag"));
        assert_eq!(rt.log_level(), LevelFilter::INFO);
        assert_eq!(rt.router().dispatcher().isolation(), Isolation::InProcess);
        assert_eq!(
            rt.context().value::<String>(keys::HOST).map(String::as_str),
            Some("unix:///run/voldrive.sock")
        );
    }

    #[test]
    fn test_known_hosts_failure_aborts_bring_up() {
        let fx = Fixture::new();
        let not_a_dir = fx.user.path().join("file");
        std::fs::write(&not_a_dir, "").unwrap();
        let options = VoldriveOptions {
            user_home: Some(not_a_dir),
            ..fx.options()
        };

        let err = VoldriveRuntime::new(options, fx.env()).unwrap_err();
        assert!(
            matches!(err, VoldriveError::Storage(ref m) if m.starts_with("known_hosts setup")),
            "got {err:?}"
        );
    }

    #[test]
    fn test_missing_explicit_config_file() {
        let fx = Fixture::new();
        let options = VoldriveOptions {
            config_file: Some(fx.home.path().join("nope.yml")),
            ..fx.options()
        };
        let err = VoldriveRuntime::new(options, fx.env()).unwrap_err();
        assert!(matches!(err, VoldriveError::InvalidConfig(_)));
    }

    #[test]
    fn test_default_config_file_is_read() {
        let fx = Fixture::new();
        let etc = fx.home.path().join("etc/voldrive");
        std::fs::create_dir_all(&etc).unwrap();
        std::fs::write(etc.join("config.yml"), "voldrive:\n  service: vfs\n").unwrap();

        let rt = VoldriveRuntime::new(fx.options(), fx.env()).unwrap();
        assert_eq!(rt.default_service().as_deref(), Some("vfs"));
        assert_eq!(rt.config().files_read().len(), 1);
    }

    #[test]
    fn test_env_debug_alias_sets_level() {
        let fx = Fixture::new();
        let mut env = fx.env();
        env.set(vars::LIBVOL_DEBUG, "true");
        let rt = VoldriveRuntime::new(fx.options(), env).unwrap();
        assert_eq!(rt.log_level(), LevelFilter::DEBUG);
    }

    #[test]
    fn test_bad_isolation_aborts_bring_up() {
        let fx = Fixture::new();
        let options = fx
            .options()
            .with_override(config_keys::EXECUTOR_ISOLATION, "container");
        let err = VoldriveRuntime::new(options, fx.env()).unwrap_err();
        assert!(matches!(err, VoldriveError::InvalidConfig(_)));
    }

    #[test]
    fn test_requests_get_fresh_transaction_ids() {
        let fx = Fixture::new();
        let rt = VoldriveRuntime::new(fx.options(), fx.env()).unwrap();
        let a = rt.request_context();
        let b = rt.request_context();
        assert_ne!(a.transaction_id(), b.transaction_id());
        assert!(rt.context().transaction_id().is_none());
    }
}
