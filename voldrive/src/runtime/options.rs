//! Options that drive runtime bring-up.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::Value;

use crate::executor::Isolation;
use crate::registry::OverridePolicy;

/// Inputs to [`VoldriveRuntime::new`](super::VoldriveRuntime::new).
///
/// Every `Some` field becomes a configuration override, so it beats the
/// environment and any config file.
#[derive(Debug, Clone)]
pub struct VoldriveOptions {
    /// Config file to read instead of the default locations. Must exist.
    pub config_file: Option<PathBuf>,
    /// `voldrive.logLevel`.
    pub log_level: Option<String>,
    /// `voldrive.host`.
    pub host: Option<String>,
    /// `voldrive.service`, the service used when a request names none.
    pub service: Option<String>,
    /// `libvol.executor.isolation`.
    pub isolation: Option<Isolation>,
    /// `libvol.executor.path`.
    pub executor_path: Option<PathBuf>,
    /// What a second registration of the same backend name does.
    pub override_policy: OverridePolicy,
    /// Extra key path overrides, applied last.
    pub overrides: BTreeMap<String, Value>,
    /// Directory standing in for the user's home (`~/.{token}` lives under it).
    pub user_home: Option<PathBuf>,
    /// Install the global tracing subscriber.
    pub init_logging: bool,
}

impl Default for VoldriveOptions {
    fn default() -> Self {
        Self {
            config_file: None,
            log_level: None,
            host: None,
            service: None,
            isolation: None,
            executor_path: None,
            override_policy: OverridePolicy::default(),
            overrides: BTreeMap::new(),
            user_home: None,
            init_logging: true,
        }
    }
}

impl VoldriveOptions {
    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }
}
