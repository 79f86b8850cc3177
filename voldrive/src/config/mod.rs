//! Layered configuration.
//!
//! A [`Config`] resolves dot-separated key paths against four layers with a
//! fixed precedence: explicit overrides, then environment variables, then
//! config files, then registered defaults. [`Config::scope`] returns a
//! namespaced view that falls back to its parent's lookup.
//!
//! Layers are written during bring-up only. Afterwards a `Config` is cloned
//! freely; clones and scopes share the same layers.

pub mod env;
mod file;
pub mod schema;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use voldrive_shared::errors::{VoldriveError, VoldriveResult};

pub use env::{EnvSnapshot, env_var_name};
use file::FlatMap;
pub use schema::{ConfigRegistration, ConfigSchema, KeyDescriptor, KeyType, LinkedConfig};

/// Well-known key paths.
pub mod keys {
    pub const HOST: &str = "voldrive.host";
    pub const SERVICE: &str = "voldrive.service";
    pub const LOG_LEVEL: &str = "voldrive.logLevel";
    pub const CORE_LOG_LEVEL: &str = "libvol.logging.level";
    pub const EXECUTOR_ISOLATION: &str = "libvol.executor.isolation";
    pub const EXECUTOR_PATH: &str = "libvol.executor.path";
    pub const EXECUTOR_TIMEOUT: &str = "libvol.executor.timeout";
    /// Prefix of per-service settings: `libvol.server.services.<svc>.*`.
    pub const SERVICES: &str = "libvol.server.services";

    /// Key naming the driver that serves `service`.
    pub fn service_driver(service: &str) -> String {
        format!("{}.{}.driver", SERVICES, service)
    }
}

/// Layer a resolved value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigSource {
    Override,
    Environment,
    File,
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConfigSource::Override => "override",
            ConfigSource::Environment => "environment",
            ConfigSource::File => "file",
            ConfigSource::Default => "default",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub value: Value,
    pub source: ConfigSource,
    /// Absolute key path that matched.
    pub key_path: String,
}

#[derive(Debug, Clone, Default)]
struct Layers {
    overrides: FlatMap,
    env: EnvSnapshot,
    file: FlatMap,
    defaults: FlatMap,
    /// Key paths that a snapshot enumerates.
    known: BTreeSet<String>,
    files_read: Vec<PathBuf>,
}

impl Layers {
    fn lookup(&self, key_path: &str) -> Option<(Value, ConfigSource)> {
        if let Some(v) = self.overrides.get(key_path) {
            return Some((v.clone(), ConfigSource::Override));
        }
        if let Some(v) = self.env.get(&env_var_name(key_path)) {
            return Some((Value::String(v.to_string()), ConfigSource::Environment));
        }
        if let Some(v) = self.file.get(key_path) {
            return Some((v.clone(), ConfigSource::File));
        }
        self.defaults
            .get(key_path)
            .map(|v| (v.clone(), ConfigSource::Default))
    }
}

#[derive(Clone)]
pub struct Config {
    layers: Arc<Layers>,
    /// Absolute scope prefixes, outermost first.
    scopes: Vec<String>,
}

impl Config {
    /// A configuration with no defaults. See [`ConfigSchema::new_config`].
    pub fn new(env: EnvSnapshot) -> Self {
        Self::from_layers(FlatMap::new(), BTreeSet::new(), env)
    }

    pub(crate) fn from_layers(defaults: FlatMap, known: BTreeSet<String>, env: EnvSnapshot) -> Self {
        Self {
            layers: Arc::new(Layers {
                defaults,
                known,
                env,
                ..Default::default()
            }),
            scopes: Vec::new(),
        }
    }

    /// Rebuild a configuration whose every value is an override.
    pub fn from_snapshot(snapshot: BTreeMap<String, Value>) -> Self {
        let overrides: FlatMap = snapshot
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        let known = overrides.keys().cloned().collect();
        Self {
            layers: Arc::new(Layers {
                overrides,
                known,
                ..Default::default()
            }),
            scopes: Vec::new(),
        }
    }

    // ========================================================================
    // BRING-UP
    // ========================================================================

    /// Merge a YAML file over the file layer.
    pub fn read_config_file(&mut self, path: &Path) -> VoldriveResult<()> {
        let flat = file::read_yaml_file(path)?;
        tracing::debug!(path = %path.display(), keys = flat.len(), "Read config file");
        let layers = Arc::make_mut(&mut self.layers);
        layers.merge_file(flat);
        layers.files_read.push(path.to_path_buf());
        Ok(())
    }

    /// Merge an in-memory YAML document over the file layer.
    pub fn read_config_str(&mut self, doc: &str) -> VoldriveResult<()> {
        let flat = file::parse_yaml(doc, "<inline>")?;
        Arc::make_mut(&mut self.layers).merge_file(flat);
        Ok(())
    }

    /// Record an explicit override. `key` is an absolute key path, whatever
    /// scope this view has.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        let key = key.to_lowercase();
        let layers = Arc::make_mut(&mut self.layers);
        layers.known.insert(key.clone());
        layers.overrides.insert(key, value.into());
    }

    /// Files merged so far, in order.
    pub fn files_read(&self) -> &[PathBuf] {
        &self.layers.files_read
    }

    pub fn env(&self) -> &EnvSnapshot {
        &self.layers.env
    }

    // ========================================================================
    // LOOKUP
    // ========================================================================

    /// Namespaced view: `k` resolves as `prefix.k`, then as the parent's `k`.
    pub fn scope(&self, prefix: &str) -> Self {
        let prefix = prefix.trim_matches('.').to_lowercase();
        let full = match self.scopes.last() {
            Some(outer) => format!("{}.{}", outer, prefix),
            None => prefix,
        };
        let mut scopes = self.scopes.clone();
        scopes.push(full);
        Self {
            layers: Arc::clone(&self.layers),
            scopes,
        }
    }

    /// Innermost scope prefix, if any.
    pub fn prefix(&self) -> Option<&str> {
        self.scopes.last().map(String::as_str)
    }

    fn candidates(&self, key: &str) -> Vec<String> {
        let key = key.to_lowercase();
        let mut out: Vec<String> = self
            .scopes
            .iter()
            .rev()
            .map(|scope| format!("{}.{}", scope, key))
            .collect();
        out.push(key);
        out
    }

    pub fn resolve(&self, key: &str) -> Option<Resolved> {
        self.candidates(key).into_iter().find_map(|key_path| {
            self.layers
                .lookup(&key_path)
                .map(|(value, source)| Resolved {
                    value,
                    source,
                    key_path,
                })
        })
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.resolve(key).map(|r| r.value)
    }

    /// True when a layer other than the defaults supplies `key`.
    pub fn is_set(&self, key: &str) -> bool {
        self.resolve(key)
            .is_some_and(|r| r.source != ConfigSource::Default)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            Value::Bool(b) => Some(b),
            Value::String(s) => env::parse_bool(&s),
            Value::Number(n) => n.as_i64().map(|n| n != 0),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Integers are milliseconds; strings may carry an `ms`, `s`, `m` or `h`
    /// suffix.
    pub fn get_duration_ms(&self, key: &str) -> VoldriveResult<Option<Duration>> {
        let Some(resolved) = self.resolve(key) else {
            return Ok(None);
        };
        let invalid = || {
            VoldriveError::InvalidConfig(format!(
                "{} ({}): expected a duration, got {}",
                resolved.key_path, resolved.source, resolved.value
            ))
        };
        match &resolved.value {
            Value::Number(n) => n.as_u64().map(Duration::from_millis).map(Some).ok_or_else(invalid),
            Value::String(s) => parse_duration(s).map(Some).ok_or_else(invalid),
            _ => Err(invalid()),
        }
    }

    /// Sequences as-is; strings split on commas and whitespace.
    pub fn get_string_list(&self, key: &str) -> Option<Vec<String>> {
        match self.get(key)? {
            Value::Array(items) => Some(
                items
                    .into_iter()
                    .filter_map(|v| match v {
                        Value::String(s) => Some(s),
                        Value::Null => None,
                        other => Some(other.to_string()),
                    })
                    .collect(),
            ),
            Value::String(s) => Some(
                s.split(|c: char| c == ',' || c.is_whitespace())
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Every known key visible from this view, resolved.
    ///
    /// Keys under a scope prefix also appear in their relative form, so the
    /// snapshot answers the same relative lookups as this view.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        let mut names = BTreeSet::new();
        for key in &self.layers.known {
            names.insert(key.clone());
            for scope in &self.scopes {
                if let Some(rest) = key.strip_prefix(scope.as_str()).and_then(|r| r.strip_prefix('.')) {
                    names.insert(rest.to_string());
                }
            }
        }
        names
            .into_iter()
            .filter_map(|name| self.get(&name).map(|v| (name, v)))
            .collect()
    }
}

impl Layers {
    fn merge_file(&mut self, flat: FlatMap) {
        for (key, value) in flat {
            self.known.insert(key.clone());
            self.file.insert(key, value);
        }
    }
}

fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let n: u64 = digits.parse().ok()?;
    match unit.trim() {
        "" | "ms" => Some(Duration::from_millis(n)),
        "s" => Some(Duration::from_secs(n)),
        "m" => n.checked_mul(60).map(Duration::from_secs),
        "h" => n.checked_mul(3600).map(Duration::from_secs),
        _ => None,
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(EnvSnapshot::empty())
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("scope", &self.prefix())
            .field("known_keys", &self.layers.known.len())
            .field("files_read", &self.layers.files_read)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn schema() -> ConfigSchema {
        let mut schema = ConfigSchema::new();
        schema.register(
            ConfigRegistration::new("test")
                .key(KeyType::String, None, "default", "", "a.b")
                .key(KeyType::Int, None, 5, "", "vfs.count"),
        );
        schema
    }

    #[test]
    fn test_precedence_falls_back_in_order() {
        let env = EnvSnapshot::from_pairs([("A_B", "env")]);
        let mut config = schema().new_config(env).unwrap();
        config.read_config_str("a:\n  b: file\n").unwrap();
        config.set("a.b", "override");

        let r = config.resolve("a.b").unwrap();
        assert_eq!((r.value, r.source), (Value::from("override"), ConfigSource::Override));

        // Same layers without the override.
        let mut config = schema()
            .new_config(EnvSnapshot::from_pairs([("A_B", "env")]))
            .unwrap();
        config.read_config_str("a:\n  b: file\n").unwrap();
        assert_eq!(config.resolve("a.b").map(|r| r.source), Some(ConfigSource::Environment));

        let mut config = schema().new_config(EnvSnapshot::empty()).unwrap();
        config.read_config_str("a:\n  b: file\n").unwrap();
        assert_eq!(config.get_string("a.b").as_deref(), Some("file"));

        let config = schema().new_config(EnvSnapshot::empty()).unwrap();
        assert_eq!(config.resolve("a.b").map(|r| r.source), Some(ConfigSource::Default));
        assert!(!config.is_set("a.b"));
    }

    #[test]
    fn test_keys_are_case_insensitive() {
        let mut config = Config::default();
        config.read_config_str("Voldrive:\n  LogLevel: debug\n").unwrap();
        assert_eq!(config.get_string("voldrive.logLevel").as_deref(), Some("debug"));
        assert_eq!(config.get_string("VOLDRIVE.LOGLEVEL").as_deref(), Some("debug"));
    }

    #[test]
    fn test_scope_prefers_prefixed_key() {
        let mut config = Config::default();
        config
            .read_config_str("vfs:\n  root: /global\nlibvol:\n  server:\n    services:\n      fast:\n        vfs:\n          root: /fast\n")
            .unwrap();

        let fast = config.scope("libvol.server.services.fast");
        let slow = config.scope("libvol.server.services.slow");
        assert_eq!(fast.get_string("vfs.root").as_deref(), Some("/fast"));
        assert_eq!(slow.get_string("vfs.root").as_deref(), Some("/global"));
        assert_eq!(fast.prefix(), Some("libvol.server.services.fast"));
    }

    #[test]
    fn test_nested_scopes() {
        let mut config = Config::default();
        config.set("a.b.k", 1);
        config.set("a.k", 2);
        config.set("k", 3);

        let ab = config.scope("a").scope("b");
        assert_eq!(ab.get_int("k"), Some(1));
        assert_eq!(config.scope("a").get_int("k"), Some(2));
        assert_eq!(config.scope("z").get_int("k"), Some(3));
    }

    #[test]
    fn test_read_config_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "libvol:\n  executor:\n    timeout: 250ms").unwrap();

        let mut config = Config::default();
        config.read_config_file(tmp.path()).unwrap();
        assert_eq!(config.files_read(), &[tmp.path().to_path_buf()]);
        assert_eq!(
            config.get_duration_ms(keys::EXECUTOR_TIMEOUT).unwrap(),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_malformed_file_is_invalid_config() {
        let mut config = Config::default();
        let err = config.read_config_str("a: [b").unwrap_err();
        assert!(matches!(err, VoldriveError::InvalidConfig(_)));
    }

    #[test]
    fn test_typed_getters() {
        let env = EnvSnapshot::from_pairs([("X_FLAG", "yes"), ("X_LIST", "a, b c")]);
        let mut config = Config::new(env);
        config.set("x.n", "42");
        config.set("x.d", "2s");
        config.set("x.bad", "soon");

        assert_eq!(config.get_bool("x.flag"), Some(true));
        assert_eq!(config.get_int("x.n"), Some(42));
        assert_eq!(
            config.get_string_list("x.list"),
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
        assert_eq!(config.get_duration_ms("x.d").unwrap(), Some(Duration::from_secs(2)));
        assert!(config.get_duration_ms("x.bad").is_err());
        assert_eq!(config.get_duration_ms("x.none").unwrap(), None);
    }

    #[test]
    fn test_overflowing_duration_is_invalid_config() {
        let mut config = Config::default();
        config.set("x.h", "9999999999999999999h");
        config.set("x.m", "999999999999999999m");
        config.set("x.ok", "90m");

        for key in ["x.h", "x.m"] {
            let err = config.get_duration_ms(key).unwrap_err();
            assert!(matches!(err, VoldriveError::InvalidConfig(_)), "{key}: {err:?}");
        }
        assert_eq!(
            config.get_duration_ms("x.ok").unwrap(),
            Some(Duration::from_secs(5400))
        );
    }

    #[test]
    fn test_snapshot_round_trip_keeps_scoped_view() {
        let mut config = schema().new_config(EnvSnapshot::from_pairs([("VFS_COUNT", "9")])).unwrap();
        config.set("libvol.server.services.s1.vfs.root", "/s1");

        let scoped = config.scope("libvol.server.services.s1");
        let rebuilt = Config::from_snapshot(scoped.snapshot());

        assert_eq!(rebuilt.get_string("vfs.root").as_deref(), Some("/s1"));
        assert_eq!(rebuilt.get_int("vfs.count"), Some(9));
        assert_eq!(rebuilt.get_string("a.b").as_deref(), Some("default"));
    }
}
