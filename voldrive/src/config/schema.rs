//! Declarative configuration options.
//!
//! Components describe the keys they read with a [`ConfigRegistration`]
//! during bring-up. Linked backends submit theirs through `inventory`, so
//! the schema always matches the set of drivers compiled into the binary.

use std::collections::BTreeSet;

use serde_json::Value;
use voldrive_shared::errors::VoldriveResult;

use super::env::EnvSnapshot;
use super::file::{FlatMap, parse_yaml};
use super::{Config, keys};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    String,
    Int,
    Bool,
    StringList,
    /// Milliseconds, or a string such as `30s`, `500ms`, `2m`.
    Duration,
}

/// One configuration option.
#[derive(Debug, Clone)]
pub struct KeyDescriptor {
    pub key_type: KeyType,
    /// Single-letter command line flag, if any.
    pub short: Option<char>,
    pub default: Value,
    pub description: String,
    /// Dot-separated path, stored lower-cased.
    pub key_path: String,
}

/// A named group of options, optionally with a YAML document of defaults.
#[derive(Debug, Clone)]
pub struct ConfigRegistration {
    name: String,
    defaults_yaml: Option<String>,
    keys: Vec<KeyDescriptor>,
}

impl ConfigRegistration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            defaults_yaml: None,
            keys: Vec::new(),
        }
    }

    /// Defaults expressed as a YAML document.
    pub fn yaml(mut self, doc: impl Into<String>) -> Self {
        self.defaults_yaml = Some(doc.into());
        self
    }

    pub fn key(
        mut self,
        key_type: KeyType,
        short: Option<char>,
        default: impl Into<Value>,
        description: impl Into<String>,
        key_path: &str,
    ) -> Self {
        self.keys.push(KeyDescriptor {
            key_type,
            short,
            default: default.into(),
            description: description.into(),
            key_path: key_path.to_lowercase(),
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn keys(&self) -> &[KeyDescriptor] {
        &self.keys
    }
}

/// Registration contributed by a linked backend.
pub struct LinkedConfig {
    pub register: fn() -> ConfigRegistration,
}

inventory::collect!(LinkedConfig);

/// Options every binary understands.
pub fn global_registration() -> ConfigRegistration {
    ConfigRegistration::new("Global")
        .yaml("voldrive:\n  logLevel: warn\n")
        .key(KeyType::String, Some('h'), "", "The libvol host.", keys::HOST)
        .key(KeyType::String, Some('s'), "", "The libvol service.", keys::SERVICE)
        .key(
            KeyType::String,
            Some('l'),
            "warn",
            "The log level (error, warn, info, debug)",
            keys::LOG_LEVEL,
        )
        .key(
            KeyType::String,
            None,
            Value::Null,
            "The core log level, consulted after voldrive.logLevel",
            keys::CORE_LOG_LEVEL,
        )
        .key(
            KeyType::String,
            None,
            "process",
            "How executors run: process or inprocess",
            keys::EXECUTOR_ISOLATION,
        )
        .key(
            KeyType::String,
            None,
            Value::Null,
            "Path of the voldrive-executor binary",
            keys::EXECUTOR_PATH,
        )
        .key(
            KeyType::Duration,
            None,
            60_000,
            "Executor timeout used when the request has no deadline",
            keys::EXECUTOR_TIMEOUT,
        )
}

/// Every option known to this binary.
#[derive(Debug, Clone, Default)]
pub struct ConfigSchema {
    registrations: Vec<ConfigRegistration>,
}

impl ConfigSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Global options plus everything linked backends submitted.
    pub fn linked() -> Self {
        let mut schema = Self::new();
        schema.register(global_registration());
        for linked in inventory::iter::<LinkedConfig> {
            schema.register((linked.register)());
        }
        schema
    }

    pub fn register(&mut self, registration: ConfigRegistration) {
        tracing::trace!(
            registration = %registration.name,
            keys = registration.keys.len(),
            "Registering config options"
        );
        self.registrations.push(registration);
    }

    pub fn registrations(&self) -> &[ConfigRegistration] {
        &self.registrations
    }

    pub fn keys(&self) -> impl Iterator<Item = &KeyDescriptor> {
        self.registrations.iter().flat_map(|r| r.keys.iter())
    }

    /// Descriptor for `key_path`, the latest registration wins.
    pub fn key(&self, key_path: &str) -> Option<&KeyDescriptor> {
        let key_path = key_path.to_lowercase();
        self.keys().filter(|k| k.key_path == key_path).last()
    }

    /// Descriptor bound to a short flag.
    pub fn short_flag(&self, short: char) -> Option<&KeyDescriptor> {
        self.keys().filter(|k| k.short == Some(short)).last()
    }

    /// Build a configuration seeded with every registered default.
    pub fn new_config(&self, env: EnvSnapshot) -> VoldriveResult<Config> {
        let mut defaults = FlatMap::new();
        let mut known = BTreeSet::new();

        for registration in &self.registrations {
            if let Some(doc) = &registration.defaults_yaml {
                let origin = format!("{} defaults", registration.name);
                for (key, value) in parse_yaml(doc, &origin)? {
                    known.insert(key.clone());
                    defaults.insert(key, value);
                }
            }
            for key in &registration.keys {
                known.insert(key.key_path.clone());
                if !key.default.is_null() {
                    defaults.insert(key.key_path.clone(), key.default.clone());
                }
            }
        }

        Ok(Config::from_layers(defaults, known, env))
    }
}
