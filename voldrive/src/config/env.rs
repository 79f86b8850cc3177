//! Environment layer of the configuration.
//!
//! The process environment is captured once into an [`EnvSnapshot`] at
//! bring-up. Alias defaulting between the product (`VOLDRIVE_*`) and core
//! (`LIBVOL_*`) namespaces happens on the snapshot, so nothing writes to the
//! real process environment.

use std::collections::BTreeMap;

/// Well-known environment variables.
pub mod vars {
    pub const APP_TOKEN: &str = "LIBVOL_APPTOKEN";
    pub const DEFAULT_APP_TOKEN: &str = "voldrive";

    pub const VOLDRIVE_HOME: &str = "VOLDRIVE_HOME";
    pub const LIBVOL_HOME: &str = "LIBVOL_HOME";

    pub const VOLDRIVE_LOGLEVEL: &str = "VOLDRIVE_LOGLEVEL";
    pub const LIBVOL_LOGGING_LEVEL: &str = "LIBVOL_LOGGING_LEVEL";

    pub const VOLDRIVE_DEBUG: &str = "VOLDRIVE_DEBUG";
    pub const LIBVOL_DEBUG: &str = "LIBVOL_DEBUG";

    /// Pairs that default from each other when only one side is set.
    pub const ALIASES: &[(&str, &str)] = &[
        (VOLDRIVE_HOME, LIBVOL_HOME),
        (VOLDRIVE_LOGLEVEL, LIBVOL_LOGGING_LEVEL),
        (VOLDRIVE_DEBUG, LIBVOL_DEBUG),
    ];
}

/// Environment variable consulted for a configuration key path.
///
/// `libvol.logging.level` -> `LIBVOL_LOGGING_LEVEL`,
/// `voldrive.logLevel` -> `VOLDRIVE_LOGLEVEL`.
pub fn env_var_name(key_path: &str) -> String {
    key_path
        .chars()
        .map(|c| match c {
            '.' | '-' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}

/// Immutable copy of the environment used for configuration lookups.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvSnapshot {
    /// Capture the current process environment.
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// An empty environment, handy for tests and embedding.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Value of `name`; empty strings count as unset.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    /// Parse `name` as a boolean (`1`, `true`, `yes`, `on`, case-insensitive).
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(parse_bool)
    }

    /// Apply the app-token default and the two-namespace aliases.
    pub fn with_aliases(mut self) -> Self {
        if !self.is_set(vars::APP_TOKEN) {
            self.set(vars::APP_TOKEN, vars::DEFAULT_APP_TOKEN);
        }

        for (product, core) in vars::ALIASES {
            let product_val = self.get(product).map(str::to_string);
            let core_val = self.get(core).map(str::to_string);
            match (product_val, core_val) {
                (Some(v), None) => self.set(*core, v),
                (None, Some(v)) => self.set(*product, v),
                _ => {}
            }
        }
        self
    }

    /// Record a log level given on the command line in both namespaces.
    pub fn with_log_level(mut self, level: &str) -> Self {
        self.set(vars::VOLDRIVE_LOGLEVEL, level);
        self.set(vars::LIBVOL_LOGGING_LEVEL, level);
        self
    }

    pub fn app_token(&self) -> &str {
        self.get(vars::APP_TOKEN).unwrap_or(vars::DEFAULT_APP_TOKEN)
    }
}

pub(crate) fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "f" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_name() {
        assert_eq!(env_var_name("libvol.logging.level"), "LIBVOL_LOGGING_LEVEL");
        assert_eq!(env_var_name("voldrive.logLevel"), "VOLDRIVE_LOGLEVEL");
        assert_eq!(env_var_name("vfs.instance-id"), "VFS_INSTANCE_ID");
    }

    #[test]
    fn test_home_defaults_from_other_namespace() {
        let env = EnvSnapshot::from_pairs([(vars::VOLDRIVE_HOME, "/opt/vd")]).with_aliases();
        assert_eq!(env.get(vars::LIBVOL_HOME), Some("/opt/vd"));

        let env = EnvSnapshot::from_pairs([(vars::LIBVOL_HOME, "/opt/lv")]).with_aliases();
        assert_eq!(env.get(vars::VOLDRIVE_HOME), Some("/opt/lv"));
    }

    #[test]
    fn test_both_set_are_left_alone() {
        let env = EnvSnapshot::from_pairs([
            (vars::VOLDRIVE_LOGLEVEL, "info"),
            (vars::LIBVOL_LOGGING_LEVEL, "debug"),
        ])
        .with_aliases();
        assert_eq!(env.get(vars::VOLDRIVE_LOGLEVEL), Some("info"));
        assert_eq!(env.get(vars::LIBVOL_LOGGING_LEVEL), Some("debug"));
    }

    #[test]
    fn test_app_token_default() {
        let env = EnvSnapshot::empty().with_aliases();
        assert_eq!(env.app_token(), "voldrive");

        let env = EnvSnapshot::from_pairs([(vars::APP_TOKEN, "acme")]).with_aliases();
        assert_eq!(env.app_token(), "acme");
    }

    #[test]
    fn test_empty_value_is_unset() {
        let env = EnvSnapshot::from_pairs([(vars::LIBVOL_DEBUG, "")]);
        assert!(!env.is_set(vars::LIBVOL_DEBUG));
    }

    #[test]
    fn test_get_bool() {
        let env = EnvSnapshot::from_pairs([("A", "TRUE"), ("B", "0"), ("C", "maybe")]);
        assert_eq!(env.get_bool("A"), Some(true));
        assert_eq!(env.get_bool("B"), Some(false));
        assert_eq!(env.get_bool("C"), None);
    }
}
