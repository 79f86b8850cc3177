//! On-disk locations.
//!
//! Resolved once at bring-up from the home directory and the app token, then
//! carried read-only in the request context.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use voldrive_shared::errors::{VoldriveError, VoldriveResult};

use crate::config::env::{EnvSnapshot, vars};

pub const KNOWN_HOSTS: &str = "known_hosts";
pub const DEFAULT_CONFIG_FILE: &str = "config.yml";
pub const LOG_FILE: &str = "voldrive.log";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathConfig {
    pub home: PathBuf,
    pub token: String,
    pub etc: PathBuf,
    pub lib: PathBuf,
    pub log: PathBuf,
    pub run: PathBuf,
    pub tls: PathBuf,
    pub default_tls_known_hosts: PathBuf,
    pub user_home: PathBuf,
    pub user_default_tls_known_hosts: PathBuf,
}

impl PathConfig {
    /// Layout under `home` for `token`; `user_home` is the invoking user's
    /// home directory.
    pub fn new(home: &Path, token: &str, user_home: &Path) -> Self {
        let etc = home.join("etc").join(token);
        let tls = etc.join("tls");
        let user_home = user_home.join(format!(".{}", token));
        Self {
            home: home.to_path_buf(),
            token: token.to_string(),
            lib: home.join("var/lib").join(token),
            log: home.join("var/log").join(token),
            run: home.join("var/run").join(token),
            default_tls_known_hosts: tls.join(KNOWN_HOSTS),
            user_default_tls_known_hosts: user_home.join(KNOWN_HOSTS),
            etc,
            tls,
            user_home,
        }
    }

    /// Home from `VOLDRIVE_HOME` (default `/`), token from the app token.
    pub fn from_env(env: &EnvSnapshot) -> VoldriveResult<Self> {
        let home = PathBuf::from(env.get(vars::VOLDRIVE_HOME).unwrap_or("/"));
        if !home.is_absolute() {
            return Err(VoldriveError::InvalidConfig(format!(
                "{} must be an absolute path, got: {}",
                vars::VOLDRIVE_HOME,
                home.display()
            )));
        }
        let user_home = dirs::home_dir().unwrap_or_else(|| home.clone());
        Ok(Self::new(&home, env.app_token(), &user_home))
    }

    /// Config files consulted when none is given explicitly, in merge order.
    pub fn default_config_files(&self) -> [PathBuf; 2] {
        [
            self.etc.join(DEFAULT_CONFIG_FILE),
            self.user_home.join(DEFAULT_CONFIG_FILE),
        ]
    }

    pub fn log_file(&self) -> PathBuf {
        self.log.join(LOG_FILE)
    }

    /// Create the user known-hosts file, and its parents, when missing.
    pub fn ensure_known_hosts(&self) -> VoldriveResult<&Path> {
        let path = self.user_default_tls_known_hosts.as_path();
        if path.exists() {
            return Ok(path);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                VoldriveError::Storage(format!(
                    "known_hosts setup: cannot create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        std::fs::File::create(path).map_err(|e| {
            VoldriveError::Storage(format!(
                "known_hosts setup: cannot create {}: {}",
                path.display(),
                e
            ))
        })?;
        tracing::debug!(path = %path.display(), "Created known_hosts");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout() {
        let paths = PathConfig::new(Path::new("/opt/vd"), "voldrive", Path::new("/home/u"));
        assert_eq!(paths.etc, PathBuf::from("/opt/vd/etc/voldrive"));
        assert_eq!(paths.lib, PathBuf::from("/opt/vd/var/lib/voldrive"));
        assert_eq!(paths.log_file(), PathBuf::from("/opt/vd/var/log/voldrive/voldrive.log"));
        assert_eq!(
            paths.user_default_tls_known_hosts,
            PathBuf::from("/home/u/.voldrive/known_hosts")
        );
        assert_eq!(
            paths.default_tls_known_hosts,
            PathBuf::from("/opt/vd/etc/voldrive/tls/known_hosts")
        );
    }

    #[test]
    fn test_relative_home_rejected() {
        let env = EnvSnapshot::from_pairs([(vars::VOLDRIVE_HOME, "relative/home")]);
        assert!(matches!(
            PathConfig::from_env(&env),
            Err(VoldriveError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_ensure_known_hosts_creates_once() {
        let tmp = TempDir::new().unwrap();
        let paths = PathConfig::new(tmp.path(), "acme", tmp.path());

        let created = paths.ensure_known_hosts().unwrap().to_path_buf();
        assert!(created.is_file());
        assert_eq!(created, tmp.path().join(".acme/known_hosts"));

        std::fs::write(&created, "host key\n").unwrap();
        paths.ensure_known_hosts().unwrap();
        assert_eq!(std::fs::read_to_string(&created).unwrap(), "host key\n");
    }
}
