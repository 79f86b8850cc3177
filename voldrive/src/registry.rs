//! Name-keyed catalogs populated during bring-up, then sealed.
//!
//! Both the driver registry and the executor registry are a [`Registry`]
//! over their constructor type. Writes require `&mut self` and are only
//! accepted in [`RegistryPhase::BringUp`]; once [`Registry::seal`] runs the
//! registry is shared behind an `Arc` and only read.

use std::collections::HashMap;

use voldrive_shared::errors::{VoldriveError, VoldriveResult};

/// What happens when a name is registered twice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverridePolicy {
    /// Fail with [`VoldriveError::DuplicateDriver`]; the first registration stays.
    #[default]
    Reject,
    /// Replace the existing entry in place (keeps its position in `names()`).
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryPhase {
    BringUp,
    Sealed,
}

pub struct Registry<T> {
    kind: &'static str,
    policy: OverridePolicy,
    phase: RegistryPhase,
    /// Registration order, original spelling.
    entries: Vec<(String, T)>,
    /// Lower-cased name -> position in `entries`.
    index: HashMap<String, usize>,
}

impl<T> Registry<T> {
    /// Create an empty registry in the bring-up phase.
    ///
    /// `kind` names what is being registered ("driver", "executor") and only
    /// shows up in errors and logs.
    pub fn new(kind: &'static str, policy: OverridePolicy) -> Self {
        Self {
            kind,
            policy,
            phase: RegistryPhase::BringUp,
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, item: T) -> VoldriveResult<()> {
        let name = name.into();

        if self.phase == RegistryPhase::Sealed {
            return Err(VoldriveError::InvalidState(format!(
                "{} registry is sealed, cannot register {}",
                self.kind, name
            )));
        }
        if name.trim().is_empty() {
            return Err(VoldriveError::InvalidArgument(format!(
                "{} name must not be empty",
                self.kind
            )));
        }

        let key = name.to_lowercase();
        if let Some(&pos) = self.index.get(&key) {
            return match self.policy {
                OverridePolicy::Reject => {
                    tracing::warn!(kind = self.kind, name = %name, "Rejected duplicate registration");
                    Err(VoldriveError::DuplicateDriver(format!("{} {}", self.kind, name)))
                }
                OverridePolicy::Replace => {
                    tracing::warn!(
                        kind = self.kind,
                        name = %name,
                        previous = %self.entries[pos].0,
                        "Replacing existing registration"
                    );
                    self.entries[pos] = (name, item);
                    Ok(())
                }
            };
        }

        tracing::debug!(kind = self.kind, name = %name, "Registered");
        self.index.insert(key, self.entries.len());
        self.entries.push((name, item));
        Ok(())
    }

    /// End bring-up. Idempotent.
    pub fn seal(&mut self) {
        if self.phase != RegistryPhase::Sealed {
            tracing::debug!(kind = self.kind, count = self.entries.len(), "Sealing registry");
            self.phase = RegistryPhase::Sealed;
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.phase == RegistryPhase::Sealed
    }

    pub fn phase(&self) -> RegistryPhase {
        self.phase
    }

    pub fn policy(&self) -> OverridePolicy {
        self.policy
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Case-insensitive exact lookup.
    pub fn get(&self, name: &str) -> Option<&T> {
        self.index
            .get(&name.to_lowercase())
            .map(|&pos| &self.entries[pos].1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(&name.to_lowercase())
    }

    /// Registered names in insertion order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> std::fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("kind", &self.kind)
            .field("phase", &self.phase)
            .field("names", &self.names())
            .finish()
    }
}
