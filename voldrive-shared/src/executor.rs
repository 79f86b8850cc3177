//! Executor wire protocol.
//!
//! An [`ExecutorInvocation`] is written as a single JSON document to the
//! executor's stdin; the executor answers with one [`ExecutorResponse`] on
//! stdout and exits with [`exit_codes::OK`] on success. Any other exit status
//! is a failure regardless of what was written to stdout.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{VoldriveError, VoldriveResult};

/// Exit codes of the `voldrive-executor` binary.
pub mod exit_codes {
    pub const OK: i32 = 0;
    /// The operation ran and failed.
    pub const FAILED: i32 = 1;
    /// The invocation could not be read or named an unknown executor.
    pub const BAD_INVOCATION: i32 = 2;
}

// ============================================================================
// HOST IDENTITY
// ============================================================================

/// Identity of the host as seen by a storage provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceId {
    pub id: String,
    pub driver: String,
    /// Provider-specific extras (region, zone, ...).
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl InstanceId {
    pub fn new(id: impl Into<String>, driver: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            driver: driver.into(),
            fields: BTreeMap::new(),
        }
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.driver, self.id)
    }
}

/// How thoroughly `local_devices` should look for devices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceScanType {
    #[default]
    Quick,
    Deep,
}

/// Devices visible on this host, keyed by device path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDevices {
    pub driver: String,
    /// device path -> volume id
    #[serde(default)]
    pub device_map: BTreeMap<String, String>,
}

// ============================================================================
// OPERATIONS
// ============================================================================

/// A host-local operation together with its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ExecutorOp {
    /// Whether this executor can run on the current host.
    Supported,
    InstanceId,
    /// The next free device name, if the provider needs one chosen locally.
    NextDevice,
    LocalDevices {
        #[serde(default)]
        scan: DeviceScanType,
    },
    Mount {
        device: String,
        target: PathBuf,
        #[serde(default)]
        read_only: bool,
    },
    Unmount {
        target: PathBuf,
    },
}

impl ExecutorOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Supported => "supported",
            Self::InstanceId => "instance_id",
            Self::NextDevice => "next_device",
            Self::LocalDevices { .. } => "local_devices",
            Self::Mount { .. } => "mount",
            Self::Unmount { .. } => "unmount",
        }
    }
}

// ============================================================================
// INVOCATION / RESPONSE
// ============================================================================

/// Request-scoped state carried across the process boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    /// Time left until the caller's deadline when the invocation was built.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorInvocation {
    pub executor: String,
    pub operation: ExecutorOp,
    #[serde(default)]
    pub context: InvocationContext,
    /// Resolved, flattened configuration visible to the driver's scope.
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorStatus {
    Ok,
    Failed,
}

/// Error payload of a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorResponse {
    pub status: ExecutorStatus,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl ExecutorResponse {
    pub fn ok(result: Value) -> Self {
        Self {
            status: ExecutorStatus::Ok,
            result,
            error: None,
        }
    }

    pub fn failed(err: &VoldriveError) -> Self {
        Self {
            status: ExecutorStatus::Failed,
            result: Value::Null,
            error: Some(WireError {
                kind: err.kind().to_string(),
                message: err.to_string(),
            }),
        }
    }

    /// Convert into the caller-facing result.
    ///
    /// A `Failed` status becomes [`VoldriveError::ExecutorFailed`] with the
    /// supplied diagnostics attached.
    pub fn into_result(
        self,
        executor: &str,
        operation: &str,
        exit_status: Option<i32>,
        diagnostics: String,
    ) -> VoldriveResult<Value> {
        match self.status {
            ExecutorStatus::Ok => Ok(self.result),
            ExecutorStatus::Failed => {
                let message = self
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "executor reported failure".to_string());
                Err(VoldriveError::ExecutorFailed {
                    executor: executor.to_string(),
                    operation: operation.to_string(),
                    status: exit_status,
                    message,
                    diagnostics,
                })
            }
        }
    }
}
