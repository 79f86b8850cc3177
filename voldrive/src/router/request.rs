//! Typed requests and replies carried through the router.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::driver::{
    MountInfo, Volume, VolumeAttachOpts, VolumeAttachment, VolumeCreateOpts, VolumeDetachOpts,
    VolumeInspectOpts, VolumeMountOpts, VolumeRemoveOpts, VolumeUnmountOpts, VolumesOpts,
};

/// One volume operation addressed to a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeRequest {
    pub service: String,
    pub op: VolumeOp,
}

impl VolumeRequest {
    pub fn new(service: impl Into<String>, op: VolumeOp) -> Self {
        Self {
            service: service.into(),
            op,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum VolumeOp {
    Volumes {
        #[serde(default)]
        opts: VolumesOpts,
    },
    Inspect {
        volume: String,
        #[serde(default)]
        opts: VolumeInspectOpts,
    },
    Create {
        name: String,
        #[serde(default)]
        opts: VolumeCreateOpts,
    },
    Remove {
        volume: String,
        #[serde(default)]
        opts: VolumeRemoveOpts,
    },
    Attach {
        volume: String,
        #[serde(default)]
        opts: VolumeAttachOpts,
    },
    Detach {
        volume: String,
        #[serde(default)]
        opts: VolumeDetachOpts,
    },
    Mount {
        volume: String,
        #[serde(default)]
        opts: VolumeMountOpts,
    },
    Unmount {
        volume: String,
        #[serde(default)]
        opts: VolumeUnmountOpts,
    },
    Path {
        volume: String,
    },
}

impl VolumeOp {
    pub fn name(&self) -> &'static str {
        match self {
            VolumeOp::Volumes { .. } => "volumes",
            VolumeOp::Inspect { .. } => "inspect",
            VolumeOp::Create { .. } => "create",
            VolumeOp::Remove { .. } => "remove",
            VolumeOp::Attach { .. } => "attach",
            VolumeOp::Detach { .. } => "detach",
            VolumeOp::Mount { .. } => "mount",
            VolumeOp::Unmount { .. } => "unmount",
            VolumeOp::Path { .. } => "path",
        }
    }

    /// The volume id or name the operation targets, if any.
    pub fn volume(&self) -> Option<&str> {
        match self {
            VolumeOp::Volumes { .. } => None,
            VolumeOp::Create { name, .. } => Some(name),
            VolumeOp::Inspect { volume, .. }
            | VolumeOp::Remove { volume, .. }
            | VolumeOp::Attach { volume, .. }
            | VolumeOp::Detach { volume, .. }
            | VolumeOp::Mount { volume, .. }
            | VolumeOp::Unmount { volume, .. }
            | VolumeOp::Path { volume } => Some(volume),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum VolumeReply {
    Volumes(Vec<Volume>),
    Volume(Volume),
    Attachment(VolumeAttachment),
    Mount(MountInfo),
    Path(Option<PathBuf>),
    Removed,
}

/// Where a request is in its trip through the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    DriverResolved,
    DriverInitialized,
    Executing,
    Completed,
    Failed,
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RequestState::Received => "received",
            RequestState::DriverResolved => "driver_resolved",
            RequestState::DriverInitialized => "driver_initialized",
            RequestState::Executing => "executing",
            RequestState::Completed => "completed",
            RequestState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_wire_form() {
        let op: VolumeOp = serde_json::from_str(r#"{"op":"inspect","volume":"vol1"}"#).unwrap();
        assert_eq!(op.name(), "inspect");
        assert_eq!(op.volume(), Some("vol1"));

        let json = serde_json::to_value(VolumeOp::Path { volume: "v".into() }).unwrap();
        assert_eq!(json["op"], "path");
    }

    #[test]
    fn test_reply_tagging() {
        let json = serde_json::to_value(VolumeReply::Removed).unwrap();
        assert_eq!(json["kind"], "removed");
        let json = serde_json::to_value(VolumeReply::Path(None)).unwrap();
        assert_eq!(json["kind"], "path");
        assert!(json["value"].is_null());
    }
}
