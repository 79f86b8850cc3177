//! Volume model returned by drivers and the options they accept.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use voldrive_shared::executor::InstanceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentState {
    Attached,
    Detached,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeAttachment {
    pub volume_id: String,
    pub instance_id: InstanceId,
    /// Device path on the attached host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<PathBuf>,
    pub state: AttachmentState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_gb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iops: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<VolumeAttachment>,
    /// Provider-specific extras.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Volume {
    /// Attachment to `instance`, if any.
    pub fn attachment_for(&self, instance: &InstanceId) -> Option<&VolumeAttachment> {
        self.attachments
            .iter()
            .find(|a| a.instance_id.id == instance.id && a.state == AttachmentState::Attached)
    }

    pub fn is_attached(&self) -> bool {
        self.attachments
            .iter()
            .any(|a| a.state == AttachmentState::Attached)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumesOpts {
    /// Include attachment details.
    #[serde(default)]
    pub attachments: bool,
    /// Only volumes attached to the local instance.
    #[serde(default)]
    pub mine: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInspectOpts {
    #[serde(default)]
    pub attachments: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeCreateOpts {
    #[serde(default)]
    pub size_gb: Option<u64>,
    #[serde(default)]
    pub volume_type: Option<String>,
    #[serde(default)]
    pub iops: Option<u64>,
    #[serde(default)]
    pub availability_zone: Option<String>,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRemoveOpts {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeAttachOpts {
    /// Steal an attachment held by another host.
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub next_device: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDetachOpts {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMountOpts {
    /// Mount point; the driver picks one when absent.
    #[serde(default)]
    pub target: Option<PathBuf>,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeUnmountOpts {
    #[serde(default)]
    pub force: bool,
}

/// Outcome of a mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountInfo {
    pub volume: Volume,
    pub mount_point: PathBuf,
}
