//! Core types: volume sources, attachment records, requests and driver
//! descriptors.
//!
//! These mirror the objects the node agent exchanges with the record store and
//! the driver. They are all [`Serialize`]/[`Deserialize`] so the in-memory
//! store and any real client can share them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::credentials::Credentials;

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Opaque driver-assigned volume handle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VolumeId(pub String);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Workload volume sources
// ---------------------------------------------------------------------------

/// Reference to an object in the same namespace as the workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalObjectReference {
    pub name: String,
}

/// A CSI volume declared inline in a pod spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CsiVolumeSource {
    /// Driver name, e.g. `"csi-hostpath"`.
    pub driver: String,
    /// Handle of a pre-provisioned volume; `None` asks for auto-provisioning.
    #[serde(default)]
    pub volume_handle: Option<String>,
    #[serde(default)]
    pub read_only: Option<bool>,
    #[serde(default)]
    pub fs_type: Option<String>,
    /// Driver-specific attributes forwarded as publish context.
    #[serde(default)]
    pub volume_attributes: HashMap<String, String>,
    /// Secret holding credentials for `NodePublishVolume`.
    #[serde(default)]
    pub node_publish_secret_ref: Option<LocalObjectReference>,
}

/// A named volume entry of a pod spec.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodVolume {
    /// Volume name as declared in the pod spec.
    pub name: String,
    /// The CSI source; `None` means the entry is not a CSI volume at all.
    #[serde(default)]
    pub csi: Option<CsiVolumeSource>,
}

/// The parts of the owning pod the node agent needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    #[serde(default)]
    pub service_account: String,
}

// ---------------------------------------------------------------------------
// Attachment record
// ---------------------------------------------------------------------------

/// Inline source carried by an attachment record.
///
/// Inline volumes have no cluster-scoped object, so the workload namespace
/// travels here for namespaced secret lookups made by the attach controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InlineVolumeSource {
    pub namespace: String,
    /// The workload's volume source, embedded verbatim.
    pub volume_source: CsiVolumeSource,
}

/// What the attachment record points at.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AttachmentSource {
    /// A cluster-level persistent volume, by name.
    PersistentVolume(String),
    /// A volume embedded in a pod spec.
    Inline(InlineVolumeSource),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachmentSpec {
    pub node_name: String,
    /// Name of the driver expected to handle the attachment.
    pub attacher: String,
    pub source: AttachmentSource,
}

/// Error reported by the attach controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachmentError {
    pub message: String,
}

/// Status of an attachment. Only the external attach controller writes it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachmentStatus {
    pub attached: bool,
    #[serde(default)]
    pub attach_error: Option<AttachmentError>,
    #[serde(default)]
    pub detach_error: Option<AttachmentError>,
    /// Opaque data returned by the driver's `ControllerPublishVolume`.
    #[serde(default)]
    pub attachment_metadata: HashMap<String, String>,
}

/// The durable object used to ask the attach controller for an attachment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachmentRecord {
    /// Deterministic name, see [`crate::attacher::attachment_name`].
    pub name: String,
    pub spec: AttachmentSpec,
    #[serde(default)]
    pub status: AttachmentStatus,
}

impl AttachmentRecord {
    /// A fresh record with an unset status.
    pub fn new(
        name: impl Into<String>,
        node_name: impl Into<String>,
        attacher: impl Into<String>,
        source: AttachmentSource,
    ) -> Self {
        Self {
            name: name.into(),
            spec: AttachmentSpec {
                node_name: node_name.into(),
                attacher: attacher.into(),
                source,
            },
            status: AttachmentStatus::default(),
        }
    }

    /// Human-readable name of the volume behind this record, used in errors.
    pub fn volume(&self) -> &str {
        match &self.spec.source {
            AttachmentSource::PersistentVolume(name) => name,
            AttachmentSource::Inline(inline) => inline
                .volume_source
                .volume_handle
                .as_deref()
                .unwrap_or("<unprovisioned>"),
        }
    }
}

// ---------------------------------------------------------------------------
// Driver descriptor & secrets
// ---------------------------------------------------------------------------

fn default_attach_required() -> bool {
    true
}

/// Cluster-scoped capability descriptor published by a CSI driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CsiDriverInfo {
    pub name: String,
    /// Whether the driver needs a controller attach phase. Absent means yes.
    #[serde(default = "default_attach_required")]
    pub attach_required: bool,
    /// Whether pod identity should be added to the publish context.
    #[serde(default)]
    pub pod_info_on_mount: bool,
}

/// A secret object as returned by the secret store.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Secret {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub data: HashMap<String, Vec<u8>>,
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("keys", &self.data.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Request to provision a volume for an inline source without a handle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// The volume's declared name in the pod spec.
    pub name: String,
    /// Namespace of the owning workload.
    pub namespace: String,
    /// Desired capacity in bytes.
    pub capacity_bytes: u64,
    /// Arbitrary parameters forwarded to the driver.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// A provisioned volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub volume_id: VolumeId,
    /// Provisioned capacity in bytes.
    pub capacity_bytes: u64,
    /// Opaque context passed from the provisioner to node operations.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Request to publish (mount) a volume at a pod's target path.
#[derive(Debug, Clone)]
pub struct NodePublishVolumeRequest {
    pub volume_id: VolumeId,
    pub driver: String,
    /// Target path inside the pod's volume directory.
    pub target_path: String,
    pub read_only: bool,
    pub fs_type: Option<String>,
    /// Attribute map handed to the driver, including pod info if requested.
    pub volume_context: HashMap<String, String>,
    /// Opaque data from the attachment status.
    pub publish_context: HashMap<String, String>,
    pub secrets: Credentials,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_id_display() {
        let id = VolumeId("vol-abc".into());
        assert_eq!(id.to_string(), "vol-abc");
    }

    #[test]
    fn driver_info_defaults_to_attach_required() {
        let info: CsiDriverInfo = serde_json::from_str(r#"{"name":"drv-X"}"#).expect("decode");
        assert!(info.attach_required);
        assert!(!info.pod_info_on_mount);
    }

    #[test]
    fn record_reports_inline_volume_handle() {
        let record = AttachmentRecord::new(
            "csi-123",
            "node-1",
            "drv-X",
            AttachmentSource::Inline(InlineVolumeSource {
                namespace: "ns1".into(),
                volume_source: CsiVolumeSource {
                    driver: "drv-X".into(),
                    volume_handle: Some("vol-A".into()),
                    ..Default::default()
                },
            }),
        );
        assert_eq!(record.volume(), "vol-A");
        assert!(!record.status.attached);

        let pv = AttachmentRecord::new(
            "csi-456",
            "node-1",
            "drv-X",
            AttachmentSource::PersistentVolume("pv-1".into()),
        );
        assert_eq!(pv.volume(), "pv-1");
    }

    #[test]
    fn secret_debug_hides_values() {
        let secret = Secret {
            namespace: "ns1".into(),
            name: "sec".into(),
            data: HashMap::from([("password".into(), b"hunter2".to_vec())]),
        };
        let out = format!("{secret:?}");
        assert!(!out.contains("hunter2"));
        assert!(out.contains("keys: 1"));
    }
}
