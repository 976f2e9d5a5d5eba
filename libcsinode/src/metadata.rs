//! Local volume metadata persistence.
//!
//! After a successful publish the node agent writes a small JSON file next to
//! the volume's mount directory. Tear-down reads it back to learn which
//! driver, handle and attachment belong to a mount path, without access to the
//! pod spec that created it (e.g. after an agent restart).
//!
//! # On-disk layout
//!
//! ```text
//! <plugin_dir>/
//!   <escaped spec volume id>/
//!     data/
//!       vol_data.json   # flat {"driverName": "...", "volumeHandle": "...", ...}
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument, warn};

use crate::error::CsiError;

/// Name of the metadata file inside a volume's data directory.
pub const VOLUME_DATA_FILE: &str = "vol_data.json";

pub const KEY_DRIVER_NAME: &str = "driverName";
pub const KEY_VOLUME_HANDLE: &str = "volumeHandle";
pub const KEY_READ_ONLY: &str = "readOnly";
pub const KEY_ATTACHMENT_ID: &str = "attachmentID";
pub const KEY_SPEC_VOLUME_ID: &str = "specVolID";
pub const KEY_NODE_NAME: &str = "nodeName";
pub const KEY_NAMESPACE: &str = "namespace";

/// Escape a qualified name (`a/b`) into a single path component (`a~b`).
pub fn escape_qualified_name(name: &str) -> String {
    name.replace('/', "~")
}

/// Directory that holds the metadata file for `spec_volume_id`.
pub fn data_dir(plugin_dir: &Path, spec_volume_id: &str) -> PathBuf {
    plugin_dir
        .join(escape_qualified_name(spec_volume_id))
        .join("data")
}

/// Reads and writes `vol_data.json` files.
#[derive(Debug, Clone)]
pub struct VolumeMetadataStore {
    file_name: String,
}

impl Default for VolumeMetadataStore {
    fn default() -> Self {
        Self::new(VOLUME_DATA_FILE)
    }
}

impl VolumeMetadataStore {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
        }
    }

    /// Full path of the metadata file under `dir`.
    pub fn path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.file_name)
    }

    /// Write `data` to `dir`, replacing any previous file.
    ///
    /// `dir` is not created: a missing directory is an [`CsiError::Io`].
    #[instrument(skip(self, dir, data), fields(dir = %dir.display()))]
    pub async fn save(&self, dir: &Path, data: &HashMap<String, String>) -> Result<(), CsiError> {
        let path = self.path(dir);
        let json = serde_json::to_vec(data).map_err(|e| CsiError::io(&path, e.into()))?;
        tokio::fs::write(&path, json).await.map_err(|e| {
            warn!(path = %path.display(), error = %e, "failed to save volume data file");
            CsiError::io(&path, e)
        })?;
        debug!(path = %path.display(), "volume data file saved");
        Ok(())
    }

    /// Read the metadata file under `dir`.
    ///
    /// A missing file is [`CsiError::NotFound`]; content that is not a JSON
    /// object of strings is [`CsiError::Decode`].
    #[instrument(skip(self, dir), fields(dir = %dir.display()))]
    pub async fn load(&self, dir: &Path) -> Result<HashMap<String, String>, CsiError> {
        let path = self.path(dir);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CsiError::NotFound(format!(
                    "volume data file {}",
                    path.display()
                )));
            }
            Err(e) => return Err(CsiError::io(&path, e)),
        };

        serde_json::from_slice(&raw).map_err(|e| {
            warn!(path = %path.display(), error = %e, "failed to parse volume data file");
            CsiError::Decode { path, source: e }
        })
    }

    /// Delete the metadata file under `dir`. A missing file is fine.
    pub async fn remove(&self, dir: &Path) -> Result<(), CsiError> {
        let path = self.path(dir);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CsiError::io(path, e)),
        }
    }
}

/// Typed view of the metadata written for a mounted volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMetadata {
    pub driver_name: String,
    pub volume_handle: String,
    pub read_only: bool,
    /// Attachment record name, or the raw handle for skip-attach drivers.
    pub attachment_id: String,
    pub spec_volume_id: String,
    pub node_name: String,
    pub namespace: String,
}

impl VolumeMetadata {
    pub fn to_map(&self) -> HashMap<String, String> {
        HashMap::from([
            (KEY_DRIVER_NAME.to_owned(), self.driver_name.clone()),
            (KEY_VOLUME_HANDLE.to_owned(), self.volume_handle.clone()),
            (KEY_READ_ONLY.to_owned(), self.read_only.to_string()),
            (KEY_ATTACHMENT_ID.to_owned(), self.attachment_id.clone()),
            (KEY_SPEC_VOLUME_ID.to_owned(), self.spec_volume_id.clone()),
            (KEY_NODE_NAME.to_owned(), self.node_name.clone()),
            (KEY_NAMESPACE.to_owned(), self.namespace.clone()),
        ])
    }

    /// Rebuild from a loaded map. Driver name and volume handle are required;
    /// everything else falls back to empty / `false`.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, CsiError> {
        let required = |key: &str| {
            map.get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| CsiError::InvalidArgument(format!("volume data missing {key}")))
        };
        let optional = |key: &str| map.get(key).cloned().unwrap_or_default();

        Ok(Self {
            driver_name: required(KEY_DRIVER_NAME)?,
            volume_handle: required(KEY_VOLUME_HANDLE)?,
            read_only: map.get(KEY_READ_ONLY).is_some_and(|v| v == "true"),
            attachment_id: optional(KEY_ATTACHMENT_ID),
            spec_volume_id: optional(KEY_SPEC_VOLUME_ID),
            node_name: optional(KEY_NODE_NAME),
            namespace: optional(KEY_NAMESPACE),
        })
    }
}
