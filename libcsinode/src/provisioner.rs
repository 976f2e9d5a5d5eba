//! Provisioner collaborator.
//!
//! Inline volumes declared without a handle are created on demand through a
//! [`Provisioner`], normally the driver's controller `CreateVolume` RPC.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{CreateVolumeRequest, Volume, VolumeId};

/// Creates and deletes volumes on behalf of inline sources.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Provision a new volume.
    ///
    /// The returned [`Volume`] carries the handle that subsequent attach and
    /// publish calls must use.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Delete a previously provisioned volume.
    ///
    /// Never called by the set-up path itself; the surrounding mount
    /// orchestration uses it for compensating cleanup.
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError>;
}

/// Generate a volume handle of the form `<prefix>-<size hex chars>`.
///
/// `size` is clamped to the 32 hex characters of a UUID.
pub fn generate_volume_handle(prefix: &str, size: usize) -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    let size = size.min(raw.len());
    format!("{prefix}-{}", &raw[..size])
}
