//! Driver node-service collaborator.
//!
//! The node agent makes a volume visible to a pod in two steps it does not
//! implement itself:
//!
//! 1. **Publish**: the driver mounts the volume at the pod's target path.
//! 2. **Unpublish**: the driver removes that mount.
//!
//! [`NodePublisher`] is the seam to the driver's RPC client.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{NodePublishVolumeRequest, VolumeId};

/// Driver node service: publish and unpublish calls.
#[async_trait]
pub trait NodePublisher: Send + Sync {
    /// Publish a volume at `req.target_path`.
    ///
    /// Must be idempotent: publishing the same volume at the same target again
    /// succeeds.
    async fn node_publish(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume from `target_path`.
    ///
    /// Must be idempotent.
    async fn node_unpublish(&self, volume_id: &VolumeId, target_path: &str)
    -> Result<(), CsiError>;
}
