//! Inline (pod-embedded) CSI volumes.
//!
//! [`InlineVolumeManager`] takes a volume declared directly in a pod spec to
//! the point where it can be used:
//!
//! ```text
//! Start ──┬── handle present ────────────────┐
//!         └── no handle ── Provisioning ─────┤
//!                                            ├─ attach not required ── SkipAttach ──┐
//!                                            └─ attach required ───── Attaching ───┴── Ready
//! ```
//!
//! Any step may end in `Failed`, in which case the collaborator's error is
//! returned as-is. Nothing is rolled back: a volume provisioned before a
//! failed attach stays provisioned, and the calling orchestration decides
//! whether to delete it.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, instrument};

use crate::attacher::{VolumeAttacher, attachment_name};
use crate::capability::CapabilityGate;
use crate::config::AttachConfig;
use crate::credentials::{CredentialResolver, Credentials};
use crate::error::CsiError;
use crate::metadata::{VolumeMetadata, VolumeMetadataStore};
use crate::node::NodePublisher;
use crate::provisioner::Provisioner;
use crate::types::*;

pub const POD_NAME_KEY: &str = "csi.storage.k8s.io/pod.name";
pub const POD_NAMESPACE_KEY: &str = "csi.storage.k8s.io/pod.namespace";
pub const POD_UID_KEY: &str = "csi.storage.k8s.io/pod.uid";
pub const POD_SERVICE_ACCOUNT_KEY: &str = "csi.storage.k8s.io/serviceAccount.name";

/// Stages of inline volume set-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InlineState {
    Start,
    Provisioning,
    CapabilityCheck,
    SkipAttach,
    Attaching,
    Ready,
    /// Credentials, driver publish and the metadata file, after `Ready`.
    Publishing,
    Failed,
}

impl fmt::Display for InlineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Start => "start",
            Self::Provisioning => "provisioning",
            Self::CapabilityCheck => "capability-check",
            Self::SkipAttach => "skip-attach",
            Self::Attaching => "attaching",
            Self::Ready => "ready",
            Self::Publishing => "publishing",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Outcome of a successful inline set-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineAttachment {
    /// Attachment record name, or the raw handle when attach was skipped.
    pub attach_id: String,
    pub volume_handle: VolumeId,
}

/// Everything needed to mount one inline volume for one pod.
#[derive(Debug, Clone)]
pub struct InlineMountRequest {
    pub pod: PodInfo,
    pub volume: PodVolume,
    /// Size requested by a bound claim, if the volume has one.
    pub requested_bytes: Option<u64>,
    /// Where the driver should publish the volume.
    pub target_path: String,
    /// Directory receiving the volume metadata file.
    pub data_dir: PathBuf,
}

/// Drives inline volumes through provisioning, attach and publish.
pub struct InlineVolumeManager {
    node_name: String,
    attacher: Arc<dyn VolumeAttacher>,
    capabilities: CapabilityGate,
    credentials: CredentialResolver,
    publisher: Arc<dyn NodePublisher>,
    provisioner: Option<Arc<dyn Provisioner>>,
    metadata: VolumeMetadataStore,
    config: AttachConfig,
}

impl InlineVolumeManager {
    pub fn new(
        node_name: impl Into<String>,
        attacher: Arc<dyn VolumeAttacher>,
        capabilities: CapabilityGate,
        credentials: CredentialResolver,
        publisher: Arc<dyn NodePublisher>,
        config: AttachConfig,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            attacher,
            capabilities,
            credentials,
            publisher,
            provisioner: None,
            metadata: VolumeMetadataStore::default(),
            config,
        }
    }

    /// Enable auto-provisioning of inline volumes declared without a handle.
    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn with_metadata_store(mut self, metadata: VolumeMetadataStore) -> Self {
        self.metadata = metadata;
        self
    }

    /// Log a failure with its stage and pass the error through untouched.
    fn failed(&self, stage: InlineState, volume: &str, driver: &str, err: CsiError) -> CsiError {
        error!(
            %stage,
            state = %InlineState::Failed,
            volume,
            driver,
            error = %err,
            "inline volume set-up failed",
        );
        err
    }

    /// Provision (if needed) and attach (if needed) an inline volume.
    ///
    /// Returns the effective attachment id together with the volume handle.
    #[instrument(skip_all, fields(volume = %volume.name, namespace = %pod.namespace))]
    pub async fn set_up_inline(
        &self,
        pod: &PodInfo,
        volume: &PodVolume,
        requested_bytes: Option<u64>,
    ) -> Result<InlineAttachment, CsiError> {
        debug!(state = %InlineState::Start, "inline set-up");
        let source = validate_source(volume)
            .map_err(|e| self.failed(InlineState::Start, &volume.name, "", e))?;
        let driver = source.driver.as_str();

        let handle = match source.volume_handle.as_deref().filter(|h| !h.is_empty()) {
            Some(handle) => VolumeId::from(handle),
            None => {
                debug!(state = %InlineState::Provisioning, driver, "no volume handle, provisioning");
                self.provision(pod, volume, source, requested_bytes)
                    .await
                    .map_err(|e| self.failed(InlineState::Provisioning, &volume.name, driver, e))?
            }
        };

        let attach_required = self
            .capabilities
            .is_attach_required(driver)
            .await
            .map_err(|e| self.failed(InlineState::CapabilityCheck, &handle.0, driver, e))?;

        if !attach_required {
            debug!(state = %InlineState::SkipAttach, %handle, "driver does not require attach");
            debug!(state = %InlineState::Ready, %handle, "inline volume ready");
            return Ok(InlineAttachment {
                attach_id: handle.0.clone(),
                volume_handle: handle,
            });
        }

        debug!(state = %InlineState::Attaching, %handle, driver, "posting attachment");
        let mut embedded = source.clone();
        embedded.volume_handle = Some(handle.0.clone());
        let record = AttachmentRecord::new(
            attachment_name(&handle.0, driver, &self.node_name),
            self.node_name.clone(),
            driver,
            AttachmentSource::Inline(InlineVolumeSource {
                namespace: pod.namespace.clone(),
                volume_source: embedded,
            }),
        );

        let attach_id = self
            .attacher
            .attach(record, self.config.attach_timeout)
            .await
            .map_err(|e| self.failed(InlineState::Attaching, &handle.0, driver, e))?;

        info!(state = %InlineState::Ready, %handle, %attach_id, driver, "inline volume attached");
        Ok(InlineAttachment {
            attach_id,
            volume_handle: handle,
        })
    }

    async fn provision(
        &self,
        pod: &PodInfo,
        volume: &PodVolume,
        source: &CsiVolumeSource,
        requested_bytes: Option<u64>,
    ) -> Result<VolumeId, CsiError> {
        let Some(provisioner) = &self.provisioner else {
            return Err(CsiError::InvalidArgument(format!(
                "volume {} [driver: {}] has no volume handle and no provisioner is configured",
                volume.name, source.driver
            )));
        };

        let created = provisioner
            .create_volume(CreateVolumeRequest {
                name: volume.name.clone(),
                namespace: pod.namespace.clone(),
                capacity_bytes: requested_bytes.unwrap_or(self.config.default_capacity_bytes),
                parameters: source.volume_attributes.clone(),
            })
            .await?;
        info!(volume_id = %created.volume_id, capacity = created.capacity_bytes, "inline volume provisioned");
        Ok(created.volume_id)
    }

    /// Full mount of an inline volume: set-up, credentials, driver publish
    /// and finally the metadata file.
    ///
    /// The metadata file is only written once publish succeeded.
    #[instrument(skip_all, fields(volume = %req.volume.name, target = %req.target_path))]
    pub async fn set_up(&self, req: &InlineMountRequest) -> Result<InlineAttachment, CsiError> {
        let attachment = self
            .set_up_inline(&req.pod, &req.volume, req.requested_bytes)
            .await?;
        let source = validate_source(&req.volume)?;
        self.publish(req, source, &attachment).await.map_err(|e| {
            self.failed(
                InlineState::Publishing,
                &attachment.volume_handle.0,
                &source.driver,
                e,
            )
        })?;

        info!(handle = %attachment.volume_handle, "inline volume published");
        Ok(attachment)
    }

    async fn publish(
        &self,
        req: &InlineMountRequest,
        source: &CsiVolumeSource,
        attachment: &InlineAttachment,
    ) -> Result<(), CsiError> {
        let driver = source.driver.as_str();

        let secrets = match &source.node_publish_secret_ref {
            Some(secret_ref) => self
                .credentials
                .resolve(&req.pod.namespace, &secret_ref.name)
                .await?,
            None => Credentials::default(),
        };

        let mut volume_context = source.volume_attributes.clone();
        if self.capabilities.pod_info_on_mount(driver).await? {
            volume_context.extend(pod_info_context(&req.pod));
        }

        let publish_context = if attachment.attach_id == attachment.volume_handle.0 {
            HashMap::new()
        } else {
            self.attacher.publish_context(&attachment.attach_id).await?
        };

        let read_only = source.read_only.unwrap_or(false);
        self.publisher
            .node_publish(NodePublishVolumeRequest {
                volume_id: attachment.volume_handle.clone(),
                driver: driver.to_owned(),
                target_path: req.target_path.clone(),
                read_only,
                fs_type: source.fs_type.clone(),
                volume_context,
                publish_context,
                secrets,
            })
            .await?;

        tokio::fs::create_dir_all(&req.data_dir)
            .await
            .map_err(|e| CsiError::io(&req.data_dir, e))?;
        let metadata = VolumeMetadata {
            driver_name: driver.to_owned(),
            volume_handle: attachment.volume_handle.0.clone(),
            read_only,
            attachment_id: attachment.attach_id.clone(),
            spec_volume_id: req.volume.name.clone(),
            node_name: self.node_name.clone(),
            namespace: req.pod.namespace.clone(),
        };
        self.metadata.save(&req.data_dir, &metadata.to_map()).await
    }

    /// Undo [`Self::set_up`] using only what was recorded on disk.
    ///
    /// The attachment record is deleted only if the stored id is the one this
    /// node derives for the volume; skip-attach volumes store their raw handle.
    #[instrument(skip(self, data_dir), fields(data_dir = %data_dir.display()))]
    pub async fn tear_down(&self, data_dir: &Path, target_path: &str) -> Result<(), CsiError> {
        let raw = self.metadata.load(data_dir).await?;
        let meta = VolumeMetadata::from_map(&raw)?;
        let handle = VolumeId::from(meta.volume_handle.as_str());

        self.publisher.node_unpublish(&handle, target_path).await?;

        let node_name = if meta.node_name.is_empty() {
            self.node_name.as_str()
        } else {
            meta.node_name.as_str()
        };
        if meta.attachment_id == attachment_name(&handle.0, &meta.driver_name, node_name) {
            self.attacher.detach(&meta.attachment_id).await?;
        }

        self.metadata.remove(data_dir).await?;
        info!(%handle, driver = %meta.driver_name, "inline volume torn down");
        Ok(())
    }
}

fn validate_source(volume: &PodVolume) -> Result<&CsiVolumeSource, CsiError> {
    let source = volume.csi.as_ref().ok_or_else(|| {
        CsiError::InvalidArgument(format!("volume {} has no CSI volume source", volume.name))
    })?;
    if source.driver.is_empty() {
        return Err(CsiError::InvalidArgument(format!(
            "volume {} has no CSI driver name",
            volume.name
        )));
    }
    Ok(source)
}

fn pod_info_context(pod: &PodInfo) -> HashMap<String, String> {
    HashMap::from([
        (POD_NAME_KEY.to_owned(), pod.name.clone()),
        (POD_NAMESPACE_KEY.to_owned(), pod.namespace.clone()),
        (POD_UID_KEY.to_owned(), pod.uid.clone()),
        (POD_SERVICE_ACCOUNT_KEY.to_owned(), pod.service_account.clone()),
    ])
}
