//! # libcsinode: node-side CSI attach coordination for RK8s
//!
//! `libcsinode` is the part of the node agent that gets a [CSI][csi] volume
//! from "declared in a pod" to "published at the pod's target path". It
//! speaks the attachment record protocol with the external attach
//! controller, provisions inline volumes declared without a handle, and keeps
//! a small metadata file per mounted volume so tear-down works after a
//! restart. It follows the RK8s conventions (Tokio async runtime, `tracing`
//! for observability, `thiserror` for structured errors).
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: attachment records, volume sources, requests. |
//! | [`error`] | [`CsiError`] enum covering all failure modes. |
//! | [`config`] | [`AttachConfig`] timeouts, wait policy and env overrides. |
//! | [`store`] | Object store traits for attachments, secrets and drivers. |
//! | [`attacher`] | [`AttachmentCoordinator`]: post a record, wait for attach. |
//! | [`capability`] | [`CapabilityGate`]: does a driver need attaching? |
//! | [`credentials`] | [`CredentialResolver`]: secrets for driver calls. |
//! | [`provisioner`] | [`Provisioner`] trait for on-demand inline volumes. |
//! | [`node`] | [`NodePublisher`] trait for driver publish / unpublish. |
//! | [`metadata`] | `vol_data.json` persistence next to each mount. |
//! | [`inline`] | [`InlineVolumeManager`] set-up and tear-down. |
//! | [`backend`] | In-memory store and provisioner. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod attacher;
pub mod backend;
pub mod capability;
pub mod config;
pub mod credentials;
pub mod error;
pub mod inline;
pub mod metadata;
pub mod node;
pub mod provisioner;
pub mod store;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use attacher::{AttachmentCoordinator, VolumeAttacher, attachment_name};
pub use capability::CapabilityGate;
pub use config::{AttachConfig, WaitPolicy};
pub use credentials::{CredentialResolver, Credentials};
pub use error::CsiError;
pub use inline::{InlineAttachment, InlineMountRequest, InlineState, InlineVolumeManager};
pub use metadata::{VolumeMetadata, VolumeMetadataStore};
pub use node::NodePublisher;
pub use provisioner::Provisioner;
pub use store::{AttachmentStore, DriverStore, SecretStore, WatchEvent};
pub use types::*;
