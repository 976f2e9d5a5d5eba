//! Collaborator traits for the cluster object store.
//!
//! The node agent never owns these objects: attachment records are watched
//! and updated by an external attach controller, secrets and driver
//! descriptors are read-only. Implementations must report a missing object as
//! [`CsiError::NotFound`], a name clash on create as
//! [`CsiError::AlreadyExists`] and a refused read as
//! [`CsiError::AccessDenied`]; callers rely on those kinds to decide what to
//! do next.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::CsiError;
use crate::types::{AttachmentRecord, CsiDriverInfo, Secret};

/// A change to a watched attachment record.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(AttachmentRecord),
    Modified(AttachmentRecord),
    Deleted(String),
}

impl WatchEvent {
    /// Name of the record this event is about.
    pub fn name(&self) -> &str {
        match self {
            Self::Added(r) | Self::Modified(r) => &r.name,
            Self::Deleted(name) => name,
        }
    }
}

/// Stream of changes to a single attachment record.
///
/// The stream may drop events under load; consumers re-read the record
/// instead of trusting the stream to be complete.
pub type WatchStream = BoxStream<'static, WatchEvent>;

/// Durable, watchable store of attachment records.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<AttachmentRecord, CsiError>;

    /// Create a record. Fails with [`CsiError::AlreadyExists`] if the name is
    /// taken.
    async fn create(&self, record: AttachmentRecord) -> Result<AttachmentRecord, CsiError>;

    /// Replace an existing record. Fails with [`CsiError::NotFound`] if it is
    /// gone.
    async fn update(&self, record: AttachmentRecord) -> Result<AttachmentRecord, CsiError>;

    async fn delete(&self, name: &str) -> Result<(), CsiError>;

    /// Subscribe to changes of the record called `name`.
    async fn watch(&self, name: &str) -> Result<WatchStream, CsiError>;
}

/// Read-only access to namespaced secrets.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, CsiError>;
}

/// Read-only access to the cached per-driver capability descriptors.
#[async_trait]
pub trait DriverStore: Send + Sync {
    async fn get_driver(&self, name: &str) -> Result<CsiDriverInfo, CsiError>;
}
