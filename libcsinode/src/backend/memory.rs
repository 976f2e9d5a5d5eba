//! In-memory object store and provisioner.
//!
//! [`MemoryStore`] implements [`AttachmentStore`], [`SecretStore`] and
//! [`DriverStore`]; [`MemoryProvisioner`] implements [`Provisioner`].
//!
//! # Thread safety
//!
//! All state lives in concurrent maps ([`DashMap`]) so independent tasks can
//! create, update and watch different records at the same time. Watchers are
//! fed from a single [`broadcast`] channel and filter by record name.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use futures::StreamExt;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument};

use crate::error::CsiError;
use crate::provisioner::{Provisioner, generate_volume_handle};
use crate::store::{AttachmentStore, DriverStore, SecretStore, WatchEvent, WatchStream};
use crate::types::*;

const EVENT_BUFFER: usize = 256;

/// Object store backed by process memory.
pub struct MemoryStore {
    attachments: DashMap<String, AttachmentRecord>,
    /// Secrets keyed by `(namespace, name)`.
    secrets: DashMap<(String, String), Secret>,
    /// Secrets that exist but must be refused.
    denied_secrets: DashSet<(String, String)>,
    drivers: DashMap<String, CsiDriverInfo>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            attachments: DashMap::new(),
            secrets: DashMap::new(),
            denied_secrets: DashSet::new(),
            drivers: DashMap::new(),
            events,
        }
    }

    pub fn put_secret(&self, secret: Secret) {
        self.secrets
            .insert((secret.namespace.clone(), secret.name.clone()), secret);
    }

    /// Make reads of `namespace/name` fail with [`CsiError::AccessDenied`].
    pub fn deny_secret(&self, namespace: &str, name: &str) {
        self.denied_secrets
            .insert((namespace.to_owned(), name.to_owned()));
    }

    pub fn put_driver(&self, info: CsiDriverInfo) {
        self.drivers.insert(info.name.clone(), info);
    }

    pub fn contains_attachment(&self, name: &str) -> bool {
        self.attachments.contains_key(name)
    }

    pub fn attachment_count(&self) -> usize {
        self.attachments.len()
    }

    /// Replace the status of a record, as the external attach controller
    /// would, and notify watchers.
    pub fn set_status(&self, name: &str, status: AttachmentStatus) -> Result<(), CsiError> {
        let record = {
            let mut entry = self
                .attachments
                .get_mut(name)
                .ok_or_else(|| CsiError::NotFound(format!("attachment {name}")))?;
            entry.status = status;
            entry.clone()
        };
        self.notify(WatchEvent::Modified(record));
        Ok(())
    }

    /// Every event for every record, in store order.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: WatchEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl AttachmentStore for MemoryStore {
    async fn get(&self, name: &str) -> Result<AttachmentRecord, CsiError> {
        self.attachments
            .get(name)
            .map(|r| r.clone())
            .ok_or_else(|| CsiError::NotFound(format!("attachment {name}")))
    }

    #[instrument(skip_all, fields(name = %record.name))]
    async fn create(&self, record: AttachmentRecord) -> Result<AttachmentRecord, CsiError> {
        match self.attachments.entry(record.name.clone()) {
            Entry::Occupied(_) => {
                return Err(CsiError::AlreadyExists(format!("attachment {}", record.name)));
            }
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
            }
        }
        debug!("attachment record stored");
        self.notify(WatchEvent::Added(record.clone()));
        Ok(record)
    }

    async fn update(&self, record: AttachmentRecord) -> Result<AttachmentRecord, CsiError> {
        {
            let mut entry = self
                .attachments
                .get_mut(&record.name)
                .ok_or_else(|| CsiError::NotFound(format!("attachment {}", record.name)))?;
            *entry = record.clone();
        }
        self.notify(WatchEvent::Modified(record.clone()));
        Ok(record)
    }

    async fn delete(&self, name: &str) -> Result<(), CsiError> {
        if self.attachments.remove(name).is_none() {
            return Err(CsiError::NotFound(format!("attachment {name}")));
        }
        self.notify(WatchEvent::Deleted(name.to_owned()));
        Ok(())
    }

    async fn watch(&self, name: &str) -> Result<WatchStream, CsiError> {
        let rx = self.events.subscribe();
        let name = name.to_owned();
        let stream = futures::stream::unfold(rx, move |mut rx| {
            let name = name.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(event) if event.name() == name => return Some((event, rx)),
                        Ok(_) => continue,
                        // Lost events are recovered by the watcher's re-read.
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, CsiError> {
        let key = (namespace.to_owned(), name.to_owned());
        if self.denied_secrets.contains(&key) {
            return Err(CsiError::AccessDenied(format!("secret {namespace}/{name}")));
        }
        self.secrets
            .get(&key)
            .map(|s| s.clone())
            .ok_or_else(|| CsiError::NotFound(format!("secret {namespace}/{name}")))
    }
}

#[async_trait]
impl DriverStore for MemoryStore {
    async fn get_driver(&self, name: &str) -> Result<CsiDriverInfo, CsiError> {
        self.drivers
            .get(name)
            .map(|d| d.clone())
            .ok_or_else(|| CsiError::NotFound(format!("csi driver {name}")))
    }
}

// ---------------------------------------------------------------------------
// Provisioner
// ---------------------------------------------------------------------------

/// Provisioner that hands out generated handles.
pub struct MemoryProvisioner {
    /// Prefix of generated volume handles.
    prefix: String,
    volumes: DashMap<VolumeId, Volume>,
    /// Maps `(namespace, name)` to the assigned handle so repeated creates for
    /// the same inline volume return the same volume.
    volume_names: DashMap<(String, String), VolumeId>,
}

impl MemoryProvisioner {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            volumes: DashMap::new(),
            volume_names: DashMap::new(),
        }
    }

    pub fn contains(&self, volume_id: &VolumeId) -> bool {
        self.volumes.contains_key(volume_id)
    }

    pub fn volume_count(&self) -> usize {
        self.volumes.len()
    }

    fn new_volume(&self, req: &CreateVolumeRequest) -> Volume {
        let volume_id = VolumeId(generate_volume_handle(&self.prefix, 16));
        let volume = Volume {
            volume_id: volume_id.clone(),
            capacity_bytes: req.capacity_bytes,
            volume_context: HashMap::from([("namespace".to_owned(), req.namespace.clone())]),
        };
        self.volumes.insert(volume_id.clone(), volume.clone());
        info!(%volume_id, "volume created");
        volume
    }
}

#[async_trait]
impl Provisioner for MemoryProvisioner {
    #[instrument(skip(self), fields(name = %req.name, namespace = %req.namespace))]
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        // The name slot stays locked until the new handle is recorded, so
        // racing creates for one (namespace, name) share a volume.
        let key = (req.namespace.clone(), req.name.clone());
        match self.volume_names.entry(key) {
            Entry::Occupied(mut slot) => {
                let id = slot.get().clone();
                if let Some(vol) = self.volumes.get(&id).map(|r| r.clone()) {
                    debug!(%id, "returning existing volume for idempotent create");
                    return Ok(vol);
                }
                let volume = self.new_volume(&req);
                slot.insert(volume.volume_id.clone());
                Ok(volume)
            }
            Entry::Vacant(slot) => {
                let volume = self.new_volume(&req);
                slot.insert(volume.volume_id.clone());
                Ok(volume)
            }
        }
    }

    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        self.volumes.remove(volume_id);
        self.volume_names.retain(|_, id| id != volume_id);
        info!(%volume_id, "volume deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(name: &str) -> AttachmentRecord {
        AttachmentRecord::new(
            name,
            "node-1",
            "drv-X",
            AttachmentSource::PersistentVolume("pv-1".into()),
        )
    }

    #[tokio::test]
    async fn create_get_delete() {
        let store = MemoryStore::new();
        store.create(record("a")).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().spec.attacher, "drv-X");

        let dup = store.create(record("a")).await;
        assert!(matches!(dup, Err(CsiError::AlreadyExists(_))));

        store.delete("a").await.unwrap();
        assert!(matches!(store.get("a").await, Err(CsiError::NotFound(_))));
        assert!(matches!(store.delete("a").await, Err(CsiError::NotFound(_))));
    }

    #[tokio::test]
    async fn update_requires_existing_record() {
        let store = MemoryStore::new();
        let result = store.update(record("ghost")).await;
        assert!(matches!(result, Err(CsiError::NotFound(_))));
    }

    #[tokio::test]
    async fn watch_only_sees_its_record() {
        let store = MemoryStore::new();
        let mut events = store.watch("b").await.unwrap();

        store.create(record("a")).await.unwrap();
        store.create(record("b")).await.unwrap();
        store
            .set_status(
                "b",
                AttachmentStatus {
                    attached: true,
                    ..Default::default()
                },
            )
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, WatchEvent::Added(ref r) if r.name == "b"));

        let second = tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(second, WatchEvent::Modified(ref r) if r.status.attached));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_share_one_volume() {
        let provisioner = std::sync::Arc::new(MemoryProvisioner::new("csi-inline"));
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let provisioner = std::sync::Arc::clone(&provisioner);
                tokio::spawn(async move {
                    provisioner
                        .create_volume(CreateVolumeRequest {
                            name: "scratch".into(),
                            namespace: "ns1".into(),
                            capacity_bytes: 1024,
                            ..Default::default()
                        })
                        .await
                })
            })
            .collect();

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap().unwrap().volume_id);
        }
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(provisioner.volume_count(), 1);
    }

    #[tokio::test]
    async fn provisioner_is_idempotent_per_namespace_and_name() {
        let provisioner = MemoryProvisioner::new("csi-inline");
        let req = CreateVolumeRequest {
            name: "scratch".into(),
            namespace: "ns1".into(),
            capacity_bytes: 1024,
            ..Default::default()
        };

        let v1 = provisioner.create_volume(req.clone()).await.unwrap();
        let v2 = provisioner.create_volume(req.clone()).await.unwrap();
        assert_eq!(v1.volume_id, v2.volume_id);
        assert!(v1.volume_id.0.starts_with("csi-inline-"));

        let other = provisioner
            .create_volume(CreateVolumeRequest {
                namespace: "ns2".into(),
                ..req
            })
            .await
            .unwrap();
        assert_ne!(other.volume_id, v1.volume_id);
        assert_eq!(provisioner.volume_count(), 2);

        provisioner.delete_volume(&v1.volume_id).await.unwrap();
        assert!(!provisioner.contains(&v1.volume_id));
        provisioner.delete_volume(&v1.volume_id).await.unwrap();
    }
}
