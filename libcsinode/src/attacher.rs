//! Attachment records: identity, creation and the wait for the external
//! attach controller.
//!
//! The node agent cannot reach the driver's controller service. Instead it
//! posts an [`AttachmentRecord`] and waits for the attach controller to flip
//! `status.attached`. Every record name is derived from
//! `(volume handle, driver, node)`, so any number of callers racing on the
//! same triple end up on one record.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, instrument, warn};

use crate::config::{AttachConfig, MAX_ATTACH_TIMEOUT};
use crate::error::CsiError;
use crate::store::{AttachmentStore, WatchEvent};
use crate::types::{AttachmentRecord, AttachmentSource};

/// Deterministic attachment record name for a volume on a node.
///
/// `csi-` followed by the lowercase hex SHA-256 of the triple: always 68
/// characters of `[a-z0-9-]`. Each field is hashed behind its byte length so
/// `("ab", "c")` and `("a", "bc")` never collide.
pub fn attachment_name(volume_handle: &str, driver: &str, node_name: &str) -> String {
    let mut hasher = Sha256::new();
    for field in [volume_handle, driver, node_name] {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field.as_bytes());
    }
    format!("csi-{:x}", hasher.finalize())
}

/// Attach / detach surface of a volume plugin.
#[async_trait]
pub trait VolumeAttacher: Send + Sync {
    /// Post `record` (or reuse an identical one) and wait up to `timeout`
    /// for it to report attached. Returns the record name.
    async fn attach(&self, record: AttachmentRecord, timeout: Duration)
    -> Result<String, CsiError>;

    /// Wait up to `timeout` for an already posted record to report attached.
    async fn wait_for_attach(&self, attach_id: &str, timeout: Duration) -> Result<(), CsiError>;

    /// Remove the record. A record that is already gone is not an error.
    async fn detach(&self, attach_id: &str) -> Result<(), CsiError>;

    /// Driver data recorded on an attached record, forwarded to publish.
    async fn publish_context(&self, _attach_id: &str) -> Result<HashMap<String, String>, CsiError> {
        Ok(HashMap::new())
    }
}

/// What a single look at the record told us.
enum Observation {
    Attached,
    Pending,
}

/// Node-side client of the attachment protocol.
pub struct AttachmentCoordinator {
    store: Arc<dyn AttachmentStore>,
    node_name: String,
    config: AttachConfig,
}

impl AttachmentCoordinator {
    pub fn new(
        store: Arc<dyn AttachmentStore>,
        node_name: impl Into<String>,
        config: AttachConfig,
    ) -> Self {
        Self {
            store,
            node_name: node_name.into(),
            config,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn config(&self) -> &AttachConfig {
        &self.config
    }

    /// Name of the record this node would use for `volume_handle`.
    pub fn attachment_name(&self, volume_handle: &str, driver: &str) -> String {
        attachment_name(volume_handle, driver, &self.node_name)
    }

    /// Report, per record name, whether the record exists and is attached.
    pub async fn volumes_are_attached(
        &self,
        attach_ids: &[String],
    ) -> Result<HashMap<String, bool>, CsiError> {
        let mut result = HashMap::with_capacity(attach_ids.len());
        for id in attach_ids {
            let attached = match self.store.get(id).await {
                Ok(record) => record.status.attached,
                Err(e) if e.is_not_found() => false,
                Err(e) => return Err(e),
            };
            result.insert(id.clone(), attached);
        }
        Ok(result)
    }

    /// Create the record, treating an identical existing record as success.
    async fn post(&self, record: AttachmentRecord) -> Result<(), CsiError> {
        let name = record.name.clone();
        match self.store.create(record.clone()).await {
            Ok(_) => {
                debug!(attach_id = %name, "attachment record created");
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                let existing = self.store.get(&name).await?;
                if existing.spec.node_name != record.spec.node_name
                    || existing.spec.attacher != record.spec.attacher
                {
                    return Err(CsiError::Conflict {
                        attach_id: name,
                        reason: format!(
                            "existing record is for driver {} on node {}",
                            existing.spec.attacher, existing.spec.node_name
                        ),
                    });
                }
                if !same_source(&existing.spec.source, &record.spec.source) {
                    return Err(CsiError::Conflict {
                        attach_id: name,
                        reason: format!(
                            "existing record has a different source ({})",
                            source_kind(&existing.spec.source)
                        ),
                    });
                }
                debug!(attach_id = %name, "attachment record already exists, reusing");
                Ok(())
            }
            Err(e) => {
                warn!(attach_id = %name, error = %e, "failed to create attachment record");
                Err(e)
            }
        }
    }

    fn check(record: &AttachmentRecord) -> Result<Observation, CsiError> {
        if record.status.attached {
            return Ok(Observation::Attached);
        }
        if let Some(err) = &record.status.attach_error {
            return Err(CsiError::AttachFailed {
                attach_id: record.name.clone(),
                driver: record.spec.attacher.clone(),
                message: err.message.clone(),
            });
        }
        Ok(Observation::Pending)
    }

    /// Observe `attach_id` until it is attached, fails, disappears, the
    /// policy runs out of attempts or `deadline` passes.
    async fn wait(
        &self,
        attach_id: &str,
        volume: &str,
        driver: &str,
        timeout: Duration,
    ) -> Result<(), CsiError> {
        let timeout = timeout.min(MAX_ATTACH_TIMEOUT);
        let deadline = Instant::now() + timeout;
        let timed_out = || CsiError::Timeout {
            attach_id: attach_id.to_owned(),
            volume: volume.to_owned(),
            driver: driver.to_owned(),
            waited: timeout,
        };

        // Subscribe before the first read so no transition falls in between.
        let mut events = Some(self.store.watch(attach_id).await?);
        let mut schedule = self.config.wait.schedule();

        loop {
            if Instant::now() >= deadline {
                return Err(timed_out());
            }
            let record = self.store.get(attach_id).await?;
            if let Observation::Attached = Self::check(&record)? {
                return Ok(());
            }

            let Some(delay) = schedule.next() else {
                debug!(%attach_id, "wait policy exhausted");
                return Err(timed_out());
            };
            let wake = Instant::now()
                .checked_add(delay)
                .map_or(deadline, |at| at.min(deadline));

            // Sleep until the next observation, waking early on a change.
            loop {
                let event = match events.as_mut() {
                    Some(stream) => tokio::select! {
                        event = stream.next() => event,
                        _ = sleep_until(wake) => break,
                    },
                    None => {
                        sleep_until(wake).await;
                        break;
                    }
                };
                match event {
                    Some(WatchEvent::Added(record)) | Some(WatchEvent::Modified(record)) => {
                        if let Observation::Attached = Self::check(&record)? {
                            return Ok(());
                        }
                    }
                    Some(WatchEvent::Deleted(_)) => {
                        return Err(CsiError::NotFound(format!(
                            "attachment {attach_id} deleted while waiting"
                        )));
                    }
                    None => {
                        debug!(%attach_id, "watch closed, falling back to polling");
                        events = None;
                    }
                }
                if Instant::now() >= deadline {
                    return Err(timed_out());
                }
            }
        }
    }
}

/// Persistent volumes must name the same volume; inline sources only need to
/// agree on the kind, since the handle is already part of the record name.
fn same_source(a: &AttachmentSource, b: &AttachmentSource) -> bool {
    match (a, b) {
        (AttachmentSource::PersistentVolume(x), AttachmentSource::PersistentVolume(y)) => x == y,
        (AttachmentSource::Inline(_), AttachmentSource::Inline(_)) => true,
        _ => false,
    }
}

fn source_kind(source: &AttachmentSource) -> &'static str {
    match source {
        AttachmentSource::PersistentVolume(_) => "persistent volume",
        AttachmentSource::Inline(_) => "inline",
    }
}

#[async_trait]
impl VolumeAttacher for AttachmentCoordinator {
    #[instrument(skip(self, record), fields(attach_id = %record.name, driver = %record.spec.attacher))]
    async fn attach(
        &self,
        record: AttachmentRecord,
        timeout: Duration,
    ) -> Result<String, CsiError> {
        let name = record.name.clone();
        let volume = record.volume().to_owned();
        let driver = record.spec.attacher.clone();

        self.post(record).await?;
        self.wait(&name, &volume, &driver, timeout)
            .await
            .inspect_err(|e| warn!(error = %e, %volume, "attachment did not complete"))?;

        info!(%volume, "volume attached");
        Ok(name)
    }

    #[instrument(skip(self))]
    async fn wait_for_attach(&self, attach_id: &str, timeout: Duration) -> Result<(), CsiError> {
        let record = self.store.get(attach_id).await?;
        self.wait(attach_id, record.volume(), &record.spec.attacher, timeout)
            .await
    }

    #[instrument(skip(self))]
    async fn detach(&self, attach_id: &str) -> Result<(), CsiError> {
        match self.store.delete(attach_id).await {
            Ok(()) => {
                info!("attachment record deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!("attachment record already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn publish_context(&self, attach_id: &str) -> Result<HashMap<String, String>, CsiError> {
        Ok(self.store.get(attach_id).await?.status.attachment_metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryStore;
    use crate::config::WaitPolicy;
    use crate::types::{AttachmentError, AttachmentStatus, CsiVolumeSource, InlineVolumeSource};

    const NODE: &str = "node-1";

    fn fast_config() -> AttachConfig {
        AttachConfig::default().with_wait(WaitPolicy::Poll {
            interval: Duration::from_millis(10),
        })
    }

    fn coordinator(store: &Arc<MemoryStore>, config: AttachConfig) -> AttachmentCoordinator {
        AttachmentCoordinator::new(Arc::clone(store) as Arc<dyn AttachmentStore>, NODE, config)
    }

    fn record(handle: &str, driver: &str) -> AttachmentRecord {
        AttachmentRecord::new(
            attachment_name(handle, driver, NODE),
            NODE,
            driver,
            AttachmentSource::PersistentVolume(handle.into()),
        )
    }

    fn attached() -> AttachmentStatus {
        AttachmentStatus {
            attached: true,
            ..Default::default()
        }
    }

    /// Flip `name` to attached once it appears, after `delay`.
    fn mark_attached_after(store: &Arc<MemoryStore>, name: String, delay: Duration) {
        let store = Arc::clone(store);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for _ in 0..500 {
                if store.set_status(&name, attached()).is_ok() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });
    }

    #[test]
    fn name_is_deterministic_and_safe() {
        let a = attachment_name("vol-A", "drv-X", "node-1");
        let b = attachment_name("vol-A", "drv-X", "node-1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 68);
        assert!(a.starts_with("csi-"));
        assert!(
            a.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        );
    }

    #[test]
    fn name_differs_per_triple() {
        let base = attachment_name("vol-A", "drv-X", "node-1");
        assert_ne!(base, attachment_name("vol-B", "drv-X", "node-1"));
        assert_ne!(base, attachment_name("vol-A", "drv-Y", "node-1"));
        assert_ne!(base, attachment_name("vol-A", "drv-X", "node-2"));
    }

    #[test]
    fn name_frames_each_field() {
        assert_ne!(
            attachment_name("vol-1d", "rv", "node-1"),
            attachment_name("vol-1", "drv", "node-1")
        );
        assert_ne!(
            attachment_name("vol-1", "drv-Xn", "ode-1"),
            attachment_name("vol-1", "drv-X", "node-1")
        );
    }

    #[tokio::test]
    async fn split_triples_get_separate_records() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = coordinator(&store, fast_config());
        let mut first = record("vol-1d", "rv");
        first.status = attached();
        let mut second = record("vol-1", "drv");
        second.status = attached();
        store.create(first.clone()).await.unwrap();

        let id = coordinator
            .attach(second, Duration::from_secs(1))
            .await
            .unwrap();
        assert_ne!(id, first.name);
        assert_eq!(store.attachment_count(), 2);
    }

    #[tokio::test]
    async fn huge_timeout_does_not_overflow_the_deadline() {
        let store = Arc::new(MemoryStore::new());
        let config = AttachConfig::from_lookup(|key| {
            (key == crate::config::ENV_ATTACH_TIMEOUT_SECS).then(|| u64::MAX.to_string())
        })
        .with_wait(WaitPolicy::Poll {
            interval: Duration::from_millis(10),
        });
        let coordinator = coordinator(&store, config.clone());
        let rec = record("vol-A", "drv-X");
        let name = rec.name.clone();
        mark_attached_after(&store, name.clone(), Duration::from_millis(20));

        let id = coordinator.attach(rec, config.attach_timeout).await.unwrap();
        assert_eq!(id, name);

        let id = coordinator
            .attach(record("vol-A", "drv-X"), Duration::MAX)
            .await
            .unwrap();
        assert_eq!(id, name);
    }

    #[tokio::test]
    async fn inline_attach_does_not_reuse_persistent_volume_record() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = coordinator(&store, fast_config());
        let mut pv = record("vol-A", "drv-X");
        pv.status = attached();
        store.create(pv.clone()).await.unwrap();

        let mut inline = record("vol-A", "drv-X");
        inline.spec.source = AttachmentSource::Inline(InlineVolumeSource {
            namespace: "ns1".into(),
            volume_source: CsiVolumeSource {
                driver: "drv-X".into(),
                volume_handle: Some("vol-A".into()),
                ..Default::default()
            },
        });
        let err = coordinator
            .attach(inline, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::Conflict { ref reason, .. } if reason.contains("persistent volume")));
    }

    #[tokio::test]
    async fn attach_returns_once_status_flips() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = coordinator(&store, fast_config());
        let rec = record("vol-A", "drv-X");
        let name = rec.name.clone();

        mark_attached_after(&store, name.clone(), Duration::from_millis(50));

        let started = Instant::now();
        let id = coordinator
            .attach(rec, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(id, name);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(store.get(&name).await.unwrap().status.attached);
    }

    #[tokio::test]
    async fn attach_times_out_when_never_attached() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = coordinator(&store, fast_config());
        let rec = record("vol-A", "drv-X");

        let started = Instant::now();
        let err = coordinator
            .attach(rec, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "unexpected error: {err}");
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn backoff_policy_gives_up_after_its_steps() {
        let store = Arc::new(MemoryStore::new());
        let config = AttachConfig::default().with_wait(WaitPolicy::Backoff {
            initial: Duration::from_millis(5),
            factor: 1.2,
            steps: 3,
        });
        let coordinator = coordinator(&store, config);

        let started = Instant::now();
        let err = coordinator
            .attach(record("vol-A", "drv-X"), Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn existing_record_is_reused() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = coordinator(&store, fast_config());
        let mut rec = record("vol-A", "drv-X");
        rec.status = attached();
        store.create(rec.clone()).await.unwrap();

        let id = coordinator
            .attach(record("vol-A", "drv-X"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(id, rec.name);
        assert_eq!(store.attachment_count(), 1);
    }

    #[tokio::test]
    async fn mismatched_existing_record_conflicts() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = coordinator(&store, fast_config());
        let rec = record("vol-A", "drv-X");

        let mut foreign = rec.clone();
        foreign.spec.node_name = "node-2".into();
        store.create(foreign).await.unwrap();

        let err = coordinator
            .attach(rec, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::Conflict { .. }));
    }

    #[tokio::test]
    async fn controller_error_fails_the_wait() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = Arc::new(coordinator(&store, fast_config()));
        let rec = record("vol-A", "drv-X");
        let name = rec.name.clone();

        let task = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.attach(rec, Duration::from_secs(5)).await })
        };
        while !store.contains_attachment(&name) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        store
            .set_status(
                &name,
                AttachmentStatus {
                    attach_error: Some(AttachmentError {
                        message: "disk busy".into(),
                    }),
                    ..Default::default()
                },
            )
            .unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, CsiError::AttachFailed { ref message, .. } if message == "disk busy"));
    }

    #[tokio::test]
    async fn wait_for_attach_on_missing_record_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = coordinator(&store, fast_config());
        let err = coordinator
            .wait_for_attach("csi-missing", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn detach_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = coordinator(&store, fast_config());
        let rec = record("vol-A", "drv-X");
        store.create(rec.clone()).await.unwrap();

        coordinator.detach(&rec.name).await.unwrap();
        assert!(!store.contains_attachment(&rec.name));
        coordinator.detach(&rec.name).await.unwrap();
    }

    #[tokio::test]
    async fn volumes_are_attached_reports_each_record() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = coordinator(&store, fast_config());
        let mut done = record("vol-A", "drv-X");
        done.status = attached();
        let pending = record("vol-B", "drv-X");
        store.create(done.clone()).await.unwrap();
        store.create(pending.clone()).await.unwrap();

        let ids = vec![done.name.clone(), pending.name.clone(), "csi-gone".to_owned()];
        let status = coordinator.volumes_are_attached(&ids).await.unwrap();
        assert!(status[&done.name]);
        assert!(!status[&pending.name]);
        assert!(!status["csi-gone"]);
    }
}
