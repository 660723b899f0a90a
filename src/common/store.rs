//! Coordination store interface
//!
//! The key/value coordination store (GTID checkpoint persistence, job
//! status, target-GTID handoff) is an external system consumed through the
//! [`JobStore`] trait. Two local implementations ship with the crate: an
//! in-memory store backing the tests (it records every GTID upload in
//! order, which is what the monotonicity property checks ride on) and a
//! file-backed store for single-node runs.

use crate::common::error::{ReplayError, Result};
use crate::common::shutdown::ShutdownListener;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::debug;

/// Job status values kept in the coordination store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Running,
    /// The applier reached the configured target GTID and finished cleanly.
    TargetGtidFinished,
}

/// Coordination-store operations consumed by the applier.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get_job_status(&self, subject: &str) -> Result<JobStatus>;

    async fn put_job_status(&self, subject: &str, status: JobStatus) -> Result<()>;

    /// Publish the applier's bus address for the extractor to find.
    async fn put_applier_addr(&self, subject: &str, addr: &str) -> Result<()>;

    /// Block until a target GTID set is configured for the job, or until
    /// shutdown fires (`None`).
    async fn watch_target_gtid(
        &self,
        subject: &str,
        shutdown: ShutdownListener,
    ) -> Result<Option<String>>;

    /// Checkpoint upload of the serialized GTID set.
    async fn put_gtid_set(&self, subject: &str, serialized: &str) -> Result<()>;
}

/// Shared store handle.
pub type SharedJobStore = Arc<dyn JobStore>;

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
struct MemoryState {
    statuses: HashMap<String, JobStatus>,
    applier_addrs: HashMap<String, String>,
    gtid_uploads: HashMap<String, Vec<String>>,
    targets: HashMap<String, watch::Sender<Option<String>>>,
}

/// In-memory [`JobStore`] for tests and single-process runs.
#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
}

impl MemoryJobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Configure the target GTID for a job, waking any watcher.
    pub async fn set_target_gtid(&self, subject: &str, gtid: &str) {
        let mut state = self.state.lock().await;
        let tx = state
            .targets
            .entry(subject.to_string())
            .or_insert_with(|| watch::channel(None).0);
        let _ = tx.send(Some(gtid.to_string()));
    }

    /// Every GTID set uploaded for the job, in upload order.
    pub async fn gtid_uploads(&self, subject: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state.gtid_uploads.get(subject).cloned().unwrap_or_default()
    }

    /// The most recent uploaded GTID set, if any.
    pub async fn last_gtid_set(&self, subject: &str) -> Option<String> {
        let state = self.state.lock().await;
        state
            .gtid_uploads
            .get(subject)
            .and_then(|v| v.last())
            .cloned()
    }

    pub async fn applier_addr(&self, subject: &str) -> Option<String> {
        let state = self.state.lock().await;
        state.applier_addrs.get(subject).cloned()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get_job_status(&self, subject: &str) -> Result<JobStatus> {
        let state = self.state.lock().await;
        Ok(state.statuses.get(subject).copied().unwrap_or_default())
    }

    async fn put_job_status(&self, subject: &str, status: JobStatus) -> Result<()> {
        let mut state = self.state.lock().await;
        state.statuses.insert(subject.to_string(), status);
        Ok(())
    }

    async fn put_applier_addr(&self, subject: &str, addr: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .applier_addrs
            .insert(subject.to_string(), addr.to_string());
        debug!(subject, addr, "applier address published");
        Ok(())
    }

    async fn watch_target_gtid(
        &self,
        subject: &str,
        mut shutdown: ShutdownListener,
    ) -> Result<Option<String>> {
        let mut rx = {
            let mut state = self.state.lock().await;
            state
                .targets
                .entry(subject.to_string())
                .or_insert_with(|| watch::channel(None).0)
                .subscribe()
        };
        loop {
            if let Some(target) = rx.borrow_and_update().clone() {
                return Ok(Some(target));
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                }
                _ = shutdown.cancelled() => return Ok(None),
            }
        }
    }

    async fn put_gtid_set(&self, subject: &str, serialized: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .gtid_uploads
            .entry(subject.to_string())
            .or_default()
            .push(serialized.to_string());
        Ok(())
    }
}

// ============================================================================
// File-backed store
// ============================================================================

/// File-backed [`JobStore`] for single-node deployments.
///
/// One JSON file per job under the base directory, written atomically via
/// temp file + rename. The target-GTID watch polls the file, so an operator
/// can finish a job by editing its state with any tool.
pub struct FileJobStore {
    dir: PathBuf,
    poll_interval: Duration,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct JobRecord {
    status: JobStatus,
    applier_addr: Option<String>,
    gtid_set: Option<String>,
    target_gtid: Option<String>,
}

impl FileJobStore {
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ReplayError::config(format!("cannot create store dir: {e}")))?;
        Ok(Arc::new(Self {
            dir,
            poll_interval: Duration::from_secs(1),
        }))
    }

    fn file_path(&self, subject: &str) -> PathBuf {
        self.dir.join(format!("{subject}.json"))
    }

    async fn load(&self, subject: &str) -> Result<JobRecord> {
        match tokio::fs::read(self.file_path(subject)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(JobRecord::default()),
            Err(e) => Err(ReplayError::config(format!("cannot read job record: {e}"))),
        }
    }

    async fn save(&self, subject: &str, record: &JobRecord) -> Result<()> {
        let path = self.file_path(subject);
        let tmp = path.with_extension("tmp");
        let json = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| ReplayError::config(format!("cannot write job record: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| ReplayError::config(format!("cannot persist job record: {e}")))?;
        Ok(())
    }

    async fn update<F>(&self, subject: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut JobRecord),
    {
        let mut record = self.load(subject).await?;
        mutate(&mut record);
        self.save(subject, &record).await
    }

    /// Configure the target GTID for a job.
    pub async fn set_target_gtid(&self, subject: &str, gtid: &str) -> Result<()> {
        let gtid = gtid.to_string();
        self.update(subject, |r| r.target_gtid = Some(gtid)).await
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn get_job_status(&self, subject: &str) -> Result<JobStatus> {
        Ok(self.load(subject).await?.status)
    }

    async fn put_job_status(&self, subject: &str, status: JobStatus) -> Result<()> {
        self.update(subject, |r| r.status = status).await
    }

    async fn put_applier_addr(&self, subject: &str, addr: &str) -> Result<()> {
        let addr = addr.to_string();
        self.update(subject, |r| r.applier_addr = Some(addr)).await
    }

    async fn watch_target_gtid(
        &self,
        subject: &str,
        mut shutdown: ShutdownListener,
    ) -> Result<Option<String>> {
        loop {
            if let Some(target) = self.load(subject).await?.target_gtid {
                return Ok(Some(target));
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.cancelled() => return Ok(None),
            }
        }
    }

    async fn put_gtid_set(&self, subject: &str, serialized: &str) -> Result<()> {
        let serialized = serialized.to_string();
        self.update(subject, |r| r.gtid_set = Some(serialized)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::shutdown::ShutdownSignal;

    #[tokio::test]
    async fn test_status_roundtrip() {
        let store = MemoryJobStore::new();
        assert_eq!(
            store.get_job_status("j").await.unwrap(),
            JobStatus::Running
        );
        store
            .put_job_status("j", JobStatus::TargetGtidFinished)
            .await
            .unwrap();
        assert_eq!(
            store.get_job_status("j").await.unwrap(),
            JobStatus::TargetGtidFinished
        );
    }

    #[tokio::test]
    async fn test_gtid_uploads_recorded_in_order() {
        let store = MemoryJobStore::new();
        store.put_gtid_set("j", "u:1-3").await.unwrap();
        store.put_gtid_set("j", "u:1-5").await.unwrap();
        assert_eq!(store.gtid_uploads("j").await, vec!["u:1-3", "u:1-5"]);
        assert_eq!(store.last_gtid_set("j").await.as_deref(), Some("u:1-5"));
    }

    #[tokio::test]
    async fn test_watch_target_gtid_wakes_on_set() {
        let store = MemoryJobStore::new();
        let (_signal, listener) = ShutdownSignal::new();

        let watcher_store = store.clone();
        let watcher = tokio::spawn(async move {
            watcher_store.watch_target_gtid("j", listener).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.set_target_gtid("j", "u:1-100").await;

        let got = tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got.as_deref(), Some("u:1-100"));
    }

    #[tokio::test]
    async fn test_file_store_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::new(dir.path()).await.unwrap();
        store.put_gtid_set("j", "u:1-9").await.unwrap();
        store
            .put_job_status("j", JobStatus::TargetGtidFinished)
            .await
            .unwrap();

        // a new store over the same directory sees the persisted state
        let store2 = FileJobStore::new(dir.path()).await.unwrap();
        assert_eq!(
            store2.get_job_status("j").await.unwrap(),
            JobStatus::TargetGtidFinished
        );
        assert_eq!(
            store2.load("j").await.unwrap().gtid_set.as_deref(),
            Some("u:1-9")
        );
    }

    #[tokio::test]
    async fn test_file_store_watch_polls_target() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::new(dir.path()).await.unwrap();
        let (_signal, listener) = ShutdownSignal::new();

        let watcher_store = store.clone();
        let watcher =
            tokio::spawn(async move { watcher_store.watch_target_gtid("j", listener).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.set_target_gtid("j", "u:1-4").await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), watcher)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got.as_deref(), Some("u:1-4"));
    }

    #[tokio::test]
    async fn test_watch_target_gtid_unblocks_on_shutdown() {
        let store = MemoryJobStore::new();
        let (signal, listener) = ShutdownSignal::new();

        let watcher_store = store.clone();
        let watcher = tokio::spawn(async move {
            watcher_store.watch_target_gtid("j", listener).await
        });

        signal.trigger().unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(got.is_none());
    }
}
