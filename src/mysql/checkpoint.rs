//! GTID checkpointing
//!
//! A single task drains the coordinate channel. Real coordinates update the
//! in-memory tracking and are uploaded to the coordination store on a short
//! cadence; a `None` coordinate forces an immediate upload, which is the
//! fence used after bulk-load completion and after a target GTID arrives.
//!
//! Uploads are monotone: the serialized set only ever grows, so every
//! upload is a superset of the one before it.

use crate::common::error::Result;
use crate::common::gtid::{BinlogCoordinateTx, GtidSet};
use crate::common::shutdown::ShutdownListener;
use crate::common::store::SharedJobStore;
use crate::mysql::applier::ApplierShared;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Cadence of periodic checkpoint uploads.
pub const UPLOAD_INTERVAL: Duration = Duration::from_secs(5);

/// Why the checkpointer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// Shutdown fired or the coordinate channel closed
    Shutdown,
    /// The tracked set covers the configured target GTID
    TargetReached,
}

/// Drain the coordinate channel, keep the store's checkpoint fresh and
/// watch for the target GTID.
pub async fn run_gtid_checkpointer(
    subject: String,
    store: SharedJobStore,
    shared: Arc<ApplierShared>,
    mut gtid_rx: mpsc::Receiver<Option<BinlogCoordinateTx>>,
    mut shutdown: ShutdownListener,
) -> Result<CheckpointOutcome> {
    let mut ticker = tokio::time::interval(UPLOAD_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut dirty = false;

    loop {
        tokio::select! {
            coord = gtid_rx.recv() => match coord {
                Some(Some(coord)) => {
                    shared.update_coords(
                        &coord.log_file,
                        coord.log_pos,
                        shared.serialized_gtid_set(),
                    );
                    dirty = true;
                }
                Some(None) => {
                    // forced upload: bulk-load fence or target refresh
                    upload(&store, &subject, &shared).await?;
                    dirty = false;
                    if shared.target_reached() {
                        return Ok(CheckpointOutcome::TargetReached);
                    }
                }
                None => {
                    if dirty {
                        upload(&store, &subject, &shared).await?;
                    }
                    return Ok(CheckpointOutcome::Shutdown);
                }
            },
            _ = ticker.tick() => {
                if dirty {
                    upload(&store, &subject, &shared).await?;
                    dirty = false;
                }
                if shared.target_reached() {
                    return Ok(CheckpointOutcome::TargetReached);
                }
            }
            _ = shutdown.cancelled() => {
                if dirty {
                    upload(&store, &subject, &shared).await?;
                }
                return Ok(CheckpointOutcome::Shutdown);
            }
        }
    }
}

async fn upload(store: &SharedJobStore, subject: &str, shared: &ApplierShared) -> Result<()> {
    let serialized = shared.serialized_gtid_set();
    debug!(subject, gtid = %serialized, "uploading GTID checkpoint");
    store.put_gtid_set(subject, &serialized).await
}

/// Block on the coordination store until a target GTID is configured, then
/// record it and force a checkpoint pass so an already-covered target
/// finishes the job without waiting for new traffic.
pub async fn run_target_watcher(
    subject: String,
    store: SharedJobStore,
    shared: Arc<ApplierShared>,
    gtid_tx: mpsc::Sender<Option<BinlogCoordinateTx>>,
    shutdown: ShutdownListener,
) -> Result<()> {
    let Some(target) = store.watch_target_gtid(&subject, shutdown).await? else {
        return Ok(());
    };
    info!(subject, gtid = %target, "got target GTID set");
    let parsed = GtidSet::parse(&target)?;
    shared.set_target_gtid(parsed);
    let _ = gtid_tx.send(None).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::gtid::GtidSet;
    use crate::common::shutdown::ShutdownSignal;
    use crate::common::store::MemoryJobStore;
    use uuid::Uuid;

    const SID: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";

    fn coord(gno: u64) -> BinlogCoordinateTx {
        BinlogCoordinateTx {
            log_file: "mysql-bin.000001".into(),
            log_pos: 100 + gno,
            sid: Uuid::parse_str(SID).unwrap(),
            gno,
            seq_number: gno as i64,
            last_committed: gno as i64 - 1,
        }
    }

    #[tokio::test]
    async fn test_uploads_are_monotone_supersets() {
        let store = MemoryJobStore::new();
        let store_dyn: SharedJobStore = store.clone();
        let shared = Arc::new(ApplierShared::new());
        let (signal, listener) = ShutdownSignal::new();
        let (tx, rx) = mpsc::channel(16);

        let task = tokio::spawn(run_gtid_checkpointer(
            "j".into(),
            store_dyn.clone(),
            shared.clone(),
            rx,
            listener,
        ));

        for gno in 1..=5 {
            let c = coord(gno);
            shared.commit_gtid(&c);
            tx.send(Some(c)).await.unwrap();
            // force an upload per commit so the history has several points
            tx.send(None).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        signal.trigger().unwrap();
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome, CheckpointOutcome::Shutdown);

        let uploads = store.gtid_uploads("j").await;
        assert!(uploads.len() >= 5);
        for pair in uploads.windows(2) {
            let prev = GtidSet::parse(&pair[0]).unwrap();
            let next = GtidSet::parse(&pair[1]).unwrap();
            assert!(
                next.contains(&prev),
                "upload regressed: {} then {}",
                pair[0],
                pair[1]
            );
        }
        assert_eq!(
            store.last_gtid_set("j").await.as_deref(),
            Some(format!("{SID}:1-5").as_str())
        );
    }

    #[tokio::test]
    async fn test_forced_upload_detects_target() {
        let store = MemoryJobStore::new();
        let store_dyn: SharedJobStore = store.clone();
        let shared = Arc::new(ApplierShared::new());
        let (_signal, listener) = ShutdownSignal::new();
        let (tx, rx) = mpsc::channel(16);

        shared.set_target_gtid(GtidSet::parse(&format!("{SID}:1-3")).unwrap());

        let task = tokio::spawn(run_gtid_checkpointer(
            "j".into(),
            store_dyn.clone(),
            shared.clone(),
            rx,
            listener,
        ));

        for gno in 1..=3 {
            let c = coord(gno);
            shared.commit_gtid(&c);
            tx.send(Some(c)).await.unwrap();
        }
        tx.send(None).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("checkpointer should finish")
            .unwrap()
            .unwrap();
        assert_eq!(outcome, CheckpointOutcome::TargetReached);
    }

    #[tokio::test]
    async fn test_target_watcher_records_and_forces_pass() {
        let store = MemoryJobStore::new();
        let store_dyn: SharedJobStore = store.clone();
        let shared = Arc::new(ApplierShared::new());
        let (_signal, listener) = ShutdownSignal::new();
        let (tx, mut rx) = mpsc::channel(4);

        store.set_target_gtid("j", &format!("{SID}:1-9")).await;
        run_target_watcher(
            "j".into(),
            store_dyn.clone(),
            shared.clone(),
            tx,
            listener,
        )
        .await
        .unwrap();

        // the forced pass lands on the coordinate channel
        assert_eq!(rx.recv().await, Some(None));
        assert!(!shared.target_reached());
        let c = coord(9);
        let mut set = GtidSet::new();
        for gno in 1..=9 {
            set.add_gtid(c.sid, gno);
        }
        shared.union_gtid_set(&set);
        assert!(shared.target_reached());
    }

    #[tokio::test]
    async fn test_bad_target_gtid_is_fatal() {
        let store = MemoryJobStore::new();
        let store_dyn: SharedJobStore = store.clone();
        let shared = Arc::new(ApplierShared::new());
        let (_signal, listener) = ShutdownSignal::new();
        let (tx, _rx) = mpsc::channel(4);

        store.set_target_gtid("j", "garbage").await;
        let err = run_target_watcher(
            "j".into(),
            store_dyn.clone(),
            shared,
            tx,
            listener,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, crate::common::error::ReplayError::BadGtid(_)));
    }
}
