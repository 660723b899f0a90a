//! The incremental applier
//!
//! Owns the whole destination side of one replication job: the bus
//! subscriptions, the reassembly and decode stages, the bulk-load apply,
//! the worker pool for incremental transactions, GTID checkpointing and
//! the cooperative shutdown of all of it.
//!
//! ```text
//!  _full ──► reassemble ──► full_bytes ──► decode ──► dump apply (1 conn)
//!  _full_complete ──► fence: FK policy + starting GTID + forced upload
//!  _incr_hete ──► reassemble ──► incr_bytes ──► decode ──► entry queue
//!                                                   │
//!                                  dispatcher (skip applied, DDL barrier)
//!                                                   │
//!                                      workers (N conns, commit gate)
//!                                                   │
//!                                        gtid_ch ──► checkpointer ──► store
//! ```
//!
//! Acks to the extractor are sent only after a reassembled payload has been
//! accepted by the downstream queue, so a full queue stalls the sender.

use crate::common::bus::{ControlMsg, SharedBus, Subjects};
use crate::common::config::JobConfig;
use crate::common::error::{ExitResult, ReplayError, Result, TaskState};
use crate::common::gtid::{BinlogCoordinateTx, GtidSet};
use crate::common::reassembler::MsgReassembler;
use crate::common::shutdown::{ShutdownListener, ShutdownSignal};
use crate::common::stats::{self, CurrentCoordinates, MemoryStat, Stage, TaskStatistics};
use crate::common::store::{JobStatus, SharedJobStore};
use crate::mysql::checkpoint::{run_gtid_checkpointer, run_target_watcher, CheckpointOutcome};
use crate::mysql::dump::{render_replace_statements, DumpEntry, DumpStatResult};
use crate::mysql::incremental::{
    exec_statement, execute_entry, BinlogEntries, BinlogEntry, CommitGate, TableLayout,
};
use crate::schema::{parse_ddl, DdlStatement, SchemaCatalog};
use anyhow::Context;
use bytes::Bytes;
use mysql_async::prelude::*;
use mysql_async::{Conn, TxOpts};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Raw reassembled bulk-load payloads waiting for decode.
const FULL_BYTES_QUEUE_CAP: usize = 16;
/// Raw reassembled incremental payloads waiting for decode.
const INCR_BYTES_QUEUE_CAP: usize = 16;
/// Decoded transaction entries waiting for dispatch.
const BINLOG_ENTRY_QUEUE_CAP: usize = 64;
/// Committed coordinates waiting for checkpoint upload.
const GTID_CH_CAP: usize = 4096;
/// Per-worker handoff depth; dispatch stays one transaction ahead.
const WORKER_QUEUE_CAP: usize = 1;
/// How long shutdown waits for workers to finish the current transaction.
const SHUTDOWN_TASK_TIMEOUT: Duration = Duration::from_secs(10);

/// Counters and coordination state shared between the applier, its
/// incremental workers, the checkpointer and stats readers. The incremental
/// side reaches the outer applier only through this accessor surface.
pub struct ApplierShared {
    /// The in-memory applied GTID set. Writers hold the lock only for the
    /// union; readers snapshot briefly for stats and upload serialization.
    gtid_set: std::sync::RwLock<GtidSet>,
    coords: std::sync::Mutex<CurrentCoordinates>,
    target_gtid: std::sync::Mutex<Option<GtidSet>>,
    pub total_rows_replayed: AtomicI64,
    pub total_delta_copied: AtomicI64,
    pub applied_tx_count: AtomicU32,
    pub memory_full: AtomicI64,
    pub memory_incr: AtomicI64,
    /// Dump entries received but not yet applied; the row-copy fence waits
    /// for this to reach zero.
    pub n_dump_entry: AtomicI64,
}

impl ApplierShared {
    pub fn new() -> Self {
        Self {
            gtid_set: std::sync::RwLock::new(GtidSet::new()),
            coords: std::sync::Mutex::new(CurrentCoordinates::default()),
            target_gtid: std::sync::Mutex::new(None),
            total_rows_replayed: AtomicI64::new(0),
            total_delta_copied: AtomicI64::new(0),
            applied_tx_count: AtomicU32::new(0),
            memory_full: AtomicI64::new(0),
            memory_incr: AtomicI64::new(0),
            n_dump_entry: AtomicI64::new(0),
        }
    }

    /// Union a freshly committed transaction into the set.
    pub fn commit_gtid(&self, coord: &BinlogCoordinateTx) {
        let mut set = self.gtid_set.write().unwrap_or_else(|e| e.into_inner());
        set.add_gtid(coord.sid, coord.gno);
    }

    /// Union a whole set in; never re-assigns the tracked set.
    pub fn union_gtid_set(&self, other: &GtidSet) {
        let mut set = self.gtid_set.write().unwrap_or_else(|e| e.into_inner());
        set.union(other);
    }

    /// Has this transaction already been applied? Drives idempotent skip.
    pub fn gtid_applied(&self, coord: &BinlogCoordinateTx) -> bool {
        let set = self.gtid_set.read().unwrap_or_else(|e| e.into_inner());
        set.contains_gtid(coord.sid, coord.gno)
    }

    pub fn serialized_gtid_set(&self) -> String {
        let set = self.gtid_set.read().unwrap_or_else(|e| e.into_inner());
        set.to_string()
    }

    /// Is the tracked set a superset of the configured target?
    pub fn target_reached(&self) -> bool {
        let target = self.target_gtid.lock().unwrap_or_else(|e| e.into_inner());
        let Some(target) = target.as_ref() else {
            return false;
        };
        let set = self.gtid_set.read().unwrap_or_else(|e| e.into_inner());
        set.contains(target)
    }

    pub fn set_target_gtid(&self, target: GtidSet) {
        *self.target_gtid.lock().unwrap_or_else(|e| e.into_inner()) = Some(target);
    }

    pub fn update_coords(&self, file: &str, pos: u64, gtid_set: String) {
        let mut coords = self.coords.lock().unwrap_or_else(|e| e.into_inner());
        if !file.is_empty() {
            coords.file = file.to_string();
        }
        if pos > 0 {
            coords.position = pos;
        }
        coords.gtid_set = gtid_set;
    }

    pub fn coords(&self) -> CurrentCoordinates {
        self.coords.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for ApplierShared {
    fn default() -> Self {
        Self::new()
    }
}

/// The destination-side applier for one job.
pub struct Applier {
    subjects: Subjects,
    config: JobConfig,
    bus: SharedBus,
    store: SharedJobStore,
    /// The applier's own bus address, published for the extractor
    bus_addr: String,
    shared: Arc<ApplierShared>,
    catalog: Arc<SchemaCatalog>,
    shutdown: ShutdownSignal,
    listener: ShutdownListener,
    wait_tx: mpsc::Sender<ExitResult>,
    row_copy_complete: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    // queue senders kept for stats (len/cap)
    full_bytes_tx: std::sync::Mutex<Option<mpsc::Sender<Bytes>>>,
    incr_bytes_tx: std::sync::Mutex<Option<mpsc::Sender<Bytes>>>,
    entry_tx: std::sync::Mutex<Option<mpsc::Sender<BinlogEntry>>>,
    stage: std::sync::Mutex<Stage>,
}

impl Applier {
    pub fn new(
        subject: impl Into<String>,
        mut config: JobConfig,
        bus: SharedBus,
        store: SharedJobStore,
        bus_addr: impl Into<String>,
        wait_tx: mpsc::Sender<ExitResult>,
    ) -> Arc<Self> {
        if config.parallel_workers == 0 {
            config.parallel_workers = 1;
        }
        config.mark_row_copy_start();
        let (shutdown, listener) = ShutdownSignal::new();
        let (row_copy_tx, _) = watch::channel(false);
        Arc::new(Self {
            subjects: Subjects::new(subject),
            config,
            bus,
            store,
            bus_addr: bus_addr.into(),
            shared: Arc::new(ApplierShared::new()),
            catalog: Arc::new(SchemaCatalog::new()),
            shutdown,
            listener,
            wait_tx,
            row_copy_complete: row_copy_tx,
            tasks: std::sync::Mutex::new(Vec::new()),
            full_bytes_tx: std::sync::Mutex::new(None),
            incr_bytes_tx: std::sync::Mutex::new(None),
            entry_tx: std::sync::Mutex::new(None),
            stage: std::sync::Mutex::new(Stage::default()),
        })
    }

    pub fn shared(&self) -> &Arc<ApplierShared> {
        &self.shared
    }

    pub fn catalog(&self) -> &Arc<SchemaCatalog> {
        &self.catalog
    }

    fn set_stage(&self, stage: Stage) {
        *self.stage.lock().unwrap_or_else(|e| e.into_inner()) = stage;
    }

    fn row_copy_done(&self) -> bool {
        *self.row_copy_complete.borrow()
    }

    /// Run the complete apply pipeline. Returns after all tasks are
    /// launched; the job's outcome arrives on the wait channel.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        // a job already finished in a previous incarnation shuts down
        // immediately instead of re-subscribing
        if self.store.get_job_status(self.subjects.job()).await? == JobStatus::TargetGtidFinished
        {
            info!(job = %self.subjects.job(), "job already finished, shutting down");
            let _ = self.wait_tx.send(ExitResult::complete()).await;
            self.shutdown().await;
            return Ok(());
        }

        self.store
            .put_applier_addr(self.subjects.job(), &self.bus_addr)
            .await
            .context("publish applier address")?;

        let (db_conn, worker_conns) = self
            .init_db_connections()
            .await
            .context("init destination connections")?;

        let (gtid_tx, gtid_rx) = mpsc::channel::<Option<BinlogCoordinateTx>>(GTID_CH_CAP);

        if self.config.enable_full_copy {
            self.spawn_full_pipeline(db_conn, gtid_tx.clone()).await?;
        } else {
            // no bulk-load phase configured: the fence is already closed
            let _ = self.row_copy_complete.send(true);
        }
        self.spawn_incremental_pipeline(worker_conns, gtid_tx.clone())
            .await?;
        self.spawn_checkpointer(gtid_rx);
        self.spawn_target_watcher(gtid_tx);

        info!(job = %self.subjects.job(), workers = self.config.parallel_workers, "applier running");
        Ok(())
    }

    // ========================================================================
    // Connection setup
    // ========================================================================

    async fn init_db_connections(&self) -> Result<(Conn, Vec<Conn>)> {
        let opts = self.config.connection.opts();
        let mut db_conn = Conn::new(opts.clone()).await?;

        let sysvars: Option<(String, i64)> = db_conn
            .query_first("SELECT @@version, @@lower_case_table_names")
            .await?;
        let (version, lower_case) = sysvars.unwrap_or_default();
        debug!(%version, lower_case, "destination connected");

        if !self.config.skip_privilege_check {
            let grants: Vec<String> = db_conn.query("SHOW GRANTS FOR CURRENT_USER()").await?;
            if !dest_grants_sufficient(grants.iter().map(String::as_str)) {
                return Err(ReplayError::InsufficientPrivileges(
                    "applier needs ALL, SUPER, or ALTER, CREATE, DELETE, DROP, INDEX, INSERT, \
                     SELECT, TRIGGER, UPDATE on *.*"
                        .to_string(),
                ));
            }
        }

        let mut workers = self.config.parallel_workers;
        if version.starts_with("5.6") {
            // 5.6 lacks the group-commit metadata parallel apply needs
            workers = 1;
        }

        if !self.config.restores_foreign_key_checks() {
            warn!(
                workers,
                "parallel apply without dependency tracking, foreign_key_checks stay disabled"
            );
        }

        let mut worker_conns = Vec::with_capacity(workers);
        for _ in 0..workers {
            worker_conns.push(Conn::new(opts.clone()).await?);
        }
        info!(addr = %self.config.connection.addr(), version, workers, "destination connections ready");
        Ok((db_conn, worker_conns))
    }

    // ========================================================================
    // Bulk-load pipeline
    // ========================================================================

    async fn spawn_full_pipeline(
        self: &Arc<Self>,
        mut db_conn: Conn,
        gtid_tx: mpsc::Sender<Option<BinlogCoordinateTx>>,
    ) -> Result<()> {
        let (full_tx, mut full_rx) = mpsc::channel::<Bytes>(FULL_BYTES_QUEUE_CAP);
        *self.full_bytes_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(full_tx.clone());

        // _full subscription: reassemble, enqueue, ack after enqueue
        let mut sub = self.bus.subscribe(&self.subjects.full()).await?;
        let this = Arc::clone(self);
        self.push_task(tokio::spawn(async move {
            let mut nmm = MsgReassembler::new();
            let mut shutdown = this.listener.clone();
            loop {
                let msg = tokio::select! {
                    m = sub.recv() => match m { Some(m) => m, None => break },
                    _ = shutdown.cancelled() => break,
                };
                if this.row_copy_done() {
                    // source task restart after completion: ack and drop
                    this.ack(msg.reply.as_deref()).await;
                    continue;
                }
                let finished = match nmm.handle(&msg.payload).context("reassemble full segment") {
                    Ok(f) => f,
                    Err(e) => {
                        this.on_error(TaskState::Dead, e.into()).await;
                        break;
                    }
                };
                if !finished {
                    this.ack(msg.reply.as_deref()).await;
                    continue;
                }
                let bytes = nmm.bytes();
                nmm.reset();
                this.shared.n_dump_entry.fetch_add(1, Ordering::SeqCst);
                this.shared
                    .memory_full
                    .fetch_add(bytes.len() as i64, Ordering::SeqCst);
                this.set_stage(Stage::SlaveWaitingForWorkersToProcessQueue);
                tokio::select! {
                    sent = full_tx.send(bytes) => {
                        if sent.is_err() {
                            break;
                        }
                        // enqueue accepted: only now does the sender get its ack
                        this.ack(msg.reply.as_deref()).await;
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
            debug!("full subscription drained");
        }));

        // dump apply: decode and replay entries on the dedicated connection
        let this = Arc::clone(self);
        self.push_task(tokio::spawn(async move {
            let mut shutdown = this.listener.clone();
            loop {
                let bytes = tokio::select! {
                    b = full_rx.recv() => match b { Some(b) => b, None => break },
                    _ = shutdown.cancelled() => break,
                };
                let n = bytes.len() as i64;
                let entry = match DumpEntry::decode(&bytes).context("decode dump entry") {
                    Ok(e) => e,
                    Err(e) => {
                        this.on_error(TaskState::Dead, e.into()).await;
                        break;
                    }
                };
                if let Err(e) = this
                    .apply_dump_entry(&mut db_conn, &entry)
                    .await
                    .with_context(|| {
                        format!("apply dump entry for {}.{}", entry.table_schema, entry.table_name)
                    })
                {
                    this.on_error(TaskState::Dead, e.into()).await;
                    break;
                }
                this.shared.memory_full.fetch_sub(n, Ordering::SeqCst);
                this.shared.n_dump_entry.fetch_sub(1, Ordering::SeqCst);
            }
            debug!("dump apply drained");
        }));

        // _full_complete: the row-copy fence
        let mut sub = self.bus.subscribe(&self.subjects.full_complete()).await?;
        let this = Arc::clone(self);
        self.push_task(tokio::spawn(async move {
            let mut shutdown = this.listener.clone();
            loop {
                let msg = tokio::select! {
                    m = sub.recv() => match m { Some(m) => m, None => break },
                    _ = shutdown.cancelled() => break,
                };
                if this.row_copy_done() {
                    this.ack(msg.reply.as_deref()).await;
                    continue;
                }
                let stat = match DumpStatResult::decode(&msg.payload)
                    .context("decode full_complete result")
                {
                    Ok(s) => s,
                    Err(e) => {
                        this.on_error(TaskState::Dead, e.into()).await;
                        break;
                    }
                };
                if let Err(e) = this
                    .finish_row_copy(&stat, &gtid_tx)
                    .await
                    .context("commit row-copy fence")
                {
                    this.on_error(TaskState::Dead, e.into()).await;
                    break;
                }
                this.ack(msg.reply.as_deref()).await;
            }
            debug!("full_complete subscription drained");
        }));

        Ok(())
    }

    /// Replay one dump entry inside a destination transaction: sysvars,
    /// sql_mode, database DDL, table DDLs, then the batched REPLACE rows.
    async fn apply_dump_entry(&self, conn: &mut Conn, entry: &DumpEntry) -> Result<()> {
        debug!(
            schema = %entry.table_schema,
            table = %entry.table_name,
            rows = entry.values.len(),
            "applying dump entry"
        );

        let mut tx = conn.start_transaction(TxOpts::default()).await?;
        tx.query_drop("SET @@session.foreign_key_checks = 0").await?;

        for stmt in [
            entry.system_variables.as_str(),
            entry.sql_mode.as_str(),
            entry.db_sql.as_str(),
        ] {
            if !stmt.is_empty() {
                exec_statement(&mut tx, stmt).await?;
            }
        }
        for stmt in &entry.tb_sql {
            if !stmt.is_empty() {
                exec_statement(&mut tx, stmt).await?;
            }
        }
        for stmt in render_replace_statements(entry) {
            exec_statement(&mut tx, &stmt).await?;
        }
        tx.commit().await?;

        self.shared
            .total_rows_replayed
            .fetch_add(entry.values.len() as i64, Ordering::SeqCst);
        Ok(())
    }

    /// Handle `_full_complete`: drain outstanding dump entries, apply the
    /// foreign-key policy, union the starting GTID set and force an
    /// immediate checkpoint upload before opening the incremental phase.
    async fn finish_row_copy(
        &self,
        stat: &DumpStatResult,
        gtid_tx: &mpsc::Sender<Option<BinlogCoordinateTx>>,
    ) -> Result<()> {
        while self.shared.n_dump_entry.load(Ordering::SeqCst) != 0 {
            debug!(
                n_dump_entry = self.shared.n_dump_entry.load(Ordering::SeqCst),
                "waiting for dump entries to drain"
            );
            if self.shutdown.is_triggered() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        info!(
            total_rows = self.shared.total_rows_replayed.load(Ordering::SeqCst),
            "rows copy complete"
        );

        // do not re-assign the tracked set: the bulk-load baseline is
        // unioned into whatever incremental commits already recorded
        let baseline = GtidSet::parse(&stat.gtid_set)?;
        self.shared.union_gtid_set(&baseline);
        self.shared.update_coords(
            &stat.log_file,
            stat.log_pos,
            self.shared.serialized_gtid_set(),
        );

        // the row-copy-done fence: forced upload of the current set
        let _ = gtid_tx.send(None).await;

        let _ = self.row_copy_complete.send(true);
        self.set_stage(Stage::SlaveWaitingForWorkersToProcessQueue);
        info!(gtid = %stat.gtid_set, file = %stat.log_file, pos = stat.log_pos, "bulk load fence committed");
        Ok(())
    }

    // ========================================================================
    // Incremental pipeline
    // ========================================================================

    async fn spawn_incremental_pipeline(
        self: &Arc<Self>,
        worker_conns: Vec<Conn>,
        gtid_tx: mpsc::Sender<Option<BinlogCoordinateTx>>,
    ) -> Result<()> {
        let (incr_tx, mut incr_rx) = mpsc::channel::<Bytes>(INCR_BYTES_QUEUE_CAP);
        let (entry_tx, mut entry_rx) = mpsc::channel::<BinlogEntry>(BINLOG_ENTRY_QUEUE_CAP);
        *self.incr_bytes_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(incr_tx.clone());
        *self.entry_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(entry_tx.clone());

        // _incr_hete subscription: reassemble, enqueue, ack after enqueue
        let mut sub = self.bus.subscribe(&self.subjects.incr()).await?;
        let this = Arc::clone(self);
        self.push_task(tokio::spawn(async move {
            let mut nmm = MsgReassembler::new();
            let mut shutdown = this.listener.clone();
            loop {
                let msg = tokio::select! {
                    m = sub.recv() => match m { Some(m) => m, None => break },
                    _ = shutdown.cancelled() => break,
                };
                let finished = match nmm
                    .handle(&msg.payload)
                    .context("reassemble incremental segment")
                {
                    Ok(f) => f,
                    Err(e) => {
                        this.on_error(TaskState::Dead, e.into()).await;
                        break;
                    }
                };
                if !finished {
                    this.ack(msg.reply.as_deref()).await;
                    continue;
                }
                let bytes = nmm.bytes();
                nmm.reset();
                this.shared
                    .memory_incr
                    .fetch_add(bytes.len() as i64, Ordering::SeqCst);
                tokio::select! {
                    sent = incr_tx.send(bytes) => {
                        if sent.is_err() {
                            break;
                        }
                        this.ack(msg.reply.as_deref()).await;
                        this.set_stage(Stage::WaitingForMasterToSendEvent);
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
            debug!("incr subscription drained");
        }));

        // decode stage: bytes -> transaction entries
        let this = Arc::clone(self);
        self.push_task(tokio::spawn(async move {
            let mut shutdown = this.listener.clone();
            loop {
                let bytes = tokio::select! {
                    b = incr_rx.recv() => match b { Some(b) => b, None => break },
                    _ = shutdown.cancelled() => break,
                };
                let n = bytes.len() as i64;
                let decoded = match BinlogEntries::decode(&bytes).context("decode binlog entries")
                {
                    Ok(d) => d,
                    Err(e) => {
                        this.on_error(TaskState::Dead, e.into()).await;
                        break;
                    }
                };
                this.shared.memory_incr.fetch_sub(n, Ordering::SeqCst);
                for entry in decoded.entries {
                    if entry_tx.send(entry).await.is_err() {
                        return;
                    }
                }
            }
            debug!("incr decoder drained");
        }));

        // worker pool; FK policy follows the actual pool size, which a
        // 5.6 destination may have clamped below the configured value
        let gate = Arc::new(CommitGate::new(0));
        let use_dependency = self.config.use_mysql_dependency;
        let fk_checks_off = !(worker_conns.len() <= 1 || use_dependency);
        let mut worker_txs = Vec::with_capacity(worker_conns.len());
        for (index, mut conn) in worker_conns.into_iter().enumerate() {
            let (work_tx, mut work_rx) = mpsc::channel::<BinlogEntry>(WORKER_QUEUE_CAP);
            worker_txs.push(work_tx);
            let this = Arc::clone(self);
            let gate = gate.clone();
            let gtid_tx = gtid_tx.clone();
            self.push_task(tokio::spawn(async move {
                while let Some(entry) = work_rx.recv().await {
                    let layout_this = Arc::clone(&this);
                    let layout_for =
                        move |schema: &str, table: &str| layout_this.table_layout(schema, table);
                    match execute_entry(
                        &mut conn,
                        &entry,
                        fk_checks_off,
                        layout_for,
                        &gate,
                        use_dependency,
                    )
                    .await
                    .with_context(|| {
                        format!("apply transaction {}", entry.coordinates.gtid_string())
                    }) {
                        Ok(_rows) => {
                            let coord = entry.coordinates.clone();
                            this.shared.commit_gtid(&coord);
                            this.shared
                                .total_delta_copied
                                .fetch_add(1, Ordering::SeqCst);
                            this.shared.applied_tx_count.fetch_add(1, Ordering::SeqCst);
                            if gtid_tx.send(Some(coord)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            error!(worker = index, error = %e, "transaction apply failed");
                            this.on_error(TaskState::Dead, e.into()).await;
                            break;
                        }
                    }
                }
                let _ = conn.disconnect().await;
                debug!(worker = index, "apply worker stopped");
            }));
        }

        // dispatcher: commit-order assignment with DDL barriers
        let this = Arc::clone(self);
        let gate_for_dispatch = gate;
        self.push_task(tokio::spawn(async move {
            let mut shutdown = this.listener.clone();

            // bulk load is fully ordered ahead of incremental apply: no
            // transaction dispatches (and no checkpoint advances) until the
            // row-copy-complete fence is observed
            let mut fence = this.row_copy_complete.subscribe();
            tokio::select! {
                fenced = fence.wait_for(|done| *done) => {
                    if fenced.is_err() {
                        return;
                    }
                }
                _ = shutdown.cancelled() => return,
            }

            let mut next_worker = 0usize;
            let mut last_seq = 0i64;
            loop {
                let entry = tokio::select! {
                    e = entry_rx.recv() => match e { Some(e) => e, None => break },
                    _ = shutdown.cancelled() => break,
                };

                // GTID skip: an already-applied transaction is dropped, the
                // destination state is unchanged on re-send
                if this.shared.gtid_applied(&entry.coordinates) {
                    debug!(gtid = %entry.coordinates.gtid_string(), "skipping applied transaction");
                    gate_for_dispatch
                        .mark_committed(entry.coordinates.seq_number)
                        .await;
                    last_seq = entry.coordinates.seq_number;
                    continue;
                }

                let entry = if entry.has_ddl() {
                    // DDL is an ordering barrier: wait out in-flight
                    // transactions, then fold the catalog before any worker
                    // can observe the new shape
                    gate_for_dispatch.wait_drained(last_seq).await;
                    this.fold_ddl_events(entry)
                } else {
                    entry
                };
                let is_ddl = entry.has_ddl();
                last_seq = entry.coordinates.seq_number;

                let target = next_worker % worker_txs.len();
                next_worker = next_worker.wrapping_add(1);
                if worker_txs[target].send(entry).await.is_err() {
                    break;
                }
                if is_ddl {
                    // barrier on the far side too: nothing overlaps a DDL
                    gate_for_dispatch.wait_drained(last_seq).await;
                }
            }
            debug!("dispatcher drained");
        }));

        Ok(())
    }

    /// Fold the entry's DDL events into the schema catalog. Unparseable
    /// statements are skipped and reported; fold conflicts keep the prior
    /// CREATE. Either way the job keeps running.
    fn fold_ddl_events(&self, mut entry: BinlogEntry) -> BinlogEntry {
        let mut kept = Vec::with_capacity(entry.events.len());
        for event in entry.events.drain(..) {
            if !event.is_ddl() {
                kept.push(event);
                continue;
            }
            let default_schema = if event.current_schema.is_empty() {
                event.database_name.clone()
            } else {
                event.current_schema.clone()
            };
            match parse_ddl(&event.query) {
                Ok(DdlStatement::CreateTable(table)) => {
                    let schema = table
                        .schema
                        .clone()
                        .unwrap_or_else(|| default_schema.clone());
                    self.catalog.apply_create(&schema, table);
                    kept.push(event);
                }
                Ok(DdlStatement::AlterTable(alter)) => {
                    if let Err(conflict) = self.catalog.apply_alter(&default_schema, &alter) {
                        warn!(%conflict, query = %event.query, "schema fold conflict");
                    }
                    kept.push(event);
                }
                Ok(DdlStatement::DropTable { schema, name }) => {
                    let schema = schema.unwrap_or_else(|| default_schema.clone());
                    self.catalog.remove_table(&schema, &name);
                    kept.push(event);
                }
                Ok(DdlStatement::Other) => kept.push(event),
                Err(e) => {
                    // per-event parse failure: skip and report
                    warn!(error = %e, query = %event.query, "unparseable DDL event skipped");
                }
            }
        }
        entry.events = kept;
        entry
    }

    /// Column layout for delete rendering: the inspected descriptor wins,
    /// the schema catalog covers tables created after job start.
    fn table_layout(&self, schema: &str, table: &str) -> Option<TableLayout> {
        if let Some(cfg) = self
            .config
            .replicate_tables
            .iter()
            .find(|t| t.schema == schema && t.table == table)
        {
            if !cfg.columns.is_empty() {
                return Some(TableLayout {
                    columns: cfg.columns.iter().map(|c| c.name.clone()).collect(),
                    key_columns: cfg.use_unique_key.as_ref().map(|k| k.columns.clone()),
                });
            }
        }
        let snapshot = self.catalog.snapshot(schema, table)?;
        let key_columns = {
            let pk = snapshot.primary_key_columns();
            if pk.is_empty() {
                None
            } else {
                Some(pk)
            }
        };
        Some(TableLayout {
            columns: snapshot.columns.iter().map(|c| c.name.clone()).collect(),
            key_columns,
        })
    }

    // ========================================================================
    // Checkpointing and target stop
    // ========================================================================

    fn spawn_checkpointer(
        self: &Arc<Self>,
        gtid_rx: mpsc::Receiver<Option<BinlogCoordinateTx>>,
    ) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let outcome = run_gtid_checkpointer(
                this.subjects.job().to_string(),
                this.store.clone(),
                this.shared.clone(),
                gtid_rx,
                this.listener.clone(),
            )
            .await;
            match outcome {
                Ok(CheckpointOutcome::TargetReached) => {
                    info!(job = %this.subjects.job(), "target GTID reached");
                    this.set_stage(Stage::SlaveHasReadAllRelayLog);
                    if let Err(e) = this
                        .store
                        .put_job_status(this.subjects.job(), JobStatus::TargetGtidFinished)
                        .await
                    {
                        this.on_error(TaskState::Dead, e).await;
                        return;
                    }
                    let _ = this.wait_tx.send(ExitResult::complete()).await;
                    this.request_shutdown();
                }
                Ok(CheckpointOutcome::Shutdown) => {}
                Err(e) => this.on_error(TaskState::Dead, e).await,
            }
        });
        self.push_task(handle);
    }

    fn spawn_target_watcher(self: &Arc<Self>, gtid_tx: mpsc::Sender<Option<BinlogCoordinateTx>>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if let Err(e) = run_target_watcher(
                this.subjects.job().to_string(),
                this.store.clone(),
                this.shared.clone(),
                gtid_tx,
                this.listener.clone(),
            )
            .await
            {
                this.on_error(TaskState::Dead, e).await;
            }
        });
        self.push_task(handle);
    }

    // ========================================================================
    // Error path and lifecycle
    // ========================================================================

    async fn ack(self: &Arc<Self>, reply: Option<&str>) {
        if let Some(reply) = reply {
            if let Err(e) = self.bus.publish(reply, Bytes::new()).await {
                if !self.shutdown.is_triggered() {
                    self.on_error(TaskState::Dead, e).await;
                }
            }
        }
    }

    /// Publish the failure on the control subject, emit the job's single
    /// exit result and shut everything down. No-op once shutdown started.
    pub async fn on_error(self: &Arc<Self>, state: TaskState, err: ReplayError) {
        error!(category = ?err.category(), error = %err, "applier error");
        if self.shutdown.is_triggered() {
            return;
        }

        if matches!(state, TaskState::Restart | TaskState::Dead) {
            match ControlMsg::error(err.to_string()).encode() {
                Ok(payload) => {
                    if let Err(e) = self.bus.publish(&self.subjects.control2(), payload).await {
                        warn!(error = %e, "failed publishing control message");
                    }
                }
                Err(e) => warn!(error = %e, "failed encoding control message"),
            }
        }

        let _ = self
            .wait_tx
            .send(ExitResult {
                exit_code: state,
                signal: 0,
                oom_killed: false,
                err: Some(err),
            })
            .await;
        self.request_shutdown();
    }

    /// Trigger shutdown from inside a pipeline task. Joining happens on a
    /// fresh task so no task ever waits on its own handle.
    fn request_shutdown(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.shutdown().await });
    }

    /// Cooperative shutdown: close the bus (unblocking subscriptions), fire
    /// the signal, then join every task bounded by a timeout. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown.trigger().is_err() {
            // AlreadyShutdown: second call returns immediately
            return;
        }
        info!(job = %self.subjects.job(), "shutting down");

        self.bus.close().await;

        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for mut handle in handles {
            if tokio::time::timeout(SHUTDOWN_TASK_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                warn!("task did not stop in time, aborting");
                handle.abort();
            }
        }
        info!(job = %self.subjects.job(), "shutdown complete");
    }

    fn push_task(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    // ========================================================================
    // Stats
    // ========================================================================

    /// Point-in-time statistics for the job.
    pub async fn stats(&self) -> TaskStatistics {
        let rows_replayed = self.shared.total_rows_replayed.load(Ordering::SeqCst);
        let delta_copied = self.shared.total_delta_copied.load(Ordering::SeqCst);
        let rows_estimate = self.config.rows_estimate;
        let delta_estimate = self.config.delta_estimate;
        let coords = self.shared.coords();
        let gtid_nonempty = !coords.gtid_set.is_empty();

        let (full_len, full_cap) =
            Self::queue_depth(&self.full_bytes_tx.lock().unwrap_or_else(|e| e.into_inner()));
        let (incr_len, incr_cap) =
            Self::queue_depth(&self.incr_bytes_tx.lock().unwrap_or_else(|e| e.into_inner()));
        let (tx_len, tx_cap) =
            Self::queue_depth(&self.entry_tx.lock().unwrap_or_else(|e| e.into_inner()));

        let pct = stats::progress_pct(delta_copied, rows_replayed, delta_estimate, rows_estimate);
        let backlog = stats::backlog(
            gtid_nonempty,
            full_len,
            full_cap,
            incr_len,
            incr_cap,
            tx_len,
            tx_cap,
        );
        let eta = stats::eta(
            pct,
            self.config.elapsed_row_copy(),
            rows_estimate,
            rows_replayed,
            delta_estimate,
            delta_copied,
            gtid_nonempty,
        );

        TaskStatistics {
            exec_master_row_count: rows_replayed,
            exec_master_tx_count: delta_copied,
            read_master_row_count: rows_estimate,
            read_master_tx_count: delta_estimate,
            progress_pct: format!("{pct:.1}"),
            eta,
            backlog,
            stage: *self.stage.lock().unwrap_or_else(|e| e.into_inner()),
            current_coordinates: coords,
            memory_stat: MemoryStat {
                full: self.shared.memory_full.load(Ordering::SeqCst),
                incr: self.shared.memory_incr.load(Ordering::SeqCst),
            },
            applied_tx_count: self.shared.applied_tx_count.load(Ordering::SeqCst),
            timestamp: TaskStatistics::now_timestamp(),
        }
    }

    fn queue_depth<T>(tx: &Option<mpsc::Sender<T>>) -> (usize, usize) {
        match tx {
            Some(tx) => {
                let cap = tx.max_capacity();
                (cap - tx.capacity(), cap)
            }
            None => (0, 0),
        }
    }
}

/// Grants the applier needs on the destination: ALL, SUPER, or the full
/// DDL+DML statement set on *.*.
fn dest_grants_sufficient<'a>(grants: impl IntoIterator<Item = &'a str>) -> bool {
    const STATEMENT_SET: [&str; 9] = [
        "ALTER", "CREATE", "DELETE", "DROP", "INDEX", "INSERT", "SELECT", "TRIGGER", "UPDATE",
    ];
    for grant in grants {
        if grant.contains("GRANT ALL PRIVILEGES ON") {
            return true;
        }
        if grant.contains("SUPER") && grant.contains(" ON *.*") {
            return true;
        }
        if STATEMENT_SET.iter().all(|p| grant.contains(p)) && grant.contains(" ON ") {
            return true;
        }
    }
    false
}
