//! Incremental replay
//!
//! Decoded binlog transactions ([`BinlogEntry`]) are dispatched by
//! transaction to a pool of destination sessions. Within one entry all
//! operations execute on a single worker in source order; across entries
//! the [`CommitGate`] serializes commits in entry order unless the job is
//! configured to trust the binlog group-commit dependency pair, in which
//! case independent transactions may commit out of order. Either way the
//! GTID set union stays exact.

use crate::common::error::{ReplayError, Result};
use crate::common::gtid::BinlogCoordinateTx;
use crate::mysql::sqlutil::{self, qualified_name, render_cell};
use bytes::Bytes;
use mysql_async::prelude::*;
use mysql_async::{Conn, TxOpts};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

/// Row operation kind carried by a data event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DmlKind {
    Insert,
    Update,
    Delete,
}

/// One replicated operation inside a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEvent {
    /// Schema in effect on the source session
    pub current_schema: String,
    pub database_name: String,
    pub table_name: String,
    /// `None` marks a statement event (DDL)
    pub dml: Option<DmlKind>,
    /// Statement text for DDL events
    pub query: String,
    /// Before-image cells for UPDATE/DELETE
    pub where_values: Option<Vec<Option<String>>>,
    /// After-image cells for INSERT/UPDATE
    pub new_values: Option<Vec<Option<String>>>,
}

impl DataEvent {
    pub fn is_ddl(&self) -> bool {
        self.dml.is_none()
    }

    pub fn ddl(schema: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            current_schema: schema.into(),
            query: query.into(),
            ..Default::default()
        }
    }
}

/// One source transaction: coordinates plus its operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogEntry {
    pub coordinates: BinlogCoordinateTx,
    pub events: Vec<DataEvent>,
}

impl BinlogEntry {
    pub fn has_ddl(&self) -> bool {
        self.events.iter().any(DataEvent::is_ddl)
    }
}

/// The wire unit on the incremental subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogEntries {
    pub entries: Vec<BinlogEntry>,
}

impl BinlogEntries {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

// ============================================================================
// DML rendering
// ============================================================================

/// Render one row operation as destination SQL.
///
/// INSERT and UPDATE render as `REPLACE INTO` so replaying an overlap is
/// idempotent. DELETE matches on the chosen replication key when the table
/// has one, else on the whole before-image (the slow path the inspector
/// warns about).
pub fn render_dml(
    event: &DataEvent,
    columns: &[String],
    key_columns: Option<&[String]>,
) -> Result<String> {
    let target = qualified_name(&event.database_name, &event.table_name);
    match event.dml {
        Some(DmlKind::Insert) | Some(DmlKind::Update) => {
            let values = event.new_values.as_ref().ok_or_else(|| {
                ReplayError::invalid_state("row event without an after-image")
            })?;
            let rendered: Vec<String> =
                values.iter().map(|c| render_cell(c.as_deref())).collect();
            Ok(format!(
                "replace into {} values ({})",
                target,
                rendered.join(",")
            ))
        }
        Some(DmlKind::Delete) => {
            let values = event.where_values.as_ref().ok_or_else(|| {
                ReplayError::invalid_state("delete event without a before-image")
            })?;
            if columns.len() != values.len() {
                return Err(ReplayError::invalid_state(format!(
                    "column list ({}) does not match before-image width ({})",
                    columns.len(),
                    values.len()
                )));
            }
            let use_cols: Vec<usize> = match key_columns {
                Some(keys) => keys
                    .iter()
                    .map(|k| {
                        columns
                            .iter()
                            .position(|c| c.eq_ignore_ascii_case(k))
                            .ok_or_else(|| {
                                ReplayError::invalid_state(format!(
                                    "key column {k} missing from column list"
                                ))
                            })
                    })
                    .collect::<Result<_>>()?,
                None => (0..columns.len()).collect(),
            };
            let mut clauses = Vec::with_capacity(use_cols.len());
            for idx in use_cols {
                let col = sqlutil::escape_name(&columns[idx]);
                match &values[idx] {
                    Some(v) => clauses.push(format!("{} = '{}'", col, sqlutil::escape_value(v))),
                    None => clauses.push(format!("{} IS NULL", col)),
                }
            }
            Ok(format!(
                "delete from {} where {} limit 1",
                target,
                clauses.join(" and ")
            ))
        }
        None => Err(ReplayError::invalid_state(
            "statement event has no row rendering",
        )),
    }
}

// ============================================================================
// Commit ordering
// ============================================================================

struct GateState {
    /// Highest seq through which every transaction has committed
    watermark: i64,
    /// Committed seqs above the watermark
    done: BTreeSet<i64>,
}

/// Serializes transaction commits across the worker pool.
///
/// Strict mode releases a transaction only when its immediate predecessor
/// has committed. Dependency mode releases it once the binlog's
/// `last_committed` watermark is reached, letting independent transactions
/// commit out of order.
pub struct CommitGate {
    state: Mutex<GateState>,
    notify: Notify,
}

impl CommitGate {
    /// `start` is the seq number just before the first expected entry.
    pub fn new(start: i64) -> Self {
        Self {
            state: Mutex::new(GateState {
                watermark: start,
                done: BTreeSet::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Block until this transaction is allowed to commit.
    pub async fn wait_commit_turn(&self, seq: i64, last_committed: i64, use_dependency: bool) {
        let threshold = if use_dependency {
            last_committed
        } else {
            seq - 1
        };
        loop {
            let notified = self.notify.notified();
            {
                let state = self.state.lock().await;
                if state.watermark >= threshold {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Record a commit and release any waiters it unblocks.
    pub async fn mark_committed(&self, seq: i64) {
        let mut state = self.state.lock().await;
        state.done.insert(seq);
        loop {
            let next = state.watermark + 1;
            if !state.done.remove(&next) {
                break;
            }
            state.watermark += 1;
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// Block until every transaction through `seq` has committed. DDL
    /// entries use this as their ordering barrier.
    pub async fn wait_drained(&self, seq: i64) {
        loop {
            let notified = self.notify.notified();
            {
                let state = self.state.lock().await;
                if state.watermark >= seq {
                    return;
                }
            }
            notified.await;
        }
    }

    pub async fn watermark(&self) -> i64 {
        self.state.lock().await.watermark
    }
}

// ============================================================================
// Transaction execution
// ============================================================================

/// Execute one statement inside the open transaction, applying the
/// ignore predicates before surfacing an error.
pub(crate) async fn exec_statement<Q>(tx: &mut Q, query: &str) -> Result<()>
where
    Q: Queryable,
{
    match tx.query_drop(query).await {
        Ok(()) => Ok(()),
        Err(e) => {
            if sqlutil::ignore_error(&e) {
                Ok(())
            } else if sqlutil::ignore_exists_error(&e) {
                warn!(error = %e, "ignoring existence conflict");
                Ok(())
            } else {
                Err(e.into())
            }
        }
    }
}

/// Column layout used to render deletes for one table.
pub struct TableLayout {
    /// Ordered column names
    pub columns: Vec<String>,
    /// Chosen replication key columns, when the table has one
    pub key_columns: Option<Vec<String>>,
}

/// Execute one binlog transaction on a worker connection.
///
/// Operations run in source order inside a single destination transaction.
/// The commit waits its turn at the gate, and a successful commit is
/// recorded there; the caller performs the post-commit GTID union.
/// Returns the number of row operations applied.
pub async fn execute_entry<F>(
    conn: &mut Conn,
    entry: &BinlogEntry,
    fk_checks_off: bool,
    layout_for: F,
    gate: &CommitGate,
    use_dependency: bool,
) -> Result<u64>
where
    F: Fn(&str, &str) -> Option<TableLayout>,
{
    let mut tx = conn.start_transaction(TxOpts::default()).await?;
    if fk_checks_off {
        tx.query_drop("SET @@session.foreign_key_checks = 0").await?;
    }

    let mut rows: u64 = 0;
    for event in &entry.events {
        if event.is_ddl() {
            if !event.current_schema.is_empty() {
                exec_statement(&mut tx, &format!("USE {}", sqlutil::escape_name(&event.current_schema)))
                    .await?;
            }
            debug!(query = %truncate_for_log(&event.query), "applying statement event");
            exec_statement(&mut tx, &event.query).await?;
            continue;
        }

        let layout = layout_for(&event.database_name, &event.table_name);
        let (columns, key_columns) = match &layout {
            Some(l) => (l.columns.as_slice(), l.key_columns.as_deref()),
            None => (&[] as &[String], None),
        };
        let sql = render_dml(event, columns, key_columns)?;
        exec_statement(&mut tx, &sql).await?;
        rows += 1;
    }

    let coords = &entry.coordinates;
    gate.wait_commit_turn(coords.seq_number, coords.last_committed, use_dependency)
        .await;
    tx.commit().await?;
    gate.mark_committed(coords.seq_number).await;
    Ok(rows)
}

/// Clip statement text for logs without copying huge DDL around.
fn truncate_for_log(query: &str) -> &str {
    let limit = 256;
    if query.len() <= limit {
        query
    } else {
        let mut end = limit;
        while !query.is_char_boundary(end) {
            end -= 1;
        }
        &query[..end]
    }
}
