//! MySQL-specific subsystems
//!
//! - [`Inspector`] - source environment validation and replication-key
//!   discovery
//! - [`Applier`] - the destination-side apply pipeline
//! - [`dump`] - bulk-load entries and REPLACE batching
//! - [`incremental`] - transaction entries, commit gating, replay
//! - [`checkpoint`] - GTID checkpoint upload and target-GTID stop
//! - [`discovery`] - schema listing for the admin surface
//! - [`sqlutil`] - escaping and server-error classification

pub mod applier;
pub mod checkpoint;
pub mod discovery;
pub mod dump;
pub mod incremental;
pub mod inspector;
pub mod sqlutil;

pub use applier::{Applier, ApplierShared};
pub use checkpoint::{run_gtid_checkpointer, run_target_watcher, CheckpointOutcome};
pub use discovery::{list_schemas, ListSchemasResponse, SchemaItem, TableItem};
pub use dump::{render_replace_statements, DumpEntry, DumpStatResult};
pub use incremental::{
    execute_entry, render_dml, BinlogEntries, BinlogEntry, CommitGate, DataEvent, DmlKind,
    TableLayout,
};
pub use inspector::{select_unique_key, GrantSummary, Inspector, KeyRejection};
