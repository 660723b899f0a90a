//! Database-agnostic plumbing shared by the pipeline
//!
//! - [`ReplayError`] / [`Result`] - crate-wide error taxonomy
//! - [`ConnectionConfig`] / [`JobConfig`] / [`TableConfig`] - descriptors
//! - [`GtidSet`] / [`BinlogCoordinateTx`] - transaction identity
//! - [`MsgReassembler`] - segmented bus payload reassembly
//! - [`Bus`] / [`InMemoryBus`] - message-bus interface (transport external)
//! - [`JobStore`] / [`MemoryJobStore`] - coordination-store interface
//! - [`ShutdownSignal`] - cooperative cancellation
//! - [`TaskStatistics`] - progress reporting

pub mod bus;
pub mod config;
pub mod error;
pub mod gtid;
pub mod reassembler;
pub mod shutdown;
pub mod stats;
pub mod store;

pub use bus::{Bus, BusMessage, ControlMsg, ControlMsgType, InMemoryBus, SharedBus, Subjects};
pub use config::{
    ColumnInfo, ConnectionConfig, JobConfig, RowImage, TableConfig, UniqueKey, DEFAULT_CHARSET,
};
pub use error::{ErrorCategory, ExitResult, ReplayError, Result, TaskState};
pub use gtid::{BinlogCoordinateTx, GtidSet, Interval, UuidSet};
pub use reassembler::{split_segments, MsgReassembler, SEGMENT_FINAL, SEGMENT_MORE};
pub use shutdown::{ShutdownListener, ShutdownSignal};
pub use stats::{CurrentCoordinates, MemoryStat, Stage, TaskStatistics};
pub use store::{FileJobStore, JobStatus, JobStore, MemoryJobStore, SharedJobStore};
