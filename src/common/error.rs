//! Error types for the replay engine
//!
//! One crate-wide error enum with per-subsystem variants and a coarse
//! category accessor used by the on-error path to decide whether a task
//! must die or the offending event can be skipped.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories, mirroring the failure taxonomy of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Source/job validation errors (privileges, GTID mode, binlog config)
    Configuration,
    /// SQL parse errors (per-event, skippable)
    Parse,
    /// Wire decode errors (envelope, GTID strings) - protocol drift
    Decode,
    /// Destination apply errors
    Apply,
    /// Message bus errors
    Bus,
    /// Lifecycle errors
    Lifecycle,
    /// Other/unknown errors
    Other,
}

/// Replay engine errors
#[derive(Error, Debug)]
pub enum ReplayError {
    /// User lacks the grants required to read the binlog stream
    #[error("insufficient privileges: {0}")]
    InsufficientPrivileges(String),

    /// Source server runs with @@GTID_MODE != ON
    #[error("GTID mode disabled: {0}")]
    GtidDisabled(String),

    /// Binary logging off or binlog_format != ROW
    #[error("bad binlog config: {0}")]
    BadBinlogConfig(String),

    /// Requested table does not exist on the source
    #[error("table {schema}.{table} not found")]
    TableMissing { schema: String, table: String },

    /// Requested table is a VIEW, not a base table
    #[error("{schema}.{table} is a VIEW, not a real table")]
    TableIsView { schema: String, table: String },

    /// SQL could not be parsed; fatal for the offending event only
    #[error("SQL parse error: {0}")]
    SqlParse(String),

    /// Malformed segment envelope on the bus
    #[error("bad envelope: {0}")]
    BadEnvelope(String),

    /// Malformed GTID set string
    #[error("bad GTID string: {0}")]
    BadGtid(String),

    /// Destination database error
    #[error("MySQL error: {0}")]
    Db(#[from] mysql_async::Error),

    /// Bus publish failed
    #[error("publish failed: {0}")]
    PublishFailed(String),

    /// Segment acknowledgement timed out; the extractor must resend
    #[error("ack timeout: {0}")]
    AckTimeout(String),

    /// Second shutdown of an already shut down job
    #[error("already shut down")]
    AlreadyShutdown,

    /// Configuration error (missing/invalid option)
    #[error("configuration error: {0}")]
    Config(String),

    /// Payload decode error
    #[error("decode error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid state transition
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl ReplayError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn sql_parse(msg: impl Into<String>) -> Self {
        Self::SqlParse(msg.into())
    }

    pub fn bad_envelope(msg: impl Into<String>) -> Self {
        Self::BadEnvelope(msg.into())
    }

    pub fn bad_gtid(msg: impl Into<String>) -> Self {
        Self::BadGtid(msg.into())
    }

    pub fn publish_failed(msg: impl Into<String>) -> Self {
        Self::PublishFailed(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Coarse category for the on-error path and logs.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InsufficientPrivileges(_)
            | Self::GtidDisabled(_)
            | Self::BadBinlogConfig(_)
            | Self::TableMissing { .. }
            | Self::TableIsView { .. }
            | Self::Config(_) => ErrorCategory::Configuration,
            Self::SqlParse(_) => ErrorCategory::Parse,
            Self::BadEnvelope(_) | Self::BadGtid(_) | Self::Json(_) => ErrorCategory::Decode,
            Self::Db(_) => ErrorCategory::Apply,
            Self::PublishFailed(_) | Self::AckTimeout(_) => ErrorCategory::Bus,
            Self::AlreadyShutdown | Self::InvalidState(_) => ErrorCategory::Lifecycle,
            Self::Other(_) => ErrorCategory::Other,
        }
    }

    /// Whether this error must take the whole job down.
    ///
    /// Parse errors skip the offending event; a second shutdown is a no-op.
    /// Everything else is fatal and flows through the on-error path.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::SqlParse(_) | Self::AlreadyShutdown)
    }
}

/// Collapse a task-boundary context chain into the crate error.
///
/// Classification (ignore predicates, per-event skip) happens before a
/// failure is wrapped with context, so the surviving value only needs the
/// rendered chain for the control message and exit result.
impl From<anyhow::Error> for ReplayError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(format!("{err:#}"))
    }
}

/// Result type for replay operations
pub type Result<T> = std::result::Result<T, ReplayError>;

/// Terminal state of a job, surfaced to the process supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Complete,
    Restart,
    Dead,
}

/// Final result sent exactly once on the job's wait channel.
#[derive(Debug)]
pub struct ExitResult {
    pub exit_code: TaskState,
    pub signal: i32,
    pub oom_killed: bool,
    pub err: Option<ReplayError>,
}

impl ExitResult {
    pub fn complete() -> Self {
        Self {
            exit_code: TaskState::Complete,
            signal: 0,
            oom_killed: false,
            err: None,
        }
    }

    pub fn dead(err: ReplayError) -> Self {
        Self {
            exit_code: TaskState::Dead,
            signal: 0,
            oom_killed: false,
            err: Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ReplayError::GtidDisabled("OFF".to_string());
        assert!(err.to_string().contains("GTID mode disabled"));

        let err = ReplayError::TableIsView {
            schema: "s".into(),
            table: "v".into(),
        };
        assert!(err.to_string().contains("s.v is a VIEW"));
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            ReplayError::GtidDisabled("x".into()).category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            ReplayError::sql_parse("x").category(),
            ErrorCategory::Parse
        );
        assert_eq!(
            ReplayError::bad_envelope("x").category(),
            ErrorCategory::Decode
        );
        assert_eq!(
            ReplayError::publish_failed("x").category(),
            ErrorCategory::Bus
        );
        assert_eq!(
            ReplayError::AlreadyShutdown.category(),
            ErrorCategory::Lifecycle
        );
    }

    #[test]
    fn test_fatality() {
        assert!(!ReplayError::sql_parse("bad ddl").is_fatal());
        assert!(!ReplayError::AlreadyShutdown.is_fatal());
        assert!(ReplayError::bad_envelope("empty").is_fatal());
        assert!(ReplayError::AckTimeout("5s".into()).is_fatal());
        assert!(ReplayError::config("missing host").is_fatal());
    }

    #[test]
    fn test_context_chain_collapses_at_boundary() {
        use anyhow::Context;

        let inner: Result<()> = Err(ReplayError::bad_envelope("empty segment"));
        let wrapped = inner.context("reassemble full segment").unwrap_err();
        let err = ReplayError::from(wrapped);
        // the rendered chain keeps both the context and the root cause
        assert!(err.to_string().contains("reassemble full segment"));
        assert!(err.to_string().contains("empty segment"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_exit_result() {
        let r = ExitResult::complete();
        assert_eq!(r.exit_code, TaskState::Complete);
        assert!(r.err.is_none());

        let r = ExitResult::dead(ReplayError::other("boom"));
        assert_eq!(r.exit_code, TaskState::Dead);
        assert!(r.err.is_some());
    }
}
