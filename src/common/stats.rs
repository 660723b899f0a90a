//! Progress and statistics reporting
//!
//! Counters feeding the report are plain atomics owned by the applier; this
//! module holds the report model plus the pure arithmetic (progress
//! percentage, backlog, ETA) so the formulas stay testable without a
//! running pipeline. Passwords never appear anywhere in the report.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Replication stage, mirroring the slave-status vocabulary operators
/// already watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    WaitingForMasterToSendEvent,
    SlaveWaitingForWorkersToProcessQueue,
    SlaveHasReadAllRelayLog,
}

/// Binlog coordinates currently tracked by the applier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentCoordinates {
    pub file: String,
    pub position: u64,
    pub gtid_set: String,
}

/// Queue byte counters, split by phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStat {
    /// Bytes buffered for the bulk-load path
    pub full: i64,
    /// Bytes buffered for the incremental path
    pub incr: i64,
}

/// One point-in-time statistics report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatistics {
    /// Total rows replayed onto the destination
    pub exec_master_row_count: i64,
    /// Total transactions applied
    pub exec_master_tx_count: i64,
    /// Source-side row estimate
    pub read_master_row_count: i64,
    /// Source-side transaction estimate
    pub read_master_tx_count: i64,
    pub progress_pct: String,
    pub eta: String,
    pub backlog: String,
    pub stage: Stage,
    pub current_coordinates: CurrentCoordinates,
    pub memory_stat: MemoryStat,
    pub applied_tx_count: u32,
    /// Report time, UTC nanoseconds
    pub timestamp: i64,
}

impl TaskStatistics {
    pub fn now_timestamp() -> i64 {
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    }
}

/// `100 * (delta_copied + rows_replayed) / (delta_estimate + rows_estimate)`;
/// zero when there is no estimate at all.
pub fn progress_pct(
    delta_copied: i64,
    rows_replayed: i64,
    delta_estimate: i64,
    rows_estimate: i64,
) -> f64 {
    if rows_estimate == 0 && delta_estimate == 0 {
        return 0.0;
    }
    100.0 * (delta_copied + rows_replayed) as f64 / (delta_estimate + rows_estimate) as f64
}

/// Backlog of the phase the job is in. The transition from bulk load to
/// incremental is observable as a non-empty tracked GTID.
pub fn backlog(
    gtid_nonempty: bool,
    full_len: usize,
    full_cap: usize,
    incr_msg_len: usize,
    incr_msg_cap: usize,
    tx_len: usize,
    tx_cap: usize,
) -> String {
    if gtid_nonempty {
        format!("{}/{}", incr_msg_len + tx_len, incr_msg_cap + tx_cap)
    } else {
        format!("{}/{}", full_len, full_cap)
    }
}

/// ETA extrapolated from elapsed copy time and the phase estimate.
///
/// `0s` at or past 100%, `N/A` under 1% (not enough signal to extrapolate).
pub fn eta(
    pct: f64,
    elapsed: Duration,
    rows_estimate: i64,
    rows_replayed: i64,
    delta_estimate: i64,
    delta_copied: i64,
    gtid_nonempty: bool,
) -> String {
    if pct >= 100.0 {
        return "0s".to_string();
    }
    if pct < 1.0 {
        return "N/A".to_string();
    }
    let elapsed_secs = elapsed.as_secs_f64();
    let total_expected = if gtid_nonempty {
        if delta_copied <= 0 {
            return "N/A".to_string();
        }
        elapsed_secs * delta_estimate as f64 / delta_copied as f64
    } else {
        if rows_replayed <= 0 {
            return "N/A".to_string();
        }
        elapsed_secs * rows_estimate as f64 / rows_replayed as f64
    };
    let eta_secs = total_expected - elapsed_secs;
    if eta_secs >= 0.0 {
        prettify_duration(Duration::from_secs_f64(eta_secs))
    } else {
        "0s".to_string()
    }
}

/// Render a duration the way operators read replication lag: `2h3m`,
/// `45s`, `1m2s`.
pub fn prettify_duration(d: Duration) -> String {
    let total = d.as_secs();
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    match (h, m, s) {
        (0, 0, s) => format!("{s}s"),
        (0, m, 0) => format!("{m}m"),
        (0, m, s) => format!("{m}m{s}s"),
        (h, 0, 0) => format!("{h}h"),
        (h, m, _) => format!("{h}h{m}m"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_pct() {
        assert_eq!(progress_pct(0, 0, 0, 0), 0.0);
        assert_eq!(progress_pct(0, 50, 0, 100), 50.0);
        assert_eq!(progress_pct(25, 25, 50, 50), 50.0);
        assert_eq!(progress_pct(100, 100, 100, 100), 100.0);
    }

    #[test]
    fn test_backlog_switches_on_gtid() {
        // bulk-load phase: full queue reported
        assert_eq!(backlog(false, 3, 16, 9, 16, 9, 64), "3/16");
        // incremental phase: both incremental queues summed
        assert_eq!(backlog(true, 3, 16, 2, 16, 5, 64), "7/80");
    }

    #[test]
    fn test_eta_bounds() {
        let elapsed = Duration::from_secs(60);
        assert_eq!(eta(100.0, elapsed, 100, 100, 0, 0, false), "0s");
        assert_eq!(eta(120.0, elapsed, 100, 100, 0, 0, false), "0s");
        assert_eq!(eta(0.5, elapsed, 1000, 5, 0, 0, false), "N/A");
    }

    #[test]
    fn test_eta_extrapolates_rows() {
        // 25% of rows in 60s => 180s to go
        let s = eta(25.0, Duration::from_secs(60), 100, 25, 0, 0, false);
        assert_eq!(s, "3m");
    }

    #[test]
    fn test_eta_extrapolates_delta_once_gtid_tracked() {
        // half the delta applied in 30s => 30s to go
        let s = eta(50.0, Duration::from_secs(30), 0, 0, 100, 50, true);
        assert_eq!(s, "30s");
    }

    #[test]
    fn test_prettify_duration() {
        assert_eq!(prettify_duration(Duration::from_secs(0)), "0s");
        assert_eq!(prettify_duration(Duration::from_secs(45)), "45s");
        assert_eq!(prettify_duration(Duration::from_secs(62)), "1m2s");
        assert_eq!(prettify_duration(Duration::from_secs(120)), "2m");
        assert_eq!(prettify_duration(Duration::from_secs(7380)), "2h3m");
    }
}
