//! GTID set tracking
//!
//! A [`GtidSet`] maps source-server UUIDs to sets of executed transaction-id
//! intervals, in the MySQL text form
//! `3E11FA47-71CA-11E1-9E33-C80AA9429562:1-5:8`. The applier's in-memory set
//! only ever grows during a run: incoming sets are unioned in, never
//! re-assigned.

use crate::common::error::{ReplayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// An inclusive interval of transaction ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Interval {
    pub start: u64,
    pub end: u64,
}

impl Interval {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn point(txid: u64) -> Self {
        Self {
            start: txid,
            end: txid,
        }
    }

    fn contains(&self, other: &Interval) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// The executed intervals of a single source server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UuidSet {
    pub uuid: Uuid,
    /// Sorted, coalesced, non-overlapping
    pub intervals: Vec<Interval>,
}

impl UuidSet {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            intervals: Vec::new(),
        }
    }

    /// Insert an interval, keeping the list sorted and coalesced.
    pub fn add(&mut self, iv: Interval) {
        self.intervals.push(iv);
        self.normalize();
    }

    fn normalize(&mut self) {
        self.intervals.sort();
        let mut merged: Vec<Interval> = Vec::with_capacity(self.intervals.len());
        for iv in self.intervals.drain(..) {
            match merged.last_mut() {
                // adjacent intervals coalesce: 1-3 + 4-5 => 1-5
                Some(last) if iv.start <= last.end.saturating_add(1) => {
                    last.end = last.end.max(iv.end);
                }
                _ => merged.push(iv),
            }
        }
        self.intervals = merged;
    }

    pub fn contains(&self, other: &UuidSet) -> bool {
        other
            .intervals
            .iter()
            .all(|iv| self.intervals.iter().any(|own| own.contains(iv)))
    }
}

impl fmt::Display for UuidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uuid)?;
        for iv in &self.intervals {
            write!(f, ":{}", iv)?;
        }
        Ok(())
    }
}

/// A GTID set: `uuid -> executed intervals`, for any number of servers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidSet {
    sets: BTreeMap<Uuid, UuidSet>,
}

impl GtidSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the MySQL text form. The empty string is the empty set.
    pub fn parse(s: &str) -> Result<Self> {
        let mut out = Self::new();
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(out);
        }
        for part in trimmed.split(',') {
            let part = part.trim();
            let mut pieces = part.split(':');
            let uuid_str = pieces
                .next()
                .ok_or_else(|| ReplayError::bad_gtid(part.to_string()))?;
            let uuid = Uuid::parse_str(uuid_str)
                .map_err(|e| ReplayError::bad_gtid(format!("{part}: {e}")))?;
            let entry = out.sets.entry(uuid).or_insert_with(|| UuidSet::new(uuid));
            let mut saw_interval = false;
            for ivs in pieces {
                saw_interval = true;
                let iv = match ivs.split_once('-') {
                    Some((a, b)) => {
                        let start = a
                            .parse()
                            .map_err(|_| ReplayError::bad_gtid(part.to_string()))?;
                        let end = b
                            .parse()
                            .map_err(|_| ReplayError::bad_gtid(part.to_string()))?;
                        if start == 0 || end < start {
                            return Err(ReplayError::bad_gtid(part.to_string()));
                        }
                        Interval::new(start, end)
                    }
                    None => {
                        let txid: u64 = ivs
                            .parse()
                            .map_err(|_| ReplayError::bad_gtid(part.to_string()))?;
                        if txid == 0 {
                            return Err(ReplayError::bad_gtid(part.to_string()));
                        }
                        Interval::point(txid)
                    }
                };
                entry.add(iv);
            }
            if !saw_interval {
                return Err(ReplayError::bad_gtid(format!("{part}: no intervals")));
            }
        }
        Ok(out)
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Record a single committed transaction.
    pub fn add_gtid(&mut self, uuid: Uuid, txid: u64) {
        self.sets
            .entry(uuid)
            .or_insert_with(|| UuidSet::new(uuid))
            .add(Interval::point(txid));
    }

    /// Union another server's set in. Existing intervals are kept; the set
    /// never shrinks.
    pub fn add_set(&mut self, other: &UuidSet) {
        let entry = self
            .sets
            .entry(other.uuid)
            .or_insert_with(|| UuidSet::new(other.uuid));
        for iv in &other.intervals {
            entry.add(*iv);
        }
    }

    /// Union a whole set in.
    pub fn union(&mut self, other: &GtidSet) {
        for set in other.sets.values() {
            self.add_set(set);
        }
    }

    /// Superset test: does `self` cover every transaction in `other`?
    pub fn contains(&self, other: &GtidSet) -> bool {
        other.sets.values().all(|their| {
            self.sets
                .get(&their.uuid)
                .is_some_and(|own| own.contains(their))
        })
    }

    /// Has this single transaction already been applied?
    pub fn contains_gtid(&self, uuid: Uuid, txid: u64) -> bool {
        self.sets.get(&uuid).is_some_and(|own| {
            own.intervals
                .iter()
                .any(|iv| iv.start <= txid && txid <= iv.end)
        })
    }

    pub fn server_count(&self) -> usize {
        self.sets.len()
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for set in self.sets.values() {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{}", set)?;
        }
        Ok(())
    }
}

/// A source checkpoint: the binlog coordinates and GTID of one committed
/// transaction, plus the group-commit dependency pair used for parallel
/// apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogCoordinateTx {
    pub log_file: String,
    pub log_pos: u64,
    /// Source server UUID
    pub sid: Uuid,
    /// Transaction id within the server's sequence
    pub gno: u64,
    pub seq_number: i64,
    pub last_committed: i64,
}

impl BinlogCoordinateTx {
    pub fn gtid_string(&self) -> String {
        format!("{}:{}", self.sid, self.gno)
    }
}
