//! Connection and job descriptors
//!
//! # Security Note
//!
//! `ConnectionConfig` implements a custom Debug that redacts the password
//! field to prevent accidental leakage to logs, and the password is never
//! rendered into progress or stats output.

use crate::common::error::{ReplayError, Result};
use mysql_async::{Opts, OptsBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

/// Default charset applied when a connection descriptor omits one.
pub const DEFAULT_CHARSET: &str = "utf8";

/// MySQL connection descriptor.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub charset: String,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("charset", &self.charset)
            .finish()
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: String::new(),
            charset: DEFAULT_CHARSET.to_string(),
        }
    }
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            ..Default::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = charset.into();
        self
    }

    /// `host:port`, safe for logs.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Build connection options for the configured endpoint.
    ///
    /// The charset is applied as a session init statement rather than a URL
    /// parameter so credentials never pass through a printable DSN.
    pub fn opts(&self) -> Opts {
        let builder = OptsBuilder::default()
            .ip_or_hostname(self.host.clone())
            .tcp_port(self.port)
            .user(Some(self.user.clone()))
            .pass(Some(self.password.clone()))
            .prefer_socket(false)
            .init(vec![format!("SET NAMES {}", self.charset)]);
        Opts::from(builder)
    }

    /// Decode a descriptor from a loose string map.
    ///
    /// Recognized options, applied as an explicit enumerated mapping:
    ///
    /// | name | type | default | required |
    /// |---|---|---|---|
    /// | `host` | string | - | yes |
    /// | `port` | u16 | - | yes |
    /// | `user` | string | - | yes |
    /// | `password` | secret | `""` | no |
    /// | `charset` | string | `utf8` | no |
    ///
    /// Unknown keys are rejected so typos surface at decode time instead of
    /// silently falling back to defaults.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        for key in map.keys() {
            if !matches!(key.as_str(), "host" | "port" | "user" | "password" | "charset") {
                return Err(ReplayError::config(format!(
                    "unknown connection option: {key}"
                )));
            }
        }

        let required = |name: &str| -> Result<String> {
            map.get(name)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| ReplayError::config(format!("missing connection option: {name}")))
        };

        let port: u16 = required("port")?
            .parse()
            .map_err(|e| ReplayError::config(format!("invalid port: {e}")))?;

        let charset = match map.get("charset") {
            Some(c) if !c.is_empty() => c.clone(),
            _ => DEFAULT_CHARSET.to_string(),
        };

        Ok(Self {
            host: required("host")?,
            port,
            user: required("user")?,
            password: map.get("password").cloned().unwrap_or_default(),
            charset,
        })
    }
}

/// Row image mode of the source binlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum RowImage {
    #[default]
    Full,
    Minimal,
}

impl RowImage {
    /// Parse the value of `@@binlog_row_image`, defaulting to FULL for
    /// servers that predate the variable.
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("minimal") {
            Self::Minimal
        } else {
            Self::Full
        }
    }
}

/// One column of a replicated table, in source declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    /// Lowercased INFORMATION_SCHEMA DATA_TYPE tag (`int`, `float`, `json`, ...)
    pub data_type: String,
    pub nullable: bool,
    pub charset: Option<String>,
}

impl ColumnInfo {
    pub fn is_float(&self) -> bool {
        self.data_type == "float"
    }

    pub fn is_json(&self) -> bool {
        self.data_type == "json"
    }
}

/// A unique-key candidate discovered from INFORMATION_SCHEMA.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueKey {
    pub name: String,
    /// Column names in SEQ_IN_INDEX order
    pub columns: Vec<String>,
    pub has_nullable: bool,
    pub is_auto_increment: bool,
    /// Per-column chunking cursor, string-serialized
    pub last_max_vals: Vec<Option<String>>,
}

impl UniqueKey {
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        let n = columns.len();
        Self {
            name: name.into(),
            columns,
            has_nullable: false,
            is_auto_increment: false,
            last_max_vals: vec![None; n],
        }
    }

    pub fn is_primary(&self) -> bool {
        self.name == "PRIMARY"
    }
}

impl std::fmt::Display for UniqueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name, self.columns.join(","))
    }
}

/// Per-table replication descriptor.
///
/// Created at job init; the column list and chosen key are filled in by the
/// inspector, and the chosen key stays sticky for the lifetime of the job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableConfig {
    pub schema: String,
    pub table: String,
    /// Ordered column list; ordinals match the source's declared order
    pub columns: Vec<ColumnInfo>,
    pub row_image: RowImage,
    /// Optional row-filter predicate over the column list
    pub where_filter: Option<String>,
    /// Chosen replication key; None means whole-row matching (slow path)
    pub use_unique_key: Option<UniqueKey>,
}

impl TableConfig {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            ..Default::default()
        }
    }
}

/// Job-level tuning surface for the applier.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub connection: ConnectionConfig,
    /// Destination sessions in the worker pool
    pub parallel_workers: usize,
    /// Gate commits on the binlog group-commit dependency pair instead of
    /// strict entry order
    pub use_mysql_dependency: bool,
    pub skip_privilege_check: bool,
    /// Whether the job has a bulk-load phase before incremental replay
    pub enable_full_copy: bool,
    pub replicate_tables: Vec<TableConfig>,
    pub rows_estimate: i64,
    pub delta_estimate: i64,
    row_copy_start: Option<Instant>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            parallel_workers: 4,
            use_mysql_dependency: false,
            skip_privilege_check: false,
            enable_full_copy: true,
            replicate_tables: Vec::new(),
            rows_estimate: 0,
            delta_estimate: 0,
            row_copy_start: None,
        }
    }
}

impl JobConfig {
    pub fn new(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            ..Default::default()
        }
    }

    pub fn mark_row_copy_start(&mut self) {
        if self.row_copy_start.is_none() {
            self.row_copy_start = Some(Instant::now());
        }
    }

    pub fn elapsed_row_copy(&self) -> std::time::Duration {
        self.row_copy_start
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    /// FK checks are re-enabled after bulk load only when apply order is
    /// externally consistent: a single worker, or dependency-gated commits.
    pub fn restores_foreign_key_checks(&self) -> bool {
        self.parallel_workers <= 1 || self.use_mysql_dependency
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_password() {
        let config = ConnectionConfig::new("localhost", "admin").with_password("super_secret");
        let out = format!("{:?}", config);
        assert!(out.contains("[REDACTED]"));
        assert!(!out.contains("super_secret"));
        assert!(out.contains("localhost"));
    }

    #[test]
    fn test_from_map_defaults() {
        let mut map = HashMap::new();
        map.insert("host".to_string(), "db1".to_string());
        map.insert("port".to_string(), "3307".to_string());
        map.insert("user".to_string(), "repl".to_string());

        let cfg = ConnectionConfig::from_map(&map).unwrap();
        assert_eq!(cfg.host, "db1");
        assert_eq!(cfg.port, 3307);
        assert_eq!(cfg.user, "repl");
        assert_eq!(cfg.password, "");
        assert_eq!(cfg.charset, "utf8");
    }

    #[test]
    fn test_from_map_missing_required() {
        let mut map = HashMap::new();
        map.insert("host".to_string(), "db1".to_string());
        let err = ConnectionConfig::from_map(&map).unwrap_err();
        assert!(err.to_string().contains("missing connection option"));
    }

    #[test]
    fn test_from_map_rejects_unknown_keys() {
        let mut map = HashMap::new();
        map.insert("host".to_string(), "db1".to_string());
        map.insert("port".to_string(), "3306".to_string());
        map.insert("user".to_string(), "u".to_string());
        map.insert("pasword".to_string(), "typo".to_string());
        assert!(ConnectionConfig::from_map(&map).is_err());
    }

    #[test]
    fn test_from_map_bad_port() {
        let mut map = HashMap::new();
        map.insert("host".to_string(), "db1".to_string());
        map.insert("port".to_string(), "not-a-port".to_string());
        map.insert("user".to_string(), "u".to_string());
        assert!(ConnectionConfig::from_map(&map).is_err());
    }

    #[test]
    fn test_row_image_parse() {
        assert_eq!(RowImage::parse("FULL"), RowImage::Full);
        assert_eq!(RowImage::parse("minimal"), RowImage::Minimal);
        // pre-5.6 servers have no @@binlog_row_image
        assert_eq!(RowImage::parse(""), RowImage::Full);
    }

    #[test]
    fn test_unique_key_display() {
        let uk = UniqueKey::new("PRIMARY", vec!["id".to_string(), "ts".to_string()]);
        assert!(uk.is_primary());
        assert_eq!(uk.to_string(), "PRIMARY(id,ts)");
        assert_eq!(uk.last_max_vals.len(), 2);
    }

    #[test]
    fn test_fk_restore_policy() {
        let mut cfg = JobConfig::default();
        cfg.parallel_workers = 1;
        assert!(cfg.restores_foreign_key_checks());

        cfg.parallel_workers = 8;
        assert!(!cfg.restores_foreign_key_checks());

        cfg.use_mysql_dependency = true;
        assert!(cfg.restores_foreign_key_checks());
    }
}
