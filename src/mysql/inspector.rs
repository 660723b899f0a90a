//! Source inspection and validation
//!
//! The inspector reads the source MySQL server (typically a replica) to
//! verify the environment is suitable for capture: user grants, GTID mode,
//! binary log configuration, and the row image. Per table it confirms
//! existence, enumerates columns, discovers unique-key candidates and
//! applies the replication-key selection rule.
//!
//! The decision logic (grant sufficiency, key validity and selection) is
//! kept in pure functions; the methods on [`Inspector`] only do the I/O.

use crate::common::config::{ColumnInfo, ConnectionConfig, RowImage, TableConfig, UniqueKey};
use crate::common::error::{ReplayError, Result};
use crate::mysql::sqlutil::escape_name;
use crate::schema::validate_where_filter;
use mysql_async::prelude::*;
use mysql_async::{Conn, Row};
use tracing::{debug, info, warn};

/// Unique-key candidate discovery, exactly the shape chunking needs:
/// index name, columns in sequence order, whether the first column is
/// auto_increment, and whether any column of the index is nullable.
const CANDIDATE_KEYS_QUERY: &str = r#"SELECT
      UNIQUES.INDEX_NAME, UNIQUES.COLUMN_NAMES,
      LOCATE('auto_increment', EXTRA) > 0 AS is_auto_increment, has_nullable
    FROM INFORMATION_SCHEMA.COLUMNS INNER JOIN (
      SELECT
        TABLE_SCHEMA, TABLE_NAME, INDEX_NAME,
        GROUP_CONCAT(COLUMN_NAME ORDER BY SEQ_IN_INDEX ASC) AS COLUMN_NAMES,
        SUBSTRING_INDEX(GROUP_CONCAT(COLUMN_NAME ORDER BY SEQ_IN_INDEX ASC), ',', 1) AS FIRST_COLUMN_NAME,
        SUM(NULLABLE = 'YES') > 0 AS has_nullable
      FROM INFORMATION_SCHEMA.STATISTICS
      WHERE NON_UNIQUE = 0 AND TABLE_SCHEMA = ? AND TABLE_NAME = ?
      GROUP BY TABLE_SCHEMA, TABLE_NAME, INDEX_NAME
    ) AS UNIQUES
    ON (
      COLUMNS.TABLE_SCHEMA = UNIQUES.TABLE_SCHEMA
      AND COLUMNS.TABLE_NAME = UNIQUES.TABLE_NAME
      AND COLUMNS.COLUMN_NAME = UNIQUES.FIRST_COLUMN_NAME
    )
    WHERE COLUMNS.TABLE_SCHEMA = ? AND COLUMNS.TABLE_NAME = ?"#;

const COLUMNS_QUERY: &str = r#"SELECT COLUMN_NAME, DATA_TYPE, IS_NULLABLE, CHARACTER_SET_NAME
    FROM INFORMATION_SCHEMA.COLUMNS
    WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
    ORDER BY ORDINAL_POSITION"#;

const TRIGGERS_QUERY: &str = r#"SELECT COUNT(*)
    FROM INFORMATION_SCHEMA.TRIGGERS
    WHERE TRIGGER_SCHEMA = ? AND EVENT_OBJECT_TABLE = ?"#;

// ============================================================================
// Pure decision logic
// ============================================================================

/// What `SHOW GRANTS FOR CURRENT_USER()` told us.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GrantSummary {
    pub all: bool,
    pub super_priv: bool,
    pub replication_client: bool,
    pub replication_slave: bool,
    pub select_on_all: bool,
}

impl GrantSummary {
    /// Scan raw grant lines.
    pub fn scan<'a>(grants: impl IntoIterator<Item = &'a str>) -> Self {
        let mut summary = Self::default();
        for grant in grants {
            if grant.contains("GRANT ALL PRIVILEGES ON") {
                summary.all = true;
            }
            if grant.contains("SUPER") {
                summary.super_priv = true;
            }
            if grant.contains("REPLICATION CLIENT") {
                summary.replication_client = true;
            }
            if grant.contains("REPLICATION SLAVE") {
                summary.replication_slave = true;
            }
            if grant.contains("SELECT") && grant.contains("ON *.*") {
                summary.select_on_all = true;
            }
        }
        summary
    }

    /// ALL PRIVILEGES, or SUPER + REPLICATION SLAVE + SELECT on *.*, or
    /// REPLICATION CLIENT + REPLICATION SLAVE + SELECT on *.*.
    pub fn sufficient(&self) -> bool {
        if self.all {
            return true;
        }
        if self.super_priv && self.replication_slave && self.select_on_all {
            return true;
        }
        self.replication_client && self.replication_slave && self.select_on_all
    }
}

/// Why a candidate cannot serve as the replication key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRejection {
    FloatColumn(String),
    JsonColumn(String),
    HasNullable,
    NotPrimaryUnderMinimalRowImage,
}

/// Check one candidate against the validity rules.
pub fn check_unique_key(
    key: &UniqueKey,
    columns: &[ColumnInfo],
    row_image: RowImage,
) -> std::result::Result<(), KeyRejection> {
    for name in &key.columns {
        if let Some(col) = columns.iter().find(|c| c.name.eq_ignore_ascii_case(name)) {
            if col.is_float() {
                return Err(KeyRejection::FloatColumn(name.clone()));
            }
            if col.is_json() {
                return Err(KeyRejection::JsonColumn(name.clone()));
            }
        }
    }
    if key.has_nullable {
        return Err(KeyRejection::HasNullable);
    }
    if !key.is_primary() && row_image != RowImage::Full {
        return Err(KeyRejection::NotPrimaryUnderMinimalRowImage);
    }
    Ok(())
}

/// Apply the key selection rule: among valid candidates prefer PRIMARY,
/// otherwise the first encountered, in discovery order. `None` means the
/// table replicates with whole-row matching.
pub fn select_unique_key(
    candidates: &[UniqueKey],
    columns: &[ColumnInfo],
    row_image: RowImage,
) -> Option<UniqueKey> {
    let mut chosen: Option<&UniqueKey> = None;
    for key in candidates {
        match check_unique_key(key, columns, row_image) {
            Ok(()) => {
                if key.is_primary() {
                    return Some(key.clone());
                }
                if chosen.is_none() {
                    chosen = Some(key);
                }
            }
            Err(reason) => {
                warn!(key = %key, ?reason, "unique key candidate rejected");
            }
        }
    }
    chosen.cloned()
}

// ============================================================================
// Inspector
// ============================================================================

/// Reads status and structure from the source server.
pub struct Inspector {
    conn: Conn,
    addr: String,
    row_image: RowImage,
}

impl Inspector {
    /// Open the inspection connection.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        debug!(addr = %config.addr(), "inspector connecting");
        let conn = Conn::new(config.opts()).await?;
        Ok(Self {
            conn,
            addr: config.addr(),
            row_image: RowImage::Full,
        })
    }

    /// Row image read during [`validate_binlogs`](Self::validate_binlogs).
    pub fn row_image(&self) -> RowImage {
        self.row_image
    }

    /// Run the startup validations in order. Any failure tears the job down
    /// before it touches the destination.
    pub async fn init_validate(&mut self, skip_privilege_check: bool) -> Result<()> {
        if skip_privilege_check {
            debug!("skipping privilege check");
        } else {
            self.validate_grants().await?;
        }
        self.validate_gtid_mode().await?;
        self.validate_binlogs().await?;
        info!(addr = %self.addr, "inspector initiated");
        Ok(())
    }

    /// Verify the executing user holds the grants capture needs.
    pub async fn validate_grants(&mut self) -> Result<()> {
        let grants: Vec<String> = self
            .conn
            .query("SHOW GRANTS FOR CURRENT_USER()")
            .await?;
        let summary = GrantSummary::scan(grants.iter().map(String::as_str));
        if summary.sufficient() {
            info!(?summary, "user grants validated");
            return Ok(());
        }
        debug!(?summary, "insufficient grants");
        Err(ReplayError::InsufficientPrivileges(
            "needed: ALL, or SUPER|REPLICATION CLIENT + REPLICATION SLAVE + SELECT on *.*"
                .to_string(),
        ))
    }

    pub async fn validate_gtid_mode(&mut self) -> Result<()> {
        let mode: Option<String> = self.conn.query_first("SELECT @@GTID_MODE").await?;
        match mode.as_deref() {
            Some("ON") => Ok(()),
            other => Err(ReplayError::GtidDisabled(format!(
                "must have GTID enabled: {:?}",
                other
            ))),
        }
    }

    /// Binary logging must be on with row-based format; the row image is
    /// read here (FULL on servers that predate `@@binlog_row_image`).
    pub async fn validate_binlogs(&mut self) -> Result<()> {
        let row: Option<(bool, String)> = self
            .conn
            .query_first("SELECT @@log_bin, @@binlog_format")
            .await?;
        let (log_bin, format) = row.ok_or_else(|| {
            ReplayError::BadBinlogConfig("could not read binlog settings".to_string())
        })?;
        if !log_bin {
            return Err(ReplayError::BadBinlogConfig(format!(
                "{} must have binary logs enabled",
                self.addr
            )));
        }
        if format != "ROW" {
            return Err(ReplayError::BadBinlogConfig(
                "it is required to set binlog_format=row".to_string(),
            ));
        }

        self.row_image = match self
            .conn
            .query_first::<String, _>("SELECT @@binlog_row_image")
            .await
        {
            Ok(Some(image)) => RowImage::parse(&image),
            // only as of 5.6; older servers behave as FULL
            Ok(None) | Err(_) => RowImage::Full,
        };

        info!(addr = %self.addr, row_image = ?self.row_image, "binary logs validated");
        Ok(())
    }

    /// Confirm the table exists and is a base table, not a VIEW.
    pub async fn validate_table(&mut self, schema: &str, table: &str) -> Result<()> {
        let query = format!(
            "show table status from {} like '{}'",
            escape_name(schema),
            table
        );
        let rows: Vec<Row> = self.conn.query(query).await?;
        let row = rows.into_iter().next().ok_or_else(|| ReplayError::TableMissing {
            schema: schema.to_string(),
            table: table.to_string(),
        })?;
        let comment: Option<Option<String>> = row.get("Comment");
        if comment.flatten().as_deref() == Some("VIEW") {
            return Err(ReplayError::TableIsView {
                schema: schema.to_string(),
                table: table.to_string(),
            });
        }
        Ok(())
    }

    /// Ordered column list from INFORMATION_SCHEMA.
    pub async fn table_columns(&mut self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>> {
        let rows: Vec<(String, String, String, Option<String>)> = self
            .conn
            .exec(COLUMNS_QUERY, (schema, table))
            .await?;
        Ok(rows
            .into_iter()
            .map(|(name, data_type, is_nullable, charset)| ColumnInfo {
                name,
                data_type: data_type.to_lowercase(),
                nullable: is_nullable == "YES",
                charset,
            })
            .collect())
    }

    /// Discover unique-key candidates, in discovery order.
    pub async fn candidate_unique_keys(
        &mut self,
        schema: &str,
        table: &str,
    ) -> Result<Vec<UniqueKey>> {
        let rows: Vec<(String, String, i64, i64)> = self
            .conn
            .exec(CANDIDATE_KEYS_QUERY, (schema, table, schema, table))
            .await?;
        let keys = rows
            .into_iter()
            .map(|(name, column_names, is_auto_increment, has_nullable)| {
                let columns: Vec<String> =
                    column_names.split(',').map(str::to_string).collect();
                let n = columns.len();
                UniqueKey {
                    name,
                    columns,
                    has_nullable: has_nullable > 0,
                    is_auto_increment: is_auto_increment > 0,
                    last_max_vals: vec![None; n],
                }
            })
            .collect::<Vec<_>>();
        debug!(schema, table, n_keys = keys.len(), "potential unique keys");
        Ok(keys)
    }

    /// Count triggers on a table. Informational: the original tool shipped
    /// this check without wiring it into the fatal path.
    pub async fn trigger_count(&mut self, schema: &str, table: &str) -> Result<i64> {
        let count: Option<i64> = self
            .conn
            .exec_first(TRIGGERS_QUERY, (schema, table))
            .await?;
        Ok(count.unwrap_or(0))
    }

    /// Full per-table validation: existence, columns, key discovery and
    /// selection, filter check. Mutates the descriptor in place; the chosen
    /// key is sticky from here on.
    pub async fn validate_original_table(&mut self, table: &mut TableConfig) -> Result<()> {
        self.validate_table(&table.schema, &table.table).await?;

        table.columns = self.table_columns(&table.schema, &table.table).await?;
        table.row_image = self.row_image;

        let candidates = self
            .candidate_unique_keys(&table.schema, &table.table)
            .await?;
        debug!(
            schema = %table.schema,
            table = %table.table,
            n_unique_keys = candidates.len(),
            "table unique keys discovered"
        );

        table.use_unique_key = select_unique_key(&candidates, &table.columns, self.row_image);
        match &table.use_unique_key {
            Some(key) => info!(
                schema = %table.schema, table = %table.table, key = %key,
                "chosen unique key"
            ),
            None => warn!(
                schema = %table.schema, table = %table.table, n_keys = candidates.len(),
                "no valid unique key found, will be slow on large tables"
            ),
        }

        // filters may have been authored before schema drift; a bad filter
        // is a warning and the table stays accepted
        if let Some(filter) = &table.where_filter {
            if let Err(e) = validate_where_filter(filter, &table.columns) {
                warn!(
                    schema = %table.schema, table = %table.table, filter, error = %e,
                    "row filter did not validate"
                );
            }
        }

        Ok(())
    }

    /// Close the inspection connection.
    pub async fn close(self) {
        let _ = self.conn.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, data_type: &str) -> ColumnInfo {
        ColumnInfo {
            name: name.into(),
            data_type: data_type.into(),
            nullable: false,
            charset: None,
        }
    }

    #[test]
    fn test_grants_all_privileges() {
        let summary = GrantSummary::scan(["GRANT ALL PRIVILEGES ON *.* TO `root`@`%`"]);
        assert!(summary.sufficient());
    }

    #[test]
    fn test_grants_super_combo() {
        let summary = GrantSummary::scan([
            "GRANT SUPER, REPLICATION SLAVE ON *.* TO `repl`@`%`",
            "GRANT SELECT ON *.* TO `repl`@`%`",
        ]);
        assert!(summary.sufficient());
    }

    #[test]
    fn test_grants_replication_client_combo() {
        let summary = GrantSummary::scan([
            "GRANT REPLICATION CLIENT, REPLICATION SLAVE, SELECT ON *.* TO `repl`@`%`",
        ]);
        assert!(summary.sufficient());
    }

    #[test]
    fn test_grants_missing_select_insufficient() {
        let summary =
            GrantSummary::scan(["GRANT SUPER, REPLICATION SLAVE ON *.* TO `repl`@`%`"]);
        assert!(!summary.sufficient());
    }

    #[test]
    fn test_grants_select_on_one_db_insufficient() {
        let summary = GrantSummary::scan([
            "GRANT REPLICATION CLIENT, REPLICATION SLAVE ON *.* TO `repl`@`%`",
            "GRANT SELECT ON `mydb`.* TO `repl`@`%`",
        ]);
        assert!(!summary.sufficient());
    }

    #[test]
    fn test_primary_preferred_over_float_neighbor() {
        // t(id INT PRIMARY KEY, v FLOAT): the FLOAT column is not in the
        // key, so PRIMARY is chosen
        let columns = vec![col("id", "int"), col("v", "float")];
        let candidates = vec![UniqueKey::new("PRIMARY", vec!["id".into()])];
        let chosen = select_unique_key(&candidates, &columns, RowImage::Full).unwrap();
        assert_eq!(chosen.name, "PRIMARY");
    }

    #[test]
    fn test_float_key_rejected_fallback_to_int() {
        // t(a FLOAT UNIQUE, b INT UNIQUE): a rejected, b chosen
        let columns = vec![col("a", "float"), col("b", "int")];
        let candidates = vec![
            UniqueKey::new("a", vec!["a".into()]),
            UniqueKey::new("b", vec!["b".into()]),
        ];
        let chosen = select_unique_key(&candidates, &columns, RowImage::Full).unwrap();
        assert_eq!(chosen.name, "b");
    }

    #[test]
    fn test_json_key_rejected() {
        let columns = vec![col("j", "json")];
        let candidates = vec![UniqueKey::new("uk_j", vec!["j".into()])];
        assert!(select_unique_key(&candidates, &columns, RowImage::Full).is_none());
        assert_eq!(
            check_unique_key(&candidates[0], &columns, RowImage::Full),
            Err(KeyRejection::JsonColumn("j".into()))
        );
    }

    #[test]
    fn test_nullable_key_rejected() {
        let columns = vec![col("a", "int")];
        let mut key = UniqueKey::new("uk_a", vec!["a".into()]);
        key.has_nullable = true;
        assert_eq!(
            check_unique_key(&key, &columns, RowImage::Full),
            Err(KeyRejection::HasNullable)
        );
    }

    #[test]
    fn test_non_primary_rejected_under_minimal_row_image() {
        let columns = vec![col("a", "int")];
        let key = UniqueKey::new("uk_a", vec!["a".into()]);
        assert_eq!(
            check_unique_key(&key, &columns, RowImage::Minimal),
            Err(KeyRejection::NotPrimaryUnderMinimalRowImage)
        );
        // PRIMARY stays valid under MINIMAL
        let pk = UniqueKey::new("PRIMARY", vec!["a".into()]);
        assert!(check_unique_key(&pk, &columns, RowImage::Minimal).is_ok());
    }

    #[test]
    fn test_selection_is_stable() {
        let columns = vec![col("a", "int"), col("b", "int")];
        let candidates = vec![
            UniqueKey::new("uk_a", vec!["a".into()]),
            UniqueKey::new("uk_b", vec!["b".into()]),
        ];
        let first = select_unique_key(&candidates, &columns, RowImage::Full).unwrap();
        let second = select_unique_key(&candidates, &columns, RowImage::Full).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.name, "uk_a");
    }

    #[test]
    fn test_no_valid_key_still_replicable() {
        let columns = vec![col("f", "float")];
        let candidates = vec![UniqueKey::new("uk_f", vec!["f".into()])];
        // None = whole-row matching, the caller logs the slow-path warning
        assert!(select_unique_key(&candidates, &columns, RowImage::Full).is_none());
    }
}
