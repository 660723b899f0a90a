//! Bulk-load entries
//!
//! A [`DumpEntry`] packages one unit of bulk-load data for a table: the
//! CREATE statements, the source session variables in effect, and a
//! rectangular values matrix. Rows are replayed as `REPLACE INTO` batches
//! bounded by 1 MiB of rendered SQL, so a re-run over the same entry is
//! idempotent.

use crate::common::error::Result;
use crate::mysql::sqlutil::{qualified_name, render_cell};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Rendered-SQL budget per REPLACE statement.
pub const BUF_SIZE_LIMIT: usize = 1024 * 1024;
/// Slack past the budget for the row that crosses it.
pub const BUF_SIZE_LIMIT_DELTA: usize = 1024;

/// One unit of bulk-load data for a single table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpEntry {
    pub table_schema: String,
    pub table_name: String,
    /// Literal CREATE DATABASE statement, empty when not needed
    pub db_sql: String,
    /// Literal CREATE TABLE statements
    pub tb_sql: Vec<String>,
    /// Source session sysvars statement (`SET @@session...`)
    pub system_variables: String,
    /// Source `sql_mode` statement
    pub sql_mode: String,
    /// Row cells; `None` is SQL NULL
    pub values: Vec<Vec<Option<String>>>,
}

impl DumpEntry {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

/// End-of-bulk-load marker: the coordinates incremental replay starts from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpStatResult {
    pub gtid_set: String,
    pub log_file: String,
    pub log_pos: u64,
    pub total_count: i64,
}

impl DumpStatResult {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

/// Render the entry's rows as `REPLACE INTO` statements.
///
/// Rows concatenate into one statement until the rendered SQL reaches
/// [`BUF_SIZE_LIMIT`], then a new statement starts. An empty matrix renders
/// no SQL at all.
pub fn render_replace_statements(entry: &DumpEntry) -> Vec<String> {
    let mut statements = Vec::new();
    let mut buf = String::new();
    let prefix = format!(
        "replace into {} values (",
        qualified_name(&entry.table_schema, &entry.table_name)
    );

    for (i, row) in entry.values.iter().enumerate() {
        if buf.is_empty() {
            buf.reserve(BUF_SIZE_LIMIT + BUF_SIZE_LIMIT_DELTA);
            buf.push_str(&prefix);
        } else {
            buf.push_str(",(");
        }

        let mut first_col = true;
        for cell in row {
            if first_col {
                first_col = false;
            } else {
                buf.push(',');
            }
            buf.push_str(&render_cell(cell.as_deref()));
        }
        buf.push(')');

        // flush on the last row or once the statement crossed the budget
        if i == entry.values.len() - 1 || buf.len() >= BUF_SIZE_LIMIT {
            statements.push(std::mem::take(&mut buf));
        }
    }

    statements
}
