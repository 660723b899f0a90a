//! Canonical table schema model
//!
//! The parser front-end lowers MySQL DDL into this model; the merge engine
//! folds ALTERs into it; the catalog shares it with apply workers as
//! immutable snapshots. Column-name comparisons are case-insensitive
//! throughout, matching MySQL identifier semantics.

pub mod catalog;
pub mod merge;
pub mod parser;

pub use catalog::{ColumnLookup, SchemaCatalog};
pub use merge::{merge, AlterSpec, AlterTable, MergeConflict};
pub use parser::{
    parse_alter_table, parse_create_table, parse_ddl, validate_where_filter, DdlStatement,
};

use serde::{Deserialize, Serialize};

/// One column definition inside a CREATE TABLE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    /// Rendered MySQL type, e.g. `INT`, `VARCHAR(255)`
    pub data_type: String,
    pub nullable: bool,
    /// Rendered default-value literal, when present
    pub default: Option<String>,
    pub charset: Option<String>,
    /// Column-level PRIMARY KEY option
    pub primary_key: bool,
    /// Column-level UNIQUE option
    pub unique: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            default: None,
            charset: None,
            primary_key: false,
            unique: false,
        }
    }

    pub fn name_eq(&self, other: &str) -> bool {
        self.name.eq_ignore_ascii_case(other)
    }
}

/// Kind of a table-level key or constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    PrimaryKey,
    Unique,
    Index,
    ForeignKey,
    Check,
    Fulltext,
}

/// A table-level key or constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDef {
    pub name: Option<String>,
    pub kind: KeyKind,
    pub columns: Vec<String>,
}

impl KeyDef {
    pub fn name_eq(&self, other: &str) -> bool {
        self.name
            .as_deref()
            .is_some_and(|n| n.eq_ignore_ascii_case(other))
    }
}

/// Canonical form of one CREATE TABLE statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub schema: Option<String>,
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub constraints: Vec<KeyDef>,
}

impl TableDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
            columns: Vec::new(),
            constraints: Vec::new(),
        }
    }

    pub fn column_position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name_eq(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_position(name).is_some()
    }

    /// A table has a primary key if either a PRIMARY KEY constraint or a
    /// column-level PK option is present.
    pub fn has_primary_key(&self) -> bool {
        self.constraints
            .iter()
            .any(|c| c.kind == KeyKind::PrimaryKey)
            || self.columns.iter().any(|c| c.primary_key)
    }

    /// The primary key's column names, from whichever form declares it.
    pub fn primary_key_columns(&self) -> Vec<String> {
        if let Some(pk) = self
            .constraints
            .iter()
            .find(|c| c.kind == KeyKind::PrimaryKey)
        {
            return pk.columns.clone();
        }
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.clone())
            .collect()
    }
}
