//! ALTER TABLE folding
//!
//! `merge` applies the specifications of one ALTER TABLE statement to a
//! canonical CREATE TABLE, producing the new canonical form. The fold is
//! transactional at the statement level: if any specification is
//! structurally inconsistent with the current table (dropping a column that
//! does not exist, adding a duplicate), the whole statement is rejected and
//! the caller keeps the prior CREATE. Downstream consumers never observe a
//! half-updated table.

use crate::schema::{ColumnDef, KeyDef, KeyKind, TableDef};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One specification inside an ALTER TABLE statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlterSpec {
    RenameTable { new_name: String },
    AddColumns { columns: Vec<ColumnDef> },
    DropColumn { name: String },
    /// `CHANGE old_name new_def`: replace at the position of the old name
    ChangeColumn { old_name: String, column: ColumnDef },
    /// `MODIFY col_def`: replace at the position of the new column's name
    ModifyColumn { column: ColumnDef },
    /// `RENAME COLUMN old TO new`: rename in place, keep the definition
    RenameColumn { old_name: String, new_name: String },
    /// `ALTER COLUMN c SET DEFAULT expr`
    SetColumnDefault { name: String, default: String },
    /// `ALTER COLUMN c DROP DEFAULT`
    DropColumnDefault { name: String },
    DropPrimaryKey,
    DropIndex { name: String },
    RenameIndex { old_name: String, new_name: String },
    AddConstraint { key: KeyDef },
}

/// One parsed ALTER TABLE statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlterTable {
    pub schema: Option<String>,
    pub table: String,
    pub specs: Vec<AlterSpec>,
}

/// Why a fold was rejected. The catalog reports the conflict and keeps the
/// prior CREATE; the job keeps running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeConflict {
    UnknownTable(String),
    ColumnMissing(String),
    DuplicateColumn(String),
    NoPrimaryKey,
    PrimaryKeyExists,
    ConstraintMissing(String),
    DuplicateConstraint(String),
}

impl fmt::Display for MergeConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownTable(t) => write!(f, "table {t} is not in the catalog"),
            Self::ColumnMissing(c) => write!(f, "column {c} does not exist"),
            Self::DuplicateColumn(c) => write!(f, "column {c} already exists"),
            Self::NoPrimaryKey => write!(f, "table has no primary key"),
            Self::PrimaryKeyExists => write!(f, "table already has a primary key"),
            Self::ConstraintMissing(n) => write!(f, "constraint {n} does not exist"),
            Self::DuplicateConstraint(n) => write!(f, "constraint {n} already exists"),
        }
    }
}

/// Fold one ALTER TABLE into a CREATE TABLE.
///
/// Specifications apply in statement order against the working copy, so an
/// `ADD COLUMN b, ADD COLUMN b` pair conflicts on the second spec and the
/// whole statement is rejected.
pub fn merge(current: &TableDef, alter: &AlterTable) -> Result<TableDef, MergeConflict> {
    let mut table = current.clone();
    for spec in &alter.specs {
        apply_spec(&mut table, spec)?;
    }
    Ok(table)
}

fn apply_spec(table: &mut TableDef, spec: &AlterSpec) -> Result<(), MergeConflict> {
    match spec {
        AlterSpec::RenameTable { new_name } => {
            table.name = new_name.clone();
            Ok(())
        }

        AlterSpec::AddColumns { columns } => {
            for col in columns {
                if table.has_column(&col.name) {
                    return Err(MergeConflict::DuplicateColumn(col.name.clone()));
                }
                table.columns.push(col.clone());
            }
            Ok(())
        }

        AlterSpec::DropColumn { name } => {
            let pos = table
                .column_position(name)
                .ok_or_else(|| MergeConflict::ColumnMissing(name.clone()))?;
            table.columns.remove(pos);
            Ok(())
        }

        AlterSpec::ChangeColumn { old_name, column } => {
            let pos = table
                .column_position(old_name)
                .ok_or_else(|| MergeConflict::ColumnMissing(old_name.clone()))?;
            table.columns[pos] = column.clone();
            Ok(())
        }

        AlterSpec::ModifyColumn { column } => {
            let pos = table
                .column_position(&column.name)
                .ok_or_else(|| MergeConflict::ColumnMissing(column.name.clone()))?;
            table.columns[pos] = column.clone();
            Ok(())
        }

        AlterSpec::RenameColumn { old_name, new_name } => {
            let pos = table
                .column_position(old_name)
                .ok_or_else(|| MergeConflict::ColumnMissing(old_name.clone()))?;
            if !old_name.eq_ignore_ascii_case(new_name) && table.has_column(new_name) {
                return Err(MergeConflict::DuplicateColumn(new_name.clone()));
            }
            table.columns[pos].name = new_name.clone();
            Ok(())
        }

        AlterSpec::SetColumnDefault { name, default } => {
            let pos = table
                .column_position(name)
                .ok_or_else(|| MergeConflict::ColumnMissing(name.clone()))?;
            table.columns[pos].default = Some(default.clone());
            Ok(())
        }

        AlterSpec::DropColumnDefault { name } => {
            let pos = table
                .column_position(name)
                .ok_or_else(|| MergeConflict::ColumnMissing(name.clone()))?;
            table.columns[pos].default = None;
            Ok(())
        }

        AlterSpec::DropPrimaryKey => {
            if !table.has_primary_key() {
                return Err(MergeConflict::NoPrimaryKey);
            }
            table
                .constraints
                .retain(|c| c.kind != KeyKind::PrimaryKey);
            for col in &mut table.columns {
                col.primary_key = false;
            }
            Ok(())
        }

        AlterSpec::DropIndex { name } => {
            let pos = table
                .constraints
                .iter()
                .position(|c| c.name_eq(name))
                .ok_or_else(|| MergeConflict::ConstraintMissing(name.clone()))?;
            table.constraints.remove(pos);
            Ok(())
        }

        AlterSpec::RenameIndex { old_name, new_name } => {
            let pos = table
                .constraints
                .iter()
                .position(|c| c.name_eq(old_name))
                .ok_or_else(|| MergeConflict::ConstraintMissing(old_name.clone()))?;
            table.constraints[pos].name = Some(new_name.clone());
            Ok(())
        }

        AlterSpec::AddConstraint { key } => {
            if key.kind == KeyKind::PrimaryKey {
                if table.has_primary_key() {
                    return Err(MergeConflict::PrimaryKeyExists);
                }
            } else if let Some(name) = &key.name {
                if table.constraints.iter().any(|c| c.name_eq(name)) {
                    return Err(MergeConflict::DuplicateConstraint(name.clone()));
                }
            }
            table.constraints.push(key.clone());
            Ok(())
        }
    }
}
