//! Current-schema catalog
//!
//! `schema -> table -> canonical CREATE TABLE`, updated by folding incoming
//! ALTERs. The catalog is copy-on-fold: `merge` builds a fresh tree and the
//! `Arc` swap under the writer lock is the only mutation apply workers can
//! observe. Workers snapshot the `Arc` once per transaction, so the table
//! they see never mutates mid-transaction; DDL events act as ordering
//! barriers in the applier.
//!
//! A failed fold keeps the prior CREATE and surfaces the conflict to the
//! caller for reporting; it is never fatal to the job.

use crate::schema::merge::{merge, AlterTable, MergeConflict};
use crate::schema::TableDef;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Result of resolving a column reference against the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ColumnLookup {
    pub exists: bool,
    /// A bare column name matched in more than one table; callers treat
    /// ambiguous references as errors.
    pub ambiguous: bool,
}

type Tables = HashMap<String, Arc<TableDef>>;

/// Thread-safe catalog of the current per-table schema.
#[derive(Default)]
pub struct SchemaCatalog {
    inner: RwLock<HashMap<String, Tables>>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a table from a CREATE TABLE statement.
    pub fn apply_create(&self, schema: &str, table: TableDef) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let name = table.name.clone();
        inner
            .entry(schema.to_string())
            .or_default()
            .insert(name.to_lowercase(), Arc::new(table));
    }

    /// Fold an ALTER TABLE into the table's canonical CREATE.
    ///
    /// On conflict the prior CREATE is kept unchanged and the conflict is
    /// returned for reporting.
    pub fn apply_alter(
        &self,
        default_schema: &str,
        alter: &AlterTable,
    ) -> Result<(), MergeConflict> {
        let schema = alter.schema.as_deref().unwrap_or(default_schema);
        let key = alter.table.to_lowercase();

        let current = {
            let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
            inner
                .get(schema)
                .and_then(|tables| tables.get(&key))
                .cloned()
                .ok_or_else(|| {
                    MergeConflict::UnknownTable(format!("{schema}.{}", alter.table))
                })?
        };

        // fold outside the lock; only the pointer swap is serialized
        let merged = match merge(&current, alter) {
            Ok(merged) => merged,
            Err(conflict) => {
                warn!(schema, table = %alter.table, %conflict, "ALTER fold rejected, keeping prior schema");
                return Err(conflict);
            }
        };

        let renamed = !merged.name.eq_ignore_ascii_case(&alter.table);
        let new_key = merged.name.to_lowercase();

        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let tables = inner.entry(schema.to_string()).or_default();
        if renamed {
            tables.remove(&key);
        }
        tables.insert(new_key, Arc::new(merged));
        debug!(schema, table = %alter.table, renamed, "ALTER folded");
        Ok(())
    }

    /// Drop a table from the catalog.
    pub fn remove_table(&self, schema: &str, table: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(tables) = inner.get_mut(schema) {
            tables.remove(&table.to_lowercase());
        }
    }

    /// Immutable snapshot of a table's current schema. Apply workers call
    /// this once per transaction.
    pub fn snapshot(&self, schema: &str, table: &str) -> Option<Arc<TableDef>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .get(schema)
            .and_then(|tables| tables.get(&table.to_lowercase()))
            .cloned()
    }

    pub fn table_count(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.values().map(|t| t.len()).sum()
    }

    /// Resolve a column reference.
    ///
    /// With a schema qualifier the lookup is exact. Without one, all catalog
    /// tables are scanned; a bare name resolving in more than one table is
    /// reported ambiguous.
    pub fn resolve_column(
        &self,
        schema: Option<&str>,
        table: Option<&str>,
        column: &str,
    ) -> ColumnLookup {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());

        if let Some(schema) = schema {
            if let Some(table) = table {
                if let Some(def) = inner
                    .get(schema)
                    .and_then(|tables| tables.get(&table.to_lowercase()))
                {
                    return ColumnLookup {
                        exists: def.has_column(column),
                        ambiguous: false,
                    };
                }
            }
            return ColumnLookup::default();
        }

        let mut lookup = ColumnLookup::default();
        let mut note_hit = |hit: bool, lookup: &mut ColumnLookup| {
            if hit {
                if lookup.exists {
                    lookup.ambiguous = true;
                }
                lookup.exists = true;
            }
        };

        for tables in inner.values() {
            if let Some(table) = table {
                if let Some(def) = tables.get(&table.to_lowercase()) {
                    note_hit(def.has_column(column), &mut lookup);
                }
                continue;
            }
            for def in tables.values() {
                note_hit(def.has_column(column), &mut lookup);
            }
        }
        lookup
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::merge::AlterSpec;
    use crate::schema::ColumnDef;

    fn table(name: &str, cols: &[&str]) -> TableDef {
        let mut t = TableDef::new(name);
        for c in cols {
            t.columns.push(ColumnDef::new(*c, "INT"));
        }
        t
    }

    #[test]
    fn test_create_then_snapshot() {
        let catalog = SchemaCatalog::new();
        catalog.apply_create("s", table("t", &["a", "b"]));
        let snap = catalog.snapshot("s", "T").unwrap();
        assert_eq!(snap.columns.len(), 2);
        assert!(catalog.snapshot("s", "missing").is_none());
    }

    #[test]
    fn test_fold_swaps_pointer() {
        let catalog = SchemaCatalog::new();
        catalog.apply_create("s", table("t", &["a"]));
        let before = catalog.snapshot("s", "t").unwrap();

        catalog
            .apply_alter(
                "s",
                &AlterTable {
                    schema: None,
                    table: "t".into(),
                    specs: vec![AlterSpec::AddColumns {
                        columns: vec![ColumnDef::new("b", "INT")],
                    }],
                },
            )
            .unwrap();

        let after = catalog.snapshot("s", "t").unwrap();
        assert_eq!(after.columns.len(), 2);
        // an already-taken snapshot is untouched by the fold
        assert_eq!(before.columns.len(), 1);
    }

    #[test]
    fn test_failed_fold_keeps_prior_tree() {
        let catalog = SchemaCatalog::new();
        catalog.apply_create("s", table("t", &["a", "b"]));
        let before = catalog.snapshot("s", "t").unwrap();

        let conflict = catalog
            .apply_alter(
                "s",
                &AlterTable {
                    schema: None,
                    table: "t".into(),
                    specs: vec![AlterSpec::DropColumn { name: "c".into() }],
                },
            )
            .unwrap_err();
        assert_eq!(conflict, MergeConflict::ColumnMissing("c".into()));

        // byte-for-byte the same tree: not just equal, the same allocation
        let after = catalog.snapshot("s", "t").unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn test_rename_moves_catalog_key() {
        let catalog = SchemaCatalog::new();
        catalog.apply_create("s", table("t", &["a"]));
        catalog
            .apply_alter(
                "s",
                &AlterTable {
                    schema: None,
                    table: "t".into(),
                    specs: vec![AlterSpec::RenameTable {
                        new_name: "t2".into(),
                    }],
                },
            )
            .unwrap();
        assert!(catalog.snapshot("s", "t").is_none());
        assert!(catalog.snapshot("s", "t2").is_some());
    }

    #[test]
    fn test_alter_unknown_table() {
        let catalog = SchemaCatalog::new();
        let err = catalog
            .apply_alter(
                "s",
                &AlterTable {
                    schema: None,
                    table: "nope".into(),
                    specs: vec![],
                },
            )
            .unwrap_err();
        assert!(matches!(err, MergeConflict::UnknownTable(_)));
    }

    #[test]
    fn test_resolve_column_qualified() {
        let catalog = SchemaCatalog::new();
        catalog.apply_create("s1", table("t", &["a"]));

        let hit = catalog.resolve_column(Some("s1"), Some("t"), "a");
        assert!(hit.exists && !hit.ambiguous);

        let miss = catalog.resolve_column(Some("s2"), Some("t"), "a");
        assert!(!miss.exists);
    }

    #[test]
    fn test_resolve_bare_column_ambiguity() {
        let catalog = SchemaCatalog::new();
        catalog.apply_create("s1", table("t1", &["shared", "only1"]));
        catalog.apply_create("s2", table("t2", &["shared"]));

        let hit = catalog.resolve_column(None, None, "only1");
        assert!(hit.exists && !hit.ambiguous);

        let ambiguous = catalog.resolve_column(None, None, "shared");
        assert!(ambiguous.exists && ambiguous.ambiguous);
    }

    #[test]
    fn test_resolve_table_qualified_across_schemas() {
        let catalog = SchemaCatalog::new();
        catalog.apply_create("s1", table("t", &["a"]));
        catalog.apply_create("s2", table("t", &["a"]));

        // `t.a` without a schema matches both catalogs' `t`
        let lookup = catalog.resolve_column(None, Some("t"), "a");
        assert!(lookup.exists && lookup.ambiguous);
    }

    #[test]
    fn test_remove_table() {
        let catalog = SchemaCatalog::new();
        catalog.apply_create("s", table("t", &["a"]));
        catalog.remove_table("s", "t");
        assert!(catalog.snapshot("s", "t").is_none());
        assert_eq!(catalog.table_count(), 0);
    }
}
