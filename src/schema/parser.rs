//! MySQL DDL parsing front-end
//!
//! Lowers CREATE TABLE / ALTER TABLE statements into the canonical model
//! via `sqlparser`'s MySQL dialect. The generic grammar has no production
//! for MySQL's index-maintenance spellings inside ALTER (`DROP INDEX`,
//! `RENAME INDEX`/`RENAME KEY`), so those are normalized to the equivalent
//! constraint forms before parsing.
//!
//! Invalid SQL yields [`ReplayError::SqlParse`], fatal for the offending
//! event only: the caller skips the event and reports it.

use crate::common::config::ColumnInfo;
use crate::common::error::{ReplayError, Result};
use crate::schema::merge::{AlterSpec, AlterTable};
use crate::schema::{ColumnDef, KeyDef, KeyKind, TableDef};
use once_cell::sync::Lazy;
use regex::Regex;
use sqlparser::ast::{
    AlterColumnOperation, AlterTableOperation, ColumnDef as SqlColumnDef, ColumnOption, Expr,
    Ident, ObjectName, ObjectType, Statement, TableConstraint,
};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;

static RE_DROP_INDEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bDROP\s+(?:INDEX|KEY)\s+").unwrap());
static RE_RENAME_INDEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bRENAME\s+(?:INDEX|KEY)\s+").unwrap());

/// A DDL statement the catalog cares about.
#[derive(Debug, Clone, PartialEq)]
pub enum DdlStatement {
    CreateTable(TableDef),
    AlterTable(AlterTable),
    DropTable { schema: Option<String>, name: String },
    /// DDL the catalog does not track (CREATE DATABASE, TRUNCATE, ...)
    Other,
}

/// Parse one DDL statement from the replicated stream.
pub fn parse_ddl(sql: &str) -> Result<DdlStatement> {
    let stmt = parse_one(&normalize_alter_spellings(sql))?;
    match stmt {
        Statement::CreateTable {
            name,
            columns,
            constraints,
            ..
        } => {
            let (schema, name) = split_object_name(&name);
            let mut table = TableDef::new(name);
            table.schema = schema;
            for col in &columns {
                table.columns.push(convert_column(col));
            }
            for tc in &constraints {
                table.constraints.push(convert_constraint(tc)?);
            }
            Ok(DdlStatement::CreateTable(table))
        }
        Statement::AlterTable {
            name, operations, ..
        } => {
            let (schema, table) = split_object_name(&name);
            let mut specs = Vec::with_capacity(operations.len());
            for op in &operations {
                specs.push(convert_alter_op(op)?);
            }
            Ok(DdlStatement::AlterTable(AlterTable {
                schema,
                table,
                specs,
            }))
        }
        Statement::Drop {
            object_type: ObjectType::Table,
            names,
            ..
        } => {
            let name = names
                .first()
                .ok_or_else(|| ReplayError::sql_parse("DROP TABLE without a table name"))?;
            let (schema, table) = split_object_name(name);
            Ok(DdlStatement::DropTable {
                schema,
                name: table,
            })
        }
        _ => Ok(DdlStatement::Other),
    }
}

/// Parse a CREATE TABLE statement (e.g. the output of SHOW CREATE TABLE).
pub fn parse_create_table(sql: &str) -> Result<TableDef> {
    match parse_ddl(sql)? {
        DdlStatement::CreateTable(t) => Ok(t),
        _ => Err(ReplayError::sql_parse("not a CREATE TABLE statement")),
    }
}

/// Parse an ALTER TABLE statement.
pub fn parse_alter_table(sql: &str) -> Result<AlterTable> {
    match parse_ddl(sql)? {
        DdlStatement::AlterTable(a) => Ok(a),
        _ => Err(ReplayError::sql_parse("not an ALTER TABLE statement")),
    }
}

/// Validate a row-filter predicate against a table's column list.
///
/// Errors on unparseable predicates and on references to columns the table
/// does not have. Callers treat failure as a warning: filters may have been
/// authored before schema drift and the table stays accepted.
pub fn validate_where_filter(filter: &str, columns: &[ColumnInfo]) -> Result<()> {
    let sql = format!("SELECT * FROM __filter_probe WHERE {filter}");
    let stmt = parse_one(&sql)?;
    let Statement::Query(query) = stmt else {
        return Err(ReplayError::sql_parse("filter did not parse as a predicate"));
    };
    let sqlparser::ast::SetExpr::Select(select) = query.body.as_ref() else {
        return Err(ReplayError::sql_parse("filter did not parse as a predicate"));
    };
    let Some(selection) = &select.selection else {
        return Err(ReplayError::sql_parse("empty filter predicate"));
    };

    let mut referenced = Vec::new();
    scan_where_expr(selection, &mut referenced);
    for col in referenced {
        if !columns.iter().any(|c| c.name.eq_ignore_ascii_case(&col)) {
            return Err(ReplayError::sql_parse(format!(
                "filter references unknown column {col}"
            )));
        }
    }
    Ok(())
}

// ============================================================================
// Internals
// ============================================================================

fn parse_one(sql: &str) -> Result<Statement> {
    let mut stmts = Parser::parse_sql(&MySqlDialect {}, sql)
        .map_err(|e| ReplayError::sql_parse(e.to_string()))?;
    if stmts.len() != 1 {
        return Err(ReplayError::sql_parse(format!(
            "expected one statement, got {}",
            stmts.len()
        )));
    }
    Ok(stmts.remove(0))
}

/// Rewrite index-maintenance spellings onto the constraint grammar. Only
/// ALTER statements are touched; identifiers in DDL cannot collide with the
/// rewritten keyword pairs.
fn normalize_alter_spellings(sql: &str) -> String {
    if !sql.trim_start().get(..5).is_some_and(|p| p.eq_ignore_ascii_case("ALTER")) {
        return sql.to_string();
    }
    let pass1 = RE_DROP_INDEX.replace_all(sql, "DROP CONSTRAINT ");
    RE_RENAME_INDEX
        .replace_all(&pass1, "RENAME CONSTRAINT ")
        .into_owned()
}

fn ident_name(ident: &Ident) -> String {
    ident.value.clone()
}

fn split_object_name(name: &ObjectName) -> (Option<String>, String) {
    let parts = &name.0;
    match parts.len() {
        0 => (None, String::new()),
        1 => (None, ident_name(&parts[0])),
        _ => (
            Some(ident_name(&parts[parts.len() - 2])),
            ident_name(&parts[parts.len() - 1]),
        ),
    }
}

fn render_default(expr: &Expr) -> String {
    expr.to_string()
}

fn convert_column(col: &SqlColumnDef) -> ColumnDef {
    let options: Vec<ColumnOption> = col.options.iter().map(|o| o.option.clone()).collect();
    column_from_parts(&col.name, &col.data_type, &options)
}

fn idents_to_names(idents: &[Ident]) -> Vec<String> {
    idents.iter().map(ident_name).collect()
}

fn convert_constraint(tc: &TableConstraint) -> Result<KeyDef> {
    match tc {
        TableConstraint::PrimaryKey {
            name,
            index_name,
            columns,
            ..
        } => Ok(KeyDef {
            name: name
                .as_ref()
                .or(index_name.as_ref())
                .map(ident_name),
            kind: KeyKind::PrimaryKey,
            columns: idents_to_names(columns),
        }),
        TableConstraint::Unique {
            name,
            index_name,
            columns,
            ..
        } => Ok(KeyDef {
            name: name
                .as_ref()
                .or(index_name.as_ref())
                .map(ident_name),
            kind: KeyKind::Unique,
            columns: idents_to_names(columns),
        }),
        TableConstraint::Index { name, columns, .. } => Ok(KeyDef {
            name: name.as_ref().map(ident_name),
            kind: KeyKind::Index,
            columns: idents_to_names(columns),
        }),
        TableConstraint::ForeignKey { name, columns, .. } => Ok(KeyDef {
            name: name.as_ref().map(ident_name),
            kind: KeyKind::ForeignKey,
            columns: idents_to_names(columns),
        }),
        TableConstraint::Check { name, .. } => Ok(KeyDef {
            name: name.as_ref().map(ident_name),
            kind: KeyKind::Check,
            columns: Vec::new(),
        }),
        TableConstraint::FulltextOrSpatial {
            opt_index_name,
            columns,
            ..
        } => Ok(KeyDef {
            name: opt_index_name.as_ref().map(ident_name),
            kind: KeyKind::Fulltext,
            columns: idents_to_names(columns),
        }),
    }
}

fn column_from_parts(
    name: &Ident,
    data_type: &sqlparser::ast::DataType,
    options: &[ColumnOption],
) -> ColumnDef {
    let mut out = ColumnDef::new(ident_name(name), data_type.to_string());
    for option in options {
        match option {
            ColumnOption::Null => out.nullable = true,
            ColumnOption::NotNull => out.nullable = false,
            ColumnOption::Default(expr) => out.default = Some(render_default(expr)),
            ColumnOption::Unique { is_primary, .. } => {
                if *is_primary {
                    out.primary_key = true;
                    out.nullable = false;
                } else {
                    out.unique = true;
                }
            }
            ColumnOption::CharacterSet(cs) => out.charset = Some(cs.to_string()),
            _ => {}
        }
    }
    out
}

fn convert_alter_op(op: &AlterTableOperation) -> Result<AlterSpec> {
    match op {
        AlterTableOperation::RenameTable { table_name } => {
            let (_, name) = split_object_name(table_name);
            Ok(AlterSpec::RenameTable { new_name: name })
        }
        AlterTableOperation::AddColumn { column_def, .. } => Ok(AlterSpec::AddColumns {
            columns: vec![convert_column(column_def)],
        }),
        AlterTableOperation::DropColumn { column_name, .. } => Ok(AlterSpec::DropColumn {
            name: ident_name(column_name),
        }),
        AlterTableOperation::ChangeColumn {
            old_name,
            new_name,
            data_type,
            options,
            ..
        } => Ok(AlterSpec::ChangeColumn {
            old_name: ident_name(old_name),
            column: column_from_parts(new_name, data_type, options),
        }),
        AlterTableOperation::ModifyColumn {
            col_name,
            data_type,
            options,
            ..
        } => Ok(AlterSpec::ModifyColumn {
            column: column_from_parts(col_name, data_type, options),
        }),
        AlterTableOperation::RenameColumn {
            old_column_name,
            new_column_name,
        } => Ok(AlterSpec::RenameColumn {
            old_name: ident_name(old_column_name),
            new_name: ident_name(new_column_name),
        }),
        AlterTableOperation::AlterColumn { column_name, op } => match op {
            AlterColumnOperation::SetDefault { value } => Ok(AlterSpec::SetColumnDefault {
                name: ident_name(column_name),
                default: render_default(value),
            }),
            AlterColumnOperation::DropDefault => Ok(AlterSpec::DropColumnDefault {
                name: ident_name(column_name),
            }),
            other => Err(ReplayError::sql_parse(format!(
                "unsupported ALTER COLUMN operation: {other:?}"
            ))),
        },
        AlterTableOperation::DropPrimaryKey => Ok(AlterSpec::DropPrimaryKey),
        AlterTableOperation::DropConstraint { name, .. } => Ok(AlterSpec::DropIndex {
            name: ident_name(name),
        }),
        AlterTableOperation::RenameConstraint { old_name, new_name } => {
            Ok(AlterSpec::RenameIndex {
                old_name: ident_name(old_name),
                new_name: ident_name(new_name),
            })
        }
        AlterTableOperation::AddConstraint(tc) => Ok(AlterSpec::AddConstraint {
            key: convert_constraint(tc)?,
        }),
        other => Err(ReplayError::sql_parse(format!(
            "unsupported ALTER TABLE operation: {other:?}"
        ))),
    }
}

/// Walk a WHERE expression collecting referenced column names. Subqueries
/// are not followed; a filter with a subquery fails on the column check
/// rather than being silently accepted.
fn scan_where_expr(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Identifier(ident) => out.push(ident_name(ident)),
        Expr::CompoundIdentifier(parts) => {
            if let Some(last) = parts.last() {
                out.push(ident_name(last));
            }
        }
        Expr::BinaryOp { left, right, .. } => {
            scan_where_expr(left, out);
            scan_where_expr(right, out);
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) => scan_where_expr(expr, out),
        Expr::IsNull(expr)
        | Expr::IsNotNull(expr)
        | Expr::IsTrue(expr)
        | Expr::IsNotTrue(expr)
        | Expr::IsFalse(expr)
        | Expr::IsNotFalse(expr) => scan_where_expr(expr, out),
        Expr::Between {
            expr, low, high, ..
        } => {
            scan_where_expr(expr, out);
            scan_where_expr(low, out);
            scan_where_expr(high, out);
        }
        Expr::InList { expr, list, .. } => {
            scan_where_expr(expr, out);
            for item in list {
                scan_where_expr(item, out);
            }
        }
        Expr::Like { expr, pattern, .. } | Expr::ILike { expr, pattern, .. } => {
            scan_where_expr(expr, out);
            scan_where_expr(pattern, out);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_create_table_basic() {
        let t = parse_create_table(
            "CREATE TABLE `s`.`users` (
                id INT NOT NULL PRIMARY KEY,
                name VARCHAR(64) DEFAULT 'anon',
                score FLOAT,
                UNIQUE KEY uk_name (name)
            )",
        )
        .unwrap();
        assert_eq!(t.schema.as_deref(), Some("s"));
        assert_eq!(t.name, "users");
        assert_eq!(t.columns.len(), 3);
        assert!(t.columns[0].primary_key);
        assert!(!t.columns[0].nullable);
        assert_eq!(t.columns[1].default.as_deref(), Some("'anon'"));
        assert_eq!(t.constraints.len(), 1);
        assert_eq!(t.constraints[0].kind, KeyKind::Unique);
        assert_eq!(t.constraints[0].columns, vec!["name"]);
        assert!(t.has_primary_key());
    }

    #[test]
    fn test_parse_create_table_constraint_pk() {
        let t = parse_create_table(
            "CREATE TABLE t (a INT NOT NULL, b INT NOT NULL, PRIMARY KEY (a, b))",
        )
        .unwrap();
        assert_eq!(t.primary_key_columns(), vec!["a", "b"]);
    }

    #[test]
    fn test_parse_alter_add_drop() {
        let a = parse_alter_table("ALTER TABLE t ADD COLUMN c INT, DROP COLUMN b").unwrap();
        assert_eq!(a.table, "t");
        assert_eq!(a.specs.len(), 2);
        assert!(matches!(&a.specs[0], AlterSpec::AddColumns { columns } if columns[0].name == "c"));
        assert!(matches!(&a.specs[1], AlterSpec::DropColumn { name } if name == "b"));
    }

    #[test]
    fn test_parse_alter_change_modify() {
        let a = parse_alter_table(
            "ALTER TABLE t CHANGE COLUMN a a2 BIGINT NOT NULL, MODIFY COLUMN b VARCHAR(32)",
        )
        .unwrap();
        match &a.specs[0] {
            AlterSpec::ChangeColumn { old_name, column } => {
                assert_eq!(old_name, "a");
                assert_eq!(column.name, "a2");
                assert!(!column.nullable);
            }
            other => panic!("unexpected spec: {other:?}"),
        }
        assert!(
            matches!(&a.specs[1], AlterSpec::ModifyColumn { column } if column.name == "b")
        );
    }

    #[test]
    fn test_parse_alter_index_spellings_normalized() {
        let a = parse_alter_table("ALTER TABLE t DROP INDEX idx_a").unwrap();
        assert!(matches!(&a.specs[0], AlterSpec::DropIndex { name } if name == "idx_a"));

        let a = parse_alter_table("ALTER TABLE t RENAME INDEX idx_a TO idx_b").unwrap();
        assert!(matches!(
            &a.specs[0],
            AlterSpec::RenameIndex { old_name, new_name }
                if old_name == "idx_a" && new_name == "idx_b"
        ));
    }

    #[test]
    fn test_parse_alter_default_ops() {
        let a = parse_alter_table("ALTER TABLE t ALTER COLUMN c SET DEFAULT 5").unwrap();
        assert!(matches!(
            &a.specs[0],
            AlterSpec::SetColumnDefault { name, default } if name == "c" && default == "5"
        ));

        let a = parse_alter_table("ALTER TABLE t ALTER COLUMN c DROP DEFAULT").unwrap();
        assert!(matches!(&a.specs[0], AlterSpec::DropColumnDefault { name } if name == "c"));
    }

    #[test]
    fn test_parse_alter_constraints() {
        let a = parse_alter_table("ALTER TABLE t ADD CONSTRAINT uk UNIQUE (a, b)").unwrap();
        match &a.specs[0] {
            AlterSpec::AddConstraint { key } => {
                assert_eq!(key.name.as_deref(), Some("uk"));
                assert_eq!(key.kind, KeyKind::Unique);
                assert_eq!(key.columns, vec!["a", "b"]);
            }
            other => panic!("unexpected spec: {other:?}"),
        }

        let a = parse_alter_table("ALTER TABLE t DROP PRIMARY KEY").unwrap();
        assert!(matches!(&a.specs[0], AlterSpec::DropPrimaryKey));
    }

    #[test]
    fn test_parse_drop_table() {
        let d = parse_ddl("DROP TABLE s.t").unwrap();
        assert_eq!(
            d,
            DdlStatement::DropTable {
                schema: Some("s".into()),
                name: "t".into()
            }
        );
    }

    #[test]
    fn test_untracked_ddl_is_other() {
        assert_eq!(parse_ddl("CREATE DATABASE d").unwrap(), DdlStatement::Other);
    }

    #[test]
    fn test_invalid_sql_is_parse_error() {
        let err = parse_ddl("ALTER TABLE").unwrap_err();
        assert!(matches!(err, ReplayError::SqlParse(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_where_filter_ok() {
        let columns = vec![
            ColumnInfo {
                name: "id".into(),
                data_type: "int".into(),
                nullable: false,
                charset: None,
            },
            ColumnInfo {
                name: "region".into(),
                data_type: "varchar".into(),
                nullable: true,
                charset: None,
            },
        ];
        validate_where_filter("id > 100 AND region IN ('eu', 'us')", &columns).unwrap();
    }

    #[test]
    fn test_where_filter_unknown_column() {
        let columns = vec![ColumnInfo {
            name: "id".into(),
            data_type: "int".into(),
            nullable: false,
            charset: None,
        }];
        let err = validate_where_filter("dropped_col = 1", &columns).unwrap_err();
        assert!(matches!(err, ReplayError::SqlParse(_)));
    }

    #[test]
    fn test_where_filter_unparseable() {
        let columns = vec![];
        assert!(validate_where_filter("id >>> nonsense (", &columns).is_err());
    }
}
