//! SQL rendering helpers and server-error classification

use mysql_async::Error as DbError;

// MySQL server error codes consulted by the apply path.
const ER_DB_CREATE_EXISTS: u16 = 1007;
const ER_DB_DROP_EXISTS: u16 = 1008;
const ER_TABLE_EXISTS_ERROR: u16 = 1050;
const ER_BAD_TABLE_ERROR: u16 = 1051;
const ER_DUP_FIELDNAME: u16 = 1060;
const ER_DUP_KEYNAME: u16 = 1061;
const ER_DUP_ENTRY: u16 = 1062;
const ER_CANT_DROP_FIELD_OR_KEY: u16 = 1091;

/// Backtick-quote an identifier, doubling embedded backticks.
pub fn escape_name(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// `\`schema\`.\`table\``
pub fn qualified_name(schema: &str, table: &str) -> String {
    format!("{}.{}", escape_name(schema), escape_name(table))
}

/// Escape a string value for inclusion inside single quotes, MySQL rules.
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\x1a' => out.push_str("\\Z"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            _ => out.push(ch),
        }
    }
    out
}

/// Render one optional cell: `NULL` for absent, quoted-escaped otherwise.
pub fn render_cell(cell: Option<&str>) -> String {
    match cell {
        Some(v) => format!("'{}'", escape_value(v)),
        None => "NULL".to_string(),
    }
}

fn server_code(err: &DbError) -> Option<u16> {
    match err {
        DbError::Server(e) => Some(e.code),
        _ => None,
    }
}

/// Benign statement errors, swallowed silently: replaying DDL the
/// destination already rolled past (dropping what is already gone).
pub fn ignore_error(err: &DbError) -> bool {
    matches!(
        server_code(err),
        Some(ER_DB_DROP_EXISTS | ER_BAD_TABLE_ERROR | ER_CANT_DROP_FIELD_OR_KEY)
    )
}

/// Existence conflicts, swallowed with a warning: the object or row is
/// already there, which is expected on re-runs over a GTID overlap.
pub fn ignore_exists_error(err: &DbError) -> bool {
    matches!(
        server_code(err),
        Some(
            ER_DB_CREATE_EXISTS
                | ER_TABLE_EXISTS_ERROR
                | ER_DUP_FIELDNAME
                | ER_DUP_KEYNAME
                | ER_DUP_ENTRY
        )
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use mysql_async::ServerError;

    fn server_error(code: u16) -> DbError {
        DbError::Server(ServerError {
            code,
            message: "synthetic".into(),
            state: "HY000".into(),
        })
    }

    #[test]
    fn test_escape_name() {
        assert_eq!(escape_name("users"), "`users`");
        assert_eq!(escape_name("we`ird"), "`we``ird`");
        assert_eq!(qualified_name("s", "t"), "`s`.`t`");
    }

    #[test]
    fn test_escape_value() {
        assert_eq!(escape_value("plain"), "plain");
        assert_eq!(escape_value("it's"), "it\\'s");
        assert_eq!(escape_value("a\\b"), "a\\\\b");
        assert_eq!(escape_value("line\nbreak"), "line\\nbreak");
        assert_eq!(escape_value("nul\0byte"), "nul\\0byte");
    }

    #[test]
    fn test_render_cell() {
        assert_eq!(render_cell(None), "NULL");
        assert_eq!(render_cell(Some("x")), "'x'");
        assert_eq!(render_cell(Some("o'clock")), "'o\\'clock'");
    }

    #[test]
    fn test_error_predicates() {
        assert!(ignore_error(&server_error(1051)));
        assert!(ignore_error(&server_error(1091)));
        assert!(!ignore_error(&server_error(1062)));

        assert!(ignore_exists_error(&server_error(1050)));
        assert!(ignore_exists_error(&server_error(1062)));
        assert!(!ignore_exists_error(&server_error(1146)));

        // a plain driver error matches neither predicate
        let other = DbError::from(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "io"));
        assert!(!ignore_error(&other));
        assert!(!ignore_exists_error(&other));
    }
}
