use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

use crate::error::{BundleError, Result};

/// Variable substituted into every DDL line with the sanitized prefix.
pub const SCHEMA_OBJECT_PREFIX_VARIABLE: &str = "${schemaObjectPrefix}";

/// Characters that survive prefix sanitization unescaped.
const LEGAL_PREFIX_CHARS: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_";

fn ddl_resource(schema: &str) -> Option<&'static str> {
    match schema {
        "sqlite" => Some(include_str!("schema/sqlite.ddl")),
        "sqlite-split" => Some(include_str!("schema/sqlite-split.ddl")),
        _ => None,
    }
}

/// Uppercases the prefix and escapes every character outside the legal set
/// as `_xHHHH_` (lowercase hex of the code point, zero-padded to four).
pub fn sanitize_prefix(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.to_uppercase().chars() {
        if LEGAL_PREFIX_CHARS.contains(c) {
            escaped.push(c);
        } else {
            escaped.push_str(&format!("_x{:04x}_", c as u32));
        }
    }
    escaped
}

pub fn tables_exist(conn: &Connection, prefix: &str) -> Result<bool> {
    let table = format!("{prefix}BUNDLE");
    let found = conn
        .query_row(
            "select name from sqlite_master where type = 'table' and name = ?1",
            [&table],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Creates the schema objects if the bundle table is absent. Each non-blank
/// DDL line is one statement; `BINVAL` lines are skipped unless the
/// database-resident blob store is in use.
pub fn bootstrap(conn: &Connection, schema: &str, prefix: &str, db_blobs: bool) -> Result<()> {
    if tables_exist(conn, prefix)? {
        debug!(prefix, "schema objects already exist");
        return Ok(());
    }
    let ddl = ddl_resource(schema)
        .ok_or_else(|| BundleError::Schema(format!("unknown schema '{schema}'")))?;
    for line in ddl.lines() {
        let sql = line.replace(SCHEMA_OBJECT_PREFIX_VARIABLE, prefix);
        let sql = sql.trim();
        if sql.is_empty() {
            continue;
        }
        if sql.contains("BINVAL") && !db_blobs {
            continue;
        }
        conn.execute(sql, [])?;
    }
    info!(schema, prefix, "schema objects created");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_passes_legal_names() {
        assert_eq!(sanitize_prefix("WS1_"), "WS1_");
        assert_eq!(sanitize_prefix("lower"), "LOWER");
    }

    #[test]
    fn sanitize_escapes_illegal_characters() {
        assert_eq!(sanitize_prefix("a-b"), "A_x002d_B");
        assert_eq!(sanitize_prefix("x."), "X_x002e_");
    }

    #[test]
    fn bootstrap_creates_tables_once() -> Result<()> {
        let conn = Connection::open_in_memory().map_err(BundleError::Store)?;
        assert!(!tables_exist(&conn, "P_")?);
        bootstrap(&conn, "sqlite", "P_", true)?;
        assert!(tables_exist(&conn, "P_")?);
        // second bootstrap is a no-op, not a "table exists" failure
        bootstrap(&conn, "sqlite", "P_", true)?;
        Ok(())
    }

    #[test]
    fn binval_lines_skipped_without_db_blobs() -> Result<()> {
        let conn = Connection::open_in_memory().map_err(BundleError::Store)?;
        bootstrap(&conn, "sqlite", "", false)?;
        assert!(tables_exist(&conn, "")?);
        let binval = conn
            .query_row(
                "select name from sqlite_master where type = 'table' and name = 'BINVAL'",
                [],
                |_| Ok(()),
            )
            .optional()
            .map_err(BundleError::Store)?;
        assert!(binval.is_none());
        Ok(())
    }

    #[test]
    fn unknown_schema_is_fatal() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(matches!(
            bootstrap(&conn, "oracle", "", true),
            Err(BundleError::Schema(_))
        ));
    }
}
