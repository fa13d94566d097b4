//! `ALTER TABLE` support.
//!
//! Only `ADD COLUMN` is implemented. Renaming or dropping a column on an
//! already-populated CRR changes what every peer's stored `__version`
//! columns mean out from under them with no way to reconcile in flight, so
//! both come back as [`CrrError::Unsupported`] rather than being silently
//! half-applied — see the design notes for the full reasoning.

use rusqlite::Connection;

use crate::compiler;
use crate::error::{CrrError, Result};
use crate::ident::quote_ident;
use crate::tableinfo::{self, ColumnInfo};

pub fn compile(conn: &Connection, stmt: &str) -> Result<()> {
    let table_name = table_name(stmt)?;
    let upper = stmt.to_ascii_uppercase();

    if upper.contains("ADD COLUMN") || upper.contains("ADD ") {
        let column_sql = add_column_def(stmt)?;
        add_column(conn, &table_name, column_sql)
    } else if upper.contains("RENAME COLUMN") || upper.contains("RENAME TO") {
        Err(CrrError::Unsupported(
            "renaming a table or column on a CRR-backed table is not supported".to_string(),
        ))
    } else if upper.contains("DROP COLUMN") {
        Err(CrrError::Unsupported(
            "dropping a column from a CRR-backed table is not supported".to_string(),
        ))
    } else {
        Err(CrrError::Unsupported(format!(
            "unsupported ALTER TABLE form: {stmt}"
        )))
    }
}

fn table_name(stmt: &str) -> Result<String> {
    let upper = stmt.to_ascii_uppercase();
    let pos = upper
        .find("ALTER TABLE")
        .ok_or_else(|| CrrError::Misuse(format!("expected ALTER TABLE in: {stmt}")))?;
    let rest = stmt[pos + "ALTER TABLE".len()..].trim_start();
    let end = rest
        .find(|c: char| c.is_whitespace())
        .ok_or_else(|| CrrError::Misuse(format!("expected table name after ALTER TABLE in: {stmt}")))?;
    Ok(rest[..end].trim_matches('"').to_string())
}

/// Slice out the column definition following `ADD [COLUMN]`.
fn add_column_def(stmt: &str) -> Result<&str> {
    let upper = stmt.to_ascii_uppercase();
    let marker = if let Some(pos) = upper.find("ADD COLUMN") {
        pos + "ADD COLUMN".len()
    } else if let Some(pos) = upper.find("ADD ") {
        pos + "ADD ".len()
    } else {
        return Err(CrrError::Misuse(format!("expected ADD COLUMN in: {stmt}")));
    };
    let def = stmt[marker..].trim();
    if def.is_empty() {
        return Err(CrrError::Misuse("empty column definition in ALTER TABLE ADD COLUMN".to_string()));
    }
    Ok(def)
}

/// Best-effort parse of `<name> <type> [NOT NULL] [DEFAULT <expr>]` — the
/// subset of column-definition syntax SQLite's `ADD COLUMN` itself accepts
/// (no inline `PRIMARY KEY`/`UNIQUE`/`REFERENCES`, which SQLite rejects on
/// `ADD COLUMN` in the first place).
fn parse_column_def(def: &str) -> Result<ColumnInfo> {
    let def = def.trim();
    let (name, rest) = if let Some(stripped) = def.strip_prefix('"') {
        let end = stripped.find('"').ok_or_else(|| {
            CrrError::Misuse(format!("unterminated quoted column name in: {def}"))
        })?;
        (stripped[..end].to_string(), stripped[end + 1..].trim_start())
    } else {
        let end = def.find(char::is_whitespace).unwrap_or(def.len());
        (def[..end].to_string(), def[end..].trim_start())
    };

    let upper_rest = rest.to_ascii_uppercase();
    let not_null = upper_rest.contains("NOT NULL");
    let default_value = upper_rest.find("DEFAULT").map(|pos| {
        rest[pos + "DEFAULT".len()..]
            .trim()
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_string()
    });

    let type_end = rest
        .find(|c: char| c.is_whitespace())
        .unwrap_or(rest.len());
    let decl_type = if type_end == 0 {
        "BLOB".to_string()
    } else {
        rest[..type_end].to_string()
    };

    Ok(ColumnInfo {
        name,
        decl_type,
        not_null,
        default_value,
    })
}

pub fn add_column(conn: &Connection, table: &str, column_sql: &str) -> Result<()> {
    let mut info = tableinfo::introspect(conn, table)?;
    let new_col = parse_column_def(column_sql)?;

    let crr_table = quote_ident(&format!("{table}__crr"));
    conn.execute_batch(&format!("ALTER TABLE {crr_table} ADD COLUMN {column_sql}"))?;
    conn.execute_batch(&format!(
        "ALTER TABLE {crr_table} ADD COLUMN {} INTEGER",
        quote_ident(&format!("{}__version", new_col.name))
    ))?;
    conn.execute_batch(&format!(
        "ALTER TABLE {crr_table} ADD COLUMN {} BLOB",
        quote_ident(&format!("{}__site_id", new_col.name))
    ))?;

    info.columns.push(new_col);
    compiler::recreate_view_and_triggers(conn, &info)?;
    tracing::info!(table, "added column via CRR ALTER TABLE");
    Ok(())
}
