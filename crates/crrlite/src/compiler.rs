//! The CRR schema compiler: turns ordinary DDL into a backing CRR table, a
//! clock table, a user view, a patch view, and the triggers that tie them
//! together. See [`crate::triggers`] for the view/trigger SQL and
//! [`crate::alter`] for the `ALTER TABLE` subset.

use rusqlite::Connection;

use crate::alter;
use crate::error::{CrrError, Result};
use crate::ident::{column_definitions, join_idents, primary_key_clause, quote_ident};
use crate::tableinfo::{self, TableInfo};
use crate::triggers;

const SAVEPOINT: &str = "crrlite_compile";

/// Compile one DDL statement, replacing it with its CRR-backed equivalent.
/// Rejects multi-statement input outright — each call compiles exactly one
/// `CREATE TABLE`, `ALTER TABLE`, `CREATE [UNIQUE] INDEX`, `DROP INDEX`, or
/// `DROP TABLE`.
pub fn compile(conn: &Connection, sql: &str) -> Result<()> {
    let stmt = single_statement(sql)?;

    conn.execute_batch(&format!("SAVEPOINT {SAVEPOINT}"))?;
    let result = dispatch(conn, stmt);
    match result {
        Ok(()) => {
            conn.execute_batch(&format!("RELEASE {SAVEPOINT}"))?;
            Ok(())
        }
        Err(e) => {
            conn.execute_batch(&format!("ROLLBACK TO {SAVEPOINT}; RELEASE {SAVEPOINT}"))?;
            Err(e)
        }
    }
}

fn dispatch(conn: &Connection, stmt: &str) -> Result<()> {
    let upper = stmt.trim_start().to_ascii_uppercase();
    if upper.starts_with("CREATE TABLE") || upper.starts_with("CREATE TEMP TABLE") {
        create_table(conn, stmt)
    } else if upper.starts_with("ALTER TABLE") {
        alter::compile(conn, stmt)
    } else if upper.starts_with("CREATE UNIQUE INDEX") || upper.starts_with("CREATE INDEX") {
        create_index(conn, stmt)
    } else if upper.starts_with("DROP INDEX") {
        drop_index(conn, stmt)
    } else if upper.starts_with("DROP TABLE") {
        drop_table(conn, stmt)
    } else {
        Err(CrrError::Misuse(format!(
            "unrecognized statement kind: {}",
            stmt.split_whitespace().take(2).collect::<Vec<_>>().join(" ")
        )))
    }
}

/// Reject anything but a single statement. A conservative quote-aware scan:
/// splits on top-level `;`, trims whitespace/comments around each piece,
/// and errors if more than one non-empty piece remains.
fn single_statement(sql: &str) -> Result<&str> {
    let trimmed = sql.trim();
    let mut depth_single = false;
    let mut depth_double = false;
    let mut first_semi = None;
    for (i, ch) in trimmed.char_indices() {
        match ch {
            '\'' if !depth_double => depth_single = !depth_single,
            '"' if !depth_single => depth_double = !depth_double,
            ';' if !depth_single && !depth_double => {
                first_semi = Some(i);
                break;
            }
            _ => {}
        }
    }

    let (head, tail) = match first_semi {
        Some(i) => (&trimmed[..i], &trimmed[i + 1..]),
        None => (trimmed, ""),
    };

    if !tail.trim().is_empty() {
        return Err(CrrError::Misuse(
            "only a single DDL statement may be compiled at a time".to_string(),
        ));
    }
    if head.trim().is_empty() {
        return Err(CrrError::Misuse("empty statement".to_string()));
    }
    Ok(head.trim())
}

/// Pull the object name following a keyword phrase like `CREATE TABLE` or
/// `ON`, tolerating `IF NOT EXISTS` / `IF EXISTS` and a quoted identifier.
fn extract_name_after(stmt: &str, keyword: &str) -> Result<String> {
    let upper = stmt.to_ascii_uppercase();
    let kw_upper = keyword.to_ascii_uppercase();
    let pos = upper.find(&kw_upper).ok_or_else(|| {
        CrrError::Misuse(format!("expected `{keyword}` in statement: {stmt}"))
    })?;
    let mut rest = stmt[pos + keyword.len()..].trim_start();

    for guard in ["IF NOT EXISTS", "IF EXISTS"] {
        if rest.to_ascii_uppercase().starts_with(guard) {
            rest = rest[guard.len()..].trim_start();
        }
    }

    if rest.starts_with('"') {
        let end = rest[1..].find('"').ok_or_else(|| {
            CrrError::Misuse(format!("unterminated quoted identifier in: {stmt}"))
        })?;
        Ok(rest[1..=end].to_string())
    } else {
        let end = rest
            .find(|c: char| c.is_whitespace() || c == '(')
            .unwrap_or(rest.len());
        Ok(rest[..end].trim_end_matches(',').to_string())
    }
}

fn create_table(conn: &Connection, stmt: &str) -> Result<()> {
    let table_name = extract_name_after(stmt, "TABLE")?;

    conn.execute_batch(stmt)?;
    let info = tableinfo::introspect(conn, &table_name);
    conn.execute_batch(&format!("DROP TABLE {}", quote_ident(&table_name)))?;
    let info = info?;

    if info.pks.is_empty() {
        tracing::debug!(table = %table_name, "table has no declared primary key, falling back to rowid");
    }

    create_backing_tables(conn, &info)?;
    triggers::create_view_and_triggers(conn, &info)?;
    record_master_event(conn, &table_name, "create_table")?;
    Ok(())
}

/// Builds `T__crr` and `T__clock` from an already-introspected table shape.
/// Shared by [`create_table`] and [`crate::alter::add_column`] (which calls
/// it indirectly via [`triggers::create_view_and_triggers`] after altering
/// `T__crr` in place, so this is only reached from here).
fn create_backing_tables(conn: &Connection, info: &TableInfo) -> Result<()> {
    let pk_cols: Vec<String> = info.pks.clone();
    let effective_pks = info.effective_pk_columns();

    let mut crr_cols = column_definitions(&info.columns);
    let version_cols = info.with_version_columns();
    if !version_cols.is_empty() {
        crr_cols.push_str(",\n  ");
        crr_cols.push_str(&column_definitions(&version_cols));
    }
    let site_cols = info.with_site_columns();
    if !site_cols.is_empty() {
        crr_cols.push_str(",\n  ");
        crr_cols.push_str(&column_definitions(&site_cols));
    }
    // T__crr has no column named "rowid" (only SQLite's implicit alias), so a
    // PK-less table must omit this clause entirely rather than naming it —
    // the clock table's own PRIMARY KEY below is the one that legitimately
    // declares a real "rowid" column via effective_pk_definitions.
    let pk_clause = primary_key_clause(&pk_cols);
    let pk_suffix = if pk_clause.is_empty() {
        String::new()
    } else {
        format!(",\n  {pk_clause}")
    };

    let crr_sql = format!(
        "CREATE TABLE {crr} (\n  {cols},\n  \"__causal_length\" INTEGER NOT NULL DEFAULT 1,\n  \"__source\" INTEGER NOT NULL DEFAULT 0{pk_suffix}\n);",
        crr = quote_ident(&format!("{}__crr", info.name)),
        cols = crr_cols,
        pk_suffix = pk_suffix,
    );
    conn.execute_batch(&crr_sql)?;

    let clock_pk_cols = join_idents(&effective_pks, ", ");
    let clock_sql = format!(
        "CREATE TABLE {clock} (\n  {pk_defs},\n  \"site_id\" BLOB NOT NULL,\n  \"version\" INTEGER NOT NULL,\n  PRIMARY KEY ({clock_pk_cols}, \"site_id\")\n);",
        clock = quote_ident(&format!("{}__clock", info.name)),
        pk_defs = effective_pk_definitions(info, &pk_cols),
        clock_pk_cols = clock_pk_cols,
    );
    conn.execute_batch(&clock_sql)?;

    Ok(())
}

/// Column definitions for the clock table's key columns: the declared pk
/// columns' own types, or a single `INTEGER` `rowid` column when the table
/// has none.
fn effective_pk_definitions(info: &TableInfo, pk_cols: &[String]) -> String {
    if pk_cols.is_empty() {
        "\"rowid\" INTEGER NOT NULL".to_string()
    } else {
        column_definitions(
            &info
                .columns
                .iter()
                .filter(|c| pk_cols.contains(&c.name))
                .cloned()
                .collect::<Vec<_>>(),
        )
    }
}

fn drop_table(conn: &Connection, stmt: &str) -> Result<()> {
    let table_name = extract_name_after(stmt, "TABLE")?;
    triggers::drop_view_and_triggers(conn, &table_name)?;
    conn.execute_batch(&format!(
        "DROP TABLE IF EXISTS {crr}; DROP TABLE IF EXISTS {clock};",
        crr = quote_ident(&format!("{table_name}__crr")),
        clock = quote_ident(&format!("{table_name}__clock")),
    ))?;
    conn.execute(
        &format!("DELETE FROM {} WHERE table_name = ?1", quote_ident(crate::global::SCHEMA_TABLE)),
        [&table_name],
    )?;
    Ok(())
}

/// Rewrite `ON <table>` to target the backing CRR table. Predicate-filtered
/// (`WHERE ...`) indexes are rejected — a partial index over `T__crr` could
/// silently drop tombstoned rows from the index, which is never what a
/// caller indexing the logical table meant.
fn create_index(conn: &Connection, stmt: &str) -> Result<()> {
    let upper = stmt.to_ascii_uppercase();
    if upper.contains(" WHERE ") {
        return Err(CrrError::Misuse(
            "indexes with a WHERE filter predicate are not supported on CRR tables".to_string(),
        ));
    }

    let table_name = extract_name_after(stmt, "ON")?;
    let rewritten = replace_first(stmt, &table_name, &format!("{table_name}__crr"));
    conn.execute_batch(&rewritten)?;
    Ok(())
}

fn drop_index(conn: &Connection, stmt: &str) -> Result<()> {
    conn.execute_batch(stmt)?;
    Ok(())
}

fn replace_first(haystack: &str, needle: &str, replacement: &str) -> String {
    let quoted = quote_ident(needle);
    if let Some(pos) = haystack.find(&quoted) {
        let mut out = String::with_capacity(haystack.len() + replacement.len());
        out.push_str(&haystack[..pos]);
        out.push_str(&quote_ident(replacement));
        out.push_str(&haystack[pos + quoted.len()..]);
        out
    } else if let Some(pos) = haystack.find(needle) {
        let mut out = String::with_capacity(haystack.len() + replacement.len());
        out.push_str(&haystack[..pos]);
        out.push_str(replacement);
        out.push_str(&haystack[pos + needle.len()..]);
        out
    } else {
        haystack.to_string()
    }
}

fn record_master_event(conn: &Connection, table: &str, event: &str) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO {} (table_name, version, event) VALUES (?1, ?2, ?3)",
            quote_ident(crate::global::SCHEMA_TABLE)
        ),
        rusqlite::params![table, env!("CARGO_PKG_VERSION"), event],
    )?;
    Ok(())
}

pub(crate) fn recreate_view_and_triggers(conn: &Connection, info: &TableInfo) -> Result<()> {
    triggers::drop_view_and_triggers(conn, &info.name)?;
    triggers::create_view_and_triggers(conn, info)?;
    record_master_event(conn, &info.name, "alter_table")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn_with_bootstrap() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        let state = crate::global::bootstrap(&conn).unwrap();
        crate::global::register(&conn, state).unwrap();
        conn
    }

    #[test]
    fn rejects_multi_statement_input() {
        let conn = conn_with_bootstrap();
        let err = compile(&conn, "CREATE TABLE a (id INTEGER PRIMARY KEY); CREATE TABLE b (id INTEGER PRIMARY KEY);").unwrap_err();
        assert!(matches!(err, CrrError::Misuse(_)));
    }

    #[test]
    fn create_table_produces_backing_objects() {
        let conn = conn_with_bootstrap();
        compile(&conn, "CREATE TABLE todos (id INTEGER PRIMARY KEY, title TEXT)").unwrap();

        let crr_exists: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'todos__crr'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(crr_exists, 1);

        let view_exists: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'todos' AND type = 'view'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(view_exists, 1);
    }

    #[test]
    fn insert_through_view_is_readable_back() {
        let conn = conn_with_bootstrap();
        compile(&conn, "CREATE TABLE todos (id INTEGER PRIMARY KEY, title TEXT)").unwrap();
        conn.execute("INSERT INTO todos (id, title) VALUES (1, 'write tests')", [])
            .unwrap();

        let title: String = conn
            .query_row("SELECT title FROM todos WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(title, "write tests");
    }

    #[test]
    fn delete_hides_row_without_removing_it() {
        let conn = conn_with_bootstrap();
        compile(&conn, "CREATE TABLE todos (id INTEGER PRIMARY KEY, title TEXT)").unwrap();
        conn.execute("INSERT INTO todos (id, title) VALUES (1, 'x')", []).unwrap();
        conn.execute("DELETE FROM todos WHERE id = 1", []).unwrap();

        let visible: i64 = conn
            .query_row("SELECT COUNT(*) FROM todos WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(visible, 0);

        let backing: i64 = conn
            .query_row("SELECT COUNT(*) FROM todos__crr WHERE id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(backing, 1);
    }

    #[test]
    fn drop_table_removes_all_backing_objects() {
        let conn = conn_with_bootstrap();
        compile(&conn, "CREATE TABLE todos (id INTEGER PRIMARY KEY, title TEXT)").unwrap();
        compile(&conn, "DROP TABLE todos").unwrap();

        let remaining: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name LIKE 'todos%'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn create_index_targets_backing_table() {
        let conn = conn_with_bootstrap();
        compile(&conn, "CREATE TABLE todos (id INTEGER PRIMARY KEY, title TEXT)").unwrap();
        compile(&conn, "CREATE INDEX todos_title_idx ON todos (title)").unwrap();

        let target: String = conn
            .query_row(
                "SELECT tbl_name FROM sqlite_master WHERE name = 'todos_title_idx'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(target, "todos__crr");
    }

    /// A table with no declared primary key must still compile and round
    /// trip a write — `T__crr` has no `PRIMARY KEY` clause of its own, so it
    /// relies on SQLite's real implicit rowid rather than a column literally
    /// named `rowid`, which only the clock table declares.
    #[test]
    fn compiles_table_with_no_primary_key() {
        let conn = conn_with_bootstrap();
        compile(&conn, "CREATE TABLE notes (body TEXT)").unwrap();

        conn.execute("INSERT INTO notes (body) VALUES ('hello')", [])
            .unwrap();

        let body: String = conn
            .query_row("SELECT body FROM notes WHERE body = 'hello'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(body, "hello");

        let backing: i64 = conn
            .query_row("SELECT COUNT(*) FROM notes__crr", [], |r| r.get(0))
            .unwrap();
        assert_eq!(backing, 1);
    }

    #[test]
    fn rejects_partial_index() {
        let conn = conn_with_bootstrap();
        compile(&conn, "CREATE TABLE todos (id INTEGER PRIMARY KEY, title TEXT)").unwrap();
        let err = compile(&conn, "CREATE INDEX idx ON todos (title) WHERE title IS NOT NULL")
            .unwrap_err();
        assert!(matches!(err, CrrError::Misuse(_)));
    }
}
