//! Table introspection.
//!
//! Reads column, primary-key, and index metadata for a named table out of
//! the host engine's catalog (`PRAGMA table_info`, `PRAGMA index_list`,
//! `PRAGMA index_info`) and assembles it into a [`TableInfo`] the compiler
//! and trigger synthesizer consume. Nothing here executes DDL; it's read-only.

use rusqlite::Connection;

use crate::error::{CrrError, Result};

/// A user-declared column as read from `PRAGMA table_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub decl_type: String,
    pub not_null: bool,
    pub default_value: Option<String>,
}

/// Where an index came from, mirroring `PRAGMA index_list`'s `origin` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOrigin {
    /// Implicit index backing a `PRIMARY KEY` constraint.
    PrimaryKey,
    /// Implicit index backing a `UNIQUE` constraint.
    Unique,
    /// Explicit `CREATE INDEX` / `CREATE UNIQUE INDEX`.
    CreateIndex,
}

impl IndexOrigin {
    fn from_sqlite_code(code: &str) -> Self {
        match code {
            "pk" => IndexOrigin::PrimaryKey,
            "u" => IndexOrigin::Unique,
            _ => IndexOrigin::CreateIndex,
        }
    }
}

/// An index as read from `PRAGMA index_list` + `PRAGMA index_info`.
#[derive(Debug, Clone)]
pub struct IndexInfo {
    pub name: String,
    pub columns: Vec<String>,
    pub origin: IndexOrigin,
    /// `true` when the index carries a `WHERE` filter predicate
    /// (`PRAGMA index_list`'s `partial` flag). The compiler rejects these —
    /// see spec.md §4.D, "Indexes with predicate filters are rejected".
    pub partial: bool,
}

/// Everything the compiler and trigger synthesizer need to know about one
/// user table.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub name: String,
    /// All user-declared columns, in declaration order.
    pub columns: Vec<ColumnInfo>,
    /// Primary-key column names, in declared key order. Empty when the
    /// table has no declared primary key.
    pub pks: Vec<String>,
    pub indexes: Vec<IndexInfo>,
}

impl TableInfo {
    /// Non-primary-key columns, in declaration order.
    pub fn non_pk_columns(&self) -> impl Iterator<Item = &ColumnInfo> {
        self.columns.iter().filter(|c| !self.pks.contains(&c.name))
    }

    /// Primary-key columns, or SQLite's implicit `rowid` when none were
    /// declared. Every site that writes a pk-less table collapses onto the
    /// same single-column identity, matching `cfsqlite.c`'s `pksLen == 0`
    /// branch in `cfsql_createClockTable`.
    pub fn effective_pk_columns(&self) -> Vec<String> {
        if self.pks.is_empty() {
            vec!["rowid".to_string()]
        } else {
            self.pks.clone()
        }
    }

    /// For every non-pk column `c`, the synthetic `c__version INTEGER`
    /// column that the backing CRR table carries alongside it.
    pub fn with_version_columns(&self) -> Vec<ColumnInfo> {
        self.non_pk_columns()
            .map(|c| ColumnInfo {
                name: format!("{}__version", c.name),
                decl_type: "INTEGER".to_string(),
                not_null: false,
                default_value: None,
            })
            .collect()
    }

    /// For every non-pk column `c`, the synthetic `c__site_id BLOB` column
    /// recording which site's write last won that column. Needed to break
    /// ties between two peers that claim the same column version (spec.md
    /// §8 testable property 5: "ties resolve to the larger site-id") — the
    /// version alone can't express that, since a patch only ever improves on
    /// the stored version, never on the stored site.
    pub fn with_site_columns(&self) -> Vec<ColumnInfo> {
        self.non_pk_columns()
            .map(|c| ColumnInfo {
                name: format!("{}__site_id", c.name),
                decl_type: "BLOB".to_string(),
                not_null: false,
                default_value: None,
            })
            .collect()
    }

    /// Rename this `TableInfo` in place — used by the `CREATE TABLE`
    /// pipeline, which introspects a temporary table and then renames the
    /// result to the user-chosen table name (spec.md §4.D, step 2).
    pub fn renamed(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Introspect `table_name` and return its [`TableInfo`].
///
/// Failures (missing table, permission, malformed catalog row) come back as
/// [`CrrError::Introspection`] with the underlying engine message attached.
pub fn introspect(conn: &Connection, table_name: &str) -> Result<TableInfo> {
    let columns = read_columns(conn, table_name)?;
    let pks = read_primary_key(conn, table_name)?;
    let indexes = read_indexes(conn, table_name)?;

    Ok(TableInfo {
        name: table_name.to_string(),
        columns,
        pks,
        indexes,
    })
}

fn introspection_err(table: &str, source: rusqlite::Error) -> CrrError {
    CrrError::Introspection {
        table: table.to_string(),
        source,
    }
}

fn read_columns(conn: &Connection, table_name: &str) -> Result<Vec<ColumnInfo>> {
    let sql = format!("PRAGMA table_info({})", crate::ident::quote_ident(table_name));
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| introspection_err(table_name, e))?;

    let rows = stmt
        .query_map([], |row| {
            let name: String = row.get("name")?;
            let decl_type: String = row.get("type")?;
            let notnull: i64 = row.get("notnull")?;
            let default_value: Option<String> = row.get("dflt_value")?;
            Ok(ColumnInfo {
                name,
                decl_type,
                not_null: notnull != 0,
                default_value,
            })
        })
        .map_err(|e| introspection_err(table_name, e))?;

    let mut columns = Vec::new();
    for row in rows {
        columns.push(row.map_err(|e| introspection_err(table_name, e))?);
    }

    if columns.is_empty() {
        return Err(introspection_err(
            table_name,
            rusqlite::Error::QueryReturnedNoRows,
        ));
    }

    Ok(columns)
}

/// `PRAGMA table_info` numbers pk columns 1, 2, 3... in declared key order
/// (0 means "not part of the primary key"); this reconstructs that order.
fn read_primary_key(conn: &Connection, table_name: &str) -> Result<Vec<String>> {
    let sql = format!("PRAGMA table_info({})", crate::ident::quote_ident(table_name));
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| introspection_err(table_name, e))?;

    let rows = stmt
        .query_map([], |row| {
            let name: String = row.get("name")?;
            let pk: i64 = row.get("pk")?;
            Ok((pk, name))
        })
        .map_err(|e| introspection_err(table_name, e))?;

    let mut numbered = Vec::new();
    for row in rows {
        let (pk, name) = row.map_err(|e| introspection_err(table_name, e))?;
        if pk > 0 {
            numbered.push((pk, name));
        }
    }
    numbered.sort_by_key(|(pk, _)| *pk);
    Ok(numbered.into_iter().map(|(_, name)| name).collect())
}

fn read_indexes(conn: &Connection, table_name: &str) -> Result<Vec<IndexInfo>> {
    let sql = format!("PRAGMA index_list({})", crate::ident::quote_ident(table_name));
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| introspection_err(table_name, e))?;

    let rows = stmt
        .query_map([], |row| {
            let name: String = row.get("name")?;
            let origin: String = row.get("origin")?;
            let partial: i64 = row.get("partial")?;
            Ok((name, origin, partial != 0))
        })
        .map_err(|e| introspection_err(table_name, e))?;

    let mut indexes = Vec::new();
    for row in rows {
        let (name, origin, partial) = row.map_err(|e| introspection_err(table_name, e))?;
        let columns = read_index_columns(conn, &name)?;
        indexes.push(IndexInfo {
            name,
            columns,
            origin: IndexOrigin::from_sqlite_code(&origin),
            partial,
        });
    }
    Ok(indexes)
}

fn read_index_columns(conn: &Connection, index_name: &str) -> Result<Vec<String>> {
    let sql = format!("PRAGMA index_info({})", crate::ident::quote_ident(index_name));
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| introspection_err(index_name, e))?;

    let rows = stmt
        .query_map([], |row| row.get::<_, String>("name"))
        .map_err(|e| introspection_err(index_name, e))?;

    let mut columns = Vec::new();
    for row in rows {
        // A NULL name means the column is an expression, not a plain column
        // reference; skip it (arbitrary index expressions are out of scope,
        // spec.md §1 Non-goals).
        if let Ok(name) = row {
            columns.push(name);
        }
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn_with_table(sql: &str) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(sql).unwrap();
        conn
    }

    #[test]
    fn introspects_declared_pk() {
        let conn = conn_with_table("CREATE TABLE foo (a INTEGER PRIMARY KEY, b TEXT)");
        let info = introspect(&conn, "foo").unwrap();
        assert_eq!(info.pks, vec!["a".to_string()]);
        assert_eq!(info.columns.len(), 2);
    }

    #[test]
    fn introspects_composite_pk_in_declared_order() {
        let conn = conn_with_table(
            "CREATE TABLE foo (b TEXT, a INTEGER, c TEXT, PRIMARY KEY (c, a))",
        );
        let info = introspect(&conn, "foo").unwrap();
        assert_eq!(info.pks, vec!["c".to_string(), "a".to_string()]);
    }

    #[test]
    fn no_declared_pk_yields_empty_pks() {
        let conn = conn_with_table("CREATE TABLE foo (a INTEGER, b TEXT)");
        let info = introspect(&conn, "foo").unwrap();
        assert!(info.pks.is_empty());
        assert_eq!(info.effective_pk_columns(), vec!["rowid".to_string()]);
    }

    #[test]
    fn with_version_columns_skip_pk() {
        let conn = conn_with_table("CREATE TABLE foo (a INTEGER PRIMARY KEY, b TEXT, c TEXT)");
        let info = introspect(&conn, "foo").unwrap();
        let versions: Vec<_> = info.with_version_columns().into_iter().map(|c| c.name).collect();
        assert_eq!(versions, vec!["b__version".to_string(), "c__version".to_string()]);
    }

    #[test]
    fn missing_table_is_introspection_error() {
        let conn = Connection::open_in_memory().unwrap();
        let err = introspect(&conn, "nope").unwrap_err();
        assert!(matches!(err, CrrError::Introspection { .. }));
    }
}
