//! The `changes` virtual table: a scannable feed of pending
//! mutations across every CRR-backed table, filtered by requestor site and
//! a `curr_version` watermark — the surface a sync layer drains to find out
//! what a peer hasn't yet observed.
//!
//! One row per `(table, primary key)` that a non-requestor site touched
//! after the watermark, carrying the row's live column values and their
//! per-column versions as JSON objects. A tombstoned row (even causal
//! length) emits a distinguished `{"__tombstone": true}` payload in place of
//! `col_vals` rather than its last-known values, matching spec.md §4.F's
//! "distinguished payload indicating tombstone" (an explicitly open payload
//! format — this is the decision recorded for it, see DESIGN.md).

use std::sync::Arc;

use rusqlite::vtab::{
    eponymous_only_module, Context, IndexConstraintOp, IndexInfo, VTab, VTabConnection,
    VTabCursor, VTabKind, Values,
};
use rusqlite::{Connection, Error as SqliteError, OptionalExtension};

use crate::global::GlobalState;
use crate::ident::quote_ident;
use crate::tableinfo::{self, TableInfo};

const MODULE_NAME: &str = "changes";

/// Register the `changes` eponymous-only virtual table module.
pub fn register(conn: &Connection, state: Arc<GlobalState>) -> rusqlite::Result<()> {
    conn.create_module(MODULE_NAME, eponymous_only_module::<ChangesTab>(), Some(state))
}

struct ChangesTab {
    state: Arc<GlobalState>,
    /// A non-owning handle onto the same connection the module was
    /// registered on, recovered from the raw handle SQLite hands `connect`
    /// (spec.md §4.F: the cursor scans the clock tables directly, so it
    /// needs the connection, not just the cached version state).
    conn: Connection,
}

#[derive(Debug, Clone)]
struct ChangeRow {
    table: String,
    pk: String,
    col_vals: String,
    col_versions: String,
    curr_version: i64,
    min_version: i64,
}

/// Column ordinals for the schema declared in [`ChangesTab::connect`],
/// matching spec.md §6 exactly: `table, pk, col_vals, col_versions,
/// curr_version, requestor HIDDEN`.
mod col {
    pub const TABLE: usize = 0;
    pub const PK: usize = 1;
    pub const COL_VALS: usize = 2;
    pub const COL_VERSIONS: usize = 3;
    pub const CURR_VERSION: usize = 4;
    pub const REQUESTOR: usize = 5;
}

/// Bit 1: a `curr_version >` constraint was supplied. Bit 2: a `requestor =`
/// constraint was supplied. Spec.md §4.F: "Encode which constraints were
/// supplied in an integer index mask".
const MASK_VERSION: i32 = 1;
const MASK_REQUESTOR: i32 = 2;

unsafe impl<'vtab> VTab<'vtab> for ChangesTab {
    type Aux = Arc<GlobalState>;
    type Cursor = ChangesCursor<'vtab>;

    fn connect(
        db: &mut VTabConnection,
        aux: Option<&Self::Aux>,
        _args: &[&[u8]],
    ) -> rusqlite::Result<(String, Self)> {
        let schema = "CREATE TABLE x(
            \"table\" TEXT,
            \"pk\" TEXT,
            \"col_vals\" TEXT,
            \"col_versions\" TEXT,
            \"curr_version\" INTEGER,
            \"requestor\" BLOB HIDDEN
        )"
        .to_string();

        let state = aux
            .cloned()
            .ok_or_else(|| SqliteError::ModuleError("changes requires global state".into()))?;

        // SAFETY: the handle SQLite passes to xConnect outlives this module
        // registration (it's the same connection the module was created
        // on); `Connection::from_handle` wraps it without taking ownership,
        // so dropping this non-owning handle never closes it.
        let conn = unsafe { Connection::from_handle(db.db()) }?;

        Ok((schema, ChangesTab { state, conn }))
    }

    /// Four cost tiers exactly as spec.md §4.F lays them out: both
    /// constraints present is cheapest, `curr_version` alone is next,
    /// `requestor` alone or neither are effectively unusable (still
    /// correct, just an unfiltered full scan of every clock table).
    fn best_index(&self, info: &mut IndexInfo) -> rusqlite::Result<()> {
        let mut version_arg = None;
        let mut requestor_arg = None;

        for (i, constraint) in info.constraints().enumerate() {
            if !constraint.is_usable() {
                continue;
            }
            match (constraint.column(), constraint.operator()) {
                (col::CURR_VERSION, IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_GT) => {
                    version_arg = Some(i);
                }
                (col::REQUESTOR, IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_EQ) => {
                    requestor_arg = Some(i);
                }
                _ => {}
            }
        }

        let mut mask = 0;
        if version_arg.is_some() {
            mask |= MASK_VERSION;
        }
        if requestor_arg.is_some() {
            mask |= MASK_REQUESTOR;
        }

        // Fixed argv slots regardless of constraint iteration order, so
        // `filter` can rely on "version first (if present), then requestor"
        // instead of whatever order SQLite happened to list constraints in.
        let version_argv = version_arg.map(|_| 1);
        let requestor_argv = requestor_arg.map(|_| if version_arg.is_some() { 2 } else { 1 });

        let mut usage_iter = info.constraint_usage_iter();
        for (i, _constraint) in info.constraints().enumerate() {
            let Some(mut usage) = usage_iter.next() else {
                continue;
            };
            if Some(i) == version_arg {
                usage.set_argv_index(version_argv.unwrap());
                usage.set_omit(true);
            } else if Some(i) == requestor_arg {
                usage.set_argv_index(requestor_argv.unwrap());
                usage.set_omit(true);
            } else {
                usage.set_omit(false);
            }
        }

        info.set_idx_num(mask);
        let cost = match mask {
            m if m == MASK_VERSION | MASK_REQUESTOR => 1.0,
            MASK_VERSION => 10.0,
            _ => f64::MAX,
        };
        info.set_estimated_cost(cost);
        info.set_estimated_rows(if mask & MASK_REQUESTOR != 0 { 100 } else { 100_000 });
        Ok(())
    }

    fn open(&mut self) -> rusqlite::Result<Self::Cursor> {
        Ok(ChangesCursor::new(&self.state, &self.conn))
    }
}

impl rusqlite::vtab::CreateVTab<'_> for ChangesTab {
    const KIND: VTabKind = VTabKind::Eponymous;
}

struct ChangesCursor<'vtab> {
    #[allow(dead_code)]
    state: &'vtab GlobalState,
    conn: &'vtab Connection,
    rows: Vec<ChangeRow>,
    pos: usize,
    rowid: i64,
}

impl<'vtab> ChangesCursor<'vtab> {
    fn new(state: &'vtab GlobalState, conn: &'vtab Connection) -> Self {
        ChangesCursor {
            state,
            conn,
            rows: Vec::new(),
            pos: 0,
            rowid: 0,
        }
    }
}

unsafe impl VTabCursor for ChangesCursor<'_> {
    fn filter(
        &mut self,
        idx_num: std::os::raw::c_int,
        _idx_str: Option<&str>,
        args: &Values<'_>,
    ) -> rusqlite::Result<()> {
        let mask = idx_num as i32;
        let mut values = args.iter();

        // Argument order matches the order `best_index` assigned argv
        // indices in: version constraint first (if present), then
        // requestor — see the `argv` counter in `best_index`.
        let mut since_version = crate::global::MIN_POSSIBLE_DB_VERSION;
        let mut requestor: Option<Vec<u8>> = None;

        if mask & MASK_VERSION != 0 {
            if let Some(v) = values.next() {
                since_version = v.as_i64().unwrap_or(since_version);
            }
        }
        if mask & MASK_REQUESTOR != 0 {
            if let Some(v) = values.next() {
                requestor = v.as_blob().ok().map(|b| b.to_vec());
            }
        }

        self.rows = collect_changes(self.conn, requestor.as_deref(), since_version)
            .unwrap_or_default();
        self.pos = 0;
        self.rowid = 0;
        Ok(())
    }

    fn next(&mut self) -> rusqlite::Result<()> {
        self.pos += 1;
        self.rowid += 1;
        Ok(())
    }

    fn eof(&self) -> bool {
        self.pos >= self.rows.len()
    }

    fn column(&self, ctx: &mut Context, i: std::os::raw::c_int) -> rusqlite::Result<()> {
        let row = &self.rows[self.pos];
        match i as usize {
            col::TABLE => ctx.set_result(&row.table),
            col::PK => ctx.set_result(&row.pk),
            col::COL_VALS => ctx.set_result(&row.col_vals),
            col::COL_VERSIONS => ctx.set_result(&row.col_versions),
            col::CURR_VERSION => ctx.set_result(&row.curr_version),
            _ => ctx.set_result(&rusqlite::types::Value::Null),
        }
    }

    fn rowid(&self) -> rusqlite::Result<i64> {
        Ok(self.rowid)
    }
}

/// Scan every `*__clock` table for rows written by a site other than
/// `requestor` at a version greater than `since_version`, group by primary
/// key (spec.md §4.F's per-table change query), then join back to the
/// corresponding `*__crr` row to build the JSON payload. Rows are returned
/// in `(min_version, table)` order — spec.md §4.F / §5's ordering guarantee.
fn collect_changes(
    conn: &Connection,
    requestor: Option<&[u8]>,
    since_version: i64,
) -> rusqlite::Result<Vec<ChangeRow>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE '%\\_\\_clock' ESCAPE '\\'",
    )?;
    let clock_tables: Vec<String> = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut rows = Vec::new();
    for clock_table in clock_tables {
        let table_name = clock_table.trim_end_matches("__clock").to_string();
        let info = match tableinfo::introspect(conn, &table_name) {
            Ok(info) => info,
            Err(_) => continue,
        };
        rows.extend(table_changes(conn, &info, requestor, since_version)?);
    }

    rows.sort_by(|a, b| {
        a.min_version
            .cmp(&b.min_version)
            .then_with(|| a.table.cmp(&b.table))
    });
    Ok(rows)
}

fn table_changes(
    conn: &Connection,
    info: &TableInfo,
    requestor: Option<&[u8]>,
    since_version: i64,
) -> rusqlite::Result<Vec<ChangeRow>> {
    let pk_cols = info.effective_pk_columns();
    let clock_table = quote_ident(&format!("{}__clock", info.name));

    let pk_select_cols = pk_cols
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    // `quote()`-wrapped, `~`-joined primary key, as `changes-since-vtab.c`'s
    // `cfsql_changeQueryForTable` does it, so values carrying the separator
    // (or NULLs) round-trip unambiguously — spec.md §6's "quote-concatenated
    // primary key values, `~` delimiter".
    let pk_label_expr = pk_cols
        .iter()
        .map(|c| format!("quote({})", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(" || '~' || ");

    let where_clause = match requestor {
        Some(_) => "\"site_id\" != ?1 AND \"version\" > ?2",
        None => "\"version\" > ?1",
    };

    let sql = format!(
        "SELECT {pk_select_cols}, {pk_label_expr} AS pk_label, MIN(\"version\") AS min_v
         FROM {clock_table}
         WHERE {where_clause}
         GROUP BY pk_label",
    );

    let mut stmt = conn.prepare(&sql)?;
    let pk_count = pk_cols.len();

    struct GroupRow {
        pk_values: Vec<rusqlite::types::Value>,
        pk_label: String,
        min_version: i64,
    }

    let group_rows: Vec<GroupRow> = {
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<GroupRow> {
            let mut pk_values = Vec::with_capacity(pk_count);
            for j in 0..pk_count {
                pk_values.push(row.get::<_, rusqlite::types::Value>(j)?);
            }
            let pk_label: String = row.get(pk_count)?;
            let min_version: i64 = row.get(pk_count + 1)?;
            Ok(GroupRow { pk_values, pk_label, min_version })
        };

        let rows = match requestor {
            Some(site) => stmt.query_map(rusqlite::params![site, since_version], map_row)?,
            None => stmt.query_map(rusqlite::params![since_version], map_row)?,
        };
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    let mut out = Vec::with_capacity(group_rows.len());
    for group in group_rows {
        if let Some(row) = crr_row_payload(conn, info, &pk_cols, &group.pk_values, &group.pk_label, group.min_version)? {
            out.push(row);
        }
    }
    Ok(out)
}

fn crr_row_payload(
    conn: &Connection,
    info: &TableInfo,
    pk_cols: &[String],
    pk_values: &[rusqlite::types::Value],
    pk_label: &str,
    min_version: i64,
) -> rusqlite::Result<Option<ChangeRow>> {
    let crr_table = quote_ident(&format!("{}__crr", info.name));
    let where_pk = pk_cols
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ?{}", quote_ident(c), i + 1))
        .collect::<Vec<_>>()
        .join(" AND ");

    let non_pk: Vec<_> = info.non_pk_columns().cloned().collect();
    let mut select_cols = vec!["\"__causal_length\"".to_string()];
    for c in &non_pk {
        select_cols.push(quote_ident(&c.name));
        select_cols.push(quote_ident(&format!("{}__version", c.name)));
        select_cols.push(quote_ident(&format!("{}__site_id", c.name)));
    }

    let sql = format!(
        "SELECT {} FROM {} WHERE {}",
        select_cols.join(", "),
        crr_table,
        where_pk
    );
    let mut stmt = conn.prepare(&sql)?;
    let params = rusqlite::params_from_iter(pk_values.iter());
    let found = stmt.query_row(params, |row| {
        let causal_length: i64 = row.get(0)?;
        let mut values = Vec::with_capacity(non_pk.len());
        for (j, c) in non_pk.iter().enumerate() {
            let value: rusqlite::types::Value = row.get(1 + j * 3)?;
            let version: Option<i64> = row.get(2 + j * 3)?;
            let site: Option<Vec<u8>> = row.get(3 + j * 3)?;
            values.push((c.name.clone(), value, version.unwrap_or(0), site));
        }
        Ok((causal_length, values))
    });

    let (causal_length, values) = match found.optional()? {
        Some(v) => v,
        // A clock row with no matching backing row is an invariant
        // violation (spec.md §7's "clock table observed without matching
        // CRR", an open issue surfaced as an engine error elsewhere); here
        // we simply drop the row from the feed rather than fail the whole
        // scan for every other table.
        None => return Ok(None),
    };

    let tombstoned = causal_length % 2 == 0;
    let mut curr_version = causal_length.max(min_version);

    // Each `col_versions` entry carries not just the version but the site
    // that currently owns it, `{"version": N, "site": "<hex>"}` — a
    // receiving replica needs the owner to resolve a tie against its own
    // stored version the same way the source replica already did (spec.md
    // §9's open question on `col_vals`/`col_versions` payload shape doesn't
    // pin this down; carrying the site is this crate's resolution, recorded
    // in DESIGN.md).
    let (col_vals, col_versions) = if tombstoned {
        ("{\"__tombstone\":true}".to_string(), "{}".to_string())
    } else {
        let mut vals = serde_json::Map::with_capacity(values.len());
        let mut vers = serde_json::Map::with_capacity(values.len());
        for (name, value, version, site) in &values {
            vals.insert(name.clone(), value_to_json(value));
            let site_hex = site.as_deref().map(hex_encode).unwrap_or_default();
            vers.insert(
                name.clone(),
                serde_json::json!({ "version": version, "site": site_hex }),
            );
            curr_version = curr_version.max(*version);
        }
        (
            serde_json::Value::Object(vals).to_string(),
            serde_json::Value::Object(vers).to_string(),
        )
    };

    Ok(Some(ChangeRow {
        table: info.name.clone(),
        pk: pk_label.to_string(),
        col_vals,
        col_versions,
        curr_version,
        min_version,
    }))
}

fn value_to_json(value: &rusqlite::types::Value) -> serde_json::Value {
    use rusqlite::types::Value;
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Integer(i) => serde_json::Value::from(*i),
        Value::Real(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::Blob(b) => serde_json::Value::String(hex_encode(b)),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
