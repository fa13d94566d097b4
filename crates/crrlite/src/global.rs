//! Global per-database state: site identity and the logical database version.
//!
//! A site identifies itself with a random 16-byte id, generated once and
//! persisted in [`SITE_ID_TABLE`]. The database version is a monotone `i64`
//! counter, cached in memory and advanced by one on every commit that
//! touches a CRR-backed table. Bootstrap reconciles the cached value against
//! every `*__clock` table's high-water mark so a database opened from a
//! copy or after a crash never hands out a version it has already used.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, OptionalExtension};

use crate::error::Result;

/// Table holding this database's single 16-byte site identifier.
pub const SITE_ID_TABLE: &str = "__site_id";

/// Schema-versioning table recording which crrlite release last touched a
/// CRR-backed table, modeled on `crsql_master` — lets a future migration
/// tell "created by an older crrlite" apart from "hand-edited".
pub const SCHEMA_TABLE: &str = "crrlite_master";

/// No database version is ever below this; also the version handed to a
/// brand-new, never-synced database.
pub const MIN_POSSIBLE_DB_VERSION: i64 = 0;

/// In-memory cache of this connection's site identity and database version.
///
/// One instance is created per `Connection` by [`bootstrap`] and held by
/// the caller (typically inside the value returned from [`crate::init`]);
/// the scalar functions and commit hook registered alongside it close over
/// a clone of the `Arc`.
#[derive(Debug)]
pub struct GlobalState {
    site_id: [u8; 16],
    db_version: AtomicI64,
    /// Set by `crrlite_stamp_version()` whenever a view trigger stamps a
    /// write; cleared by the commit/rollback hooks. Lets the commit hook
    /// advance the version only for transactions that actually touched a
    /// CRR table, per spec.md §3 ("advanced by one on every successful
    /// write transaction that mutates at least one CRR").
    dirty: AtomicBool,
}

impl GlobalState {
    /// This connection's site id.
    pub fn site_id(&self) -> [u8; 16] {
        self.site_id
    }

    /// The current database version.
    pub fn db_version(&self) -> i64 {
        self.db_version.load(Ordering::SeqCst)
    }

    /// Atomically advance and return the new database version. Called from
    /// the commit hook, and by the trigger layer when it needs a version
    /// for a write happening outside an explicit transaction.
    pub fn next_db_version(&self) -> i64 {
        self.db_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The version a write happening *right now* will commit as: one past
    /// the last committed version. Triggers stamp every `__version` column
    /// and clock row with this value, not with [`Self::db_version`] — the
    /// commit hook hasn't advanced the cached counter yet when a trigger
    /// body runs, since it fires only once the whole statement has executed
    /// and the transaction is about to commit.
    fn pending_version(&self) -> i64 {
        self.db_version.load(Ordering::SeqCst) + 1
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Read and clear the dirty flag. Called from the commit hook (to
    /// decide whether to advance the counter) and the rollback hook (to
    /// make sure an aborted transaction's stamp doesn't leak into the next
    /// one).
    fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }

    /// Raise the cached version's floor to at least `incoming` without
    /// treating it as a local write (no commit-hook advance follows).
    /// Applying a peer's patch can carry a column version higher than
    /// anything this site has produced yet; without this a subsequent local
    /// write could stamp a version number a peer has already used.
    fn observe_version(&self, incoming: i64) {
        let mut current = self.db_version.load(Ordering::SeqCst);
        while incoming > current {
            match self.db_version.compare_exchange_weak(
                current,
                incoming,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }
}

/// Ensure [`SITE_ID_TABLE`] and [`SCHEMA_TABLE`] exist, load or generate the
/// site id, and reconcile the in-memory version counter against every
/// existing `*__clock` table before returning.
pub fn bootstrap(conn: &Connection) -> Result<Arc<GlobalState>> {
    ensure_tables(conn)?;
    let site_id = load_or_create_site_id(conn)?;
    let db_version = reconcile_db_version(conn, &site_id)?;

    tracing::info!(
        site_id = %hex(&site_id),
        db_version,
        "crrlite global state bootstrapped"
    );

    Ok(Arc::new(GlobalState {
        site_id,
        db_version: AtomicI64::new(db_version),
        dirty: AtomicBool::new(false),
    }))
}

fn ensure_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS \"{site}\" (site_id BLOB NOT NULL);
         CREATE TABLE IF NOT EXISTS \"{schema}\" (
             table_name TEXT NOT NULL PRIMARY KEY,
             version TEXT NOT NULL,
             event TEXT NOT NULL
         );",
        site = SITE_ID_TABLE,
        schema = SCHEMA_TABLE,
    ))?;
    Ok(())
}

fn load_or_create_site_id(conn: &Connection) -> Result<[u8; 16]> {
    let existing: Option<Vec<u8>> = conn
        .query_row(
            &format!("SELECT site_id FROM \"{}\" LIMIT 1", SITE_ID_TABLE),
            [],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(bytes) = existing {
        return Ok(to_array(&bytes));
    }

    let generated = *uuid::Uuid::new_v4().as_bytes();
    conn.execute(
        &format!("INSERT INTO \"{}\" (site_id) VALUES (?1)", SITE_ID_TABLE),
        [generated.to_vec()],
    )?;
    Ok(generated)
}

fn to_array(bytes: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    let n = bytes.len().min(16);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

/// Union the high-water mark of every `*__clock` table's `version` column,
/// restricted per spec.md §4.C to rows written by a site other than
/// `site_id` (bound once per union arm), with [`MIN_POSSIBLE_DB_VERSION`];
/// a database with no CRR tables yet starts at the floor. See DESIGN.md's
/// open-question notes for why this follows §4.C's literal filtered query
/// rather than §3's looser "max across all clock tables" framing.
fn reconcile_db_version(conn: &Connection, site_id: &[u8; 16]) -> Result<i64> {
    let clock_tables: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE '%\\_\\_clock' ESCAPE '\\'",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        names
    };

    if clock_tables.is_empty() {
        return Ok(MIN_POSSIBLE_DB_VERSION);
    }

    let union_sql = clock_tables
        .iter()
        .map(|t| format!("SELECT COALESCE(MAX(version), 0) AS v FROM \"{}\" WHERE site_id != ?", t))
        .collect::<Vec<_>>()
        .join(" UNION ALL ");
    let sql = format!("SELECT COALESCE(MAX(v), 0) FROM ({})", union_sql);

    let params = vec![site_id.to_vec(); clock_tables.len()];
    let max_version: i64 = conn.query_row(&sql, rusqlite::params_from_iter(params.iter()), |row| row.get(0))?;
    Ok(max_version.max(MIN_POSSIBLE_DB_VERSION))
}

fn hex(bytes: &[u8; 16]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Register the `site_id()` and `db_version()` scalar functions spec.md §6
/// names explicitly, plus the crate-internal `crrlite_stamp_version()` and
/// `crrlite_observe_version()` helpers the trigger SQL calls (unnamed by
/// spec — kept under a `crrlite_` prefix since nothing external ever
/// queries them), and the commit/rollback hooks that advance `state`'s
/// version counter by one on every commit that actually stamped a write.
pub fn register(conn: &Connection, state: Arc<GlobalState>) -> Result<()> {
    let site_state = Arc::clone(&state);
    conn.create_scalar_function(
        "site_id",
        0,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        move |_ctx| Ok(site_state.site_id().to_vec()),
    )?;

    let version_state = Arc::clone(&state);
    conn.create_scalar_function(
        "db_version",
        0,
        FunctionFlags::SQLITE_UTF8,
        move |_ctx| Ok(version_state.db_version()),
    )?;

    // Called once per column/clock-row value a view trigger stamps. Every
    // call within the same transaction returns the same number, since
    // nothing advances `db_version` until the commit hook runs.
    let stamp_state = Arc::clone(&state);
    conn.create_scalar_function(
        "crrlite_stamp_version",
        0,
        FunctionFlags::SQLITE_UTF8,
        move |_ctx| {
            stamp_state.mark_dirty();
            Ok(stamp_state.pending_version())
        },
    )?;

    // Called by the patch-insert trigger with the incoming column version;
    // always returns 1 so it can sit directly in a `__source = ...`
    // assignment without its own CASE arm.
    let observe_state = Arc::clone(&state);
    conn.create_scalar_function(
        "crrlite_observe_version",
        1,
        FunctionFlags::SQLITE_UTF8,
        move |ctx| {
            if let Some(incoming) = ctx.get::<Option<i64>>(0)? {
                observe_state.observe_version(incoming);
            }
            Ok(1i64)
        },
    )?;

    let commit_state = Arc::clone(&state);
    conn.commit_hook(Some(move || {
        if commit_state.take_dirty() {
            commit_state.next_db_version();
        }
        false
    }));

    let rollback_state = Arc::clone(&state);
    conn.rollback_hook(Some(move || {
        rollback_state.take_dirty();
    }));

    Ok(())
}
