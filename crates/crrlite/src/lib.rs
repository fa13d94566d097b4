//! crrlite — conflict-free replicated relations for embedded SQLite.
//!
//! Turns an ordinary table into a causally-versioned, mergeable replica: a
//! schema compiler ([`compiler`]) rewrites a `CREATE TABLE` into a backing
//! CRR table, a clock table, a user view and a patch view, wired together by
//! synthesized triggers ([`triggers`]); a logical clock ([`global`]) stamps
//! every write with a site id and a monotone database version; a virtual
//! table ([`changes`]) exposes the resulting mutations to a sync layer as an
//! ordered, deduplicated feed.
//!
//! This crate is the Rust-native rendition of a loadable SQLite extension:
//! instead of `sqlite3_auto_extension` against a generically-hosted engine,
//! [`init`] is called once per [`rusqlite::Connection`] the embedding
//! application opens, linking the same SQLite build (via `rusqlite`'s
//! bundled library) into the host process directly.

pub mod alter;
pub mod changes;
pub mod compiler;
pub mod error;
pub mod global;
pub mod ident;
pub mod tableinfo;
pub mod triggers;

use std::sync::Arc;

use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;

pub use error::{CrrError, Result};
pub use global::GlobalState;

/// Register everything crrlite adds to a connection: the `site_id()`
/// and `db_version()` scalar functions and the commit hook that
/// advances the cached version ([`global::register`]), the `compile`
/// scalar function wrapping [`compiler::compile`], and the `changes`
/// virtual table module ([`changes::register`]).
///
/// Mirrors spec component G: the host-engine entry point that a loadable
/// extension's `sqlite3_*_init` would perform, done here as an ordinary
/// function call against an already-open connection rather than a dynamic
/// load. Must be called once per connection before compiling any CRR table
/// or querying `changes`; calling it twice on the same connection is
/// harmless (bootstrap is idempotent) but registers the functions/module a
/// second time, which `rusqlite` allows by overwriting the prior
/// registration.
pub fn init(conn: &Connection) -> Result<Arc<GlobalState>> {
    let state = global::bootstrap(conn)?;
    global::register(conn, Arc::clone(&state))?;
    register_compile(conn)?;
    changes::register(conn, Arc::clone(&state))?;

    tracing::info!("crrlite initialized on connection");
    Ok(state)
}

/// `compile(sql_text)` — the single-statement DDL entry point
/// described in spec.md §4.D. Registered `SQLITE_DIRECTONLY` because running
/// arbitrary schema-mutating SQL from inside a trigger or view body would be
/// exactly the kind of reentrant mess the flag exists to forbid.
fn register_compile(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        "compile",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DIRECTONLY,
        move |ctx| {
            let sql: String = ctx.get(0)?;
            // SAFETY: `get_connection` hands back a non-owning `Connection`
            // wrapping the same handle the scalar function is already
            // executing on; it's dropped before this closure returns and
            // never outlives the call.
            let inner = unsafe { ctx.get_connection()? };
            compiler::compile(&inner, &sql)
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
            Ok(true)
        },
    )?;
    Ok(())
}
