//! Synthesizes the user-facing view, the patch-application view, and the
//! `INSTEAD OF` triggers that give a CRR-backed table its read/write surface.
//!
//! Three pieces sit on top of every backing `T__crr` table:
//!
//! - a view named after the original table (`T`), selecting only live rows
//!   (odd `__causal_length`) and hiding the `__version`/causal-length
//!   bookkeeping columns;
//! - `T__ins` / `T__upd` / `T__del`, `INSTEAD OF` triggers on that view
//!   translating ordinary DML into versioned writes against `T__crr` and
//!   `T__clock`;
//! - a patch-application view `T__patch` with a single `T__patch_ins`
//!   trigger that merges one incoming `(column, value, version, site)` patch
//!   at a time, last-writer-wins per column.

use rusqlite::Connection;

use crate::error::Result;
use crate::ident::{join_with, quote_ident};
use crate::tableinfo::TableInfo;

/// The distinguished `col_name` a patch uses to carry a causal-length
/// update with no associated column value — a pure create/delete/resurrect
/// marker, for rows whose only columns are primary-key columns.
pub const SENTINEL_COLUMN: &str = "__crr_sentinel";

fn crr_table(table: &str) -> String {
    format!("{table}__crr")
}

fn clock_table(table: &str) -> String {
    format!("{table}__clock")
}

fn patch_view(table: &str) -> String {
    format!("{table}__patch")
}

/// `"a" = NEW."a" AND "b" = NEW."b"`, the row-identity predicate used
/// throughout the generated triggers.
fn pk_match_clause(pks: &[String], alias: &str) -> String {
    join_with(pks, " AND ", |c| {
        format!("{} = {}.{}", quote_ident(c), alias, quote_ident(c))
    })
}

/// Create the user view, the patch view, and all four triggers for `info`.
/// Assumes `T__crr` and `T__clock` already exist (the compiler creates those
/// first) and runs inside the caller's savepoint.
pub fn create_view_and_triggers(conn: &Connection, info: &TableInfo) -> Result<()> {
    conn.execute_batch(&user_view_sql(info))?;
    conn.execute_batch(&patch_view_sql(info))?;
    conn.execute_batch(&insert_trigger_sql(info))?;
    conn.execute_batch(&update_trigger_sql(info))?;
    conn.execute_batch(&delete_trigger_sql(info))?;
    conn.execute_batch(&patch_insert_trigger_sql(info))?;
    Ok(())
}

/// Drop the view, patch view, and all four triggers for `table`. Leaves
/// `T__crr` and `T__clock` untouched — callers that want those gone too
/// (full `DROP TABLE`) drop them separately.
pub fn drop_view_and_triggers(conn: &Connection, table: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "DROP TRIGGER IF EXISTS {ins};
         DROP TRIGGER IF EXISTS {upd};
         DROP TRIGGER IF EXISTS {del};
         DROP TRIGGER IF EXISTS {patch_ins};
         DROP VIEW IF EXISTS {patch_view};
         DROP VIEW IF EXISTS {view};",
        ins = quote_ident(&format!("{table}__ins")),
        upd = quote_ident(&format!("{table}__upd")),
        del = quote_ident(&format!("{table}__del")),
        patch_ins = quote_ident(&format!("{table}__patch_ins")),
        patch_view = quote_ident(&patch_view(table)),
        view = quote_ident(table),
    ))?;
    Ok(())
}

fn user_view_sql(info: &TableInfo) -> String {
    let cols = info
        .columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "CREATE VIEW {view} AS SELECT {cols} FROM {crr} WHERE ({crr_alias}.\"__causal_length\" % 2) = 1;",
        view = quote_ident(&info.name),
        cols = cols,
        crr = quote_ident(&crr_table(&info.name)),
        crr_alias = quote_ident(&crr_table(&info.name)),
    )
}

/// A patch names a target row, one column (or the sentinel), the value and
/// the writer's claim about its version, plus the writer's site id. The
/// `WHERE 0` body makes it queryable-but-always-empty, matching the
/// `CREATE VIEW ... AS SELECT ... WHERE 0` idiom used for insert-only views.
fn patch_view_sql(info: &TableInfo) -> String {
    let pk_cols = join_with(&info.pks, ", ", |c| quote_ident(c));
    format!(
        "CREATE VIEW {view} ({pk_cols}, \"col_name\", \"col_value\", \"col_version\", \"site_id\", \"causal_length\") AS
         SELECT {pk_select}, NULL, NULL, NULL, NULL, NULL FROM {crr} WHERE 0;",
        view = quote_ident(&patch_view(&info.name)),
        pk_cols = pk_cols,
        pk_select = join_with(&info.pks, ", ", |c| quote_ident(c)),
        crr = quote_ident(&crr_table(&info.name)),
    )
}

fn insert_trigger_sql(info: &TableInfo) -> String {
    let pk_names = join_with(&info.pks, ", ", |c| quote_ident(c));
    let pk_values = join_with(&info.pks, ", ", |c| format!("NEW.{}", quote_ident(c)));

    let value_cols = info
        .non_pk_columns()
        .map(|c| quote_ident(&c.name))
        .chain(info.non_pk_columns().map(|c| quote_ident(&format!("{}__version", c.name))))
        .chain(info.non_pk_columns().map(|c| quote_ident(&format!("{}__site_id", c.name))))
        .collect::<Vec<_>>()
        .join(", ");
    let value_exprs = info
        .non_pk_columns()
        .map(|c| format!("NEW.{}", quote_ident(&c.name)))
        .chain(info.non_pk_columns().map(|_| "crrlite_stamp_version()".to_string()))
        .chain(info.non_pk_columns().map(|_| "site_id()".to_string()))
        .collect::<Vec<_>>()
        .join(", ");

    let conflict_set = info
        .non_pk_columns()
        .map(|c| {
            format!(
                "{col} = excluded.{col}, {ver} = excluded.{ver}, {site} = excluded.{site}",
                col = quote_ident(&c.name),
                ver = quote_ident(&format!("{}__version", c.name)),
                site = quote_ident(&format!("{}__site_id", c.name)),
            )
        })
        .chain(std::iter::once(
            "\"__causal_length\" = \"__causal_length\" + 1, \"__source\" = 0".to_string(),
        ))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "CREATE TRIGGER {trig} INSTEAD OF INSERT ON {view} BEGIN
           INSERT INTO {crr} ({pk_names}, {value_cols}, \"__causal_length\", \"__source\")
           VALUES ({pk_values}, {value_exprs}, 1, 0)
           ON CONFLICT ({pk_names}) DO UPDATE SET {conflict_set};

           INSERT INTO {clock} ({pk_names}, \"site_id\", \"version\")
           VALUES ({pk_values}, site_id(), crrlite_stamp_version())
           ON CONFLICT ({pk_names}, \"site_id\") DO UPDATE SET \"version\" = excluded.\"version\";
         END;",
        trig = quote_ident(&format!("{}__ins", info.name)),
        view = quote_ident(&info.name),
        crr = quote_ident(&crr_table(&info.name)),
        clock = quote_ident(&clock_table(&info.name)),
        pk_names = pk_names,
        pk_values = pk_values,
        value_cols = value_cols,
        value_exprs = value_exprs,
        conflict_set = conflict_set,
    )
}

/// Only columns whose `NEW` value actually differs from the view's current
/// value get a fresh version — an unrelated column touched by the same
/// `UPDATE` statement keeps its existing clock value.
fn update_trigger_sql(info: &TableInfo) -> String {
    let pk_names = join_with(&info.pks, ", ", |c| quote_ident(c));
    let pk_values = join_with(&info.pks, ", ", |c| format!("NEW.{}", quote_ident(c)));
    let where_old = pk_match_clause(&info.pks, "OLD");

    let set_clause = info
        .non_pk_columns()
        .flat_map(|c| {
            let col = quote_ident(&c.name);
            let ver = quote_ident(&format!("{}__version", c.name));
            let site = quote_ident(&format!("{}__site_id", c.name));
            vec![
                format!(
                    "{col} = CASE WHEN NEW.{col} IS NOT OLD.{col} THEN NEW.{col} ELSE {col} END",
                    col = col
                ),
                format!(
                    "{ver} = CASE WHEN NEW.{col} IS NOT OLD.{col} THEN crrlite_stamp_version() ELSE {ver} END",
                    col = col,
                    ver = ver
                ),
                format!(
                    "{site} = CASE WHEN NEW.{col} IS NOT OLD.{col} THEN site_id() ELSE {site} END",
                    col = col,
                    site = site
                ),
            ]
        })
        .chain(std::iter::once("\"__source\" = 0".to_string()))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "CREATE TRIGGER {trig} INSTEAD OF UPDATE ON {view} BEGIN
           UPDATE {crr} SET {set_clause} WHERE {where_old};

           INSERT INTO {clock} ({pk_names}, \"site_id\", \"version\")
           VALUES ({pk_values}, site_id(), crrlite_stamp_version())
           ON CONFLICT ({pk_names}, \"site_id\") DO UPDATE SET \"version\" = excluded.\"version\";
         END;",
        trig = quote_ident(&format!("{}__upd", info.name)),
        view = quote_ident(&info.name),
        crr = quote_ident(&crr_table(&info.name)),
        clock = quote_ident(&clock_table(&info.name)),
        pk_names = pk_names,
        pk_values = pk_values,
        where_old = where_old,
        set_clause = set_clause,
    )
}

/// A `DELETE` never removes the backing row — it advances
/// `__causal_length` to the next even number, flipping the row's
/// tombstone parity so the user view stops returning it while the clock
/// keeps the history other sites need to converge.
fn delete_trigger_sql(info: &TableInfo) -> String {
    let pk_names = join_with(&info.pks, ", ", |c| quote_ident(c));
    let pk_values = join_with(&info.pks, ", ", |c| format!("OLD.{}", quote_ident(c)));
    let where_old = pk_match_clause(&info.pks, "OLD");

    format!(
        "CREATE TRIGGER {trig} INSTEAD OF DELETE ON {view} BEGIN
           UPDATE {crr}
           SET \"__causal_length\" = \"__causal_length\" + 1,
               \"__source\" = 0
           WHERE {where_old};

           INSERT INTO {clock} ({pk_names}, \"site_id\", \"version\")
           VALUES ({pk_values}, site_id(), crrlite_stamp_version())
           ON CONFLICT ({pk_names}, \"site_id\") DO UPDATE SET \"version\" = excluded.\"version\";
         END;",
        trig = quote_ident(&format!("{}__del", info.name)),
        view = quote_ident(&info.name),
        crr = quote_ident(&crr_table(&info.name)),
        clock = quote_ident(&clock_table(&info.name)),
        pk_names = pk_names,
        pk_values = pk_values,
        where_old = where_old,
    )
}

/// Merges one incoming patch row. A patch names either an ordinary column
/// (applied if `col_version` beats the stored version) or
/// [`SENTINEL_COLUMN`] (applied to `__causal_length` the same way).
/// Ties — equal incoming and stored versions — resolve to the larger
/// site-id (spec.md §8 testable property 5; §9 notes this isn't explicit in
/// the original source but is the rule the distilled spec commits to), which
/// is why every column also carries a `__site_id` alongside its `__version`:
/// without it there'd be nothing to compare once versions tie. Runs with
/// `__source = 1` so a future local trigger could tell a peer-applied
/// write apart from one made through the user view.
fn patch_insert_trigger_sql(info: &TableInfo) -> String {
    let pk_names = join_with(&info.pks, ", ", |c| quote_ident(c));
    let pk_values = join_with(&info.pks, ", ", |c| format!("NEW.{}", quote_ident(c)));
    let where_pk = pk_match_clause(&info.pks, "NEW");

    let mut set_parts = Vec::new();
    for c in info.non_pk_columns() {
        let col = quote_ident(&c.name);
        let ver = quote_ident(&format!("{}__version", c.name));
        let site = quote_ident(&format!("{}__site_id", c.name));
        let wins = format!(
            "(NEW.\"col_name\" = '{name}' AND (NEW.\"col_version\" > COALESCE({ver}, -1) \
              OR (NEW.\"col_version\" = COALESCE({ver}, -1) AND NEW.\"site_id\" > COALESCE({site}, X'00'))))",
            name = c.name, ver = ver, site = site
        );
        set_parts.push(format!(
            "{col} = CASE WHEN {wins} THEN NEW.\"col_value\" ELSE {col} END",
            col = col, wins = wins
        ));
        set_parts.push(format!(
            "{ver} = CASE WHEN {wins} THEN NEW.\"col_version\" ELSE {ver} END",
            ver = ver, wins = wins
        ));
        set_parts.push(format!(
            "{site} = CASE WHEN {wins} THEN NEW.\"site_id\" ELSE {site} END",
            site = site, wins = wins
        ));
    }
    set_parts.push(format!(
        "\"__causal_length\" = CASE WHEN NEW.\"col_name\" = '{sentinel}' AND NEW.\"causal_length\" > \"__causal_length\" THEN NEW.\"causal_length\" ELSE \"__causal_length\" END",
        sentinel = SENTINEL_COLUMN,
    ));
    set_parts.push(
        "\"__source\" = crrlite_observe_version(COALESCE(NEW.\"col_version\", NEW.\"causal_length\"))"
            .to_string(),
    );
    let set_clause = set_parts.join(", ");

    format!(
        "CREATE TRIGGER {trig} INSTEAD OF INSERT ON {view} BEGIN
           INSERT INTO {crr} ({pk_names}, \"__causal_length\", \"__source\") VALUES ({pk_values}, 1, 1)
           ON CONFLICT ({pk_names}) DO NOTHING;

           UPDATE {crr} SET {set_clause} WHERE {where_pk};

           INSERT INTO {clock} ({pk_names}, \"site_id\", \"version\")
           VALUES ({pk_values}, NEW.\"site_id\", COALESCE(NEW.\"col_version\", NEW.\"causal_length\", 0))
           ON CONFLICT ({pk_names}, \"site_id\") DO UPDATE SET
             \"version\" = MAX(\"version\", excluded.\"version\");
         END;",
        trig = quote_ident(&format!("{}__patch_ins", info.name)),
        view = quote_ident(&patch_view(&info.name)),
        crr = quote_ident(&crr_table(&info.name)),
        clock = quote_ident(&clock_table(&info.name)),
        pk_names = pk_names,
        pk_values = pk_values,
        where_pk = where_pk,
        set_clause = set_clause,
    )
}
