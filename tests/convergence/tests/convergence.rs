//! Multi-site convergence tests.
//!
//! Exercises spec.md §8's testable properties 5 and 8 end to end: two
//! independent `rusqlite::Connection`s, each with its own crrlite-compiled
//! `foo` table, write locally, exchange their `changes` output
//! through the `foo__patch` view, and are asserted to land on identical
//! backing state. This stands in for the real sync transport (out of scope
//! per spec.md §1) with direct in-process application — the same role the
//! teacher's `tests/e2e` harness plays for multi-component flows, scaled
//! down to two `Connection`s instead of two running services.

use rusqlite::types::Value;
use rusqlite::Connection;

fn site_id(conn: &Connection) -> Vec<u8> {
    conn.query_row("SELECT site_id()", [], |r| r.get(0))
        .unwrap()
}

fn hex_decode(s: &str) -> Vec<u8> {
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
        .collect()
}

/// A `quote()`-encoded SQL literal round-trips through SQLite itself —
/// `SELECT 1` or `SELECT 'abc'` hands back a properly typed value.
fn decode_literal(conn: &Connection, literal: &str) -> Value {
    conn.query_row(&format!("SELECT {literal}"), [], |r| r.get(0))
        .unwrap()
}

fn json_to_value(v: &serde_json::Value) -> Value {
    match v {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Integer(if *b { 1 } else { 0 }),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(Value::Integer)
            .or_else(|| n.as_f64().map(Value::Real))
            .unwrap_or(Value::Null),
        serde_json::Value::String(s) => Value::Text(s.clone()),
        _ => Value::Null,
    }
}

#[allow(clippy::too_many_arguments)]
fn apply_patch_row(
    to: &Connection,
    table: &str,
    pk_cols: &[String],
    pk_values: &[Value],
    col_name: &str,
    col_value: Value,
    col_version: Option<i64>,
    site: &[u8],
    causal_length: Option<i64>,
) {
    let pk_names = pk_cols
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let total = pk_cols.len() + 5;
    let placeholders = (1..=total).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ");
    let sql = format!(
        "INSERT INTO \"{table}__patch\" ({pk_names}, \"col_name\", \"col_value\", \"col_version\", \"site_id\", \"causal_length\") VALUES ({placeholders})"
    );

    let mut params: Vec<Value> = pk_values.to_vec();
    params.push(Value::Text(col_name.to_string()));
    params.push(col_value);
    params.push(col_version.map(Value::Integer).unwrap_or(Value::Null));
    params.push(Value::Blob(site.to_vec()));
    params.push(causal_length.map(Value::Integer).unwrap_or(Value::Null));

    to.execute(&sql, rusqlite::params_from_iter(params.iter()))
        .unwrap();
}

/// Drains every row `changes` reports on `from` that `to` hasn't
/// already produced (`requestor = to`'s site) past `since`, and applies each
/// one to `to` through its `T__patch` view. Returns the highest
/// `curr_version` observed, so the caller can use it as the next watermark.
fn replicate(from: &Connection, to: &Connection, since: i64) -> i64 {
    let to_site = site_id(to);
    let from_site = site_id(from);

    let rows: Vec<(String, String, String, String, i64)> = {
        let mut stmt = from
            .prepare(
                "SELECT \"table\", \"pk\", \"col_vals\", \"col_versions\", \"curr_version\" \
                 FROM changes WHERE requestor = ?1 AND curr_version > ?2",
            )
            .unwrap();
        stmt.query_map(rusqlite::params![to_site, since], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
        })
        .unwrap()
        .collect::<rusqlite::Result<Vec<_>>>()
        .unwrap()
    };

    let mut max_v = since;
    for (table, pk_label, col_vals, col_versions, curr_version) in rows {
        max_v = max_v.max(curr_version);

        let pk_cols = crrlite::tableinfo::introspect(to, &format!("{table}__crr"))
            .unwrap()
            .pks;
        let pk_values: Vec<Value> = pk_label
            .split('~')
            .map(|tok| decode_literal(to, tok))
            .collect();

        let vals: serde_json::Value = serde_json::from_str(&col_vals).unwrap();
        if vals.get("__tombstone").is_some() {
            apply_patch_row(
                to,
                &table,
                &pk_cols,
                &pk_values,
                crrlite::triggers::SENTINEL_COLUMN,
                Value::Null,
                None,
                &from_site,
                Some(curr_version),
            );
            continue;
        }

        let versions: serde_json::Value = serde_json::from_str(&col_versions).unwrap();
        if let serde_json::Value::Object(map) = &vals {
            for (col, value) in map {
                let entry = &versions[col];
                let version = entry["version"].as_i64().unwrap();
                let site = hex_decode(entry["site"].as_str().unwrap());
                apply_patch_row(
                    to,
                    &table,
                    &pk_cols,
                    &pk_values,
                    col,
                    json_to_value(value),
                    Some(version),
                    &site,
                    None,
                );
            }
        }
    }
    max_v
}

fn fresh_site(table_sql: &str) -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    crrlite::init(&conn).unwrap();
    crrlite::compiler::compile(&conn, table_sql).unwrap();
    conn
}

/// Property 8: applying A's changes to B and B's to A drives both to
/// identical backing state, regardless of which side wrote first.
#[test]
fn bidirectional_exchange_converges() {
    let site_a = fresh_site("CREATE TABLE foo (a INTEGER PRIMARY KEY, b TEXT)");
    let site_b = fresh_site("CREATE TABLE foo (a INTEGER PRIMARY KEY, b TEXT)");

    site_a.execute("INSERT INTO foo (a, b) VALUES (1, 'from-a')", []).unwrap();
    site_b.execute("INSERT INTO foo (a, b) VALUES (2, 'from-b')", []).unwrap();

    replicate(&site_a, &site_b, crrlite::global::MIN_POSSIBLE_DB_VERSION);
    replicate(&site_b, &site_a, crrlite::global::MIN_POSSIBLE_DB_VERSION);

    let rows_a: Vec<(i64, String)> = site_a
        .prepare("SELECT a, b FROM foo ORDER BY a")
        .unwrap()
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
        .unwrap()
        .collect::<rusqlite::Result<Vec<_>>>()
        .unwrap();
    let rows_b: Vec<(i64, String)> = site_b
        .prepare("SELECT a, b FROM foo ORDER BY a")
        .unwrap()
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
        .unwrap()
        .collect::<rusqlite::Result<Vec<_>>>()
        .unwrap();

    assert_eq!(rows_a, rows_b);
    assert_eq!(rows_a, vec![(1, "from-a".to_string()), (2, "from-b".to_string())]);
}

/// Scenario 4 / property 5: two sites insert conflicting values for the
/// same primary key at the same database version; after exchanging
/// changes, both converge to whichever site has the larger site id.
#[test]
fn concurrent_writes_at_equal_version_resolve_to_larger_site_id() {
    let site_a = fresh_site("CREATE TABLE foo (a INTEGER PRIMARY KEY, b TEXT)");
    let site_b = fresh_site("CREATE TABLE foo (a INTEGER PRIMARY KEY, b TEXT)");

    site_a.execute("INSERT INTO foo (a, b) VALUES (1, 'x')", []).unwrap();
    site_b.execute("INSERT INTO foo (a, b) VALUES (1, 'y')", []).unwrap();

    replicate(&site_a, &site_b, crrlite::global::MIN_POSSIBLE_DB_VERSION);
    replicate(&site_b, &site_a, crrlite::global::MIN_POSSIBLE_DB_VERSION);

    let id_a = site_id(&site_a);
    let id_b = site_id(&site_b);
    let expected = if id_b > id_a { "y" } else { "x" };

    let b_on_a: String = site_a
        .query_row("SELECT b FROM foo WHERE a = 1", [], |r| r.get(0))
        .unwrap();
    let b_on_b: String = site_b
        .query_row("SELECT b FROM foo WHERE a = 1", [], |r| r.get(0))
        .unwrap();

    assert_eq!(b_on_a, expected);
    assert_eq!(b_on_b, expected);
}

/// A delete on one site propagates as a tombstone patch and hides the row
/// on the peer, without ever removing the backing `__crr` row there either.
#[test]
fn delete_propagates_as_tombstone() {
    let site_a = fresh_site("CREATE TABLE foo (a INTEGER PRIMARY KEY, b TEXT)");
    let site_b = fresh_site("CREATE TABLE foo (a INTEGER PRIMARY KEY, b TEXT)");

    site_a.execute("INSERT INTO foo (a, b) VALUES (1, 'x')", []).unwrap();
    let watermark = replicate(&site_a, &site_b, crrlite::global::MIN_POSSIBLE_DB_VERSION);

    assert_eq!(
        site_b
            .query_row("SELECT b FROM foo WHERE a = 1", [], |r| r.get::<_, String>(0))
            .unwrap(),
        "x"
    );

    site_a.execute("DELETE FROM foo WHERE a = 1", []).unwrap();
    replicate(&site_a, &site_b, watermark);

    let visible: i64 = site_b
        .query_row("SELECT COUNT(*) FROM foo WHERE a = 1", [], |r| r.get(0))
        .unwrap();
    assert_eq!(visible, 0);

    let backing: i64 = site_b
        .query_row("SELECT COUNT(*) FROM foo__crr WHERE a = 1", [], |r| r.get(0))
        .unwrap();
    assert_eq!(backing, 1);
}

/// Property 7: the changes feed is non-decreasing in `curr_version` across
/// tables, not just within one.
#[test]
fn changes_feed_is_ordered_across_tables() {
    let site = fresh_site("CREATE TABLE a_tbl (id INTEGER PRIMARY KEY, v TEXT)");
    crrlite::compiler::compile(&site, "CREATE TABLE b_tbl (id INTEGER PRIMARY KEY, v TEXT)").unwrap();

    site.execute("INSERT INTO b_tbl (id, v) VALUES (1, 'first')", []).unwrap();
    site.execute("INSERT INTO a_tbl (id, v) VALUES (1, 'second')", []).unwrap();
    site.execute("UPDATE b_tbl SET v = 'third' WHERE id = 1", []).unwrap();

    let versions: Vec<i64> = site
        .prepare("SELECT curr_version FROM changes WHERE curr_version > 0")
        .unwrap()
        .query_map([], |r| r.get(0))
        .unwrap()
        .collect::<rusqlite::Result<Vec<_>>>()
        .unwrap();

    let mut sorted = versions.clone();
    sorted.sort();
    assert_eq!(versions, sorted);
    assert!(!versions.is_empty());
}
