//! Identifier and SQL-fragment utilities.
//!
//! Total, allocation-only functions with no I/O: quoting identifiers, joining
//! name lists, and formatting column/primary-key clauses for the DDL the
//! compiler and trigger synthesizer emit. Kept separate from those callers so
//! the string-munging has no access to a `Connection` and can't accidentally
//! grow I/O of its own.

use crate::tableinfo::ColumnInfo;

/// Wrap an identifier in double quotes, escaping embedded quotes by doubling
/// them (the standard SQL escaping rule, same as SQLite's own `%w`/`"%w"`
/// formatting).
pub fn quote_ident(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('"');
    for ch in name.chars() {
        if ch == '"' {
            out.push('"');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

/// Join a list of raw names with `sep`, quoting each one.
pub fn join_idents(names: &[String], sep: &str) -> String {
    names
        .iter()
        .map(|n| quote_ident(n))
        .collect::<Vec<_>>()
        .join(sep)
}

/// Join `items` with `sep`, applying `f` to each element first. The
/// generalized form of [`join_idents`] used where the per-element
/// transform isn't plain quoting (e.g. `quote(col)` wrapping for the
/// changes-feed pk concatenation).
pub fn join_with<T, F>(items: &[T], sep: &str, f: F) -> String
where
    F: Fn(&T) -> String,
{
    items.iter().map(f).collect::<Vec<_>>().join(sep)
}

/// Format a column-definitions clause suitable for a `CREATE TABLE` body:
/// `"a" TEXT NOT NULL DEFAULT 'x', "b" INTEGER`.
pub fn column_definitions(cols: &[ColumnInfo]) -> String {
    cols.iter()
        .map(|c| {
            let mut def = format!("{} {}", quote_ident(&c.name), c.decl_type);
            if c.not_null {
                def.push_str(" NOT NULL");
            }
            if let Some(default) = &c.default_value {
                def.push_str(" DEFAULT ");
                def.push_str(default);
            }
            def
        })
        .collect::<Vec<_>>()
        .join(",\n  ")
}

/// Format a `PRIMARY KEY (...)` clause from a list of column names, or an
/// empty string when there is no declared primary key.
pub fn primary_key_clause(pk_cols: &[String]) -> String {
    if pk_cols.is_empty() {
        return String::new();
    }
    format!("PRIMARY KEY ({})", join_idents(pk_cols, ", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_plain_identifier() {
        assert_eq!(quote_ident("foo"), "\"foo\"");
    }

    #[test]
    fn escapes_embedded_quote() {
        assert_eq!(quote_ident("fo\"o"), "\"fo\"\"o\"");
    }

    #[test]
    fn joins_idents_with_separator() {
        let names = vec!["a".to_string(), "b".to_string()];
        assert_eq!(join_idents(&names, ", "), "\"a\", \"b\"");
    }

    #[test]
    fn primary_key_clause_empty_when_no_pk() {
        assert_eq!(primary_key_clause(&[]), "");
    }

    #[test]
    fn primary_key_clause_joins_columns() {
        let pks = vec!["a".to_string(), "b".to_string()];
        assert_eq!(primary_key_clause(&pks), "PRIMARY KEY (\"a\", \"b\")");
    }
}
