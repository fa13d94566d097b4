//! Error types for the CRR engine.

/// Errors surfaced by the engine's compile path, changes feed, and global
/// state bootstrap.
///
/// `Sqlite` is the catch-all for failures returned by the host engine while
/// executing generated SQL. The other variants name the misuse, introspection,
/// and unsupported-path cases spec'd out in the error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum CrrError {
    /// A failure propagated straight from `rusqlite` (prepare/step/exec).
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Multi-statement compile input, an unrecognized statement kind, or an
    /// index with an unsupported filter predicate.
    #[error("misuse: {0}")]
    Misuse(String),

    /// Table introspection failed: the named table is missing, unreadable,
    /// or its catalog row could not be parsed into a `TableInfo`.
    #[error("table introspection failed for {table}: {source}")]
    Introspection {
        table: String,
        #[source]
        source: rusqlite::Error,
    },

    /// A feature that is declared future work (e.g. ALTER TABLE column
    /// rename/drop on an already-populated CRR).
    #[error("{0}")]
    Unsupported(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CrrError>;
