//! Span helpers used when the `tracing` feature is enabled.

use tracing::{debug_span, info_span, Span};

/// Span for a single statement sent to the target database
pub fn execute_statement_span(sql: &str) -> Span {
    // Long bodies are truncated.
    let preview: String = sql.trim().chars().take(120).collect();
    debug_span!("changeguard.execute", sql = %preview)
}

/// Span covering one migration run
pub fn migration_run_span(changesets: usize) -> Span {
    info_span!("changeguard.run", changesets)
}

/// Span covering one forward apply
pub fn apply_changeset_span(id: &str, author: &str) -> Span {
    info_span!("changeguard.apply", id, author)
}

/// Span covering one rollback
pub fn rollback_changeset_span(id: &str, author: &str) -> Span {
    info_span!("changeguard.rollback", id, author)
}

/// Span covering lock acquisition
pub fn acquire_lock_span(timeout_secs: u64) -> Span {
    info_span!("changeguard.lock", timeout_secs)
}
