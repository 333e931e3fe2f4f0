//! External-ownership registry.
//!
//! An embedding program that opened a connection itself and handed it to
//! the runtime registers the pointer here. The connection finalizer checks
//! the set and detaches instead of closing, so the connection outlives the
//! host session. Explicit `finish()` ignores the set.
//!
//! Keyed by pointer identity. The set is process-wide because the
//! embedding program may register a pointer before any runtime exists.

use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use std::sync::OnceLock;

use mesh_pq::PgConn;

static EXTERNAL: OnceLock<RwLock<FxHashSet<usize>>> = OnceLock::new();

fn external() -> &'static RwLock<FxHashSet<usize>> {
    EXTERNAL.get_or_init(|| RwLock::new(FxHashSet::default()))
}

/// Mark a connection as owned outside the binding. Returns false if it
/// was already marked or the pointer is null.
pub fn mark_external(conn: *const PgConn) -> bool {
    if conn.is_null() {
        return false;
    }
    external().write().insert(conn as usize)
}

/// Remove the mark. Returns whether the pointer was marked.
pub fn unmark_external(conn: *const PgConn) -> bool {
    external().write().remove(&(conn as usize))
}

pub fn is_external(conn: *const PgConn) -> bool {
    !conn.is_null() && external().read().contains(&(conn as usize))
}
