//! C ABI for the embedding program.
//!
//! An embedder that opens its own connection and passes it into a runtime
//! session uses these entry points: open a connection, register it as
//! externally owned, hand the pointer to [`Connection::adopt`], and close
//! it itself once the session is gone.
//!
//! [`Connection::adopt`]: crate::Connection::adopt

use std::ffi::{c_char, CStr};

use tracing::debug;

use mesh_pq::{ConnStatus, PgConn};

use crate::registry;

/// Open a connection and wait for the outcome.
///
/// # Signature
///
/// `mesh_pgsql_connectdb(conninfo: *const c_char) -> *mut PgConn`
///
/// Returns null only when `conninfo` is null or not UTF-8. A failed
/// connection is still returned; check `mesh_pgsql_status`.
#[no_mangle]
pub extern "C" fn mesh_pgsql_connectdb(conninfo: *const c_char) -> *mut PgConn {
    if conninfo.is_null() {
        return std::ptr::null_mut();
    }
    // SAFETY: non-null and, per the C contract, NUL-terminated.
    let conninfo = unsafe { CStr::from_ptr(conninfo) };
    match conninfo.to_str() {
        Ok(s) => Box::into_raw(mesh_pq::connectdb(s)),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Connection status code (`CONNECTION_*`); `CONNECTION_BAD` for null.
///
/// # Safety
///
/// `conn` must be null or a live pointer from `mesh_pgsql_connectdb` that
/// no runtime call is using right now.
#[no_mangle]
pub unsafe extern "C" fn mesh_pgsql_status(conn: *const PgConn) -> i32 {
    // SAFETY: upheld by the caller.
    match unsafe { conn.as_ref() } {
        Some(c) => c.status() as i32,
        None => ConnStatus::Bad as i32,
    }
}

/// Mark `conn` as owned by the embedder, so a runtime connection object
/// wrapping it only detaches when collected. Returns 1 if newly marked.
#[no_mangle]
pub extern "C" fn mesh_pgsql_retain_external(conn: *const PgConn) -> i32 {
    registry::mark_external(conn) as i32
}

/// Drop the mark. Returns 1 if `conn` was marked.
#[no_mangle]
pub extern "C" fn mesh_pgsql_release_external(conn: *const PgConn) -> i32 {
    registry::unmark_external(conn) as i32
}

/// Close and free a connection. Null is ignored.
///
/// # Safety
///
/// `conn` must be null or come from `mesh_pgsql_connectdb`, and nothing
/// (in particular no live runtime connection object) may use it again.
#[no_mangle]
pub unsafe extern "C" fn mesh_pgsql_finish(conn: *mut PgConn) {
    if conn.is_null() {
        return;
    }
    registry::unmark_external(conn);
    debug!("embedder closing connection {:p}", conn);
    // SAFETY: upheld by the caller; the pointer came from Box::into_raw.
    mesh_pq::finish(unsafe { Box::from_raw(conn) });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::Connection;
    use mesh_pq::testing::FakeBackend;
    use std::ffi::CString;

    #[test]
    fn test_null_inputs() {
        assert!(mesh_pgsql_connectdb(std::ptr::null()).is_null());
        assert_eq!(unsafe { mesh_pgsql_status(std::ptr::null()) }, ConnStatus::Bad as i32);
        assert_eq!(mesh_pgsql_retain_external(std::ptr::null()), 0);
        unsafe { mesh_pgsql_finish(std::ptr::null_mut()) };
    }

    #[test]
    fn test_embedder_owned_connection_survives_session() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.handshake();
            assert_eq!(c.expect_query(), "set x = 1");
            c.send_command_complete("SET");
            c.send_ready(b'I');
            let (tag, _) = c.read_message();
            assert_eq!(tag, b'X');
        });
        let conninfo = CString::new(backend.conninfo()).unwrap();
        let raw = mesh_pgsql_connectdb(conninfo.as_ptr());
        assert_eq!(unsafe { mesh_pgsql_status(raw) }, ConnStatus::Ok as i32);
        assert_eq!(mesh_pgsql_retain_external(raw), 1);

        let conn = unsafe { Connection::adopt(raw) }.unwrap();
        conn.exec("set x = 1").unwrap().unwrap();
        drop(conn);

        // Still open and still ours.
        assert_eq!(unsafe { mesh_pgsql_status(raw) }, ConnStatus::Ok as i32);
        assert!(registry::is_external(raw));
        unsafe { mesh_pgsql_finish(raw) };
        assert!(!registry::is_external(raw));
        backend.join();
    }
}
