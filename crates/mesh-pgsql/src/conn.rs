//! Connection Controller: the host-visible connection object.
//!
//! A [`Connection`] owns one native `PgConn` through a [`Handle`], plus the
//! host-side state the native object cannot hold: the notice bridge and
//! the attached trace stream. Large-object handles keep the connection
//! state alive through a shared reference, so it lives until the last of
//! them is gone.
//!
//! Dropping a connection finishes it unless its pointer is registered as
//! externally owned (see [`crate::registry`]); then it is detached and
//! left open for the embedding program. An explicit [`Connection::finish`]
//! always closes.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::debug;

use mesh_pq::{ConnStatus, PgConn, PollingStatus, TransactionStatus, Verbosity};

use crate::error::{Error, Result};
use crate::handle::{Handle, HandleKind};
use crate::host::HostStream;
use crate::notice::{detach_bridge, Bridge};
use crate::registry;

pub(crate) struct ConnShared {
    handle: Handle<PgConn>,
    pub(crate) bridge: Rc<Bridge>,
    trace: RefCell<Option<HostStream>>,
}

impl ConnShared {
    /// Run `f` against the native connection, then surface any error a
    /// notice callback raised while it ran.
    pub(crate) fn call<R>(&self, f: impl FnOnce(&mut PgConn) -> R) -> Result<R> {
        let (out, raised) = self.call_deferred(f)?;
        raised.map(|()| out)
    }

    /// Like [`ConnShared::call`], but hands back the native outcome even
    /// when a callback failed, for callers that must record side effects
    /// on the server before re-raising.
    pub(crate) fn call_deferred<R>(
        &self,
        f: impl FnOnce(&mut PgConn) -> R,
    ) -> Result<(R, Result<()>)> {
        let out = self.handle.with_mut(f)?;
        Ok((out, self.bridge.raise()))
    }

    /// Side-effect-free read of the native connection.
    pub(crate) fn read<R>(&self, f: impl FnOnce(&PgConn) -> R) -> Result<R> {
        self.handle.with(f)
    }

    fn unpin_trace(&self) {
        if let Some(stream) = self.trace.borrow_mut().take() {
            stream.unpin();
        }
    }

    /// Hand the native connection back to its external owner: callbacks
    /// and trace sink are unhooked, the connection itself stays open.
    fn detach(&self) -> Result<()> {
        let bridge = self.bridge.clone();
        self.handle.with_mut(|c| {
            detach_bridge(c, &bridge);
            c.untrace();
        })?;
        self.unpin_trace();
        self.handle.detach()?;
        Ok(())
    }
}

impl Drop for ConnShared {
    fn drop(&mut self) {
        let Some(ptr) = self.handle.as_ptr() else {
            return;
        };
        if registry::is_external(ptr) {
            debug!("connection {:p} is externally owned; detaching", ptr);
            let _ = self.detach();
        } else {
            self.unpin_trace();
            let _ = self.handle.release();
        }
    }
}

/// Outcome of a cancel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The request reached the server. The command may still complete
    /// normally; drain its results either way.
    Sent,
    /// No cancel token could be made, or the request was not delivered.
    Failed(String),
}

/// Result of [`Connection::flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    Done,
    /// Data is still queued; wait for the socket to be writable.
    Pending,
    Failed,
}

pub struct Connection {
    shared: Rc<ConnShared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.shared.handle)
            .finish()
    }
}

/// Open a connection and wait for the outcome. Always returns a
/// connection object; check [`Connection::status`].
pub fn connectdb(conninfo: &str) -> Connection {
    Connection::from_native(mesh_pq::connectdb(conninfo))
}

/// Start a connection without blocking; drive it with
/// [`Connection::connect_poll`].
pub fn connect_start(conninfo: &str) -> Connection {
    Connection::from_native(mesh_pq::connect_start(conninfo))
}

impl Connection {
    pub(crate) fn from_native(conn: Box<PgConn>) -> Self {
        Connection {
            shared: Rc::new(ConnShared {
                handle: Handle::acquire(conn),
                bridge: Bridge::new(),
                trace: RefCell::new(None),
            }),
        }
    }

    /// Wrap a connection created by the embedding program.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `Box::into_raw` on a `PgConn` (as
    /// [`crate::ffi::mesh_pgsql_connectdb`] returns) and no other
    /// `Connection` may wrap it. Unless the pointer is registered with
    /// [`registry::mark_external`], dropping the connection frees it.
    pub unsafe fn adopt(ptr: *mut PgConn) -> Result<Connection> {
        if ptr.is_null() {
            return Err(Error::InvalidHandle(HandleKind::Connection));
        }
        // SAFETY: forwarded to the caller.
        let handle = unsafe { Handle::from_raw(ptr) };
        Ok(Connection {
            shared: Rc::new(ConnShared {
                handle,
                bridge: Bridge::new(),
                trace: RefCell::new(None),
            }),
        })
    }

    pub(crate) fn shared(&self) -> &Rc<ConnShared> {
        &self.shared
    }

    fn read<R>(&self, f: impl FnOnce(&PgConn) -> R) -> Result<R> {
        self.shared.read(f)
    }

    fn call<R>(&self, f: impl FnOnce(&mut PgConn) -> R) -> Result<R> {
        self.shared.call(f)
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    pub fn connect_poll(&self) -> Result<PollingStatus> {
        self.call(PgConn::connect_poll)
    }

    /// Close and reopen the connection with the same parameters, blocking.
    pub fn reset(&self) -> Result<()> {
        debug!("resetting connection");
        self.call(PgConn::reset)
    }

    pub fn reset_start(&self) -> Result<bool> {
        self.call(PgConn::reset_start)
    }

    pub fn reset_poll(&self) -> Result<PollingStatus> {
        self.call(PgConn::reset_poll)
    }

    /// Close the connection and free the native object, whether or not it
    /// is registered as externally owned. Calling it again does nothing.
    pub fn finish(&self) -> Result<()> {
        if let Some(ptr) = self.shared.handle.as_ptr() {
            registry::unmark_external(ptr);
        }
        self.shared.handle.release()?;
        self.shared.unpin_trace();
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.shared.handle.is_released()
    }

    // ── Status ─────────────────────────────────────────────────────────

    pub fn status(&self) -> Result<ConnStatus> {
        self.read(PgConn::status)
    }

    pub fn db(&self) -> Result<String> {
        self.read(|c| c.db().to_string())
    }

    pub fn user(&self) -> Result<String> {
        self.read(|c| c.user().to_string())
    }

    pub fn pass(&self) -> Result<String> {
        self.read(|c| c.pass().to_string())
    }

    pub fn host(&self) -> Result<String> {
        self.read(|c| c.host().to_string())
    }

    pub fn port(&self) -> Result<String> {
        self.read(PgConn::port)
    }

    pub fn tty(&self) -> Result<String> {
        self.read(|c| c.tty().to_string())
    }

    pub fn options(&self) -> Result<String> {
        self.read(|c| c.options().to_string())
    }

    pub fn transaction_status(&self) -> Result<TransactionStatus> {
        self.read(PgConn::transaction_status)
    }

    pub fn parameter_status(&self, name: &str) -> Result<Option<String>> {
        self.read(|c| c.parameter_status(name).map(str::to_string))
    }

    pub fn protocol_version(&self) -> Result<i32> {
        self.read(PgConn::protocol_version)
    }

    pub fn server_version(&self) -> Result<i32> {
        self.read(PgConn::server_version)
    }

    pub fn error_message(&self) -> Result<String> {
        self.read(|c| c.error_message().to_string())
    }

    /// Socket descriptor for an external event loop; `None` while the
    /// connection has no open socket.
    pub fn socket(&self) -> Result<Option<i32>> {
        self.read(PgConn::socket)
    }

    pub fn backend_pid(&self) -> Result<i32> {
        self.read(PgConn::backend_pid)
    }

    pub fn connection_needs_password(&self) -> Result<bool> {
        self.read(PgConn::connection_needs_password)
    }

    pub fn connection_used_password(&self) -> Result<bool> {
        self.read(PgConn::connection_used_password)
    }

    pub fn ssl_in_use(&self) -> Result<bool> {
        self.read(PgConn::ssl_in_use)
    }

    // ── Control ────────────────────────────────────────────────────────

    pub fn client_encoding(&self) -> Result<String> {
        self.read(|c| c.client_encoding().to_string())
    }

    pub fn set_client_encoding(&self, encoding: &str) -> Result<bool> {
        self.call(|c| c.set_client_encoding(encoding) == 0)
    }

    /// Returns the previous verbosity.
    pub fn set_error_verbosity(&self, verbosity: Verbosity) -> Result<Verbosity> {
        self.call(|c| c.set_error_verbosity(verbosity))
    }

    pub fn set_nonblocking(&self, on: bool) -> Result<bool> {
        self.call(|c| c.set_nonblocking(on) == 0)
    }

    pub fn is_nonblocking(&self) -> Result<bool> {
        self.read(PgConn::is_nonblocking)
    }

    pub fn flush(&self) -> Result<FlushStatus> {
        self.call(|c| match c.flush() {
            0 => FlushStatus::Done,
            1 => FlushStatus::Pending,
            _ => FlushStatus::Failed,
        })
    }

    pub fn consume_input(&self) -> Result<bool> {
        self.call(PgConn::consume_input)
    }

    pub fn is_busy(&self) -> Result<bool> {
        self.call(PgConn::is_busy)
    }

    /// Ask the server to abandon the running command. Uses a separate
    /// short-lived connection and leaves this one untouched.
    pub fn cancel(&self) -> Result<CancelOutcome> {
        let Some(token) = self.read(PgConn::get_cancel)? else {
            return Ok(CancelOutcome::Failed("no connection to the server".to_string()));
        };
        Ok(match token.cancel() {
            Ok(()) => CancelOutcome::Sent,
            Err(msg) => CancelOutcome::Failed(msg),
        })
    }

    // ── Tracing ────────────────────────────────────────────────────────

    /// Copy protocol traffic to `stream`. The stream refuses to close
    /// until [`Connection::untrace`] or the connection goes away.
    pub fn trace(&self, stream: &HostStream) -> Result<()> {
        if stream.is_closed() {
            return Err(Error::Argument("attempt to use a closed file".to_string()));
        }
        let sink = stream.sink();
        self.call(|c| c.trace(Box::new(sink)))?;
        stream.pin();
        if let Some(old) = self.shared.trace.borrow_mut().replace(stream.clone()) {
            old.unpin();
        }
        Ok(())
    }

    pub fn untrace(&self) -> Result<()> {
        self.call(|c| {
            c.untrace();
        })?;
        self.shared.unpin_trace();
        Ok(())
    }

    // ── Escaping ───────────────────────────────────────────────────────

    pub fn escape_string(&self, from: &str) -> Result<String> {
        self.read(|c| c.escape_string_conn(from))
    }

    pub fn escape_literal(&self, from: &str) -> Result<String> {
        self.read(|c| c.escape_literal(from))
    }

    pub fn escape_identifier(&self, from: &str) -> Result<String> {
        self.read(|c| c.escape_identifier(from))
    }

    /// Escape binary data for a bytea literal.
    pub fn escape_bytea(&self, from: &[u8]) -> Result<Vec<u8>> {
        let native = self.read(|c| c.escape_bytea_conn(from))?;
        take_buffer(native)
    }
}

/// Copy a native scratch buffer out to the host and free it.
pub(crate) fn take_buffer(native: Vec<u8>) -> Result<Vec<u8>> {
    let buf = Handle::acquire(Box::new(native));
    let out = buf.with(|b| {
        let mut out = Vec::new();
        out.try_reserve_exact(b.len()).map_err(|_| Error::Allocation)?;
        out.extend_from_slice(b);
        Ok(out)
    })?;
    buf.release()?;
    out
}

/// Decode the text form of a bytea value; `None` if it is malformed.
pub fn unescape_bytea(from: &[u8]) -> Result<Option<Vec<u8>>> {
    match mesh_pq::unescape_bytea(from) {
        Some(native) => take_buffer(native).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_pq::testing::FakeBackend;

    #[test]
    fn test_bad_host_reaches_bad_status() {
        let conn = connectdb("host=127.0.0.1 port=1 connect_timeout=2 sslmode=disable");
        assert_eq!(conn.status(), Ok(ConnStatus::Bad));
        assert!(!conn.error_message().unwrap().is_empty());
        assert_eq!(conn.socket(), Ok(None));
    }

    #[test]
    fn test_accessors_after_finish_are_invalid() {
        let conn = connectdb("host=127.0.0.1 port=1 sslmode=disable");
        conn.finish().unwrap();
        conn.finish().unwrap();
        assert!(conn.is_finished());
        assert_eq!(
            conn.status(),
            Err(Error::InvalidHandle(HandleKind::Connection))
        );
        assert_eq!(
            conn.exec("select 1").unwrap_err(),
            Error::InvalidHandle(HandleKind::Connection)
        );
    }

    #[test]
    fn test_status_accessors() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.handshake();
        });
        let conn = connectdb(&backend.conninfo());
        assert_eq!(conn.status(), Ok(ConnStatus::Ok));
        assert_eq!(conn.db().unwrap(), "testdb");
        assert_eq!(conn.user().unwrap(), "tester");
        assert_eq!(conn.host().unwrap(), "127.0.0.1");
        assert_eq!(conn.port().unwrap(), backend.port().to_string());
        assert_eq!(conn.protocol_version(), Ok(3));
        assert_eq!(conn.server_version(), Ok(160002));
        assert_eq!(conn.backend_pid(), Ok(mesh_pq::testing::BACKEND_PID));
        assert_eq!(conn.transaction_status(), Ok(TransactionStatus::Idle));
        assert_eq!(conn.client_encoding().unwrap(), "UTF8");
        assert_eq!(conn.parameter_status("server_version").unwrap().as_deref(), Some("16.2"));
        assert!(conn.socket().unwrap().is_some());
        assert_eq!(conn.ssl_in_use(), Ok(false));
        conn.finish().unwrap();
        backend.join();
    }

    #[test]
    fn test_escaping_round_trip() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.handshake();
        });
        let conn = connectdb(&backend.conninfo());
        assert_eq!(conn.escape_string("it's").unwrap(), "it''s");
        assert_eq!(conn.escape_identifier("a\"b").unwrap(), "\"a\"\"b\"");
        let escaped = conn.escape_bytea(&[1, 2, 255]).unwrap();
        assert_eq!(escaped, b"\\x0102ff");
        assert_eq!(unescape_bytea(&escaped), Ok(Some(vec![1, 2, 255])));
        drop(conn);
        backend.join();
    }

    #[test]
    fn test_trace_pins_stream_until_untrace() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.handshake();
            assert_eq!(c.expect_query(), "select 1");
            c.send_row_description(&[("x", mesh_pq::types::INT4OID)]);
            c.send_data_row(&[Some("1")]);
            c.send_command_complete("SELECT 1");
            c.send_ready(b'I');
        });
        let file = tempfile::NamedTempFile::new().unwrap();
        let stream = HostStream::new(file.reopen().unwrap());
        let conn = connectdb(&backend.conninfo());
        conn.trace(&stream).unwrap();
        assert!(stream.close().is_err());
        conn.exec("select 1").unwrap().unwrap();
        conn.untrace().unwrap();
        stream.close().unwrap();
        let log = std::fs::read_to_string(file.path()).unwrap();
        assert!(log.contains("To backend"));
        assert!(log.contains("From backend"));
        assert!(matches!(conn.trace(&stream), Err(Error::Argument(_))));
        drop(conn);
        backend.join();
    }

    #[test]
    fn test_drop_of_external_connection_leaves_it_open() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.handshake();
            assert_eq!(c.expect_query(), "select 1");
            c.send_command_complete("SELECT 0");
            c.send_ready(b'I');
        });
        let raw = Box::into_raw(mesh_pq::connectdb(&backend.conninfo()));
        assert!(registry::mark_external(raw));
        // SAFETY: `raw` is a fresh Box pointer and only this wrapper holds it.
        let conn = unsafe { Connection::adopt(raw) }.unwrap();
        assert_eq!(conn.status(), Ok(ConnStatus::Ok));
        drop(conn);

        // Still usable by its owner.
        // SAFETY: the dropped wrapper detached without freeing.
        let mut native = unsafe { Box::from_raw(raw) };
        assert_eq!(native.status(), ConnStatus::Ok);
        assert!(native.exec("select 1").is_some());
        registry::unmark_external(raw);
        mesh_pq::finish(native);
        backend.join();
    }

    #[test]
    fn test_cancel_without_socket_fails_cleanly() {
        let conn = connectdb("host=127.0.0.1 port=1 sslmode=disable");
        assert!(matches!(conn.cancel(), Ok(CancelOutcome::Failed(_))));
    }
}
