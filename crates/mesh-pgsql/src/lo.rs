//! Streaming Channel, large-object half.
//!
//! Descriptors are only valid inside the transaction that opened them.
//! A [`LargeObject`] keeps its connection alive and closes its descriptor
//! when dropped, unless it was already closed explicitly.

use std::cell::Cell;
use std::rc::Rc;

use tracing::debug;

use mesh_pq::types::INVALID_OID;
use mesh_pq::{Oid, PgConn};

use crate::conn::{ConnShared, Connection};
use crate::error::{Error, Result};
use crate::handle::HandleKind;

impl Connection {
    /// Create a large object, with the given OID or a server-chosen one.
    /// Returns `None` on failure; see `error_message()`.
    pub fn lo_create(&self, oid: Option<Oid>) -> Result<Option<Oid>> {
        self.shared()
            .call(|c| c.lo_create(oid.unwrap_or(INVALID_OID)))
            .map(valid_oid)
    }

    /// Load a client-side file into a new large object.
    pub fn lo_import(&self, filename: &str) -> Result<Option<Oid>> {
        self.shared().call(|c| c.lo_import(filename)).map(valid_oid)
    }

    pub fn lo_import_with_oid(&self, filename: &str, oid: Oid) -> Result<Option<Oid>> {
        self.shared()
            .call(|c| c.lo_import_with_oid(filename, oid))
            .map(valid_oid)
    }

    /// Write a large object out to a client-side file.
    pub fn lo_export(&self, oid: Oid, filename: &str) -> Result<bool> {
        self.shared().call(|c| c.lo_export(oid, filename) == 1)
    }

    pub fn lo_unlink(&self, oid: Oid) -> Result<bool> {
        self.shared().call(|c| c.lo_unlink(oid) >= 0)
    }

    /// Open a large object with `INV_READ` / `INV_WRITE` access.
    /// Returns `None` when the server refuses.
    pub fn lo_open(&self, oid: Oid, mode: i32) -> Result<Option<LargeObject>> {
        let (fd, raised) = self.shared().call_deferred(|c| c.lo_open(oid, mode))?;
        let lo = (fd >= 0).then(|| {
            debug!("opened large object {} as descriptor {}", oid, fd);
            LargeObject {
                conn: self.shared().clone(),
                fd: Cell::new(Some(fd)),
            }
        });
        // On a callback failure the object is dropped here, which closes
        // the descriptor the server just opened.
        raised?;
        Ok(lo)
    }
}

fn valid_oid(oid: Oid) -> Option<Oid> {
    (oid != INVALID_OID).then_some(oid)
}

pub struct LargeObject {
    conn: Rc<ConnShared>,
    fd: Cell<Option<i32>>,
}

impl std::fmt::Debug for LargeObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LargeObject").field("fd", &self.fd.get()).finish()
    }
}

impl LargeObject {
    /// Server-side descriptor, `None` once closed.
    pub fn fd(&self) -> Option<i32> {
        self.fd.get()
    }

    fn call<R>(&self, f: impl FnOnce(&mut PgConn, i32) -> R) -> Result<R> {
        let fd = self
            .fd
            .get()
            .ok_or(Error::InvalidHandle(HandleKind::LargeObject))?;
        self.conn.call(|c| f(c, fd))
    }

    /// Bytes written, or -1.
    pub fn write(&self, data: &[u8]) -> Result<i32> {
        self.call(|c, fd| c.lo_write(fd, data))
    }

    /// Up to `len` bytes; empty at end of object, `None` on failure.
    pub fn read(&self, len: usize) -> Result<Option<Vec<u8>>> {
        self.call(|c, fd| c.lo_read(fd, len))
    }

    /// Move the read/write position; `whence` is one of the `SEEK_*`
    /// constants. Returns the new position, or -1.
    pub fn lseek(&self, offset: i32, whence: i32) -> Result<i32> {
        self.call(|c, fd| c.lo_lseek(fd, offset, whence))
    }

    pub fn lseek64(&self, offset: i64, whence: i32) -> Result<i64> {
        self.call(|c, fd| c.lo_lseek64(fd, offset, whence))
    }

    pub fn tell(&self) -> Result<i32> {
        self.call(|c, fd| c.lo_tell(fd))
    }

    pub fn tell64(&self) -> Result<i64> {
        self.call(|c, fd| c.lo_tell64(fd))
    }

    pub fn truncate(&self, len: usize) -> Result<i32> {
        self.call(|c, fd| c.lo_truncate(fd, len))
    }

    pub fn truncate64(&self, len: i64) -> Result<i32> {
        self.call(|c, fd| c.lo_truncate64(fd, len))
    }

    /// Close the descriptor. Afterwards every call on this object fails
    /// with `InvalidHandle`, and dropping it closes nothing.
    pub fn close(&self) -> Result<i32> {
        let fd = self
            .fd
            .get()
            .ok_or(Error::InvalidHandle(HandleKind::LargeObject))?;
        let (rc, raised) = self.conn.call_deferred(|c| c.lo_close(fd))?;
        // The server has seen the close whatever the callbacks did.
        self.fd.set(None);
        raised.map(|()| rc)
    }

    /// Close if still open; does nothing otherwise.
    pub fn clear(&self) {
        if self.fd.get().is_some() {
            let _ = self.close();
        }
    }
}

impl Drop for LargeObject {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::connectdb;
    use crate::host::HostError;
    use crate::result::ResultSet;
    use mesh_pq::testing::{lo_function_oid, FakeBackend};
    use mesh_pq::{INV_READ, INV_WRITE, SEEK_SET};

    #[test]
    fn test_open_write_seek_read_close() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.handshake();
            c.serve_lo_catalog();
            let (oid, _) = c.expect_function_call();
            assert_eq!(oid, lo_function_oid("lo_open"));
            c.send_function_result(Some(&3_i32.to_be_bytes()));
            let (oid, args) = c.expect_function_call();
            assert_eq!(oid, lo_function_oid("lowrite"));
            assert_eq!(args[0], 3_i32.to_be_bytes().to_vec());
            c.send_function_result(Some(&4_i32.to_be_bytes()));
            let (oid, _) = c.expect_function_call();
            assert_eq!(oid, lo_function_oid("lo_lseek"));
            c.send_function_result(Some(&0_i32.to_be_bytes()));
            let (oid, _) = c.expect_function_call();
            assert_eq!(oid, lo_function_oid("loread"));
            c.send_function_result(Some(b"data"));
            let (oid, _) = c.expect_function_call();
            assert_eq!(oid, lo_function_oid("lo_close"));
            c.send_function_result(Some(&0_i32.to_be_bytes()));
            // Nothing else: neither the explicit drop nor the connection
            // close may send a second lo_close.
            let (tag, _) = c.read_message();
            assert_eq!(tag, b'X');
        });
        let conn = connectdb(&backend.conninfo());
        let lo = conn.lo_open(9000, INV_READ | INV_WRITE).unwrap().unwrap();
        assert_eq!(lo.fd(), Some(3));
        assert_eq!(lo.write(b"data"), Ok(4));
        assert_eq!(lo.lseek(0, SEEK_SET), Ok(0));
        assert_eq!(lo.read(16), Ok(Some(b"data".to_vec())));
        assert_eq!(lo.close(), Ok(0));
        assert_eq!(lo.fd(), None);
        assert_eq!(lo.tell(), Err(Error::InvalidHandle(HandleKind::LargeObject)));
        drop(lo);
        drop(conn);
        backend.join();
    }

    #[test]
    fn test_drop_closes_open_descriptor_and_keeps_connection_alive() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.handshake();
            c.serve_lo_catalog();
            c.expect_function_call();
            c.send_function_result(Some(&1_i32.to_be_bytes()));
            let (oid, args) = c.expect_function_call();
            assert_eq!(oid, lo_function_oid("lo_close"));
            assert_eq!(args[0], 1_i32.to_be_bytes().to_vec());
            c.send_function_result(Some(&0_i32.to_be_bytes()));
        });
        let conn = connectdb(&backend.conninfo());
        let lo = conn.lo_open(9001, INV_READ).unwrap().unwrap();
        // The object outlives the connection wrapper and still closes.
        drop(conn);
        drop(lo);
        backend.join();
    }

    fn fail_on_notice(conn: &crate::conn::Connection) {
        conn.set_notice_receiver(Some(Box::new(|_: &ResultSet| {
            Err(HostError::new("boom"))
        })))
        .unwrap();
    }

    #[test]
    fn test_close_is_recorded_when_callback_fails() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.handshake();
            c.serve_lo_catalog();
            c.expect_function_call();
            c.send_function_result(Some(&3_i32.to_be_bytes()));
            let (oid, _) = c.expect_function_call();
            assert_eq!(oid, lo_function_oid("lo_close"));
            c.send_notice("closing");
            c.send_function_result(Some(&0_i32.to_be_bytes()));
            // A second lo_close would show up here instead of Terminate.
            let (tag, _) = c.read_message();
            assert_eq!(tag, b'X');
        });
        let conn = connectdb(&backend.conninfo());
        let lo = conn.lo_open(9002, INV_READ).unwrap().unwrap();
        fail_on_notice(&conn);
        assert_eq!(lo.close(), Err(Error::Callback("boom".to_string())));
        assert_eq!(lo.fd(), None);
        drop(lo);
        drop(conn);
        backend.join();
    }

    #[test]
    fn test_open_closes_descriptor_when_callback_fails() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.handshake();
            c.serve_lo_catalog();
            let (oid, _) = c.expect_function_call();
            assert_eq!(oid, lo_function_oid("lo_open"));
            c.send_notice("opening");
            c.send_function_result(Some(&5_i32.to_be_bytes()));
            let (oid, args) = c.expect_function_call();
            assert_eq!(oid, lo_function_oid("lo_close"));
            assert_eq!(args[0], 5_i32.to_be_bytes().to_vec());
            c.send_function_result(Some(&0_i32.to_be_bytes()));
            let (tag, _) = c.read_message();
            assert_eq!(tag, b'X');
        });
        let conn = connectdb(&backend.conninfo());
        fail_on_notice(&conn);
        assert_eq!(
            conn.lo_open(9003, INV_READ).unwrap_err(),
            Error::Callback("boom".to_string())
        );
        drop(conn);
        backend.join();
    }

    #[test]
    fn test_open_failure_is_none() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.handshake();
            c.serve_lo_catalog();
            c.expect_function_call();
            c.send_error("42704", "large object 5 does not exist");
            c.send_ready(b'I');
        });
        let conn = connectdb(&backend.conninfo());
        assert!(conn.lo_open(5, INV_READ).unwrap().is_none());
        assert!(conn
            .error_message()
            .unwrap()
            .contains("large object 5 does not exist"));
        drop(conn);
        backend.join();
    }

    #[test]
    fn test_import_export_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in.bin");
        let dst = dir.path().join("out.bin");
        std::fs::write(&src, b"blob").unwrap();
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.handshake();
            c.serve_lo_catalog();
            c.expect_function_call();
            c.send_function_result(Some(&7001_i32.to_be_bytes()));
            c.expect_function_call();
            c.send_function_result(Some(&0_i32.to_be_bytes()));
            c.expect_function_call();
            c.send_function_result(Some(&4_i32.to_be_bytes()));
            c.expect_function_call();
            c.send_function_result(Some(&0_i32.to_be_bytes()));

            c.expect_function_call();
            c.send_function_result(Some(&0_i32.to_be_bytes()));
            c.expect_function_call();
            c.send_function_result(Some(b"blob"));
            c.expect_function_call();
            c.send_function_result(Some(b""));
            c.expect_function_call();
            c.send_function_result(Some(&0_i32.to_be_bytes()));
        });
        let conn = connectdb(&backend.conninfo());
        let oid = conn.lo_import(src.to_str().unwrap()).unwrap();
        assert_eq!(oid, Some(7001));
        assert_eq!(conn.lo_export(7001, dst.to_str().unwrap()), Ok(true));
        assert_eq!(std::fs::read(&dst).unwrap(), b"blob");
        drop(conn);
        backend.join();
    }
}
