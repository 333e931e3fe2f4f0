//! Large objects over the fast-path function call protocol.
//!
//! The OIDs of the server-side `lo_*` functions are looked up once per
//! connection from `pg_catalog.pg_proc` and cached until the next reset.
//! Every call here blocks, and all of them must run inside a transaction.

use std::fs::File;
use std::io::{Read, Write};

use tracing::debug;

use crate::conn::{AsyncStatus, PgConn};
use crate::protocol::{self, MsgReader};
use crate::result::PgResult;
use crate::status::{ConnStatus, ExecStatus, TransactionStatus};
use crate::types::{Oid, INVALID_OID};

pub const INV_WRITE: i32 = 0x0002_0000;
pub const INV_READ: i32 = 0x0004_0000;

pub const SEEK_SET: i32 = 0;
pub const SEEK_CUR: i32 = 1;
pub const SEEK_END: i32 = 2;

/// Chunk size for lo_import / lo_export.
const LO_BUFSIZE: usize = 8192;

const LO_CATALOG_QUERY: &str = "select proname, oid from pg_catalog.pg_proc \
     where proname in ('lo_open', 'lo_close', 'lo_creat', 'lo_create', 'lo_unlink', \
     'lo_lseek', 'lo_lseek64', 'lo_tell', 'lo_tell64', 'lo_truncate', 'lo_truncate64', \
     'loread', 'lowrite') \
     and pronamespace = (select oid from pg_catalog.pg_namespace where nspname = 'pg_catalog')";

/// Function OIDs of the large-object server functions. Zero means the
/// server does not have that function.
#[derive(Debug, Clone, Default)]
pub(crate) struct LoFuncs {
    lo_open: Oid,
    lo_close: Oid,
    lo_creat: Oid,
    lo_create: Oid,
    lo_unlink: Oid,
    lo_lseek: Oid,
    lo_lseek64: Oid,
    lo_tell: Oid,
    lo_tell64: Oid,
    lo_truncate: Oid,
    lo_truncate64: Oid,
    lo_read: Oid,
    lo_write: Oid,
}

impl LoFuncs {
    fn slot(&mut self, proname: &str) -> Option<&mut Oid> {
        Some(match proname {
            "lo_open" => &mut self.lo_open,
            "lo_close" => &mut self.lo_close,
            "lo_creat" => &mut self.lo_creat,
            "lo_create" => &mut self.lo_create,
            "lo_unlink" => &mut self.lo_unlink,
            "lo_lseek" => &mut self.lo_lseek,
            "lo_lseek64" => &mut self.lo_lseek64,
            "lo_tell" => &mut self.lo_tell,
            "lo_tell64" => &mut self.lo_tell64,
            "lo_truncate" => &mut self.lo_truncate,
            "lo_truncate64" => &mut self.lo_truncate64,
            "loread" => &mut self.lo_read,
            "lowrite" => &mut self.lo_write,
            _ => return None,
        })
    }
}

/// One fast-path argument: a 4-byte integer or raw bytes.
enum FnArg<'a> {
    Int(i32),
    Int64(i64),
    Bytes(&'a [u8]),
}

impl PgConn {
    // ── Fast Path ──────────────────────────────────────────────────────

    /// Fetch and cache the function OIDs (`lo_initialize`).
    fn lo_initialize(&mut self) -> Result<(), String> {
        if self.lo_funcs.is_some() {
            return Ok(());
        }
        let res = self
            .exec(LO_CATALOG_QUERY)
            .ok_or_else(|| self.error_message.clone())?;
        if res.status() != ExecStatus::TuplesOk {
            return Err(
                "query to initialize large object functions did not return data".to_string(),
            );
        }
        let mut funcs = LoFuncs::default();
        for row in 0..res.ntuples() {
            let name = String::from_utf8_lossy(res.getvalue(row, 0).unwrap_or(b"")).into_owned();
            let oid = std::str::from_utf8(res.getvalue(row, 1).unwrap_or(b""))
                .ok()
                .and_then(|s| s.parse::<Oid>().ok())
                .unwrap_or(INVALID_OID);
            if let Some(slot) = funcs.slot(&name) {
                *slot = oid;
            }
        }
        for (name, oid) in [
            ("lo_open", funcs.lo_open),
            ("lo_close", funcs.lo_close),
            ("lo_creat", funcs.lo_creat),
            ("lo_unlink", funcs.lo_unlink),
            ("lo_lseek", funcs.lo_lseek),
            ("lo_tell", funcs.lo_tell),
            ("loread", funcs.lo_read),
            ("lowrite", funcs.lo_write),
        ] {
            if oid == INVALID_OID {
                return Err(format!("cannot determine OID of function {}", name));
            }
        }
        debug!("large object functions initialized");
        self.lo_funcs = Some(funcs);
        Ok(())
    }

    /// Resolve one function OID, initializing the cache on first use.
    fn lo_func(&mut self, name: &str, pick: fn(&LoFuncs) -> Oid) -> Result<Oid, String> {
        self.lo_initialize()?;
        match self.lo_funcs.as_ref().map(pick) {
            Some(oid) if oid != INVALID_OID => Ok(oid),
            _ => Err(format!("cannot determine OID of function {}", name)),
        }
    }

    /// Run a FunctionCall and wait for its result (`PQfn`). `Ok(None)` is
    /// a NULL result.
    fn fn_call(&mut self, fn_oid: Oid, args: &[FnArg<'_>]) -> Result<Option<Vec<u8>>, String> {
        if self.status != ConnStatus::Ok || self.stream.is_none() {
            return Err("no connection to the server".to_string());
        }
        if self.async_status != AsyncStatus::Idle {
            return Err("connection in wrong state".to_string());
        }
        self.error_message.clear();

        let encoded: Vec<Vec<u8>> = args
            .iter()
            .map(|arg| match arg {
                FnArg::Int(v) => v.to_be_bytes().to_vec(),
                FnArg::Int64(v) => v.to_be_bytes().to_vec(),
                FnArg::Bytes(b) => b.to_vec(),
            })
            .collect();
        let slices: Vec<&[u8]> = encoded.iter().map(Vec::as_slice).collect();
        let mut buf = Vec::new();
        protocol::write_function_call(&mut buf, fn_oid, &slices);
        self.queue(&buf);
        if let Err(msg) = self.flush_blocking() {
            self.fail_connection(&msg);
            return Err(msg);
        }

        let mut value = None;
        let mut error: Option<String> = None;
        loop {
            let message = match self.take_message() {
                Ok(m) => m,
                Err(msg) => {
                    self.fail_connection(&msg);
                    return Err(msg);
                }
            };
            let Some((tag, body)) = message else {
                if let Err(msg) = self.wait_and_read() {
                    self.fail_connection(&msg);
                    return Err(msg);
                }
                continue;
            };
            let mut r = MsgReader::new(&body);
            match tag {
                b'V' => {
                    let len = r.i32()?;
                    value = if len < 0 {
                        None
                    } else {
                        Some(r.bytes(len as usize)?.to_vec())
                    };
                }
                b'E' => {
                    let res = PgResult::from_fields(
                        ExecStatus::FatalError,
                        protocol::parse_fields(&body),
                        self.verbosity,
                    );
                    error = Some(res.error_message().to_string());
                }
                b'A' => self.handle_notify(&body)?,
                b'N' => self.handle_notice(&body),
                b'S' => self.handle_parameter_status(&body)?,
                b'Z' => {
                    self.txn_status = TransactionStatus::from_ready_byte(r.byte()?);
                    break;
                }
                other => {
                    let msg = format!(
                        "protocol error: id=0x{:02x}",
                        other
                    );
                    self.fail_connection(&msg);
                    return Err(msg);
                }
            }
        }
        match error {
            Some(msg) => Err(msg),
            None => Ok(value),
        }
    }

    fn fn_int(&mut self, fn_oid: Oid, args: &[FnArg<'_>]) -> Result<i32, String> {
        match self.fn_call(fn_oid, args)? {
            Some(v) if v.len() == 4 => Ok(i32::from_be_bytes([v[0], v[1], v[2], v[3]])),
            _ => Err("function returned an unexpected result".to_string()),
        }
    }

    fn fn_int64(&mut self, fn_oid: Oid, args: &[FnArg<'_>]) -> Result<i64, String> {
        match self.fn_call(fn_oid, args)? {
            Some(v) if v.len() == 8 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&v);
                Ok(i64::from_be_bytes(raw))
            }
            _ => Err("function returned an unexpected result".to_string()),
        }
    }

    /// Store `msg` as the error message and return `fail`.
    fn lo_fail<T>(&mut self, msg: String, fail: T) -> T {
        self.set_error(&msg);
        fail
    }

    // ── Large Object API ───────────────────────────────────────────────

    /// Open a large object; returns a descriptor or -1.
    pub fn lo_open(&mut self, lobj_id: Oid, mode: i32) -> i32 {
        let result = self
            .lo_func("lo_open", |f| f.lo_open)
            .and_then(|f| self.fn_int(f, &[FnArg::Int(lobj_id as i32), FnArg::Int(mode)]));
        result.unwrap_or_else(|msg| self.lo_fail(msg, -1))
    }

    pub fn lo_close(&mut self, fd: i32) -> i32 {
        let result = self
            .lo_func("lo_close", |f| f.lo_close)
            .and_then(|f| self.fn_int(f, &[FnArg::Int(fd)]));
        result.unwrap_or_else(|msg| self.lo_fail(msg, -1))
    }

    /// Create a large object with a server-assigned OID.
    pub fn lo_creat(&mut self, mode: i32) -> Oid {
        let result = self
            .lo_func("lo_creat", |f| f.lo_creat)
            .and_then(|f| self.fn_int(f, &[FnArg::Int(mode)]));
        match result {
            Ok(oid) => oid as Oid,
            Err(msg) => self.lo_fail(msg, INVALID_OID),
        }
    }

    /// Create a large object with the requested OID (0 lets the server pick).
    pub fn lo_create(&mut self, lobj_id: Oid) -> Oid {
        let result = self
            .lo_func("lo_create", |f| f.lo_create)
            .and_then(|f| self.fn_int(f, &[FnArg::Int(lobj_id as i32)]));
        match result {
            Ok(oid) => oid as Oid,
            Err(msg) => self.lo_fail(msg, INVALID_OID),
        }
    }

    pub fn lo_unlink(&mut self, lobj_id: Oid) -> i32 {
        let result = self
            .lo_func("lo_unlink", |f| f.lo_unlink)
            .and_then(|f| self.fn_int(f, &[FnArg::Int(lobj_id as i32)]));
        result.unwrap_or_else(|msg| self.lo_fail(msg, -1))
    }

    /// Read up to `len` bytes; `None` on error.
    pub fn lo_read(&mut self, fd: i32, len: usize) -> Option<Vec<u8>> {
        if len > i32::MAX as usize {
            return self.lo_fail("argument of lo_read exceeds integer range".to_string(), None);
        }
        let result = self
            .lo_func("loread", |f| f.lo_read)
            .and_then(|f| self.fn_call(f, &[FnArg::Int(fd), FnArg::Int(len as i32)]));
        match result {
            Ok(data) => Some(data.unwrap_or_default()),
            Err(msg) => self.lo_fail(msg, None),
        }
    }

    /// Write `data`; returns the number of bytes written or -1.
    pub fn lo_write(&mut self, fd: i32, data: &[u8]) -> i32 {
        if data.len() > i32::MAX as usize {
            return self.lo_fail("argument of lo_write exceeds integer range".to_string(), -1);
        }
        let result = self
            .lo_func("lowrite", |f| f.lo_write)
            .and_then(|f| self.fn_int(f, &[FnArg::Int(fd), FnArg::Bytes(data)]));
        result.unwrap_or_else(|msg| self.lo_fail(msg, -1))
    }

    pub fn lo_lseek(&mut self, fd: i32, offset: i32, whence: i32) -> i32 {
        let result = self.lo_func("lo_lseek", |f| f.lo_lseek).and_then(|f| {
            self.fn_int(f, &[FnArg::Int(fd), FnArg::Int(offset), FnArg::Int(whence)])
        });
        result.unwrap_or_else(|msg| self.lo_fail(msg, -1))
    }

    pub fn lo_lseek64(&mut self, fd: i32, offset: i64, whence: i32) -> i64 {
        let result = self.lo_func("lo_lseek64", |f| f.lo_lseek64).and_then(|f| {
            self.fn_int64(f, &[FnArg::Int(fd), FnArg::Int64(offset), FnArg::Int(whence)])
        });
        result.unwrap_or_else(|msg| self.lo_fail(msg, -1))
    }

    pub fn lo_tell(&mut self, fd: i32) -> i32 {
        let result = self
            .lo_func("lo_tell", |f| f.lo_tell)
            .and_then(|f| self.fn_int(f, &[FnArg::Int(fd)]));
        result.unwrap_or_else(|msg| self.lo_fail(msg, -1))
    }

    pub fn lo_tell64(&mut self, fd: i32) -> i64 {
        let result = self
            .lo_func("lo_tell64", |f| f.lo_tell64)
            .and_then(|f| self.fn_int64(f, &[FnArg::Int(fd)]));
        result.unwrap_or_else(|msg| self.lo_fail(msg, -1))
    }

    pub fn lo_truncate(&mut self, fd: i32, len: usize) -> i32 {
        if len > i32::MAX as usize {
            return self.lo_fail("argument of lo_truncate exceeds integer range".to_string(), -1);
        }
        let result = self
            .lo_func("lo_truncate", |f| f.lo_truncate)
            .and_then(|f| self.fn_int(f, &[FnArg::Int(fd), FnArg::Int(len as i32)]));
        result.unwrap_or_else(|msg| self.lo_fail(msg, -1))
    }

    pub fn lo_truncate64(&mut self, fd: i32, len: i64) -> i32 {
        let result = self
            .lo_func("lo_truncate64", |f| f.lo_truncate64)
            .and_then(|f| self.fn_int(f, &[FnArg::Int(fd), FnArg::Int64(len)]));
        result.unwrap_or_else(|msg| self.lo_fail(msg, -1))
    }

    // ── Client-Side Files ──────────────────────────────────────────────

    /// Copy a local file into a new large object.
    pub fn lo_import(&mut self, filename: &str) -> Oid {
        self.lo_import_internal(filename, None)
    }

    /// Like [`lo_import`](Self::lo_import) with a caller-chosen OID.
    pub fn lo_import_with_oid(&mut self, filename: &str, lobj_id: Oid) -> Oid {
        self.lo_import_internal(filename, Some(lobj_id))
    }

    fn lo_import_internal(&mut self, filename: &str, lobj_id: Option<Oid>) -> Oid {
        let mut file = match File::open(filename) {
            Ok(f) => f,
            Err(e) => {
                return self.lo_fail(
                    format!("could not open file \"{}\": {}", filename, e),
                    INVALID_OID,
                )
            }
        };
        let oid = match lobj_id {
            Some(oid) => self.lo_create(oid),
            None => self.lo_creat(INV_READ | INV_WRITE),
        };
        if oid == INVALID_OID {
            return INVALID_OID;
        }
        let fd = self.lo_open(oid, INV_WRITE);
        if fd < 0 {
            return INVALID_OID;
        }
        let mut buf = [0u8; LO_BUFSIZE];
        loop {
            let n = match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    let _ = self.lo_close(fd);
                    return self.lo_fail(
                        format!("could not read from file \"{}\": {}", filename, e),
                        INVALID_OID,
                    );
                }
            };
            if self.lo_write(fd, &buf[..n]) < n as i32 {
                return INVALID_OID;
            }
        }
        if self.lo_close(fd) != 0 {
            return INVALID_OID;
        }
        oid
    }

    /// Copy a large object into a local file. Returns 1 on success, -1 on
    /// failure.
    pub fn lo_export(&mut self, lobj_id: Oid, filename: &str) -> i32 {
        let fd = self.lo_open(lobj_id, INV_READ);
        if fd < 0 {
            return -1;
        }
        let mut file = match File::create(filename) {
            Ok(f) => f,
            Err(e) => {
                let _ = self.lo_close(fd);
                return self.lo_fail(format!("could not open file \"{}\": {}", filename, e), -1);
            }
        };
        loop {
            let Some(chunk) = self.lo_read(fd, LO_BUFSIZE) else {
                return -1;
            };
            if chunk.is_empty() {
                break;
            }
            if let Err(e) = file.write_all(&chunk) {
                let _ = self.lo_close(fd);
                return self.lo_fail(format!("could not write to file \"{}\": {}", filename, e), -1);
            }
        }
        if self.lo_close(fd) != 0 {
            return -1;
        }
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::connectdb;
    use crate::testing::{lo_function_oid, FakeBackend};

    #[test]
    fn test_lo_open_write_read() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.handshake();
            c.serve_lo_catalog();

            let (oid, args) = c.expect_function_call();
            assert_eq!(oid, lo_function_oid("lo_open"));
            assert_eq!(args[0], 5000_i32.to_be_bytes().to_vec());
            assert_eq!(args[1], (INV_READ | INV_WRITE).to_be_bytes().to_vec());
            c.send_function_result(Some(&0_i32.to_be_bytes()));

            let (oid, args) = c.expect_function_call();
            assert_eq!(oid, lo_function_oid("lowrite"));
            assert_eq!(args[1], b"hello".to_vec());
            c.send_function_result(Some(&5_i32.to_be_bytes()));

            let (oid, _) = c.expect_function_call();
            assert_eq!(oid, lo_function_oid("lo_lseek64"));
            c.send_function_result(Some(&0_i64.to_be_bytes()));

            let (oid, args) = c.expect_function_call();
            assert_eq!(oid, lo_function_oid("loread"));
            assert_eq!(args[1], 64_i32.to_be_bytes().to_vec());
            c.send_function_result(Some(b"hello"));

            c.expect_function_call();
            c.send_function_result(Some(&0_i32.to_be_bytes()));
        });
        let mut conn = connectdb(&backend.conninfo());
        let fd = conn.lo_open(5000, INV_READ | INV_WRITE);
        assert_eq!(fd, 0, "{}", conn.error_message());
        assert_eq!(conn.lo_write(fd, b"hello"), 5);
        assert_eq!(conn.lo_lseek64(fd, 0, SEEK_SET), 0);
        assert_eq!(conn.lo_read(fd, 64).as_deref(), Some(&b"hello"[..]));
        assert_eq!(conn.lo_close(fd), 0);
        drop(conn);
        backend.join();
    }

    #[test]
    fn test_lo_error_sets_message() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.handshake();
            c.serve_lo_catalog();
            c.expect_function_call();
            c.send_error("42704", "large object 77 does not exist");
            c.send_ready(b'I');
        });
        let mut conn = connectdb(&backend.conninfo());
        assert_eq!(conn.lo_open(77, INV_READ), -1);
        assert!(conn.error_message().contains("large object 77 does not exist"));
        drop(conn);
        backend.join();
    }

    #[test]
    fn test_lo_import_and_export() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in.bin");
        let dst = dir.path().join("out.bin");
        std::fs::write(&src, b"payload").unwrap();

        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.handshake();
            c.serve_lo_catalog();
            // lo_import: creat, open, write, close
            let (oid, _) = c.expect_function_call();
            assert_eq!(oid, lo_function_oid("lo_creat"));
            c.send_function_result(Some(&6001_i32.to_be_bytes()));
            c.expect_function_call();
            c.send_function_result(Some(&1_i32.to_be_bytes()));
            let (_, args) = c.expect_function_call();
            assert_eq!(args[1], b"payload".to_vec());
            c.send_function_result(Some(&7_i32.to_be_bytes()));
            c.expect_function_call();
            c.send_function_result(Some(&0_i32.to_be_bytes()));
            // lo_export: open, read, read (EOF), close
            c.expect_function_call();
            c.send_function_result(Some(&2_i32.to_be_bytes()));
            c.expect_function_call();
            c.send_function_result(Some(b"payload"));
            c.expect_function_call();
            c.send_function_result(Some(b""));
            c.expect_function_call();
            c.send_function_result(Some(&0_i32.to_be_bytes()));
        });
        let mut conn = connectdb(&backend.conninfo());
        let oid = conn.lo_import(src.to_str().unwrap());
        assert_eq!(oid, 6001, "{}", conn.error_message());
        assert_eq!(conn.lo_export(oid, dst.to_str().unwrap()), 1);
        assert_eq!(std::fs::read(&dst).unwrap(), b"payload");
        drop(conn);
        backend.join();
    }

    #[test]
    fn test_lo_import_missing_file() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.handshake();
        });
        let mut conn = connectdb(&backend.conninfo());
        assert_eq!(conn.lo_import("/nonexistent/mesh-pq-test"), INVALID_OID);
        assert!(conn.error_message().contains("could not open file"));
        drop(conn);
        backend.join();
    }
}
