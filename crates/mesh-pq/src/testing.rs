//! Scripted in-process PostgreSQL backend for tests.
//!
//! [`FakeBackend::start`] binds a loopback listener and runs a script on a
//! thread; the script accepts connections and plays the server side of the
//! protocol message by message. Assertion failures inside the script are
//! re-raised by [`FakeBackend::join`].

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::JoinHandle;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::auth;
use crate::protocol::{CANCEL_REQUEST_CODE, PROTOCOL_VERSION, SSL_REQUEST_CODE};
use crate::types::{Oid, OIDOID, TEXTOID};

/// Backend key reported in BackendKeyData.
pub const BACKEND_KEY: i32 = 0x5eed;
/// Backend pid reported in BackendKeyData.
pub const BACKEND_PID: i32 = 4242;

const IO_TIMEOUT: Duration = Duration::from_secs(10);

const LO_FUNCTIONS: &[(&str, Oid)] = &[
    ("lo_open", 952),
    ("lo_close", 953),
    ("lo_creat", 957),
    ("lo_create", 715),
    ("lo_unlink", 964),
    ("lo_lseek", 956),
    ("lo_lseek64", 3170),
    ("lo_tell", 958),
    ("lo_tell64", 3171),
    ("lo_truncate", 1004),
    ("lo_truncate64", 3172),
    ("loread", 954),
    ("lowrite", 955),
];

/// OID the fake catalog reports for a large-object function.
pub fn lo_function_oid(name: &str) -> Oid {
    LO_FUNCTIONS
        .iter()
        .find(|(n, _)| *n == name)
        .map_or(0, |(_, oid)| *oid)
}

pub struct FakeBackend {
    port: u16,
    handle: Option<JoinHandle<()>>,
}

/// The listening side handed to a script.
pub struct Session {
    listener: TcpListener,
}

/// One accepted client connection.
pub struct BackendConn {
    stream: TcpStream,
}

/// The messages of one extended-protocol command, collected up to Sync.
#[derive(Debug, Default)]
pub struct ExtendedQuery {
    pub statement: String,
    pub sql: String,
    pub param_types: Vec<Oid>,
    pub bound_statement: String,
    pub formats: Vec<i16>,
    pub values: Vec<Option<Vec<u8>>>,
    pub result_format: i16,
    pub describe: Option<(u8, String)>,
    pub executed: bool,
}

impl FakeBackend {
    pub fn start<F>(script: F) -> FakeBackend
    where
        F: FnOnce(&Session) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake backend");
        let port = listener.local_addr().expect("local addr").port();
        let handle = std::thread::spawn(move || {
            let session = Session { listener };
            script(&session);
        });
        FakeBackend {
            port,
            handle: Some(handle),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn conninfo(&self) -> String {
        format!(
            "host=127.0.0.1 port={} user=tester dbname=testdb sslmode=disable",
            self.port
        )
    }

    /// Wait for the script to finish, re-raising its panics.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(panic) = handle.join() {
                std::panic::resume_unwind(panic);
            }
        }
    }
}

impl Session {
    pub fn accept(&self) -> BackendConn {
        let (stream, _) = self.listener.accept().expect("accept");
        stream.set_read_timeout(Some(IO_TIMEOUT)).expect("timeout");
        stream.set_nodelay(true).expect("nodelay");
        BackendConn { stream }
    }

    /// Accept a cancel connection and return its (pid, key).
    pub fn accept_cancel(&self) -> (i32, i32) {
        let mut conn = self.accept();
        let len = conn.read_i32();
        assert_eq!(len, 16);
        assert_eq!(conn.read_i32(), CANCEL_REQUEST_CODE);
        (conn.read_i32(), conn.read_i32())
    }
}

impl BackendConn {
    // ── Raw I/O ────────────────────────────────────────────────────────

    fn read_exact(&mut self, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        self.stream.read_exact(&mut buf).expect("read from client");
        buf
    }

    fn read_i32(&mut self) -> i32 {
        let b = self.read_exact(4);
        i32::from_be_bytes([b[0], b[1], b[2], b[3]])
    }

    /// Read one tagged message.
    pub fn read_message(&mut self) -> (u8, Vec<u8>) {
        let tag = self.read_exact(1)[0];
        let len = self.read_i32() as usize;
        (tag, self.read_exact(len - 4))
    }

    /// Read one message and assert its tag; returns the body.
    pub fn expect(&mut self, tag: u8) -> Vec<u8> {
        let (got, body) = self.read_message();
        assert_eq!(
            got as char, tag as char,
            "expected message {:?}, got {:?}",
            tag as char, got as char
        );
        body
    }

    pub fn send(&mut self, tag: u8, body: &[u8]) {
        let mut buf = Vec::with_capacity(body.len() + 5);
        buf.push(tag);
        buf.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        buf.extend_from_slice(body);
        self.stream.write_all(&buf).expect("write to client");
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("write to client");
    }

    // ── Startup ────────────────────────────────────────────────────────

    /// Read the StartupMessage, declining an SSLRequest first if one
    /// arrives. Returns the startup parameters.
    pub fn read_startup(&mut self) -> Vec<(String, String)> {
        loop {
            let len = self.read_i32() as usize;
            let code = self.read_i32();
            if code == SSL_REQUEST_CODE {
                self.send_raw(b"N");
                continue;
            }
            assert_eq!(code, PROTOCOL_VERSION);
            let body = self.read_exact(len - 8);
            let mut strings = body
                .split(|&b| b == 0)
                .map(|s| String::from_utf8_lossy(s).into_owned());
            let mut params = Vec::new();
            while let (Some(k), Some(v)) = (strings.next(), strings.next()) {
                if k.is_empty() {
                    break;
                }
                params.push((k, v));
            }
            return params;
        }
    }

    pub fn read_ssl_request_and_decline(&mut self) {
        assert_eq!(self.read_i32(), 8);
        assert_eq!(self.read_i32(), SSL_REQUEST_CODE);
        self.send_raw(b"N");
    }

    pub fn send_auth_ok(&mut self) {
        self.send(b'R', &0_i32.to_be_bytes());
    }

    pub fn send_auth_md5(&mut self, salt: &[u8]) {
        let mut body = 5_i32.to_be_bytes().to_vec();
        body.extend_from_slice(salt);
        self.send(b'R', &body);
    }

    /// Run the server side of SCRAM-SHA-256, up to and including
    /// AuthenticationSASLFinal. Panics if the client's proof is wrong.
    pub fn scram_exchange(&mut self, password: &str) {
        let mut body = 10_i32.to_be_bytes().to_vec();
        body.extend_from_slice(b"SCRAM-SHA-256\0\0");
        self.send(b'R', &body);

        let initial = self.expect(b'p');
        let mech_end = initial.iter().position(|&b| b == 0).expect("mechanism");
        assert_eq!(&initial[..mech_end], b"SCRAM-SHA-256");
        let data = &initial[mech_end + 5..];
        let client_first = String::from_utf8_lossy(data).into_owned();
        let client_first_bare = client_first
            .strip_prefix("n,,")
            .expect("gs2 header")
            .to_string();
        let nonce = client_first_bare
            .split(',')
            .find_map(|p| p.strip_prefix("r="))
            .expect("client nonce")
            .to_string();

        let salt = b"mesh-salt";
        let iterations = 4096;
        let server_first = format!(
            "r={}srvnonce,s={},i={}",
            nonce,
            BASE64.encode(salt),
            iterations
        );
        let mut body = 11_i32.to_be_bytes().to_vec();
        body.extend_from_slice(server_first.as_bytes());
        self.send(b'R', &body);

        let client_final = String::from_utf8_lossy(&self.expect(b'p')).into_owned();
        let server_final = auth::scram_server_final(
            password,
            salt,
            iterations,
            &client_first_bare,
            &server_first,
            &client_final,
        )
        .expect("client proof");
        let mut body = 12_i32.to_be_bytes().to_vec();
        body.extend_from_slice(server_final.as_bytes());
        self.send(b'R', &body);
    }

    /// ParameterStatus, BackendKeyData and ReadyForQuery; AuthenticationOk
    /// must already have been sent.
    pub fn finish_startup(&mut self) {
        self.send_parameter_status("server_version", "16.2");
        self.send_parameter_status("client_encoding", "UTF8");
        self.send_parameter_status("standard_conforming_strings", "on");
        let mut key = BACKEND_PID.to_be_bytes().to_vec();
        key.extend_from_slice(&BACKEND_KEY.to_be_bytes());
        self.send(b'K', &key);
        self.send_ready(b'I');
    }

    /// Trust-authenticated startup. Returns the startup parameters.
    pub fn handshake(&mut self) -> Vec<(String, String)> {
        let params = self.read_startup();
        self.send_auth_ok();
        self.finish_startup();
        params
    }

    // ── Asynchronous Messages ──────────────────────────────────────────

    pub fn send_parameter_status(&mut self, name: &str, value: &str) {
        let mut body = Vec::new();
        put_cstr(&mut body, name);
        put_cstr(&mut body, value);
        self.send(b'S', &body);
    }

    fn send_fields(&mut self, tag: u8, severity: &str, sqlstate: &str, msg: &str) {
        let mut body = Vec::new();
        for (code, value) in [(b'S', severity), (b'V', severity), (b'C', sqlstate), (b'M', msg)] {
            body.push(code);
            put_cstr(&mut body, value);
        }
        body.push(0);
        self.send(tag, &body);
    }

    pub fn send_error(&mut self, sqlstate: &str, msg: &str) {
        self.send_fields(b'E', "ERROR", sqlstate, msg);
    }

    pub fn send_error_fatal(&mut self, sqlstate: &str, msg: &str) {
        self.send_fields(b'E', "FATAL", sqlstate, msg);
    }

    pub fn send_notice(&mut self, msg: &str) {
        self.send_fields(b'N', "NOTICE", "00000", msg);
    }

    pub fn send_notification(&mut self, pid: i32, channel: &str, payload: &str) {
        let mut body = pid.to_be_bytes().to_vec();
        put_cstr(&mut body, channel);
        put_cstr(&mut body, payload);
        self.send(b'A', &body);
    }

    // ── Query Responses ────────────────────────────────────────────────

    /// Read a simple Query and return its text.
    pub fn expect_query(&mut self) -> String {
        let body = self.expect(b'Q');
        String::from_utf8_lossy(&body[..body.len().saturating_sub(1)]).into_owned()
    }

    /// Read Parse/Bind/Describe/Execute messages up to and including Sync.
    pub fn expect_extended(&mut self) -> ExtendedQuery {
        let mut q = ExtendedQuery::default();
        loop {
            let (tag, body) = self.read_message();
            let mut r = Cursor { buf: &body, pos: 0 };
            match tag {
                b'P' => {
                    q.statement = r.cstr();
                    q.sql = r.cstr();
                    let n = r.u16();
                    q.param_types = (0..n).map(|_| r.i32() as Oid).collect();
                }
                b'B' => {
                    r.cstr();
                    q.bound_statement = r.cstr();
                    let nformats = r.u16();
                    q.formats = (0..nformats).map(|_| r.u16() as i16).collect();
                    let nvalues = r.u16();
                    q.values = (0..nvalues)
                        .map(|_| {
                            let len = r.i32();
                            (len >= 0).then(|| r.take(len as usize).to_vec())
                        })
                        .collect();
                    let nresult = r.u16();
                    if nresult > 0 {
                        q.result_format = r.u16() as i16;
                    }
                }
                b'D' => {
                    let kind = r.take(1)[0];
                    q.describe = Some((kind, r.cstr()));
                }
                b'E' => q.executed = true,
                b'S' => return q,
                other => panic!("unexpected message {:?} in extended query", other as char),
            }
        }
    }

    pub fn send_row_description(&mut self, columns: &[(&str, Oid)]) {
        let mut body = (columns.len() as i16).to_be_bytes().to_vec();
        for (name, oid) in columns {
            put_cstr(&mut body, name);
            body.extend_from_slice(&0_u32.to_be_bytes());
            body.extend_from_slice(&0_i16.to_be_bytes());
            body.extend_from_slice(&oid.to_be_bytes());
            body.extend_from_slice(&(-1_i16).to_be_bytes());
            body.extend_from_slice(&(-1_i32).to_be_bytes());
            body.extend_from_slice(&0_i16.to_be_bytes());
        }
        self.send(b'T', &body);
    }

    pub fn send_data_row<T: AsRef<[u8]>>(&mut self, cells: &[Option<T>]) {
        let mut body = (cells.len() as i16).to_be_bytes().to_vec();
        for cell in cells {
            match cell {
                Some(v) => {
                    let v = v.as_ref();
                    body.extend_from_slice(&(v.len() as i32).to_be_bytes());
                    body.extend_from_slice(v);
                }
                None => body.extend_from_slice(&(-1_i32).to_be_bytes()),
            }
        }
        self.send(b'D', &body);
    }

    pub fn send_command_complete(&mut self, tag: &str) {
        let mut body = Vec::new();
        put_cstr(&mut body, tag);
        self.send(b'C', &body);
    }

    pub fn send_empty_query(&mut self) {
        self.send(b'I', &[]);
    }

    pub fn send_ready(&mut self, txn: u8) {
        self.send(b'Z', &[txn]);
    }

    pub fn send_parse_complete(&mut self) {
        self.send(b'1', &[]);
    }

    pub fn send_bind_complete(&mut self) {
        self.send(b'2', &[]);
    }

    pub fn send_no_data(&mut self) {
        self.send(b'n', &[]);
    }

    pub fn send_parameter_description(&mut self, types: &[Oid]) {
        let mut body = (types.len() as i16).to_be_bytes().to_vec();
        for oid in types {
            body.extend_from_slice(&oid.to_be_bytes());
        }
        self.send(b't', &body);
    }

    // ── COPY ───────────────────────────────────────────────────────────

    fn send_copy_response(&mut self, tag: u8, ncols: i16) {
        let mut body = vec![0u8];
        body.extend_from_slice(&ncols.to_be_bytes());
        for _ in 0..ncols {
            body.extend_from_slice(&0_i16.to_be_bytes());
        }
        self.send(tag, &body);
    }

    pub fn send_copy_in_response(&mut self, ncols: i16) {
        self.send_copy_response(b'G', ncols);
    }

    pub fn send_copy_out_response(&mut self, ncols: i16) {
        self.send_copy_response(b'H', ncols);
    }

    pub fn send_copy_data(&mut self, data: &[u8]) {
        self.send(b'd', data);
    }

    pub fn send_copy_done(&mut self) {
        self.send(b'c', &[]);
    }

    // ── Fast Path ──────────────────────────────────────────────────────

    /// Answer the large-object catalog lookup.
    pub fn serve_lo_catalog(&mut self) {
        let query = self.expect_query();
        assert!(query.contains("pg_proc"), "unexpected query {}", query);
        self.send_row_description(&[("proname", TEXTOID), ("oid", OIDOID)]);
        for (name, oid) in LO_FUNCTIONS {
            let oid = oid.to_string();
            self.send_data_row(&[Some(name.as_bytes()), Some(oid.as_bytes())]);
        }
        self.send_command_complete(&format!("SELECT {}", LO_FUNCTIONS.len()));
        self.send_ready(b'T');
    }

    /// Read a FunctionCall; returns the function OID and its arguments.
    pub fn expect_function_call(&mut self) -> (Oid, Vec<Vec<u8>>) {
        let body = self.expect(b'F');
        let mut r = Cursor { buf: &body, pos: 0 };
        let oid = r.i32() as Oid;
        let nformats = r.u16();
        for _ in 0..nformats {
            r.u16();
        }
        let nargs = r.u16();
        let args = (0..nargs)
            .map(|_| {
                let len = r.i32();
                r.take(len.max(0) as usize).to_vec()
            })
            .collect();
        (oid, args)
    }

    /// FunctionCallResponse followed by ReadyForQuery (in a transaction).
    pub fn send_function_result<T: AsRef<[u8]>>(&mut self, value: Option<T>) {
        let mut body = Vec::new();
        match value {
            Some(v) => {
                let v = v.as_ref();
                body.extend_from_slice(&(v.len() as i32).to_be_bytes());
                body.extend_from_slice(v);
            }
            None => body.extend_from_slice(&(-1_i32).to_be_bytes()),
        }
        self.send(b'V', &body);
        self.send_ready(b'T');
    }
}

fn put_cstr(body: &mut Vec<u8>, s: &str) {
    body.extend_from_slice(s.as_bytes());
    body.push(0);
}

/// Panicking reader over a frontend message body.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> &'a [u8] {
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        out
    }

    fn u16(&mut self) -> u16 {
        let b = self.take(2);
        u16::from_be_bytes([b[0], b[1]])
    }

    fn i32(&mut self) -> i32 {
        let b = self.take(4);
        i32::from_be_bytes([b[0], b[1], b[2], b[3]])
    }

    fn cstr(&mut self) -> String {
        let end = self.buf[self.pos..]
            .iter()
            .position(|&b| b == 0)
            .expect("unterminated string");
        let s = String::from_utf8_lossy(&self.buf[self.pos..self.pos + end]).into_owned();
        self.pos += end + 1;
        s
    }
}
