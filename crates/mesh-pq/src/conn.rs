//! Connection objects and the connect/reset state machine.
//!
//! `connect_start` only resolves the host and starts a non-blocking TCP
//! connect. Every further step (SSL negotiation, the TLS handshake, the
//! startup packet, authentication, waiting for ReadyForQuery) runs inside
//! [`PgConn::connect_poll`], which returns as soon as the socket would
//! block. `connectdb` is the same machine driven by a poll(2) loop.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::auth::{compute_md5_password, ScramState, SCRAM_SHA_256};
use crate::conninfo::{self, ConnOptions, SslMode};
use crate::lobj::LoFuncs;
use crate::notify::PgNotify;
use crate::protocol::{self, MsgReader};
use crate::result::PgResult;
use crate::status::{
    ConnStatus, ExecStatus, PingStatus, PollingStatus, TransactionStatus, Verbosity,
};
use crate::stream::{self, PgStream, Progress, Socket};

/// Receives every notice as a result object (`PQnoticeReceiver`).
pub type NoticeReceiver = Box<dyn FnMut(&PgResult)>;
/// Receives every notice as formatted text (`PQnoticeProcessor`).
pub type NoticeProcessor = Box<dyn FnMut(&str)>;

pub(crate) const SERVER_CLOSED: &str = "server closed the connection unexpectedly\n\tThis probably means the server terminated abnormally\n\tbefore or while processing the request.";

const READ_CHUNK: usize = 8192;

/// Progress of the command currently running on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AsyncStatus {
    Idle,
    Busy,
    Ready,
    CopyIn,
    CopyOut,
    CopyBoth,
}

/// Which kind of command was sent, since the backend's replies differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueryClass {
    Simple,
    Extended,
    Prepare,
    Describe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SslPhase {
    AwaitResponse,
    Handshake,
}

pub struct PgConn {
    pub(crate) options: Option<ConnOptions>,
    addrs: Vec<SocketAddr>,
    addr_index: usize,
    pub(crate) status: ConnStatus,
    ssl_phase: SslPhase,
    scram: Option<ScramState>,
    pub(crate) stream: Option<PgStream>,
    in_buf: Vec<u8>,
    in_start: usize,
    pub(crate) out_buf: Vec<u8>,
    pub(crate) nonblocking: bool,
    pub(crate) async_status: AsyncStatus,
    pub(crate) query_class: QueryClass,
    /// Result being assembled, or ready to be handed out.
    pub(crate) result: Option<PgResult>,
    /// Row-less template kept while single-row results are handed out.
    pub(crate) next_result: Option<PgResult>,
    pub(crate) single_row_mode: bool,
    notifies: VecDeque<PgNotify>,
    param_status: Vec<(String, String)>,
    pub(crate) be_pid: i32,
    pub(crate) be_key: i32,
    pub(crate) txn_status: TransactionStatus,
    pub(crate) error_message: String,
    trace: Option<Box<dyn Write>>,
    notice_receiver: Option<NoticeReceiver>,
    notice_processor: Option<NoticeProcessor>,
    pub(crate) verbosity: Verbosity,
    password_needed: bool,
    password_used: bool,
    server_responded: bool,
    last_sqlstate: String,
    pub(crate) std_strings: bool,
    pub(crate) lo_funcs: Option<LoFuncs>,
}

// ── Construction ───────────────────────────────────────────────────────

/// Begin a connection without blocking on the network (`PQconnectStart`).
///
/// Never fails: problems are reported through `status() == Bad` and
/// `error_message()`.
pub fn connect_start(conninfo: &str) -> Box<PgConn> {
    let mut conn = Box::new(PgConn::new());
    match conninfo::parse(conninfo) {
        Ok(options) => {
            conn.options = Some(options);
            if let Err(msg) = conn.start_connection() {
                conn.fail_connection(&msg);
            }
        }
        Err(msg) => conn.fail_connection(&msg),
    }
    conn
}

/// Connect and wait for the outcome (`PQconnectdb`).
pub fn connectdb(conninfo: &str) -> Box<PgConn> {
    let mut conn = connect_start(conninfo);
    conn.connect_blocking();
    conn
}

/// Close the connection and free the object (`PQfinish`).
pub fn finish(mut conn: Box<PgConn>) {
    conn.close_socket();
}

/// Report whether a server is accepting connections (`PQping`).
pub fn ping(conninfo: &str) -> PingStatus {
    if conninfo::parse(conninfo).is_err() {
        return PingStatus::NoAttempt;
    }
    let conn = connectdb(conninfo);
    let status = conn.ping_status();
    finish(conn);
    status
}

impl PgConn {
    fn new() -> Self {
        PgConn {
            options: None,
            addrs: Vec::new(),
            addr_index: 0,
            status: ConnStatus::Bad,
            ssl_phase: SslPhase::AwaitResponse,
            scram: None,
            stream: None,
            in_buf: Vec::new(),
            in_start: 0,
            out_buf: Vec::new(),
            nonblocking: false,
            async_status: AsyncStatus::Idle,
            query_class: QueryClass::Simple,
            result: None,
            next_result: None,
            single_row_mode: false,
            notifies: VecDeque::new(),
            param_status: Vec::new(),
            be_pid: 0,
            be_key: 0,
            txn_status: TransactionStatus::Unknown,
            error_message: String::new(),
            trace: None,
            notice_receiver: None,
            notice_processor: None,
            verbosity: Verbosity::Default,
            password_needed: false,
            password_used: false,
            server_responded: false,
            last_sqlstate: String::new(),
            std_strings: false,
            lo_funcs: None,
        }
    }

    /// Resolve the target and begin the TCP connect.
    fn start_connection(&mut self) -> Result<(), String> {
        let options = self
            .options
            .as_ref()
            .ok_or_else(|| "invalid connection options".to_string())?;

        let addrs: Vec<SocketAddr> = match &options.hostaddr {
            Some(ip) => {
                let ip: IpAddr = ip
                    .parse()
                    .map_err(|_| format!("could not parse network address \"{}\"", ip))?;
                vec![SocketAddr::new(ip, options.port)]
            }
            None => (options.host.as_str(), options.port)
                .to_socket_addrs()
                .map_err(|e| {
                    format!(
                        "could not translate host name \"{}\" to address: {}",
                        options.host, e
                    )
                })?
                .collect(),
        };
        if addrs.is_empty() {
            return Err(format!(
                "could not translate host name \"{}\" to address",
                options.host
            ));
        }

        self.addrs = addrs;
        self.addr_index = 0;
        self.error_message.clear();
        self.in_buf.clear();
        self.in_start = 0;
        self.out_buf.clear();
        self.param_status.clear();
        self.be_pid = 0;
        self.be_key = 0;
        self.scram = None;
        self.password_needed = false;
        self.password_used = false;
        self.server_responded = false;
        self.last_sqlstate.clear();
        self.std_strings = false;
        self.lo_funcs = None;
        self.async_status = AsyncStatus::Idle;
        self.result = None;
        self.next_result = None;
        self.connect_next_addr()
    }

    fn connect_next_addr(&mut self) -> Result<(), String> {
        let mut last_err = String::new();
        while let Some(addr) = self.addrs.get(self.addr_index).copied() {
            match stream::start_connect(&addr) {
                Ok(tcp) => {
                    debug!("connecting to {}", addr);
                    self.stream = Some(PgStream::Plain(tcp));
                    self.status = ConnStatus::Started;
                    return Ok(());
                }
                Err(e) => {
                    last_err = self.connect_error(&addr, &e);
                    self.addr_index += 1;
                }
            }
        }
        Err(last_err)
    }

    fn connect_error(&self, addr: &SocketAddr, err: &io::Error) -> String {
        let host = self.options.as_ref().map_or("", |o| o.host.as_str());
        format!(
            "connection to server at \"{}\" ({}), port {} failed: {}\n\tIs the server running on that host and accepting TCP/IP connections?",
            host,
            addr.ip(),
            addr.port(),
            err
        )
    }

    pub(crate) fn fail_connection(&mut self, msg: &str) {
        debug!("connection failed: {}", msg.lines().next().unwrap_or(""));
        self.set_error(msg);
        self.status = ConnStatus::Bad;
        self.txn_status = TransactionStatus::Unknown;
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown();
        }
    }

    /// Send Terminate if the session is up, then drop the socket.
    fn close_socket(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if self.status == ConnStatus::Ok {
                let mut buf = Vec::new();
                protocol::write_terminate(&mut buf);
                self.trace_outgoing(&buf);
                let _ = write_all_nonblocking(&mut stream, &buf);
            }
            stream.shutdown();
            debug!("connection closed");
        }
        self.status = ConnStatus::Bad;
        self.txn_status = TransactionStatus::Unknown;
        self.async_status = AsyncStatus::Idle;
        self.result = None;
        self.next_result = None;
        self.notifies.clear();
        self.in_buf.clear();
        self.in_start = 0;
        self.out_buf.clear();
    }

    // ── Connect State Machine ──────────────────────────────────────────

    /// Advance the connect (or reset) state machine (`PQconnectPoll`).
    pub fn connect_poll(&mut self) -> PollingStatus {
        match self.poll_step() {
            Ok(status) => status,
            Err(msg) => {
                self.fail_connection(&msg);
                PollingStatus::Failed
            }
        }
    }

    fn poll_step(&mut self) -> Result<PollingStatus, String> {
        loop {
            match self.status {
                ConnStatus::Ok => return Ok(PollingStatus::Ok),
                ConnStatus::Bad => return Ok(PollingStatus::Failed),
                ConnStatus::Needed | ConnStatus::Setenv => {
                    return Err(
                        "invalid connection state, probably indicative of memory corruption"
                            .to_string(),
                    )
                }
                ConnStatus::Started => {
                    let finished = match &self.stream {
                        Some(stream) => stream::connect_finished(stream.tcp()),
                        None => return Err("no connection to the server".to_string()),
                    };
                    match finished {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                            return Ok(PollingStatus::Writing)
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            return Ok(PollingStatus::Writing)
                        }
                        Err(e) => {
                            let addr = self.addrs[self.addr_index];
                            let msg = self.connect_error(&addr, &e);
                            self.stream = None;
                            self.addr_index += 1;
                            if self.addr_index >= self.addrs.len() {
                                return Err(msg);
                            }
                            self.connect_next_addr()?;
                            return Ok(PollingStatus::Writing);
                        }
                    }
                    let sslmode = self.options.as_ref().map_or(SslMode::Disable, |o| o.sslmode);
                    if matches!(sslmode, SslMode::Disable | SslMode::Allow) {
                        self.status = ConnStatus::Made;
                    } else {
                        let mut buf = Vec::new();
                        protocol::write_ssl_request(&mut buf);
                        self.queue_untagged("SSLRequest", &buf);
                        self.ssl_phase = SslPhase::AwaitResponse;
                        self.status = ConnStatus::SslStartup;
                    }
                    debug!("connection made, status {:?}", self.status);
                }
                ConnStatus::SslStartup => {
                    if let Some(waiting) = self.ssl_step()? {
                        return Ok(waiting);
                    }
                }
                ConnStatus::Made => {
                    self.queue_startup_packet();
                    self.status = ConnStatus::AwaitingResponse;
                }
                ConnStatus::AwaitingResponse | ConnStatus::AuthOk => {
                    if !self.flush_out()? {
                        return Ok(PollingStatus::Writing);
                    }
                    let (tag, body) = match self.take_message()? {
                        Some(m) => m,
                        None => {
                            if self.read_data()? == 0 {
                                return Ok(PollingStatus::Reading);
                            }
                            continue;
                        }
                    };
                    if self.handle_startup_message(tag, &body)? {
                        return Ok(PollingStatus::Ok);
                    }
                }
            }
        }
    }

    /// One step of SSL negotiation. `Some` means wait on the socket.
    fn ssl_step(&mut self) -> Result<Option<PollingStatus>, String> {
        match self.ssl_phase {
            SslPhase::AwaitResponse => {
                if !self.flush_out()? {
                    return Ok(Some(PollingStatus::Writing));
                }
                // Read exactly 1 byte response (CVE-2021-23222: do NOT read more)
                let mut response = [0u8; 1];
                let read = match &mut self.stream {
                    Some(PgStream::Plain(tcp)) => tcp.read(&mut response),
                    _ => return Err("no connection to the server".to_string()),
                };
                match read {
                    Ok(0) => return Err(SERVER_CLOSED.to_string()),
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(Some(PollingStatus::Reading))
                    }
                    Err(e) => return Err(format!("could not receive data from server: {}", e)),
                }
                let sslmode = self.options.as_ref().map_or(SslMode::Prefer, |o| o.sslmode);
                match response[0] {
                    b'S' => {
                        let host = self
                            .options
                            .as_ref()
                            .map_or("", |o| o.host.as_str())
                            .to_string();
                        let tcp = match self.stream.take() {
                            Some(PgStream::Plain(tcp)) => tcp,
                            _ => return Err("no connection to the server".to_string()),
                        };
                        self.stream = Some(stream::upgrade_to_tls(tcp, &host, sslmode)?);
                        self.ssl_phase = SslPhase::Handshake;
                        debug!("server accepted SSL, starting handshake");
                    }
                    b'N' if sslmode.requires_tls() => {
                        return Err("server does not support SSL, but SSL was required".to_string())
                    }
                    b'N' => {
                        debug!("server declined SSL, continuing without encryption");
                        self.status = ConnStatus::Made;
                    }
                    other => {
                        return Err(format!(
                            "received invalid response to SSL negotiation: {}",
                            other as char
                        ))
                    }
                }
                Ok(None)
            }
            SslPhase::Handshake => {
                let progress = match &mut self.stream {
                    Some(stream) => stream.handshake(),
                    None => return Err("no connection to the server".to_string()),
                };
                match progress {
                    Ok(Progress::Done) => {
                        self.status = ConnStatus::Made;
                        Ok(None)
                    }
                    Ok(Progress::WantRead) => Ok(Some(PollingStatus::Reading)),
                    Ok(Progress::WantWrite) => Ok(Some(PollingStatus::Writing)),
                    Err(e) => Err(format!("SSL error: {}", e)),
                }
            }
        }
    }

    fn queue_startup_packet(&mut self) {
        let Some(options) = self.options.as_ref() else {
            return;
        };
        let mut params: Vec<(&str, &str)> = vec![
            ("user", options.user.as_str()),
            ("database", options.dbname.as_str()),
        ];
        if let Some(name) = &options.application_name {
            params.push(("application_name", name.as_str()));
        }
        if !options.options.is_empty() {
            params.push(("options", options.options.as_str()));
        }
        if let Some(encoding) = &options.client_encoding {
            if encoding != "auto" {
                params.push(("client_encoding", encoding.as_str()));
            }
        }
        let mut buf = Vec::new();
        protocol::write_startup_message(&mut buf, &params);
        self.queue_untagged("StartupMessage", &buf);
    }

    /// Handle one message received during startup. Returns `true` once
    /// ReadyForQuery completes the connection.
    fn handle_startup_message(&mut self, tag: u8, body: &[u8]) -> Result<bool, String> {
        let mut r = MsgReader::new(body);
        match tag {
            b'E' => {
                self.server_responded = true;
                let res = PgResult::from_fields(
                    ExecStatus::FatalError,
                    protocol::parse_fields(body),
                    self.verbosity,
                );
                self.last_sqlstate = res
                    .error_field(crate::status::diag::SQLSTATE)
                    .unwrap_or("")
                    .to_string();
                Err(res.error_message().trim_end().to_string())
            }
            b'R' => {
                self.server_responded = true;
                let code = r.i32()?;
                self.handle_auth_request(code, &mut r)?;
                Ok(false)
            }
            b'S' => {
                self.handle_parameter_status(body)?;
                Ok(false)
            }
            b'K' => {
                self.be_pid = r.i32()?;
                self.be_key = r.i32()?;
                Ok(false)
            }
            b'N' => {
                self.handle_notice(body);
                Ok(false)
            }
            // NegotiateProtocolVersion: the server lacks some minor feature we
            // never request.
            b'v' => Ok(false),
            b'Z' if self.status == ConnStatus::AuthOk => {
                self.txn_status = TransactionStatus::from_ready_byte(r.byte()?);
                self.status = ConnStatus::Ok;
                self.scram = None;
                debug!("connection ready, backend pid {}", self.be_pid);
                Ok(true)
            }
            other => Err(format!(
                "expected authentication request from server, but received {}",
                other as char
            )),
        }
    }

    fn password(&mut self) -> Result<String, String> {
        self.password_needed = true;
        match self.options.as_ref().and_then(|o| o.password.clone()) {
            Some(p) if !p.is_empty() => {
                self.password_used = true;
                Ok(p)
            }
            _ => Err("fe_sendauth: no password supplied".to_string()),
        }
    }

    fn handle_auth_request(&mut self, code: i32, r: &mut MsgReader<'_>) -> Result<(), String> {
        let mut buf = Vec::new();
        match code {
            0 => {
                debug!("authentication ok");
                self.status = ConnStatus::AuthOk;
                return Ok(());
            }
            3 => {
                let password = self.password()?;
                protocol::write_password_message(&mut buf, &password);
            }
            5 => {
                let salt = r.bytes(4)?.to_vec();
                let password = self.password()?;
                let user = self.options.as_ref().map_or("", |o| o.user.as_str());
                let hashed = compute_md5_password(user, &password, &salt);
                protocol::write_password_message(&mut buf, &hashed);
            }
            10 => {
                let mut mechanisms = Vec::new();
                loop {
                    let m = r.string()?;
                    if m.is_empty() {
                        break;
                    }
                    mechanisms.push(m);
                }
                if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                    return Err(
                        "none of the server's SASL authentication mechanisms are supported"
                            .to_string(),
                    );
                }
                self.password()?;
                let (state, first) = ScramState::start();
                self.scram = Some(state);
                protocol::write_sasl_initial_response(&mut buf, SCRAM_SHA_256, first.as_bytes());
            }
            11 => {
                let server_first = String::from_utf8_lossy(r.rest()).into_owned();
                let password = self.password()?;
                let scram = self
                    .scram
                    .as_mut()
                    .ok_or_else(|| "unexpected SASL continue message".to_string())?;
                let client_final = scram.continue_with(&password, &server_first)?;
                protocol::write_sasl_response(&mut buf, client_final.as_bytes());
            }
            12 => {
                let server_final = String::from_utf8_lossy(r.rest()).into_owned();
                let scram = self
                    .scram
                    .take()
                    .ok_or_else(|| "unexpected SASL final message".to_string())?;
                scram.finish(&server_final)?;
                return Ok(());
            }
            other => return Err(format!("authentication method {} not supported", other)),
        }
        self.queue(&buf);
        Ok(())
    }

    /// Blocking connect loop shared by `connectdb` and `reset`.
    fn connect_blocking(&mut self) -> bool {
        let deadline = self
            .options
            .as_ref()
            .and_then(|o| o.connect_timeout)
            .map(|t| Instant::now() + t);
        let mut status = if self.status == ConnStatus::Bad {
            PollingStatus::Failed
        } else {
            PollingStatus::Writing
        };
        loop {
            match status {
                PollingStatus::Ok => return true,
                PollingStatus::Failed => return false,
                PollingStatus::Reading | PollingStatus::Writing => {
                    let Some(socket) = self.socket() else {
                        self.fail_connection("no connection to the server");
                        return false;
                    };
                    let for_read = status == PollingStatus::Reading;
                    match stream::wait_socket(socket, for_read, !for_read, deadline) {
                        Ok(true) => {}
                        Ok(false) => {
                            self.fail_connection("timeout expired");
                            return false;
                        }
                        Err(e) => {
                            self.fail_connection(&format!("select() failed: {}", e));
                            return false;
                        }
                    }
                }
                PollingStatus::Active => {}
            }
            status = self.connect_poll();
        }
    }

    // ── Reset ──────────────────────────────────────────────────────────

    /// Close and reopen the connection with the same options (`PQreset`).
    pub fn reset(&mut self) {
        if self.reset_start() {
            self.connect_blocking();
        }
    }

    /// Begin a non-blocking reset (`PQresetStart`).
    pub fn reset_start(&mut self) -> bool {
        debug!("resetting connection");
        self.close_socket();
        match self.start_connection() {
            Ok(()) => true,
            Err(msg) => {
                self.fail_connection(&msg);
                false
            }
        }
    }

    /// Advance a reset started with [`reset_start`](Self::reset_start).
    pub fn reset_poll(&mut self) -> PollingStatus {
        self.connect_poll()
    }

    pub(crate) fn ping_status(&self) -> PingStatus {
        if self.status == ConnStatus::Ok {
            return PingStatus::Ok;
        }
        if !self.server_responded {
            return PingStatus::NoResponse;
        }
        // 57P03 = cannot_connect_now (starting up / shutting down)
        if self.last_sqlstate == "57P03" {
            return PingStatus::Reject;
        }
        PingStatus::Ok
    }

    // ── Buffered I/O ───────────────────────────────────────────────────

    pub(crate) fn set_error(&mut self, msg: &str) {
        self.error_message.clear();
        self.error_message.push_str(msg);
        if !msg.ends_with('\n') {
            self.error_message.push('\n');
        }
    }

    /// Queue complete tagged messages for sending.
    pub(crate) fn queue(&mut self, bytes: &[u8]) {
        self.trace_outgoing(bytes);
        self.out_buf.extend_from_slice(bytes);
    }

    fn queue_untagged(&mut self, name: &str, bytes: &[u8]) {
        trace!("To backend: {} ({} bytes)", name, bytes.len());
        if let Some(sink) = self.trace.as_mut() {
            let _ = writeln!(
                sink,
                "To backend\t{}\t{}\t{}",
                name,
                bytes.len(),
                escape_bytes(&bytes[4..])
            );
        }
        self.out_buf.extend_from_slice(bytes);
    }

    /// Write as much queued output as possible. `Ok(true)` once all of it
    /// (including anything buffered in the TLS layer) has left.
    pub(crate) fn flush_out(&mut self) -> Result<bool, String> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| "no connection to the server".to_string())?;
        let mut sent = 0;
        while sent < self.out_buf.len() {
            match stream.write_some(&self.out_buf[sent..]) {
                Ok(0) => return Err("could not send data to server: connection closed".to_string()),
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(format!("could not send data to server: {}", e)),
            }
        }
        self.out_buf.drain(..sent);
        if !self.out_buf.is_empty() {
            return Ok(false);
        }
        stream
            .flush_pending()
            .map_err(|e| format!("could not send data to server: {}", e))
    }

    /// Flush everything, waiting on the socket as needed. Input arriving
    /// meanwhile is absorbed so a server blocked on its own output cannot
    /// deadlock the exchange.
    pub(crate) fn flush_blocking(&mut self) -> Result<(), String> {
        loop {
            if self.flush_out()? {
                return Ok(());
            }
            let socket = self.socket().ok_or_else(|| "no connection to the server".to_string())?;
            stream::wait_socket(socket, true, true, None)
                .map_err(|e| format!("select() failed: {}", e))?;
            self.read_data()?;
        }
    }

    /// Flush according to the blocking mode of the connection.
    pub(crate) fn send_queued(&mut self) -> Result<(), String> {
        if self.nonblocking {
            self.flush_out().map(|_| ())
        } else {
            self.flush_blocking()
        }
    }

    /// Read everything currently available into the input buffer.
    /// Returns the number of bytes read; 0 means the socket would block.
    pub(crate) fn read_data(&mut self) -> Result<usize, String> {
        if self.in_start > 0 {
            self.in_buf.drain(..self.in_start);
            self.in_start = 0;
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| "no connection to the server".to_string())?;
        let mut chunk = [0u8; READ_CHUNK];
        let mut total = 0;
        loop {
            match stream.read_some(&mut chunk) {
                Ok(0) if total > 0 => return Ok(total),
                Ok(0) => return Err(SERVER_CLOSED.to_string()),
                Ok(n) => {
                    self.in_buf.extend_from_slice(&chunk[..n]);
                    total += n;
                    if total >= READ_CHUNK * 8 {
                        return Ok(total);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(format!("could not receive data from server: {}", e)),
            }
        }
    }

    /// Block until the socket is readable, then read.
    pub(crate) fn wait_and_read(&mut self) -> Result<(), String> {
        let socket = self.socket().ok_or_else(|| "no connection to the server".to_string())?;
        stream::wait_socket(socket, true, false, None)
            .map_err(|e| format!("select() failed: {}", e))?;
        self.read_data().map(|_| ())
    }

    /// The next complete message without consuming it.
    pub(crate) fn peek_message(&self) -> Result<Option<(u8, Vec<u8>, usize)>, String> {
        Ok(protocol::split_message(&self.in_buf[self.in_start..])?
            .map(|(tag, body, total)| (tag, body.to_vec(), total)))
    }

    pub(crate) fn consume_message(&mut self, tag: u8, body: &[u8], total: usize) {
        self.in_start += total;
        trace!("From backend: {} ({} bytes)", protocol::describe_tag(tag, true), total);
        if let Some(sink) = self.trace.as_mut() {
            let _ = writeln!(
                sink,
                "From backend\t{}\t{}\t{}",
                protocol::describe_tag(tag, true),
                total - 1,
                escape_bytes(body)
            );
        }
    }

    pub(crate) fn take_message(&mut self) -> Result<Option<(u8, Vec<u8>)>, String> {
        match self.peek_message()? {
            Some((tag, body, total)) => {
                self.consume_message(tag, &body, total);
                Ok(Some((tag, body)))
            }
            None => Ok(None),
        }
    }

    fn trace_outgoing(&mut self, bytes: &[u8]) {
        let mut rest = bytes;
        while let Ok(Some((tag, body, total))) = protocol::split_message(rest) {
            let name = protocol::describe_tag(tag, false);
            trace!("To backend: {} ({} bytes)", name, total);
            if let Some(sink) = self.trace.as_mut() {
                let _ = writeln!(
                    sink,
                    "To backend\t{}\t{}\t{}",
                    name,
                    total - 1,
                    escape_bytes(body)
                );
            }
            rest = &rest[total..];
        }
    }

    // ── Asynchronous Messages ──────────────────────────────────────────

    pub(crate) fn handle_notice(&mut self, body: &[u8]) {
        let res = PgResult::from_fields(
            ExecStatus::NonfatalError,
            protocol::parse_fields(body),
            self.verbosity,
        );
        self.emit_notice(&res);
    }

    /// Route a notice through the receiver, or through the default receiver
    /// that hands its text to the processor.
    pub(crate) fn emit_notice(&mut self, res: &PgResult) {
        if let Some(receiver) = self.notice_receiver.as_mut() {
            receiver(res);
            return;
        }
        match self.notice_processor.as_mut() {
            Some(processor) => processor(res.error_message()),
            None => default_notice_processor(res.error_message()),
        }
    }

    /// Client-generated notice (`pqInternalNotice`).
    pub(crate) fn internal_notice(&mut self, msg: &str) {
        let mut res = PgResult::empty(ExecStatus::NonfatalError);
        res.append_error(&format!("NOTICE:  {}", msg));
        self.emit_notice(&res);
    }

    pub(crate) fn handle_notify(&mut self, body: &[u8]) -> Result<(), String> {
        let mut r = MsgReader::new(body);
        let be_pid = r.i32()?;
        let relname = r.string()?;
        let extra = r.string()?;
        self.notifies.push_back(PgNotify {
            relname,
            be_pid,
            extra,
        });
        Ok(())
    }

    pub(crate) fn handle_parameter_status(&mut self, body: &[u8]) -> Result<(), String> {
        let mut r = MsgReader::new(body);
        let name = r.string()?;
        let value = r.string()?;
        if name == "standard_conforming_strings" {
            self.std_strings = value == "on";
        }
        match self.param_status.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = value,
            None => self.param_status.push((name, value)),
        }
        Ok(())
    }

    /// Pop the next pending notification (`PQnotifies`). Never reads from
    /// the socket; call `consume_input` first.
    pub fn notifies(&mut self) -> Option<Box<PgNotify>> {
        self.notifies.pop_front().map(Box::new)
    }

    /// Install a notice receiver, returning the previous one. `None`
    /// restores the default receiver.
    pub fn set_notice_receiver(
        &mut self,
        receiver: Option<NoticeReceiver>,
    ) -> Option<NoticeReceiver> {
        std::mem::replace(&mut self.notice_receiver, receiver)
    }

    /// Install a notice processor, returning the previous one. `None`
    /// restores the default processor.
    pub fn set_notice_processor(
        &mut self,
        processor: Option<NoticeProcessor>,
    ) -> Option<NoticeProcessor> {
        std::mem::replace(&mut self.notice_processor, processor)
    }

    // ── Tracing ────────────────────────────────────────────────────────

    /// Copy all protocol traffic to `sink` (`PQtrace`).
    pub fn trace(&mut self, sink: Box<dyn Write>) {
        self.trace = Some(sink);
    }

    /// Stop tracing and hand the sink back (`PQuntrace`).
    pub fn untrace(&mut self) -> Option<Box<dyn Write>> {
        let mut sink = self.trace.take()?;
        let _ = sink.flush();
        Some(sink)
    }

    // ── Status Accessors ───────────────────────────────────────────────

    pub fn status(&self) -> ConnStatus {
        self.status
    }

    pub fn db(&self) -> &str {
        self.options.as_ref().map_or("", |o| o.dbname.as_str())
    }

    pub fn user(&self) -> &str {
        self.options.as_ref().map_or("", |o| o.user.as_str())
    }

    pub fn pass(&self) -> &str {
        self.options
            .as_ref()
            .and_then(|o| o.password.as_deref())
            .unwrap_or("")
    }

    pub fn host(&self) -> &str {
        self.options.as_ref().map_or("", |o| o.host.as_str())
    }

    pub fn port(&self) -> String {
        self.options
            .as_ref()
            .map_or_else(String::new, |o| o.port.to_string())
    }

    /// Always empty; the server ignores the debug tty option.
    pub fn tty(&self) -> &str {
        ""
    }

    pub fn options(&self) -> &str {
        self.options.as_ref().map_or("", |o| o.options.as_str())
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        if self.status != ConnStatus::Ok {
            TransactionStatus::Unknown
        } else if self.async_status != AsyncStatus::Idle {
            TransactionStatus::Active
        } else {
            self.txn_status
        }
    }

    pub fn parameter_status(&self, name: &str) -> Option<&str> {
        self.param_status
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn protocol_version(&self) -> i32 {
        if self.status == ConnStatus::Ok {
            3
        } else {
            0
        }
    }

    /// Server version as an integer (`PQserverVersion`): 160002 for 16.2,
    /// 90603 for 9.6.3; 0 when unknown.
    pub fn server_version(&self) -> i32 {
        if self.status != ConnStatus::Ok {
            return 0;
        }
        self.parameter_status("server_version")
            .map_or(0, parse_server_version)
    }

    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    /// Socket descriptor, absent while no socket is open.
    pub fn socket(&self) -> Option<Socket> {
        self.stream.as_ref().map(PgStream::socket)
    }

    pub fn backend_pid(&self) -> i32 {
        if self.status == ConnStatus::Ok {
            self.be_pid
        } else {
            0
        }
    }

    pub fn connection_needs_password(&self) -> bool {
        self.password_needed && !self.password_used
    }

    pub fn connection_used_password(&self) -> bool {
        self.password_used
    }

    pub fn client_encoding(&self) -> &str {
        self.parameter_status("client_encoding").unwrap_or("SQL_ASCII")
    }

    pub fn ssl_in_use(&self) -> bool {
        self.stream.as_ref().is_some_and(PgStream::is_tls)
    }
}

impl Drop for PgConn {
    fn drop(&mut self) {
        self.close_socket();
    }
}

/// Write `buf` without waiting, used for the farewell Terminate.
fn write_all_nonblocking(stream: &mut PgStream, buf: &[u8]) -> io::Result<()> {
    let mut sent = 0;
    while sent < buf.len() {
        sent += stream.write_some(&buf[sent..])?;
    }
    stream.flush_pending().map(|_| ())
}

fn default_notice_processor(msg: &str) {
    warn!(target: "mesh_pq::notice", "{}", msg.trim_end());
}

fn parse_server_version(version: &str) -> i32 {
    let mut parts = Vec::new();
    for piece in version.split('.') {
        let digits: String = piece.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            break;
        }
        parts.push(digits.parse::<i32>().unwrap_or(0));
        if digits.len() != piece.len() || parts.len() == 3 {
            break;
        }
    }
    match parts.as_slice() {
        [major, minor, rev] => major * 10000 + minor * 100 + rev,
        [major, minor] if *major >= 10 => major * 10000 + minor,
        [major, minor] => major * 10000 + minor * 100,
        [major] => major * 10000,
        _ => 0,
    }
}

/// Render message bytes for the trace sink: printable ASCII as is,
/// everything else as `\xNN`.
fn escape_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        if (0x20..0x7f).contains(&b) && b != b'\\' {
            out.push(b as char);
        } else {
            out.push_str(&format!("\\x{:02x}", b));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;

    #[test]
    fn test_parse_server_version() {
        assert_eq!(parse_server_version("16.2"), 160002);
        assert_eq!(parse_server_version("9.6.3"), 90603);
        assert_eq!(parse_server_version("9.6"), 90600);
        assert_eq!(parse_server_version("17beta1"), 170000);
        assert_eq!(parse_server_version("16.2 (Debian 16.2-1)"), 160002);
        assert_eq!(parse_server_version("garbage"), 0);
    }

    #[test]
    fn test_escape_bytes() {
        assert_eq!(escape_bytes(b"ab\0\\"), "ab\\x00\\x5c");
    }

    #[test]
    fn test_bad_conninfo_is_bad_not_panic() {
        let conn = connect_start("bogus_option=1");
        assert_eq!(conn.status(), ConnStatus::Bad);
        assert!(conn.error_message().contains("invalid connection option"));
        assert_eq!(conn.socket(), None);
        assert_eq!(ping("bogus_option=1"), PingStatus::NoAttempt);
    }

    #[test]
    fn test_connect_refused() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let conn = connectdb(&format!("host=127.0.0.1 port={} sslmode=disable", port));
        assert_eq!(conn.status(), ConnStatus::Bad);
        assert!(!conn.error_message().is_empty());
        assert_eq!(conn.socket(), None);
        assert_eq!(conn.transaction_status(), TransactionStatus::Unknown);
    }

    #[test]
    fn test_connectdb_handshake_and_accessors() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            let startup = c.handshake();
            assert!(startup.contains(&("user".to_string(), "tester".to_string())));
            assert!(startup.contains(&("application_name".to_string(), "unit".to_string())));
            c.expect(b'X');
        });
        let conn = connectdb(&format!("{} application_name=unit", backend.conninfo()));
        assert_eq!(conn.status(), ConnStatus::Ok, "{}", conn.error_message());
        assert_eq!(conn.db(), "testdb");
        assert_eq!(conn.user(), "tester");
        assert_eq!(conn.host(), "127.0.0.1");
        assert_eq!(conn.port(), backend.port().to_string());
        assert_eq!(conn.server_version(), 160002);
        assert_eq!(conn.protocol_version(), 3);
        assert_eq!(conn.backend_pid(), 4242);
        assert_eq!(conn.client_encoding(), "UTF8");
        assert_eq!(conn.parameter_status("server_version"), Some("16.2"));
        assert_eq!(conn.transaction_status(), TransactionStatus::Idle);
        assert!(conn.socket().is_some());
        assert!(!conn.ssl_in_use());
        assert!(!conn.connection_used_password());
        finish(conn);
        backend.join();
    }

    #[test]
    fn test_connect_poll_loop() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.handshake();
        });
        let mut conn = connect_start(&backend.conninfo());
        assert_eq!(conn.status(), ConnStatus::Started);
        let mut polls = 0;
        loop {
            match conn.connect_poll() {
                PollingStatus::Ok => break,
                PollingStatus::Failed => panic!("connect failed: {}", conn.error_message()),
                PollingStatus::Reading => {
                    stream::wait_socket(conn.socket().unwrap(), true, false, None).unwrap();
                }
                PollingStatus::Writing => {
                    stream::wait_socket(conn.socket().unwrap(), false, true, None).unwrap();
                }
                PollingStatus::Active => {}
            }
            polls += 1;
            assert!(polls < 1000);
        }
        assert_eq!(conn.status(), ConnStatus::Ok);
        drop(conn);
        backend.join();
    }

    #[test]
    fn test_md5_authentication() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.read_startup();
            c.send_auth_md5(&[9, 8, 7, 6]);
            let body = c.expect(b'p');
            let expected = compute_md5_password("tester", "sekrit", &[9, 8, 7, 6]);
            assert_eq!(&body[..body.len() - 1], expected.as_bytes());
            c.send_auth_ok();
            c.finish_startup();
        });
        let conn = connectdb(&format!("{} password=sekrit", backend.conninfo()));
        assert_eq!(conn.status(), ConnStatus::Ok, "{}", conn.error_message());
        assert!(conn.connection_used_password());
        assert!(!conn.connection_needs_password());
        drop(conn);
        backend.join();
    }

    #[test]
    fn test_missing_password() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.read_startup();
            c.send_auth_md5(&[1, 2, 3, 4]);
        });
        let conn = connectdb(&backend.conninfo());
        assert_eq!(conn.status(), ConnStatus::Bad);
        assert!(conn.error_message().contains("no password supplied"));
        assert!(conn.connection_needs_password());
        drop(conn);
        backend.join();
    }

    #[test]
    fn test_scram_authentication() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.read_startup();
            c.scram_exchange("pencil");
            c.send_auth_ok();
            c.finish_startup();
        });
        let conn = connectdb(&format!("{} password=pencil", backend.conninfo()));
        assert_eq!(conn.status(), ConnStatus::Ok, "{}", conn.error_message());
        drop(conn);
        backend.join();
    }

    #[test]
    fn test_startup_error_reported() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.read_startup();
            c.send_error_fatal("57P03", "the database system is starting up");
        });
        let conn = connectdb(&backend.conninfo());
        assert_eq!(conn.status(), ConnStatus::Bad);
        assert!(conn.error_message().contains("starting up"));
        assert_eq!(conn.ping_status(), PingStatus::Reject);
        drop(conn);
        backend.join();
    }

    #[test]
    fn test_ping_ok_and_no_response() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.handshake();
        });
        assert_eq!(ping(&backend.conninfo()), PingStatus::Ok);
        backend.join();

        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        assert_eq!(
            ping(&format!("host=127.0.0.1 port={} sslmode=disable", port)),
            PingStatus::NoResponse
        );
    }

    #[test]
    fn test_ssl_declined_with_prefer_falls_back() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            // read_startup answers 'N' to the SSLRequest
            c.handshake();
        });
        let conninfo = backend.conninfo().replace("sslmode=disable", "sslmode=prefer");
        let conn = connectdb(&conninfo);
        assert_eq!(conn.status(), ConnStatus::Ok, "{}", conn.error_message());
        assert!(!conn.ssl_in_use());
        drop(conn);
        backend.join();
    }

    #[test]
    fn test_ssl_declined_with_require_fails() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.read_ssl_request_and_decline();
        });
        let conninfo = backend.conninfo().replace("sslmode=disable", "sslmode=require");
        let conn = connectdb(&conninfo);
        assert_eq!(conn.status(), ConnStatus::Bad);
        assert!(conn.error_message().contains("SSL was required"));
        drop(conn);
        backend.join();
    }

    #[test]
    fn test_reset_reconnects() {
        let backend = FakeBackend::start(|session| {
            let mut first = session.accept();
            first.handshake();
            let mut second = session.accept();
            second.handshake();
        });
        let mut conn = connectdb(&backend.conninfo());
        assert_eq!(conn.status(), ConnStatus::Ok);
        conn.reset();
        assert_eq!(conn.status(), ConnStatus::Ok, "{}", conn.error_message());
        drop(conn);
        backend.join();
    }

    #[test]
    fn test_notice_processor_and_receiver() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.read_startup();
            c.send_auth_ok();
            c.send_notice("hello from startup");
            c.send_notice("second notice");
            c.finish_startup();
        });
        let mut conn = connect_start(&backend.conninfo());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        conn.set_notice_processor(Some(Box::new(move |msg: &str| {
            sink.borrow_mut().push(msg.to_string())
        })));
        conn.connect_blocking();
        assert_eq!(conn.status(), ConnStatus::Ok);
        assert_eq!(
            *seen.borrow(),
            vec![
                "NOTICE:  hello from startup\n".to_string(),
                "NOTICE:  second notice\n".to_string()
            ]
        );
        drop(conn);
        backend.join();
    }
}
