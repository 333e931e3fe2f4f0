//! Command execution: the asynchronous send/get_result protocol, the
//! blocking wrappers built on it, and string escaping.
//!
//! One command runs at a time. A `send_*` call is refused with "another
//! command is already in progress" until every result of the previous
//! command has been drained through [`PgConn::get_result`].

use tracing::debug;

use crate::conn::{AsyncStatus, PgConn, QueryClass};
use crate::protocol::{self, MsgReader};
use crate::result::{FieldDesc, PgResult};
use crate::status::{ConnStatus, ExecStatus, Verbosity};
use crate::types::Oid;

/// Largest parameter count the Bind message can carry.
pub const MAX_PARAMS: usize = 65535;

impl PgConn {
    // ── Input Parsing ──────────────────────────────────────────────────

    /// Consume as many buffered backend messages as the current state
    /// allows (`pqParseInput3`).
    pub(crate) fn parse_input(&mut self) -> Result<(), String> {
        loop {
            if matches!(self.async_status, AsyncStatus::CopyOut | AsyncStatus::CopyBoth) {
                // Copy data is pulled by get_copy_data.
                return Ok(());
            }
            let Some((tag, body, total)) = self.peek_message()? else {
                return Ok(());
            };

            match tag {
                b'A' => {
                    self.consume_message(tag, &body, total);
                    self.handle_notify(&body)?;
                    continue;
                }
                b'N' => {
                    self.consume_message(tag, &body, total);
                    self.handle_notice(&body);
                    continue;
                }
                b'S' => {
                    self.consume_message(tag, &body, total);
                    self.handle_parameter_status(&body)?;
                    continue;
                }
                _ => {}
            }

            if self.async_status != AsyncStatus::Busy {
                // Results are waiting to be collected.
                if self.async_status != AsyncStatus::Idle {
                    return Ok(());
                }
                self.consume_message(tag, &body, total);
                match tag {
                    b'E' => {
                        // Typically a FATAL sent before the server closes the
                        // session on us.
                        let res = PgResult::from_fields(
                            ExecStatus::FatalError,
                            protocol::parse_fields(&body),
                            self.verbosity,
                        );
                        self.set_error(res.error_message());
                    }
                    // Stray ReadyForQuery after an abandoned COPY.
                    b'Z' => {}
                    other => self.internal_notice(&format!(
                        "message type 0x{:02x} arrived from server while idle",
                        other
                    )),
                }
                continue;
            }

            self.consume_message(tag, &body, total);
            let mut r = MsgReader::new(&body);
            match tag {
                b'C' => {
                    let tag_text = r.string()?;
                    let mut res = self
                        .result
                        .take()
                        .unwrap_or_else(|| PgResult::empty(ExecStatus::CommandOk));
                    res.set_cmd_status(tag_text);
                    self.result = Some(res);
                    self.async_status = AsyncStatus::Ready;
                }
                b'E' => {
                    let res = PgResult::from_fields(
                        ExecStatus::FatalError,
                        protocol::parse_fields(&body),
                        self.verbosity,
                    );
                    self.set_error(res.error_message());
                    self.result = Some(res);
                    self.next_result = None;
                    self.async_status = AsyncStatus::Ready;
                }
                b'Z' => {
                    self.txn_status = crate::status::TransactionStatus::from_ready_byte(r.byte()?);
                    self.async_status = AsyncStatus::Idle;
                }
                b'I' => {
                    self.result = Some(PgResult::empty(ExecStatus::EmptyQuery));
                    self.async_status = AsyncStatus::Ready;
                }
                b'1' => {
                    if self.query_class == QueryClass::Prepare {
                        self.result = Some(PgResult::empty(ExecStatus::CommandOk));
                        self.async_status = AsyncStatus::Ready;
                    }
                }
                b'2' | b'3' | b's' => {}
                b't' => {
                    let n = r.i16()?.max(0) as usize;
                    let mut types = Vec::with_capacity(n);
                    for _ in 0..n {
                        types.push(r.u32()?);
                    }
                    let mut res = PgResult::empty(ExecStatus::CommandOk);
                    res.set_param_types(types);
                    self.result = Some(res);
                }
                b'T' => {
                    let fields = parse_row_description(&mut r)?;
                    let describing = self.query_class == QueryClass::Describe;
                    let mut res = match self.result.take() {
                        Some(res) if describing => res,
                        _ => PgResult::empty(if describing {
                            ExecStatus::CommandOk
                        } else {
                            ExecStatus::TuplesOk
                        }),
                    };
                    res.set_result_attrs(fields);
                    self.result = Some(res);
                    if describing {
                        self.async_status = AsyncStatus::Ready;
                    }
                }
                b'n' => {
                    if self.query_class == QueryClass::Describe {
                        if self.result.is_none() {
                            self.result = Some(PgResult::empty(ExecStatus::CommandOk));
                        }
                        self.async_status = AsyncStatus::Ready;
                    }
                }
                b'D' => self.handle_data_row(&mut r)?,
                b'G' | b'H' | b'W' => {
                    let (status, next) = match tag {
                        b'G' => (ExecStatus::CopyIn, AsyncStatus::CopyIn),
                        b'H' => (ExecStatus::CopyOut, AsyncStatus::CopyOut),
                        _ => (ExecStatus::CopyBoth, AsyncStatus::CopyBoth),
                    };
                    // Overall format, then one format code per column.
                    r.byte()?;
                    let ncols = r.i16()?.max(0) as usize;
                    let mut fields = Vec::with_capacity(ncols);
                    for _ in 0..ncols {
                        let mut field = FieldDesc::new("", 0);
                        field.format = r.i16()?;
                        fields.push(field);
                    }
                    let mut res = PgResult::empty(status);
                    res.set_result_attrs(fields);
                    self.result = Some(res);
                    self.async_status = next;
                    debug!("entering COPY state {:?}", next);
                }
                b'd' | b'c' => {}
                other => {
                    let msg = format!(
                        "unexpected response from server; first received character was \"{}\"",
                        other as char
                    );
                    self.set_error(&msg);
                    self.result = Some(PgResult::client_error(&msg));
                    self.async_status = AsyncStatus::Ready;
                }
            }
        }
    }

    fn handle_data_row(&mut self, r: &mut MsgReader<'_>) -> Result<(), String> {
        let Some(mut res) = self.result.take() else {
            let msg = "server sent data (\"D\" message) without prior row description";
            self.set_error(msg);
            self.result = Some(PgResult::client_error(msg));
            self.async_status = AsyncStatus::Ready;
            return Ok(());
        };
        let n = r.i16()?.max(0) as usize;
        if n != res.nfields() {
            let msg = "unexpected field count in \"D\" message";
            self.set_error(msg);
            self.result = Some(PgResult::client_error(msg));
            self.async_status = AsyncStatus::Ready;
            return Ok(());
        }
        let mut row = Vec::with_capacity(n);
        for _ in 0..n {
            let len = r.i32()?;
            if len < 0 {
                row.push(None);
            } else {
                row.push(Some(r.bytes(len as usize)?.to_vec()));
            }
        }
        if self.single_row_mode {
            let mut single = res.clone();
            single.set_status(ExecStatus::SingleTuple);
            single.push_row(row);
            self.next_result = Some(res);
            self.result = Some(single);
            self.async_status = AsyncStatus::Ready;
        } else {
            res.push_row(row);
            self.result = Some(res);
        }
        Ok(())
    }

    // ── Result Retrieval ───────────────────────────────────────────────

    /// Wait for and return the next result of the running command
    /// (`PQgetResult`); `None` once the command is complete.
    pub fn get_result(&mut self) -> Option<Box<PgResult>> {
        while self.async_status == AsyncStatus::Busy {
            let step = self
                .flush_blocking()
                .and_then(|_| self.parse_input());
            if let Err(msg) = step {
                return Some(self.io_failure(&msg));
            }
            if self.async_status != AsyncStatus::Busy {
                break;
            }
            if let Err(msg) = self.wait_and_read() {
                return Some(self.io_failure(&msg));
            }
        }

        match self.async_status {
            AsyncStatus::Idle | AsyncStatus::Busy => None,
            AsyncStatus::Ready => {
                let res = self.prepare_async_result();
                self.async_status = AsyncStatus::Busy;
                Some(res)
            }
            AsyncStatus::CopyIn => Some(self.copy_result(ExecStatus::CopyIn)),
            AsyncStatus::CopyOut => Some(self.copy_result(ExecStatus::CopyOut)),
            AsyncStatus::CopyBoth => Some(self.copy_result(ExecStatus::CopyBoth)),
        }
    }

    fn prepare_async_result(&mut self) -> Box<PgResult> {
        let res = self
            .result
            .take()
            .unwrap_or_else(|| PgResult::client_error(&self.error_message));
        if let Some(next) = self.next_result.take() {
            self.result = Some(next);
        }
        Box::new(res)
    }

    fn copy_result(&mut self, status: ExecStatus) -> Box<PgResult> {
        match &self.result {
            Some(res) if res.status() == status => Box::new(res.clone()),
            _ => Box::new(PgResult::empty(status)),
        }
    }

    /// The connection broke mid-command: mark it bad and produce the error
    /// result that ends the command.
    pub(crate) fn io_failure(&mut self, msg: &str) -> Box<PgResult> {
        self.fail_connection(msg);
        self.async_status = AsyncStatus::Idle;
        self.result = None;
        self.next_result = None;
        Box::new(PgResult::client_error(msg))
    }

    /// Read whatever the server has sent and process it (`PQconsumeInput`).
    pub fn consume_input(&mut self) -> bool {
        if self.stream.is_none() {
            self.set_error("connection pointer is NULL");
            return false;
        }
        let step = self.flush_out().and_then(|_| self.read_data());
        if let Err(msg) = step {
            self.fail_connection(&msg);
            return false;
        }
        if let Err(msg) = self.parse_input() {
            self.fail_connection(&msg);
            return false;
        }
        true
    }

    /// Whether `get_result` would block (`PQisBusy`).
    pub fn is_busy(&mut self) -> bool {
        if let Err(msg) = self.parse_input() {
            self.fail_connection(&msg);
        }
        self.async_status == AsyncStatus::Busy
    }

    /// Switch non-blocking mode. Pending output is flushed first.
    pub fn set_nonblocking(&mut self, on: bool) -> i32 {
        if self.nonblocking == on {
            return 0;
        }
        if self.stream.is_some() && self.flush_blocking().is_err() {
            return -1;
        }
        self.nonblocking = on;
        0
    }

    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking
    }

    /// Try to send queued output: 0 when done, 1 when some remains, -1 on
    /// failure (`PQflush`).
    pub fn flush(&mut self) -> i32 {
        if self.stream.is_none() {
            return -1;
        }
        match self.flush_out() {
            Ok(true) => 0,
            Ok(false) => 1,
            Err(msg) => {
                self.set_error(&msg);
                -1
            }
        }
    }

    // ── Sending ────────────────────────────────────────────────────────

    fn send_start(&mut self) -> bool {
        if self.status != ConnStatus::Ok || self.stream.is_none() {
            self.set_error("no connection to the server");
            return false;
        }
        if self.async_status != AsyncStatus::Idle {
            self.set_error("another command is already in progress");
            return false;
        }
        self.error_message.clear();
        self.result = None;
        self.next_result = None;
        self.single_row_mode = false;
        true
    }

    fn send_finish(&mut self, class: QueryClass) -> bool {
        self.query_class = class;
        self.async_status = AsyncStatus::Busy;
        if let Err(msg) = self.send_queued() {
            self.fail_connection(&msg);
            self.async_status = AsyncStatus::Idle;
            return false;
        }
        true
    }

    fn check_param_count(&mut self, n: usize) -> bool {
        if n > MAX_PARAMS {
            self.set_error(&format!(
                "number of parameters must be between 0 and {}",
                MAX_PARAMS
            ));
            return false;
        }
        true
    }

    /// Submit a simple-protocol query (`PQsendQuery`).
    pub fn send_query(&mut self, query: &str) -> bool {
        if !self.send_start() {
            return false;
        }
        let mut buf = Vec::new();
        protocol::write_query(&mut buf, query.as_bytes());
        self.queue(&buf);
        self.send_finish(QueryClass::Simple)
    }

    /// Submit a parameterized query over the extended protocol
    /// (`PQsendQueryParams`). `param_types` may be shorter than `values`;
    /// missing and zero entries let the server infer the type.
    pub fn send_query_params(
        &mut self,
        command: &str,
        param_types: &[Oid],
        values: &[Option<&[u8]>],
        formats: &[i16],
        result_format: i16,
    ) -> bool {
        if !self.check_param_count(values.len()) || !self.send_start() {
            return false;
        }
        let mut buf = Vec::new();
        protocol::write_parse(&mut buf, b"", command.as_bytes(), param_types);
        protocol::write_bind(&mut buf, b"", b"", values, formats, result_format);
        protocol::write_describe(&mut buf, b'P', b"");
        protocol::write_execute(&mut buf, b"");
        protocol::write_sync(&mut buf);
        self.queue(&buf);
        self.send_finish(QueryClass::Extended)
    }

    /// Submit a Parse for a named statement (`PQsendPrepare`).
    pub fn send_prepare(&mut self, name: &str, query: &str, param_types: &[Oid]) -> bool {
        if !self.check_param_count(param_types.len()) || !self.send_start() {
            return false;
        }
        let mut buf = Vec::new();
        protocol::write_parse(&mut buf, name.as_bytes(), query.as_bytes(), param_types);
        protocol::write_sync(&mut buf);
        self.queue(&buf);
        self.send_finish(QueryClass::Prepare)
    }

    /// Execute a prepared statement (`PQsendQueryPrepared`).
    pub fn send_query_prepared(
        &mut self,
        name: &str,
        values: &[Option<&[u8]>],
        formats: &[i16],
        result_format: i16,
    ) -> bool {
        if !self.check_param_count(values.len()) || !self.send_start() {
            return false;
        }
        let mut buf = Vec::new();
        protocol::write_bind(&mut buf, b"", name.as_bytes(), values, formats, result_format);
        protocol::write_describe(&mut buf, b'P', b"");
        protocol::write_execute(&mut buf, b"");
        protocol::write_sync(&mut buf);
        self.queue(&buf);
        self.send_finish(QueryClass::Extended)
    }

    pub fn send_describe_prepared(&mut self, name: &str) -> bool {
        self.send_describe(b'S', name)
    }

    pub fn send_describe_portal(&mut self, name: &str) -> bool {
        self.send_describe(b'P', name)
    }

    fn send_describe(&mut self, kind: u8, name: &str) -> bool {
        if !self.send_start() {
            return false;
        }
        let mut buf = Vec::new();
        protocol::write_describe(&mut buf, kind, name.as_bytes());
        protocol::write_sync(&mut buf);
        self.queue(&buf);
        self.send_finish(QueryClass::Describe)
    }

    /// Deliver the rows of the command just sent one result at a time
    /// (`PQsetSingleRowMode`). Only valid before its first result.
    pub fn set_single_row_mode(&mut self) -> bool {
        if self.async_status != AsyncStatus::Busy
            || !matches!(self.query_class, QueryClass::Simple | QueryClass::Extended)
            || self.result.is_some()
        {
            return false;
        }
        self.single_row_mode = true;
        true
    }

    // ── Blocking Wrappers ──────────────────────────────────────────────

    /// Drain whatever a previous asynchronous command left behind.
    fn exec_start(&mut self) -> bool {
        while let Some(res) = self.get_result() {
            match res.status() {
                ExecStatus::CopyIn => {
                    if self.put_copy_end(Some("COPY terminated by new PQexec")) < 0 {
                        return false;
                    }
                }
                ExecStatus::CopyOut => {
                    // Abandon the rest of the copy stream.
                    self.async_status = AsyncStatus::Busy;
                }
                ExecStatus::CopyBoth => {
                    self.set_error("PQexec not allowed during COPY BOTH");
                    return false;
                }
                _ => {}
            }
            if self.status == ConnStatus::Bad {
                return false;
            }
        }
        true
    }

    /// Collect results until the command ends, keeping the last one.
    /// Consecutive fatal errors are concatenated (`PQexecFinish`).
    fn exec_finish(&mut self) -> Option<Box<PgResult>> {
        let mut last: Option<Box<PgResult>> = None;
        while let Some(res) = self.get_result() {
            let res = match last.take() {
                Some(mut prev)
                    if prev.status() == ExecStatus::FatalError
                        && res.status() == ExecStatus::FatalError =>
                {
                    prev.append_error(res.error_message());
                    prev
                }
                _ => res,
            };
            let status = res.status();
            last = Some(res);
            if matches!(
                status,
                ExecStatus::CopyIn | ExecStatus::CopyOut | ExecStatus::CopyBoth
            ) || self.status == ConnStatus::Bad
            {
                break;
            }
        }
        last
    }

    /// Run a query and wait for its result (`PQexec`). `None` means the
    /// command could not be sent; see `error_message()`.
    pub fn exec(&mut self, query: &str) -> Option<Box<PgResult>> {
        if !self.exec_start() || !self.send_query(query) {
            return None;
        }
        self.exec_finish()
    }

    pub fn exec_params(
        &mut self,
        command: &str,
        param_types: &[Oid],
        values: &[Option<&[u8]>],
        formats: &[i16],
        result_format: i16,
    ) -> Option<Box<PgResult>> {
        if !self.exec_start()
            || !self.send_query_params(command, param_types, values, formats, result_format)
        {
            return None;
        }
        self.exec_finish()
    }

    pub fn prepare(
        &mut self,
        name: &str,
        query: &str,
        param_types: &[Oid],
    ) -> Option<Box<PgResult>> {
        if !self.exec_start() || !self.send_prepare(name, query, param_types) {
            return None;
        }
        self.exec_finish()
    }

    pub fn exec_prepared(
        &mut self,
        name: &str,
        values: &[Option<&[u8]>],
        formats: &[i16],
        result_format: i16,
    ) -> Option<Box<PgResult>> {
        if !self.exec_start() || !self.send_query_prepared(name, values, formats, result_format) {
            return None;
        }
        self.exec_finish()
    }

    pub fn describe_prepared(&mut self, name: &str) -> Option<Box<PgResult>> {
        if !self.exec_start() || !self.send_describe_prepared(name) {
            return None;
        }
        self.exec_finish()
    }

    pub fn describe_portal(&mut self, name: &str) -> Option<Box<PgResult>> {
        if !self.exec_start() || !self.send_describe_portal(name) {
            return None;
        }
        self.exec_finish()
    }

    // ── Session Settings ───────────────────────────────────────────────

    /// Change the client encoding with `SET client_encoding` (`PQsetClientEncoding`).
    /// Returns 0 on success, -1 on failure.
    pub fn set_client_encoding(&mut self, encoding: &str) -> i32 {
        if encoding.is_empty() || self.status != ConnStatus::Ok {
            return -1;
        }
        let query = format!("set client_encoding to {}", escape_literal(encoding));
        match self.exec(&query) {
            Some(res) if res.status() == ExecStatus::CommandOk => 0,
            _ => -1,
        }
    }

    /// Set the verbosity of composed error messages, returning the previous
    /// setting.
    pub fn set_error_verbosity(&mut self, verbosity: Verbosity) -> Verbosity {
        std::mem::replace(&mut self.verbosity, verbosity)
    }

    // ── Escaping ───────────────────────────────────────────────────────

    /// Escape text for use inside a single-quoted literal
    /// (`PQescapeStringConn`). Backslashes are doubled only when the server
    /// has `standard_conforming_strings` off.
    pub fn escape_string_conn(&self, from: &str) -> String {
        let mut out = String::with_capacity(from.len() + 2);
        for c in from.chars() {
            if c == '\'' || (c == '\\' && !self.std_strings) {
                out.push(c);
            }
            out.push(c);
        }
        out
    }

    /// Quote a string as a complete SQL literal (`PQescapeLiteral`).
    pub fn escape_literal(&self, from: &str) -> String {
        escape_literal(from)
    }

    /// Quote a string as an SQL identifier (`PQescapeIdentifier`).
    pub fn escape_identifier(&self, from: &str) -> String {
        let mut out = String::with_capacity(from.len() + 2);
        out.push('"');
        for c in from.chars() {
            if c == '"' {
                out.push('"');
            }
            out.push(c);
        }
        out.push('"');
        out
    }

    /// Escape binary data for a bytea literal (`PQescapeByteaConn`) in hex
    /// format. The leading backslash is doubled when the server still
    /// treats backslashes in plain literals as escapes.
    pub fn escape_bytea_conn(&self, from: &[u8]) -> Vec<u8> {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut out = Vec::with_capacity(from.len() * 2 + 3);
        if !self.std_strings {
            out.push(b'\\');
        }
        out.extend_from_slice(b"\\x");
        for &b in from {
            out.push(HEX[(b >> 4) as usize]);
            out.push(HEX[(b & 0xf) as usize]);
        }
        out
    }
}

/// Decode the text form of a bytea value (`PQunescapeBytea`). Accepts the
/// hex format (`\x...`) and the older escape format with `\\` and
/// three-digit octal sequences. Returns `None` on malformed hex input.
pub fn unescape_bytea(from: &[u8]) -> Option<Vec<u8>> {
    if let Some(hex) = from.strip_prefix(b"\\x") {
        let digits: Vec<u8> = hex.iter().copied().filter(|c| !c.is_ascii_whitespace()).collect();
        if digits.len() % 2 != 0 {
            return None;
        }
        return digits
            .chunks(2)
            .map(|pair| Some((hex_value(pair[0])? << 4) | hex_value(pair[1])?))
            .collect();
    }
    let mut out = Vec::with_capacity(from.len());
    let mut i = 0;
    while i < from.len() {
        if from[i] == b'\\' {
            if from.get(i + 1) == Some(&b'\\') {
                out.push(b'\\');
                i += 2;
                continue;
            }
            if let Some(oct) = from.get(i + 1..i + 4) {
                if oct.iter().all(|c| (b'0'..=b'7').contains(c)) && oct[0] <= b'3' {
                    out.push(((oct[0] - b'0') << 6) | ((oct[1] - b'0') << 3) | (oct[2] - b'0'));
                    i += 4;
                    continue;
                }
            }
            // A lone backslash is dropped, as libpq does.
            i += 1;
            continue;
        }
        out.push(from[i]);
        i += 1;
    }
    Some(out)
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Literal quoting independent of server settings: the `E''` form is used
/// whenever backslashes are present, so the result is valid either way.
fn escape_literal(from: &str) -> String {
    let has_backslash = from.contains('\\');
    let mut out = String::with_capacity(from.len() + 4);
    if has_backslash {
        out.push_str(" E");
    }
    out.push('\'');
    for c in from.chars() {
        if c == '\'' || c == '\\' {
            out.push(c);
        }
        out.push(c);
    }
    out.push('\'');
    out
}

fn parse_row_description(r: &mut MsgReader<'_>) -> Result<Vec<FieldDesc>, String> {
    let n = r.i16()?.max(0) as usize;
    let mut fields = Vec::with_capacity(n);
    for _ in 0..n {
        fields.push(FieldDesc {
            name: r.string()?,
            table_oid: r.u32()?,
            column: r.i16()?,
            type_oid: r.u32()?,
            type_size: r.i16()?,
            type_modifier: r.i32()?,
            format: r.i16()?,
        });
    }
    Ok(fields)
}
