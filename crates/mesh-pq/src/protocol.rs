//! PostgreSQL v3 frontend/backend message encoding.
//!
//! Writers append complete messages to an output buffer; nothing here
//! touches a socket. [`split_message`] carves one backend message off the
//! front of an input buffer, and [`MsgReader`] walks its body.

use crate::types::Oid;

/// Protocol version 3.0 = 196608 = 0x00030000
pub const PROTOCOL_VERSION: i32 = 196608;
pub const SSL_REQUEST_CODE: i32 = 80877103;
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// Largest message the client accepts from a backend. Larger lengths are
/// treated as a corrupted stream.
const MAX_MESSAGE_LEN: usize = 1 << 30;

// ── Wire Protocol Helpers ──────────────────────────────────────────────

/// Append `Byte1(tag) Int32(len) body` to `buf`.
fn write_message(buf: &mut Vec<u8>, tag: u8, body: &[u8]) {
    buf.push(tag);
    let len = (body.len() + 4) as i32;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(body);
}

fn put_cstr(body: &mut Vec<u8>, s: &[u8]) {
    body.extend_from_slice(s);
    body.push(0);
}

/// Write a StartupMessage: Int32(length) Int32(196608) { String(key) String(value) }* Byte1(0)
pub fn write_startup_message(buf: &mut Vec<u8>, params: &[(&str, &str)]) {
    let mut body = Vec::new();
    body.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    for (key, value) in params {
        put_cstr(&mut body, key.as_bytes());
        put_cstr(&mut body, value.as_bytes());
    }
    // Terminator
    body.push(0);

    let len = (body.len() + 4) as i32;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&body);
}

/// Write an SSLRequest: Int32(8) Int32(80877103), no message type byte.
pub fn write_ssl_request(buf: &mut Vec<u8>) {
    buf.extend_from_slice(&8_i32.to_be_bytes());
    buf.extend_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
}

/// Write a CancelRequest: Int32(16) Int32(80877102) Int32(pid) Int32(key)
pub fn write_cancel_request(buf: &mut Vec<u8>, pid: i32, key: i32) {
    buf.extend_from_slice(&16_i32.to_be_bytes());
    buf.extend_from_slice(&CANCEL_REQUEST_CODE.to_be_bytes());
    buf.extend_from_slice(&pid.to_be_bytes());
    buf.extend_from_slice(&key.to_be_bytes());
}

/// Write a simple Query message: Byte1('Q') Int32(len) String(query)
pub fn write_query(buf: &mut Vec<u8>, query: &[u8]) {
    let mut body = Vec::with_capacity(query.len() + 1);
    put_cstr(&mut body, query);
    write_message(buf, b'Q', &body);
}

/// Write a Parse message: Byte1('P') Int32(len) String(name) String(query) Int16(n) Int32(oid)*
pub fn write_parse(buf: &mut Vec<u8>, name: &[u8], query: &[u8], param_types: &[Oid]) {
    let mut body = Vec::new();
    put_cstr(&mut body, name);
    put_cstr(&mut body, query);
    body.extend_from_slice(&(param_types.len() as u16).to_be_bytes());
    for oid in param_types {
        body.extend_from_slice(&oid.to_be_bytes());
    }
    write_message(buf, b'P', &body);
}

/// Write a Bind message.
///
/// `values[i] == None` is sent as SQL NULL (length -1). `formats` follows the
/// protocol's shortcut rules: empty means all text.
pub fn write_bind(
    buf: &mut Vec<u8>,
    portal: &[u8],
    statement: &[u8],
    values: &[Option<&[u8]>],
    formats: &[i16],
    result_format: i16,
) {
    let mut body = Vec::new();
    put_cstr(&mut body, portal);
    put_cstr(&mut body, statement);

    body.extend_from_slice(&(formats.len() as u16).to_be_bytes());
    for format in formats {
        body.extend_from_slice(&format.to_be_bytes());
    }

    body.extend_from_slice(&(values.len() as u16).to_be_bytes());
    for value in values {
        match value {
            Some(bytes) => {
                body.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
                body.extend_from_slice(bytes);
            }
            None => body.extend_from_slice(&(-1_i32).to_be_bytes()),
        }
    }

    // Result format codes: one code applied to all columns
    body.extend_from_slice(&1_i16.to_be_bytes());
    body.extend_from_slice(&result_format.to_be_bytes());

    write_message(buf, b'B', &body);
}

/// Write Describe: Byte1('D') Int32(len) Byte1('S' | 'P') String(name)
pub fn write_describe(buf: &mut Vec<u8>, kind: u8, name: &[u8]) {
    let mut body = Vec::with_capacity(name.len() + 2);
    body.push(kind);
    put_cstr(&mut body, name);
    write_message(buf, b'D', &body);
}

/// Write Execute message: Byte1('E') Int32(len) String(portal) Int32(0)
pub fn write_execute(buf: &mut Vec<u8>, portal: &[u8]) {
    let mut body = Vec::with_capacity(portal.len() + 5);
    put_cstr(&mut body, portal);
    body.extend_from_slice(&0_i32.to_be_bytes()); // 0 = no limit
    write_message(buf, b'E', &body);
}

/// Write Sync message: Byte1('S') Int32(4)
pub fn write_sync(buf: &mut Vec<u8>) {
    write_message(buf, b'S', &[]);
}

/// Write a PasswordMessage: Byte1('p') Int32(len) String(password)
pub fn write_password_message(buf: &mut Vec<u8>, password: &str) {
    let mut body = Vec::with_capacity(password.len() + 1);
    put_cstr(&mut body, password.as_bytes());
    write_message(buf, b'p', &body);
}

/// Write SASLInitialResponse: Byte1('p') Int32(len) String(mechanism) Int32(data_len) Bytes(data)
pub fn write_sasl_initial_response(buf: &mut Vec<u8>, mechanism: &str, data: &[u8]) {
    let mut body = Vec::new();
    put_cstr(&mut body, mechanism.as_bytes());
    body.extend_from_slice(&(data.len() as i32).to_be_bytes());
    body.extend_from_slice(data);
    write_message(buf, b'p', &body);
}

/// Write SASLResponse: Byte1('p') Int32(len) Bytes(data)
pub fn write_sasl_response(buf: &mut Vec<u8>, data: &[u8]) {
    write_message(buf, b'p', data);
}

/// Write CopyData: Byte1('d') Int32(len) Bytes(data)
pub fn write_copy_data(buf: &mut Vec<u8>, data: &[u8]) {
    write_message(buf, b'd', data);
}

/// Write CopyDone: Byte1('c') Int32(4)
pub fn write_copy_done(buf: &mut Vec<u8>) {
    write_message(buf, b'c', &[]);
}

/// Write CopyFail: Byte1('f') Int32(len) String(reason)
pub fn write_copy_fail(buf: &mut Vec<u8>, reason: &str) {
    let mut body = Vec::with_capacity(reason.len() + 1);
    put_cstr(&mut body, reason.as_bytes());
    write_message(buf, b'f', &body);
}

/// Write a fast-path FunctionCall with binary arguments and a binary result.
///
/// Format: Byte1('F') Int32(len) Int32(fn_oid) Int16(1) Int16(1)
///         Int16(nargs) { Int32(arg_len) Bytes(arg) }* Int16(1)
pub fn write_function_call(buf: &mut Vec<u8>, fn_oid: Oid, args: &[&[u8]]) {
    let mut body = Vec::new();
    body.extend_from_slice(&fn_oid.to_be_bytes());
    body.extend_from_slice(&1_i16.to_be_bytes());
    body.extend_from_slice(&1_i16.to_be_bytes());
    body.extend_from_slice(&(args.len() as i16).to_be_bytes());
    for arg in args {
        body.extend_from_slice(&(arg.len() as i32).to_be_bytes());
        body.extend_from_slice(arg);
    }
    body.extend_from_slice(&1_i16.to_be_bytes());
    write_message(buf, b'F', &body);
}

/// Write Terminate message: Byte1('X') Int32(4)
pub fn write_terminate(buf: &mut Vec<u8>) {
    write_message(buf, b'X', &[]);
}

// ── Wire Protocol Helpers (Message Reading) ────────────────────────────

/// Try to take one complete backend message from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the tag, the
/// body and the total number of bytes consumed.
pub fn split_message(buf: &[u8]) -> Result<Option<(u8, &[u8], usize)>, String> {
    if buf.len() < 5 {
        return Ok(None);
    }
    let tag = buf[0];
    let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if len < 4 || len as usize > MAX_MESSAGE_LEN {
        return Err(format!(
            "invalid message length {} for message type 0x{:02x}",
            len, tag
        ));
    }
    let total = 1 + len as usize;
    if buf.len() < total {
        return Ok(None);
    }
    Ok(Some((tag, &buf[5..total], total)))
}

/// Cursor over a message body. Every getter fails instead of panicking on
/// truncated input.
pub struct MsgReader<'a> {
    body: &'a [u8],
    pos: usize,
}

impl<'a> MsgReader<'a> {
    pub fn new(body: &'a [u8]) -> Self {
        MsgReader { body, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.body.len() - self.pos
    }

    pub fn byte(&mut self) -> Result<u8, String> {
        let b = *self
            .body
            .get(self.pos)
            .ok_or_else(|| "message too short".to_string())?;
        self.pos += 1;
        Ok(b)
    }

    pub fn i16(&mut self) -> Result<i16, String> {
        let bytes = self.bytes(2)?;
        Ok(i16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn i32(&mut self) -> Result<i32, String> {
        let bytes = self.bytes(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn u32(&mut self) -> Result<u32, String> {
        Ok(self.i32()? as u32)
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], String> {
        if self.remaining() < n {
            return Err("message too short".to_string());
        }
        let out = &self.body[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Null-terminated string, returned without the terminator.
    pub fn cstr(&mut self) -> Result<&'a [u8], String> {
        let rest = &self.body[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| "unterminated string in message".to_string())?;
        self.pos += end + 1;
        Ok(&rest[..end])
    }

    pub fn string(&mut self) -> Result<String, String> {
        Ok(String::from_utf8_lossy(self.cstr()?).into_owned())
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.body[self.pos..];
        self.pos = self.body.len();
        out
    }
}

/// Parse all tagged fields from an ErrorResponse/NoticeResponse body.
///
/// The body format is: `[field_type_byte][null_terminated_string]...[0]`
pub fn parse_fields(body: &[u8]) -> Vec<(u8, String)> {
    let mut fields = Vec::new();
    let mut i = 0;
    while i < body.len() {
        let field_type = body[i];
        i += 1;
        if field_type == 0 {
            break;
        }
        // Find the null terminator for the value string
        let start = i;
        while i < body.len() && body[i] != 0 {
            i += 1;
        }
        let value = String::from_utf8_lossy(&body[start..i]).into_owned();
        fields.push((field_type, value));
        i += 1; // skip null terminator
    }
    fields
}

/// Human-readable name of a message for trace output.
pub(crate) fn describe_tag(tag: u8, from_backend: bool) -> &'static str {
    if from_backend {
        match tag {
            b'R' => "Authentication",
            b'K' => "BackendKeyData",
            b'2' => "BindComplete",
            b'3' => "CloseComplete",
            b'C' => "CommandComplete",
            b'd' => "CopyData",
            b'c' => "CopyDone",
            b'G' => "CopyInResponse",
            b'H' => "CopyOutResponse",
            b'W' => "CopyBothResponse",
            b'D' => "DataRow",
            b'I' => "EmptyQueryResponse",
            b'E' => "ErrorResponse",
            b'V' => "FunctionCallResponse",
            b'n' => "NoData",
            b'N' => "NoticeResponse",
            b'A' => "NotificationResponse",
            b't' => "ParameterDescription",
            b'S' => "ParameterStatus",
            b'1' => "ParseComplete",
            b's' => "PortalSuspended",
            b'Z' => "ReadyForQuery",
            b'T' => "RowDescription",
            _ => "Unknown",
        }
    } else {
        match tag {
            b'B' => "Bind",
            b'C' => "Close",
            b'd' => "CopyData",
            b'c' => "CopyDone",
            b'f' => "CopyFail",
            b'D' => "Describe",
            b'E' => "Execute",
            b'F' => "FunctionCall",
            b'H' => "Flush",
            b'P' => "Parse",
            b'p' => "PasswordMessage",
            b'Q' => "Query",
            b'S' => "Sync",
            b'X' => "Terminate",
            _ => "Unknown",
        }
    }
}
