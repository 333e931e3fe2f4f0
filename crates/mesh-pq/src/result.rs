//! Materialized query results.
//!
//! A `PgResult` owns every row it will ever hold: accessors are plain
//! lookups with no I/O, and all indices here are 0-based.

use crate::status::{diag, ExecStatus, Verbosity};
use crate::types::{Oid, INVALID_OID};

/// One column of a RowDescription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDesc {
    pub name: String,
    pub table_oid: Oid,
    pub column: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    /// 0 = text, 1 = binary.
    pub format: i16,
}

impl FieldDesc {
    pub fn new(name: &str, type_oid: Oid) -> Self {
        FieldDesc {
            name: name.to_string(),
            table_oid: INVALID_OID,
            column: 0,
            type_oid,
            type_size: -1,
            type_modifier: -1,
            format: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgResult {
    status: ExecStatus,
    fields: Vec<FieldDesc>,
    rows: Vec<Vec<Option<Vec<u8>>>>,
    param_types: Vec<Oid>,
    cmd_status: String,
    error_fields: Vec<(u8, String)>,
    error_message: String,
}

/// libpq's `PQresStatus`: the symbolic name of a status code.
pub fn res_status(code: i32) -> &'static str {
    match ExecStatus::from_code(code) {
        Some(status) => status.name(),
        None => "invalid ExecStatusType code",
    }
}

impl PgResult {
    /// An empty result with the given status (`PQmakeEmptyPGresult`).
    pub fn empty(status: ExecStatus) -> Self {
        PgResult {
            status,
            fields: Vec::new(),
            rows: Vec::new(),
            param_types: Vec::new(),
            cmd_status: String::new(),
            error_fields: Vec::new(),
            error_message: String::new(),
        }
    }

    /// A client-generated fatal error carrying `message`.
    pub(crate) fn client_error(message: &str) -> Self {
        let mut res = PgResult::empty(ExecStatus::FatalError);
        res.error_message = terminate_line(message);
        res.error_fields.push((diag::SEVERITY, "ERROR".to_string()));
        res.error_fields
            .push((diag::MESSAGE_PRIMARY, message.trim_end().to_string()));
        res
    }

    /// Build an error or notice result from the tagged fields of an
    /// ErrorResponse / NoticeResponse.
    pub(crate) fn from_fields(
        status: ExecStatus,
        fields: Vec<(u8, String)>,
        verbosity: Verbosity,
    ) -> Self {
        let mut res = PgResult::empty(status);
        res.error_fields = fields;
        res.error_message = res.format_error(verbosity);
        res
    }

    /// Compose the error message from the stored fields.
    pub fn format_error(&self, verbosity: Verbosity) -> String {
        let mut msg = String::new();
        let severity = self.error_field(diag::SEVERITY).unwrap_or("ERROR");
        msg.push_str(severity);
        msg.push_str(":  ");
        if verbosity == Verbosity::Verbose {
            if let Some(code) = self.error_field(diag::SQLSTATE) {
                msg.push_str(code);
                msg.push_str(": ");
            }
        }
        msg.push_str(self.error_field(diag::MESSAGE_PRIMARY).unwrap_or("missing error text"));
        if verbosity != Verbosity::Terse {
            if let Some(pos) = self.error_field(diag::STATEMENT_POSITION) {
                msg.push_str(" at character ");
                msg.push_str(pos);
            } else if let Some(pos) = self.error_field(diag::INTERNAL_POSITION) {
                msg.push_str(" at character ");
                msg.push_str(pos);
            }
        }
        msg.push('\n');
        if verbosity == Verbosity::Terse {
            return msg;
        }

        let mut section = |label: &str, code: u8| {
            if let Some(value) = self.error_field(code) {
                msg.push_str(label);
                msg.push_str(":  ");
                msg.push_str(value);
                msg.push('\n');
            }
        };
        section("DETAIL", diag::MESSAGE_DETAIL);
        section("HINT", diag::MESSAGE_HINT);
        if verbosity == Verbosity::Verbose {
            section("QUERY", diag::INTERNAL_QUERY);
            section("CONTEXT", diag::CONTEXT);
            section("SCHEMA NAME", diag::SCHEMA_NAME);
            section("TABLE NAME", diag::TABLE_NAME);
            section("COLUMN NAME", diag::COLUMN_NAME);
            section("DATATYPE NAME", diag::DATATYPE_NAME);
            section("CONSTRAINT NAME", diag::CONSTRAINT_NAME);
        }
        if verbosity == Verbosity::Verbose {
            let func = self.error_field(diag::SOURCE_FUNCTION);
            let file = self.error_field(diag::SOURCE_FILE);
            let line = self.error_field(diag::SOURCE_LINE);
            match (func, file, line) {
                (Some(func), Some(file), Some(line)) => {
                    msg.push_str(&format!("LOCATION:  {}, {}:{}\n", func, file, line));
                }
                (None, Some(file), Some(line)) => {
                    msg.push_str(&format!("LOCATION:  {}:{}\n", file, line));
                }
                _ => {}
            }
        }
        msg
    }

    // ── Construction ──────────────────────────────────────────────────

    /// Install column descriptors (`PQsetResultAttrs`). Only valid while the
    /// result holds no rows.
    pub fn set_result_attrs(&mut self, fields: Vec<FieldDesc>) -> bool {
        if !self.rows.is_empty() {
            return false;
        }
        self.fields = fields;
        true
    }

    /// Store one cell (`PQsetvalue`). `row` may equal `ntuples()` to append
    /// a new row; unset cells of a new row are null.
    pub fn set_value(&mut self, row: usize, col: usize, value: Option<&[u8]>) -> bool {
        if col >= self.fields.len() || row > self.rows.len() {
            return false;
        }
        if row == self.rows.len() {
            self.rows.push(vec![None; self.fields.len()]);
        }
        self.rows[row][col] = value.map(<[u8]>::to_vec);
        true
    }

    pub(crate) fn set_status(&mut self, status: ExecStatus) {
        self.status = status;
    }

    pub(crate) fn push_row(&mut self, row: Vec<Option<Vec<u8>>>) {
        self.rows.push(row);
    }

    pub(crate) fn set_param_types(&mut self, types: Vec<Oid>) {
        self.param_types = types;
    }

    pub(crate) fn set_cmd_status(&mut self, tag: String) {
        self.cmd_status = tag;
    }

    /// Append client-side text to the error message.
    pub(crate) fn append_error(&mut self, text: &str) {
        self.error_message.push_str(&terminate_line(text));
    }

    // ── Status ────────────────────────────────────────────────────────

    pub fn status(&self) -> ExecStatus {
        self.status
    }

    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    /// One diagnostic field of an error or notice (`PQresultErrorField`).
    pub fn error_field(&self, code: u8) -> Option<&str> {
        self.error_fields
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, v)| v.as_str())
    }

    pub fn cmd_status(&self) -> &str {
        &self.cmd_status
    }

    /// Rows affected by the command, as text (`PQcmdTuples`); empty when
    /// the command does not report a count.
    pub fn cmd_tuples(&self) -> &str {
        let mut parts = self.cmd_status.split(' ');
        let verb = parts.next().unwrap_or("");
        let count = match verb {
            "INSERT" => parts.nth(1),
            "DELETE" | "UPDATE" | "SELECT" | "MOVE" | "FETCH" | "COPY" | "MERGE" => parts.next(),
            _ => None,
        };
        match count {
            Some(c) if !c.is_empty() && c.bytes().all(|b| b.is_ascii_digit()) => c,
            _ => "",
        }
    }

    /// OID of the inserted row for a single-row INSERT (`PQoidValue`).
    pub fn oid_value(&self) -> Oid {
        self.oid_status().parse().unwrap_or(INVALID_OID)
    }

    /// The OID part of an INSERT tag as text (`PQoidStatus`).
    pub fn oid_status(&self) -> &str {
        match self.cmd_status.strip_prefix("INSERT ") {
            Some(rest) => rest.split(' ').next().unwrap_or(""),
            None => "",
        }
    }

    // ── Shape ─────────────────────────────────────────────────────────

    pub fn ntuples(&self) -> usize {
        self.rows.len()
    }

    pub fn nfields(&self) -> usize {
        self.fields.len()
    }

    pub fn fields(&self) -> &[FieldDesc] {
        &self.fields
    }

    /// True when every column is in binary format (`PQbinaryTuples`).
    pub fn binary_tuples(&self) -> bool {
        !self.fields.is_empty() && self.fields.iter().all(|f| f.format == 1)
    }

    pub fn fname(&self, col: usize) -> Option<&str> {
        self.fields.get(col).map(|f| f.name.as_str())
    }

    /// Column number for a name.
    ///
    /// An exact match wins. Otherwise the name is folded the way libpq does:
    /// unquoted letters are lowercased and double quotes delimit a
    /// case-preserved part, with `""` standing for a literal quote.
    pub fn fnumber(&self, name: &str) -> Option<usize> {
        if let Some(i) = self.fields.iter().position(|f| f.name == name) {
            return Some(i);
        }
        let folded = fold_identifier(name);
        self.fields.iter().position(|f| f.name == folded)
    }

    pub fn ftable(&self, col: usize) -> Oid {
        self.fields.get(col).map_or(INVALID_OID, |f| f.table_oid)
    }

    pub fn ftablecol(&self, col: usize) -> i32 {
        self.fields.get(col).map_or(0, |f| f.column as i32)
    }

    pub fn fformat(&self, col: usize) -> i32 {
        self.fields.get(col).map_or(0, |f| f.format as i32)
    }

    pub fn ftype(&self, col: usize) -> Oid {
        self.fields.get(col).map_or(INVALID_OID, |f| f.type_oid)
    }

    pub fn fmod(&self, col: usize) -> i32 {
        self.fields.get(col).map_or(-1, |f| f.type_modifier)
    }

    pub fn fsize(&self, col: usize) -> i32 {
        self.fields.get(col).map_or(0, |f| f.type_size as i32)
    }

    // ── Cells ─────────────────────────────────────────────────────────

    /// Cell contents; a null cell reads as an empty string. `None` only
    /// when the position is out of range.
    pub fn getvalue(&self, row: usize, col: usize) -> Option<&[u8]> {
        let cell = self.rows.get(row)?.get(col)?;
        Some(cell.as_deref().unwrap_or(b""))
    }

    /// Out-of-range positions read as null.
    pub fn getisnull(&self, row: usize, col: usize) -> bool {
        self.cell(row, col).map_or(true, |c| c.is_none())
    }

    pub fn getlength(&self, row: usize, col: usize) -> usize {
        self.cell(row, col).flatten().map_or(0, |c| c.len())
    }

    /// Raw cell: `None` out of range, `Some(None)` for SQL NULL.
    pub fn cell(&self, row: usize, col: usize) -> Option<Option<&[u8]>> {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .map(|c| c.as_deref())
    }

    // ── Describe ──────────────────────────────────────────────────────

    pub fn nparams(&self) -> usize {
        self.param_types.len()
    }

    pub fn paramtype(&self, index: usize) -> Oid {
        self.param_types.get(index).copied().unwrap_or(INVALID_OID)
    }
}

fn terminate_line(text: &str) -> String {
    if text.ends_with('\n') {
        text.to_string()
    } else {
        format!("{}\n", text)
    }
}

fn fold_identifier(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_quotes = false;
    let mut chars = name.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if in_quotes && chars.peek() == Some(&'"') {
                out.push('"');
                chars.next();
            } else {
                in_quotes = !in_quotes;
            }
        } else if in_quotes {
            out.push(c);
        } else {
            out.extend(c.to_lowercase());
        }
    }
    out
}
