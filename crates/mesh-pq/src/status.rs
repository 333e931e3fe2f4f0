//! Status and enumeration codes.
//!
//! Every discriminant matches libpq's numeric value bit-for-bit: callers
//! hand these codes to host programs that compare them as plain integers.

/// Connection status (`ConnStatusType`).
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnStatus {
    Ok = 0,
    Bad = 1,
    Started = 2,
    Made = 3,
    AwaitingResponse = 4,
    AuthOk = 5,
    Setenv = 6,
    SslStartup = 7,
    Needed = 8,
}

/// Result of one connect/reset poll step (`PostgresPollingStatusType`).
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollingStatus {
    Failed = 0,
    Reading = 1,
    Writing = 2,
    Ok = 3,
    Active = 4,
}

/// Result status (`ExecStatusType`).
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecStatus {
    EmptyQuery = 0,
    CommandOk = 1,
    TuplesOk = 2,
    CopyOut = 3,
    CopyIn = 4,
    BadResponse = 5,
    NonfatalError = 6,
    FatalError = 7,
    CopyBoth = 8,
    SingleTuple = 9,
}

impl ExecStatus {
    pub const ALL: [ExecStatus; 10] = [
        ExecStatus::EmptyQuery,
        ExecStatus::CommandOk,
        ExecStatus::TuplesOk,
        ExecStatus::CopyOut,
        ExecStatus::CopyIn,
        ExecStatus::BadResponse,
        ExecStatus::NonfatalError,
        ExecStatus::FatalError,
        ExecStatus::CopyBoth,
        ExecStatus::SingleTuple,
    ];

    pub fn from_code(code: i32) -> Option<ExecStatus> {
        ExecStatus::ALL.iter().copied().find(|s| *s as i32 == code)
    }

    /// libpq's `PQresStatus` name for this status.
    pub fn name(self) -> &'static str {
        match self {
            ExecStatus::EmptyQuery => "PGRES_EMPTY_QUERY",
            ExecStatus::CommandOk => "PGRES_COMMAND_OK",
            ExecStatus::TuplesOk => "PGRES_TUPLES_OK",
            ExecStatus::CopyOut => "PGRES_COPY_OUT",
            ExecStatus::CopyIn => "PGRES_COPY_IN",
            ExecStatus::BadResponse => "PGRES_BAD_RESPONSE",
            ExecStatus::NonfatalError => "PGRES_NONFATAL_ERROR",
            ExecStatus::FatalError => "PGRES_FATAL_ERROR",
            ExecStatus::CopyBoth => "PGRES_COPY_BOTH",
            ExecStatus::SingleTuple => "PGRES_SINGLE_TUPLE",
        }
    }
}

/// In-transaction status of the server session (`PGTransactionStatusType`).
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    Idle = 0,
    Active = 1,
    InTrans = 2,
    InError = 3,
    Unknown = 4,
}

impl TransactionStatus {
    /// Decode the status byte carried by ReadyForQuery.
    pub(crate) fn from_ready_byte(b: u8) -> TransactionStatus {
        match b {
            b'I' => TransactionStatus::Idle,
            b'T' => TransactionStatus::InTrans,
            b'E' => TransactionStatus::InError,
            _ => TransactionStatus::Unknown,
        }
    }
}

/// Error message verbosity (`PGVerbosity`).
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verbosity {
    Terse = 0,
    Default = 1,
    Verbose = 2,
}

impl Verbosity {
    pub fn from_code(code: i32) -> Option<Verbosity> {
        match code {
            0 => Some(Verbosity::Terse),
            1 => Some(Verbosity::Default),
            2 => Some(Verbosity::Verbose),
            _ => None,
        }
    }
}

/// Outcome of [`crate::ping`] (`PGPing`).
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PingStatus {
    Ok = 0,
    Reject = 1,
    NoResponse = 2,
    NoAttempt = 3,
}

/// Diagnostic field selectors for `PgResult::error_field`.
///
/// These are the single-byte field codes of ErrorResponse/NoticeResponse.
pub mod diag {
    pub const SEVERITY: u8 = b'S';
    pub const SEVERITY_NONLOCALIZED: u8 = b'V';
    pub const SQLSTATE: u8 = b'C';
    pub const MESSAGE_PRIMARY: u8 = b'M';
    pub const MESSAGE_DETAIL: u8 = b'D';
    pub const MESSAGE_HINT: u8 = b'H';
    pub const STATEMENT_POSITION: u8 = b'P';
    pub const INTERNAL_POSITION: u8 = b'p';
    pub const INTERNAL_QUERY: u8 = b'q';
    pub const CONTEXT: u8 = b'W';
    pub const SCHEMA_NAME: u8 = b's';
    pub const TABLE_NAME: u8 = b't';
    pub const COLUMN_NAME: u8 = b'c';
    pub const DATATYPE_NAME: u8 = b'd';
    pub const CONSTRAINT_NAME: u8 = b'n';
    pub const SOURCE_FILE: u8 = b'F';
    pub const SOURCE_LINE: u8 = b'L';
    pub const SOURCE_FUNCTION: u8 = b'R';
}
