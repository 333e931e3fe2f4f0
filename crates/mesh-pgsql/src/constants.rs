//! Numeric constants exported to host code, and module metadata.
//!
//! Values come straight from the native library's enums, so host code
//! comparing them with what the native calls return sees the same numbers.

use mesh_pq::{
    diag, ConnStatus, ExecStatus, PingStatus, PollingStatus, TransactionStatus, Verbosity,
    INV_READ, INV_WRITE, SEEK_CUR, SEEK_END, SEEK_SET,
};

pub static CONSTANTS: &[(&str, i64)] = &[
    // Connection status
    ("CONNECTION_OK", ConnStatus::Ok as i64),
    ("CONNECTION_BAD", ConnStatus::Bad as i64),
    ("CONNECTION_STARTED", ConnStatus::Started as i64),
    ("CONNECTION_MADE", ConnStatus::Made as i64),
    ("CONNECTION_AWAITING_RESPONSE", ConnStatus::AwaitingResponse as i64),
    ("CONNECTION_AUTH_OK", ConnStatus::AuthOk as i64),
    ("CONNECTION_SETENV", ConnStatus::Setenv as i64),
    ("CONNECTION_SSL_STARTUP", ConnStatus::SslStartup as i64),
    ("CONNECTION_NEEDED", ConnStatus::Needed as i64),
    // Result status
    ("PGRES_EMPTY_QUERY", ExecStatus::EmptyQuery as i64),
    ("PGRES_COMMAND_OK", ExecStatus::CommandOk as i64),
    ("PGRES_TUPLES_OK", ExecStatus::TuplesOk as i64),
    ("PGRES_COPY_OUT", ExecStatus::CopyOut as i64),
    ("PGRES_COPY_IN", ExecStatus::CopyIn as i64),
    ("PGRES_BAD_RESPONSE", ExecStatus::BadResponse as i64),
    ("PGRES_NONFATAL_ERROR", ExecStatus::NonfatalError as i64),
    ("PGRES_FATAL_ERROR", ExecStatus::FatalError as i64),
    ("PGRES_COPY_BOTH", ExecStatus::CopyBoth as i64),
    ("PGRES_SINGLE_TUPLE", ExecStatus::SingleTuple as i64),
    // Polling status
    ("PGRES_POLLING_FAILED", PollingStatus::Failed as i64),
    ("PGRES_POLLING_READING", PollingStatus::Reading as i64),
    ("PGRES_POLLING_WRITING", PollingStatus::Writing as i64),
    ("PGRES_POLLING_OK", PollingStatus::Ok as i64),
    ("PGRES_POLLING_ACTIVE", PollingStatus::Active as i64),
    // Transaction status
    ("PQTRANS_IDLE", TransactionStatus::Idle as i64),
    ("PQTRANS_ACTIVE", TransactionStatus::Active as i64),
    ("PQTRANS_INTRANS", TransactionStatus::InTrans as i64),
    ("PQTRANS_INERROR", TransactionStatus::InError as i64),
    ("PQTRANS_UNKNOWN", TransactionStatus::Unknown as i64),
    // Diagnostic fields
    ("PG_DIAG_SEVERITY", diag::SEVERITY as i64),
    ("PG_DIAG_SEVERITY_NONLOCALIZED", diag::SEVERITY_NONLOCALIZED as i64),
    ("PG_DIAG_SQLSTATE", diag::SQLSTATE as i64),
    ("PG_DIAG_MESSAGE_PRIMARY", diag::MESSAGE_PRIMARY as i64),
    ("PG_DIAG_MESSAGE_DETAIL", diag::MESSAGE_DETAIL as i64),
    ("PG_DIAG_MESSAGE_HINT", diag::MESSAGE_HINT as i64),
    ("PG_DIAG_STATEMENT_POSITION", diag::STATEMENT_POSITION as i64),
    ("PG_DIAG_INTERNAL_POSITION", diag::INTERNAL_POSITION as i64),
    ("PG_DIAG_INTERNAL_QUERY", diag::INTERNAL_QUERY as i64),
    ("PG_DIAG_CONTEXT", diag::CONTEXT as i64),
    ("PG_DIAG_SCHEMA_NAME", diag::SCHEMA_NAME as i64),
    ("PG_DIAG_TABLE_NAME", diag::TABLE_NAME as i64),
    ("PG_DIAG_COLUMN_NAME", diag::COLUMN_NAME as i64),
    ("PG_DIAG_DATATYPE_NAME", diag::DATATYPE_NAME as i64),
    ("PG_DIAG_CONSTRAINT_NAME", diag::CONSTRAINT_NAME as i64),
    ("PG_DIAG_SOURCE_FILE", diag::SOURCE_FILE as i64),
    ("PG_DIAG_SOURCE_LINE", diag::SOURCE_LINE as i64),
    ("PG_DIAG_SOURCE_FUNCTION", diag::SOURCE_FUNCTION as i64),
    // Error verbosity
    ("PQERRORS_TERSE", Verbosity::Terse as i64),
    ("PQERRORS_DEFAULT", Verbosity::Default as i64),
    ("PQERRORS_VERBOSE", Verbosity::Verbose as i64),
    // Ping
    ("PQPING_OK", PingStatus::Ok as i64),
    ("PQPING_REJECT", PingStatus::Reject as i64),
    ("PQPING_NO_RESPONSE", PingStatus::NoResponse as i64),
    ("PQPING_NO_ATTEMPT", PingStatus::NoAttempt as i64),
    // Large objects
    ("INV_READ", INV_READ as i64),
    ("INV_WRITE", INV_WRITE as i64),
    ("SEEK_SET", SEEK_SET as i64),
    ("SEEK_CUR", SEEK_CUR as i64),
    ("SEEK_END", SEEK_END as i64),
];

pub fn constant(name: &str) -> Option<i64> {
    CONSTANTS.iter().find(|(n, _)| *n == name).map(|&(_, v)| v)
}

/// Module metadata as `(key, value)` pairs.
pub static INFO: &[(&str, &str)] = &[
    ("_COPYRIGHT", "Copyright (C) the Mesh authors"),
    ("_DESCRIPTION", "PostgreSQL binding for the Mesh runtime"),
    ("_VERSION", concat!("pgsql ", env!("CARGO_PKG_VERSION"))),
];
