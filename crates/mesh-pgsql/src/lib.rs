//! PostgreSQL binding for the Mesh scripting runtime.
//!
//! Wraps the native client in [`mesh_pq`] in host-visible objects: every
//! native object lives behind a handle that can be released explicitly or
//! by the collector, never twice, and that fails cleanly when used after
//! release. Indices exposed to host code are 1-based.
//!
//! ## Modules
//!
//! - [`conn`]: [`Connection`], lifecycle, status and control, escaping
//! - [`exec`]: blocking and asynchronous commands
//! - [`result`]: [`ResultSet`] projection, tuple and field cursors
//! - [`marshal`]: host values to query parameters and back
//! - [`notify`]: LISTEN/NOTIFY payloads
//! - [`copy`]: COPY data push/pull
//! - [`lo`]: large objects
//! - [`constants`]: numeric constants and module metadata
//! - [`registry`]: connections owned by the embedding program
//! - [`ffi`]: C entry points for the embedding program
//!
//! ## Errors
//!
//! Engine failures come back as values (statuses, error messages, `None`
//! results). [`Error`] covers what the binding itself refuses; see
//! [`Error::is_fatal`] for which ones must abort the host operation.

pub mod conn;
pub mod constants;
pub mod copy;
pub mod error;
pub mod exec;
pub mod ffi;
pub mod handle;
pub mod host;
pub mod lo;
pub mod marshal;
mod notice;
pub mod notify;
pub mod registry;
pub mod result;

pub use conn::{connect_start, connectdb, unescape_bytea, CancelOutcome, Connection, FlushStatus};
pub use copy::{CopyGet, CopyPut};
pub use error::{Error, Result};
pub use host::{HostError, HostStream, ProcessorCallback, ReceiverCallback, Value};
pub use lo::LargeObject;
pub use notify::Notification;
pub use result::{Column, Field, ResultSet, Tuple};

pub use mesh_pq::{
    diag, ConnStatus, ExecStatus, Oid, PingStatus, PollingStatus, TransactionStatus, Verbosity,
    INV_READ, INV_WRITE, SEEK_CUR, SEEK_END, SEEK_SET,
};

/// Probe a server without opening a session.
pub fn ping(conninfo: &str) -> PingStatus {
    mesh_pq::ping(conninfo)
}

/// Client library version, `MMmmpp`.
pub fn lib_version() -> i32 {
    mesh_pq::lib_version()
}

/// Hash a password the way the server stores it, ready for
/// `ALTER ROLE ... PASSWORD`.
pub fn encrypt_password(password: &str, user: &str) -> String {
    mesh_pq::encrypt_password(password, user)
}
