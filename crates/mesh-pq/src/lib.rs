//! PostgreSQL client library for the Mesh runtime.
//!
//! This crate speaks the PostgreSQL v3 wire protocol directly over
//! `std::net::TcpStream` (optionally wrapped in rustls) and exposes a
//! libpq-shaped API: connection objects driven by a non-blocking
//! connect/reset state machine, result objects holding a fully materialized
//! row/field grid, asynchronous notices and notifications, the COPY
//! sub-protocol, fast-path large objects and out-of-band cancellation.
//!
//! ## Modules
//!
//! - [`conninfo`]: connection string parsing (keyword/value and URI forms)
//! - [`conn`]: `PgConn`, connect/reset state machine, status accessors
//! - [`exec`]: synchronous and asynchronous command execution
//! - [`result`]: `PgResult`, the materialized result grid
//! - [`copy`]: COPY data push/pull
//! - [`lobj`]: large-object access over the fast-path protocol
//! - [`cancel`]: `PgCancel` cancellation tokens
//!
//! ## Ownership Contract
//!
//! Every native object is handed out as a `Box<T>`. Callers that need a
//! stable address (the Mesh binding layer stores raw pointers inside
//! host-visible handles) convert with `Box::into_raw` and must give the
//! pointer back to [`finish`], [`PgResult`]'s drop, or [`free_notify`]
//! exactly once.
//!
//! The library is single-threaded per connection: a `PgConn` is never
//! accessed concurrently and performs no locking.

pub mod auth;
pub mod cancel;
pub mod conn;
pub mod conninfo;
pub mod copy;
pub mod exec;
pub mod lobj;
pub mod notify;
pub mod protocol;
pub mod result;
pub mod status;
pub mod stream;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use auth::encrypt_password;
pub use cancel::PgCancel;
pub use conn::{connect_start, connectdb, finish, ping, NoticeProcessor, NoticeReceiver, PgConn};
pub use copy::CopyData;
pub use exec::unescape_bytea;
pub use lobj::{INV_READ, INV_WRITE, SEEK_CUR, SEEK_END, SEEK_SET};
pub use notify::{free_notify, PgNotify};
pub use result::{res_status, FieldDesc, PgResult};
pub use status::{
    diag, ConnStatus, ExecStatus, PingStatus, PollingStatus, TransactionStatus, Verbosity,
};
pub use types::Oid;

/// Version of the client library, in libpq's `MMmmpp` encoding.
///
/// Reported as the libpq release whose client-visible behaviour this
/// library tracks, so callers comparing against libpq feature levels keep
/// working.
pub const LIB_VERSION: i32 = 160_000;

/// Returns [`LIB_VERSION`].
pub fn lib_version() -> i32 {
    LIB_VERSION
}
