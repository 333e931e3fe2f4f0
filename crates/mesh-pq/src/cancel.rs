//! Out-of-band query cancellation.
//!
//! A [`PgCancel`] carries only the server address and the backend key, so
//! it can be used while the originating connection is busy. Cancelling
//! opens a separate connection and never touches the original one.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use tracing::debug;

use crate::conn::PgConn;
use crate::protocol;

/// How long to wait for the server to acknowledge a cancel request by
/// closing the connection.
const CANCEL_TIMEOUT: Duration = Duration::from_secs(30);

/// Cancellation token (`PGcancel`).
#[derive(Debug, Clone)]
pub struct PgCancel {
    addr: SocketAddr,
    be_pid: i32,
    be_key: i32,
}

impl PgConn {
    /// Create a cancellation token for the current session
    /// (`PQgetCancel`); `None` while no socket is open.
    pub fn get_cancel(&self) -> Option<PgCancel> {
        let stream = self.stream.as_ref()?;
        let addr = stream.tcp().peer_addr().ok()?;
        Some(PgCancel {
            addr,
            be_pid: self.be_pid,
            be_key: self.be_key,
        })
    }
}

impl PgCancel {
    /// Ask the server to abandon the command the session is running
    /// (`PQcancel`). Success only means the request was delivered.
    pub fn cancel(&self) -> Result<(), String> {
        debug!("sending cancel request for backend {} to {}", self.be_pid, self.addr);
        let mut stream = TcpStream::connect_timeout(&self.addr, CANCEL_TIMEOUT)
            .map_err(|e| format!("could not connect to server: {}", e))?;
        let mut buf = Vec::with_capacity(16);
        protocol::write_cancel_request(&mut buf, self.be_pid, self.be_key);
        stream
            .write_all(&buf)
            .map_err(|e| format!("could not send cancel packet: {}", e))?;

        // Wait for the server to close the connection, so the caller knows
        // the request was processed before it continues.
        let _ = stream.set_read_timeout(Some(CANCEL_TIMEOUT));
        let mut scratch = [0u8; 1];
        match stream.read(&mut scratch) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => Ok(()),
            Err(e) => Err(format!("could not receive data from server: {}", e)),
        }
    }

    pub fn backend_pid(&self) -> i32 {
        self.be_pid
    }
}
