//! COPY sub-protocol: pushing data to the server during `COPY FROM STDIN`
//! and pulling it during `COPY TO STDOUT`.

use tracing::debug;

use crate::conn::{AsyncStatus, PgConn, QueryClass};
use crate::protocol;

/// Output is pushed to the socket once this much is queued.
const COPY_FLUSH_THRESHOLD: usize = 8192;

/// Outcome of [`PgConn::get_copy_data`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyData {
    /// One CopyData message (normally one row).
    Data(Box<[u8]>),
    /// Asynchronous mode only: no complete row is buffered yet.
    WouldBlock,
    /// The copy stream ended; collect the command result with `get_result`.
    Done,
    /// Failure; see `error_message()`.
    Error,
}

impl PgConn {
    fn copy_in_progress(&mut self, inbound: bool) -> bool {
        let ok = if inbound {
            matches!(self.async_status, AsyncStatus::CopyIn | AsyncStatus::CopyBoth)
        } else {
            matches!(self.async_status, AsyncStatus::CopyOut | AsyncStatus::CopyBoth)
        };
        if !ok {
            self.set_error("no COPY in progress");
        }
        ok
    }

    /// Send one chunk of COPY data (`PQputCopyData`).
    ///
    /// Returns 1 when queued, 0 when a non-blocking connection cannot take
    /// more yet, -1 on error.
    pub fn put_copy_data(&mut self, data: &[u8]) -> i32 {
        if !self.copy_in_progress(true) {
            return -1;
        }
        // Absorb notices and the like so the server never stalls on its
        // own output while we push.
        if let Err(msg) = self.read_data().and_then(|_| self.parse_input()) {
            self.fail_connection(&msg);
            return -1;
        }

        if self.out_buf.len() + data.len() + 5 > COPY_FLUSH_THRESHOLD {
            let flushed = if self.nonblocking {
                self.flush_out()
            } else {
                self.flush_blocking().map(|_| true)
            };
            match flushed {
                Ok(true) => {}
                Ok(false) if self.out_buf.len() >= COPY_FLUSH_THRESHOLD => return 0,
                Ok(false) => {}
                Err(msg) => {
                    self.fail_connection(&msg);
                    return -1;
                }
            }
        }

        let mut buf = Vec::with_capacity(data.len() + 5);
        protocol::write_copy_data(&mut buf, data);
        self.queue(&buf);
        1
    }

    /// Finish a COPY upload (`PQputCopyEnd`). With `error` the copy is
    /// aborted and the server reports that text in its error.
    ///
    /// Returns 1 when the terminator was sent, 0 when a non-blocking
    /// connection still has output queued, -1 on error.
    pub fn put_copy_end(&mut self, error: Option<&str>) -> i32 {
        if !self.copy_in_progress(true) {
            return -1;
        }
        let mut buf = Vec::new();
        match error {
            Some(reason) => protocol::write_copy_fail(&mut buf, reason),
            None => protocol::write_copy_done(&mut buf),
        }
        // The extended protocol needs a Sync to close the command.
        if self.query_class != QueryClass::Simple {
            protocol::write_sync(&mut buf);
        }
        self.queue(&buf);

        self.async_status = if self.async_status == AsyncStatus::CopyBoth {
            AsyncStatus::CopyOut
        } else {
            AsyncStatus::Busy
        };
        self.result = None;
        debug!("COPY IN finished{}", if error.is_some() { " (aborted)" } else { "" });

        match self.send_queued() {
            Ok(()) if self.nonblocking && !self.out_buf.is_empty() => 0,
            Ok(()) => 1,
            Err(msg) => {
                self.fail_connection(&msg);
                -1
            }
        }
    }

    /// Fetch the next row of a COPY download (`PQgetCopyData`).
    ///
    /// In asynchronous mode nothing is read from the socket: call
    /// `consume_input` when it becomes readable and retry on `WouldBlock`.
    pub fn get_copy_data(&mut self, async_mode: bool) -> CopyData {
        if !self.copy_in_progress(false) {
            return CopyData::Error;
        }
        loop {
            let message = match self.peek_message() {
                Ok(m) => m,
                Err(msg) => {
                    self.fail_connection(&msg);
                    return CopyData::Error;
                }
            };
            let Some((tag, body, total)) = message else {
                if async_mode {
                    return CopyData::WouldBlock;
                }
                if let Err(msg) = self.wait_and_read() {
                    self.fail_connection(&msg);
                    return CopyData::Error;
                }
                continue;
            };

            match tag {
                b'd' => {
                    self.consume_message(tag, &body, total);
                    return CopyData::Data(body.into_boxed_slice());
                }
                b'A' | b'N' | b'S' => {
                    self.consume_message(tag, &body, total);
                    let handled = match tag {
                        b'A' => self.handle_notify(&body),
                        b'S' => self.handle_parameter_status(&body),
                        _ => {
                            self.handle_notice(&body);
                            Ok(())
                        }
                    };
                    if let Err(msg) = handled {
                        self.fail_connection(&msg);
                        return CopyData::Error;
                    }
                }
                _ => {
                    // CopyDone, or anything else ending the stream early
                    // (typically an ErrorResponse). The latter is left for
                    // get_result to turn into the command's result.
                    if tag == b'c' {
                        self.consume_message(tag, &body, total);
                    }
                    self.async_status = if self.async_status == AsyncStatus::CopyBoth {
                        AsyncStatus::CopyIn
                    } else {
                        AsyncStatus::Busy
                    };
                    self.result = None;
                    debug!("COPY OUT finished");
                    return CopyData::Done;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::connectdb;
    use crate::status::ExecStatus;
    use crate::testing::FakeBackend;

    #[test]
    fn test_copy_in_round_trip() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.handshake();
            c.expect_query();
            c.send_copy_in_response(2);
            assert_eq!(c.expect(b'd'), b"a,b\n");
            assert_eq!(c.expect(b'd'), b"c,d\n");
            c.expect(b'c');
            c.send_command_complete("COPY 2");
            c.send_ready(b'I');
        });
        let mut conn = connectdb(&backend.conninfo());
        let res = conn.exec("COPY t FROM STDIN (FORMAT csv)").unwrap();
        assert_eq!(res.status(), ExecStatus::CopyIn);
        assert_eq!(res.nfields(), 2);
        assert_eq!(conn.put_copy_data(b"a,b\n"), 1);
        assert_eq!(conn.put_copy_data(b"c,d\n"), 1);
        assert_eq!(conn.put_copy_end(None), 1);
        let done = conn.get_result().unwrap();
        assert_eq!(done.status(), ExecStatus::CommandOk);
        assert_eq!(done.cmd_tuples(), "2");
        assert!(conn.get_result().is_none());
        drop(conn);
        backend.join();
    }

    #[test]
    fn test_copy_in_abort() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.handshake();
            c.expect_query();
            c.send_copy_in_response(1);
            let body = c.expect(b'f');
            assert_eq!(body, b"client gave up\0");
            c.send_error("57014", "COPY from stdin failed: client gave up");
            c.send_ready(b'I');
        });
        let mut conn = connectdb(&backend.conninfo());
        conn.exec("COPY t FROM STDIN").unwrap();
        assert_eq!(conn.put_copy_end(Some("client gave up")), 1);
        let res = conn.get_result().unwrap();
        assert_eq!(res.status(), ExecStatus::FatalError);
        assert!(res.error_message().contains("client gave up"));
        assert!(conn.get_result().is_none());
        drop(conn);
        backend.join();
    }

    #[test]
    fn test_copy_out_blocking() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.handshake();
            c.expect_query();
            c.send_copy_out_response(1);
            c.send_copy_data(b"1\n");
            c.send_copy_data(b"2\n");
            c.send_copy_done();
            c.send_command_complete("COPY 2");
            c.send_ready(b'I');
        });
        let mut conn = connectdb(&backend.conninfo());
        let res = conn.exec("COPY t TO STDOUT").unwrap();
        assert_eq!(res.status(), ExecStatus::CopyOut);
        let mut rows = Vec::new();
        loop {
            match conn.get_copy_data(false) {
                CopyData::Data(row) => rows.push(row.to_vec()),
                CopyData::Done => break,
                other => panic!("unexpected {:?}: {}", other, conn.error_message()),
            }
        }
        assert_eq!(rows, vec![b"1\n".to_vec(), b"2\n".to_vec()]);
        let done = conn.get_result().unwrap();
        assert_eq!(done.cmd_status(), "COPY 2");
        assert!(conn.get_result().is_none());
        drop(conn);
        backend.join();
    }

    #[test]
    fn test_copy_out_async_would_block() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.handshake();
            c.expect_query();
            c.send_copy_out_response(1);
            // Hold the data back until the client has seen WouldBlock.
            c.expect_query();
            c.send_copy_data(b"x\n");
            c.send_copy_done();
            c.send_command_complete("COPY 1");
            c.send_ready(b'I');
        });
        let mut conn = connectdb(&backend.conninfo());
        conn.exec("COPY t TO STDOUT").unwrap();
        assert_eq!(conn.get_copy_data(true), CopyData::WouldBlock);

        // Nudge the fake backend by queueing a raw Query message.
        let mut nudge = Vec::new();
        protocol::write_query(&mut nudge, b"go");
        conn.queue(&nudge);
        conn.flush_blocking().unwrap();

        let row = loop {
            match conn.get_copy_data(true) {
                CopyData::WouldBlock => {
                    crate::stream::wait_socket(conn.socket().unwrap(), true, false, None).unwrap();
                    assert!(conn.consume_input());
                }
                other => break other,
            }
        };
        assert_eq!(row, CopyData::Data(b"x\n".to_vec().into_boxed_slice()));
        assert_eq!(conn.get_copy_data(false), CopyData::Done);
        assert_eq!(conn.get_result().unwrap().cmd_status(), "COPY 1");
        drop(conn);
        backend.join();
    }

    #[test]
    fn test_copy_calls_outside_copy_fail() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.handshake();
        });
        let mut conn = connectdb(&backend.conninfo());
        assert_eq!(conn.put_copy_data(b"x"), -1);
        assert_eq!(conn.put_copy_end(None), -1);
        assert_eq!(conn.get_copy_data(false), CopyData::Error);
        assert!(conn.error_message().contains("no COPY in progress"));
        drop(conn);
        backend.join();
    }
}
