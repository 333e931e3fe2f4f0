//! Streaming Channel, COPY half: pushing rows during `COPY ... FROM STDIN`
//! and pulling them during `COPY ... TO STDOUT`.

use mesh_pq::CopyData;

use crate::conn::Connection;
use crate::error::Result;

/// Outcome of sending COPY data or ending the upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyPut {
    Accepted,
    /// Non-blocking connection with a full send buffer; retry once the
    /// socket is writable.
    WouldBlock,
    /// See `error_message()`.
    Error,
}

impl CopyPut {
    fn from_code(code: i32) -> CopyPut {
        match code {
            1 => CopyPut::Accepted,
            0 => CopyPut::WouldBlock,
            _ => CopyPut::Error,
        }
    }
}

/// Outcome of pulling one chunk of COPY data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyGet {
    /// One row's worth of data.
    Data(Vec<u8>),
    /// Asynchronous pull only: nothing complete has arrived yet.
    NoDataYet,
    /// The copy is over; fetch the command result with `get_result`.
    Done,
    Error,
}

impl Connection {
    pub fn put_copy_data(&self, data: &[u8]) -> Result<CopyPut> {
        self.shared().call(|c| CopyPut::from_code(c.put_copy_data(data)))
    }

    /// Finish the upload, or abort it with `error` as the server-side
    /// failure message.
    pub fn put_copy_end(&self, error: Option<&str>) -> Result<CopyPut> {
        self.shared().call(|c| CopyPut::from_code(c.put_copy_end(error)))
    }

    /// Pull one chunk. With `async_mode` the call never waits on the
    /// socket; call `consume_input` and retry on [`CopyGet::NoDataYet`].
    pub fn get_copy_data(&self, async_mode: bool) -> Result<CopyGet> {
        self.shared().call(|c| match c.get_copy_data(async_mode) {
            CopyData::Data(bytes) => CopyGet::Data(bytes.into_vec()),
            CopyData::WouldBlock => CopyGet::NoDataYet,
            CopyData::Done => CopyGet::Done,
            CopyData::Error => CopyGet::Error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::connectdb;
    use mesh_pq::testing::FakeBackend;
    use mesh_pq::types::INT8OID;
    use mesh_pq::ExecStatus;
    use std::sync::mpsc;

    #[test]
    fn test_copy_in_then_count() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.handshake();
            assert_eq!(c.expect_query(), "copy t from stdin csv");
            c.send_copy_in_response(2);
            let (tag, body) = c.read_message();
            assert_eq!((tag, body.as_slice()), (b'd', &b"a,b\n"[..]));
            let (tag, _) = c.read_message();
            assert_eq!(tag, b'c');
            c.send_command_complete("COPY 1");
            c.send_ready(b'I');

            assert_eq!(c.expect_query(), "select count(*) from t");
            c.send_row_description(&[("count", INT8OID)]);
            c.send_data_row(&[Some("1")]);
            c.send_command_complete("SELECT 1");
            c.send_ready(b'I');
        });
        let conn = connectdb(&backend.conninfo());
        let res = conn.exec("copy t from stdin csv").unwrap().unwrap();
        assert_eq!(res.status(), Ok(ExecStatus::CopyIn));
        assert_eq!(conn.put_copy_data(b"a,b\n"), Ok(CopyPut::Accepted));
        assert_eq!(conn.put_copy_end(None), Ok(CopyPut::Accepted));
        let done = conn.get_result().unwrap().unwrap();
        assert_eq!(done.cmd_tuples().unwrap(), "1");
        assert!(conn.get_result().unwrap().is_none());

        let count = conn.exec("select count(*) from t").unwrap().unwrap();
        assert_eq!(count.getvalue(1, 1).unwrap(), b"1");
        drop(conn);
        backend.join();
    }

    #[test]
    fn test_copy_out_async_reports_no_data_yet() {
        let (release, hold) = mpsc::channel::<()>();
        let backend = FakeBackend::start(move |session| {
            let mut c = session.accept();
            c.handshake();
            c.expect_query();
            c.send_copy_out_response(1);
            c.send_copy_data(b"row1\n");
            // Hold the rest back until the client has seen an empty buffer.
            hold.recv().unwrap();
            c.send_copy_done();
            c.send_command_complete("COPY 1");
            c.send_ready(b'I');
        });
        let conn = connectdb(&backend.conninfo());
        let res = conn.exec("copy t to stdout").unwrap().unwrap();
        assert_eq!(res.status(), Ok(ExecStatus::CopyOut));
        assert_eq!(conn.get_copy_data(false), Ok(CopyGet::Data(b"row1\n".to_vec())));
        assert_eq!(conn.get_copy_data(true), Ok(CopyGet::NoDataYet));
        release.send(()).unwrap();
        assert_eq!(conn.get_copy_data(false), Ok(CopyGet::Done));
        assert_eq!(conn.get_result().unwrap().unwrap().cmd_status().unwrap(), "COPY 1");
        assert!(conn.get_result().unwrap().is_none());
        drop(conn);
        backend.join();
    }

    #[test]
    fn test_copy_calls_outside_copy_fail() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.handshake();
        });
        let conn = connectdb(&backend.conninfo());
        assert_eq!(conn.put_copy_data(b"x"), Ok(CopyPut::Error));
        assert_eq!(conn.get_copy_data(true), Ok(CopyGet::Error));
        assert!(conn.error_message().unwrap().contains("no COPY in progress"));
        drop(conn);
        backend.join();
    }
}
