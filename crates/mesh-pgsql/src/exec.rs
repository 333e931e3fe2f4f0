//! Command Executor: blocking and asynchronous commands.
//!
//! Parameters are marshaled in full before the native connection is
//! touched, so an unsupported value or an oversized list fails the call
//! with nothing sent.
//!
//! Three parameter encodings are in play:
//! - `*_params` send binary scalars with their inferred types declared;
//! - `*_prepared` send text, since the prepared statement's declared
//!   types decide how the server reads them;
//! - `prepare` / `send_prepare` only declare types.

use mesh_pq::PgResult;

use crate::conn::Connection;
use crate::error::Result;
use crate::host::Value;
use crate::marshal::{encode_param_types, encode_params};
use crate::result::ResultSet;

fn wrap(res: Option<Box<PgResult>>) -> Option<ResultSet> {
    res.map(ResultSet::from_native)
}

impl Connection {
    // ── Blocking ───────────────────────────────────────────────────────

    /// Run `query` and wait for its last result. `None` only when the
    /// library could not produce a result at all.
    pub fn exec(&self, query: &str) -> Result<Option<ResultSet>> {
        self.shared().call(|c| wrap(c.exec(query)))
    }

    pub fn exec_params(&self, command: &str, params: &[Value]) -> Result<Option<ResultSet>> {
        let list = encode_params(params, true)?;
        self.shared().call(|c| {
            wrap(c.exec_params(command, list.types(), &list.values(), list.formats(), 0))
        })
    }

    /// Create the prepared statement `name`, declaring parameter types
    /// from the sample values.
    pub fn prepare(&self, name: &str, query: &str, params: &[Value]) -> Result<Option<ResultSet>> {
        let types = encode_param_types(params)?;
        self.shared().call(|c| wrap(c.prepare(name, query, &types)))
    }

    pub fn exec_prepared(&self, name: &str, params: &[Value]) -> Result<Option<ResultSet>> {
        let list = encode_params(params, false)?;
        self.shared().call(|c| {
            wrap(c.exec_prepared(name, &list.values(), list.formats(), 0))
        })
    }

    pub fn describe_prepared(&self, name: &str) -> Result<Option<ResultSet>> {
        self.shared().call(|c| wrap(c.describe_prepared(name)))
    }

    pub fn describe_portal(&self, name: &str) -> Result<Option<ResultSet>> {
        self.shared().call(|c| wrap(c.describe_portal(name)))
    }

    // ── Asynchronous ───────────────────────────────────────────────────

    /// Dispatch `query`; collect its results with [`Connection::get_result`]
    /// until it returns `None`.
    pub fn send_query(&self, query: &str) -> Result<bool> {
        self.shared().call(|c| c.send_query(query))
    }

    pub fn send_query_params(&self, command: &str, params: &[Value]) -> Result<bool> {
        let list = encode_params(params, true)?;
        self.shared().call(|c| {
            c.send_query_params(command, list.types(), &list.values(), list.formats(), 0)
        })
    }

    pub fn send_prepare(&self, name: &str, query: &str, params: &[Value]) -> Result<bool> {
        let types = encode_param_types(params)?;
        self.shared().call(|c| c.send_prepare(name, query, &types))
    }

    pub fn send_query_prepared(&self, name: &str, params: &[Value]) -> Result<bool> {
        let list = encode_params(params, false)?;
        self.shared().call(|c| c.send_query_prepared(name, &list.values(), list.formats(), 0))
    }

    pub fn send_describe_prepared(&self, name: &str) -> Result<bool> {
        self.shared().call(|c| c.send_describe_prepared(name))
    }

    pub fn send_describe_portal(&self, name: &str) -> Result<bool> {
        self.shared().call(|c| c.send_describe_portal(name))
    }

    /// Next result of the command in flight; `None` once it is drained.
    /// Blocks unless the connection is non-blocking and `is_busy` is false.
    pub fn get_result(&self) -> Result<Option<ResultSet>> {
        self.shared().call(|c| wrap(c.get_result()))
    }

    /// Deliver the rows of the command just sent one result at a time.
    pub fn set_single_row_mode(&self) -> Result<bool> {
        self.shared().call(|c| c.set_single_row_mode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::connectdb;
    use crate::error::Error;
    use mesh_pq::testing::FakeBackend;
    use mesh_pq::types::{BOOLOID, FLOAT8OID, INT4OID, INT8OID, TEXTOID};
    use mesh_pq::ExecStatus;

    #[test]
    fn test_exec_select_one() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.handshake();
            assert_eq!(c.expect_query(), "SELECT 1");
            c.send_row_description(&[("?column?", INT4OID)]);
            c.send_data_row(&[Some("1")]);
            c.send_command_complete("SELECT 1");
            c.send_ready(b'I');
        });
        let conn = connectdb(&backend.conninfo());
        let res = conn.exec("SELECT 1").unwrap().unwrap();
        assert_eq!(res.status(), Ok(ExecStatus::TuplesOk));
        assert_eq!(res.ntuples(), Ok(1));
        assert_eq!(res.nfields(), Ok(1));
        assert_eq!(res.getvalue(1, 1).unwrap(), b"1");
        drop(conn);
        backend.join();
    }

    #[test]
    fn test_exec_params_sends_binary_scalars() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.handshake();
            let q = c.expect_extended();
            assert_eq!(q.sql, "select $1, $2, $3, $4, $5");
            assert_eq!(q.param_types, vec![BOOLOID, INT8OID, FLOAT8OID, TEXTOID, 0]);
            assert_eq!(q.formats, vec![1, 1, 1, 0, 0]);
            assert_eq!(q.values[0], Some(vec![1]));
            assert_eq!(q.values[1], Some(42_i64.to_be_bytes().to_vec()));
            assert_eq!(q.values[2], Some(0.5_f64.to_be_bytes().to_vec()));
            assert_eq!(q.values[3], Some(b"hi".to_vec()));
            assert_eq!(q.values[4], None);
            c.send_parse_complete();
            c.send_bind_complete();
            c.send_no_data();
            c.send_command_complete("SELECT 0");
            c.send_ready(b'I');
        });
        let conn = connectdb(&backend.conninfo());
        let params = [
            Value::Boolean(true),
            Value::Integer(42),
            Value::Number(0.5),
            Value::from("hi"),
            Value::Nil,
        ];
        let res = conn.exec_params("select $1, $2, $3, $4, $5", &params).unwrap().unwrap();
        assert_eq!(res.status(), Ok(ExecStatus::CommandOk));
        drop(conn);
        backend.join();
    }

    #[test]
    fn test_bad_params_fail_before_any_io() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.handshake();
            // The only thing the client sends afterwards is Terminate.
            let (tag, _) = c.read_message();
            assert_eq!(tag, b'X');
        });
        let conn = connectdb(&backend.conninfo());
        let too_many = vec![Value::Nil; 65536];
        assert_eq!(
            conn.exec_params("select 1", &too_many).unwrap_err(),
            Error::TooManyParams { count: 65536, max: 65535 }
        );
        assert!(matches!(
            conn.send_query_params("select $1", &[Value::Function]),
            Err(Error::UnsupportedType { position: 1, .. })
        ));
        assert!(matches!(
            conn.prepare("s", "select $1", &[Value::Table(Vec::new())]),
            Err(Error::UnsupportedType { position: 1, kind: "table" })
        ));
        assert!(conn.is_busy().is_ok_and(|busy| !busy));
        conn.finish().unwrap();
        backend.join();
    }

    #[test]
    fn test_prepare_then_exec_prepared_uses_text() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.handshake();
            let p = c.expect_extended();
            assert_eq!(p.statement, "ins");
            assert_eq!(p.param_types, vec![INT8OID, TEXTOID]);
            c.send_parse_complete();
            c.send_ready(b'I');

            let e = c.expect_extended();
            assert_eq!(e.bound_statement, "ins");
            assert_eq!(e.formats, vec![0, 0]);
            assert_eq!(e.values, vec![Some(b"7".to_vec()), Some(b"seven".to_vec())]);
            c.send_bind_complete();
            c.send_no_data();
            c.send_command_complete("INSERT 0 1");
            c.send_ready(b'I');
        });
        let conn = connectdb(&backend.conninfo());
        let res = conn
            .prepare("ins", "insert into t values ($1, $2)", &[Value::Integer(0), Value::from("")])
            .unwrap()
            .unwrap();
        assert_eq!(res.status(), Ok(ExecStatus::CommandOk));
        let res = conn
            .exec_prepared("ins", &[Value::Integer(7), Value::from("seven")])
            .unwrap()
            .unwrap();
        assert_eq!(res.cmd_tuples().unwrap(), "1");
        drop(conn);
        backend.join();
    }

    #[test]
    fn test_async_drains_one_result_per_statement() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.handshake();
            assert_eq!(c.expect_query(), "select 1; select 2");
            for v in ["1", "2"] {
                c.send_row_description(&[("n", INT4OID)]);
                c.send_data_row(&[Some(v)]);
                c.send_command_complete("SELECT 1");
            }
            c.send_ready(b'I');
        });
        let conn = connectdb(&backend.conninfo());
        assert_eq!(conn.send_query("select 1; select 2"), Ok(true));
        assert_eq!(conn.send_query("select 3"), Ok(false));
        let first = conn.get_result().unwrap().unwrap();
        let second = conn.get_result().unwrap().unwrap();
        assert_eq!(first.getvalue(1, 1).unwrap(), b"1");
        assert_eq!(second.getvalue(1, 1).unwrap(), b"2");
        assert!(conn.get_result().unwrap().is_none());
        drop(conn);
        backend.join();
    }

    #[test]
    fn test_single_row_mode_yields_rows_then_final() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.handshake();
            c.expect_query();
            c.send_row_description(&[("n", INT4OID)]);
            c.send_data_row(&[Some("1")]);
            c.send_data_row(&[Some("2")]);
            c.send_command_complete("SELECT 2");
            c.send_ready(b'I');
        });
        let conn = connectdb(&backend.conninfo());
        assert_eq!(conn.send_query("select n"), Ok(true));
        assert_eq!(conn.set_single_row_mode(), Ok(true));
        let mut statuses = Vec::new();
        while let Some(res) = conn.get_result().unwrap() {
            statuses.push((res.status().unwrap(), res.ntuples().unwrap()));
        }
        assert_eq!(
            statuses,
            vec![
                (ExecStatus::SingleTuple, 1),
                (ExecStatus::SingleTuple, 1),
                (ExecStatus::TuplesOk, 0),
            ]
        );
        drop(conn);
        backend.join();
    }

    #[test]
    fn test_describe_prepared_reports_params() {
        let backend = FakeBackend::start(|session| {
            let mut c = session.accept();
            c.handshake();
            let d = c.expect_extended();
            assert_eq!(d.describe, Some((b'S', "stmt".to_string())));
            c.send_parameter_description(&[INT4OID, TEXTOID]);
            c.send_row_description(&[("a", INT4OID)]);
            c.send_ready(b'I');
        });
        let conn = connectdb(&backend.conninfo());
        let res = conn.describe_prepared("stmt").unwrap().unwrap();
        assert_eq!(res.nparams(), Ok(2));
        assert_eq!(res.paramtype(2), Ok(TEXTOID));
        assert_eq!(res.fname(1).unwrap(), "a");
        drop(conn);
        backend.join();
    }
}
