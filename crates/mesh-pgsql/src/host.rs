//! The host runtime as seen by the binding: dynamic values, host-side
//! errors raised by callbacks, callback signatures, and stream objects.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io::{self, Write};
use std::rc::Rc;

use thiserror::Error;

use crate::result::ResultSet;

/// A dynamically typed host value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    /// Host strings are byte strings and may hold NULs.
    String(Vec<u8>),
    /// Array part of a host table.
    Table(Vec<Value>),
    Function,
    Userdata,
    Thread,
}

impl Value {
    /// Host type name, as the runtime's `type()` reports it.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) | Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Table(_) => "table",
            Value::Function => "function",
            Value::Userdata => "userdata",
            Value::Thread => "thread",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Text of a string value, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.as_bytes().to_vec())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v.into_bytes())
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::String(v.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::String(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Nil, Into::into)
    }
}

/// An error raised by host code running inside a callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HostError(pub String);

impl HostError {
    pub fn new(msg: impl Into<String>) -> Self {
        HostError(msg.into())
    }
}

/// Notice receiver: gets each notice as a short-lived result object.
pub type ReceiverCallback = Box<dyn FnMut(&ResultSet) -> Result<(), HostError>>;
/// Notice processor: gets each notice as formatted text.
pub type ProcessorCallback = Box<dyn FnMut(&str) -> Result<(), HostError>>;

// ── Streams ────────────────────────────────────────────────────────────

struct StreamState {
    writer: RefCell<Option<Box<dyn Write>>>,
    /// Set while the stream is attached as a trace sink; closing is
    /// refused until it is detached.
    pinned: Cell<bool>,
}

/// An open host file/stream object. Clones share the same stream.
#[derive(Clone)]
pub struct HostStream {
    state: Rc<StreamState>,
}

impl HostStream {
    pub fn new(writer: impl Write + 'static) -> Self {
        HostStream {
            state: Rc::new(StreamState {
                writer: RefCell::new(Some(Box::new(writer))),
                pinned: Cell::new(false),
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.writer.borrow().is_none()
    }

    pub fn is_pinned(&self) -> bool {
        self.state.pinned.get()
    }

    /// Flush and close the stream.
    pub fn close(&self) -> Result<(), HostError> {
        if self.state.pinned.get() {
            return Err(HostError::new("cannot close a stream that is in use as a trace sink"));
        }
        match self.state.writer.borrow_mut().take() {
            Some(mut w) => w.flush().map_err(|e| HostError::new(e.to_string())),
            None => Err(HostError::new("attempt to use a closed file")),
        }
    }

    pub(crate) fn pin(&self) {
        self.state.pinned.set(true);
    }

    pub(crate) fn unpin(&self) {
        self.state.pinned.set(false);
    }

    /// A writer feeding this stream, for the native library.
    pub(crate) fn sink(&self) -> StreamSink {
        StreamSink {
            state: self.state.clone(),
        }
    }
}

impl Write for HostStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sink().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink().flush()
    }
}

impl fmt::Debug for HostStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostStream")
            .field("closed", &self.is_closed())
            .field("pinned", &self.is_pinned())
            .finish()
    }
}

pub(crate) struct StreamSink {
    state: Rc<StreamState>,
}

impl Write for StreamSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.state.writer.borrow_mut().as_mut() {
            Some(w) => w.write(buf),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.state.writer.borrow_mut().as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct Shared(Rc<RefCell<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_value_kinds() {
        assert_eq!(Value::Nil.kind(), "nil");
        assert_eq!(Value::from(1.5).kind(), "number");
        assert_eq!(Value::from(7).kind(), "number");
        assert_eq!(Value::from("x").kind(), "string");
        assert_eq!(Value::Table(vec![]).kind(), "table");
        assert_eq!(Value::from(None::<i64>), Value::Nil);
        assert_eq!(Value::from("héllo").as_str(), Some("héllo"));
    }

    #[test]
    fn test_pinned_stream_refuses_close() {
        let buf = Shared::default();
        let stream = HostStream::new(buf.clone());
        stream.pin();
        assert!(stream.close().is_err());
        assert!(!stream.is_closed());
        let mut sink = stream.sink();
        sink.write_all(b"abc").unwrap();
        stream.unpin();
        stream.close().unwrap();
        assert!(stream.is_closed());
        assert_eq!(&*buf.0.borrow(), b"abc");
        assert!(sink.write_all(b"more").is_err());
    }
}
