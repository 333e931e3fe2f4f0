//! Binding-level errors.
//!
//! Engine failures (a SQL error, a broken connection, a failed COPY) are
//! not errors here: they come back as inspectable results and status
//! codes. This type covers what the binding itself refuses or cannot do.

use thiserror::Error;

use crate::handle::HandleKind;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Malformed call: wrong arity, bad argument value.
    #[error("bad argument: {0}")]
    Argument(String),

    #[error("number of parameters must be between 0 and {max}, got {count}")]
    TooManyParams { count: usize, max: usize },

    /// A host value that cannot be sent as a query parameter.
    #[error("bad argument #{position}: unsupported type ({kind})")]
    UnsupportedType { position: usize, kind: &'static str },

    #[error("index {index} out of range (1..={len})")]
    IndexOutOfRange { index: usize, len: usize },

    /// The handle was released, or never held a native object.
    #[error("invalid {0} handle")]
    InvalidHandle(HandleKind),

    /// A callback tried to use an object the binding is already inside.
    #[error("{0} is in use by an enclosing call")]
    Reentrant(HandleKind),

    #[error("out of memory while marshaling parameters")]
    Allocation,

    /// A host callback failed while the native library was running it.
    #[error("error in notice callback: {0}")]
    Callback(String),
}

impl Error {
    /// Whether the current host operation must be aborted. Argument and
    /// handle errors can be caught and retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Allocation | Error::Callback(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Allocation.is_fatal());
        assert!(Error::Callback("boom".into()).is_fatal());
        assert!(!Error::InvalidHandle(HandleKind::Result).is_fatal());
        assert!(!Error::TooManyParams { count: 65536, max: 65535 }.is_fatal());
        assert!(!Error::Reentrant(HandleKind::Connection).is_fatal());
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            Error::UnsupportedType { position: 2, kind: "table" }.to_string(),
            "bad argument #2: unsupported type (table)"
        );
        assert_eq!(
            Error::InvalidHandle(HandleKind::Result).to_string(),
            "invalid result handle"
        );
    }
}
