//! LISTEN/NOTIFY payloads.

/// One NotificationResponse (`PGnotify`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgNotify {
    pub relname: String,
    pub be_pid: i32,
    pub extra: String,
}

/// Release a notification handed out by [`crate::PgConn::notifies`].
///
/// Exists for callers that keep notifications as raw pointers; dropping the
/// box has the same effect.
pub fn free_notify(notify: Box<PgNotify>) {
    drop(notify);
}
