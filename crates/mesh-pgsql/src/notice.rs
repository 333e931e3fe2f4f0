//! Notice bridge: native notice events re-entering host callbacks.
//!
//! The native library calls its receiver from inside whatever call read
//! the NoticeResponse, so the host callback runs on the same thread with
//! the connection still borrowed. A callback that fails cannot unwind
//! through that frame: its error is parked here and the binding call that
//! triggered it returns [`Error::Callback`] once the native call is back.
//! While an error is parked, further notices are dropped.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, warn};

use mesh_pq::PgResult;

use crate::conn::Connection;
use crate::error::{Error, Result};
use crate::host::{HostError, ProcessorCallback, ReceiverCallback};
use crate::result::ResultSet;

#[derive(Default)]
pub(crate) struct Bridge {
    receiver: RefCell<Option<ReceiverCallback>>,
    processor: RefCell<Option<ProcessorCallback>>,
    pending: RefCell<Option<HostError>>,
}

impl Bridge {
    pub(crate) fn new() -> Rc<Bridge> {
        Rc::new(Bridge::default())
    }

    fn park(&self, err: HostError) {
        debug!("notice callback failed: {}", err);
        self.pending.borrow_mut().get_or_insert(err);
    }

    fn is_parked(&self) -> bool {
        self.pending.borrow().is_some()
    }

    /// Return the parked callback error, if any, clearing it.
    pub(crate) fn raise(&self) -> Result<()> {
        match self.pending.borrow_mut().take() {
            Some(err) => Err(Error::Callback(err.0)),
            None => Ok(()),
        }
    }

    fn deliver_result(&self, native: &PgResult) {
        if self.is_parked() {
            return;
        }
        // Taken out for the call so a callback that re-registers does not
        // collide with this borrow.
        let Some(mut callback) = self.receiver.borrow_mut().take() else {
            return;
        };
        let notice = ResultSet::from_native(Box::new(native.clone()));
        let outcome = callback(&notice);
        // The receiver only borrows the notice for the duration of the call.
        let _ = notice.clear();
        self.receiver.borrow_mut().get_or_insert(callback);
        if let Err(err) = outcome {
            self.park(err);
        }
    }

    fn deliver_text(&self, message: &str) {
        if self.is_parked() {
            return;
        }
        let Some(mut callback) = self.processor.borrow_mut().take() else {
            warn!(target: "mesh_pgsql::notice", "{}", message.trim_end());
            return;
        };
        let outcome = callback(message);
        self.processor.borrow_mut().get_or_insert(callback);
        if let Err(err) = outcome {
            self.park(err);
        }
    }

    fn clear_callbacks(&self) {
        self.receiver.borrow_mut().take();
        self.processor.borrow_mut().take();
    }
}

impl Connection {
    /// Route every notice to `callback` as a short-lived result object,
    /// replacing any earlier receiver. `None` restores the default, which
    /// hands the notice text to the processor.
    pub fn set_notice_receiver(&self, callback: Option<ReceiverCallback>) -> Result<()> {
        let shared = self.shared();
        let bridge = shared.bridge.clone();
        let installed = callback.is_some();
        shared.call(|c| {
            let native: Option<mesh_pq::NoticeReceiver> = if installed {
                Some(Box::new(move |res: &PgResult| bridge.deliver_result(res)))
            } else {
                None
            };
            c.set_notice_receiver(native);
        })?;
        *shared.bridge.receiver.borrow_mut() = callback;
        Ok(())
    }

    /// Route every notice's text to `callback`, replacing any earlier
    /// processor. Only used while no receiver is installed. `None`
    /// restores the default, which logs the notice.
    pub fn set_notice_processor(&self, callback: Option<ProcessorCallback>) -> Result<()> {
        let shared = self.shared();
        let bridge = shared.bridge.clone();
        let installed = callback.is_some();
        shared.call(|c| {
            let native: Option<mesh_pq::NoticeProcessor> = if installed {
                Some(Box::new(move |msg: &str| bridge.deliver_text(msg)))
            } else {
                None
            };
            c.set_notice_processor(native);
        })?;
        *shared.bridge.processor.borrow_mut() = callback;
        Ok(())
    }
}

/// Unhook the bridge from a connection that is about to leave the
/// binding's hands.
pub(crate) fn detach_bridge(conn: &mut mesh_pq::PgConn, bridge: &Bridge) {
    conn.set_notice_receiver(None);
    conn.set_notice_processor(None);
    bridge.clear_callbacks();
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_pq::ExecStatus;
    use std::cell::Cell;

    fn notice() -> PgResult {
        PgResult::empty(ExecStatus::NonfatalError)
    }

    #[test]
    fn test_receiver_error_is_parked_and_raised_once() {
        let bridge = Bridge::new();
        let calls = Rc::new(Cell::new(0));
        let seen = calls.clone();
        *bridge.receiver.borrow_mut() = Some(Box::new(move |_res: &ResultSet| {
            seen.set(seen.get() + 1);
            Err(HostError::new("boom"))
        }));
        bridge.deliver_result(&notice());
        bridge.deliver_result(&notice());
        assert_eq!(calls.get(), 1);
        assert_eq!(bridge.raise(), Err(Error::Callback("boom".into())));
        assert_eq!(bridge.raise(), Ok(()));
        bridge.deliver_result(&notice());
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_receiver_gets_live_result() {
        let bridge = Bridge::new();
        let status = Rc::new(Cell::new(None));
        let out = status.clone();
        *bridge.receiver.borrow_mut() = Some(Box::new(move |res: &ResultSet| {
            out.set(res.status().ok());
            Ok(())
        }));
        bridge.deliver_result(&notice());
        assert_eq!(status.get(), Some(ExecStatus::NonfatalError));
        assert_eq!(bridge.raise(), Ok(()));
    }

    #[test]
    fn test_processor_receives_text() {
        let bridge = Bridge::new();
        let got = Rc::new(RefCell::new(String::new()));
        let out = got.clone();
        *bridge.processor.borrow_mut() = Some(Box::new(move |msg: &str| {
            out.borrow_mut().push_str(msg);
            Ok(())
        }));
        bridge.deliver_text("NOTICE:  hello\n");
        assert_eq!(&*got.borrow(), "NOTICE:  hello\n");
        bridge.clear_callbacks();
        bridge.deliver_text("NOTICE:  dropped\n");
        assert_eq!(&*got.borrow(), "NOTICE:  hello\n");
    }
}
