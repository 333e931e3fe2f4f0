//! LISTEN/NOTIFY payloads handed to the host.

use mesh_pq::PgNotify;

use crate::conn::Connection;
use crate::error::Result;
use crate::handle::Handle;

#[derive(Debug)]
pub struct Notification {
    handle: Handle<PgNotify>,
}

impl Notification {
    /// Channel name.
    pub fn relname(&self) -> Result<String> {
        self.handle.with(|n| n.relname.clone())
    }

    /// Process id of the notifying backend.
    pub fn pid(&self) -> Result<i32> {
        self.handle.with(|n| n.be_pid)
    }

    /// Payload; empty when none was given.
    pub fn extra(&self) -> Result<String> {
        self.handle.with(|n| n.extra.clone())
    }

    pub fn clear(&self) -> Result<()> {
        self.handle.release().map(|_| ())
    }
}

impl Connection {
    /// Next pending notification, or `None`. Never blocks and never
    /// reads the socket: pair it with `consume_input` in a poll loop.
    pub fn notifies(&self) -> Result<Option<Notification>> {
        self.shared().call(|c| {
            c.notifies().map(|n| Notification {
                handle: Handle::acquire(n),
            })
        })
    }
}
