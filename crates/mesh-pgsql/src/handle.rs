//! Resource handles: the host-visible owner of one native object.
//!
//! A handle holds a nullable pointer to a boxed native object. Release
//! frees it and nulls the pointer; releasing again is a no-op, and any
//! access after release fails with [`Error::InvalidHandle`] instead of
//! touching freed memory. Explicit release and the host finalizer (`Drop`)
//! go through the same path, so the object is freed exactly once whichever
//! comes first.
//!
//! Access is scoped (`with` / `with_mut`). A native call can re-enter the
//! host through a callback, and the callback may hold the same handle; a
//! nested access while one is active fails with [`Error::Reentrant`]
//! rather than aliasing the object.

use std::cell::Cell;
use std::fmt;
use std::ptr::NonNull;

use tracing::debug;

use mesh_pq::{PgConn, PgNotify, PgResult};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Connection,
    Result,
    Notification,
    LargeObject,
    TransientBuffer,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HandleKind::Connection => "connection",
            HandleKind::Result => "result",
            HandleKind::Notification => "notification",
            HandleKind::LargeObject => "large object",
            HandleKind::TransientBuffer => "buffer",
        })
    }
}

/// A native object that a [`Handle`] can own.
pub trait NativeResource {
    const KIND: HandleKind;

    /// Destroy the object with the native library's own destructor.
    fn free(native: Box<Self>);
}

impl NativeResource for PgConn {
    const KIND: HandleKind = HandleKind::Connection;

    fn free(native: Box<Self>) {
        mesh_pq::finish(native);
    }
}

impl NativeResource for PgResult {
    const KIND: HandleKind = HandleKind::Result;

    fn free(native: Box<Self>) {
        drop(native);
    }
}

impl NativeResource for PgNotify {
    const KIND: HandleKind = HandleKind::Notification;

    fn free(native: Box<Self>) {
        mesh_pq::free_notify(native);
    }
}

/// Scratch bytes produced by the native library (escaped or unescaped
/// bytea).
impl NativeResource for Vec<u8> {
    const KIND: HandleKind = HandleKind::TransientBuffer;

    fn free(native: Box<Self>) {
        drop(native);
    }
}

pub struct Handle<T: NativeResource> {
    ptr: Cell<Option<NonNull<T>>>,
    busy: Cell<bool>,
}

/// Clears the busy flag when an access scope ends, including by unwinding.
struct BusyGuard<'a>(&'a Cell<bool>);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl<T: NativeResource> Handle<T> {
    /// Take ownership of a native object.
    pub fn acquire(native: Box<T>) -> Self {
        Handle {
            ptr: Cell::new(Some(NonNull::from(Box::leak(native)))),
            busy: Cell::new(false),
        }
    }

    /// Wrap a raw pointer; null gives an already-released handle.
    ///
    /// # Safety
    ///
    /// A non-null `ptr` must come from `Box::into_raw` and must not be
    /// freed by anyone else while this handle owns it.
    pub unsafe fn from_raw(ptr: *mut T) -> Self {
        Handle {
            ptr: Cell::new(NonNull::new(ptr)),
            busy: Cell::new(false),
        }
    }

    pub fn kind(&self) -> HandleKind {
        T::KIND
    }

    pub fn is_released(&self) -> bool {
        self.ptr.get().is_none()
    }

    /// Pointer identity of the native object, if still held.
    pub fn as_ptr(&self) -> Option<*mut T> {
        self.ptr.get().map(NonNull::as_ptr)
    }

    /// Free the native object. Returns whether anything was freed.
    pub fn release(&self) -> Result<bool> {
        if self.busy.get() {
            return Err(Error::Reentrant(T::KIND));
        }
        match self.ptr.take() {
            Some(ptr) => {
                debug!("releasing {} handle", T::KIND);
                // SAFETY: `ptr` came from a Box and was just taken out of
                // the cell, so no other path can free it again.
                T::free(unsafe { Box::from_raw(ptr.as_ptr()) });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Null the pointer without freeing, handing the object back to
    /// whoever owns it externally.
    pub fn detach(&self) -> Result<Option<*mut T>> {
        if self.busy.get() {
            return Err(Error::Reentrant(T::KIND));
        }
        Ok(self.ptr.take().map(NonNull::as_ptr))
    }

    fn enter(&self) -> Result<(NonNull<T>, BusyGuard<'_>)> {
        let ptr = self.ptr.get().ok_or(Error::InvalidHandle(T::KIND))?;
        if self.busy.replace(true) {
            return Err(Error::Reentrant(T::KIND));
        }
        Ok((ptr, BusyGuard(&self.busy)))
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        let (ptr, _guard) = self.enter()?;
        // SAFETY: the pointer is live (not released) and the busy flag
        // excludes every other access for the duration of `f`.
        Ok(f(unsafe { ptr.as_ref() }))
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let (mut ptr, _guard) = self.enter()?;
        // SAFETY: as in `with`; the busy flag makes this the only reference.
        Ok(f(unsafe { ptr.as_mut() }))
    }
}

impl<T: NativeResource> Drop for Handle<T> {
    fn drop(&mut self) {
        // Not busy: an access scope borrows the handle, so it cannot be
        // running while the handle is dropped.
        let _ = self.release();
    }
}

impl<T: NativeResource> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("kind", &T::KIND)
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    thread_local! {
        static FREED: RefCell<Vec<u32>> = const { RefCell::new(Vec::new()) };
    }

    struct Probe(u32);

    impl NativeResource for Probe {
        const KIND: HandleKind = HandleKind::LargeObject;

        fn free(native: Box<Self>) {
            FREED.with(|f| f.borrow_mut().push(native.0));
        }
    }

    fn freed() -> Vec<u32> {
        FREED.with(|f| f.borrow().clone())
    }

    #[test]
    fn test_release_is_idempotent() {
        let h = Handle::acquire(Box::new(Probe(1)));
        assert_eq!(h.release(), Ok(true));
        assert_eq!(h.release(), Ok(false));
        drop(h);
        assert_eq!(freed(), vec![1]);
    }

    #[test]
    fn test_access_after_release_fails() {
        let h = Handle::acquire(Box::new(Probe(2)));
        assert_eq!(h.with(|p| p.0), Ok(2));
        h.release().unwrap();
        assert_eq!(h.with(|p| p.0), Err(Error::InvalidHandle(HandleKind::LargeObject)));
        assert!(h.is_released());
        assert!(h.as_ptr().is_none());
    }

    #[test]
    fn test_drop_frees_once() {
        {
            let _h = Handle::acquire(Box::new(Probe(3)));
        }
        assert_eq!(freed(), vec![3]);
    }

    #[test]
    fn test_detach_does_not_free() {
        let h = Handle::acquire(Box::new(Probe(4)));
        let raw = h.detach().unwrap().unwrap();
        drop(h);
        assert!(freed().is_empty());
        // SAFETY: the detached pointer is still a live Box allocation.
        let back = unsafe { Handle::from_raw(raw) };
        back.release().unwrap();
        assert_eq!(freed(), vec![4]);
    }

    #[test]
    fn test_null_raw_pointer_is_released() {
        let h: Handle<Probe> = unsafe { Handle::from_raw(std::ptr::null_mut()) };
        assert!(h.is_released());
        assert_eq!(h.release(), Ok(false));
    }

    #[test]
    fn test_nested_access_is_reentrant_error() {
        let h = Handle::acquire(Box::new(Probe(5)));
        let inner = h.with_mut(|_| h.with(|p| p.0)).unwrap();
        assert_eq!(inner, Err(Error::Reentrant(HandleKind::LargeObject)));
        let release = h.with(|_| h.release()).unwrap();
        assert_eq!(release, Err(Error::Reentrant(HandleKind::LargeObject)));
        // The guard cleared the flag.
        assert_eq!(h.with(|p| p.0), Ok(5));
    }
}
