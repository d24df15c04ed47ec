//! The exception currently propagating on a thread.
//!
//! An exception recorded while it is still unwinding out of the current scope
//! is marked `exception.escaped = true`. Hosts announce such exceptions by
//! holding a [`PropagationGuard`] while they record them, e.g. from a panic
//! hook or from a request handler's error path.
use crate::exception::{Exception, ExceptionId};
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;

thread_local! {
    static PROPAGATING: Cell<Option<ExceptionId>> = const { Cell::new(None) };
}

/// Source of the exception currently propagating, if any.
pub trait AmbientException: Send + Sync + fmt::Debug {
    /// Identity of the exception currently propagating.
    fn current(&self) -> Option<ExceptionId>;
}

/// Tracks the propagating exception per thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadLocalAmbient;

impl ThreadLocalAmbient {
    /// Mark `exception` as propagating on this thread until the guard drops.
    /// Guards nest; dropping one restores the previous value.
    pub fn propagate(exception: &Exception) -> PropagationGuard {
        let previous = PROPAGATING.with(|slot| slot.replace(Some(exception.id())));
        PropagationGuard {
            previous,
            _not_send: PhantomData,
        }
    }
}

impl AmbientException for ThreadLocalAmbient {
    fn current(&self) -> Option<ExceptionId> {
        PROPAGATING.with(Cell::get)
    }
}

/// Keeps an exception marked as propagating on the current thread.
#[must_use = "the exception stops propagating as soon as the guard is dropped"]
#[derive(Debug)]
pub struct PropagationGuard {
    previous: Option<ExceptionId>,
    // the slot is thread local, so the guard must be dropped where it was made
    _not_send: PhantomData<*const ()>,
}

impl Drop for PropagationGuard {
    fn drop(&mut self) {
        let previous = self.previous;
        PROPAGATING.with(|slot| slot.set(previous));
    }
}
