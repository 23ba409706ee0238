//! Test doubles for the reactor contract.

use std::sync::Mutex;
use std::task::Waker;

use crate::error::Result;
use crate::handle::OsHandle;
use crate::reactor::Reactor;

/// A reactor that records registrations instead of dispatching events.
///
/// Used by unit tests to assert handle-lifetime bookkeeping: every adopted
/// handle registers exactly once, hand-offs skip deregistration, and so
/// on. Parked wakers are woken immediately so synchronous-completion code
/// paths can still be driven without an event loop.
#[derive(Default)]
pub struct RecordingReactor {
    state: Mutex<RecordingState>,
}

#[derive(Default)]
struct RecordingState {
    registered: Vec<OsHandle>,
    unregistered: Vec<OsHandle>,
    watches: usize,
}

impl RecordingReactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles registered so far, in order.
    pub fn registered(&self) -> Vec<OsHandle> {
        self.state.lock().unwrap().registered.clone()
    }

    /// Handles unregistered so far, in order.
    pub fn unregistered(&self) -> Vec<OsHandle> {
        self.state.lock().unwrap().unregistered.clone()
    }

    /// Number of times any watch method was armed.
    pub fn watch_count(&self) -> usize {
        self.state.lock().unwrap().watches
    }

    fn watched(&self, waker: &Waker) {
        self.state.lock().unwrap().watches += 1;
        waker.wake_by_ref();
    }
}

impl Reactor for RecordingReactor {
    fn register(&self, handle: OsHandle) -> Result<()> {
        self.state.lock().unwrap().registered.push(handle);
        Ok(())
    }

    fn unregister(&self, handle: OsHandle) -> Result<()> {
        self.state.lock().unwrap().unregistered.push(handle);
        Ok(())
    }

    #[cfg(unix)]
    fn watch_readable(&self, _handle: OsHandle, waker: &Waker) {
        self.watched(waker);
    }

    #[cfg(unix)]
    fn watch_writable(&self, _handle: OsHandle, waker: &Waker) {
        self.watched(waker);
    }

    #[cfg(windows)]
    fn watch_signal(&self, _event: OsHandle, waker: &Waker) {
        self.watched(waker);
    }
}
