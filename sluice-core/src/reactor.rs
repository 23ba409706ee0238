//! The readiness/completion dispatch contract endpoints register with.
//!
//! The reactor itself is an external collaborator: pipes, mailboxes, and
//! process stdio only consume this interface, passed explicitly into every
//! constructor. Two implementations ship with the crate so the library is
//! usable out of the box: [`PollReactor`] for readiness-style platforms and
//! `WaitReactor` for completion-style platforms.

use std::task::Waker;

use crate::error::Result;
use crate::handle::OsHandle;

/// Dispatch contract between endpoints and the event loop.
///
/// On readiness platforms an endpoint attempts its syscall, and on
/// "would block" parks a waker via [`Reactor::watch_readable`] or
/// [`Reactor::watch_writable`]; the reactor wakes it when the OS reports
/// the handle ready and the endpoint retries the syscall. On completion
/// platforms the endpoint submits an overlapped operation up front and
/// parks a waker on the operation's event object via `watch_signal`; once
/// woken it harvests the completion record (transferred bytes and status)
/// itself.
pub trait Reactor: Send + Sync {
    /// Start tracking a handle. Called exactly once per adopted handle.
    fn register(&self, handle: OsHandle) -> Result<()>;

    /// Stop tracking a handle. Tolerates handles that were never
    /// registered, so ownership hand-offs do not need bookkeeping.
    fn unregister(&self, handle: OsHandle) -> Result<()>;

    /// Wake `waker` once `handle` can be read without blocking.
    ///
    /// Interest is one-shot: it is consumed by the wake and must be
    /// re-armed if the retried operation still cannot complete.
    #[cfg(unix)]
    fn watch_readable(&self, handle: OsHandle, waker: &Waker);

    /// Wake `waker` once `handle` can be written without blocking.
    #[cfg(unix)]
    fn watch_writable(&self, handle: OsHandle, waker: &Waker);

    /// Wake `waker` once the event object backing a pending overlapped
    /// operation signals. One-shot, like the readiness variants.
    #[cfg(windows)]
    fn watch_signal(&self, event: OsHandle, waker: &Waker);
}

#[cfg(unix)]
pub use unix::PollReactor;
#[cfg(windows)]
pub use windows_impl::WaitReactor;

#[cfg(unix)]
mod unix {
    use std::collections::HashMap;
    use std::io;
    use std::sync::{Arc, Mutex};
    use std::task::Waker;

    use mio::unix::SourceFd;
    use mio::{Events, Interest, Poll, Registry, Token};

    use crate::error::{Error, Result};
    use crate::handle::OsHandle;

    use super::Reactor;

    #[derive(Clone, Copy, PartialEq, Eq, Hash)]
    enum Direction {
        Read,
        Write,
    }

    #[derive(Default)]
    struct WakerTable {
        wakers: Mutex<HashMap<(OsHandle, Direction), Waker>>,
    }

    /// Readiness reactor backed by `mio::Poll` and a dispatch thread.
    ///
    /// Registrations are edge-triggered: a wake is delivered when a handle
    /// transitions to ready. Endpoint futures therefore re-attempt their
    /// syscall once after arming interest, so a transition that lands in
    /// the arming window is not lost.
    pub struct PollReactor {
        registry: Registry,
        table: Arc<WakerTable>,
    }

    impl PollReactor {
        /// Create the reactor and start its dispatch thread.
        pub fn new() -> Result<Arc<Self>> {
            let poll = Poll::new().map_err(|e| Error::creation("reactor", e))?;
            let registry = poll
                .registry()
                .try_clone()
                .map_err(|e| Error::creation("reactor", e))?;
            let table = Arc::new(WakerTable::default());

            let loop_table = table.clone();
            std::thread::Builder::new()
                .name("sluice-reactor".into())
                .spawn(move || dispatch_loop(poll, loop_table))
                .map_err(|e| Error::creation("reactor dispatch thread", e))?;

            Ok(Arc::new(Self { registry, table }))
        }

        fn park(&self, handle: OsHandle, direction: Direction, waker: &Waker) {
            let mut wakers = self.table.wakers.lock().expect("waker table poisoned");
            wakers.insert((handle, direction), waker.clone());
        }
    }

    impl Reactor for PollReactor {
        fn register(&self, handle: OsHandle) -> Result<()> {
            self.registry
                .register(
                    &mut SourceFd(&handle),
                    Token(handle as usize),
                    Interest::READABLE | Interest::WRITABLE,
                )
                .map_err(|e| Error::creation("reactor registration", e))
        }

        fn unregister(&self, handle: OsHandle) -> Result<()> {
            {
                let mut wakers = self.table.wakers.lock().expect("waker table poisoned");
                wakers.remove(&(handle, Direction::Read));
                wakers.remove(&(handle, Direction::Write));
            }
            match self.registry.deregister(&mut SourceFd(&handle)) {
                Ok(()) => Ok(()),
                // Never registered, or the kernel already dropped the entry
                // when the descriptor closed.
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(Error::creation("reactor deregistration", e)),
            }
        }

        fn watch_readable(&self, handle: OsHandle, waker: &Waker) {
            self.park(handle, Direction::Read, waker);
        }

        fn watch_writable(&self, handle: OsHandle, waker: &Waker) {
            self.park(handle, Direction::Write, waker);
        }
    }

    fn dispatch_loop(mut poll: Poll, table: Arc<WakerTable>) {
        let mut events = Events::with_capacity(256);
        loop {
            if let Err(e) = poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::warn!("reactor poll failed, dispatch thread exiting: {e}");
                return;
            }

            for event in events.iter() {
                let handle = event.token().0 as OsHandle;
                let mut wakers = table.wakers.lock().expect("waker table poisoned");
                // A closed peer surfaces as a read/write-closed event; the
                // parked operation is woken so it can observe EOF or the
                // broken pipe on retry.
                if event.is_readable() || event.is_read_closed() {
                    if let Some(waker) = wakers.remove(&(handle, Direction::Read)) {
                        waker.wake();
                    }
                }
                if event.is_writable() || event.is_write_closed() {
                    if let Some(waker) = wakers.remove(&(handle, Direction::Write)) {
                        waker.wake();
                    }
                }
            }
        }
    }
}

#[cfg(windows)]
mod windows_impl {
    use std::sync::{Arc, Mutex};
    use std::task::Waker;

    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0};
    use windows::Win32::System::Threading::{
        CreateEventW, SetEvent, WaitForMultipleObjects, INFINITE,
    };

    use crate::error::{Error, Result};
    use crate::handle::OsHandle;

    use super::Reactor;

    #[derive(Default)]
    struct WaitTable {
        entries: Vec<(OsHandle, Waker)>,
    }

    /// Completion reactor: a dispatch thread blocked in
    /// `WaitForMultipleObjects` over the event objects of pending
    /// overlapped operations. An internal control event forces a re-scan
    /// whenever the watched set changes.
    ///
    /// The wait set is limited to `MAXIMUM_WAIT_OBJECTS - 1` concurrently
    /// pending operations, which is ample for the single-threaded
    /// cooperative model this crate targets.
    pub struct WaitReactor {
        control: HANDLE,
        table: Arc<Mutex<WaitTable>>,
    }

    // HANDLE values are shared kernel object identifiers; the dispatch
    // thread and callers only pass them to wait/signal calls.
    unsafe impl Send for WaitReactor {}
    unsafe impl Sync for WaitReactor {}

    impl WaitReactor {
        /// Create the reactor and start its dispatch thread.
        pub fn new() -> Result<Arc<Self>> {
            let control = unsafe { CreateEventW(None, false, false, PCWSTR::null()) }
                .map_err(|e| Error::creation("reactor control event", e.into()))?;
            let table = Arc::new(Mutex::new(WaitTable::default()));

            let loop_table = table.clone();
            let loop_control = control;
            std::thread::Builder::new()
                .name("sluice-reactor".into())
                .spawn(move || dispatch_loop(loop_control, loop_table))
                .map_err(|e| Error::creation("reactor dispatch thread", e))?;

            Ok(Arc::new(Self { control, table }))
        }
    }

    impl Drop for WaitReactor {
        fn drop(&mut self) {
            unsafe {
                let _ = CloseHandle(self.control);
            }
        }
    }

    impl Reactor for WaitReactor {
        fn register(&self, _handle: OsHandle) -> Result<()> {
            // Completion delivery is armed per pending operation via
            // `watch_signal`; there is no per-handle kernel registration.
            Ok(())
        }

        fn unregister(&self, handle: OsHandle) -> Result<()> {
            let mut table = self.table.lock().expect("wait table poisoned");
            table.entries.retain(|(h, _)| *h != handle);
            Ok(())
        }

        fn watch_signal(&self, event: OsHandle, waker: &Waker) {
            {
                let mut table = self.table.lock().expect("wait table poisoned");
                table.entries.retain(|(h, _)| *h != event);
                table.entries.push((event, waker.clone()));
            }
            unsafe {
                let _ = SetEvent(self.control);
            }
        }
    }

    fn dispatch_loop(control: HANDLE, table: Arc<Mutex<WaitTable>>) {
        loop {
            let mut handles: Vec<HANDLE> = vec![control];
            {
                let table = table.lock().expect("wait table poisoned");
                handles.extend(table.entries.iter().map(|(h, _)| HANDLE(*h as *mut _)));
            }

            let status = unsafe { WaitForMultipleObjects(&handles, false, INFINITE) };
            let index = status.0.wrapping_sub(WAIT_OBJECT_0.0) as usize;
            if index >= handles.len() {
                // Abandoned wait or failure (e.g. an event closed out from
                // under us). Back off briefly so a persistent failure does
                // not spin, then rebuild the set.
                std::thread::sleep(std::time::Duration::from_millis(1));
                continue;
            }
            if index == 0 {
                // Control event: the watched set changed, rebuild it.
                continue;
            }

            let signaled = handles[index].0 as OsHandle;
            let waker = {
                let mut table = table.lock().expect("wait table poisoned");
                let position = table.entries.iter().position(|(h, _)| *h == signaled);
                position.map(|i| table.entries.remove(i).1)
            };
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn register_and_unregister_pipe_ends() {
        let reactor = PollReactor::new().unwrap();
        let (r, w) = nix::unistd::pipe2(nix::fcntl::OFlag::O_NONBLOCK).unwrap();

        reactor.register(r.as_raw_fd()).unwrap();
        reactor.register(w.as_raw_fd()).unwrap();
        reactor.unregister(r.as_raw_fd()).unwrap();
        reactor.unregister(w.as_raw_fd()).unwrap();
    }

    #[test]
    fn unregister_tolerates_unknown_handles() {
        let reactor = PollReactor::new().unwrap();
        let (r, _w) = nix::unistd::pipe2(nix::fcntl::OFlag::O_NONBLOCK).unwrap();
        // Never registered: must not error.
        reactor.unregister(r.as_raw_fd()).unwrap();
    }
}
