//! POSIX endpoints: non-blocking descriptors driven by readiness retries.

use std::future::Future;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use nix::fcntl::OFlag;
use sluice_core::{Error, OsHandle, Reactor, Result};

use crate::PipeOptions;

/// Raw endpoint type handed to [`crate::DuplexPipe::wrap`] or to process
/// creation.
pub type OwnedEnd = OwnedFd;

/// Allocate a connected pipe pair as `(read_end, write_end)`.
pub(crate) fn connected_pair(options: &PipeOptions) -> Result<(OwnedFd, OwnedFd)> {
    let (read_end, write_end) =
        nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::creation("pipe", errno_io(e)))?;
    if options.interactive {
        shrink_kernel_buffer(&write_end);
    }
    Ok((read_end, write_end))
}

/// Allocate a stdio pipe: `(parent_end, child_end)`. The parent end goes
/// async; the child end keeps blocking semantics for the spawned process.
pub(crate) fn stdio_pair(
    parent_reads: bool,
    options: &PipeOptions,
) -> Result<(OwnedFd, OwnedFd)> {
    let (read_end, write_end) = connected_pair(options)?;
    if parent_reads {
        Ok((read_end, write_end))
    } else {
        Ok((write_end, read_end))
    }
}

/// Best-effort latency hint; an ignored failure just keeps the default
/// buffer size.
#[cfg(target_os = "linux")]
fn shrink_kernel_buffer(fd: &OwnedFd) {
    unsafe {
        libc::fcntl(fd.as_raw_fd(), libc::F_SETPIPE_SZ, 4096);
    }
}

#[cfg(not(target_os = "linux"))]
fn shrink_kernel_buffer(_fd: &OwnedFd) {}

fn errno_io(errno: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

fn set_nonblocking(fd: OsHandle) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn read_fd(fd: OsHandle, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn write_fd(fd: OsHandle, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// The read half of a pipe. At most one read may be pending at a time,
/// which owning `&mut self` makes a compile-time guarantee.
pub struct PipeReader {
    fd: Option<OwnedFd>,
    reactor: Arc<dyn Reactor>,
    registered: bool,
}

impl PipeReader {
    pub(crate) fn adopt(fd: OwnedFd, reactor: Arc<dyn Reactor>, register: bool) -> Result<Self> {
        set_nonblocking(fd.as_raw_fd()).map_err(|e| Error::creation("pipe endpoint", e))?;
        if register {
            reactor.register(fd.as_raw_fd())?;
        }
        Ok(Self {
            fd: Some(fd),
            reactor,
            registered: register,
        })
    }

    /// Read at most `buf.len()` bytes; `0` signals end-of-stream.
    ///
    /// The buffer is only touched inside `poll`, so dropping the returned
    /// future before completion is safe.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let fd = match self.fd.as_ref() {
            Some(fd) => fd.as_raw_fd(),
            None => return Err(Error::Closed),
        };
        ReadFuture {
            fd,
            reactor: self.reactor.as_ref(),
            buf,
        }
        .await
    }

    /// Raw descriptor, if still open. Non-owning.
    pub fn handle(&self) -> Option<OsHandle> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Close the endpoint, optionally leaving the reactor registration in
    /// place for a handle whose ownership moved elsewhere. Idempotent.
    pub fn close(&mut self, unregister: bool) -> Result<()> {
        close_end(&mut self.fd, &self.reactor, &mut self.registered, unregister)
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let _ = self.close(true);
    }
}

/// The write half of a pipe. Writes complete only once every byte has been
/// transferred.
pub struct PipeWriter {
    fd: Option<OwnedFd>,
    reactor: Arc<dyn Reactor>,
    registered: bool,
}

impl PipeWriter {
    pub(crate) fn adopt(fd: OwnedFd, reactor: Arc<dyn Reactor>, register: bool) -> Result<Self> {
        set_nonblocking(fd.as_raw_fd()).map_err(|e| Error::creation("pipe endpoint", e))?;
        if register {
            reactor.register(fd.as_raw_fd())?;
        }
        Ok(Self {
            fd: Some(fd),
            reactor,
            registered: register,
        })
    }

    /// Write all of `buf`, retrying partial transfers transparently.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let fd = match self.fd.as_ref() {
            Some(fd) => fd.as_raw_fd(),
            None => return Err(Error::Closed),
        };
        WriteAllFuture {
            fd,
            reactor: self.reactor.as_ref(),
            buf,
            written: 0,
        }
        .await
    }

    /// Raw descriptor, if still open. Non-owning.
    pub fn handle(&self) -> Option<OsHandle> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Close the endpoint. Idempotent; see [`PipeReader::close`].
    pub fn close(&mut self, unregister: bool) -> Result<()> {
        close_end(&mut self.fd, &self.reactor, &mut self.registered, unregister)
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let _ = self.close(true);
    }
}

fn close_end(
    fd: &mut Option<OwnedFd>,
    reactor: &Arc<dyn Reactor>,
    registered: &mut bool,
    unregister: bool,
) -> Result<()> {
    if let Some(fd) = fd.take() {
        if unregister && *registered {
            reactor.unregister(fd.as_raw_fd())?;
            *registered = false;
        }
    }
    Ok(())
}

struct ReadFuture<'a> {
    fd: OsHandle,
    reactor: &'a dyn Reactor,
    buf: &'a mut [u8],
}

impl Future for ReadFuture<'_> {
    type Output = Result<usize>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut armed = false;
        loop {
            match read_fd(this.fd, this.buf) {
                // A zero-length success is the peer's write end closing:
                // the normalized end-of-stream outcome.
                Ok(n) => return Poll::Ready(Ok(n)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if armed {
                        return Poll::Pending;
                    }
                    this.reactor.watch_readable(this.fd, cx.waker());
                    // Interest is edge-triggered; retry once in case the
                    // transition landed before the waker was parked.
                    armed = true;
                }
                Err(e) => return Poll::Ready(Err(Error::Transfer(e))),
            }
        }
    }
}

struct WriteAllFuture<'a> {
    fd: OsHandle,
    reactor: &'a dyn Reactor,
    buf: &'a [u8],
    written: usize,
}

impl Future for WriteAllFuture<'_> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut armed = false;
        loop {
            if this.written == this.buf.len() {
                return Poll::Ready(Ok(()));
            }
            match write_fd(this.fd, &this.buf[this.written..]) {
                Ok(n) => {
                    this.written += n;
                    armed = false;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if armed {
                        return Poll::Pending;
                    }
                    this.reactor.watch_writable(this.fd, cx.waker());
                    armed = true;
                }
                Err(e) => return Poll::Ready(Err(Error::Transfer(e))),
            }
        }
    }
}
