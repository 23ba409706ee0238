//! Asynchronous duplex pipes
//!
//! A [`DuplexPipe`] wraps a connected pair of OS handles as independently
//! closable read/write endpoints. Each endpoint half ([`PipeReader`],
//! [`PipeWriter`]) is a separate owned value, which enforces the
//! one-pending-operation-per-direction rule at compile time while letting
//! opposite directions be driven concurrently.
//!
//! Two platform families back the same interface: non-blocking descriptors
//! plus readiness retries on POSIX, and overlapped named pipes plus
//! completion events on Windows. Both normalize a closed peer to a
//! successful zero-byte read, and both hide partial transfers behind
//! [`PipeWriter::write_all`].

use std::sync::Arc;

use sluice_core::{Error, OsHandle, Reactor, Result};

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as platform;

#[cfg(windows)]
mod win;
#[cfg(windows)]
use win as platform;

pub use platform::{OwnedEnd, PipeReader, PipeWriter};

/// Creation knobs for a pipe.
#[derive(Debug, Clone)]
pub struct PipeOptions {
    /// Register the async endpoints with the reactor. Disabled when a
    /// handle is created only to be handed to another owner.
    pub register: bool,
    /// Favor low-latency small-buffer behavior over throughput.
    pub interactive: bool,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self {
            register: true,
            interactive: false,
        }
    }
}

/// A connected pair of endpoints: data written to the write end comes back
/// out of the read end. Either side may be closed independently.
pub struct DuplexPipe {
    reader: Option<PipeReader>,
    writer: Option<PipeWriter>,
}

impl DuplexPipe {
    /// Allocate a connected pipe and register both endpoints.
    pub fn create(reactor: &Arc<dyn Reactor>) -> Result<Self> {
        Self::create_with(reactor, &PipeOptions::default())
    }

    /// Allocate a connected pipe with explicit options.
    pub fn create_with(reactor: &Arc<dyn Reactor>, options: &PipeOptions) -> Result<Self> {
        let (read_end, write_end) = platform::connected_pair(options)?;
        let reader = PipeReader::adopt(read_end, reactor.clone(), options.register)?;
        let writer = PipeWriter::adopt(write_end, reactor.clone(), options.register)?;
        tracing::debug!(
            read = ?reader.handle(),
            write = ?writer.handle(),
            "duplex pipe created"
        );
        Ok(Self {
            reader: Some(reader),
            writer: Some(writer),
        })
    }

    /// Adopt externally obtained handles (e.g. inherited from a spawned
    /// child) into the async model. Blocking mode is normalized and each
    /// present handle registers with the reactor exactly once.
    pub fn wrap(
        reactor: &Arc<dyn Reactor>,
        read_end: Option<OwnedEnd>,
        write_end: Option<OwnedEnd>,
    ) -> Result<Self> {
        let reader = read_end
            .map(|end| PipeReader::adopt(end, reactor.clone(), true))
            .transpose()?;
        let writer = write_end
            .map(|end| PipeWriter::adopt(end, reactor.clone(), true))
            .transpose()?;
        Ok(Self { reader, writer })
    }

    /// Read at most `buf.len()` bytes. Returns `0` once the peer's write
    /// end has closed; this is a successful end-of-stream, not an error.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.reader.as_mut() {
            Some(reader) => reader.read(buf).await,
            None => Err(Error::Closed),
        }
    }

    /// Write all of `buf`, transparently retrying partial transfers. The
    /// caller never observes a partial write.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.write_all(buf).await,
            None => Err(Error::Closed),
        }
    }

    /// Close the read endpoint. With `unregister` false the reactor entry
    /// is left in place, for handles whose ownership moved elsewhere.
    pub fn close_read(&mut self, unregister: bool) -> Result<()> {
        match self.reader.as_mut() {
            Some(reader) => reader.close(unregister),
            None => Ok(()),
        }
    }

    /// Close the write endpoint.
    pub fn close_write(&mut self, unregister: bool) -> Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.close(unregister),
            None => Ok(()),
        }
    }

    /// Close both endpoints. Idempotent.
    pub fn close(&mut self, unregister: bool) -> Result<()> {
        self.close_read(unregister)?;
        self.close_write(unregister)
    }

    /// Raw handle of the read endpoint, if still open. Non-owning.
    pub fn read_handle(&self) -> Option<OsHandle> {
        self.reader.as_ref().and_then(|r| r.handle())
    }

    /// Raw handle of the write endpoint, if still open. Non-owning.
    pub fn write_handle(&self) -> Option<OsHandle> {
        self.writer.as_ref().and_then(|w| w.handle())
    }

    /// Split into independently owned halves so opposite directions can be
    /// driven from different tasks.
    pub fn into_split(self) -> (Option<PipeReader>, Option<PipeWriter>) {
        (self.reader, self.writer)
    }
}

/// Create a pipe for reading from a child: the async read half stays with
/// the parent, the returned blocking end is handed to process creation.
pub fn parent_read_pair(
    reactor: &Arc<dyn Reactor>,
    options: &PipeOptions,
) -> Result<(PipeReader, OwnedEnd)> {
    let (parent_end, child_end) = platform::stdio_pair(true, options)?;
    let reader = PipeReader::adopt(parent_end, reactor.clone(), options.register)?;
    Ok((reader, child_end))
}

/// Create a pipe for writing to a child: the async write half stays with
/// the parent, the returned blocking end is handed to process creation.
pub fn parent_write_pair(
    reactor: &Arc<dyn Reactor>,
    options: &PipeOptions,
) -> Result<(PipeWriter, OwnedEnd)> {
    let (parent_end, child_end) = platform::stdio_pair(false, options)?;
    let writer = PipeWriter::adopt(parent_end, reactor.clone(), options.register)?;
    Ok((writer, child_end))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use sluice_core::testing::RecordingReactor;

    fn recording() -> (Arc<RecordingReactor>, Arc<dyn Reactor>) {
        let recorder = Arc::new(RecordingReactor::new());
        let reactor: Arc<dyn Reactor> = recorder.clone();
        (recorder, reactor)
    }

    #[test]
    fn create_registers_both_endpoints() {
        let (recorder, reactor) = recording();
        let pipe = DuplexPipe::create(&reactor).unwrap();

        let read = pipe.read_handle().unwrap();
        let write = pipe.write_handle().unwrap();
        assert_eq!(recorder.registered(), vec![read, write]);
    }

    #[test]
    fn suppressed_registration_skips_the_reactor() {
        let (recorder, reactor) = recording();
        let options = PipeOptions {
            register: false,
            ..PipeOptions::default()
        };
        let mut pipe = DuplexPipe::create_with(&reactor, &options).unwrap();
        assert!(recorder.registered().is_empty());

        pipe.close(true).unwrap();
        // Never registered, so nothing to unregister either.
        assert!(recorder.unregistered().is_empty());
    }

    #[test]
    fn close_is_idempotent_and_unregisters_once() {
        let (recorder, reactor) = recording();
        let mut pipe = DuplexPipe::create(&reactor).unwrap();
        let read = pipe.read_handle().unwrap();
        let write = pipe.write_handle().unwrap();

        pipe.close(true).unwrap();
        pipe.close(true).unwrap();
        assert_eq!(recorder.unregistered(), vec![read, write]);
        assert!(pipe.read_handle().is_none());
        assert!(pipe.write_handle().is_none());
    }

    #[test]
    fn close_without_unregister_keeps_reactor_entry() {
        let (recorder, reactor) = recording();
        let mut pipe = DuplexPipe::create(&reactor).unwrap();
        pipe.close_write(false).unwrap();
        assert!(recorder.unregistered().is_empty());
    }

    #[tokio::test]
    async fn read_after_close_reports_closed() {
        let (_, reactor) = recording();
        let mut pipe = DuplexPipe::create(&reactor).unwrap();
        pipe.close_read(true).unwrap();

        let mut buf = [0u8; 4];
        let err = pipe.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, Error::Closed));
    }

    #[test]
    fn stdio_pair_returns_blocking_child_end() {
        use std::os::fd::AsRawFd;

        let (_, reactor) = recording();
        let (parent, child) = parent_read_pair(&reactor, &PipeOptions::default()).unwrap();

        // Parent end is non-blocking for the readiness model, the child
        // end keeps blocking semantics for ordinary stdio use.
        let parent_flags =
            unsafe { libc::fcntl(parent.handle().unwrap(), libc::F_GETFL) };
        let child_flags = unsafe { libc::fcntl(child.as_raw_fd(), libc::F_GETFL) };
        assert_ne!(parent_flags & libc::O_NONBLOCK, 0);
        assert_eq!(child_flags & libc::O_NONBLOCK, 0);
    }
}
