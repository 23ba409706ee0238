//! POSIX backing objects: a `shm_open` segment for the slot and a named
//! FIFO for transition signals.
//!
//! Each endpoint opens its own FIFO descriptor (read+write, non-blocking),
//! so reactor bookkeeping stays per-endpoint and opening never blocks on a
//! missing peer. A transition writes one byte; waiters watch the FIFO for
//! readability and drain it before re-arming so stale bytes cannot satisfy
//! a later wait.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use memmap2::{MmapOptions, MmapRaw};
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;

use sluice_core::{Error, Reactor, Result};

pub(crate) struct Shared {
    map: MmapRaw,
    // Keeps the shm descriptor alive for the mapping's lifetime.
    _segment: File,
    fifo: OwnedFd,
}

impl Shared {
    /// Create the named segment and its signal FIFO. Exclusive: an
    /// existing name is a creation error, and a failure partway through
    /// leaves no object behind.
    pub(crate) fn create(name: &str, total: usize) -> Result<Self> {
        let shm_name = shm_path(name);
        let fd = shm_open(
            shm_name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| Error::creation("mailbox segment", errno_io(e)))?;

        let built = (|| -> Result<Self> {
            nix::unistd::ftruncate(&fd, total as i64)
                .map_err(|e| Error::creation("mailbox segment", errno_io(e)))?;
            let segment = File::from(fd);
            let map = MmapOptions::new()
                .len(total)
                .map_raw(&segment)
                .map_err(|e| Error::creation("mailbox mapping", e))?;

            let path = fifo_path(name);
            // A FIFO left behind by a crashed owner would break the
            // exclusive create; the shm object is the authoritative name.
            let _ = std::fs::remove_file(&path);
            nix::unistd::mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR)
                .map_err(|e| Error::creation("mailbox signal fifo", errno_io(e)))?;
            let fifo = open_fifo(&path)?;

            Ok(Self {
                map,
                _segment: segment,
                fifo,
            })
        })();

        if built.is_err() {
            let _ = shm_unlink(shm_name.as_str());
            let _ = std::fs::remove_file(fifo_path(name));
        }
        built
    }

    /// Attach to an existing segment; the mapping length comes from the
    /// segment itself.
    pub(crate) fn open(name: &str) -> Result<Self> {
        let shm_name = shm_path(name);
        let fd = shm_open(shm_name.as_str(), OFlag::O_RDWR, Mode::empty())
            .map_err(|e| Error::creation("mailbox segment", errno_io(e)))?;
        let total = nix::sys::stat::fstat(&fd)
            .map_err(|e| Error::creation("mailbox segment", errno_io(e)))?
            .st_size as usize;
        let segment = File::from(fd);
        let map = MmapOptions::new()
            .len(total)
            .map_raw(&segment)
            .map_err(|e| Error::creation("mailbox mapping", e))?;
        let fifo = open_fifo(&fifo_path(name))?;
        Ok(Self {
            map,
            _segment: segment,
            fifo,
        })
    }

    /// Remove the segment and FIFO names. Existing attachments keep their
    /// mappings and descriptors.
    pub(crate) fn unlink(name: &str) -> Result<()> {
        shm_unlink(shm_path(name).as_str())
            .map_err(|e| Error::creation("mailbox unlink", errno_io(e)))?;
        let _ = std::fs::remove_file(fifo_path(name));
        Ok(())
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    pub(crate) fn register(&self, reactor: &dyn Reactor) -> Result<()> {
        reactor.register(self.fifo.as_raw_fd())
    }

    pub(crate) fn unregister(&self, reactor: &dyn Reactor) -> Result<()> {
        reactor.unregister(self.fifo.as_raw_fd())
    }

    /// Announce a state transition: one byte into the FIFO. A full FIFO
    /// already guarantees a pending wake, so would-block is success.
    pub(crate) fn notify(&self) -> Result<()> {
        let n = unsafe { libc::write(self.fifo.as_raw_fd(), [1u8].as_ptr().cast(), 1) };
        if n >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(()),
            _ => Err(Error::Transfer(err)),
        }
    }

    /// Consume accumulated signal bytes.
    pub(crate) fn drain(&self) {
        let mut sink = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(self.fifo.as_raw_fd(), sink.as_mut_ptr().cast(), sink.len())
            };
            if n <= 0 {
                return;
            }
        }
    }

    pub(crate) fn watch(&self, reactor: &dyn Reactor, waker: &std::task::Waker) {
        reactor.watch_readable(self.fifo.as_raw_fd(), waker);
    }
}

/// shm object names live in a flat per-system namespace rooted at `/`.
fn shm_path(name: &str) -> String {
    format!("/{name}")
}

fn fifo_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{name}.signal"))
}

/// Read+write keeps the descriptor usable by either role and means the
/// open itself never blocks waiting for a peer.
fn open_fifo(path: &std::path::Path) -> Result<OwnedFd> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .map_err(|e| Error::creation("mailbox signal fifo", e))?;
    Ok(OwnedFd::from(file))
}

fn errno_io(errno: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}
