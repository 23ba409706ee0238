//! Windows endpoints: overlapped named pipes with per-operation events.
//!
//! Every in-flight transfer is a [`PendingOp`] that owns its buffer, its
//! OVERLAPPED record, and the completion event for the operation's whole
//! life. The record lives in the endpoint, not the future, so dropping a
//! read or write future cannot free memory the kernel still writes to;
//! the record is released exactly once, on completion or after a
//! cancel-and-drain when the endpoint closes.

use std::future::poll_fn;
use std::io;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use windows::core::PCWSTR;
use windows::Win32::Foundation::{
    ERROR_ACCESS_DENIED, ERROR_BROKEN_PIPE, ERROR_HANDLE_EOF, ERROR_IO_INCOMPLETE,
    ERROR_IO_PENDING, ERROR_PIPE_BUSY, GENERIC_READ, GENERIC_WRITE, HANDLE,
};
use windows::Win32::Security::SECURITY_ATTRIBUTES;
use windows::Win32::Storage::FileSystem::{
    CreateFileW, ReadFile, WriteFile, FILE_ATTRIBUTE_NORMAL, FILE_FLAG_FIRST_PIPE_INSTANCE,
    FILE_FLAG_OVERLAPPED, FILE_SHARE_NONE, OPEN_EXISTING,
};
use windows::Win32::System::Pipes::{
    CreateNamedPipeW, PIPE_ACCESS_INBOUND, PIPE_ACCESS_OUTBOUND, PIPE_READMODE_BYTE,
    PIPE_TYPE_BYTE, PIPE_WAIT,
};
use windows::Win32::System::Threading::{CreateEventW, GetCurrentProcessId};
use windows::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};

use sluice_core::{Error, OsHandle, Reactor, Result};

use crate::PipeOptions;

/// Raw endpoint type handed to [`crate::DuplexPipe::wrap`] or to process
/// creation.
pub type OwnedEnd = OwnedHandle;

static PIPE_SEQUENCE: AtomicU32 = AtomicU32::new(0);

fn to_io(err: windows::core::Error) -> io::Error {
    io::Error::from_raw_os_error((err.code().0 & 0xFFFF) as i32)
}

fn win32_code(err: &windows::core::Error) -> u32 {
    (err.code().0 & 0xFFFF) as u32
}

fn is_eof_code(code: u32) -> bool {
    code == ERROR_BROKEN_PIPE.0 || code == ERROR_HANDLE_EOF.0
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn raw(handle: &OwnedHandle) -> HANDLE {
    HANDLE(handle.as_raw_handle())
}

/// One in-flight overlapped transfer.
struct PendingOp {
    // Boxed so the kernel-visible record never moves while the operation
    // is outstanding.
    overlapped: Box<OVERLAPPED>,
    event: OwnedHandle,
    buf: Box<[u8]>,
    /// Bytes of `buf` already transferred (writes only).
    done: usize,
}

impl PendingOp {
    fn new(buf: Box<[u8]>) -> Result<Self> {
        let event = unsafe { CreateEventW(None, true, false, PCWSTR::null()) }
            .map_err(|e| Error::creation("pipe completion event", to_io(e)))?;
        let event = unsafe { OwnedHandle::from_raw_handle(event.0) };
        let mut overlapped = Box::new(OVERLAPPED::default());
        overlapped.hEvent = raw(&event);
        Ok(Self {
            overlapped,
            event,
            buf,
            done: 0,
        })
    }

    fn rearm(&mut self) {
        let event = raw(&self.event);
        *self.overlapped = OVERLAPPED::default();
        self.overlapped.hEvent = event;
    }

    fn event_handle(&self) -> OsHandle {
        self.event.as_raw_handle() as OsHandle
    }
}

/// Cancel an outstanding operation and wait for the kernel to let go of
/// the buffer before the record is freed.
fn cancel_pending(handle: HANDLE, op: &mut PendingOp) {
    unsafe {
        let _ = CancelIoEx(handle, Some(op.overlapped.as_ref() as *const _));
        let mut transferred = 0u32;
        let _ = GetOverlappedResult(
            handle,
            op.overlapped.as_ref() as *const _,
            &mut transferred,
            true,
        );
    }
}

/// Allocate a connected pipe pair as `(read_end, write_end)`: a uniquely
/// named overlapped byte-mode pipe with an immediate local connect,
/// retried when the name loses a creation race.
pub(crate) fn connected_pair(options: &PipeOptions) -> Result<(OwnedHandle, OwnedHandle)> {
    create_pipe(true, options, true)
}

/// Allocate a stdio pipe as `(parent_end, child_end)`. The parent end is
/// overlapped; the child end is a plain synchronous, inheritable handle.
pub(crate) fn stdio_pair(
    parent_reads: bool,
    options: &PipeOptions,
) -> Result<(OwnedHandle, OwnedHandle)> {
    create_pipe(parent_reads, options, false)
}

fn create_pipe(
    parent_reads: bool,
    options: &PipeOptions,
    peer_overlapped: bool,
) -> Result<(OwnedHandle, OwnedHandle)> {
    let buffer_size: u32 = if options.interactive { 4096 } else { 65536 };
    let (server_access, client_access) = if parent_reads {
        (PIPE_ACCESS_INBOUND, GENERIC_WRITE.0)
    } else {
        (PIPE_ACCESS_OUTBOUND, GENERIC_READ.0)
    };

    loop {
        let name = format!(
            r"\\.\pipe\sluice-{}-{}",
            unsafe { GetCurrentProcessId() },
            PIPE_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        );
        let name_w = wide(&name);

        let server = unsafe {
            CreateNamedPipeW(
                PCWSTR(name_w.as_ptr()),
                server_access | FILE_FLAG_OVERLAPPED | FILE_FLAG_FIRST_PIPE_INSTANCE,
                PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT,
                1,
                buffer_size,
                buffer_size,
                0,
                None,
            )
        };
        if server.is_invalid() {
            let err = windows::core::Error::from_win32();
            let code = win32_code(&err);
            // Lost the unique-name race; pick another name.
            if code == ERROR_ACCESS_DENIED.0 || code == ERROR_PIPE_BUSY.0 {
                continue;
            }
            return Err(Error::creation("pipe", to_io(err)));
        }
        let server = unsafe { OwnedHandle::from_raw_handle(server.0) };

        let mut flags = FILE_ATTRIBUTE_NORMAL;
        if peer_overlapped {
            flags |= FILE_FLAG_OVERLAPPED;
        }
        let inherit = SECURITY_ATTRIBUTES {
            nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
            lpSecurityDescriptor: std::ptr::null_mut(),
            bInheritHandle: (!peer_overlapped).into(),
        };
        let client = unsafe {
            CreateFileW(
                PCWSTR(name_w.as_ptr()),
                client_access,
                FILE_SHARE_NONE,
                Some(&inherit),
                OPEN_EXISTING,
                flags,
                None,
            )
        };
        let client = match client {
            Ok(handle) => unsafe { OwnedHandle::from_raw_handle(handle.0) },
            Err(err) if win32_code(&err) == ERROR_PIPE_BUSY.0 => continue,
            Err(err) => return Err(Error::creation("pipe", to_io(err))),
        };

        // The server end always stays with this process; the client end is
        // the peer (or inheritable child) handle.
        return Ok((server, client));
    }
}

/// The read half of a pipe.
pub struct PipeReader {
    handle: Option<OwnedHandle>,
    reactor: Arc<dyn Reactor>,
    registered: bool,
    pending: Option<PendingOp>,
}

impl PipeReader {
    /// Handles must have been created with `FILE_FLAG_OVERLAPPED`;
    /// overlapped mode cannot be switched on after creation.
    pub(crate) fn adopt(
        handle: OwnedHandle,
        reactor: Arc<dyn Reactor>,
        register: bool,
    ) -> Result<Self> {
        if register {
            reactor.register(handle.as_raw_handle() as OsHandle)?;
        }
        Ok(Self {
            handle: Some(handle),
            reactor,
            registered: register,
            pending: None,
        })
    }

    /// Read at most `buf.len()` bytes; `0` signals end-of-stream
    /// (`ERROR_BROKEN_PIPE` is normalized to that outcome).
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        poll_fn(|cx| self.poll_read(cx, buf)).await
    }

    fn poll_read(&mut self, cx: &mut Context<'_>, out: &mut [u8]) -> Poll<Result<usize>> {
        let handle = match self.handle.as_ref() {
            Some(h) => raw(h),
            None => return Poll::Ready(Err(Error::Closed)),
        };

        if self.pending.is_none() {
            if out.is_empty() {
                return Poll::Ready(Ok(0));
            }
            let mut op = match PendingOp::new(vec![0u8; out.len()].into_boxed_slice()) {
                Ok(op) => op,
                Err(e) => return Poll::Ready(Err(e)),
            };
            let started = unsafe {
                ReadFile(
                    handle,
                    Some(&mut op.buf),
                    None,
                    Some(op.overlapped.as_mut() as *mut _),
                )
            };
            match started {
                Ok(()) => self.pending = Some(op),
                Err(e) if win32_code(&e) == ERROR_IO_PENDING.0 => self.pending = Some(op),
                Err(e) if is_eof_code(win32_code(&e)) => return Poll::Ready(Ok(0)),
                Err(e) => return Poll::Ready(Err(Error::Transfer(to_io(e)))),
            }
        }

        if let Some(op) = self.pending.as_mut() {
            let mut transferred = 0u32;
            let done = unsafe {
                GetOverlappedResult(
                    handle,
                    op.overlapped.as_ref() as *const _,
                    &mut transferred,
                    false,
                )
            };
            match done {
                Ok(()) => {
                    let n = (transferred as usize).min(out.len());
                    out[..n].copy_from_slice(&op.buf[..n]);
                    self.pending = None;
                    Poll::Ready(Ok(n))
                }
                Err(e) if win32_code(&e) == ERROR_IO_INCOMPLETE.0 => {
                    self.reactor.watch_signal(op.event_handle(), cx.waker());
                    Poll::Pending
                }
                Err(e) if is_eof_code(win32_code(&e)) => {
                    self.pending = None;
                    Poll::Ready(Ok(0))
                }
                Err(e) => {
                    self.pending = None;
                    Poll::Ready(Err(Error::Transfer(to_io(e))))
                }
            }
        } else {
            Poll::Pending
        }
    }

    /// Raw handle, if still open. Non-owning.
    pub fn handle(&self) -> Option<OsHandle> {
        self.handle.as_ref().map(|h| h.as_raw_handle() as OsHandle)
    }

    /// Close the endpoint, cancelling any outstanding transfer first.
    /// Idempotent.
    pub fn close(&mut self, unregister: bool) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            if let Some(mut op) = self.pending.take() {
                cancel_pending(raw(&handle), &mut op);
            }
            if unregister && self.registered {
                self.reactor
                    .unregister(handle.as_raw_handle() as OsHandle)?;
                self.registered = false;
            }
        }
        Ok(())
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let _ = self.close(true);
    }
}

/// The write half of a pipe. Writes complete only once every byte has
/// been transferred; short completions are resubmitted for the remainder.
pub struct PipeWriter {
    handle: Option<OwnedHandle>,
    reactor: Arc<dyn Reactor>,
    registered: bool,
    pending: Option<PendingOp>,
}

impl PipeWriter {
    pub(crate) fn adopt(
        handle: OwnedHandle,
        reactor: Arc<dyn Reactor>,
        register: bool,
    ) -> Result<Self> {
        if register {
            reactor.register(handle.as_raw_handle() as OsHandle)?;
        }
        Ok(Self {
            handle: Some(handle),
            reactor,
            registered: register,
            pending: None,
        })
    }

    /// Write all of `buf`. The payload is copied into the pending record
    /// up front, so the kernel never touches caller memory.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        poll_fn(|cx| self.poll_write_all(cx, buf)).await
    }

    fn poll_write_all(&mut self, cx: &mut Context<'_>, src: &[u8]) -> Poll<Result<()>> {
        let handle = match self.handle.as_ref() {
            Some(h) => raw(h),
            None => return Poll::Ready(Err(Error::Closed)),
        };

        if self.pending.is_none() {
            if src.is_empty() {
                return Poll::Ready(Ok(()));
            }
            let op = match PendingOp::new(src.to_vec().into_boxed_slice()) {
                Ok(op) => op,
                Err(e) => return Poll::Ready(Err(e)),
            };
            self.pending = Some(op);
            if let Err(e) = self.submit(handle) {
                self.pending = None;
                return Poll::Ready(Err(e));
            }
        }

        loop {
            let op = match self.pending.as_mut() {
                Some(op) => op,
                None => return Poll::Ready(Ok(())),
            };
            let mut transferred = 0u32;
            let done = unsafe {
                GetOverlappedResult(
                    handle,
                    op.overlapped.as_ref() as *const _,
                    &mut transferred,
                    false,
                )
            };
            match done {
                Ok(()) => {
                    op.done += transferred as usize;
                    if op.done == op.buf.len() {
                        self.pending = None;
                        return Poll::Ready(Ok(()));
                    }
                    // Partial completion: resubmit the remainder.
                    if let Err(e) = self.submit(handle) {
                        self.pending = None;
                        return Poll::Ready(Err(e));
                    }
                }
                Err(e) if win32_code(&e) == ERROR_IO_INCOMPLETE.0 => {
                    self.reactor.watch_signal(op.event_handle(), cx.waker());
                    return Poll::Pending;
                }
                Err(e) => {
                    self.pending = None;
                    return Poll::Ready(Err(Error::Transfer(to_io(e))));
                }
            }
        }
    }

    /// Issue a WriteFile for the untransferred tail of the pending record.
    fn submit(&mut self, handle: HANDLE) -> Result<()> {
        let op = match self.pending.as_mut() {
            Some(op) => op,
            None => return Err(Error::Closed),
        };
        op.rearm();
        let started = unsafe {
            WriteFile(
                handle,
                Some(&op.buf[op.done..]),
                None,
                Some(op.overlapped.as_mut() as *mut _),
            )
        };
        match started {
            Ok(()) => Ok(()),
            Err(e) if win32_code(&e) == ERROR_IO_PENDING.0 => Ok(()),
            Err(e) => Err(Error::Transfer(to_io(e))),
        }
    }

    /// Raw handle, if still open. Non-owning.
    pub fn handle(&self) -> Option<OsHandle> {
        self.handle.as_ref().map(|h| h.as_raw_handle() as OsHandle)
    }

    /// Close the endpoint, cancelling any outstanding transfer first.
    /// Idempotent.
    pub fn close(&mut self, unregister: bool) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            if let Some(mut op) = self.pending.take() {
                cancel_pending(raw(&handle), &mut op);
            }
            if unregister && self.registered {
                self.reactor
                    .unregister(handle.as_raw_handle() as OsHandle)?;
                self.registered = false;
            }
        }
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let _ = self.close(true);
    }
}
