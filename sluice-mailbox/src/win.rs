//! Windows backing objects: a named file mapping for the slot and a named
//! auto-reset event for transition signals.
//!
//! Named kernel objects are reference-counted, so the mapping stays alive
//! while any attachment holds its handle; "unlink" is simply letting the
//! owner's handles close. The auto-reset event collapses consecutive
//! signals into one, which the header re-check protocol already tolerates.

use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};

use windows::core::PCWSTR;
use windows::Win32::Foundation::{
    GetLastError, ERROR_ALREADY_EXISTS, HANDLE, INVALID_HANDLE_VALUE,
};
use windows::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, FILE_MAP_ALL_ACCESS,
    MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READWRITE,
};
use windows::Win32::System::Threading::{CreateEventW, OpenEventW, SetEvent, EVENT_ALL_ACCESS};

use sluice_core::{Error, OsHandle, Reactor, Result};

pub(crate) struct Shared {
    _mapping: OwnedHandle,
    view: MEMORY_MAPPED_VIEW_ADDRESS,
    event: OwnedHandle,
}

// The view address is a shared mapping whose header is only touched
// through atomics; handles are plain kernel object identifiers.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    /// Create the named mapping and its signal event. Exclusive: an
    /// existing name is a creation error.
    pub(crate) fn create(name: &str, total: usize) -> Result<Self> {
        let name_w = wide(name);
        let mapping = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                None,
                PAGE_READWRITE,
                0,
                total as u32,
                PCWSTR(name_w.as_ptr()),
            )
        }
        .map_err(|e| Error::creation("mailbox mapping", to_io(e)))?;
        let mapping = unsafe { OwnedHandle::from_raw_handle(mapping.0) };
        if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
            return Err(Error::creation(
                "mailbox mapping",
                std::io::Error::from_raw_os_error(ERROR_ALREADY_EXISTS.0 as i32),
            ));
        }

        let view = unsafe { MapViewOfFile(raw(&mapping), FILE_MAP_ALL_ACCESS, 0, 0, total) };
        if view.Value.is_null() {
            return Err(Error::creation(
                "mailbox mapping",
                std::io::Error::last_os_error(),
            ));
        }

        let event_w = wide(&event_name(name));
        let event = unsafe { CreateEventW(None, false, false, PCWSTR(event_w.as_ptr())) }
            .map_err(|e| Error::creation("mailbox signal event", to_io(e)))?;
        let event = unsafe { OwnedHandle::from_raw_handle(event.0) };

        Ok(Self {
            _mapping: mapping,
            view,
            event,
        })
    }

    /// Attach to an existing mapping. The whole object is mapped, so no
    /// length needs to travel out of band.
    pub(crate) fn open(name: &str) -> Result<Self> {
        let name_w = wide(name);
        let mapping = unsafe {
            OpenFileMappingW(FILE_MAP_ALL_ACCESS.0, false, PCWSTR(name_w.as_ptr()))
        }
        .map_err(|e| Error::creation("mailbox mapping", to_io(e)))?;
        let mapping = unsafe { OwnedHandle::from_raw_handle(mapping.0) };

        let view = unsafe { MapViewOfFile(raw(&mapping), FILE_MAP_ALL_ACCESS, 0, 0, 0) };
        if view.Value.is_null() {
            return Err(Error::creation(
                "mailbox mapping",
                std::io::Error::last_os_error(),
            ));
        }

        let event_w = wide(&event_name(name));
        let event = unsafe { OpenEventW(EVENT_ALL_ACCESS, false, PCWSTR(event_w.as_ptr())) }
            .map_err(|e| Error::creation("mailbox signal event", to_io(e)))?;
        let event = unsafe { OwnedHandle::from_raw_handle(event.0) };

        Ok(Self {
            _mapping: mapping,
            view,
            event,
        })
    }

    /// Named kernel objects disappear with their last handle; there is no
    /// separate unlink step.
    pub(crate) fn unlink(_name: &str) -> Result<()> {
        Ok(())
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.view.Value as *mut u8
    }

    pub(crate) fn register(&self, reactor: &dyn Reactor) -> Result<()> {
        reactor.register(self.event.as_raw_handle() as OsHandle)
    }

    pub(crate) fn unregister(&self, reactor: &dyn Reactor) -> Result<()> {
        reactor.unregister(self.event.as_raw_handle() as OsHandle)
    }

    pub(crate) fn notify(&self) -> Result<()> {
        unsafe { SetEvent(raw(&self.event)) }.map_err(|e| Error::Transfer(to_io(e)))
    }

    /// Auto-reset events carry no backlog to clear.
    pub(crate) fn drain(&self) {}

    pub(crate) fn watch(&self, reactor: &dyn Reactor, waker: &std::task::Waker) {
        reactor.watch_signal(self.event.as_raw_handle() as OsHandle, waker);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        unsafe {
            let _ = UnmapViewOfFile(self.view);
        }
    }
}

fn event_name(name: &str) -> String {
    format!("{name}.signal")
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn raw(handle: &OwnedHandle) -> HANDLE {
    HANDLE(handle.as_raw_handle())
}

fn to_io(err: windows::core::Error) -> std::io::Error {
    std::io::Error::from_raw_os_error((err.code().0 & 0xFFFF) as i32)
}
