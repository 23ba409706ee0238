//! Windows launch and lifecycle: `CreateProcessW` with inherited pipe
//! handles, non-blocking exit polling, and thread-level suspend/resume.
//!
//! The child is always placed in its own process group so `terminate` can
//! deliver a console break without touching the parent's group.

use std::io;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};

use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{
    SetHandleInformation, HANDLE, HANDLE_FLAG_INHERIT, WAIT_TIMEOUT,
};
use windows::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};
use windows::Win32::System::Threading::{
    CreateProcessW, GetExitCodeProcess, IsWow64Process, ResumeThread, SuspendThread,
    TerminateProcess, WaitForSingleObject, Wow64SuspendThread, CREATE_NEW_PROCESS_GROUP,
    CREATE_NO_WINDOW, CREATE_UNICODE_ENVIRONMENT, PROCESS_CREATION_FLAGS, PROCESS_INFORMATION,
    STARTF_USESTDHANDLES, STARTUPINFOW,
};

use sluice_core::{Error, Result};

use crate::{quote, ChildStdio, Command, SpawnOptions};

pub(crate) struct Child {
    process: Option<OwnedHandle>,
    thread: Option<OwnedHandle>,
    pid: u32,
}

pub(crate) fn launch(command: &Command, stdio: &ChildStdio) -> Result<Child> {
    let mut command_line = render_command_line(command);
    command_line.push(0);

    let cwd = command.cwd.as_ref().map(|dir| wide(&dir.to_string_lossy()));
    let env_block = build_env_block(command);

    let mut startup = STARTUPINFOW {
        cb: std::mem::size_of::<STARTUPINFOW>() as u32,
        ..Default::default()
    };
    if !command.options.contains(SpawnOptions::INHERIT_STDIO) {
        startup.dwFlags |= STARTF_USESTDHANDLES;
        startup.hStdInput = inheritable(&stdio.stdin)?;
        startup.hStdOutput = inheritable(&stdio.stdout)?;
        startup.hStdError = if command.options.contains(SpawnOptions::MERGE_STDERR) {
            startup.hStdOutput
        } else {
            inheritable(&stdio.stderr)?
        };
    }

    let mut flags = CREATE_UNICODE_ENVIRONMENT | CREATE_NEW_PROCESS_GROUP;
    if command.options.contains(SpawnOptions::NO_CONSOLE) {
        flags |= CREATE_NO_WINDOW;
    }

    let mut info = PROCESS_INFORMATION::default();
    unsafe {
        CreateProcessW(
            PCWSTR::null(),
            Some(PWSTR(command_line.as_mut_ptr())),
            None,
            None,
            true,
            flags,
            env_block
                .as_ref()
                .map(|block| block.as_ptr() as *const std::ffi::c_void),
            cwd.as_ref()
                .map(|dir| PCWSTR(dir.as_ptr()))
                .unwrap_or(PCWSTR::null()),
            &startup,
            &mut info,
        )
    }
    .map_err(|e| Error::Process(to_io(e)))?;

    Ok(Child {
        process: Some(unsafe { OwnedHandle::from_raw_handle(info.hProcess.0) }),
        thread: Some(unsafe { OwnedHandle::from_raw_handle(info.hThread.0) }),
        pid: info.dwProcessId,
    })
}

fn render_command_line(command: &Command) -> Vec<u16> {
    let line = if command.options.contains(SpawnOptions::SHELL_VERBATIM) {
        // The tail after /C reaches cmd.exe untouched.
        let mut verbatim = String::from("cmd.exe /C ");
        verbatim.push_str(&command.program);
        for arg in &command.args {
            verbatim.push(' ');
            verbatim.push_str(arg);
        }
        verbatim
    } else {
        quote::windows_command_line(
            std::iter::once(command.program.as_str())
                .chain(command.args.iter().map(String::as_str)),
        )
    };
    line.encode_utf16().collect()
}

/// Double-null-terminated block of `KEY=value` UTF-16 strings, or `None`
/// to inherit the parent environment unchanged.
fn build_env_block(command: &Command) -> Option<Vec<u16>> {
    if command.inherit_env && command.env_overrides.is_empty() {
        return None;
    }
    let mut vars: Vec<(String, String)> = if command.inherit_env {
        std::env::vars().collect()
    } else {
        Vec::new()
    };
    for (key, value) in &command.env_overrides {
        match vars.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.clone(),
            None => vars.push((key.clone(), value.clone())),
        }
    }

    let mut block = Vec::new();
    for (key, value) in &vars {
        block.extend(format!("{key}={value}").encode_utf16());
        block.push(0);
    }
    block.push(0);
    Some(block)
}

fn inheritable(end: &Option<OwnedHandle>) -> Result<HANDLE> {
    let Some(end) = end else {
        return Ok(HANDLE::default());
    };
    let handle = HANDLE(end.as_raw_handle());
    unsafe { SetHandleInformation(handle, HANDLE_FLAG_INHERIT.0, HANDLE_FLAG_INHERIT) }
        .map_err(|e| Error::Process(to_io(e)))?;
    Ok(handle)
}

impl Child {
    pub(crate) fn id(&self) -> u32 {
        self.pid
    }

    /// One non-blocking wait; a zero-timeout wait distinguishes a running
    /// child from one that exited with the `STILL_ACTIVE` code.
    pub(crate) fn poll_exit(&self) -> Result<Option<i32>> {
        let Some(process) = &self.process else {
            return Ok(None);
        };
        let process = HANDLE(process.as_raw_handle());
        if unsafe { WaitForSingleObject(process, 0) } == WAIT_TIMEOUT {
            return Ok(None);
        }
        let mut code = 0u32;
        unsafe { GetExitCodeProcess(process, &mut code) }
            .map_err(|e| Error::Process(to_io(e)))?;
        Ok(Some(code as i32))
    }

    pub(crate) fn suspend(&self) -> Result<()> {
        let thread = self.thread()?;
        let mut wow64 = windows::Win32::Foundation::BOOL::default();
        let process = self
            .process
            .as_ref()
            .map(|p| HANDLE(p.as_raw_handle()))
            .unwrap_or_default();
        unsafe {
            let _ = IsWow64Process(process, &mut wow64);
        }
        let suspended = if wow64.as_bool() {
            unsafe { Wow64SuspendThread(thread) }
        } else {
            unsafe { SuspendThread(thread) }
        };
        if suspended == u32::MAX {
            return Err(Error::Process(io::Error::last_os_error()));
        }
        Ok(())
    }

    pub(crate) fn resume(&self) -> Result<()> {
        let thread = self.thread()?;
        if unsafe { ResumeThread(thread) } == u32::MAX {
            return Err(Error::Process(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Console break to the child's own process group.
    pub(crate) fn terminate(&self) -> Result<()> {
        unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, self.pid) }
            .map_err(|e| Error::Process(to_io(e)))
    }

    /// Unconditional; a child that is already gone is success.
    pub(crate) fn kill(&self) -> Result<()> {
        let Some(process) = &self.process else {
            return Ok(());
        };
        let process = HANDLE(process.as_raw_handle());
        if unsafe { WaitForSingleObject(process, 0) } != WAIT_TIMEOUT {
            return Ok(());
        }
        unsafe { TerminateProcess(process, 1) }.map_err(|e| Error::Process(to_io(e)))
    }

    /// Drop the process and thread handles.
    pub(crate) fn release(&mut self) {
        self.thread.take();
        self.process.take();
    }

    fn thread(&self) -> Result<HANDLE> {
        self.thread
            .as_ref()
            .map(|t| HANDLE(t.as_raw_handle()))
            .ok_or(Error::Closed)
    }
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn to_io(err: windows::core::Error) -> io::Error {
    io::Error::from_raw_os_error((err.code().0 & 0xFFFF) as i32)
}
