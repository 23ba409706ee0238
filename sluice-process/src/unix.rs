//! POSIX launch and lifecycle: fork/exec, `waitpid(WNOHANG)` polling, and
//! signal-based control.
//!
//! Everything the child branch needs is materialized before `fork`,
//! including the NUL-terminated argv/envp pointer arrays and the resolved
//! executable path, so the code between `fork` and `exec` allocates
//! nothing and is limited to async-signal-safe calls: `dup2`, `chdir`,
//! `execv`/`execve`, `_exit`. The parent may be multithreaded (a reactor
//! dispatch thread is usually alive), so the child must not touch the
//! allocator.

use std::ffi::CString;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use libc::c_char;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use sluice_core::{Error, Result};

use crate::{ChildStdio, Command, SpawnOptions};

pub(crate) struct Child {
    pid: Pid,
}

/// The exec target plus everything needed to reach it, fully materialized
/// pre-fork. The pointer arrays index into the owned `CString`s; moving
/// the struct is fine because the strings' heap buffers never move.
struct Launch {
    path: CString,
    // Read only through the pointer arrays; kept to own the buffers.
    _argv: Vec<CString>,
    _envp: Option<Vec<CString>>,
    cwd: Option<CString>,
    argv_ptrs: Vec<*const c_char>,
    envp_ptrs: Option<Vec<*const c_char>>,
}

pub(crate) fn launch(command: &Command, stdio: &ChildStdio) -> Result<Child> {
    let prepared = prepare(command)?;
    let merge = command.options.contains(SpawnOptions::MERGE_STDERR);

    match unsafe { fork() }.map_err(|e| Error::Process(errno_io(e)))? {
        ForkResult::Parent { child } => Ok(Child { pid: child }),
        ForkResult::Child => {
            // Only async-signal-safe calls from here to exec.
            unsafe { child_exec(&prepared, stdio, merge) }
        }
    }
}

fn prepare(command: &Command) -> Result<Launch> {
    let verbatim = command.options.contains(SpawnOptions::SHELL_VERBATIM);

    let (path, argv) = if verbatim {
        let mut line = command.program.clone();
        for arg in &command.args {
            line.push(' ');
            line.push_str(arg);
        }
        (
            cstring("/bin/sh")?,
            vec![cstring("sh")?, cstring("-c")?, cstring(&line)?],
        )
    } else {
        let mut argv = Vec::with_capacity(command.args.len() + 1);
        argv.push(cstring(&command.program)?);
        for arg in &command.args {
            argv.push(cstring(arg)?);
        }
        // Search-path resolution happens here, pre-fork; an unresolved
        // name is left as-is and the exec failure becomes the child's 127.
        let search = command.options.contains(SpawnOptions::SEARCH_PATH)
            && !command.program.contains('/');
        let resolved = if search {
            search_in_path(&command.program, path_variable(command))
        } else {
            None
        };
        (
            cstring(resolved.as_deref().unwrap_or(&command.program))?,
            argv,
        )
    };

    // An inherited environment with no overrides keeps the parent's
    // environ; anything else materializes an explicit block.
    let envp = if command.inherit_env && command.env_overrides.is_empty() {
        None
    } else {
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
        Some(
            vars.iter()
                .map(|(k, v)| cstring(&format!("{k}={v}")))
                .collect::<Result<Vec<_>>>()?,
        )
    };

    let cwd = command
        .cwd
        .as_ref()
        .map(|dir| cstring(&dir.to_string_lossy()))
        .transpose()?;

    let argv_ptrs = ptr_array(&argv);
    let envp_ptrs = envp.as_ref().map(|block| ptr_array(block));

    Ok(Launch {
        path,
        _argv: argv,
        _envp: envp,
        cwd,
        argv_ptrs,
        envp_ptrs,
    })
}

/// NUL-terminated pointer array over a `CString` slice, built while the
/// allocator is still safe to use.
fn ptr_array(items: &[CString]) -> Vec<*const c_char> {
    items
        .iter()
        .map(|item| item.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// PATH as the child will see it: an explicit environment supplies its
/// own, otherwise the parent's applies.
fn path_variable(command: &Command) -> Option<String> {
    let override_path = command
        .env_overrides
        .iter()
        .rev()
        .find(|(key, _)| key == "PATH")
        .map(|(_, value)| value.clone());
    override_path.or_else(|| {
        if command.inherit_env {
            std::env::var("PATH").ok()
        } else {
            None
        }
    })
}

fn search_in_path(program: &str, path: Option<String>) -> Option<String> {
    let path = path?;
    for dir in path.split(':') {
        // An empty entry means the current directory.
        let candidate = if dir.is_empty() {
            PathBuf::from(program)
        } else {
            Path::new(dir).join(program)
        };
        let Ok(candidate_c) = CString::new(candidate.as_os_str().as_bytes()) else {
            continue;
        };
        if unsafe { libc::access(candidate_c.as_ptr(), libc::X_OK) } == 0 {
            return Some(candidate.to_string_lossy().into_owned());
        }
    }
    None
}

/// Child-side setup and exec. Never returns; any failure ends the child
/// with status 127.
unsafe fn child_exec(launch: &Launch, stdio: &ChildStdio, merge: bool) -> ! {
    if let Some(end) = &stdio.stdin {
        if libc::dup2(end.as_raw_fd(), 0) < 0 {
            libc::_exit(127);
        }
    }
    if let Some(end) = &stdio.stdout {
        if libc::dup2(end.as_raw_fd(), 1) < 0 {
            libc::_exit(127);
        }
        if merge && libc::dup2(1, 2) < 0 {
            libc::_exit(127);
        }
    }
    if let Some(end) = &stdio.stderr {
        if libc::dup2(end.as_raw_fd(), 2) < 0 {
            libc::_exit(127);
        }
    }
    if let Some(dir) = &launch.cwd {
        if libc::chdir(dir.as_ptr()) < 0 {
            libc::_exit(127);
        }
    }

    let _ = match &launch.envp_ptrs {
        None => libc::execv(launch.path.as_ptr(), launch.argv_ptrs.as_ptr()),
        Some(envp) => libc::execve(
            launch.path.as_ptr(),
            launch.argv_ptrs.as_ptr(),
            envp.as_ptr(),
        ),
    };
    libc::_exit(127)
}

impl Child {
    pub(crate) fn id(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// One non-blocking wait. `Some(code)` reaps the child; a child ended
    /// by a signal reports `128 + signo`.
    pub(crate) fn poll_exit(&self) -> Result<Option<i32>> {
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(WaitStatus::Exited(_, code)) => Ok(Some(code)),
            Ok(WaitStatus::Signaled(_, signal, _)) => Ok(Some(128 + signal as i32)),
            Ok(_) => Ok(None),
            Err(e) => Err(Error::Process(errno_io(e))),
        }
    }

    pub(crate) fn suspend(&self) -> Result<()> {
        self.signal(Signal::SIGSTOP)
    }

    pub(crate) fn resume(&self) -> Result<()> {
        self.signal(Signal::SIGCONT)
    }

    pub(crate) fn terminate(&self) -> Result<()> {
        self.signal(Signal::SIGTERM)
    }

    /// Unconditional; a child that is already gone is success.
    pub(crate) fn kill(&self) -> Result<()> {
        match kill(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(Error::Process(errno_io(e))),
        }
    }

    /// Nothing to release: the pid needs no handle on POSIX.
    pub(crate) fn release(&mut self) {}

    fn signal(&self, signal: Signal) -> Result<()> {
        kill(self.pid, signal).map_err(|e| Error::Process(errno_io(e)))
    }
}

fn cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| Error::Contract("command strings must not contain NUL bytes"))
}

fn errno_io(errno: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}
