//! Child-process supervision over async stdio pipes.
//!
//! [`Command`] describes what to run; [`Process::spawn`] launches it with
//! its standard streams wired to pipe halves owned by the supervisor. The
//! child side of each pipe keeps blocking semantics; the parent side is
//! async and driven through the injected reactor, exactly like a pipe
//! created directly.
//!
//! Lifecycle queries are non-blocking: [`Process::running`] polls the OS
//! once and [`Process::peek_exit_code`] returns a `-1` sentinel until the
//! exit is observed, after which the code is cached and the OS is never
//! asked again.

use std::path::PathBuf;
use std::sync::Arc;

use bitflags::bitflags;
use sluice_core::{OsHandle, Reactor, Result};
use sluice_pipe::{parent_read_pair, parent_write_pair, OwnedEnd, PipeOptions, PipeReader, PipeWriter};

pub mod quote;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as platform;

#[cfg(windows)]
mod win;
#[cfg(windows)]
use win as platform;

bitflags! {
    /// Spawn-time behavior switches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SpawnOptions: u32 {
        /// Log the rendered command line before launching.
        const ECHO_COMMAND = 1 << 0;
        /// Resolve the program through the OS search path.
        const SEARCH_PATH = 1 << 1;
        /// Hand the command line to the system shell unmodified.
        const SHELL_VERBATIM = 1 << 2;
        /// Route the child's stderr into its stdout stream.
        const MERGE_STDERR = 1 << 3;
        /// Let the child share this process's stdio instead of pipes.
        const INHERIT_STDIO = 1 << 4;
        /// Favor low-latency small-buffer pipes over throughput.
        const INTERACTIVE = 1 << 5;
        /// Suppress console window creation (Windows; no-op elsewhere).
        const NO_CONSOLE = 1 << 6;
    }
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self::MERGE_STDERR
    }
}

/// Description of a child process to launch.
pub struct Command {
    pub(crate) program: String,
    pub(crate) args: Vec<String>,
    pub(crate) cwd: Option<PathBuf>,
    pub(crate) env_overrides: Vec<(String, String)>,
    pub(crate) inherit_env: bool,
    pub(crate) options: SpawnOptions,
    pub(crate) stdin_end: Option<OwnedEnd>,
    pub(crate) stdout_end: Option<OwnedEnd>,
    pub(crate) stderr_end: Option<OwnedEnd>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env_overrides: Vec::new(),
            inherit_env: true,
            options: SpawnOptions::default(),
            stdin_end: None,
            stdout_end: None,
            stderr_end: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set one environment variable for the child, on top of whatever the
    /// inherit policy provides.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_overrides.push((key.into(), value.into()));
        self
    }

    /// Start the child from an empty environment instead of inheriting
    /// this process's. Overrides set with [`Command::env`] still apply.
    pub fn env_clear(mut self) -> Self {
        self.inherit_env = false;
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn options(mut self, options: SpawnOptions) -> Self {
        self.options = options;
        self
    }

    /// Use a caller-supplied handle as the child's stdin instead of an
    /// automatically created pipe. The handle is consumed by the spawn.
    pub fn stdin_end(mut self, end: OwnedEnd) -> Self {
        self.stdin_end = Some(end);
        self
    }

    /// Use a caller-supplied handle as the child's stdout.
    pub fn stdout_end(mut self, end: OwnedEnd) -> Self {
        self.stdout_end = Some(end);
        self
    }

    /// Use a caller-supplied handle as the child's stderr. Ignored under
    /// [`SpawnOptions::MERGE_STDERR`].
    pub fn stderr_end(mut self, end: OwnedEnd) -> Self {
        self.stderr_end = Some(end);
        self
    }

    /// The command line as the target platform's shell would accept it.
    pub fn render(&self) -> String {
        let words = std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str));
        #[cfg(unix)]
        {
            quote::shell_join(words)
        }
        #[cfg(windows)]
        {
            quote::windows_command_line(words)
        }
    }
}

/// Child-side stream handles collected before the OS launch.
#[derive(Default)]
pub(crate) struct ChildStdio {
    pub(crate) stdin: Option<OwnedEnd>,
    pub(crate) stdout: Option<OwnedEnd>,
    pub(crate) stderr: Option<OwnedEnd>,
}

/// A supervised child process and the parent ends of its stdio pipes.
pub struct Process {
    child: platform::Child,
    stdin: Option<PipeWriter>,
    stdout: Option<PipeReader>,
    stderr: Option<PipeReader>,
    exit_code: Option<i32>,
    closed: bool,
}

impl Process {
    /// Launch `command`, wiring stdio per its options.
    ///
    /// Unless [`SpawnOptions::INHERIT_STDIO`] is set, the child gets pipe
    /// ends (or the command's caller-supplied handles) on its standard
    /// streams and the parent keeps matching async halves. Under
    /// [`SpawnOptions::MERGE_STDERR`] no separate stderr stream exists:
    /// the child's stderr is the stdout stream.
    pub fn spawn(reactor: &Arc<dyn Reactor>, mut command: Command) -> Result<Self> {
        if command.options.contains(SpawnOptions::ECHO_COMMAND) {
            tracing::info!(command = %command.render(), "spawning child");
        }

        let pipe_options = PipeOptions {
            register: true,
            interactive: command.options.contains(SpawnOptions::INTERACTIVE),
        };

        let mut stdio = ChildStdio::default();
        let mut stdin = None;
        let mut stdout = None;
        let mut stderr = None;
        if !command.options.contains(SpawnOptions::INHERIT_STDIO) {
            match command.stdin_end.take() {
                Some(end) => stdio.stdin = Some(end),
                None => {
                    let (writer, child_end) = parent_write_pair(reactor, &pipe_options)?;
                    stdin = Some(writer);
                    stdio.stdin = Some(child_end);
                }
            }
            match command.stdout_end.take() {
                Some(end) => stdio.stdout = Some(end),
                None => {
                    let (reader, child_end) = parent_read_pair(reactor, &pipe_options)?;
                    stdout = Some(reader);
                    stdio.stdout = Some(child_end);
                }
            }
            if !command.options.contains(SpawnOptions::MERGE_STDERR) {
                match command.stderr_end.take() {
                    Some(end) => stdio.stderr = Some(end),
                    None => {
                        let (reader, child_end) = parent_read_pair(reactor, &pipe_options)?;
                        stderr = Some(reader);
                        stdio.stderr = Some(child_end);
                    }
                }
            }
        }

        let child = platform::launch(&command, &stdio)?;
        tracing::debug!(pid = child.id(), program = %command.program, "child launched");
        // Dropping `stdio` here closes the child-side ends in the parent,
        // so EOF propagates once the child alone holds them.
        drop(stdio);

        Ok(Self {
            child,
            stdin,
            stdout,
            stderr,
            exit_code: None,
            closed: false,
        })
    }

    /// OS process identifier.
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Whether the child is still running. Non-blocking; a single OS poll
    /// at most, and none once the exit has been observed.
    ///
    /// A failed liveness query is fatal to this call and surfaces as
    /// [`sluice_core::Error::Process`]; no stale state is reported in its
    /// place.
    pub fn running(&mut self) -> Result<bool> {
        self.refresh()?;
        Ok(self.exit_code.is_none())
    }

    /// The child's exit code, or `-1` while it is still running.
    ///
    /// A POSIX child terminated by a signal reports `128 + signo`. Once
    /// observed the code is cached; later calls never re-issue the wait.
    /// Like [`Process::running`], a failed OS query fails this call.
    pub fn peek_exit_code(&mut self) -> Result<i32> {
        self.refresh()?;
        Ok(self.exit_code.unwrap_or(-1))
    }

    fn refresh(&mut self) -> Result<()> {
        if self.exit_code.is_some() {
            return Ok(());
        }
        if let Some(code) = self.child.poll_exit()? {
            tracing::debug!(pid = self.child.id(), code, "child exited");
            self.exit_code = Some(code);
        }
        Ok(())
    }

    /// Pause the child (`SIGSTOP` / thread suspension).
    pub fn suspend(&mut self) -> Result<()> {
        self.child.suspend()
    }

    /// Resume a paused child (`SIGCONT` / thread resumption).
    pub fn resume(&mut self) -> Result<()> {
        self.child.resume()
    }

    /// Ask the child to shut down (`SIGTERM` / console break to its
    /// process group). Best-effort, and only delivered while the child is
    /// still running.
    pub fn terminate(&mut self) -> Result<()> {
        if !self.running()? {
            return Ok(());
        }
        self.child.terminate()
    }

    /// Forcibly end the child (`SIGKILL` / `TerminateProcess`). A child
    /// that already exited is not an error.
    pub fn kill(&mut self) -> Result<()> {
        self.child.kill()
    }

    /// Parent end of the child's stdin, while open and not taken.
    pub fn stdin(&mut self) -> Option<&mut PipeWriter> {
        self.stdin.as_mut()
    }

    /// Parent end of the child's stdout.
    pub fn stdout(&mut self) -> Option<&mut PipeReader> {
        self.stdout.as_mut()
    }

    /// Parent end of the child's stderr. `None` under
    /// [`SpawnOptions::MERGE_STDERR`], when no separate stream exists.
    pub fn stderr(&mut self) -> Option<&mut PipeReader> {
        self.stderr.as_mut()
    }

    /// Take ownership of the stdin half, e.g. to close it for EOF while
    /// the process object lives on.
    pub fn take_stdin(&mut self) -> Option<PipeWriter> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<PipeReader> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<PipeReader> {
        self.stderr.take()
    }

    /// Raw handle feeding the child's stdin, if the pipe is still held.
    pub fn input_handle(&self) -> Option<OsHandle> {
        self.stdin.as_ref().and_then(|w| w.handle())
    }

    /// Raw handle carrying the child's stdout.
    pub fn output_handle(&self) -> Option<OsHandle> {
        self.stdout.as_ref().and_then(|r| r.handle())
    }

    /// Raw handle carrying the child's stderr, when a separate stream
    /// exists.
    pub fn error_handle(&self) -> Option<OsHandle> {
        self.stderr.as_ref().and_then(|r| r.handle())
    }

    /// Release the stdio pipes and any OS bookkeeping handles. Does not
    /// affect the child itself. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(mut w) = self.stdin.take() {
            w.close(true)?;
        }
        if let Some(mut r) = self.stdout.take() {
            r.close(true)?;
        }
        if let Some(mut r) = self.stderr.take() {
            r.close(true)?;
        }
        self.child.release();
        Ok(())
    }
}
