//! External command execution.
//!
//! The analysis tools can exit 0 while reporting internal failures, so a
//! run's verdict may also depend on the last status line the tool prints:
//!
//! ```text
//! #    info     1 816 | 0 error(s) and 670791 warning(s).
//! ```

use std::{
    collections::BTreeMap,
    env,
    ffi::OsString,
    fmt,
    io::{self, BufRead, BufReader, Read},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::{
        Arc, LazyLock,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{RecvTimeoutError, Sender, unbounded};
use regex::Regex;
use serde::Serialize;

use crate::error::PipelineError;

static STATUS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#.+info.+\| ([0-9]+) error\(s\) and (?:[0-9]+) warning\(s\)\.$")
        .expect("status line pattern is valid")
});

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Error count reported by a status line, if `line` is one.
pub fn parse_status_line(line: &str) -> Option<u64> {
    STATUS_LINE
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Shared flag used to abandon a running command from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Require a status line reporting zero errors.
    pub check_status_line: bool,
    /// Kill the command once this much time has passed.
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl RunOptions {
    pub fn checked() -> Self {
        Self {
            check_status_line: true,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// How the child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitState {
    Exited(i32),
    /// Terminated by a signal, no exit code.
    Signaled,
    TimedOut,
    Cancelled,
}

impl fmt::Display for ExitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit code {code}"),
            Self::Signaled => f.write_str("terminated by signal"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessVerdict {
    pub command: String,
    pub state: ExitState,
    /// Error count from the last status line seen, if any.
    pub n_errors: Option<u64>,
    /// Combined stdout/stderr lines in arrival order.
    pub output: Vec<String>,
    pub check_status_line: bool,
}

impl ProcessVerdict {
    pub fn exit_code(&self) -> Option<i32> {
        match self.state {
            ExitState::Exited(code) => Some(code),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure_reason().is_none()
    }

    pub fn failure_reason(&self) -> Option<String> {
        match self.state {
            ExitState::Exited(0) => {}
            state => return Some(state.to_string()),
        }
        if !self.check_status_line {
            return None;
        }
        match self.n_errors {
            Some(0) => None,
            Some(n) => Some(format!("{n} error(s) reported")),
            None => Some(String::from("no status line reported")),
        }
    }

    /// The last `n` output lines.
    pub fn tail(&self, n: usize) -> &[String] {
        &self.output[self.output.len().saturating_sub(n)..]
    }
}

/// Paths of the external programs a pipeline needs, resolved once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolPaths {
    paths: BTreeMap<String, PathBuf>,
}

impl ToolPaths {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locates every program in `bin_dirs` first, then on `PATH`.
    pub fn resolve<S: AsRef<str>>(
        programs: &[S],
        bin_dirs: &[PathBuf],
    ) -> Result<Self, PipelineError> {
        let mut search: Vec<PathBuf> = bin_dirs.to_vec();
        search.extend(env::split_paths(&env::var_os("PATH").unwrap_or_else(OsString::new)));

        let mut tools = Self::new();
        for program in programs {
            let program = program.as_ref();
            let path = search
                .iter()
                .map(|dir| dir.join(program))
                .find(|candidate| is_executable(candidate))
                .ok_or_else(|| {
                    PipelineError::MissingResource(format!(
                        "cannot find program {program}; add its folder to the bin dirs or PATH"
                    ))
                })?;
            tracing::debug!(program, path = %path.display(), "resolved program");
            tools.insert(program, path);
        }
        Ok(tools)
    }

    pub fn insert(&mut self, program: impl Into<String>, path: impl Into<PathBuf>) {
        self.paths.insert(program.into(), path.into());
    }

    pub fn get(&self, program: &str) -> Result<&Path, PipelineError> {
        self.paths
            .get(program)
            .map(PathBuf::as_path)
            .ok_or_else(|| PipelineError::MissingResource(format!("program {program} was not resolved")))
    }

    /// Builds `<path> <args...>` for a resolved program.
    pub fn command_line<I, A>(&self, program: &str, args: I) -> Result<String, PipelineError>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<str>,
    {
        let mut line = self.get(program)?.display().to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg.as_ref());
        }
        Ok(line)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.paths.iter().map(|(k, v)| (k.as_str(), v.as_path()))
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Runs shell command lines and derives verdicts from their output.
#[derive(Debug, Clone, Copy)]
pub struct CommandRunner<'a> {
    tools: &'a ToolPaths,
}

impl<'a> CommandRunner<'a> {
    pub fn new(tools: &'a ToolPaths) -> Self {
        Self { tools }
    }

    /// Runs `command_line` through `sh -c` and waits for it to finish.
    ///
    /// Only a failure to launch is an error; everything else is reported in
    /// the verdict.
    pub fn run(
        &self,
        command_line: &str,
        options: &RunOptions,
    ) -> Result<ProcessVerdict, PipelineError> {
        let command = command_line.replace('\n', "");
        tracing::debug!(command = %command, "running");

        let spawn_err = |source| PipelineError::Spawn {
            command: command.clone(),
            source,
        };
        // stdout and stderr share one pipe so lines keep the order they were written
        let (pipe, writer) = io::pipe().map_err(spawn_err)?;
        let stderr_writer = writer.try_clone().map_err(spawn_err)?;
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(writer)
            .stderr(stderr_writer)
            .spawn()
            .map_err(spawn_err)?;

        let (tx, rx) = unbounded();
        let pump = spawn_pump(pipe, tx);

        let deadline = options.timeout.map(|timeout| Instant::now() + timeout);
        let cancelled = || options.cancel.as_ref().is_some_and(CancellationToken::is_cancelled);

        let mut output = Vec::new();
        let mut n_errors = None;
        let mut interrupted = None;
        loop {
            if cancelled() {
                interrupted = Some(ExitState::Cancelled);
                break;
            }
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        interrupted = Some(ExitState::TimedOut);
                        break;
                    }
                    (deadline - now).min(POLL_INTERVAL)
                }
                None => POLL_INTERVAL,
            };
            match rx.recv_timeout(wait) {
                Ok(line) => {
                    if let Some(count) = parse_status_line(&line) {
                        n_errors = Some(count);
                    }
                    output.push(line);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let state = match interrupted {
            Some(state) => {
                terminate(&mut child, &command);
                // pumps may be held open by grandchildren; leave them detached
                state
            }
            None => {
                let _ = pump.join();
                wait_for_exit(&mut child, deadline, &cancelled, &command)?
            }
        };

        let verdict = ProcessVerdict {
            command,
            state,
            n_errors,
            output,
            check_status_line: options.check_status_line,
        };
        tracing::debug!(
            state = %verdict.state,
            n_errors = ?verdict.n_errors,
            lines = verdict.output.len(),
            "command finished",
        );
        Ok(verdict)
    }

    /// Runs a resolved program with `args` through [`execute`](Self::execute).
    pub fn execute_tool<I, A>(
        &self,
        program: &str,
        args: I,
        options: &RunOptions,
    ) -> Result<ProcessVerdict, PipelineError>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<str>,
    {
        let command_line = self.tools.command_line(program, args)?;
        self.execute(&command_line, options)
    }

    /// Like [`run`](Self::run), but a failed verdict is an
    /// [`PipelineError::ExternalToolFailure`].
    pub fn execute(
        &self,
        command_line: &str,
        options: &RunOptions,
    ) -> Result<ProcessVerdict, PipelineError> {
        let verdict = self.run(command_line, options)?;
        if let Some(reason) = verdict.failure_reason() {
            tracing::error!(command = %verdict.command, %reason, "command failed");
            for line in verdict.tail(20) {
                tracing::error!("  {line}");
            }
            return Err(PipelineError::ExternalToolFailure {
                command: verdict.command.clone(),
                verdict: Box::new(verdict),
            });
        }
        Ok(verdict)
    }
}

fn spawn_pump<R>(pipe: R, tx: Sender<String>) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).trim().to_string();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

fn wait_for_exit<F>(
    child: &mut Child,
    deadline: Option<Instant>,
    cancelled: &F,
    command: &str,
) -> Result<ExitState, PipelineError>
where
    F: Fn() -> bool,
{
    let spawn_err = |source| PipelineError::Spawn {
        command: command.to_string(),
        source,
    };
    loop {
        if let Some(status) = child.try_wait().map_err(spawn_err)? {
            return Ok(status.code().map_or(ExitState::Signaled, ExitState::Exited));
        }
        if cancelled() {
            terminate(child, command);
            return Ok(ExitState::Cancelled);
        }
        let mut pause = POLL_INTERVAL;
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if now >= deadline {
                terminate(child, command);
                return Ok(ExitState::TimedOut);
            }
            pause = pause.min(deadline - now);
        }
        thread::sleep(pause);
    }
}

fn terminate(child: &mut Child, command: &str) {
    tracing::warn!(command, "terminating command");
    if let Err(e) = child.kill() {
        tracing::debug!(error = %e, "kill failed, process already exited");
    }
    let _ = child.wait();
}
