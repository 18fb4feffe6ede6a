//! Synchronous invocation of external programs with a bounded runtime.
//!
//! Every process the harness starts (tester runs, unmount requests, the
//! long-lived filesystem server) goes through [`ChildGuard`], which drains
//! stdout/stderr on background threads and kills and reaps the child on every
//! exit path, including unwinding.

use std::borrow::Cow;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// Default timeout for a single external invocation.
pub const DEFAULT_PROCESS_TIMEOUT: Duration = Duration::from_secs(30);

/// How often a running child is polled for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long to wait for the pipe drain threads once the child has exited.
///
/// A grandchild that inherited the pipes can keep them open after the direct
/// child is gone; we stop waiting for it after this long.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Captured output longer than this is shown tail-first in error messages.
const DISPLAY_LIMIT: usize = 4096;

/// Arguments longer than this are abbreviated in command descriptions.
const ARG_DISPLAY_LIMIT: usize = 64;

/// Description of one external invocation.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    program: PathBuf,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
    timeout: Duration,
}

impl ProcessSpec {
    /// Start describing an invocation of `program`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            timeout: DEFAULT_PROCESS_TIMEOUT,
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Overlay environment variables on top of the inherited environment.
    #[must_use]
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.env.extend(
            vars.into_iter()
                .map(|(k, v)| (k.as_ref().to_os_string(), v.as_ref().to_os_string())),
        );
        self
    }

    /// Set the timeout after which the child is killed.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    pub fn environment(&self) -> &[(OsString, OsString)] {
        &self.env
    }

    pub fn timeout_duration(&self) -> Duration {
        self.timeout
    }

    /// Human-readable command line, with long arguments abbreviated.
    pub fn describe(&self) -> String {
        let mut out = self.program.display().to_string();
        for arg in &self.args {
            let arg = arg.to_string_lossy();
            out.push(' ');
            if arg.len() > ARG_DISPLAY_LIMIT {
                let cut = floor_char_boundary(&arg, ARG_DISPLAY_LIMIT);
                out.push_str(&arg[..cut]);
                out.push_str(&format!("...({} bytes)", arg.len()));
            } else {
                out.push_str(&arg);
            }
        }
        out
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

/// Everything a process wrote to stdout and stderr.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CapturedOutput {
    pub fn stdout_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }

    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }
}

impl fmt::Display for CapturedOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_stream(f, "stdout", &self.stdout)?;
        writeln!(f)?;
        write_stream(f, "stderr", &self.stderr)
    }
}

fn write_stream(f: &mut fmt::Formatter<'_>, name: &str, data: &[u8]) -> fmt::Result {
    if data.is_empty() {
        return write!(f, "--- {name}: (empty) ---");
    }
    writeln!(f, "--- {name} ({} bytes) ---", data.len())?;
    if data.len() > DISPLAY_LIMIT {
        let tail = &data[data.len() - DISPLAY_LIMIT..];
        write!(f, "[... {} bytes omitted ...]\n{}", data.len() - DISPLAY_LIMIT, String::from_utf8_lossy(tail))
    } else {
        write!(f, "{}", String::from_utf8_lossy(data))
    }
}

/// Result of a successful invocation.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub output: CapturedOutput,
}

/// Failure of an external invocation.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The program could not be started at all.
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The program ran to completion but reported failure.
    #[error("{command} exited with {status}\n{output}")]
    NonZeroExit {
        command: String,
        status: ExitStatus,
        output: CapturedOutput,
    },

    /// The program did not finish in time and was killed.
    #[error("{command} timed out after {timeout:?} and was killed\n{output}")]
    Timeout {
        command: String,
        timeout: Duration,
        output: CapturedOutput,
    },

    /// A long-lived process exited while it was expected to keep running.
    #[error("{command} exited unexpectedly with {status}\n{output}")]
    Exited {
        command: String,
        status: ExitStatus,
        output: CapturedOutput,
    },

    /// Waiting on the child failed.
    #[error("failed to wait for {command}: {source}")]
    Wait {
        command: String,
        #[source]
        source: io::Error,
    },
}

impl ProcessError {
    /// Output captured from the process, if any was collected.
    pub fn output(&self) -> Option<&CapturedOutput> {
        match self {
            Self::NonZeroExit { output, .. }
            | Self::Timeout { output, .. }
            | Self::Exited { output, .. } => Some(output),
            Self::Spawn { .. } | Self::Wait { .. } => None,
        }
    }
}

/// Run a process to completion, capturing its output.
///
/// Fails on spawn errors, nonzero exit status, and timeouts. A timed-out
/// child is killed and reaped before this returns.
pub fn run(spec: &ProcessSpec) -> Result<ProcessOutput, ProcessError> {
    let mut child = ChildGuard::spawn(spec)?;
    let command = child.command().to_string();

    let waited = child.wait_timeout(spec.timeout);
    let status = match waited {
        Ok(Some(status)) => status,
        Ok(None) => {
            tracing::debug!("{} timed out after {:?}, killing", command, spec.timeout);
            let _ = child.kill();
            return Err(ProcessError::Timeout {
                command,
                timeout: spec.timeout,
                output: child.take_output(),
            });
        }
        Err(source) => return Err(ProcessError::Wait { command, source }),
    };

    let output = child.take_output();
    tracing::debug!(
        "{} exited with {} ({} bytes stdout, {} bytes stderr)",
        command,
        status,
        output.stdout.len(),
        output.stderr.len()
    );

    if status.success() {
        Ok(ProcessOutput { status, output })
    } else {
        Err(ProcessError::NonZeroExit {
            command,
            status,
            output,
        })
    }
}

/// Owned handle to a running child.
///
/// The child is killed and reaped when the guard is dropped unless it has
/// already been observed to exit.
pub struct ChildGuard {
    command: String,
    child: Child,
    drain: Option<OutputDrain>,
    exit_status: Option<ExitStatus>,
}

impl ChildGuard {
    /// Spawn the described process with piped stdout/stderr.
    pub fn spawn(spec: &ProcessSpec) -> Result<Self, ProcessError> {
        let command = spec.describe();
        tracing::debug!("spawning {}", command);
        let mut child = spec
            .command()
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                command: command.clone(),
                source,
            })?;
        let drain = OutputDrain::attach(&mut child);
        Ok(Self {
            command,
            child,
            drain: Some(drain),
            exit_status: None,
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Exit status, if the child has been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Check for exit without blocking.
    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        if let Some(status) = self.exit_status {
            return Ok(Some(status));
        }
        let status = self.child.try_wait()?;
        self.exit_status = status;
        Ok(status)
    }

    /// Wait for exit for at most `timeout`. Returns `None` if still running.
    pub fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Kill the child (if still running) and reap it.
    pub fn kill(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        // The child may exit on its own between try_wait and kill.
        if let Err(e) = self.child.kill() {
            tracing::debug!("kill {} failed: {}", self.command, e);
        }
        let status = self.child.wait()?;
        self.exit_status = Some(status);
        Ok(status)
    }

    /// Collect captured stdout/stderr.
    ///
    /// Intended to be called after the child has exited; later calls return
    /// empty output.
    pub fn take_output(&mut self) -> CapturedOutput {
        self.drain
            .take()
            .map(|drain| drain.collect(DRAIN_GRACE))
            .unwrap_or_default()
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if self.exit_status.is_none() {
            tracing::debug!("reaping {} on drop", self.command);
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

impl fmt::Debug for ChildGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildGuard")
            .field("command", &self.command)
            .field("pid", &self.child.id())
            .field("exit_status", &self.exit_status)
            .finish_non_exhaustive()
    }
}

/// Background readers for a child's stdout and stderr.
struct OutputDrain {
    stdout: Option<mpsc::Receiver<Vec<u8>>>,
    stderr: Option<mpsc::Receiver<Vec<u8>>>,
}

impl OutputDrain {
    fn attach(child: &mut Child) -> Self {
        Self {
            stdout: child.stdout.take().map(drain_pipe),
            stderr: child.stderr.take().map(drain_pipe),
        }
    }

    fn collect(self, grace: Duration) -> CapturedOutput {
        let deadline = Instant::now() + grace;
        CapturedOutput {
            stdout: receive_before(self.stdout, deadline, "stdout"),
            stderr: receive_before(self.stderr, deadline, "stderr"),
        }
    }
}

fn drain_pipe<R: Read + Send + 'static>(mut pipe: R) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::debug!("pipe read failed: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

/// Gather chunks until the pipe closes or `deadline` passes.
///
/// A pipe held open by a grandchild keeps whatever arrived before the
/// deadline.
fn receive_before(rx: Option<mpsc::Receiver<Vec<u8>>>, deadline: Instant, name: &str) -> Vec<u8> {
    let Some(rx) = rx else {
        return Vec::new();
    };
    let mut out = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(chunk) => out.extend_from_slice(&chunk),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    "{} still open after child exit; keeping the {} bytes received",
                    name,
                    out.len()
                );
                return out;
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => return out,
        }
    }
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec::new("sh").arg("-c").arg(script)
    }

    #[test]
    fn test_run_captures_stdout_and_stderr() {
        let out = run(&sh("printf 'out\\nput'; printf err >&2")).unwrap();
        assert!(out.status.success());
        assert_eq!(out.output.stdout, b"out\nput");
        assert_eq!(out.output.stderr, b"err");
    }

    #[test]
    fn test_run_applies_env_overlay() {
        let spec = sh("printf '%s' \"$TESTIO_PROBE\"").envs([("TESTIO_PROBE", "overlay")]);
        let out = run(&spec).unwrap();
        assert_eq!(out.output.stdout, b"overlay");
    }

    #[test]
    fn test_run_inherits_environment() {
        let path = std::env::var("PATH").unwrap_or_default();
        let out = run(&sh("printf '%s' \"$PATH\"").envs([("TESTIO_UNRELATED", "1")])).unwrap();
        assert_eq!(out.output.stdout, path.as_bytes());
    }

    #[test]
    fn test_run_nonzero_exit_is_error_with_output() {
        let err = run(&sh("printf oops >&2; exit 3")).unwrap_err();
        match &err {
            ProcessError::NonZeroExit { status, output, .. } => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(output.stderr, b"oops");
            }
            other => panic!("expected NonZeroExit, got {other:?}"),
        }
        assert!(err.to_string().contains("oops"));
    }

    #[test]
    fn test_run_timeout_kills_child() {
        let start = Instant::now();
        let err = run(&sh("exec sleep 10").timeout(Duration::from_millis(200))).unwrap_err();
        assert!(matches!(err, ProcessError::Timeout { .. }), "got {err:?}");
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_run_missing_program_is_spawn_error() {
        let err = run(&ProcessSpec::new("/nonexistent/testio/program")).unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
        assert!(err.output().is_none());
    }

    #[test]
    fn test_large_output_does_not_block() {
        // Well beyond a pipe buffer on both streams
        let out = run(&sh("head -c 300000 /dev/zero; head -c 300000 /dev/zero >&2")).unwrap();
        assert_eq!(out.output.stdout.len(), 300_000);
        assert_eq!(out.output.stderr.len(), 300_000);
    }

    #[test]
    fn test_output_kept_when_grandchild_holds_pipe() {
        // The background sleep inherits stdout and outlives the drain grace
        let started = Instant::now();
        let out = run(&sh("echo 5; sleep 4 &")).unwrap();
        assert_eq!(out.output.stdout, b"5\n");
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_child_guard_reaps_on_drop() {
        let mut guard = ChildGuard::spawn(&sh("exec sleep 10")).unwrap();
        assert!(guard.try_wait().unwrap().is_none());
        drop(guard);
    }

    #[test]
    fn test_child_guard_kill_reports_status() {
        let mut guard = ChildGuard::spawn(&sh("exec sleep 10")).unwrap();
        let status = guard.kill().unwrap();
        assert!(!status.success());
        assert_eq!(guard.exit_status(), Some(status));
        // Killing again is a no-op
        assert_eq!(guard.kill().unwrap(), status);
    }

    #[test]
    fn test_describe_abbreviates_long_arguments() {
        let spec = ProcessSpec::new("tester").arg("write").arg("a".repeat(10_000));
        let described = spec.describe();
        assert!(described.starts_with("tester write aaaa"));
        assert!(described.contains("(10000 bytes)"));
        assert!(described.len() < 200);
    }

    #[test]
    fn test_captured_output_display_truncates() {
        let output = CapturedOutput {
            stdout: vec![b'x'; DISPLAY_LIMIT + 10],
            stderr: Vec::new(),
        };
        let shown = output.to_string();
        assert!(shown.contains("10 bytes omitted"));
        assert!(shown.contains("stderr: (empty)"));
    }
}
