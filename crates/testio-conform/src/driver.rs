//! Workload driver for the tester process.
//!
//! The tester performs one read or write through the backend library and
//! reports the result on stdout:
//!
//! - `read`: the bytes read, then a final line holding the byte count the
//!   library returned;
//! - `write`: a single line holding the byte count the library returned.
//!
//! The last line of a read is a length sentinel, so the data itself may
//! contain newlines. Parsing strips the single trailing newline and splits at
//! the last remaining one; everything before it is the data verbatim.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::HarnessConfig;
use crate::error::HarnessError;
use crate::process::{self, DEFAULT_PROCESS_TIMEOUT, ProcessOutput, ProcessSpec};

/// One operation the tester can perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Read the file, optionally bounded to `count` bytes.
    Read { count: Option<u64> },
    /// Write `payload` to the file.
    Write { payload: String },
}

/// A single tester run. Built per call and never reused.
#[derive(Debug, Clone)]
pub struct TesterInvocation<'a> {
    pub library: &'a Path,
    pub target: &'a Path,
    pub operation: Operation,
}

impl TesterInvocation<'_> {
    /// Argument vector passed to the tester binary.
    pub fn args(&self) -> Result<Vec<OsString>, ProtocolError> {
        let mut args = vec![
            self.library.as_os_str().to_os_string(),
            self.target.as_os_str().to_os_string(),
        ];
        match &self.operation {
            Operation::Read { count } => {
                args.push("read".into());
                if let Some(count) = count {
                    args.push(format!("--count={count}").into());
                }
            }
            Operation::Write { payload } => {
                if let Some(offset) = payload.bytes().position(|b| b == 0) {
                    return Err(ProtocolError::NulInPayload { offset });
                }
                args.push("write".into());
                args.push(payload.into());
            }
        }
        Ok(args)
    }
}

/// Parsed result of a `read` run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReport {
    /// Bytes the tester printed before the length line.
    pub data: Vec<u8>,
    /// Length the backend library reported (negative on library failure).
    pub reported_len: i64,
}

/// Parsed result of a `write` run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReport {
    pub reported_len: i64,
}

/// Parsed result of any tester run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TesterResult {
    Read(ReadReport),
    Write(WriteReport),
}

/// The tester's stdout did not follow the result protocol.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("tester produced no output")]
    EmptyOutput,

    #[error("length line {line:?} is not a decimal integer")]
    InvalidLength { line: String },

    #[error("write payload contains a NUL byte at offset {offset}")]
    NulInPayload { offset: usize },
}

/// Parse the stdout of a `read` run.
pub fn parse_read_output(stdout: &[u8]) -> Result<ReadReport, ProtocolError> {
    if stdout.is_empty() {
        return Err(ProtocolError::EmptyOutput);
    }
    let body = stdout.strip_suffix(b"\n").unwrap_or(stdout);
    let (data, length_line) = match body.iter().rposition(|&b| b == b'\n') {
        Some(split) => (&body[..split], &body[split + 1..]),
        None => (&body[..0], body),
    };
    Ok(ReadReport {
        data: data.to_vec(),
        reported_len: parse_length(length_line)?,
    })
}

/// Parse the stdout of a `write` run.
pub fn parse_write_output(stdout: &[u8]) -> Result<WriteReport, ProtocolError> {
    if stdout.is_empty() {
        return Err(ProtocolError::EmptyOutput);
    }
    Ok(WriteReport {
        reported_len: parse_length(stdout)?,
    })
}

fn parse_length(line: &[u8]) -> Result<i64, ProtocolError> {
    let text = String::from_utf8_lossy(line);
    text.trim()
        .parse::<i64>()
        .map_err(|_| ProtocolError::InvalidLength {
            line: text.into_owned(),
        })
}

/// Runs the tester binary against a fixed backend library.
#[derive(Debug, Clone)]
pub struct WorkloadDriver {
    tester: PathBuf,
    library: PathBuf,
    env: Vec<(OsString, OsString)>,
    timeout: Duration,
}

impl WorkloadDriver {
    pub fn new(tester: impl Into<PathBuf>, library: impl Into<PathBuf>) -> Self {
        Self {
            tester: tester.into(),
            library: library.into(),
            env: Vec::new(),
            timeout: DEFAULT_PROCESS_TIMEOUT,
        }
    }

    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(&config.tester_bin, &config.library)
            .with_env(config.tester_env())
            .with_timeout(config.process_timeout)
    }

    #[must_use]
    pub fn with_env(mut self, env: Vec<(OsString, OsString)>) -> Self {
        self.env = env;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn library(&self) -> &Path {
        &self.library
    }

    pub fn tester(&self) -> &Path {
        &self.tester
    }

    /// Read `target` through the backend library.
    pub fn perform_read(&self, target: &Path, count: Option<u64>) -> Result<ReadReport, HarnessError> {
        let output = self.execute(&self.invocation(target, Operation::Read { count }))?;
        let report = parse_read_output(&output.output.stdout)?;
        tracing::debug!(
            "tester read {}: {} bytes printed, {} reported",
            target.display(),
            report.data.len(),
            report.reported_len
        );
        Ok(report)
    }

    /// Write `payload` to `target` through the backend library.
    pub fn perform_write(&self, target: &Path, payload: &str) -> Result<WriteReport, HarnessError> {
        let operation = Operation::Write {
            payload: payload.to_string(),
        };
        let output = self.execute(&self.invocation(target, operation))?;
        let report = parse_write_output(&output.output.stdout)?;
        tracing::debug!(
            "tester write {}: {} bytes sent, {} reported",
            target.display(),
            payload.len(),
            report.reported_len
        );
        Ok(report)
    }

    /// Run an arbitrary invocation and parse its result.
    pub fn invoke(&self, invocation: &TesterInvocation<'_>) -> Result<TesterResult, HarnessError> {
        let output = self.execute(invocation)?;
        let stdout = &output.output.stdout;
        Ok(match invocation.operation {
            Operation::Read { .. } => TesterResult::Read(parse_read_output(stdout)?),
            Operation::Write { .. } => TesterResult::Write(parse_write_output(stdout)?),
        })
    }

    fn invocation<'a>(&'a self, target: &'a Path, operation: Operation) -> TesterInvocation<'a> {
        TesterInvocation {
            library: &self.library,
            target,
            operation,
        }
    }

    fn execute(&self, invocation: &TesterInvocation<'_>) -> Result<ProcessOutput, HarnessError> {
        let spec = ProcessSpec::new(&self.tester)
            .args(invocation.args()?)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .timeout(self.timeout);
        Ok(process::run(&spec)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessError;

    fn invocation(operation: Operation) -> TesterInvocation<'static> {
        TesterInvocation {
            library: Path::new("/lib/libexample.so"),
            target: Path::new("/mnt/testfs/readregular"),
            operation,
        }
    }

    #[test]
    fn test_read_args_unbounded() {
        let args = invocation(Operation::Read { count: None }).args().unwrap();
        assert_eq!(args, ["/lib/libexample.so", "/mnt/testfs/readregular", "read"]);
    }

    #[test]
    fn test_read_args_with_count() {
        let args = invocation(Operation::Read { count: Some(5000) }).args().unwrap();
        assert_eq!(
            args,
            ["/lib/libexample.so", "/mnt/testfs/readregular", "read", "--count=5000"]
        );
    }

    #[test]
    fn test_read_args_with_zero_count() {
        let args = invocation(Operation::Read { count: Some(0) }).args().unwrap();
        assert_eq!(args.last().unwrap(), "--count=0");
    }

    #[test]
    fn test_write_args_carry_payload() {
        let args = invocation(Operation::Write {
            payload: "abcXYZ".to_string(),
        })
        .args()
        .unwrap();
        assert_eq!(
            args,
            ["/lib/libexample.so", "/mnt/testfs/readregular", "write", "abcXYZ"]
        );
    }

    #[test]
    fn test_write_args_reject_nul() {
        let err = invocation(Operation::Write {
            payload: "ab\0c".to_string(),
        })
        .args()
        .unwrap_err();
        assert_eq!(err, ProtocolError::NulInPayload { offset: 2 });
    }

    #[test]
    fn test_parse_read_simple() {
        let report = parse_read_output(b"hello\n5\n").unwrap();
        assert_eq!(report.data, b"hello");
        assert_eq!(report.reported_len, 5);
    }

    #[test]
    fn test_parse_read_preserves_embedded_newlines() {
        let report = parse_read_output(b"line one\nline two\n\n\n19\n").unwrap();
        assert_eq!(report.data, b"line one\nline two\n\n");
        assert_eq!(report.reported_len, 19);
    }

    #[test]
    fn test_parse_read_empty_data() {
        // The tester prints an empty data line followed by the length
        let report = parse_read_output(b"\n0\n").unwrap();
        assert!(report.data.is_empty());
        assert_eq!(report.reported_len, 0);
    }

    #[test]
    fn test_parse_read_length_only() {
        let report = parse_read_output(b"0").unwrap();
        assert!(report.data.is_empty());
        assert_eq!(report.reported_len, 0);
    }

    #[test]
    fn test_parse_read_negative_length() {
        let report = parse_read_output(b"\n-1\n").unwrap();
        assert_eq!(report.reported_len, -1);
    }

    #[test]
    fn test_parse_read_binary_data() {
        let mut stdout = vec![0u8, 1, 2, 0xff, b'\r'];
        stdout.extend_from_slice(b"\n5\n");
        let report = parse_read_output(&stdout).unwrap();
        assert_eq!(report.data, [0u8, 1, 2, 0xff, b'\r']);
    }

    #[test]
    fn test_parse_read_invalid_length() {
        let err = parse_read_output(b"data\nnot-a-number\n").unwrap_err();
        assert_eq!(
            err,
            ProtocolError::InvalidLength {
                line: "not-a-number".to_string()
            }
        );
    }

    #[test]
    fn test_parse_read_empty_output() {
        assert_eq!(parse_read_output(b"").unwrap_err(), ProtocolError::EmptyOutput);
    }

    #[test]
    fn test_parse_write() {
        assert_eq!(parse_write_output(b"10000\n").unwrap().reported_len, 10_000);
        assert_eq!(parse_write_output(b"  42 \r\n").unwrap().reported_len, 42);
        assert!(matches!(
            parse_write_output(b"10000\nextra\n"),
            Err(ProtocolError::InvalidLength { .. })
        ));
        assert_eq!(parse_write_output(b"").unwrap_err(), ProtocolError::EmptyOutput);
    }

    #[test]
    fn test_driver_missing_tester_is_process_error() {
        let driver = WorkloadDriver::new("/nonexistent/tester", "/nonexistent/lib.so");
        let err = driver
            .perform_read(Path::new("/tmp/whatever"), None)
            .unwrap_err();
        assert!(matches!(err, HarnessError::Process(_)), "got {err:?}");
    }

    #[test]
    fn test_driver_runs_tester_and_parses_output() {
        // `sh <script> <target> <op> ...`: the "library" is the script itself
        let temp = tempfile::TempDir::new().unwrap();
        let script = temp.path().join("lib.sh");
        std::fs::write(
            &script,
            "case \"$2\" in read) printf 'a\\nb\\n\\n3\\n' ;; write) printf '%d\\n' \"${#3}\" ;; esac\n",
        )
        .unwrap();
        let driver = WorkloadDriver::new("sh", &script).with_env(vec![("RUST_LOG".into(), "debug".into())]);
        assert_eq!(driver.library(), script.as_path());
        assert_eq!(driver.tester(), Path::new("sh"));

        let read = driver.perform_read(Path::new("/mnt/testfs/readone"), None).unwrap();
        assert_eq!(read.data, b"a\nb\n");
        assert_eq!(read.reported_len, 3);

        let invocation = TesterInvocation {
            library: &script,
            target: Path::new("/mnt/testfs/writeone"),
            operation: Operation::Write {
                payload: "abcde".to_string(),
            },
        };
        assert_eq!(
            driver.invoke(&invocation).unwrap(),
            TesterResult::Write(WriteReport { reported_len: 5 })
        );
    }

    #[test]
    fn test_driver_nonzero_exit_is_process_error() {
        let driver = WorkloadDriver::new("false", "/lib/libexample.so");
        let err = driver
            .perform_write(Path::new("/tmp/whatever"), "abc")
            .unwrap_err();
        assert!(
            matches!(err, HarnessError::Process(ProcessError::NonZeroExit { .. })),
            "got {err:?}"
        );
    }

    #[test]
    fn test_driver_rejects_nul_before_spawning() {
        let driver = WorkloadDriver::new("/nonexistent/tester", "/nonexistent/lib.so");
        let err = driver
            .perform_write(Path::new("/tmp/whatever"), "a\0b")
            .unwrap_err();
        assert!(matches!(err, HarnessError::Protocol(_)), "got {err:?}");
    }
}
