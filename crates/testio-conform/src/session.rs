//! Mount lifecycle: one filesystem server on one temporary mount point.
//!
//! A [`MountSession`] walks `Unstarted → Mounting → Ready → Unmounting →
//! Terminated`. It is started once per run because launching the server is
//! expensive; scenarios borrow its mount path through a
//! [`ScenarioContext`] and never touch the lifecycle themselves.
//!
//! Teardown always runs to completion. Each problem it meets (unmount
//! failure, a server that will not exit, a directory that cannot be removed)
//! is recorded in the [`TeardownReport`] rather than aborting the rest.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use tempfile::TempDir;

use crate::config::HarnessConfig;
use crate::driver::WorkloadDriver;
use crate::error::HarnessError;
use crate::process::{CapturedOutput, ChildGuard, ProcessError, ProcessSpec};
use crate::readiness::Readiness;
use crate::scenario::ScenarioContext;
use crate::unmount::{is_mountpoint, lazy_unmount, unmount};

/// Name of the mount directory inside the session's temporary directory.
pub const MOUNT_DIR_NAME: &str = "testfs";

/// Lifecycle position of a [`MountSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Unstarted,
    Mounting,
    Ready,
    Unmounting,
    Terminated,
}

/// A problem met while tearing a session down.
#[derive(Debug, thiserror::Error)]
pub enum TeardownError {
    #[error("failed to unmount {}: {source}", path.display())]
    Unmount {
        path: PathBuf,
        #[source]
        source: ProcessError,
    },

    #[error("server did not exit within {timeout:?} of unmount and was killed")]
    ServerWaitTimeout { timeout: Duration },

    #[error("failed to reap server: {0}")]
    Wait(#[source] io::Error),

    #[error("{} is still mounted, temporary directory left in place", path.display())]
    StillMounted { path: PathBuf },

    #[error("failed to remove {}: {source}", path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Everything teardown observed.
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Server stdout/stderr, collected in every case.
    pub output: CapturedOutput,
    /// Server exit status, if it was reaped.
    pub exit_status: Option<ExitStatus>,
    /// Problems in the order they occurred.
    pub errors: Vec<TeardownError>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// The first recorded error, if any; otherwise the server output.
    pub fn into_result(self) -> Result<CapturedOutput, TeardownError> {
        match self.errors.into_iter().next() {
            Some(error) => Err(error),
            None => Ok(self.output),
        }
    }
}

/// A running filesystem server and the temporary mount point it serves.
///
/// Dropping a session that was never torn down lazily unmounts it and kills
/// the server.
#[derive(Debug)]
pub struct MountSession {
    state: MountState,
    temp_dir: Option<TempDir>,
    mount_path: PathBuf,
    server: Option<ChildGuard>,
    env: Vec<(OsString, OsString)>,
    unmount_command: Vec<OsString>,
    unmount_timeout: Duration,
    exit_timeout: Duration,
}

impl MountSession {
    /// Create a temporary mount point, launch the server on it and wait
    /// until the configured readiness probe succeeds.
    pub fn start(config: &HarnessConfig) -> Result<Self, HarnessError> {
        let temp_dir = tempfile::Builder::new()
            .prefix("testio-")
            .tempdir()
            .map_err(|e| HarnessError::io("create temporary directory", e))?;
        // The mount table lists resolved paths; resolve ours before anything is mounted.
        let base = temp_dir
            .path()
            .canonicalize()
            .map_err(|e| HarnessError::io(format!("resolve {}", temp_dir.path().display()), e))?;
        let mount_path = base.join(MOUNT_DIR_NAME);
        fs::create_dir(&mount_path)
            .map_err(|e| HarnessError::io(format!("create {}", mount_path.display()), e))?;

        let env = config.server_env();
        // Spawned, not run: the server lives until teardown.
        let spec = ProcessSpec::new(&config.fs_bin)
            .arg(&mount_path)
            .envs(env.iter().map(|(k, v)| (k, v)));

        let mut session = Self {
            state: MountState::Unstarted,
            temp_dir: Some(temp_dir),
            mount_path: mount_path.clone(),
            server: None,
            env,
            unmount_command: config.unmount_command.clone(),
            unmount_timeout: config.unmount_timeout,
            exit_timeout: config.server_exit_timeout,
        };

        session.state = MountState::Mounting;
        let server = ChildGuard::spawn(&spec)?;
        tracing::info!(
            "launched {} (pid {}) on {}",
            config.fs_bin.display(),
            server.id(),
            mount_path.display()
        );
        session.server = Some(server);

        match config.readiness.wait(&mount_path, || session.check_server())? {
            Readiness::Ready { waited } => {
                session.check_server()?;
                tracing::info!("mount {} ready after {:?}", mount_path.display(), waited);
                session.state = MountState::Ready;
                Ok(session)
            }
            Readiness::TimedOut { waited } => {
                tracing::warn!("mount {} not ready after {:?}", mount_path.display(), waited);
                let output = session.abort();
                Err(HarnessError::MountNotReady {
                    mount: mount_path,
                    waited,
                    output,
                })
            }
        }
    }

    pub fn state(&self) -> MountState {
        self.state
    }

    pub fn mount_path(&self) -> &Path {
        &self.mount_path
    }

    pub fn server_pid(&self) -> Option<u32> {
        self.server.as_ref().map(ChildGuard::id)
    }

    /// Environment overlay the server was launched with.
    pub fn env(&self) -> &[(OsString, OsString)] {
        &self.env
    }

    /// Hand the mount to scenarios.
    pub fn context<'a>(&'a self, driver: &'a WorkloadDriver) -> ScenarioContext<'a> {
        ScenarioContext {
            mount: &self.mount_path,
            driver,
        }
    }

    /// Fail if the server has already exited.
    pub fn check_server(&mut self) -> Result<(), HarnessError> {
        let Some(server) = self.server.as_mut() else {
            return Ok(());
        };
        match server.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => Err(ProcessError::Exited {
                command: server.command().to_string(),
                status,
                output: server.take_output(),
            }
            .into()),
            Err(source) => Err(ProcessError::Wait {
                command: server.command().to_string(),
                source,
            }
            .into()),
        }
    }

    /// Unmount, reap the server, collect its output and remove the
    /// temporary directory.
    pub fn teardown(mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        self.state = MountState::Unmounting;
        tracing::info!("unmounting {}", self.mount_path.display());

        if let Err(source) = unmount(&self.unmount_command, &self.mount_path, self.unmount_timeout) {
            tracing::warn!("unmount of {} failed: {}", self.mount_path.display(), source);
            report.errors.push(TeardownError::Unmount {
                path: self.mount_path.clone(),
                source,
            });
            if is_mountpoint(&self.mount_path)
                && let Err(e) = lazy_unmount(&self.mount_path)
            {
                tracing::warn!("lazy unmount of {} failed: {}", self.mount_path.display(), e);
            }
        }

        if let Some(mut server) = self.server.take() {
            match server.wait_timeout(self.exit_timeout) {
                Ok(Some(status)) => report.exit_status = Some(status),
                Ok(None) => {
                    tracing::warn!(
                        "server still running {:?} after unmount, killing",
                        self.exit_timeout
                    );
                    report.errors.push(TeardownError::ServerWaitTimeout {
                        timeout: self.exit_timeout,
                    });
                    match server.kill() {
                        Ok(status) => report.exit_status = Some(status),
                        Err(e) => report.errors.push(TeardownError::Wait(e)),
                    }
                }
                Err(e) => {
                    report.errors.push(TeardownError::Wait(e));
                    report.exit_status = server.kill().ok();
                }
            }
            report.output = server.take_output();
        }
        self.state = MountState::Terminated;

        if let Err(e) = self.remove_temp_dir() {
            report.errors.push(e);
        }
        if report.is_clean() {
            tracing::info!("session on {} torn down cleanly", self.mount_path.display());
        }
        report
    }

    /// Best-effort shutdown for failed starts and dropped sessions.
    fn abort(&mut self) -> CapturedOutput {
        if self.state == MountState::Terminated {
            return CapturedOutput::default();
        }
        self.state = MountState::Unmounting;
        if is_mountpoint(&self.mount_path)
            && let Err(e) = lazy_unmount(&self.mount_path)
        {
            tracing::warn!("lazy unmount of {} failed: {}", self.mount_path.display(), e);
        }
        let output = match self.server.take() {
            Some(mut server) => {
                if let Err(e) = server.kill() {
                    tracing::warn!("failed to kill server: {}", e);
                }
                server.take_output()
            }
            None => CapturedOutput::default(),
        };
        self.state = MountState::Terminated;
        if let Err(e) = self.remove_temp_dir() {
            tracing::warn!("{}", e);
        }
        output
    }

    /// Remove the temporary directory unless something is still mounted in it.
    fn remove_temp_dir(&mut self) -> Result<(), TeardownError> {
        let Some(temp_dir) = self.temp_dir.take() else {
            return Ok(());
        };
        if is_mountpoint(&self.mount_path) {
            let kept = temp_dir.keep();
            tracing::warn!("{} still mounted, leaving {}", self.mount_path.display(), kept.display());
            return Err(TeardownError::StillMounted {
                path: self.mount_path.clone(),
            });
        }
        let path = temp_dir.path().to_path_buf();
        temp_dir
            .close()
            .map_err(|source| TeardownError::Cleanup { path, source })
    }
}

impl Drop for MountSession {
    fn drop(&mut self) {
        if self.state != MountState::Terminated {
            tracing::debug!("session on {} dropped without teardown", self.mount_path.display());
            self.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readiness::ReadinessProbe;

    fn config(fs_bin: &str) -> HarnessConfig {
        HarnessConfig {
            fs_bin: PathBuf::from(fs_bin),
            readiness: ReadinessProbe::EntryVisible {
                timeout: Duration::from_millis(300),
                interval: Duration::from_millis(20),
            },
            ..HarnessConfig::default()
        }
    }

    #[test]
    fn test_server_exiting_early_fails_start() {
        let err = MountSession::start(&config("false")).unwrap_err();
        match err {
            HarnessError::Process(ProcessError::Exited { command, status, .. }) => {
                assert!(command.starts_with("false "), "command: {command}");
                assert!(!status.success());
            }
            other => panic!("expected Exited, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_server_binary_fails_start() {
        let err = MountSession::start(&config("/nonexistent/testio")).unwrap_err();
        assert!(
            matches!(err, HarnessError::Process(ProcessError::Spawn { .. })),
            "got {err:?}"
        );
    }

    #[test]
    fn test_settle_after_early_exit_reports_exit() {
        let config = HarnessConfig {
            readiness: ReadinessProbe::Settle(Duration::from_millis(100)),
            ..config("true")
        };
        let err = MountSession::start(&config).unwrap_err();
        assert!(
            matches!(err, HarnessError::Process(ProcessError::Exited { .. })),
            "got {err:?}"
        );
    }

    #[test]
    fn test_teardown_report_into_result() {
        let clean = TeardownReport::default();
        assert!(clean.is_clean());
        assert!(clean.into_result().is_ok());

        let report = TeardownReport {
            errors: vec![
                TeardownError::ServerWaitTimeout {
                    timeout: Duration::from_secs(3),
                },
                TeardownError::StillMounted {
                    path: PathBuf::from("/tmp/x/testfs"),
                },
            ],
            ..TeardownReport::default()
        };
        assert!(!report.is_clean());
        assert!(matches!(
            report.into_result(),
            Err(TeardownError::ServerWaitTimeout { .. })
        ));
    }

    #[test]
    fn test_teardown_error_messages() {
        let err = TeardownError::StillMounted {
            path: PathBuf::from("/tmp/x/testfs"),
        };
        assert_eq!(
            err.to_string(),
            "/tmp/x/testfs is still mounted, temporary directory left in place"
        );
    }
}
