//! Harness configuration: binary locations, verbosity, timeouts.

use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::HarnessError;
use crate::process::DEFAULT_PROCESS_TIMEOUT;
use crate::readiness::ReadinessProbe;
use crate::unmount::default_unmount_command;

/// Default filesystem server binary, relative to the working directory.
pub const DEFAULT_FS_BIN: &str = "target/debug/testio";

/// Default tester binary, relative to the working directory.
pub const DEFAULT_TESTER_BIN: &str = "target/debug/tester";

/// Default backend library under test.
pub const DEFAULT_LIBRARY: &str = "example/libexample.so";

/// How long teardown waits for the server to exit after unmounting.
pub const DEFAULT_SERVER_EXIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Environment variable the server and tester read their log filter from.
pub const LOG_ENV_VAR: &str = "RUST_LOG";

/// Environment overrides understood by [`HarnessConfig::from_env`].
pub const ENV_FS_BIN: &str = "TESTIO_FS_BIN";
pub const ENV_TESTER_BIN: &str = "TESTIO_TESTER_BIN";
pub const ENV_LIBRARY: &str = "TESTIO_LIB";
pub const ENV_VERBOSE_FS: &str = "TESTIO_VERBOSE_FS";
pub const ENV_VERBOSE_TESTER: &str = "TESTIO_VERBOSE_TESTER";
pub const ENV_UNMOUNT_CMD: &str = "TESTIO_UNMOUNT_CMD";

/// Everything needed to start a session and drive the tester.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Filesystem server binary, launched as `fs_bin <mount_dir>`.
    pub fs_bin: PathBuf,
    /// Tester binary.
    pub tester_bin: PathBuf,
    /// Backend library handed to the tester.
    pub library: PathBuf,
    /// Run the server with debug logging.
    pub verbose_fs: bool,
    /// Run the tester with debug logging.
    pub verbose_tester: bool,
    /// Timeout for each tester invocation.
    pub process_timeout: Duration,
    /// Timeout for the unmount command.
    pub unmount_timeout: Duration,
    /// Bounded wait for the server to exit after unmount.
    pub server_exit_timeout: Duration,
    /// How to decide the server has finished mounting.
    pub readiness: ReadinessProbe,
    /// Unmount program and leading arguments; the mount path is appended.
    pub unmount_command: Vec<OsString>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            fs_bin: PathBuf::from(DEFAULT_FS_BIN),
            tester_bin: PathBuf::from(DEFAULT_TESTER_BIN),
            library: PathBuf::from(DEFAULT_LIBRARY),
            verbose_fs: false,
            verbose_tester: false,
            process_timeout: DEFAULT_PROCESS_TIMEOUT,
            unmount_timeout: DEFAULT_PROCESS_TIMEOUT,
            server_exit_timeout: DEFAULT_SERVER_EXIT_TIMEOUT,
            readiness: ReadinessProbe::default(),
            unmount_command: default_unmount_command(),
        }
    }
}

impl HarnessConfig {
    /// Defaults with `TESTIO_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var_os(key));
        config
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<OsString>) {
        if let Some(path) = lookup(ENV_FS_BIN) {
            self.fs_bin = path.into();
        }
        if let Some(path) = lookup(ENV_TESTER_BIN) {
            self.tester_bin = path.into();
        }
        if let Some(path) = lookup(ENV_LIBRARY) {
            self.library = path.into();
        }
        if let Some(flag) = lookup(ENV_VERBOSE_FS) {
            self.verbose_fs = is_truthy(&flag);
        }
        if let Some(flag) = lookup(ENV_VERBOSE_TESTER) {
            self.verbose_tester = is_truthy(&flag);
        }
        if let Some(command) = lookup(ENV_UNMOUNT_CMD) {
            self.set_unmount_command(&command);
        }
    }

    /// Replace the unmount command with a whitespace-separated command line.
    /// A blank command line keeps the current one.
    pub fn set_unmount_command(&mut self, command: &OsStr) {
        let parts: Vec<OsString> = command
            .to_string_lossy()
            .split_whitespace()
            .map(OsString::from)
            .collect();
        if !parts.is_empty() {
            self.unmount_command = parts;
        }
    }

    /// Environment overlay for the filesystem server.
    pub fn server_env(&self) -> Vec<(OsString, OsString)> {
        verbosity_env(self.verbose_fs)
    }

    /// Environment overlay for the tester.
    pub fn tester_env(&self) -> Vec<(OsString, OsString)> {
        verbosity_env(self.verbose_tester)
    }

    /// Check that the server, tester and library all exist.
    pub fn validate(&self) -> Result<(), HarnessError> {
        for (role, path) in [
            ("filesystem server binary", &self.fs_bin),
            ("tester binary", &self.tester_bin),
            ("backend library", &self.library),
        ] {
            if !path.is_file() {
                return Err(HarnessError::MissingArtifact {
                    role,
                    path: path.clone(),
                });
            }
        }
        Ok(())
    }
}

fn verbosity_env(verbose: bool) -> Vec<(OsString, OsString)> {
    if verbose {
        vec![(LOG_ENV_VAR.into(), "debug".into())]
    } else {
        Vec::new()
    }
}

fn is_truthy(value: &OsStr) -> bool {
    matches!(
        value.to_string_lossy().trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
