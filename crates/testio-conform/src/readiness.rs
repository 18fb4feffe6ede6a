//! Readiness probes for a freshly launched filesystem server.
//!
//! A FUSE server presents its mount asynchronously after launch. Probing the
//! mount directory directly can block indefinitely if the server is wedged,
//! so every probe attempt runs on a helper thread with its own timeout.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// Fixed delay used by [`ReadinessProbe::Settle`] when none is given.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// How long to wait for the mount to become ready.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait between readiness checks.
pub const DEFAULT_READY_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on a single filesystem check.
pub const DEFAULT_ACCESS_TIMEOUT: Duration = Duration::from_millis(500);

/// Strategy for deciding that the server has finished mounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessProbe {
    /// Sleep for a fixed delay and assume the mount is up.
    Settle(Duration),
    /// Poll until the mount directory's device id differs from its parent's.
    DeviceChange { timeout: Duration, interval: Duration },
    /// Poll until listing the mount directory yields at least one entry.
    EntryVisible { timeout: Duration, interval: Duration },
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        Self::DeviceChange {
            timeout: DEFAULT_READY_TIMEOUT,
            interval: DEFAULT_READY_INTERVAL,
        }
    }
}

/// Outcome of waiting on a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready { waited: Duration },
    TimedOut { waited: Duration },
}

impl ReadinessProbe {
    /// Poll until the probe succeeds or its timeout elapses.
    ///
    /// `check_server` runs before every attempt (and once more after a
    /// settle delay) so a server that dies during startup is reported
    /// immediately instead of after the full timeout.
    pub fn wait<E>(
        &self,
        mount: &Path,
        mut check_server: impl FnMut() -> Result<(), E>,
    ) -> Result<Readiness, E> {
        let start = Instant::now();
        let (timeout, interval) = match *self {
            Self::Settle(delay) => {
                thread::sleep(delay);
                check_server()?;
                return Ok(Readiness::Ready {
                    waited: start.elapsed(),
                });
            }
            Self::DeviceChange { timeout, interval } | Self::EntryVisible { timeout, interval } => {
                (timeout, interval)
            }
        };

        let deadline = start + timeout;
        loop {
            check_server()?;
            if self.attempt(mount) {
                tracing::debug!("mount {} ready after {:?}", mount.display(), start.elapsed());
                return Ok(Readiness::Ready {
                    waited: start.elapsed(),
                });
            }
            if Instant::now() >= deadline {
                return Ok(Readiness::TimedOut {
                    waited: start.elapsed(),
                });
            }
            thread::sleep(interval);
        }
    }

    /// One readiness check. `Settle` has nothing to check.
    pub fn attempt(&self, mount: &Path) -> bool {
        match self {
            Self::Settle(_) => true,
            Self::DeviceChange { .. } => device_differs_from_parent(mount, DEFAULT_ACCESS_TIMEOUT),
            Self::EntryVisible { .. } => has_visible_entry(mount, DEFAULT_ACCESS_TIMEOUT),
        }
    }
}

/// Check whether `path` sits on a different device than its parent.
///
/// A FUSE mount replaces the directory's device id, so this distinguishes an
/// active mount from the bare mount point.
#[cfg(unix)]
pub fn device_differs_from_parent(path: &Path, timeout: Duration) -> bool {
    use std::os::unix::fs::MetadataExt;

    let Some(parent) = path.parent().map(Path::to_path_buf) else {
        return false;
    };
    let path = path.to_path_buf();
    with_timeout(timeout, move || {
        let parent_dev = std::fs::metadata(&parent).ok()?.dev();
        let dev = std::fs::metadata(&path).ok()?.dev();
        Some(dev != parent_dev)
    })
    .flatten()
    .unwrap_or(false)
}

#[cfg(not(unix))]
pub fn device_differs_from_parent(_path: &Path, _timeout: Duration) -> bool {
    false
}

/// Check whether listing `path` yields at least one entry.
pub fn has_visible_entry(path: &Path, timeout: Duration) -> bool {
    let path: PathBuf = path.to_path_buf();
    with_timeout(timeout, move || {
        std::fs::read_dir(&path)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    })
    .unwrap_or(false)
}

/// Run `f` on a helper thread, giving up after `timeout`.
///
/// The helper is left behind if it blocks; on a hung mount there is no way
/// to interrupt it.
fn with_timeout<T, F>(timeout: Duration, f: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(timeout).ok()
}
