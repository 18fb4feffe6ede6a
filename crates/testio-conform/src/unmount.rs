//! Unmount helpers for the session's mount point.
//!
//! The regular unmount goes through the configured command (by default
//! `fusermount -u` on Linux, `umount` elsewhere). When that fails, a lazy
//! unmount is attempted so a broken server cannot leave the mount behind.
//!
//! # Platform Support
//!
//! - **Linux**: `fusermount -uz`, falls back to `umount -l`
//! - **macOS**: `diskutil unmount force`, falls back to `umount -f`
//! - **Other**: `umount`

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::process::{self, ProcessError, ProcessOutput, ProcessSpec};

/// Timeout for each lazy unmount attempt.
const LAZY_UNMOUNT_TIMEOUT: Duration = Duration::from_secs(3);

#[cfg(target_os = "linux")]
const DEFAULT_UNMOUNT: &[&str] = &["fusermount", "-u"];
#[cfg(not(target_os = "linux"))]
const DEFAULT_UNMOUNT: &[&str] = &["umount"];

#[cfg(target_os = "linux")]
const LAZY_UNMOUNT: &[&[&str]] = &[&["fusermount", "-uz"], &["umount", "-l"]];
#[cfg(target_os = "macos")]
const LAZY_UNMOUNT: &[&[&str]] = &[&["diskutil", "unmount", "force"], &["umount", "-f"]];
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
const LAZY_UNMOUNT: &[&[&str]] = &[&["umount"]];

/// The platform's regular unmount command, without the mount path.
pub fn default_unmount_command() -> Vec<OsString> {
    DEFAULT_UNMOUNT.iter().map(OsString::from).collect()
}

/// Unmount `mountpoint` with `command` (program plus leading arguments).
pub fn unmount(
    command: &[OsString],
    mountpoint: &Path,
    timeout: Duration,
) -> Result<ProcessOutput, ProcessError> {
    let spec = command_spec(command, mountpoint).timeout(timeout);
    let output = process::run(&spec)?;
    tracing::debug!("unmounted {}", mountpoint.display());
    Ok(output)
}

/// Detach `mountpoint` even if it is busy.
///
/// Tries each platform fallback in turn and returns the last error if none
/// succeeds.
pub fn lazy_unmount(mountpoint: &Path) -> Result<(), ProcessError> {
    let mut last_error = None;
    for command in LAZY_UNMOUNT {
        let command: Vec<OsString> = command.iter().map(OsString::from).collect();
        match unmount(&command, mountpoint, LAZY_UNMOUNT_TIMEOUT) {
            Ok(_) => {
                tracing::debug!(
                    "lazy unmount via {} succeeded for {}",
                    command[0].to_string_lossy(),
                    mountpoint.display()
                );
                return Ok(());
            }
            Err(e) => {
                tracing::debug!("lazy unmount attempt failed: {}", e);
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| ProcessError::Spawn {
        command: format!("lazy unmount {}", mountpoint.display()),
        source: std::io::Error::other("no lazy unmount command for this platform"),
    }))
}

fn command_spec(command: &[OsString], mountpoint: &Path) -> ProcessSpec {
    let (program, leading) = command
        .split_first()
        .map_or((OsString::from("umount"), &[][..]), |(p, rest)| (p.clone(), rest));
    ProcessSpec::new(program).args(leading).arg(mountpoint)
}

/// Check whether `path` is currently a mount point in the system mount table.
///
/// Reads the mount table instead of touching the path, so it never blocks
/// on a wedged FUSE server.
#[cfg(target_os = "linux")]
pub fn is_mountpoint(path: &Path) -> bool {
    let Ok(table) = std::fs::read_to_string("/proc/self/mounts") else {
        return false;
    };
    mount_table_contains(&table, &normalize_mount_path(path))
}

/// Check whether `path` is currently a mount point in the system mount table.
#[cfg(target_os = "macos")]
pub fn is_mountpoint(path: &Path) -> bool {
    use std::process::Command;

    // macOS mount output: /dev/xxx on /path (type, options)
    let Ok(output) = Command::new("mount").output() else {
        return false;
    };
    let path = normalize_mount_path(path);
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout.lines().any(|line| {
        line.split_once(" on ")
            .and_then(|(_, rest)| rest.rsplit_once(" ("))
            .is_some_and(|(mount_point, _)| Path::new(mount_point) == path.as_path())
    })
}

/// Resolve symlinks in the directories leading to `path`, the way the mount
/// table spells them (`/var/folders/...` is `/private/var/folders/...` on
/// macOS).
///
/// Only the parent is canonicalized. The last component may be a mount
/// served by a hung FUSE server, and resolving it would block on it.
pub fn normalize_mount_path(path: &Path) -> PathBuf {
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    };
    let parent = if parent.as_os_str().is_empty() { Path::new(".") } else { parent };
    parent
        .canonicalize()
        .map_or_else(|_| path.to_path_buf(), |parent| parent.join(name))
}

/// Stub for unsupported platforms
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn is_mountpoint(_path: &Path) -> bool {
    false
}

/// Search a `/proc/mounts`-format table for an exact mount point match.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn mount_table_contains(table: &str, path: &Path) -> bool {
    table.lines().any(|line| {
        line.split_whitespace()
            .nth(1)
            .is_some_and(|field| unescape_mount_field(field) == path)
    })
}

/// Undo the octal escaping (`\040` for space etc.) used in the mount table.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn unescape_mount_field(field: &str) -> PathBuf {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStringExt;
        PathBuf::from(OsString::from_vec(out))
    }
    #[cfg(not(unix))]
    {
        PathBuf::from(String::from_utf8_lossy(&out).into_owned())
    }
}
