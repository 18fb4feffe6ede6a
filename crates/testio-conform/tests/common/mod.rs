//! Shell-script stand-ins for the filesystem server, tester and unmount
//! command, so the harness can be exercised end to end without FUSE.
//!
//! The fake server populates the mount directory with the standard fixtures
//! and then waits for the fake unmount to drop a `<mount>.unmounted` marker
//! next to it. The fake tester performs reads and writes with plain file I/O
//! and prints them in the tester's result protocol.

// Not all tests use every fake
#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use testio_conform::{HarnessConfig, ReadinessProbe};

pub const SERVER: &str = r#"#!/bin/sh
mnt="$1"
staging="$mnt.staging"
mkdir "$staging" || exit 1
: > "$staging/readempty"
printf 'hello world\n' > "$staging/readregular"
printf 'x' > "$staging/readone"
i=0
while [ $i -lt 400 ]; do printf 'line %04d of a larger fixture\n' $i; i=$((i + 1)); done > "$staging/readX2"
cat "$staging/readX2" "$staging/readX2" > "$staging/readX3"
{ cat "$staging/readX3"; printf 'trailing blank lines\n\n\n'; } > "$staging/readX4"
for f in writeone writeX2 writeX3 writeX4; do : > "$staging/$f"; done
mv "$staging"/* "$mnt"/
echo "testio: serving $mnt"
while [ ! -e "$mnt.unmounted" ]; do sleep 0.05; done
echo "testio: unmounted" >&2
"#;

/// Presents the fixtures but ignores unmount requests.
pub const STUBBORN_SERVER: &str = r#"#!/bin/sh
: > "$1/readempty"
echo "testio: serving $1"
exec sleep 30
"#;

/// Never presents anything.
pub const SILENT_SERVER: &str = r#"#!/bin/sh
echo "testio: starting"
exec sleep 30
"#;

pub const FAILING_SERVER: &str = r#"#!/bin/sh
echo "testio: cannot mount $1: permission denied" >&2
exit 3
"#;

pub const TESTER: &str = r#"#!/bin/sh
lib="$1"; file="$2"; op="$3"
[ -f "$lib" ] || { echo "tester: cannot load $lib" >&2; exit 2; }
case "$op" in
read)
    size=$(wc -c < "$file") || exit 1
    size=$((size))
    case "$4" in
    --count=*)
        n="${4#--count=}"
        [ "$n" -lt "$size" ] && size=$n
        head -c "$size" "$file"
        ;;
    *)
        cat "$file"
        ;;
    esac
    printf '\n%d\n' "$size"
    ;;
write)
    printf '%s' "$4" > "$file" || exit 1
    printf '%d\n' "${#4}"
    ;;
*)
    echo "tester: unknown operation $op" >&2
    exit 2
    ;;
esac
"#;

/// Reads correctly but claims one byte more than it read.
pub const LYING_TESTER: &str = r#"#!/bin/sh
file="$2"
case "$3" in
read)
    cat "$file"
    printf '\n%d\n' $(( $(wc -c < "$file") + 1 ))
    ;;
write)
    printf '%s' "$4" > "$file"
    printf '%d\n' "${#4}"
    ;;
esac
"#;

pub const UNMOUNT: &str = r#"#!/bin/sh
touch "$1.unmounted"
"#;

/// A directory of executable fakes plus an empty backend library.
pub struct Fakes {
    dir: TempDir,
    pub library: PathBuf,
    pub unmount: PathBuf,
}

impl Fakes {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let library = dir.path().join("libfake.so");
        fs::write(&library, b"").unwrap();
        let unmount = write_script(dir.path(), "fusermount", UNMOUNT);
        Self {
            dir,
            library,
            unmount,
        }
    }

    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        write_script(self.dir.path(), name, body)
    }

    /// Config wired to the well-behaved fakes.
    pub fn config(&self) -> HarnessConfig {
        self.config_with(SERVER, TESTER)
    }

    pub fn config_with(&self, server: &str, tester: &str) -> HarnessConfig {
        HarnessConfig {
            fs_bin: self.script("testio", server),
            tester_bin: self.script("tester", tester),
            library: self.library.clone(),
            readiness: ReadinessProbe::EntryVisible {
                timeout: Duration::from_secs(5),
                interval: Duration::from_millis(20),
            },
            unmount_command: vec![self.unmount.clone().into()],
            process_timeout: Duration::from_secs(10),
            ..HarnessConfig::default()
        }
    }
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "testio_conform=debug".into()),
        )
        .with_test_writer()
        .try_init();
}
