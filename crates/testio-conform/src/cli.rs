use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use testio_conform::config::{
    DEFAULT_FS_BIN, DEFAULT_LIBRARY, DEFAULT_TESTER_BIN, ENV_FS_BIN, ENV_LIBRARY, ENV_TESTER_BIN,
    ENV_UNMOUNT_CMD, ENV_VERBOSE_FS, ENV_VERBOSE_TESTER,
};
use testio_conform::{HarnessConfig, ReadinessProbe, ScenarioMatrix};

/// Check that the testio filesystem and a backend library agree on every read and write
#[derive(Parser, Debug)]
#[command(name = "testio-conform")]
#[command(author, version)]
#[command(after_help = "EXAMPLES:
    # Run the full matrix with the default binaries
    testio-conform

    # Only the write scenarios, three times over the same mount
    testio-conform --filter write/ --repeat 3

    # Show which scenarios a filter selects
    testio-conform --list --filter halve
")]
pub struct Cli {
    /// Filesystem server binary
    #[arg(long, value_name = "PATH", env = ENV_FS_BIN, default_value = DEFAULT_FS_BIN)]
    pub fs_bin: PathBuf,

    /// Tester binary
    #[arg(long, value_name = "PATH", env = ENV_TESTER_BIN, default_value = DEFAULT_TESTER_BIN)]
    pub tester_bin: PathBuf,

    /// Backend library handed to the tester
    #[arg(long, value_name = "PATH", env = ENV_LIBRARY, default_value = DEFAULT_LIBRARY)]
    pub lib: PathBuf,

    /// Run the filesystem server with debug logging
    #[arg(long, env = ENV_VERBOSE_FS)]
    pub verbose_fs: bool,

    /// Run the tester with debug logging
    #[arg(long, env = ENV_VERBOSE_TESTER)]
    pub verbose_tester: bool,

    /// Unmount command, run with the mount directory appended [default: platform unmount command]
    #[arg(long, value_name = "CMD", env = ENV_UNMOUNT_CMD)]
    pub unmount_cmd: Option<String>,

    /// Wait a fixed delay after launch instead of probing the mount
    #[arg(long, value_name = "MS")]
    pub settle_ms: Option<u64>,

    /// Only run scenarios whose name contains this text
    #[arg(long, value_name = "TEXT")]
    pub filter: Option<String>,

    /// Run the selected scenarios this many times against the same mount
    #[arg(long, value_name = "N", default_value_t = NonZeroUsize::MIN)]
    pub repeat: NonZeroUsize,

    /// List the selected scenarios and exit
    #[arg(long)]
    pub list: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn to_config(&self) -> HarnessConfig {
        let mut config = HarnessConfig {
            fs_bin: self.fs_bin.clone(),
            tester_bin: self.tester_bin.clone(),
            library: self.lib.clone(),
            verbose_fs: self.verbose_fs,
            verbose_tester: self.verbose_tester,
            ..HarnessConfig::default()
        };
        if let Some(command) = &self.unmount_cmd {
            config.set_unmount_command(command.as_ref());
        }
        if let Some(ms) = self.settle_ms {
            config.readiness = ReadinessProbe::Settle(Duration::from_millis(ms));
        }
        config
    }

    pub fn matrix(&self) -> ScenarioMatrix {
        let matrix = ScenarioMatrix::standard();
        match &self.filter {
            Some(pattern) => matrix.filter(pattern),
            None => matrix,
        }
    }
}
