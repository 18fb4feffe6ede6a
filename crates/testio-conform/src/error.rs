//! Top-level error type for harness operations.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::assertions::AssertionFailure;
use crate::driver::ProtocolError;
use crate::process::{CapturedOutput, ProcessError};
use crate::session::TeardownError;

/// Any failure that aborts a scenario or a session.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// An external invocation failed (spawn, nonzero exit, timeout).
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// The tester's output did not follow the result protocol.
    #[error("tester protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The two I/O paths disagreed.
    #[error(transparent)]
    Assertion(#[from] AssertionFailure),

    /// Session teardown failed.
    #[error("teardown failed: {0}")]
    Teardown(#[from] TeardownError),

    /// The filesystem server never presented a usable mount.
    #[error("mount at {} not ready after {waited:?}\n{output}", mount.display())]
    MountNotReady {
        mount: PathBuf,
        waited: Duration,
        output: CapturedOutput,
    },

    /// A configured binary or library does not exist.
    #[error("{role} not found at {}", path.display())]
    MissingArtifact { role: &'static str, path: PathBuf },

    /// An OS-level file operation failed.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl HarnessError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Short category name, used in summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Process(_) => "process",
            Self::Protocol(_) => "protocol",
            Self::Assertion(_) => "assertion",
            Self::Teardown(_) => "teardown",
            Self::MountNotReady { .. } => "not-ready",
            Self::MissingArtifact { .. } => "config",
            Self::Io { .. } => "io",
        }
    }
}
