//! Parameterized read/write scenarios run against a live mount.
//!
//! Each scenario issues one OS-level operation and one tester operation
//! against the same fixture and checks that both paths agree. Fixtures are
//! supplied by the filesystem server; their names encode identity and size
//! class (`readempty`, `readregular`, `readX3`, `writeone`, ...).

use std::fmt;
use std::path::{Path, PathBuf};

use crate::assertions::{assert_read_agrees, assert_write_agrees, os_read, os_size, truncate_to_empty};
use crate::driver::WorkloadDriver;
use crate::error::HarnessError;
use crate::payload::write_payload;

/// Read-only fixtures every server presents.
pub const READ_FIXTURES: &[&str] = &["readempty", "readregular", "readone", "readX2", "readX3", "readX4"];

/// Empty, writable fixtures every server presents.
pub const WRITE_FIXTURES: &[&str] = &["writeone", "writeX2", "writeX3", "writeX4"];

/// Derives a bounded read count from a fixture's size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeModifier {
    /// `min(size, n)`
    AtMost(u64),
    /// `size + n`, past the end of the file
    Plus(u64),
    /// `size / 2`
    Halve,
}

impl SizeModifier {
    /// Modifiers in the standard matrix.
    pub const DEFAULTS: [Self; 3] = [Self::AtMost(5000), Self::Plus(1000), Self::Halve];

    pub fn apply(self, size: u64) -> u64 {
        match self {
            Self::AtMost(limit) => size.min(limit),
            Self::Plus(extra) => size.saturating_add(extra),
            Self::Halve => size / 2,
        }
    }
}

impl fmt::Display for SizeModifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AtMost(limit) => write!(f, "at-most-{limit}"),
            Self::Plus(extra) => write!(f, "plus-{extra}"),
            Self::Halve => f.write_str("halve"),
        }
    }
}

/// What a scenario needs from the session: where the mount is and how to
/// reach the tester. Borrowed, so no scenario can outlive the session.
#[derive(Debug, Clone, Copy)]
pub struct ScenarioContext<'a> {
    pub mount: &'a Path,
    pub driver: &'a WorkloadDriver,
}

impl ScenarioContext<'_> {
    pub fn fixture_path(&self, fixture: &str) -> PathBuf {
        self.mount.join(fixture)
    }
}

/// One differential check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScenarioCase {
    /// Read `fixture` through both paths, bounded by `modifier` if given.
    Read {
        fixture: String,
        modifier: Option<SizeModifier>,
    },
    /// Write a fresh random payload to `fixture` and read it back.
    Write { fixture: String },
}

impl ScenarioCase {
    pub fn read(fixture: impl Into<String>, modifier: Option<SizeModifier>) -> Self {
        Self::Read {
            fixture: fixture.into(),
            modifier,
        }
    }

    pub fn write(fixture: impl Into<String>) -> Self {
        Self::Write {
            fixture: fixture.into(),
        }
    }

    pub fn fixture(&self) -> &str {
        match self {
            Self::Read { fixture, .. } | Self::Write { fixture } => fixture,
        }
    }

    /// Stable name such as `read/readX3/halve` or `write/writeone`.
    pub fn name(&self) -> String {
        self.to_string()
    }

    /// Run the scenario. Errors abort only this case.
    pub fn run(&self, ctx: &ScenarioContext<'_>) -> Result<(), HarnessError> {
        let name = self.name();
        let path = ctx.fixture_path(self.fixture());
        match self {
            Self::Read { modifier, .. } => run_read(ctx, &path, *modifier, &name),
            Self::Write { .. } => run_write(ctx, &path, &name),
        }
    }
}

impl fmt::Display for ScenarioCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read {
                fixture,
                modifier: Some(modifier),
            } => write!(f, "read/{fixture}/{modifier}"),
            Self::Read { fixture, modifier: None } => write!(f, "read/{fixture}/full"),
            Self::Write { fixture } => write!(f, "write/{fixture}"),
        }
    }
}

fn run_read(
    ctx: &ScenarioContext<'_>,
    path: &Path,
    modifier: Option<SizeModifier>,
    name: &str,
) -> Result<(), HarnessError> {
    let count = match modifier {
        Some(modifier) => Some(modifier.apply(os_size(path)?)),
        None => None,
    };
    let expected = os_read(path, count)?;
    let report = ctx.driver.perform_read(path, count)?;
    tracing::debug!(
        "{}: requested {:?}, os read {} bytes, tester reported {}",
        name,
        count,
        expected.len(),
        report.reported_len
    );
    assert_read_agrees(&report, &expected, name)?;
    Ok(())
}

fn run_write(ctx: &ScenarioContext<'_>, path: &Path, name: &str) -> Result<(), HarnessError> {
    let payload = write_payload();
    let written = ctx.driver.perform_write(path, &payload);
    let observed = os_read(path, None);

    // Reset the fixture whatever happened above so the next run starts empty.
    let reset = truncate_to_empty(path);
    if let Err(e) = &reset {
        tracing::warn!("{}: failed to reset fixture: {}", name, e);
    }

    let report = written?;
    let observed = observed?;
    assert_write_agrees(report.reported_len, &payload, &observed, name)?;
    reset
}

/// Ordered set of scenarios for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioMatrix {
    cases: Vec<ScenarioCase>,
}

impl ScenarioMatrix {
    /// Every read fixture with no modifier and each default modifier, then
    /// every write fixture.
    pub fn standard() -> Self {
        let reads = READ_FIXTURES.iter().flat_map(|fixture| {
            std::iter::once(None)
                .chain(SizeModifier::DEFAULTS.into_iter().map(Some))
                .map(move |modifier| ScenarioCase::read(*fixture, modifier))
        });
        let writes = WRITE_FIXTURES.iter().map(|fixture| ScenarioCase::write(*fixture));
        Self {
            cases: reads.chain(writes).collect(),
        }
    }

    pub fn from_cases(cases: Vec<ScenarioCase>) -> Self {
        Self { cases }
    }

    /// Keep only cases whose name contains `pattern`.
    #[must_use]
    pub fn filter(mut self, pattern: &str) -> Self {
        self.cases.retain(|case| case.name().contains(pattern));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScenarioCase> {
        self.cases.iter()
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

impl Default for ScenarioMatrix {
    fn default() -> Self {
        Self::standard()
    }
}

impl<'a> IntoIterator for &'a ScenarioMatrix {
    type Item = &'a ScenarioCase;
    type IntoIter = std::slice::Iter<'a, ScenarioCase>;

    fn into_iter(self) -> Self::IntoIter {
        self.cases.iter()
    }
}
