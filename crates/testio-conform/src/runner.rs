//! Runs a scenario matrix against one session and collects the outcomes.

use std::time::{Duration, Instant};

use crate::config::HarnessConfig;
use crate::driver::WorkloadDriver;
use crate::error::HarnessError;
use crate::scenario::{ScenarioCase, ScenarioContext, ScenarioMatrix};
use crate::session::{MountSession, TeardownReport};

/// Result of one scenario run.
#[derive(Debug)]
pub struct ScenarioOutcome {
    pub case: ScenarioCase,
    /// Zero-based pass over the matrix.
    pub iteration: usize,
    pub elapsed: Duration,
    pub result: Result<(), HarnessError>,
}

impl ScenarioOutcome {
    pub fn passed(&self) -> bool {
        self.result.is_ok()
    }
}

/// Everything a session produced: per-scenario outcomes plus teardown.
#[derive(Debug, Default)]
pub struct SessionReport {
    pub outcomes: Vec<ScenarioOutcome>,
    pub teardown: TeardownReport,
}

impl SessionReport {
    pub fn passed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.passed()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.passed()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ScenarioOutcome> {
        self.outcomes.iter().filter(|o| !o.passed())
    }

    /// Every scenario passed and teardown was clean.
    pub fn is_success(&self) -> bool {
        self.failed() == 0 && self.teardown.is_clean()
    }
}

/// Run every case in `matrix`, `repeat` times over, sequentially.
///
/// A failing case is recorded and the run continues with the next one.
pub fn run_cases(ctx: &ScenarioContext<'_>, matrix: &ScenarioMatrix, repeat: usize) -> Vec<ScenarioOutcome> {
    let mut outcomes = Vec::new();
    if matrix.is_empty() {
        return outcomes;
    }
    for iteration in 0..repeat {
        for case in matrix {
            let start = Instant::now();
            let result = case.run(ctx);
            let elapsed = start.elapsed();
            match &result {
                Ok(()) => tracing::info!("{} ... ok ({:?})", case, elapsed),
                Err(e) => tracing::info!("{} ... FAILED ({}): {}", case, e.kind(), e),
            }
            outcomes.push(ScenarioOutcome {
                case: case.clone(),
                iteration,
                elapsed,
                result,
            });
        }
    }
    outcomes
}

/// Start a session, run the matrix against it and tear it down.
///
/// Only a failure to start the session is returned as an error; scenario
/// failures and teardown problems are both kept in the report.
pub fn run_matrix(
    config: &HarnessConfig,
    matrix: &ScenarioMatrix,
    repeat: usize,
) -> Result<SessionReport, HarnessError> {
    let driver = WorkloadDriver::from_config(config);
    let session = MountSession::start(config)?;
    tracing::info!(
        "running {} scenario(s) x{} against {}",
        matrix.len(),
        repeat,
        session.mount_path().display()
    );

    let outcomes = run_cases(&session.context(&driver), matrix, repeat);
    let teardown = session.teardown();
    for error in &teardown.errors {
        tracing::warn!("teardown: {}", error);
    }
    Ok(SessionReport { outcomes, teardown })
}
