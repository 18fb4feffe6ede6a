//! Human-readable rendering of a [`SessionReport`].

use std::fmt::Write as _;
use std::time::Duration;

use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Color, Table};

use crate::runner::{ScenarioOutcome, SessionReport};

/// Create a styled table for output
pub fn create_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS);
    table
}

/// One row per scenario run.
pub fn outcome_table(report: &SessionReport) -> Table {
    let repeated = report.outcomes.iter().any(|o| o.iteration > 0);
    let mut table = create_table();
    let mut header = vec!["Scenario"];
    if repeated {
        header.push("Run");
    }
    header.extend(["Result", "Time", "Failure"]);
    table.set_header(header);

    for outcome in &report.outcomes {
        let mut row = vec![Cell::new(outcome.case.name())];
        if repeated {
            row.push(Cell::new(outcome.iteration + 1));
        }
        row.push(result_cell(outcome));
        row.push(Cell::new(format_elapsed(outcome.elapsed)));
        row.push(Cell::new(
            outcome.result.as_ref().err().map_or("", |e| e.kind()),
        ));
        table.add_row(row);
    }
    table
}

fn result_cell(outcome: &ScenarioOutcome) -> Cell {
    if outcome.passed() {
        Cell::new("PASS").fg(Color::Green)
    } else {
        Cell::new("FAIL").fg(Color::Red)
    }
}

/// Full error text of every failed scenario, then teardown problems.
pub fn failure_details(report: &SessionReport) -> String {
    let mut out = String::new();
    for outcome in report.failures() {
        if let Err(e) = &outcome.result {
            let _ = writeln!(out, "---- {} ----\n{}\n", outcome.case, e);
        }
    }
    for error in &report.teardown.errors {
        let _ = writeln!(out, "---- teardown ----\n{error}\n");
    }
    out
}

/// One-line summary, e.g. `27 passed; 1 failed; teardown clean`.
pub fn summary_line(report: &SessionReport) -> String {
    let teardown = match report.teardown.errors.len() {
        0 => "teardown clean".to_string(),
        1 => "1 teardown error".to_string(),
        n => format!("{n} teardown errors"),
    };
    format!(
        "{} passed; {} failed; {}",
        report.passed(),
        report.failed(),
        teardown
    )
}

/// Format a duration as milliseconds below a second, seconds above.
pub fn format_elapsed(elapsed: Duration) -> String {
    if elapsed < Duration::from_secs(1) {
        format!("{}ms", elapsed.as_millis())
    } else {
        format!("{:.2}s", elapsed.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assertions::AssertionFailure;
    use crate::error::HarnessError;
    use crate::scenario::{ScenarioCase, SizeModifier};
    use crate::session::{TeardownError, TeardownReport};

    fn report() -> SessionReport {
        SessionReport {
            outcomes: vec![
                ScenarioOutcome {
                    case: ScenarioCase::read("readregular", None),
                    iteration: 0,
                    elapsed: Duration::from_millis(12),
                    result: Ok(()),
                },
                ScenarioOutcome {
                    case: ScenarioCase::read("readX3", Some(SizeModifier::Halve)),
                    iteration: 0,
                    elapsed: Duration::from_millis(1500),
                    result: Err(HarnessError::Assertion(AssertionFailure::LengthMismatch {
                        context: "read/readX3/halve".to_string(),
                        reported: -1,
                        expected: 6000,
                    })),
                },
            ],
            teardown: TeardownReport::default(),
        }
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_millis(7)), "7ms");
        assert_eq!(format_elapsed(Duration::from_millis(1500)), "1.50s");
    }

    #[test]
    fn test_outcome_table_lists_every_case() {
        let rendered = outcome_table(&report()).to_string();
        assert!(rendered.contains("read/readregular/full"));
        assert!(rendered.contains("read/readX3/halve"));
        assert!(rendered.contains("assertion"));
        assert!(!rendered.contains("Run"));
    }

    #[test]
    fn test_outcome_table_shows_run_column_when_repeated() {
        let mut report = report();
        report.outcomes[1].iteration = 1;
        assert!(outcome_table(&report).to_string().contains("Run"));
    }

    #[test]
    fn test_summary_and_details() {
        let mut report = report();
        assert_eq!(summary_line(&report), "1 passed; 1 failed; teardown clean");

        report.teardown.errors.push(TeardownError::ServerWaitTimeout {
            timeout: Duration::from_secs(3),
        });
        assert_eq!(summary_line(&report), "1 passed; 1 failed; 1 teardown error");

        let details = failure_details(&report);
        assert!(details.contains("---- read/readX3/halve ----"));
        assert!(details.contains("tester reported -1 bytes, expected 6000 bytes"));
        assert!(details.contains("---- teardown ----"));
        assert!(!details.contains("readregular"));
    }
}
