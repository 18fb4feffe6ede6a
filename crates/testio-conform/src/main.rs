#![deny(unsafe_code)]

mod cli;

use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use testio_conform::report::{failure_details, outcome_table, summary_line};
use testio_conform::run_matrix;

use crate::cli::Cli;

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns whether every scenario passed and teardown was clean.
fn run() -> Result<bool> {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    let matrix = cli.matrix();
    if cli.list {
        for case in &matrix {
            println!("{case}");
        }
        return Ok(true);
    }
    if matrix.is_empty() {
        bail!(
            "no scenario matches filter {:?}",
            cli.filter.as_deref().unwrap_or_default()
        );
    }

    let config = cli.to_config();
    config.validate().context("Invalid harness configuration")?;

    let report = run_matrix(&config, &matrix, cli.repeat.get())
        .context("Failed to start the filesystem server")?;

    println!("{}", outcome_table(&report));
    let details = failure_details(&report);
    if !details.is_empty() {
        eprintln!("\n{details}");
    }

    let output = &report.teardown.output;
    if !output.is_empty() {
        eprintln!("---- filesystem server output ----\n{output}");
    }
    if let Some(status) = report.teardown.exit_status {
        tracing::info!("filesystem server exited with {}", status);
    }

    println!("\n{}", summary_line(&report));
    Ok(report.is_success())
}

fn setup_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
