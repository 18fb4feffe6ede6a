//! Differential conformance harness for the testio FUSE filesystem.
//!
//! A filesystem server is mounted once on a temporary directory. Every
//! scenario then reads or writes one of the server's fixture files through
//! two independent paths, and checks that they agree:
//!
//! - the operating system's file interface, against the live mount;
//! - a separate `tester` process that calls straight into the pluggable
//!   backend library.
//!
//! # Example
//!
//! ```no_run
//! use testio_conform::{HarnessConfig, ScenarioMatrix, run_matrix};
//!
//! let config = HarnessConfig::from_env();
//! config.validate()?;
//! let report = run_matrix(&config, &ScenarioMatrix::standard(), 1)?;
//! assert!(report.is_success());
//! # Ok::<(), testio_conform::HarnessError>(())
//! ```

#![deny(unsafe_code)]

pub mod assertions;
pub mod config;
pub mod driver;
pub mod error;
pub mod payload;
pub mod process;
pub mod readiness;
pub mod report;
pub mod runner;
pub mod scenario;
pub mod session;
pub mod unmount;

pub use assertions::AssertionFailure;
pub use config::HarnessConfig;
pub use driver::{Operation, ProtocolError, ReadReport, TesterInvocation, TesterResult, WorkloadDriver, WriteReport};
pub use error::HarnessError;
pub use process::{CapturedOutput, ChildGuard, ProcessError, ProcessOutput, ProcessSpec};
pub use readiness::{Readiness, ReadinessProbe};
pub use runner::{ScenarioOutcome, SessionReport, run_cases, run_matrix};
pub use scenario::{ScenarioCase, ScenarioContext, ScenarioMatrix, SizeModifier};
pub use session::{MountSession, MountState, TeardownError, TeardownReport};
