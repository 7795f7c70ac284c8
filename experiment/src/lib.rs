#![deny(unsafe_op_in_unsafe_fn)]

//! Co-location experiments: a timing probe run against a target address while
//! contention generators load the cache, the memory bus or the network
//! interface.

pub mod affinity;
pub mod error;
pub mod report;
pub mod runner;

pub use error::{ExperimentError, FailedSpec};
pub use report::{ExperimentReport, ReportError};
pub use runner::{ExperimentConfig, ExperimentRunner, ProbeSpec, DEFAULT_BIN_WIDTH};
