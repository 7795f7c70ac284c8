use crate::report::ExperimentReport;
use cache_utils::probe::ProbeError;
use contention::{ContentionError, ContentionSpec};
use thiserror::Error;
use timing_results::AggregateError;

/// A contention spec that could not be started, or whose generator failed
/// while running.
#[derive(Debug)]
pub struct FailedSpec {
    /// Position in the list handed to the runner.
    pub index: usize,
    pub spec: ContentionSpec,
    pub error: ContentionError,
}

#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error("cannot pin the probe to core {core}: {source}")]
    Affinity {
        core: usize,
        #[source]
        source: nix::Error,
    },

    /// The experiment ran with the remaining specs; `report` covers them.
    #[error("{} contention spec(s) failed", .failed_specs.len())]
    PartialFailure {
        report: Box<ExperimentReport>,
        failed_specs: Vec<FailedSpec>,
    },
}

impl ExperimentError {
    /// The best-effort report of a partially failed experiment.
    pub fn partial_report(&self) -> Option<&ExperimentReport> {
        match self {
            ExperimentError::PartialFailure { report, .. } => Some(report.as_ref()),
            _ => None,
        }
    }
}
