use crate::affinity::pin_to_core;
use crate::error::{ExperimentError, FailedSpec};
use crate::report::ExperimentReport;
use cache_utils::clock::{Clock, SystemClock};
use cache_utils::primitives::{NativePrimitives, TimingPrimitives};
use cache_utils::probe::{ProbeConfig, TimingProbe};
use cache_utils::Address;
use contention::{ContentionGenerator, ContentionSpec};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use timing_results::{aggregate, AggregateError, SampleSet};

pub const DEFAULT_BIN_WIDTH: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub bin_width: u64,
    pub probe: ProbeConfig,
    /// Core the probing thread is pinned to while it measures.
    pub probe_core: Option<usize>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            bin_width: DEFAULT_BIN_WIDTH,
            probe: ProbeConfig::default(),
            probe_core: None,
        }
    }
}

/// Address to time and how many times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSpec {
    target: Address,
    iterations: u32,
}

impl ProbeSpec {
    /// # Safety
    ///
    /// target must stay valid to read until every experiment run with this
    /// spec has returned.
    pub unsafe fn new(target: Address, iterations: u32) -> Self {
        Self { target, iterations }
    }

    pub fn target(&self) -> Address {
        self.target
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }
}

/**
Runs a timing probe while contention generators saturate shared resources.

Generators run on their own threads; the probe runs on the thread calling
[`run`](Self::run). Every generator is joined before `run` returns.
*/
#[derive(Debug)]
pub struct ExperimentRunner<P: TimingPrimitives> {
    probe: TimingProbe<P>,
    clock: Arc<dyn Clock>,
    config: ExperimentConfig,
}

impl ExperimentRunner<NativePrimitives> {
    pub fn native(config: ExperimentConfig) -> Result<Self, ExperimentError> {
        Self::new(NativePrimitives::detect(), Arc::new(SystemClock::new()), config)
    }
}

impl<P: TimingPrimitives> ExperimentRunner<P> {
    pub fn new(
        primitives: P,
        clock: Arc<dyn Clock>,
        config: ExperimentConfig,
    ) -> Result<Self, ExperimentError> {
        if config.bin_width == 0 {
            return Err(AggregateError::InvalidBinWidth.into());
        }
        Ok(Self {
            probe: TimingProbe::new(primitives, clock.clone()).with_config(config.probe),
            clock,
            config,
        })
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn probe(&self) -> &TimingProbe<P> {
        &self.probe
    }

    fn sample(&self, spec: ProbeSpec) -> Result<SampleSet, ExperimentError> {
        let _guard = match self.config.probe_core {
            Some(core) => Some(
                pin_to_core(core).map_err(|source| ExperimentError::Affinity { core, source })?,
            ),
            None => None,
        };
        // Validity of the target was promised when building the ProbeSpec.
        let samples = unsafe { self.probe.probe_set(spec.target, spec.iterations) }?;
        Ok(samples)
    }

    /// Starts every generator, probes if asked to, then joins everything.
    ///
    /// Specs that fail to start or fail while running do not stop the
    /// others, they are reported through [`ExperimentError::PartialFailure`]
    /// along with the report of the specs that succeeded.
    pub fn run(
        &self,
        probe: Option<ProbeSpec>,
        contention_specs: Vec<ContentionSpec>,
    ) -> Result<ExperimentReport, ExperimentError> {
        let start = self.clock.now();
        let mut failed_specs = Vec::new();
        let mut running = Vec::with_capacity(contention_specs.len());

        for (index, spec) in contention_specs.into_iter().enumerate() {
            let launched = ContentionGenerator::with_clock(spec.clone(), self.clock.clone())
                .and_then(ContentionGenerator::launch);
            match launched {
                Ok(generator) => running.push((index, spec, generator)),
                Err(error) => {
                    tracing::warn!("contention spec {} ({}) not started: {}", index, spec, error);
                    failed_specs.push(FailedSpec { index, spec, error });
                }
            }
        }
        tracing::info!(
            "{} generator(s) running, {} failed to start",
            running.len(),
            failed_specs.len()
        );

        // Joins happen before the probe outcome is looked at.
        let probed = match probe {
            Some(spec) => self.sample(spec),
            None => Ok(SampleSet::with_bound(0)),
        };

        let mut applied = Vec::with_capacity(running.len());
        let mut generators = Vec::with_capacity(running.len());
        for (index, spec, generator) in running {
            match generator.join() {
                Ok(stats) => {
                    applied.push(spec);
                    generators.push(stats);
                }
                Err(error) => {
                    tracing::warn!("contention spec {} ({}) failed: {}", index, spec, error);
                    failed_specs.push(FailedSpec { index, spec, error });
                }
            }
        }
        let elapsed = self.clock.now().saturating_sub(start);

        let sample_set = probed?;
        let bins = aggregate(&sample_set, self.config.bin_width)?;
        let report = ExperimentReport::new(
            sample_set,
            bins,
            elapsed,
            applied,
            self.probe.noise_floor(),
            generators,
        );
        tracing::info!("experiment done in {:?}: {}", elapsed, report.summary());

        if failed_specs.is_empty() {
            Ok(report)
        } else {
            failed_specs.sort_by_key(|f| f.index);
            Err(ExperimentError::PartialFailure {
                report: Box::new(report),
                failed_specs,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache_utils::clock::ManualClock;
    use cache_utils::primitives::ScriptedPrimitives;
    use std::time::Duration;

    fn manual() -> Arc<dyn Clock> {
        Arc::new(ManualClock::new(Duration::from_micros(1)))
    }

    #[test]
    fn zero_bin_width_is_rejected() {
        let config = ExperimentConfig {
            bin_width: 0,
            ..Default::default()
        };
        assert!(matches!(
            ExperimentRunner::new(ScriptedPrimitives::new(vec![1]), manual(), config),
            Err(ExperimentError::Aggregate(AggregateError::InvalidBinWidth))
        ));
    }

    #[test]
    fn nothing_to_do() {
        let runner =
            ExperimentRunner::new(ScriptedPrimitives::new(vec![1]), manual(), Default::default())
                .unwrap();
        let report = runner.run(None, Vec::new()).unwrap();
        assert!(report.sample_set().is_empty());
        assert!(report.bins().is_empty());
        assert!(report.contention_specs_applied().is_empty());
        assert_eq!(report.summary().count(), 0);
    }

    #[test]
    fn probe_only() {
        let target = 0u64;
        let runner = ExperimentRunner::new(
            ScriptedPrimitives::new(vec![95, 105, 310]),
            manual(),
            Default::default(),
        )
        .unwrap();
        let spec = unsafe { ProbeSpec::new(Address::of(&target), 300) };
        let report = runner.run(Some(spec), Vec::new()).unwrap();
        assert_eq!(report.sample_set().len(), 300);
        assert_eq!(report.bins().get(9), 100);
        assert_eq!(report.bins().get(10), 100);
        assert_eq!(report.bins().get(31), 100);
        assert_eq!(report.bin_width(), DEFAULT_BIN_WIDTH);
    }

    #[test]
    fn probe_error_comes_after_joins() {
        let runner = ExperimentRunner::new(
            ScriptedPrimitives::new(vec![1]).unavailable(),
            manual(),
            Default::default(),
        )
        .unwrap();
        let spec = unsafe { ProbeSpec::new(Address::null(), 10) };
        let result = runner.run(
            Some(spec),
            vec![ContentionSpec::memory_bus(Duration::from_micros(20), 1)],
        );
        assert!(matches!(result, Err(ExperimentError::Probe(_))));
    }
}
