use crate::clock::{busy_wait_until, Clock};
use crate::primitives::TimingPrimitives;
use crate::Address;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::iter::FusedIterator;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use timing_results::{Sample, SampleSet, SampleSetError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProbeMode {
    /// Evict, then time the reload: every sample is a miss unless someone else
    /// brought the line back in between.
    #[default]
    FlushReload,
    /// Time the access only. Measures how long the line stays cached.
    Reload,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ProbeConfig {
    pub mode: ProbeMode,
    /// Busy-wait inserted between two iterations.
    pub warm_delay: Duration,
    /// Overrides the primitives' noise floor.
    pub noise_floor: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetDefect {
    Null,
    Unaligned { granularity: usize },
}

impl Display for TargetDefect {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetDefect::Null => write!(f, "null address"),
            TargetDefect::Unaligned { granularity } => {
                write!(f, "not aligned on {} bytes", granularity)
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid probe target {address}: {defect}")]
    InvalidTarget {
        address: Address,
        defect: TargetDefect,
    },
    #[error("timing primitives are not available on this host")]
    PrimitiveUnavailable,
    #[error("failed to record sample: {0}")]
    Record(#[from] SampleSetError),
}

/// Repeated timing of one address through a set of [`TimingPrimitives`].
#[derive(Debug)]
pub struct TimingProbe<P: TimingPrimitives> {
    primitives: P,
    clock: Arc<dyn Clock>,
    config: ProbeConfig,
}

impl<P: TimingPrimitives> TimingProbe<P> {
    pub fn new(primitives: P, clock: Arc<dyn Clock>) -> Self {
        Self {
            primitives,
            clock,
            config: ProbeConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ProbeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    pub fn primitives(&self) -> &P {
        &self.primitives
    }

    /// Latencies under this value are hits in the closest cache. They are
    /// still recorded, filtering is left to whoever bins the samples.
    pub fn noise_floor(&self) -> u64 {
        self.config
            .noise_floor
            .unwrap_or_else(|| self.primitives.noise_floor())
    }

    pub fn check_target(&self, target: Address) -> Result<(), ProbeError> {
        if !self.primitives.available() {
            return Err(ProbeError::PrimitiveUnavailable);
        }
        if target.is_null() {
            return Err(ProbeError::InvalidTarget {
                address: target,
                defect: TargetDefect::Null,
            });
        }
        let granularity = self.primitives.granularity();
        if !target.is_aligned_to(granularity) {
            return Err(ProbeError::InvalidTarget {
                address: target,
                defect: TargetDefect::Unaligned { granularity },
            });
        }
        Ok(())
    }

    /// Lazily times `iterations` accesses to `target`. The sequence cannot be
    /// restarted; call `probe` again for a new run.
    ///
    /// # Safety
    ///
    /// target must be a valid pointer to read until the returned iterator is
    /// dropped.
    pub unsafe fn probe(
        &self,
        target: Address,
        iterations: u32,
    ) -> Result<ProbeSamples<'_, P>, ProbeError> {
        self.check_target(target)?;
        Ok(ProbeSamples {
            probe: self,
            target,
            next: 0,
            iterations,
        })
    }

    /// Runs [`probe`](Self::probe) to completion.
    ///
    /// # Safety
    ///
    /// target must be a valid pointer to read.
    pub unsafe fn probe_set(&self, target: Address, iterations: u32) -> Result<SampleSet, ProbeError> {
        let samples = unsafe { self.probe(target, iterations) }?;
        let mut set = SampleSet::with_bound(iterations as usize);
        for sample in samples {
            set.push(sample)?;
        }
        Ok(set)
    }

    // Flush and access are issued back to back on the calling thread, the
    // access must never race the eviction.
    unsafe fn measure(&self, target: Address) -> u64 {
        match self.config.mode {
            ProbeMode::FlushReload => unsafe {
                self.primitives.flush(target);
                self.primitives.access(target)
            },
            ProbeMode::Reload => unsafe { self.primitives.access(target) },
        }
    }
}

/// Samples produced by [`TimingProbe::probe`], in issue order.
#[derive(Debug)]
pub struct ProbeSamples<'a, P: TimingPrimitives> {
    probe: &'a TimingProbe<P>,
    target: Address,
    next: u32,
    iterations: u32,
}

impl<P: TimingPrimitives> Iterator for ProbeSamples<'_, P> {
    type Item = Sample;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.iterations {
            return None;
        }
        let delay = self.probe.config.warm_delay;
        if self.next > 0 && !delay.is_zero() {
            let clock = &*self.probe.clock;
            busy_wait_until(clock, clock.now() + delay);
        }
        // Validity of the target was promised to `probe`.
        let latency = unsafe { self.probe.measure(self.target) };
        let sample = Sample::new(self.next, latency);
        self.next += 1;
        Some(sample)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.iterations - self.next) as usize;
        (remaining, Some(remaining))
    }
}

impl<P: TimingPrimitives> ExactSizeIterator for ProbeSamples<'_, P> {}

impl<P: TimingPrimitives> FusedIterator for ProbeSamples<'_, P> {}
