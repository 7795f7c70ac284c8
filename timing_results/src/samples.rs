use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One timed access, as recorded by a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp_index: u32,
    pub latency: u64,
}

impl Sample {
    pub const fn new(timestamp_index: u32, latency: u64) -> Self {
        Self {
            timestamp_index,
            latency,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SampleSetError {
    #[error("sample set is full ({bound} samples)")]
    Full { bound: usize },
    #[error("sample index {next} does not follow index {previous}")]
    OutOfOrder { previous: u32, next: u32 },
}

/**
Ordered latency samples of one probe run.

Insertion order is temporal order: `timestamp_index` strictly increases and the
length never exceeds the bound fixed at creation (the probe iteration count).
*/
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSampleSet")]
pub struct SampleSet {
    bound: usize,
    samples: Vec<Sample>,
}

// Deserialization goes through this so that a decoded set upholds the same
// invariants as one built by `push`.
#[derive(Deserialize)]
struct RawSampleSet {
    bound: usize,
    samples: Vec<Sample>,
}

impl TryFrom<RawSampleSet> for SampleSet {
    type Error = SampleSetError;

    fn try_from(raw: RawSampleSet) -> Result<Self, Self::Error> {
        let mut set = SampleSet::with_bound(raw.bound);
        for sample in raw.samples {
            set.push(sample)?;
        }
        Ok(set)
    }
}

impl SampleSet {
    pub fn with_bound(bound: usize) -> Self {
        Self {
            bound,
            samples: Vec::with_capacity(bound),
        }
    }

    pub fn push(&mut self, sample: Sample) -> Result<(), SampleSetError> {
        if self.samples.len() >= self.bound {
            return Err(SampleSetError::Full { bound: self.bound });
        }
        if let Some(last) = self.samples.last() {
            if sample.timestamp_index <= last.timestamp_index {
                return Err(SampleSetError::OutOfOrder {
                    previous: last.timestamp_index,
                    next: sample.timestamp_index,
                });
            }
        }
        self.samples.push(sample);
        Ok(())
    }

    /// Builds a set from raw latencies, indexed from zero. Mostly useful to
    /// re-analyse latencies obtained elsewhere. Latencies past the range of
    /// `timestamp_index` are dropped.
    pub fn from_latencies(latencies: impl IntoIterator<Item = u64>) -> Self {
        Self::from_latencies_capped(latencies, u32::MAX)
    }

    fn from_latencies_capped(latencies: impl IntoIterator<Item = u64>, last_index: u32) -> Self {
        let samples: Vec<Sample> = (0..=last_index)
            .zip(latencies)
            .map(|(i, latency)| Sample::new(i, latency))
            .collect();
        Self {
            bound: samples.len(),
            samples,
        }
    }

    pub fn bound(&self) -> usize {
        self.bound
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn as_slice(&self) -> &[Sample] {
        &self.samples
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Sample> {
        self.samples.iter()
    }

    pub fn latencies(&self) -> impl Iterator<Item = u64> + '_ {
        self.samples.iter().map(|s| s.latency)
    }

    /// Sum of latencies per consecutive round of `round_len` samples.
    /// A trailing partial round is summed as well. Empty for `round_len == 0`.
    pub fn round_totals(&self, round_len: usize) -> Vec<u64> {
        if round_len == 0 {
            return Vec::new();
        }
        self.samples
            .chunks(round_len)
            .map(|round| round.iter().map(|s| s.latency).sum())
            .collect()
    }
}

impl<'a> IntoIterator for &'a SampleSet {
    type Item = &'a Sample;
    type IntoIter = std::slice::Iter<'a, Sample>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
