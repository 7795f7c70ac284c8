use crate::samples::SampleSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Index;
use thiserror::Error;

/**********
 * Errors *
 **********/

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AggregateError {
    #[error("histogram bin width must be non zero")]
    InvalidBinWidth,
}

/***********
 * Structs *
 ***********/

// Sparse: only bins that received at least one sample are stored, so a
// handful of very slow outliers does not allocate thousands of empty buckets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawHistogram")]
pub struct Histogram {
    bin_width: u64,
    bins: BTreeMap<u64, u32>,
}

#[derive(Deserialize)]
struct RawHistogram {
    bin_width: u64,
    bins: BTreeMap<u64, u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistogramCumSumItem {
    pub count: u32,
    pub cumulative_count: u64,
}

/***********
 *  Impls  *
 ***********/

impl TryFrom<RawHistogram> for Histogram {
    type Error = AggregateError;

    fn try_from(raw: RawHistogram) -> Result<Self, Self::Error> {
        let mut histogram = Histogram::empty(raw.bin_width)?;
        histogram.bins = raw.bins;
        Ok(histogram)
    }
}

impl Histogram {
    pub fn empty(bin_width: u64) -> Result<Self, AggregateError> {
        if bin_width == 0 {
            return Err(AggregateError::InvalidBinWidth);
        }
        Ok(Self {
            bin_width,
            bins: BTreeMap::new(),
        })
    }

    pub fn bin_width(&self) -> u64 {
        self.bin_width
    }

    pub fn bin_of(&self, latency: u64) -> u64 {
        latency / self.bin_width
    }

    pub fn record(&mut self, latency: u64) {
        *self.bins.entry(self.bin_of(latency)).or_insert(0) += 1;
    }

    pub fn get(&self, bin_index: u64) -> u32 {
        self.bins.get(&bin_index).copied().unwrap_or(0)
    }

    /// Non-empty bins in increasing bin index order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u32)> + '_ {
        self.bins.iter().map(|(&bin, &count)| (bin, count))
    }

    pub fn total(&self) -> u64 {
        self.bins.values().map(|&c| c as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub fn cumulative(&self) -> Vec<(u64, HistogramCumSumItem)> {
        let mut cumul = 0u64;
        self.iter()
            .map(|(bin, count)| {
                cumul += count as u64;
                (
                    bin,
                    HistogramCumSumItem {
                        count,
                        cumulative_count: cumul,
                    },
                )
            })
            .collect()
    }

    /// Index of the first bin at which the cumulative count reaches
    /// `quantile` of the total. `None` on an empty histogram.
    pub fn quantile_bin(&self, quantile: f64) -> Option<u64> {
        let total = self.total();
        if total == 0 {
            return None;
        }
        let quantile = quantile.clamp(0.0, 1.0);
        let target = ((total as f64) * quantile).ceil().max(1.0) as u64;
        self.cumulative()
            .into_iter()
            .find(|(_, item)| item.cumulative_count >= target)
            .map(|(bin, _)| bin)
    }
}

impl Index<u64> for Histogram {
    type Output = u32;

    fn index(&self, index: u64) -> &Self::Output {
        self.bins.get(&index).unwrap_or(&0)
    }
}

/// Bins every sample of `samples` into `bin_width` wide buckets,
/// `bin_index = latency / bin_width`.
pub fn aggregate(samples: &SampleSet, bin_width: u64) -> Result<Histogram, AggregateError> {
    let mut histogram = Histogram::empty(bin_width)?;
    for latency in samples.latencies() {
        histogram.record(latency);
    }
    Ok(histogram)
}
