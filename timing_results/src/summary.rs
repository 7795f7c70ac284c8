use crate::samples::SampleSet;
use itertools::{Itertools, MinMaxResult};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub count: usize,
}

/// Summary of a sample set. An empty set has no mean, it is reported as
/// `NoData` instead of a NaN or a division error.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Summary {
    NoData,
    Stats(LatencyStats),
}

impl Summary {
    pub fn count(&self) -> usize {
        match self {
            Summary::NoData => 0,
            Summary::Stats(stats) => stats.count,
        }
    }

    pub fn stats(&self) -> Option<&LatencyStats> {
        match self {
            Summary::NoData => None,
            Summary::Stats(stats) => Some(stats),
        }
    }

    pub fn mean(&self) -> Option<f64> {
        self.stats().map(|s| s.mean)
    }

    pub fn csv_header() -> &'static str {
        "count,min,max,mean"
    }

    pub fn csv(&self) -> String {
        match self {
            Summary::NoData => String::from("0,NA,NA,NA"),
            Summary::Stats(s) => format!("{},{},{},{}", s.count, s.min, s.max, s.mean),
        }
    }
}

impl Display for Summary {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Summary::NoData => write!(f, "no data"),
            Summary::Stats(s) => write!(
                f,
                "{} samples, min {}, max {}, mean {:.2}",
                s.count, s.min, s.max, s.mean
            ),
        }
    }
}

pub fn summary(samples: &SampleSet) -> Summary {
    let (min, max) = match samples.latencies().minmax() {
        MinMaxResult::NoElements => return Summary::NoData,
        MinMaxResult::OneElement(l) => (l, l),
        MinMaxResult::MinMax(min, max) => (min, max),
    };
    let count = samples.len();
    // u128 so that long runs of slow accesses cannot overflow the sum.
    let sum: u128 = samples.latencies().map(|l| l as u128).sum();
    Summary::Stats(LatencyStats {
        min,
        max,
        mean: sum as f64 / count as f64,
        count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_no_data() {
        let s = summary(&SampleSet::with_bound(10));
        assert_eq!(s, Summary::NoData);
        assert_eq!(s.count(), 0);
        assert_eq!(s.mean(), None);
        assert_eq!(s.csv(), "0,NA,NA,NA");
    }

    #[test]
    fn single_sample() {
        let s = summary(&SampleSet::from_latencies([173]));
        let stats = s.stats().unwrap();
        assert_eq!(stats.min, 173);
        assert_eq!(stats.max, 173);
        assert_eq!(stats.mean, 173.0);
        assert_eq!(stats.count, 1);
    }

    #[test]
    fn several_samples() {
        let s = summary(&SampleSet::from_latencies([40, 10, 30, 20]));
        assert_eq!(
            s,
            Summary::Stats(LatencyStats {
                min: 10,
                max: 40,
                mean: 25.0,
                count: 4
            })
        );
        assert_eq!(s.csv(), "4,10,40,25");
    }

    #[test]
    fn huge_latencies_do_not_overflow() {
        let s = summary(&SampleSet::from_latencies([u64::MAX, u64::MAX]));
        assert_eq!(s.stats().unwrap().mean, u64::MAX as f64);
    }
}
