#![deny(unsafe_op_in_unsafe_fn)]

//! Latency samples and what is computed from them: histograms and summaries.
//!
//! Everything here is a pure function of an already collected [`SampleSet`].

pub mod histograms;
pub mod samples;
pub mod summary;

pub use histograms::{aggregate, AggregateError, Histogram, HistogramCumSumItem};
pub use samples::{Sample, SampleSet, SampleSetError};
pub use summary::{summary, LatencyStats, Summary};
