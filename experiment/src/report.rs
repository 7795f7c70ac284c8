use contention::{ContentionSpec, GeneratorStats};
use rmp_serde::decode;
use rmp_serde::encode;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use timing_results::{Histogram, SampleSet, Summary};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("report I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("cannot encode report: {0}")]
    Encode(#[from] encode::Error),
    #[error("cannot decode report: {0}")]
    Decode(#[from] decode::Error),
}

/// Outcome of one experiment. Built once when every generator has been
/// joined, read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentReport {
    sample_set: SampleSet,
    bins: Histogram,
    elapsed: Duration,
    contention_specs_applied: Vec<ContentionSpec>,
    summary: Summary,
    noise_floor: u64,
    generators: Vec<GeneratorStats>,
}

impl ExperimentReport {
    pub const EXTENSION: &'static str = "msgpack";
    pub const EXTENSION_ZSTD: &'static str = "msgpack.zst";

    pub(crate) fn new(
        sample_set: SampleSet,
        bins: Histogram,
        elapsed: Duration,
        contention_specs_applied: Vec<ContentionSpec>,
        noise_floor: u64,
        generators: Vec<GeneratorStats>,
    ) -> Self {
        let summary = timing_results::summary(&sample_set);
        Self {
            sample_set,
            bins,
            elapsed,
            contention_specs_applied,
            summary,
            noise_floor,
            generators,
        }
    }

    pub fn sample_set(&self) -> &SampleSet {
        &self.sample_set
    }

    pub fn bins(&self) -> &Histogram {
        &self.bins
    }

    pub fn bin_width(&self) -> u64 {
        self.bins.bin_width()
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn contention_specs_applied(&self) -> &[ContentionSpec] {
        &self.contention_specs_applied
    }

    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    /// Latency under which a sample is an L1 hit, as reported by the probe.
    pub fn noise_floor(&self) -> u64 {
        self.noise_floor
    }

    pub fn generators(&self) -> &[GeneratorStats] {
        &self.generators
    }

    pub fn csv_header() -> &'static str {
        "bin_index,count"
    }

    /// One `bin_index,count` line per non empty bin, ascending.
    pub fn csv(&self) -> String {
        let mut out = String::new();
        for (bin, count) in self.bins.iter() {
            out.push_str(&format!("{},{}\n", bin, count));
        }
        out
    }

    pub fn summary_csv(&self) -> String {
        format!("{}\n{}\n", Summary::csv_header(), self.summary.csv())
    }

    pub fn write_csv(&self, mut out: impl Write) -> io::Result<()> {
        writeln!(out, "{}", Self::csv_header())?;
        out.write_all(self.csv().as_bytes())
    }

    fn is_zstd(path: &Path) -> bool {
        path.extension().is_some_and(|e| e == "zst")
    }

    /// Msgpack with field names, zstd compressed when the path ends in `.zst`.
    pub fn write_msgpack(&self, path: impl AsRef<Path>) -> Result<(), ReportError> {
        let path = path.as_ref();
        let file = File::create(path)?;
        if Self::is_zstd(path) {
            let mut encoder = zstd::Encoder::new(file, 0)?;
            encode::write_named(&mut encoder, self)?;
            encoder.finish()?;
        } else {
            let mut writer = BufWriter::new(file);
            encode::write_named(&mut writer, self)?;
            writer.flush()?;
        }
        tracing::info!("report written to {}", path.display());
        Ok(())
    }

    pub fn read_msgpack(path: impl AsRef<Path>) -> Result<Self, ReportError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let report = if Self::is_zstd(path) {
            decode::from_read(zstd::Decoder::new(file)?)?
        } else {
            decode::from_read(BufReader::new(file))?
        };
        Ok(report)
    }
}
