//! `colocation`: probe an address, load shared resources, or both at once.
//!
//! Results are printed as CSV on stdout, logs go to stderr.

use cache_utils::cache_info::CacheGeometry;
use cache_utils::mmap::{MMappedMemory, MapError, MappedFile};
use cache_utils::probe::{ProbeConfig, ProbeMode};
use cache_utils::Address;
use clap::{Args, Parser, Subcommand};
use contention::spec::{
    DEFAULT_LOCK_OFFSET, DEFAULT_LOCK_WORDS, DEFAULT_PACKET_SIZE, DEFAULT_TARGET_BITRATE,
};
use contention::{ContentionSpec, GeneratorStats, ResourceParams};
use experiment::{
    ExperimentConfig, ExperimentError, ExperimentReport, ExperimentRunner, ProbeSpec,
    DEFAULT_BIN_WIDTH,
};
use std::error::Error;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Co-location timing and contention experiments
#[derive(Parser)]
#[command(name = "colocation")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Time repeated accesses to one address
    Probe {
        #[command(flatten)]
        target: TargetArgs,

        /// Write the full report as msgpack (zstd compressed if the name ends in .zst)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Load shared resources for a fixed duration
    Contend {
        #[command(flatten)]
        contention: ContentionArgs,
    },

    /// Probe while loading shared resources
    Run {
        #[command(flatten)]
        target: TargetArgs,

        #[command(flatten)]
        contention: ContentionArgs,

        /// Write the full report as msgpack (zstd compressed if the name ends in .zst)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args)]
struct TargetArgs {
    /// File to map and probe, typically a shared library. An anonymous page
    /// is probed when absent.
    #[arg(long)]
    file: Option<PathBuf>,

    /// Byte offset of the probed address
    #[arg(long, default_value_t = 0)]
    offset: usize,

    #[arg(short, long, default_value_t = 1000)]
    iterations: u32,

    /// Time the access without flushing first
    #[arg(long)]
    reload_only: bool,

    /// Busy-wait between two probes, in nanoseconds
    #[arg(long, default_value_t = 0)]
    warm_delay_ns: u64,

    /// Override the noise floor of the timing primitives
    #[arg(long)]
    noise_floor: Option<u64>,

    #[arg(long, default_value_t = DEFAULT_BIN_WIDTH)]
    bin_width: u64,

    /// Pin the probing thread to this core
    #[arg(long)]
    core: Option<usize>,

    /// Also print the latency sum of every round of this many samples
    #[arg(long)]
    round_len: Option<usize>,
}

impl TargetArgs {
    fn config(&self) -> ExperimentConfig {
        ExperimentConfig {
            bin_width: self.bin_width,
            probe: ProbeConfig {
                mode: if self.reload_only {
                    ProbeMode::Reload
                } else {
                    ProbeMode::FlushReload
                },
                warm_delay: Duration::from_nanos(self.warm_delay_ns),
                noise_floor: self.noise_floor,
            },
            probe_core: self.core,
        }
    }
}

#[derive(Args)]
struct ContentionArgs {
    #[arg(long, default_value_t = 1000)]
    duration_ms: u64,

    /// Threads per generator
    #[arg(long, default_value_t = 1)]
    concurrency: u32,

    /// Evict the last level cache
    #[arg(long)]
    llc: bool,

    /// Eviction buffer size in bytes, derived from CPUID by default
    #[arg(long)]
    llc_buffer_size: Option<usize>,

    #[arg(long)]
    line_size: Option<usize>,

    /// Lock the memory bus with split atomic increments
    #[arg(long)]
    bus: bool,

    #[arg(long, default_value_t = DEFAULT_LOCK_OFFSET)]
    lock_offset: usize,

    #[arg(long, default_value_t = DEFAULT_LOCK_WORDS)]
    lock_words: usize,

    /// Flood this UDP destination
    #[arg(long, value_name = "ADDR")]
    nic: Option<SocketAddr>,

    #[arg(long, default_value_t = DEFAULT_PACKET_SIZE)]
    packet_size: usize,

    /// Aggregate rate over all threads, in bits per second
    #[arg(long, default_value_t = DEFAULT_TARGET_BITRATE)]
    bitrate: u64,
}

impl ContentionArgs {
    fn specs(&self) -> Vec<ContentionSpec> {
        let duration = Duration::from_millis(self.duration_ms);
        let mut specs = Vec::new();
        if self.llc {
            let geometry = CacheGeometry::detect();
            specs.push(ContentionSpec::new(
                duration,
                self.concurrency,
                ResourceParams::Cache {
                    buffer_size: self
                        .llc_buffer_size
                        .unwrap_or_else(|| geometry.eviction_buffer_size()),
                    line_size: self.line_size.unwrap_or(geometry.line_size),
                },
            ));
        }
        if self.bus {
            specs.push(ContentionSpec::new(
                duration,
                self.concurrency,
                ResourceParams::MemoryBus {
                    lock_offset: self.lock_offset,
                    lock_words: self.lock_words,
                },
            ));
        }
        if let Some(destination) = self.nic {
            specs.push(ContentionSpec::new(
                duration,
                self.concurrency,
                ResourceParams::Nic {
                    destination,
                    packet_size: self.packet_size,
                    target_bitrate: self.bitrate,
                },
            ));
        }
        specs
    }
}

/// Memory backing the probed address, kept mapped until the run is over.
enum ProbeMemory {
    File(MappedFile),
    Anonymous(MMappedMemory<u8>),
}

impl ProbeMemory {
    fn map(args: &TargetArgs) -> Result<Self, MapError> {
        match &args.file {
            Some(path) => Ok(ProbeMemory::File(MappedFile::open(path)?)),
            None => {
                let mut page = MMappedMemory::<u8>::try_new(4096, false)?;
                // Back the page with a real frame.
                page.fill(0x5a);
                Ok(ProbeMemory::Anonymous(page))
            }
        }
    }

    fn address(&self, offset: usize) -> Result<Address, MapError> {
        match self {
            ProbeMemory::File(file) => file.address_at(offset),
            ProbeMemory::Anonymous(page) => {
                page.address(offset).ok_or(MapError::OffsetOutOfRange {
                    offset,
                    len: page.len(),
                })
            }
        }
    }
}

fn emit(
    report: &ExperimentReport,
    round_len: Option<usize>,
    output: Option<&PathBuf>,
) -> Result<(), Box<dyn Error>> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    if !report.sample_set().is_empty() {
        report.write_csv(&mut out)?;
        writeln!(out)?;
        write!(out, "{}", report.summary_csv())?;
    }
    if let Some(round_len) = round_len {
        writeln!(out, "\nround,total")?;
        for (round, total) in report.sample_set().round_totals(round_len).iter().enumerate() {
            writeln!(out, "{},{}", round, total)?;
        }
    }
    if !report.generators().is_empty() {
        writeln!(out, "\n{}", GeneratorStats::csv_header())?;
        for stats in report.generators() {
            writeln!(out, "{}", stats.csv())?;
        }
    }
    if let Some(path) = output {
        report.write_msgpack(path)?;
    }
    Ok(())
}

fn finish(
    outcome: Result<ExperimentReport, ExperimentError>,
    round_len: Option<usize>,
    output: Option<&PathBuf>,
) -> Result<(), Box<dyn Error>> {
    match outcome {
        Ok(report) => emit(&report, round_len, output),
        Err(ExperimentError::PartialFailure {
            report,
            failed_specs,
        }) => {
            for failed in &failed_specs {
                tracing::error!("spec {} ({}): {}", failed.index, failed.spec, failed.error);
            }
            emit(&report, round_len, output)?;
            Err(format!("{} contention spec(s) failed", failed_specs.len()).into())
        }
        Err(e) => Err(e.into()),
    }
}

fn execute(command: Commands) -> Result<(), Box<dyn Error>> {
    match command {
        Commands::Probe { target, output } => {
            let memory = ProbeMemory::map(&target)?;
            let runner = ExperimentRunner::native(target.config())?;
            let spec = unsafe { ProbeSpec::new(memory.address(target.offset)?, target.iterations) };
            let outcome = runner.run(Some(spec), Vec::new());
            finish(outcome, target.round_len, output.as_ref())
        }
        Commands::Contend { contention } => {
            let specs = contention.specs();
            if specs.is_empty() {
                return Err("nothing to contend, pass --llc, --bus or --nic".into());
            }
            let runner = ExperimentRunner::native(ExperimentConfig::default())?;
            finish(runner.run(None, specs), None, None)
        }
        Commands::Run {
            target,
            contention,
            output,
        } => {
            let memory = ProbeMemory::map(&target)?;
            let runner = ExperimentRunner::native(target.config())?;
            // memory outlives the run.
            let spec = unsafe { ProbeSpec::new(memory.address(target.offset)?, target.iterations) };
            let outcome = runner.run(Some(spec), contention.specs());
            finish(outcome, target.round_len, output.as_ref())
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    match execute(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
