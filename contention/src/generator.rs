use crate::error::ContentionError;
use crate::llc::LlcUnit;
use crate::memory_bus::{BusLockUnit, LockBlock};
use crate::nic::NicUnit;
use crate::spec::{ContentionSpec, Resource, ResourceParams};
use cache_utils::clock::{Clock, SystemClock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// One execution context's worth of contention.
///
/// A single `step` must complete in bounded time: the driving loop only looks
/// at the clock between steps. A step that waits must not wait past
/// `deadline`, the clock reading at which the run ends.
pub trait ContentionUnit: Send {
    fn step(&mut self, clock: &dyn Clock, deadline: Duration) -> Result<(), ContentionError>;
    fn stats(&self) -> UnitStats;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnitStats {
    pub steps: u64,
    /// Lines touched, locked increments, or datagrams sent.
    pub operations: u64,
    /// Datagrams lost to tolerated send errors.
    pub dropped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratorStats {
    pub resource: Resource,
    pub units: Vec<UnitStats>,
    pub elapsed: Duration,
}

impl GeneratorStats {
    pub fn total_operations(&self) -> u64 {
        self.units.iter().map(|u| u.operations).sum()
    }

    pub fn total_steps(&self) -> u64 {
        self.units.iter().map(|u| u.steps).sum()
    }

    pub fn total_dropped(&self) -> u64 {
        self.units.iter().map(|u| u.dropped).sum()
    }

    pub fn csv_header() -> String {
        String::from("resource,units,steps,operations,dropped,elapsed_ns")
    }

    pub fn csv(&self) -> String {
        format!(
            "{},{},{},{},{},{}",
            self.resource,
            self.units.len(),
            self.total_steps(),
            self.total_operations(),
            self.total_dropped(),
            self.elapsed.as_nanos()
        )
    }
}

/// Runs `unit` until `duration` has elapsed since `start`. The first step
/// always happens, even if the deadline is already behind us.
pub fn drive(
    unit: &mut dyn ContentionUnit,
    clock: &dyn Clock,
    start: Duration,
    duration: Duration,
) -> Result<UnitStats, ContentionError> {
    let deadline = start.checked_add(duration).unwrap_or(Duration::MAX);
    loop {
        unit.step(clock, deadline)?;
        if clock.now().saturating_sub(start) >= duration {
            break;
        }
    }
    Ok(unit.stats())
}

/// Saturates one resource, as described by a validated [`ContentionSpec`].
#[derive(Debug)]
pub struct ContentionGenerator {
    spec: ContentionSpec,
    clock: Arc<dyn Clock>,
}

impl ContentionGenerator {
    pub fn new(spec: ContentionSpec) -> Result<Self, ContentionError> {
        Self::with_clock(spec, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(spec: ContentionSpec, clock: Arc<dyn Clock>) -> Result<Self, ContentionError> {
        spec.validate()?;
        Ok(Self { spec, clock })
    }

    pub fn spec(&self) -> &ContentionSpec {
        &self.spec
    }

    /// Allocates whatever the units need. Done before any thread starts so
    /// that a failed allocation does not leave half a generator running.
    fn prepare_units(&self) -> Result<Vec<Box<dyn ContentionUnit>>, ContentionError> {
        let concurrency = self.spec.concurrency as usize;
        let mut units: Vec<Box<dyn ContentionUnit>> = Vec::with_capacity(concurrency);
        match self.spec.target {
            ResourceParams::Cache {
                buffer_size,
                line_size,
            } => {
                for _ in 0..concurrency {
                    units.push(Box::new(LlcUnit::new(buffer_size, line_size)?));
                }
            }
            ResourceParams::MemoryBus {
                lock_offset,
                lock_words,
            } => {
                let block = Arc::new(LockBlock::allocate(lock_offset, lock_words)?);
                for _ in 0..concurrency {
                    units.push(Box::new(BusLockUnit::new(block.clone())));
                }
            }
            ResourceParams::Nic {
                destination,
                packet_size,
                target_bitrate,
            } => {
                let per_unit = (target_bitrate / concurrency as u64).max(1);
                for _ in 0..concurrency {
                    units.push(Box::new(NicUnit::new(destination, packet_size, per_unit)?));
                }
            }
        }
        Ok(units)
    }

    /// Starts one thread per concurrency unit and returns immediately.
    pub fn launch(self) -> Result<RunningGenerator, ContentionError> {
        let units = self.prepare_units()?;
        let start = self.clock.now();
        let duration = self.spec.duration;
        let mut handles = Vec::with_capacity(units.len());
        for (index, mut unit) in units.into_iter().enumerate() {
            let clock = self.clock.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", self.spec.resource, index))
                .spawn(move || drive(unit.as_mut(), &*clock, start, duration));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // The units already running stop on their own, wait for them.
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(ContentionError::ThreadSpawn(e));
                }
            }
        }
        tracing::debug!("launched {}", self.spec);
        Ok(RunningGenerator {
            resource: self.spec.resource,
            handles,
            start,
            clock: self.clock,
        })
    }

    /// Launches and joins.
    pub fn run(self) -> Result<GeneratorStats, ContentionError> {
        self.launch()?.join()
    }
}

#[derive(Debug)]
pub struct RunningGenerator {
    resource: Resource,
    handles: Vec<thread::JoinHandle<Result<UnitStats, ContentionError>>>,
    start: Duration,
    clock: Arc<dyn Clock>,
}

impl RunningGenerator {
    pub fn resource(&self) -> Resource {
        self.resource
    }

    pub fn unit_count(&self) -> usize {
        self.handles.len()
    }

    /// Waits for every unit. All threads are joined even if one of them
    /// failed; the first failure is returned.
    pub fn join(self) -> Result<GeneratorStats, ContentionError> {
        let mut units = Vec::with_capacity(self.handles.len());
        let mut failure = None;
        for handle in self.handles {
            let outcome = handle.join().unwrap_or(Err(ContentionError::UnitPanicked));
            match outcome {
                Ok(stats) => units.push(stats),
                Err(e) => {
                    tracing::warn!("{} unit failed: {}", self.resource, e);
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }
        let elapsed = self.clock.now().saturating_sub(self.start);
        tracing::debug!("{} finished after {:?}", self.resource, elapsed);
        Ok(GeneratorStats {
            resource: self.resource,
            units,
            elapsed,
        })
    }
}
