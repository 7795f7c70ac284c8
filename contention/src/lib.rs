#![deny(unsafe_op_in_unsafe_fn)]

//! Generators saturating one shared hardware resource for a bounded time.
//!
//! Three resources are covered: the last level cache, evicted by walking a
//! large buffer in random order; the memory bus, locked by atomic increments
//! on words straddling cache lines; and the network interface, saturated by
//! paced UDP datagrams.
//!
//! Every generator terminates on its own once its duration has elapsed, there
//! is no way to stop one early.

pub mod error;
pub mod generator;
pub mod llc;
pub mod memory_bus;
pub mod nic;
pub mod spec;

pub use error::ContentionError;
pub use generator::{
    drive, ContentionGenerator, ContentionUnit, GeneratorStats, RunningGenerator, UnitStats,
};
pub use spec::{ContentionSpec, Resource, ResourceParams};
