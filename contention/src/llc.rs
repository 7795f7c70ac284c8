use crate::error::ContentionError;
use crate::generator::{ContentionUnit, UnitStats};
use cache_utils::clock::Clock;
use cache_utils::mmap::MMappedMemory;
use core::ptr;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::time::Duration;

/// Lines visited by a single step, bounds the time between two clock polls.
pub const STEP_LINES: usize = 4096;

/**
Evicts the last level cache by walking a buffer larger than it.

Lines are visited in a random order, reshuffled after each full pass, so that
the prefetchers cannot hide the misses. Every visit is a read-modify-write.
*/
pub struct LlcUnit {
    buffer: MMappedMemory<u8>,
    // Byte offsets of the lines, in visit order.
    order: Vec<usize>,
    cursor: usize,
    rng: StdRng,
    steps: u64,
    operations: u64,
}

impl LlcUnit {
    pub fn new(buffer_size: usize, line_size: usize) -> Result<Self, ContentionError> {
        let lines = buffer_size / line_size;
        let bytes = lines * line_size;
        let mut buffer = MMappedMemory::<u8>::try_new(bytes, false)
            .map_err(|source| ContentionError::AllocationFailed { bytes, source })?;
        // Fault every page in now rather than during the first pass.
        for line in buffer.chunks_mut(line_size) {
            line[0] = 1;
        }
        let mut rng = StdRng::from_os_rng();
        let mut order: Vec<usize> = (0..lines).map(|i| i * line_size).collect();
        order.shuffle(&mut rng);
        Ok(Self {
            buffer,
            order,
            cursor: 0,
            rng,
            steps: 0,
            operations: 0,
        })
    }

    pub fn lines(&self) -> usize {
        self.order.len()
    }
}

impl ContentionUnit for LlcUnit {
    fn step(&mut self, _clock: &dyn Clock, _deadline: Duration) -> Result<(), ContentionError> {
        if self.cursor == self.order.len() {
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
        }
        let end = (self.cursor + STEP_LINES).min(self.order.len());
        let base = self.buffer.as_mut_ptr();
        for &offset in &self.order[self.cursor..end] {
            // offset < buffer length by construction of `order`.
            unsafe {
                let line = base.add(offset);
                let value = ptr::read_volatile(line);
                ptr::write_volatile(line, value.wrapping_add(1));
            }
        }
        self.operations += (end - self.cursor) as u64;
        self.cursor = end;
        self.steps += 1;
        Ok(())
    }

    fn stats(&self) -> UnitStats {
        UnitStats {
            steps: self.steps,
            operations: self.operations,
            dropped: 0,
        }
    }
}
