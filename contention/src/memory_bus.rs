use crate::error::ContentionError;
use crate::generator::{ContentionUnit, UnitStats};
use crate::spec::LOCK_WORD_SIZE;
use cache_utils::cache_info::DEFAULT_LINE_SIZE;
use cache_utils::clock::Clock;
use cache_utils::mmap::{MapError, MMappedMemory};
use nix::errno::Errno;
use std::sync::Arc;
use std::time::Duration;

/**
Block of 32 bit words deliberately placed off their natural alignment.

Words straddling a cache line cannot be handled by the cache coherency
protocol alone, a locked operation on them falls back to a bus lock.
*/
pub struct LockBlock {
    memory: MMappedMemory<u8>,
    offset: usize,
    words: usize,
}

// All accesses to the words go through locked instructions.
unsafe impl Sync for LockBlock {}

impl LockBlock {
    pub fn allocate(offset: usize, words: usize) -> Result<Self, ContentionError> {
        let bytes = words
            .checked_mul(LOCK_WORD_SIZE)
            .and_then(|b| b.checked_add(offset))
            .ok_or(ContentionError::AllocationFailed {
                bytes: usize::MAX,
                source: MapError::Mmap(Errno::ENOMEM),
            })?;
        let memory = MMappedMemory::<u8>::try_new(bytes, false)
            .map_err(|source| ContentionError::AllocationFailed { bytes, source })?;
        let block = Self {
            memory,
            offset,
            words,
        };
        if block.split_words(DEFAULT_LINE_SIZE) == 0 {
            tracing::warn!(
                "no lock word crosses a {} byte line, expect no bus locking",
                DEFAULT_LINE_SIZE
            );
        }
        Ok(block)
    }

    pub fn words(&self) -> usize {
        self.words
    }

    fn word(&self, index: usize) -> *mut u32 {
        debug_assert!(index < self.words);
        // The mapping outlives self and is only ever written through locked
        // instructions, hence the cast away from const.
        unsafe {
            self.memory
                .as_ptr()
                .add(self.offset + index * LOCK_WORD_SIZE) as *mut u32
        }
    }

    /// Number of words spanning two lines of `line_size` bytes.
    pub fn split_words(&self, line_size: usize) -> usize {
        (0..self.words)
            .filter(|i| {
                let start = self.offset + i * LOCK_WORD_SIZE;
                start / line_size != (start + LOCK_WORD_SIZE - 1) / line_size
            })
            .count()
    }

    /// Sum of all the words.
    pub fn total(&self) -> u64 {
        (0..self.words)
            .map(|i| unsafe { self.word(i).read_unaligned() } as u64)
            .sum()
    }
}

#[cfg(target_arch = "x86_64")]
unsafe fn locked_increment(word: *mut u32) {
    unsafe {
        core::arch::asm!(
            "lock add dword ptr [{word}], 1",
            word = in(reg) word,
            options(nostack)
        );
    }
}

// Other architectures fault on unaligned atomics, increment the enclosing
// aligned word instead. There is no split lock to provoke there anyway.
#[cfg(not(target_arch = "x86_64"))]
unsafe fn locked_increment(word: *mut u32) {
    use std::sync::atomic::{AtomicU32, Ordering};
    let aligned = (word as usize & !(LOCK_WORD_SIZE - 1)) as *mut u32;
    unsafe { AtomicU32::from_ptr(aligned) }.fetch_add(1, Ordering::SeqCst);
}

/// Hammers every word of a shared [`LockBlock`] with locked increments.
pub struct BusLockUnit {
    block: Arc<LockBlock>,
    steps: u64,
    operations: u64,
}

impl BusLockUnit {
    pub fn new(block: Arc<LockBlock>) -> Self {
        Self {
            block,
            steps: 0,
            operations: 0,
        }
    }
}

impl ContentionUnit for BusLockUnit {
    fn step(&mut self, _clock: &dyn Clock, _deadline: Duration) -> Result<(), ContentionError> {
        for i in 0..self.block.words() {
            unsafe { locked_increment(self.block.word(i)) };
        }
        self.operations += self.block.words() as u64;
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

#[cfg(test)]
mod tests {
    use super::*;
    use cache_utils::clock::SystemClock;
    use std::thread;

    #[test]
    fn default_layout_splits_lines() {
        let block = LockBlock::allocate(3, 64).unwrap();
        // Bytes 3..259 cross the 64, 128, 192 and 256 boundaries.
        assert_eq!(block.split_words(64), 4);
        let block = LockBlock::allocate(3, 15).unwrap();
        assert_eq!(block.split_words(64), 0);
    }

    #[test]
    fn oversized_block_is_an_error() {
        assert!(matches!(
            LockBlock::allocate(3, usize::MAX / 2),
            Err(ContentionError::AllocationFailed {
                bytes: usize::MAX,
                ..
            })
        ));
    }

    #[test]
    fn words_are_misaligned() {
        let block = LockBlock::allocate(3, 4).unwrap();
        for i in 0..4 {
            assert_ne!(block.word(i) as usize % LOCK_WORD_SIZE, 0);
        }
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn concurrent_increments_are_atomic() {
        let block = Arc::new(LockBlock::allocate(3, 16).unwrap());
        let threads = 4;
        let steps = 25;
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let block = block.clone();
                thread::spawn(move || {
                    let clock = SystemClock::new();
                    let mut unit = BusLockUnit::new(block);
                    for _ in 0..steps {
                        unit.step(&clock, Duration::MAX).unwrap();
                    }
                    unit.stats()
                })
            })
            .collect();
        let ops: u64 = handles
            .into_iter()
            .map(|h| h.join().unwrap().operations)
            .sum();
        assert_eq!(ops, threads * steps * 16);
        assert_eq!(block.total(), ops);
    }
}
