use crate::Address;
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Fenced L1 hit as seen through two `rdtsc_fence` reads on the machines we
/// calibrated on. Hits measured with the native primitives sit around it.
pub const NATIVE_NOISE_FLOOR: u64 = 120;

/**
The two operations every timing measurement is built from: evicting a line
and timing an access to it.
*/
pub trait TimingPrimitives: Debug + Send + Sync {
    /// Whether the host supports these primitives at all.
    fn available(&self) -> bool;
    /// Targets must be aligned to this many bytes (a power of two).
    fn granularity(&self) -> usize;
    /// Latency of a hit in the closest cache level, in primitive units.
    fn noise_floor(&self) -> u64;
    /// # Safety
    ///
    /// addr must be a valid pointer to read.
    unsafe fn flush(&self, addr: Address);
    /// # Safety
    ///
    /// addr must be a valid pointer to read `granularity()` bytes from.
    unsafe fn access(&self, addr: Address) -> u64;
}

impl<T: TimingPrimitives + ?Sized> TimingPrimitives for &T {
    fn available(&self) -> bool {
        (**self).available()
    }

    fn granularity(&self) -> usize {
        (**self).granularity()
    }

    fn noise_floor(&self) -> u64 {
        (**self).noise_floor()
    }

    unsafe fn flush(&self, addr: Address) {
        unsafe { (**self).flush(addr) }
    }

    unsafe fn access(&self, addr: Address) -> u64 {
        unsafe { (**self).access(addr) }
    }
}

impl<T: TimingPrimitives + ?Sized> TimingPrimitives for Arc<T> {
    fn available(&self) -> bool {
        (**self).available()
    }

    fn granularity(&self) -> usize {
        (**self).granularity()
    }

    fn noise_floor(&self) -> u64 {
        (**self).noise_floor()
    }

    unsafe fn flush(&self, addr: Address) {
        unsafe { (**self).flush(addr) }
    }

    unsafe fn access(&self, addr: Address) -> u64 {
        unsafe { (**self).access(addr) }
    }
}

/*************
 * Native    *
 *************/

/// clflush + fenced rdtsc. Only ever available on x86_64 hosts whose CPUID
/// reports both instructions.
#[derive(Debug, Clone, Copy)]
pub struct NativePrimitives {
    available: bool,
}

impl NativePrimitives {
    pub fn detect() -> Self {
        Self {
            available: detect_native(),
        }
    }
}

impl Default for NativePrimitives {
    fn default() -> Self {
        Self::detect()
    }
}

#[cfg(target_arch = "x86_64")]
fn detect_native() -> bool {
    let cpuid = raw_cpuid::CpuId::new();
    cpuid
        .get_feature_info()
        .map_or(false, |info| info.has_clflush() && info.has_tsc())
}

#[cfg(not(target_arch = "x86_64"))]
fn detect_native() -> bool {
    false
}

impl TimingPrimitives for NativePrimitives {
    fn available(&self) -> bool {
        self.available
    }

    // The timed load reads a whole word, which must not straddle two lines.
    fn granularity(&self) -> usize {
        core::mem::align_of::<usize>()
    }

    fn noise_floor(&self) -> u64 {
        NATIVE_NOISE_FLOOR
    }

    #[cfg(target_arch = "x86_64")]
    unsafe fn flush(&self, addr: Address) {
        unsafe { crate::flush(addr.as_ptr()) };
    }

    #[cfg(target_arch = "x86_64")]
    unsafe fn access(&self, addr: Address) -> u64 {
        unsafe {
            let t = crate::rdtsc_fence();
            crate::maccess(addr.as_ptr() as *const usize);
            crate::rdtsc_fence().saturating_sub(t)
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    unsafe fn flush(&self, _addr: Address) {}

    #[cfg(not(target_arch = "x86_64"))]
    unsafe fn access(&self, _addr: Address) -> u64 {
        0
    }
}

/*************
 * Scripted  *
 *************/

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveOp {
    Flush(Address),
    Access(Address),
}

/**
Replays a fixed latency script and records every call, without touching
memory. Used to test the sampling loops on any host.
*/
#[derive(Debug)]
pub struct ScriptedPrimitives {
    latencies: Vec<u64>,
    cursor: AtomicUsize,
    trace: Mutex<Vec<PrimitiveOp>>,
    granularity: usize,
    noise_floor: u64,
    available: bool,
}

impl ScriptedPrimitives {
    /// Accesses return `latencies` in order, wrapping around at the end
    /// (zero for an empty script).
    pub fn new(latencies: impl Into<Vec<u64>>) -> Self {
        Self {
            latencies: latencies.into(),
            cursor: AtomicUsize::new(0),
            trace: Mutex::new(Vec::new()),
            granularity: 1,
            noise_floor: 0,
            available: true,
        }
    }

    pub fn with_granularity(mut self, granularity: usize) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn with_noise_floor(mut self, noise_floor: u64) -> Self {
        self.noise_floor = noise_floor;
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn trace(&self) -> Vec<PrimitiveOp> {
        match self.trace.lock() {
            Ok(t) => t.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn log(&self, op: PrimitiveOp) {
        match self.trace.lock() {
            Ok(mut t) => t.push(op),
            Err(poisoned) => poisoned.into_inner().push(op),
        }
    }
}

impl TimingPrimitives for ScriptedPrimitives {
    fn available(&self) -> bool {
        self.available
    }

    fn granularity(&self) -> usize {
        self.granularity
    }

    fn noise_floor(&self) -> u64 {
        self.noise_floor
    }

    unsafe fn flush(&self, addr: Address) {
        self.log(PrimitiveOp::Flush(addr));
    }

    unsafe fn access(&self, addr: Address) -> u64 {
        self.log(PrimitiveOp::Access(addr));
        if self.latencies.is_empty() {
            return 0;
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.latencies[i % self.latencies.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_replays_and_wraps() {
        let p = ScriptedPrimitives::new(vec![1, 2, 3]);
        let x = 0usize;
        let a = Address::of(&x);
        let got: Vec<u64> = (0..5).map(|_| unsafe { p.access(a) }).collect();
        assert_eq!(got, vec![1, 2, 3, 1, 2]);
        unsafe { p.flush(a) };
        let trace = p.trace();
        assert_eq!(trace.len(), 6);
        assert_eq!(trace[5], PrimitiveOp::Flush(a));
    }

    #[test]
    fn shared_primitives_forward() {
        let p = Arc::new(ScriptedPrimitives::new(vec![9]).with_granularity(64));
        let r = &p;
        assert_eq!(r.granularity(), 64);
        let x = 0usize;
        assert_eq!(unsafe { TimingPrimitives::access(&p, Address::of(&x)) }, 9);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn native_access_on_x86_64() {
        let p = NativePrimitives::detect();
        if !p.available() {
            return;
        }
        let x = 7usize;
        let a = Address::of(&x);
        unsafe {
            p.flush(a);
            // Timings vary too much to assert anything but that this runs.
            let _miss = p.access(a);
            let _hit = p.access(a);
        }
    }
}
