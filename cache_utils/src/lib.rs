#![deny(unsafe_op_in_unsafe_fn)]
#![allow(clippy::missing_safety_doc)]

pub mod cache_info;
pub mod clock;
pub mod mmap;
pub mod primitives;
pub mod probe;

pub use clock::{busy_wait_until, Clock, ManualClock, SystemClock};
pub use primitives::{NativePrimitives, PrimitiveOp, ScriptedPrimitives, TimingPrimitives};
pub use probe::{ProbeConfig, ProbeError, ProbeMode, ProbeSamples, TargetDefect, TimingProbe};

use core::fmt::{Display, Formatter};
use core::ptr;

#[cfg(target_arch = "x86_64")]
use core::arch::x86_64 as arch_x86;

// rdtsc (has mfence before and after)
#[cfg(target_arch = "x86_64")]
pub unsafe fn rdtsc_fence() -> u64 {
    unsafe {
        arch_x86::_mm_mfence();
        let tsc: u64 = arch_x86::_rdtsc();
        arch_x86::_mm_mfence();
        tsc
    }
}

pub unsafe fn maccess<T>(p: *const T) {
    unsafe { ptr::read_volatile(p) };
}

// flush (cflush)
#[cfg(target_arch = "x86_64")]
pub unsafe fn flush(p: *const u8) {
    unsafe { arch_x86::_mm_clflush(p) };
}

/**
Location of a byte inside a mapping or an allocation owned by someone else.

An `Address` is never dereferenced except by the timing primitives; whoever
builds one is responsible for keeping the memory mapped while it is probed.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(*const u8);

// The pointer is only an identifier here, every read goes through an unsafe
// primitive whose caller vouches for validity.
unsafe impl Send for Address {}
unsafe impl Sync for Address {}

impl Address {
    pub const fn null() -> Self {
        Address(ptr::null())
    }

    pub fn from_ptr<T>(p: *const T) -> Self {
        Address(p as *const u8)
    }

    pub fn of<T>(r: &T) -> Self {
        Self::from_ptr(r as *const T)
    }

    pub fn as_ptr(self) -> *const u8 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    /// `align` must be a power of two.
    pub fn is_aligned_to(self, align: usize) -> bool {
        (self.0 as usize) & (align - 1) == 0
    }

    pub fn wrapping_add(self, bytes: usize) -> Self {
        Address(self.0.wrapping_add(bytes))
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:p}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::Address;

    #[test]
    fn address_alignment() {
        let words = [0u64; 2];
        let a = Address::of(&words[0]);
        assert!(a.is_aligned_to(8));
        assert!(!a.wrapping_add(3).is_aligned_to(4));
        assert!(a.wrapping_add(3).is_aligned_to(1));
        assert!(Address::null().is_null());
        assert!(!a.is_null());
    }
}
