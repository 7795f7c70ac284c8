//! Pinning the probing thread to one core for the duration of a measurement.

#[cfg(target_os = "linux")]
mod imp {
    use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    /// Restores the affinity the thread had before [`pin_to_core`].
    #[must_use = "the previous affinity is restored when the guard is dropped"]
    #[derive(Debug)]
    pub struct AffinityGuard {
        previous: CpuSet,
    }

    pub fn pin_to_core(core: usize) -> Result<AffinityGuard, nix::Error> {
        let previous = sched_getaffinity(Pid::from_raw(0))?;
        let mut set = CpuSet::new();
        set.set(core)?;
        sched_setaffinity(Pid::from_raw(0), &set)?;
        tracing::debug!("pinned to core {}", core);
        Ok(AffinityGuard { previous })
    }

    impl Drop for AffinityGuard {
        fn drop(&mut self) {
            if let Err(e) = sched_setaffinity(Pid::from_raw(0), &self.previous) {
                tracing::warn!("failed to restore affinity: {}", e);
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    #[must_use = "the previous affinity is restored when the guard is dropped"]
    #[derive(Debug)]
    pub struct AffinityGuard;

    pub fn pin_to_core(_core: usize) -> Result<AffinityGuard, nix::Error> {
        Err(nix::Error::ENOSYS)
    }
}

pub use imp::{pin_to_core, AffinityGuard};

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use nix::sched::{sched_getaffinity, CpuSet};
    use nix::unistd::Pid;

    #[test]
    fn affinity_is_restored() {
        let before = sched_getaffinity(Pid::from_raw(0)).unwrap();
        let Some(core) = (0..CpuSet::count()).find(|&c| before.is_set(c).unwrap_or(false)) else {
            return;
        };
        {
            let _guard = pin_to_core(core).unwrap();
            let pinned = sched_getaffinity(Pid::from_raw(0)).unwrap();
            assert!(pinned.is_set(core).unwrap());
            let others = (0..CpuSet::count()).filter(|&c| pinned.is_set(c).unwrap_or(false));
            assert_eq!(others.count(), 1);
        }
        assert_eq!(sched_getaffinity(Pid::from_raw(0)).unwrap(), before);
    }

    #[test]
    fn out_of_range_core_is_rejected() {
        assert!(pin_to_core(CpuSet::count()).is_err());
    }
}
