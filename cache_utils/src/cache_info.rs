//! Geometry of the cache hierarchy, as far as CPUID tells us, used to size
//! eviction buffers. Unknown values fall back to conservative defaults.

use serde::{Deserialize, Serialize};

pub const DEFAULT_LINE_SIZE: usize = 64;
/// Buffer used when the last level cache size cannot be determined.
pub const FALLBACK_LLC_BUFFER_SIZE: usize = 100 << 20;
/// How many times the LLC an eviction buffer spans.
pub const LLC_BUFFER_FACTOR: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheGeometry {
    pub line_size: usize,
    pub llc_level: Option<u8>,
    pub llc_size: Option<usize>,
}

impl Default for CacheGeometry {
    fn default() -> Self {
        Self {
            line_size: DEFAULT_LINE_SIZE,
            llc_level: None,
            llc_size: None,
        }
    }
}

impl CacheGeometry {
    pub fn detect() -> Self {
        let mut geometry = detect_geometry().unwrap_or_default();
        // Some hypervisors report garbage here.
        if !geometry.line_size.is_power_of_two() {
            geometry.line_size = DEFAULT_LINE_SIZE;
        }
        geometry
    }

    /// Size of a buffer that cannot fit in the last level cache.
    pub fn eviction_buffer_size(&self) -> usize {
        match self.llc_size {
            Some(size) if size > 0 => size.saturating_mul(LLC_BUFFER_FACTOR),
            _ => FALLBACK_LLC_BUFFER_SIZE,
        }
    }
}

#[cfg(target_arch = "x86_64")]
fn detect_geometry() -> Option<CacheGeometry> {
    use raw_cpuid::{CacheType, CpuId};

    let cpuid = CpuId::new();
    // Intel: deterministic cache parameters (leaf 4).
    if let Some(parameters) = cpuid.get_cache_parameters() {
        let llc = parameters
            .filter(|c| matches!(c.cache_type(), CacheType::Data | CacheType::Unified))
            .max_by_key(|c| c.level());
        if let Some(llc) = llc {
            let size = llc.associativity()
                * llc.physical_line_partitions()
                * llc.coherency_line_size()
                * llc.sets();
            return Some(CacheGeometry {
                line_size: llc.coherency_line_size(),
                llc_level: Some(llc.level()),
                llc_size: Some(size),
            });
        }
    }
    // AMD: extended leaf 0x8000_0006.
    if let Some(info) = cpuid.get_l2_l3_cache_and_tlb_info() {
        return Some(geometry_from_extended_leaf(
            info.l2cache_size() as usize,
            info.l2cache_line_size() as usize,
            info.l3cache_size() as usize,
            info.l3cache_line_size() as usize,
        ));
    }
    None
}

/// L2 size is in KB, L3 size in 512KB units. A zero L3 means there is none
/// and the L2 is the last level.
#[cfg_attr(not(target_arch = "x86_64"), allow(dead_code))]
fn geometry_from_extended_leaf(
    l2_kib: usize,
    l2_line: usize,
    l3_units: usize,
    l3_line: usize,
) -> CacheGeometry {
    if l3_units > 0 {
        CacheGeometry {
            line_size: l3_line,
            llc_level: Some(3),
            llc_size: Some(l3_units * (512 << 10)),
        }
    } else {
        CacheGeometry {
            line_size: l2_line,
            llc_level: Some(2),
            llc_size: Some(l2_kib * 1024),
        }
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn detect_geometry() -> Option<CacheGeometry> {
    None
}
