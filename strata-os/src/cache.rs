//! Largest processor cache size, used to size gen0 budgets.
//!
//! Detection order:
//! 1. `sysconf` cache counters (glibc, only when configured)
//! 2. sysfs `/sys/devices/system/cpu/cpu0/cache/index{0..4}`
//! 3. `sysctl` counters (macOS)
//! 4. A heuristic from the usable processor count
//!
//! The answer is computed once per query kind and memoized.

use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;
use log::debug;

use crate::platform::read_memory_value;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSize {
    pub level: u32,
    pub size: u64,
}

/// One way of asking the OS for the largest cache.
pub trait CacheProbe: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` when the source is unavailable or reports nothing.
    fn probe(&self) -> Option<CacheSize>;
}

#[derive(Debug, Default)]
pub struct SysconfCache;

impl CacheProbe for SysconfCache {
    fn name(&self) -> &'static str {
        "sysconf"
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    fn probe(&self) -> Option<CacheSize> {
        let names = [
            (4, libc::_SC_LEVEL4_CACHE_SIZE),
            (3, libc::_SC_LEVEL3_CACHE_SIZE),
            (2, libc::_SC_LEVEL2_CACHE_SIZE),
            (1, libc::_SC_LEVEL1_DCACHE_SIZE),
        ];
        names
            .into_iter()
            .find_map(|(level, name)| crate::platform::sysconf(name).map(|size| CacheSize { level, size }))
    }

    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    fn probe(&self) -> Option<CacheSize> {
        None
    }
}

/// Reads `index{0..4}/size` and `index{0..4}/level` under a cache directory.
///
/// Reports the largest size found and the level of the last readable index,
/// which the kernel lists in ascending level order.
#[derive(Debug)]
pub struct SysfsCache {
    root: PathBuf,
}

impl SysfsCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for SysfsCache {
    fn default() -> Self {
        Self::new(sysfs_cache_root(0))
    }
}

impl CacheProbe for SysfsCache {
    fn name(&self) -> &'static str {
        "sysfs"
    }

    fn probe(&self) -> Option<CacheSize> {
        let mut found = CacheSize { level: 0, size: 0 };
        for index in 0..5 {
            let dir = self.root.join(format!("index{index}"));
            let Some(size) = read_memory_value(&dir.join("size")) else { continue };
            found.size = found.size.max(size);
            if let Some(level) = read_memory_value(&dir.join("level")).and_then(|l| u32::try_from(l).ok()) {
                found.level = level;
            }
        }
        (found.size > 0).then_some(found)
    }
}

#[derive(Debug, Default)]
pub struct SysctlCache;

impl CacheProbe for SysctlCache {
    fn name(&self) -> &'static str {
        "sysctl"
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    fn probe(&self) -> Option<CacheSize> {
        // perflevel0 is the performance cluster; the plain names describe
        // efficiency cores on heterogeneous parts.
        let names = [
            (3, "hw.perflevel0.l3cachesize"),
            (2, "hw.perflevel0.l2cachesize"),
            (3, "hw.l3cachesize"),
            (2, "hw.l2cachesize"),
            (1, "hw.l1dcachesize"),
        ];
        names.into_iter().find_map(|(level, name)| {
            let size = crate::platform::sysctl_by_name::<i64>(name)?;
            (size > 0).then_some(CacheSize { level, size: size as u64 })
        })
    }

    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    fn probe(&self) -> Option<CacheSize> {
        None
    }
}

/// Estimate from the number of usable processors. Always answers.
#[derive(Debug, Clone, Copy)]
pub struct HeuristicCache {
    logical_cpus: usize,
}

impl HeuristicCache {
    pub fn new(logical_cpus: usize) -> Self {
        Self { logical_cpus }
    }

    pub fn estimate(&self) -> CacheSize {
        let size = match self.logical_cpus {
            0..=4 => 4 * MIB,
            5..=16 => 8 * MIB,
            17..=64 => 16 * MIB,
            _ => 32 * MIB,
        };
        CacheSize { level: 0, size }
    }
}

impl CacheProbe for HeuristicCache {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn probe(&self) -> Option<CacheSize> {
        Some(self.estimate())
    }
}

/// Whether a non-L3 reading should give way to the heuristic. Cores on
/// these targets often report only a private L2, far below the shared
/// cache the collector wants.
const OVERRIDE_NON_L3: bool =
    cfg!(all(any(target_arch = "aarch64", target_arch = "loongarch64"), not(target_vendor = "apple")));

fn scaled(found: CacheSize, heuristic: CacheSize, override_non_l3: bool) -> u64 {
    if override_non_l3 && found.level != 3 {
        heuristic.size
    } else {
        found.size
    }
}

#[derive(Debug)]
pub struct CacheSizeEstimator {
    probes: Vec<Box<dyn CacheProbe>>,
    heuristic: HeuristicCache,
    true_size: CachePadded<AtomicU64>,
    scaled_size: CachePadded<AtomicU64>,
}

impl CacheSizeEstimator {
    /// The host probe chain; `from_sysconf` enables the `sysconf` counters.
    pub fn new(from_sysconf: bool, logical_cpus: usize) -> Self {
        let mut probes: Vec<Box<dyn CacheProbe>> = Vec::new();
        if from_sysconf {
            probes.push(Box::new(SysconfCache));
        }
        probes.push(Box::new(SysfsCache::default()));
        probes.push(Box::new(SysctlCache));
        Self::with_probes(probes, logical_cpus)
    }

    /// Consults `probes` in order before falling back to the heuristic.
    pub fn with_probes(probes: Vec<Box<dyn CacheProbe>>, logical_cpus: usize) -> Self {
        Self {
            probes,
            heuristic: HeuristicCache::new(logical_cpus),
            true_size: CachePadded::new(AtomicU64::new(0)),
            scaled_size: CachePadded::new(AtomicU64::new(0)),
        }
    }

    fn detect(&self) -> CacheSize {
        for probe in &self.probes {
            if let Some(found) = probe.probe().filter(|found| found.size > 0) {
                debug!("Cache size from {}: L{} {} KiB", probe.name(), found.level, found.size / 1024);
                return found;
            }
        }
        let estimate = self.heuristic.estimate();
        debug!("Cache size from heuristic: {} KiB", estimate.size / 1024);
        estimate
    }

    /// Largest cache in bytes, positive on every host.
    ///
    /// With `true_size` the detected size is returned as-is; otherwise it is
    /// adjusted for the architecture. Concurrent first calls may both detect;
    /// they store the same answer.
    pub fn size_per_logical_cpu(&self, true_size: bool) -> u64 {
        let cell = if true_size { &self.true_size } else { &self.scaled_size };
        let cached = cell.load(Ordering::Relaxed);
        if cached != 0 {
            return cached;
        }

        let found = self.detect();
        let true_value = found.size;
        let scaled_value = scaled(found, self.heuristic.estimate(), OVERRIDE_NON_L3);
        self.true_size.store(true_value, Ordering::Relaxed);
        self.scaled_size.store(scaled_value, Ordering::Relaxed);

        if true_size {
            true_value
        } else {
            scaled_value
        }
    }
}

/// Where sysfs cache topology lives for `cpu`.
pub fn sysfs_cache_root(cpu: usize) -> PathBuf {
    Path::new("/sys/devices/system/cpu").join(format!("cpu{cpu}/cache"))
}
