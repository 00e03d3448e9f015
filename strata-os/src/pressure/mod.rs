//! Physical memory limits and memory load.
//!
//! Which OS facility answers each question is decided once, when the probe
//! is built, by picking a [`MemorySource`]:
//! - `CgroupLimit` on Linux inside a memory cgroup
//! - `SysctlLimit` on macOS, iOS and FreeBSD
//! - `HeuristicLimit` everywhere else

pub mod cgroup;

use std::fmt::Debug;
use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{debug, info};

use crate::error::InitError;
use crate::memory::address_space_limit;
use crate::platform::parse_memory_value;

pub use cgroup::{Cgroup, CgroupVersion};

/// Platform answers the probe needs. Every method is queried on demand.
pub trait MemorySource: Send + Sync + Debug {
    /// Container hard limit in bytes, `None` when the process is unrestricted.
    fn restricted_limit(&self) -> Option<u64> {
        None
    }

    /// Bytes charged against the restricted limit.
    fn restricted_usage(&self) -> Option<u64> {
        None
    }

    /// Host-wide available physical memory in bytes.
    fn available_physical(&self, total_physical: u64) -> u64;

    /// Free swap in bytes.
    fn available_page_file(&self) -> u64;

    /// Address-space load in percent when an `RLIMIT_AS` is set.
    fn virtual_memory_load(&self) -> Option<u32> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryStatus {
    pub load_percent: u32,
    pub available_physical: u64,
    pub available_page_file: u64,
}

/// `part / whole` in percent, rounded up and capped at 100.
fn percent_of(part: u64, whole: u64) -> u32 {
    if whole == 0 {
        return 0;
    }
    let percent = (u128::from(part) * 100).div_ceil(u128::from(whole));
    percent.min(100) as u32
}

#[derive(Debug)]
pub struct MemoryProbe {
    total_physical: u64,
    /// Last restricted limit observed, zero when unrestricted.
    restricted: AtomicU64,
    source: Box<dyn MemorySource>,
}

impl MemoryProbe {
    /// Reads total physical memory and picks the host's memory source.
    ///
    /// # Errors
    /// Fails when the OS will not report total physical memory.
    pub fn detect(page_size: usize) -> Result<Self, InitError> {
        let total_physical = total_physical_memory(page_size).map_err(InitError::PhysicalMemory)?;
        let source = default_source(page_size);
        info!("Physical memory: {} MiB, source {:?}", total_physical >> 20, source);
        Ok(Self::with_source(total_physical, source))
    }

    /// A probe over explicit values, e.g. a simulated machine.
    pub fn with_source(total_physical: u64, source: Box<dyn MemorySource>) -> Self {
        Self { total_physical, restricted: AtomicU64::new(0), source }
    }

    pub fn total_physical(&self) -> u64 {
        self.total_physical
    }

    /// The restricted limit seen by the most recent query, zero if none.
    pub fn last_restricted_limit(&self) -> u64 {
        self.restricted.load(Ordering::Relaxed)
    }

    fn refresh_restricted_limit(&self) -> Option<u64> {
        let limit = self
            .source
            .restricted_limit()
            .filter(|&limit| limit != 0 && limit != u64::MAX)
            .map(|limit| {
                let limit = limit.min(self.total_physical);
                address_space_limit().map_or(limit, |rlimit| limit.min(rlimit))
            });
        self.restricted.store(limit.unwrap_or(0), Ordering::Relaxed);
        limit
    }

    /// Usable physical memory and whether a container limit applies.
    pub fn physical_memory_limit(&self) -> (u64, bool) {
        match self.refresh_restricted_limit() {
            Some(limit) => (limit, true),
            None => (self.total_physical, false),
        }
    }

    /// Current load and availability.
    ///
    /// # Logic
    /// Under a restricted limit, load is usage over the limit; an unreadable
    /// usage reports zero load and zero available. Otherwise load is the
    /// host's used share of total memory, raised to the address-space load
    /// when that is higher.
    pub fn memory_status(&self) -> MemoryStatus {
        let (load_percent, available_physical) = match self.refresh_restricted_limit() {
            Some(limit) => match self.source.restricted_usage() {
                Some(used) => (percent_of(used, limit), limit.saturating_sub(used)),
                None => (0, 0),
            },
            None => {
                let available = self.source.available_physical(self.total_physical);
                let load = percent_of(self.total_physical.saturating_sub(available), self.total_physical);
                let load = self.source.virtual_memory_load().map_or(load, |virtual_load| load.max(virtual_load));
                (load, available)
            }
        };

        MemoryStatus { load_percent, available_physical, available_page_file: self.source.available_page_file() }
    }
}

fn total_physical_memory(page_size: usize) -> io::Result<u64> {
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    if let Some(bytes) = crate::platform::sysctl_by_name::<u64>("hw.memsize") {
        return Ok(bytes);
    }

    crate::platform::sysconf(libc::_SC_PHYS_PAGES)
        .and_then(|pages| pages.checked_mul(page_size as u64))
        .ok_or_else(io::Error::last_os_error)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn default_source(page_size: usize) -> Box<dyn MemorySource> {
    match Cgroup::detect() {
        Some(cgroup) => Box::new(CgroupLimit::new(cgroup, HeuristicLimit::new(page_size))),
        None => Box::new(HeuristicLimit::new(page_size)),
    }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
fn default_source(page_size: usize) -> Box<dyn MemorySource> {
    Box::new(SysctlLimit::new(page_size))
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd"
)))]
fn default_source(page_size: usize) -> Box<dyn MemorySource> {
    Box::new(HeuristicLimit::new(page_size))
}

/// A memory cgroup's limit and usage on top of host-wide counters.
#[derive(Debug)]
pub struct CgroupLimit {
    cgroup: Cgroup,
    host: HeuristicLimit,
}

impl CgroupLimit {
    pub fn new(cgroup: Cgroup, host: HeuristicLimit) -> Self {
        Self { cgroup, host }
    }
}

impl MemorySource for CgroupLimit {
    fn restricted_limit(&self) -> Option<u64> {
        self.cgroup.memory_limit()
    }

    fn restricted_usage(&self) -> Option<u64> {
        self.cgroup.memory_usage()
    }

    fn available_physical(&self, total_physical: u64) -> u64 {
        self.host.available_physical(total_physical)
    }

    fn available_page_file(&self) -> u64 {
        self.host.available_page_file()
    }

    fn virtual_memory_load(&self) -> Option<u32> {
        self.host.virtual_memory_load()
    }
}

/// Host counters from procfs with `sysconf`/`sysinfo` fallbacks.
///
/// `/proc/meminfo` is consulted until it proves missing or lacks a
/// `MemAvailable` row; after that every query goes straight to `sysconf`.
#[derive(Debug)]
pub struct HeuristicLimit {
    page_size: usize,
    meminfo: PathBuf,
    statm: PathBuf,
    try_meminfo: AtomicBool,
}

impl HeuristicLimit {
    pub fn new(page_size: usize) -> Self {
        Self::with_paths(page_size, PathBuf::from("/proc/meminfo"), PathBuf::from("/proc/self/statm"))
    }

    pub fn with_paths(page_size: usize, meminfo: PathBuf, statm: PathBuf) -> Self {
        Self { page_size, meminfo, statm, try_meminfo: AtomicBool::new(true) }
    }

    /// `Ok(None)` means the file exists but has no usable `MemAvailable`.
    fn read_mem_available(&self) -> io::Result<Option<u64>> {
        let reader = BufReader::new(fs::File::open(&self.meminfo)?);
        for line in reader.lines() {
            let line = line?;
            if let Some(value) = line.strip_prefix("MemAvailable:") {
                // The kernel always reports this row in kB.
                return Ok(parse_memory_value(value.trim_start().trim_end_matches(" kB"))
                    .and_then(|kib| kib.checked_mul(1024)));
            }
        }
        Ok(None)
    }

    fn sysconf_available(&self) -> u64 {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            crate::platform::sysconf(libc::_SC_AVPHYS_PAGES).map_or(0, |pages| pages.saturating_mul(self.page_size as u64))
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            0
        }
    }

    fn current_virtual_size(&self) -> Option<u64> {
        let statm = fs::read_to_string(&self.statm).ok()?;
        let pages = parse_memory_value(statm.split_whitespace().next()?)?;
        pages.checked_mul(self.page_size as u64)
    }
}

impl MemorySource for HeuristicLimit {
    fn available_physical(&self, _total_physical: u64) -> u64 {
        if self.try_meminfo.load(Ordering::Relaxed) {
            match self.read_mem_available() {
                Ok(Some(available)) => return available,
                Ok(None) => {
                    debug!("{} has no MemAvailable, using sysconf from now on", self.meminfo.display());
                    self.try_meminfo.store(false, Ordering::Relaxed);
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    debug!("{} is missing, using sysconf from now on", self.meminfo.display());
                    self.try_meminfo.store(false, Ordering::Relaxed);
                }
                Err(err) => debug!("Failed to read {}: {}", self.meminfo.display(), err),
            }
        }
        self.sysconf_available()
    }

    fn available_page_file(&self) -> u64 {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            // SAFETY: sysinfo is plain data and `info` a valid out-parameter.
            let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
            if unsafe { libc::sysinfo(&mut info) } != 0 {
                return 0;
            }
            (info.freeswap as u64).saturating_mul(u64::from(info.mem_unit))
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            0
        }
    }

    fn virtual_memory_load(&self) -> Option<u32> {
        let limit = address_space_limit()?;
        Some(percent_of(self.current_virtual_size()?, limit))
    }
}

/// Counters read through `sysctlbyname`.
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
#[derive(Debug)]
pub struct SysctlLimit {
    page_size: usize,
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
impl SysctlLimit {
    pub fn new(page_size: usize) -> Self {
        Self { page_size }
    }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
impl MemorySource for SysctlLimit {
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    fn available_physical(&self, total_physical: u64) -> u64 {
        use crate::platform::sysctl_by_name;
        // Percentage of memory the kernel considers free.
        sysctl_by_name::<u32>("kern.memorystatus_level").map_or(0, |level| u64::from(level) * total_physical / 100)
    }

    #[cfg(target_os = "freebsd")]
    fn available_physical(&self, _total_physical: u64) -> u64 {
        use crate::platform::sysctl_by_name;
        let pages: u64 = ["vm.stats.vm.v_inactive_count", "vm.stats.vm.v_laundry_count", "vm.stats.vm.v_free_count"]
            .iter()
            .map(|name| u64::from(sysctl_by_name::<u32>(name).unwrap_or(0)))
            .sum();
        pages * self.page_size as u64
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    fn available_page_file(&self) -> u64 {
        crate::platform::sysctl_by_name::<libc::xsw_usage>("vm.swapusage").map_or(0, |usage| usage.xsu_avail)
    }

    #[cfg(target_os = "freebsd")]
    fn available_page_file(&self) -> u64 {
        // vm.swap_info is a per-device table; only the total is exported
        // by name.
        let _ = self.page_size;
        0
    }
}
