use log::{debug, info};

use crate::barrier::{FlushStrategy, WriteBufferFlusher};
use crate::cache::CacheSizeEstimator;
use crate::config::OsConfig;
use crate::error::InitError;
use crate::memory::VirtualMemory;
use crate::platform::affinity::{self, HeapPlacement};
use crate::platform::cpuset::{AffinityError, AffinitySet};
use crate::platform::page_size;
use crate::platform::topology::Topology;
use crate::pressure::{MemoryProbe, MemoryStatus};

/// Everything the collector needs from the OS, discovered once.
///
/// # Lifecycle
/// `initialize` -> restrict affinity (single-threaded, needs `&mut`) ->
/// share `&OsContext` with heap threads -> `shutdown`. Nothing is reachable
/// before `initialize` or after `shutdown`.
#[derive(Debug)]
pub struct OsContext {
    config: OsConfig,
    page_size: usize,
    topology: Topology,
    affinity: AffinitySet,
    vm: VirtualMemory,
    flusher: WriteBufferFlusher,
    memory: MemoryProbe,
    cache: CacheSizeEstimator,
}

impl OsContext {
    /// Probes the host.
    ///
    /// # Errors
    /// Fails when the processor count or physical memory size is unreadable,
    /// or when the flush helper page cannot be set up. Every other missing
    /// facility degrades instead.
    pub fn initialize(config: OsConfig) -> Result<Self, InitError> {
        let page_size = page_size();
        let topology = Topology::discover()?;
        let flusher = WriteBufferFlusher::initialize(page_size)?;
        let memory = MemoryProbe::detect(page_size)?;

        let context = Self::from_parts(config, page_size, topology, flusher, memory);
        info!(
            "Platform initialized: page {} B, {} processors ({} usable), flush via {}",
            context.page_size,
            context.total_processor_count(),
            context.affinity.count(),
            context.flush_strategy()
        );
        Ok(context)
    }

    /// Assembles a context from already-probed parts, e.g. a simulated
    /// machine.
    pub fn from_parts(
        config: OsConfig,
        page_size: usize,
        topology: Topology,
        flusher: WriteBufferFlusher,
        memory: MemoryProbe,
    ) -> Self {
        let affinity = topology.affinity().clone();
        let vm = VirtualMemory::new(page_size, topology.numa().clone());
        let cache = CacheSizeEstimator::new(config.cache_size_from_sysconf, affinity.count());
        Self { config, page_size, topology, affinity, vm, flusher, memory, cache }
    }

    /// Releases the flush helper page, if any.
    pub fn shutdown(self) {
        debug!("Platform shutdown, releasing {} flush state", self.flusher.strategy());
    }

    pub fn config(&self) -> &OsConfig {
        &self.config
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn total_processor_count(&self) -> u32 {
        self.topology.processor_count()
    }

    /// Processors heap threads may use.
    pub fn affinity(&self) -> &AffinitySet {
        &self.affinity
    }

    pub fn virtual_memory(&self) -> &VirtualMemory {
        &self.vm
    }

    pub fn flush_strategy(&self) -> FlushStrategy {
        self.flusher.strategy()
    }

    pub fn can_enable_numa_aware(&self) -> bool {
        self.topology.numa().is_available()
    }

    /// Processor groups are a Windows concept.
    pub fn can_enable_cpu_groups(&self) -> bool {
        false
    }

    /// Narrows the usable processors; see [`affinity::restrict`].
    pub fn restrict_affinity(&mut self, mask: u64, ranges: &AffinitySet) -> &AffinitySet {
        affinity::restrict(&mut self.affinity, mask, ranges);
        self.refresh_cache_estimator();
        &self.affinity
    }

    /// Applies the mask and range list from the configuration.
    ///
    /// # Errors
    /// A malformed range list is rejected before anything changes.
    pub fn apply_configured_affinity(&mut self) -> Result<&AffinitySet, AffinityError> {
        let ranges = match self.config.affinitize_ranges.as_deref() {
            Some(list) => AffinitySet::parse_ranges(list)?,
            None => AffinitySet::new(),
        };
        let mask = self.config.affinitize_mask;
        Ok(self.restrict_affinity(mask, &ranges))
    }

    // The size heuristic scales with usable processors.
    fn refresh_cache_estimator(&mut self) {
        self.cache = CacheSizeEstimator::new(self.config.cache_size_from_sysconf, self.affinity.count());
    }

    /// Pins the calling thread; `false` leaves it floating.
    pub fn bind_current_thread(&self, processor: u16) -> bool {
        affinity::pin_thread_to_core(processor)
    }

    pub fn processor_for_heap(&self, heap_number: u16) -> Option<HeapPlacement> {
        affinity::processor_for_heap(&self.affinity, self.topology.numa(), heap_number)
    }

    /// Forces a full memory barrier on every running thread of the process.
    pub fn flush_process_write_buffers(&self) {
        self.flusher.flush();
    }

    pub fn physical_memory_limit(&self) -> (u64, bool) {
        self.memory.physical_memory_limit()
    }

    pub fn memory_status(&self) -> MemoryStatus {
        self.memory.memory_status()
    }

    pub fn total_physical_memory(&self) -> u64 {
        self.memory.total_physical()
    }

    pub fn cache_size_per_logical_cpu(&self, true_size: bool) -> u64 {
        self.cache.size_per_logical_cpu(true_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pressure::MemorySource;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    const GIB: u64 = 1 << 30;

    /// A machine with a fixed amount free and an optional cgroup.
    #[derive(Debug)]
    struct SimulatedMachine {
        cgroup_limit: Option<u64>,
        cgroup_usage: Arc<AtomicU64>,
        available: u64,
    }

    impl MemorySource for SimulatedMachine {
        fn restricted_limit(&self) -> Option<u64> {
            self.cgroup_limit
        }

        fn restricted_usage(&self) -> Option<u64> {
            Some(self.cgroup_usage.load(Ordering::Relaxed))
        }

        fn available_physical(&self, _total_physical: u64) -> u64 {
            self.available
        }

        fn available_page_file(&self) -> u64 {
            0
        }
    }

    fn simulated(config: OsConfig, cgroup_limit: Option<u64>) -> (OsContext, Arc<AtomicU64>) {
        let usage = Arc::new(AtomicU64::new(0));
        let machine = SimulatedMachine { cgroup_limit, cgroup_usage: Arc::clone(&usage), available: 12 * GIB };
        let context = OsContext::from_parts(
            config,
            page_size(),
            Topology::uniform(8),
            WriteBufferFlusher::helper_page(page_size()).unwrap(),
            MemoryProbe::with_source(16 * GIB, Box::new(machine)),
        );
        (context, usage)
    }

    #[test]
    fn test_unrestricted_machine() {
        let (context, _) = simulated(OsConfig::default(), None);
        assert_eq!(context.total_processor_count(), 8);
        assert_eq!(context.physical_memory_limit(), (16 * GIB, false));
        assert_eq!(context.memory_status().load_percent, 25);
        assert!(!context.can_enable_numa_aware());
        assert!(!context.can_enable_cpu_groups());
        context.shutdown();
    }

    #[test]
    fn test_cgroup_restricted_machine() {
        let (context, usage) = simulated(OsConfig::default(), Some(2 * GIB));

        let (limit, restricted) = context.physical_memory_limit();
        assert!(restricted);
        assert!(limit > 0 && limit <= 2 * GIB);
        assert_eq!(context.memory_status().load_percent, 0);

        usage.store(1, Ordering::Relaxed);
        let status = context.memory_status();
        assert!(status.load_percent > 0);
        assert_eq!(status.available_physical, limit - 1);
        context.shutdown();
    }

    #[test]
    fn test_configured_affinity() {
        let config = OsConfig { affinitize_mask: 0xF0, ..Default::default() };
        let (mut context, _) = simulated(config, None);

        let usable: Vec<_> = context.apply_configured_affinity().unwrap().iter().collect();
        assert_eq!(usable, vec![4, 5, 6, 7]);
        assert_eq!(context.processor_for_heap(0), Some(HeapPlacement { processor: 4, node: None }));
        assert_eq!(context.processor_for_heap(4), None);
    }

    #[test]
    fn test_malformed_ranges_leave_affinity_alone() {
        let config = OsConfig { affinitize_ranges: Some("0-3,x".to_string()), ..Default::default() };
        let (mut context, _) = simulated(config, None);

        assert!(context.apply_configured_affinity().is_err());
        assert_eq!(context.affinity().count(), 8);
    }

    #[test]
    fn test_simulated_machine_services() {
        let (context, _) = simulated(OsConfig::default(), None);
        context.flush_process_write_buffers();
        assert_eq!(context.flush_strategy(), FlushStrategy::HelperPage);
        assert!(context.cache_size_per_logical_cpu(true) > 0);

        let vm = context.virtual_memory();
        let size = 4 * context.page_size();
        let addr = vm.reserve(size, 0, None, false).unwrap();
        unsafe {
            vm.commit(addr, size, None).unwrap();
            vm.release(addr, size).unwrap();
        }
    }

    #[test]
    fn test_flush_reaches_helper_page() {
        let (context, _) = simulated(OsConfig::default(), None);
        let WriteBufferFlusher::HelperPage(page) = &context.flusher else { unreachable!() };
        let before = page.flush_count();
        for _ in 0..5 {
            context.flush_process_write_buffers();
        }
        assert_eq!(page.flush_count(), before + 5);
    }

    #[test]
    fn test_initialize_host() {
        let mut context = OsContext::initialize(OsConfig::default()).unwrap();
        assert!(context.total_processor_count() >= 1);
        assert!(context.apply_configured_affinity().unwrap().count() >= 1);
        assert!(context.processor_for_heap(0).is_some());
        let (limit, _) = context.physical_memory_limit();
        assert!(limit > 0);
        context.flush_process_write_buffers();
        context.shutdown();
    }
}
