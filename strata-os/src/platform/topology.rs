use log::{info, warn};

use super::cpuset::{AffinitySet, MAX_SUPPORTED_CPUS};
use super::numa::NumaTopology;
use crate::error::InitError;

/// Hardware topology snapshot taken once at initialization.
///
/// Holds the logical processor count, the processors this process may run
/// on, and the NUMA layout. Nothing here changes after discovery; the
/// affinity set is copied into the context and narrowed there.
#[derive(Debug, Clone)]
pub struct Topology {
    processor_count: u32,
    affinity: AffinitySet,
    numa: NumaTopology,
}

impl Topology {
    /// Detects the processor count, process affinity and NUMA layout.
    ///
    /// # Errors
    /// Fails only when the OS will not report a processor count.
    pub fn discover() -> Result<Self, InitError> {
        let processor_count = super::processor_count().map_err(InitError::ProcessorCount)?;
        let affinity = process_affinity(processor_count);
        let numa = NumaTopology::detect();

        info!(
            "Topology Discovery: {} logical processors, {} usable, NUMA {}",
            processor_count,
            affinity.count(),
            if numa.is_available() {
                format!("available (highest node {})", numa.highest_node())
            } else {
                "unavailable".to_string()
            }
        );

        Ok(Self { processor_count, affinity, numa })
    }

    /// Assembles a snapshot from known values, e.g. a simulated machine.
    pub fn from_parts(processor_count: u32, affinity: AffinitySet, numa: NumaTopology) -> Self {
        Self { processor_count, affinity, numa }
    }

    /// Every processor of a `processor_count` machine, no NUMA.
    pub fn uniform(processor_count: u32) -> Self {
        Self::from_parts(processor_count, AffinitySet::first_n(processor_count as usize), NumaTopology::unavailable())
    }

    pub fn processor_count(&self) -> u32 {
        self.processor_count
    }

    pub fn affinity(&self) -> &AffinitySet {
        &self.affinity
    }

    pub fn numa(&self) -> &NumaTopology {
        &self.numa
    }
}

/// The processors the scheduler lets this process use.
///
/// Falls back to `[0, processor_count)` when the OS has no affinity query or
/// the query fails.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn process_affinity(processor_count: u32) -> AffinitySet {
    // SAFETY: cpu_set_t is plain data; all-zero is a valid empty set.
    let mut cpu_set: libc::cpu_set_t = unsafe { std::mem::zeroed() };

    // SAFETY: pid 0 is the calling thread and `cpu_set` is a valid,
    // correctly sized out-parameter.
    let ret = unsafe { libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut cpu_set) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        warn!("sched_getaffinity failed: {}. Assuming all {} processors are usable.", err, processor_count);
        return AffinitySet::first_n(processor_count as usize);
    }

    let limit = (libc::CPU_SETSIZE as usize).min(MAX_SUPPORTED_CPUS);
    // SAFETY: CPU_ISSET only reads `cpu_set` within CPU_SETSIZE.
    (0..limit).filter(|&cpu| unsafe { libc::CPU_ISSET(cpu, &cpu_set) }).collect()
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn process_affinity(processor_count: u32) -> AffinitySet {
    AffinitySet::first_n((processor_count as usize).min(MAX_SUPPORTED_CPUS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover() {
        let topo = Topology::discover().unwrap();
        assert!(topo.processor_count() >= 1);
        assert!(!topo.affinity().is_empty());
        assert!(topo.affinity().count() <= MAX_SUPPORTED_CPUS);
    }

    #[test]
    fn test_uniform() {
        let topo = Topology::uniform(8);
        assert_eq!(topo.processor_count(), 8);
        assert_eq!(topo.affinity().iter().collect::<Vec<_>>(), (0..8).collect::<Vec<_>>());
        assert!(!topo.numa().is_available());
    }
}
