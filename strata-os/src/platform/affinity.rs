use log::debug;

use super::cpuset::AffinitySet;
use super::numa::NumaTopology;

/// Where a heap's worker thread and its memory should live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapPlacement {
    pub processor: u16,
    /// `None` when NUMA placement is unavailable or the processor's node is
    /// unknown.
    pub node: Option<u16>,
}

/// Pins the calling thread to a single logical processor.
///
/// # Logic
/// Uses `sched_setaffinity(0, ..)` where available; snap's strict
/// confinement only permits the pid-0 form. Other platforms go through
/// `core_affinity`.
///
/// # Errors
/// Returns `false` when pinning is impossible. The thread keeps running
/// "floating"; callers treat the result as a hint.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn pin_thread_to_core(core_id: u16) -> bool {
    let core_id = usize::from(core_id);
    if core_id >= libc::CPU_SETSIZE as usize {
        return false;
    }

    // SAFETY: cpu_set_t is plain data; all-zero is a valid empty set.
    let mut cpu_set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    // SAFETY: `core_id` is below CPU_SETSIZE.
    unsafe {
        libc::CPU_ZERO(&mut cpu_set);
        libc::CPU_SET(core_id, &mut cpu_set);
    }

    // SAFETY:
    // - pid 0 refers to the calling thread.
    // - `cpu_set` is stack-allocated, valid, and sized by size_of.
    let ret = unsafe { libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpu_set) };
    if ret != 0 {
        debug!("Failed to pin thread to processor {}: {}", core_id, std::io::Error::last_os_error());
        return false;
    }
    true
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn pin_thread_to_core(core_id: u16) -> bool {
    let pinned = core_affinity::set_for_current(core_affinity::CoreId { id: usize::from(core_id) });
    if !pinned {
        debug!("Failed to pin thread to processor {}", core_id);
    }
    pinned
}

/// Narrows `affinity` to the administrator configuration.
///
/// A non-empty `ranges` set wins over `mask`; a zero mask and empty ranges
/// leave the set unchanged. The set never grows.
pub fn restrict<'a>(affinity: &'a mut AffinitySet, mask: u64, ranges: &AffinitySet) -> &'a AffinitySet {
    if !ranges.is_empty() {
        affinity.intersect_with(ranges);
    } else if mask != 0 {
        affinity.intersect_with(&AffinitySet::from_mask(mask));
    }
    affinity
}

/// Maps the `heap_number`-th heap onto the `heap_number`-th usable processor.
///
/// A pure function of the affinity set: the same heap always lands on the
/// same processor, and higher heap numbers land on higher processors.
pub fn processor_for_heap(affinity: &AffinitySet, numa: &NumaTopology, heap_number: u16) -> Option<HeapPlacement> {
    let processor = affinity.nth_member(usize::from(heap_number))?;
    Some(HeapPlacement {
        processor: u16::try_from(processor).ok()?,
        node: numa.node_of_cpu(processor),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restrict_prefers_ranges_over_mask() {
        let mut set = AffinitySet::first_n(8);
        let ranges = AffinitySet::parse_ranges("1-2").unwrap();
        restrict(&mut set, 0xF0, &ranges);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![1, 2]);

        let mut set = AffinitySet::first_n(8);
        restrict(&mut set, 0xF0, &AffinitySet::new());
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![4, 5, 6, 7]);

        let mut set = AffinitySet::first_n(8);
        restrict(&mut set, 0, &AffinitySet::new());
        assert_eq!(set.count(), 8);
    }

    #[test]
    fn test_restrict_never_grows() {
        let configs = ["0-3", "2-100", "5", "900-1000", ""];
        let mut set = AffinitySet::parse_ranges("0-7,64-71").unwrap();
        for config in configs {
            let before = set.clone();
            let ranges = AffinitySet::parse_ranges(config).unwrap();
            restrict(&mut set, u64::MAX, &ranges);
            assert!(set.is_subset_of(&before), "{config} grew the set");
        }
    }

    #[test]
    fn test_processor_for_heap_is_monotonic() {
        let affinity = AffinitySet::parse_ranges("2,5-6,40,130").unwrap();
        let numa = NumaTopology::from_nodes(
            &[(0, AffinitySet::parse_ranges("0-31").unwrap()), (1, AffinitySet::parse_ranges("32-255").unwrap())],
            true,
        );

        let placements: Vec<_> = (0..affinity.count() as u16)
            .map(|heap| processor_for_heap(&affinity, &numa, heap).unwrap())
            .collect();
        let processors: Vec<_> = placements.iter().map(|p| p.processor).collect();
        assert_eq!(processors, vec![2, 5, 6, 40, 130]);
        assert!(processors.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(placements[0].node, Some(0));
        assert_eq!(placements[3].node, Some(1));

        assert_eq!(processor_for_heap(&affinity, &numa, 5), None);
        assert_eq!(processor_for_heap(&affinity, &numa, 1), processor_for_heap(&affinity, &numa, 1));
    }

    #[test]
    fn test_processor_for_heap_without_numa() {
        let affinity = AffinitySet::first_n(4);
        let placement = processor_for_heap(&affinity, &NumaTopology::unavailable(), 3).unwrap();
        assert_eq!(placement, HeapPlacement { processor: 3, node: None });
    }

    #[test]
    fn test_pin_to_usable_processor() {
        let topo = crate::platform::topology::Topology::discover().unwrap();
        let first = topo.affinity().nth_member(0).unwrap() as u16;
        // Pinning is a hint; this only checks that the call completes on a
        // separate thread without disturbing the test runner's affinity.
        std::thread::spawn(move || {
            let _ = pin_thread_to_core(first);
        })
        .join()
        .unwrap();
    }
}
