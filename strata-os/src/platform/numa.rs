//! NUMA node discovery and memory placement hints.
//!
//! Detection order:
//! 1. hwloc (when the `hwloc` feature is enabled)
//! 2. sysfs on Linux (`/sys/devices/system/node`)
//! 3. "NUMA unavailable" everywhere else
//!
//! Placement is always a hint. A failed binding never fails the caller.

use std::fs;
use std::path::Path;

use log::{debug, warn};

use super::cpuset::{AffinitySet, MAX_SUPPORTED_CPUS};

/// Sentinel the collector uses for "no particular node".
pub const NUMA_NODE_UNDEFINED: u16 = u16::MAX;

const SYSFS_NODE_ROOT: &str = "/sys/devices/system/node";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumaTopology {
    available: bool,
    highest_node: u16,
    cpu_to_node: Vec<Option<u16>>,
}

impl NumaTopology {
    /// Detects the host NUMA layout. Never fails.
    pub fn detect() -> Self {
        #[cfg(feature = "hwloc")]
        {
            if let Some(topology) = Self::detect_hwloc() {
                return topology;
            }
        }

        match Self::from_sysfs(Path::new(SYSFS_NODE_ROOT), mempolicy_supported()) {
            Some(topology) => topology,
            None => {
                debug!("NUMA topology unavailable, using single-node placement");
                Self::unavailable()
            }
        }
    }

    /// Topology that disables every placement hint.
    pub fn unavailable() -> Self {
        Self { available: false, highest_node: 0, cpu_to_node: Vec::new() }
    }

    /// Builds a topology from explicit node membership lists.
    ///
    /// Placement is enabled when more than one node exists and the kernel
    /// accepts memory policy calls.
    pub fn from_nodes(nodes: &[(u16, AffinitySet)], mempolicy: bool) -> Self {
        let highest_node = nodes.iter().map(|(node, _)| *node).max().unwrap_or(0);
        let mut cpu_to_node = vec![None; MAX_SUPPORTED_CPUS];
        for (node, cpus) in nodes {
            for cpu in cpus.iter() {
                cpu_to_node[cpu] = Some(*node);
            }
        }
        Self { available: mempolicy && highest_node > 0, highest_node, cpu_to_node }
    }

    /// Reads `nodeN/cpulist` entries under a sysfs node directory.
    pub fn from_sysfs(root: &Path, mempolicy: bool) -> Option<Self> {
        let mut nodes = Vec::new();
        for entry in fs::read_dir(root).ok()? {
            let Ok(entry) = entry else { continue };
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.strip_prefix("node")) else { continue };
            let Ok(node) = id.parse::<u16>() else { continue };

            let cpus = fs::read_to_string(entry.path().join("cpulist"))
                .ok()
                .and_then(|list| AffinitySet::parse_ranges(list.trim()).ok())
                .unwrap_or_default();
            nodes.push((node, cpus));
        }

        if nodes.is_empty() {
            return None;
        }
        Some(Self::from_nodes(&nodes, mempolicy))
    }

    #[cfg(feature = "hwloc")]
    fn detect_hwloc() -> Option<Self> {
        use hwloc2::{ObjectType, Topology};

        let topology = Topology::new()?;
        let objects = topology.objects_with_type(&ObjectType::NUMANode).ok()?;
        let nodes: Vec<(u16, AffinitySet)> = objects
            .iter()
            .filter_map(|object| {
                let node = u16::try_from(object.os_index()).ok()?;
                let cpus = object
                    .cpuset()
                    .map(|set| set.into_iter().map(|cpu| cpu as usize).filter(|&cpu| cpu < MAX_SUPPORTED_CPUS).collect())
                    .unwrap_or_default();
                Some((node, cpus))
            })
            .collect();

        (!nodes.is_empty()).then(|| Self::from_nodes(&nodes, mempolicy_supported()))
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn highest_node(&self) -> u16 {
        self.highest_node
    }

    /// The node owning `cpu`, when NUMA placement is available.
    pub fn node_of_cpu(&self, cpu: usize) -> Option<u16> {
        if !self.available {
            return None;
        }
        self.cpu_to_node.get(cpu).copied().flatten()
    }

    /// Issues a preferred-node memory policy for `[addr, addr + size)`.
    ///
    /// Returns `false` when the hint could not be applied, including when
    /// NUMA is unavailable or `node` is out of range. Never fatal.
    pub fn bind_preferred(&self, addr: *mut u8, size: usize, node: u16) -> bool {
        if !self.available || node == NUMA_NODE_UNDEFINED || node > self.highest_node {
            return false;
        }
        bind_preferred_impl(addr, size, node, self.highest_node)
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_preferred_impl(addr: *mut u8, size: usize, node: u16, highest_node: u16) -> bool {
    const MPOL_PREFERRED: libc::c_int = 1;
    const MASK_BITS: usize = libc::c_ulong::BITS as usize;

    let used_bits = usize::from(highest_node) + 1;
    let mut node_mask: Vec<libc::c_ulong> = vec![0; used_bits.div_ceil(MASK_BITS)];
    node_mask[usize::from(node) / MASK_BITS] = (1 as libc::c_ulong) << (usize::from(node) % MASK_BITS);

    // The kernel reads `maxnode - 1` bits, so one extra bit keeps the
    // highest node addressable.
    let max_node = (used_bits + 1) as libc::c_ulong;

    // SAFETY: the caller owns the mapping; mbind only changes its policy and
    // reads `node_mask`, which outlives the call.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            addr as libc::c_long,
            size as libc::c_ulong,
            MPOL_PREFERRED,
            node_mask.as_ptr(),
            max_node,
            0 as libc::c_uint,
        )
    };

    if ret != 0 {
        let err = std::io::Error::last_os_error();
        warn!("mbind to NUMA node {} failed (non-fatal): {}", node, err);
        return false;
    }
    true
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn bind_preferred_impl(_addr: *mut u8, _size: usize, _node: u16, _highest_node: u16) -> bool {
    false
}

/// Whether the kernel implements the memory policy syscalls at all.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn mempolicy_supported() -> bool {
    // SAFETY: all output pointers are null, which get_mempolicy accepts.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_get_mempolicy,
            std::ptr::null_mut::<libc::c_int>(),
            std::ptr::null_mut::<libc::c_ulong>(),
            0 as libc::c_ulong,
            std::ptr::null_mut::<libc::c_void>(),
            0 as libc::c_ulong,
        )
    };
    ret == 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::ENOSYS)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn mempolicy_supported() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_node(root: &Path, node: u16, cpulist: &str) {
        let dir = root.join(format!("node{node}"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("cpulist"), format!("{cpulist}\n")).unwrap();
    }

    #[test]
    fn test_sysfs_two_nodes() {
        let root = tempfile::tempdir().unwrap();
        write_node(root.path(), 0, "0-3");
        write_node(root.path(), 1, "4-7");
        fs::write(root.path().join("possible"), "0-1\n").unwrap();

        let topo = NumaTopology::from_sysfs(root.path(), true).unwrap();
        assert!(topo.is_available());
        assert_eq!(topo.highest_node(), 1);
        assert_eq!(topo.node_of_cpu(2), Some(0));
        assert_eq!(topo.node_of_cpu(6), Some(1));
        assert_eq!(topo.node_of_cpu(100), None);
    }

    #[test]
    fn test_single_node_disables_placement() {
        let root = tempfile::tempdir().unwrap();
        write_node(root.path(), 0, "0-7");

        let topo = NumaTopology::from_sysfs(root.path(), true).unwrap();
        assert!(!topo.is_available());
        assert_eq!(topo.node_of_cpu(0), None);
    }

    #[test]
    fn test_missing_sysfs() {
        let root = tempfile::tempdir().unwrap();
        assert!(NumaTopology::from_sysfs(root.path(), true).is_none());
        assert!(NumaTopology::from_sysfs(&root.path().join("absent"), true).is_none());
    }

    #[test]
    fn test_bind_rejects_invalid_nodes() {
        let topo = NumaTopology::from_nodes(&[(0, AffinitySet::first_n(2)), (1, AffinitySet::new())], true);
        let mut byte = 0u8;
        assert!(!topo.bind_preferred(&mut byte, 1, 2));
        assert!(!topo.bind_preferred(&mut byte, 1, NUMA_NODE_UNDEFINED));
        assert!(!NumaTopology::unavailable().bind_preferred(&mut byte, 1, 0));
    }

    #[test]
    fn test_detect_never_fails() {
        let topo = NumaTopology::detect();
        if topo.is_available() {
            assert!(topo.highest_node() > 0);
        }
    }
}
