//! Memory controller discovery for cgroup v1 and v2.
//!
//! The controller directory is located by joining the mount point from
//! `/proc/self/mountinfo` with this process's path from `/proc/self/cgroup`.
//! A v1 memory mount wins over a v2 mount, since hybrid hosts keep the memory
//! controller on v1 while also mounting the unified hierarchy.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::platform::read_memory_value;

/// cgroup v1 reports "no limit" as a huge page-rounded value rather than a
/// sentinel; anything at or above this is unlimited.
const V1_UNLIMITED_THRESHOLD: u64 = 0x7FFF_FFFF_0000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    V1,
    V2,
}

impl CgroupVersion {
    fn limit_file(self) -> &'static str {
        match self {
            CgroupVersion::V1 => "memory.limit_in_bytes",
            CgroupVersion::V2 => "memory.max",
        }
    }

    fn usage_file(self) -> &'static str {
        match self {
            CgroupVersion::V1 => "memory.usage_in_bytes",
            CgroupVersion::V2 => "memory.current",
        }
    }

    /// `memory.stat` key for reclaimable page cache excluded from usage.
    fn inactive_file_key(self) -> &'static str {
        match self {
            CgroupVersion::V1 => "total_inactive_file",
            CgroupVersion::V2 => "inactive_file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cgroup {
    version: CgroupVersion,
    memory_path: PathBuf,
}

struct Mount {
    root: String,
    mount_point: String,
}

impl Cgroup {
    pub fn detect() -> Option<Self> {
        Self::from_proc(Path::new("/proc/self/mountinfo"), Path::new("/proc/self/cgroup"), Path::new("/"))
    }

    /// Resolves the memory controller from the given procfs files.
    ///
    /// Mount points are re-rooted under `fs_root`, so a test can point at a
    /// fake tree.
    pub fn from_proc(mountinfo: &Path, cgroup: &Path, fs_root: &Path) -> Option<Self> {
        let mountinfo = fs::read_to_string(mountinfo).ok()?;
        let (version, mount) = find_memory_mount(&mountinfo)?;

        let membership = fs::read_to_string(cgroup).ok()?;
        let cgroup_path = find_cgroup_path(&membership, version)?;

        // Matched by path component; outside the mount root the mount point
        // itself is the controller directory.
        let relative = Path::new(cgroup_path).strip_prefix(&mount.root).unwrap_or(Path::new(""));

        let mut memory_path = fs_root.join(mount.mount_point.trim_start_matches('/'));
        if !relative.as_os_str().is_empty() {
            memory_path.push(relative);
        }

        debug!("Memory cgroup {:?} at {}", version, memory_path.display());
        Some(Self { version, memory_path })
    }

    pub fn version(&self) -> CgroupVersion {
        self.version
    }

    pub fn memory_path(&self) -> &Path {
        &self.memory_path
    }

    /// The controller's hard limit, `None` when unlimited or unreadable.
    pub fn memory_limit(&self) -> Option<u64> {
        // v2 writes "max" for no limit, which does not parse.
        let limit = read_memory_value(&self.memory_path.join(self.version.limit_file()))?;
        match self.version {
            CgroupVersion::V1 if limit >= V1_UNLIMITED_THRESHOLD => None,
            _ => Some(limit),
        }
    }

    /// Charged memory minus inactive page cache the kernel can reclaim.
    pub fn memory_usage(&self) -> Option<u64> {
        let usage = read_memory_value(&self.memory_path.join(self.version.usage_file()))?;
        let inactive = fs::read_to_string(self.memory_path.join("memory.stat"))
            .ok()
            .and_then(|stat| stat_value(&stat, self.version.inactive_file_key()))
            .unwrap_or(0);
        Some(usage.saturating_sub(inactive))
    }
}

fn find_memory_mount(mountinfo: &str) -> Option<(CgroupVersion, Mount)> {
    let mut unified = None;

    for line in mountinfo.lines() {
        let Some((left, right)) = line.split_once(" - ") else { continue };
        let mut fields = left.split_whitespace();
        let (Some(root), Some(mount_point)) = (fields.nth(3), fields.next()) else { continue };
        let mut fs_fields = right.split_whitespace();
        let fs_type = fs_fields.next();
        let super_options = fs_fields.nth(1).unwrap_or("");

        let mount = || Mount { root: root.to_string(), mount_point: mount_point.to_string() };
        match fs_type {
            Some("cgroup") if super_options.split(',').any(|opt| opt == "memory") => {
                return Some((CgroupVersion::V1, mount()));
            }
            Some("cgroup2") if unified.is_none() => unified = Some((CgroupVersion::V2, mount())),
            _ => {}
        }
    }

    unified
}

fn find_cgroup_path(membership: &str, version: CgroupVersion) -> Option<&str> {
    membership.lines().find_map(|line| {
        let mut parts = line.splitn(3, ':');
        let (id, controllers, path) = (parts.next()?, parts.next()?, parts.next()?);
        let matches = match version {
            CgroupVersion::V1 => controllers.split(',').any(|c| c == "memory"),
            CgroupVersion::V2 => id == "0" && controllers.is_empty(),
        };
        matches.then_some(path)
    })
}

fn stat_value(stat: &str, key: &str) -> Option<u64> {
    stat.lines().find_map(|line| {
        let (name, value) = line.split_once(' ')?;
        (name == key).then(|| value.trim().parse().ok()).flatten()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeProc {
        root: tempfile::TempDir,
    }

    impl FakeProc {
        fn new(mountinfo: &str, cgroup: &str) -> Self {
            let root = tempfile::tempdir().unwrap();
            fs::write(root.path().join("mountinfo"), mountinfo).unwrap();
            fs::write(root.path().join("cgroup"), cgroup).unwrap();
            Self { root }
        }

        fn controller(&self, relative: &str, files: &[(&str, &str)]) {
            let dir = self.root.path().join(relative);
            fs::create_dir_all(&dir).unwrap();
            for (name, contents) in files {
                fs::write(dir.join(name), contents).unwrap();
            }
        }

        fn detect(&self) -> Option<Cgroup> {
            let root = self.root.path();
            Cgroup::from_proc(&root.join("mountinfo"), &root.join("cgroup"), root)
        }
    }

    const V2_MOUNTINFO: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
30 22 0:26 / /sys/fs/cgroup rw,nosuid,nodev,noexec,relatime shared:4 - cgroup2 cgroup2 rw,nsdelegate
";

    const HYBRID_MOUNTINFO: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
31 25 0:27 / /sys/fs/cgroup/unified rw,nosuid shared:5 - cgroup2 cgroup2 rw
35 25 0:31 / /sys/fs/cgroup/cpu,cpuacct rw,nosuid shared:16 - cgroup cgroup rw,cpu,cpuacct
36 25 0:32 /docker/abc /sys/fs/cgroup/memory rw,nosuid shared:17 - cgroup cgroup rw,memory
";

    #[test]
    fn test_v2_limit_and_usage() {
        let fake = FakeProc::new(V2_MOUNTINFO, "0::/user.slice/app.scope\n");
        fake.controller(
            "sys/fs/cgroup/user.slice/app.scope",
            &[
                ("memory.max", "2147483648\n"),
                ("memory.current", "104857600\n"),
                ("memory.stat", "anon 50000000\ninactive_file 4857600\nactive_file 100\n"),
            ],
        );

        let cgroup = fake.detect().unwrap();
        assert_eq!(cgroup.version(), CgroupVersion::V2);
        assert_eq!(cgroup.memory_limit(), Some(2 << 30));
        assert_eq!(cgroup.memory_usage(), Some(100_000_000));
    }

    #[test]
    fn test_v2_max_is_unlimited() {
        let fake = FakeProc::new(V2_MOUNTINFO, "0::/\n");
        fake.controller("sys/fs/cgroup", &[("memory.max", "max\n"), ("memory.current", "4096\n")]);

        let cgroup = fake.detect().unwrap();
        assert_eq!(cgroup.memory_path(), fake.root.path().join("sys/fs/cgroup"));
        assert_eq!(cgroup.memory_limit(), None);
        assert_eq!(cgroup.memory_usage(), Some(4096));
    }

    #[test]
    fn test_hybrid_prefers_v1_memory_controller() {
        let fake = FakeProc::new(
            HYBRID_MOUNTINFO,
            "12:memory:/docker/abc\n4:cpu,cpuacct:/docker/abc\n0::/docker/abc\n",
        );
        fake.controller(
            "sys/fs/cgroup/memory",
            &[
                ("memory.limit_in_bytes", "536870912\n"),
                ("memory.usage_in_bytes", "300000000\n"),
                ("memory.stat", "cache 1\ntotal_inactive_file 100000000\n"),
            ],
        );

        let cgroup = fake.detect().unwrap();
        assert_eq!(cgroup.version(), CgroupVersion::V1);
        assert_eq!(cgroup.memory_path(), fake.root.path().join("sys/fs/cgroup/memory"));
        assert_eq!(cgroup.memory_limit(), Some(512 << 20));
        assert_eq!(cgroup.memory_usage(), Some(200_000_000));
    }

    #[test]
    fn test_mount_root_matches_whole_components() {
        let fake = FakeProc::new(HYBRID_MOUNTINFO, "12:memory:/docker/abcdef\n");
        let cgroup = fake.detect().unwrap();
        assert_eq!(cgroup.memory_path(), fake.root.path().join("sys/fs/cgroup/memory"));

        let fake = FakeProc::new(HYBRID_MOUNTINFO, "12:memory:/docker/abc/worker\n");
        let cgroup = fake.detect().unwrap();
        assert_eq!(cgroup.memory_path(), fake.root.path().join("sys/fs/cgroup/memory/worker"));
    }

    #[test]
    fn test_v1_unlimited_sentinel() {
        let fake = FakeProc::new(HYBRID_MOUNTINFO, "12:memory:/docker/abc\n");
        fake.controller("sys/fs/cgroup/memory", &[("memory.limit_in_bytes", "9223372036854771712\n")]);
        assert_eq!(fake.detect().unwrap().memory_limit(), None);
    }

    #[test]
    fn test_no_memory_controller() {
        let fake = FakeProc::new("22 1 8:1 / / rw - ext4 /dev/sda1 rw\n", "0::/\n");
        assert!(fake.detect().is_none());

        let fake = FakeProc::new(V2_MOUNTINFO, "5:cpu:/\n");
        assert!(fake.detect().is_none());
    }
}
