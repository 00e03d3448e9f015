pub mod affinity;
pub mod cpuset;
pub mod numa;
pub mod topology;

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Page size assumed when the OS refuses to report one.
const FALLBACK_PAGE_SIZE: usize = 0x1000;

/// Returns the native page size of the host.
pub fn page_size() -> usize {
    sysconf(libc::_SC_PAGESIZE).map_or(FALLBACK_PAGE_SIZE, |size| size as usize)
}

/// Returns the number of logical processors the OS exposes.
///
/// # Logic
/// On architectures where cores are routinely hot-plugged for power saving
/// (arm, aarch64, loongarch64, riscv64) the configured count is used, so
/// offline cores still get a heap. Everywhere else the online count is used.
pub fn processor_count() -> std::io::Result<u32> {
    #[cfg(any(
        target_arch = "arm",
        target_arch = "aarch64",
        target_arch = "loongarch64",
        target_arch = "riscv64"
    ))]
    let name = libc::_SC_NPROCESSORS_CONF;
    #[cfg(not(any(
        target_arch = "arm",
        target_arch = "aarch64",
        target_arch = "loongarch64",
        target_arch = "riscv64"
    )))]
    let name = libc::_SC_NPROCESSORS_ONLN;

    // SAFETY: sysconf has no memory-safety preconditions.
    let count = unsafe { libc::sysconf(name) };
    if count <= 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(u32::try_from(count).unwrap_or(u32::MAX))
}

/// Positive `sysconf` values, `None` for errors and unsupported names.
pub(crate) fn sysconf(name: libc::c_int) -> Option<u64> {
    // SAFETY: sysconf has no memory-safety preconditions.
    let value = unsafe { libc::sysconf(name) };
    (value > 0).then_some(value as u64)
}

/// Reads a fixed-size `sysctl` value by name.
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
pub(crate) fn sysctl_by_name<T: Copy>(name: &str) -> Option<T> {
    let name = std::ffi::CString::new(name).ok()?;
    // SAFETY: only instantiated with plain integer and C struct types.
    let mut value: T = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<T>();
    // SAFETY: `value` is a plain-data out-parameter of `len` bytes.
    let ret = unsafe {
        libc::sysctlbyname(name.as_ptr(), (&mut value as *mut T).cast(), &mut len, std::ptr::null_mut(), 0)
    };
    (ret == 0 && len == std::mem::size_of::<T>()).then_some(value)
}

/// Multiplier for a `k`, `m` or `g` unit suffix (case-insensitive).
pub(crate) fn unit_multiplier(unit: Option<char>) -> u64 {
    match unit {
        Some('g' | 'G') => 1024 * 1024 * 1024,
        Some('m' | 'M') => 1024 * 1024,
        Some('k' | 'K') => 1024,
        _ => 1,
    }
}

/// Parses a memory size the way kernel pseudo-files spell them.
///
/// Accepts `strtoull` base-0 numbers (`0x` hex, leading-zero octal, decimal)
/// followed by an optional `k`/`m`/`g` suffix. Results that overflow `u64`
/// after applying the suffix are rejected.
pub fn parse_memory_value(text: &str) -> Option<u64> {
    let text = text.trim_start();
    let (digits, radix) = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        (hex, 16)
    } else if text.len() > 1 && text.starts_with('0') {
        (&text[1..], 8)
    } else {
        (text, 10)
    };

    let end = digits.find(|c: char| !c.is_digit(radix)).unwrap_or(digits.len());
    let number = if end == 0 {
        // The leading "0" of "0x" or "0..." parses on its own when nothing
        // valid follows it.
        if radix != 10 {
            0
        } else {
            return None;
        }
    } else {
        u64::from_str_radix(&digits[..end], radix).ok()?
    };

    let multiplier = unit_multiplier(digits[end..].chars().next());
    number.checked_mul(multiplier)
}

/// Reads the first line of `path` as a memory size.
pub fn read_memory_value(path: &Path) -> Option<u64> {
    let file = fs::File::open(path).ok()?;
    let mut line = String::new();
    BufReader::new(file).read_line(&mut line).ok()?;
    parse_memory_value(&line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_memory_value() {
        assert_eq!(parse_memory_value("4096\n"), Some(4096));
        assert_eq!(parse_memory_value("32K"), Some(32 * 1024));
        assert_eq!(parse_memory_value("8m"), Some(8 * 1024 * 1024));
        assert_eq!(parse_memory_value("2G"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory_value("0x1000"), Some(4096));
        assert_eq!(parse_memory_value("010"), Some(8));
        assert_eq!(parse_memory_value("0"), Some(0));
        assert_eq!(parse_memory_value("0x"), Some(0));
        assert_eq!(parse_memory_value("0xk"), Some(0));
        assert_eq!(parse_memory_value("0xg\n"), Some(0));
        assert_eq!(parse_memory_value("max"), None);
        assert_eq!(parse_memory_value(""), None);
        assert_eq!(parse_memory_value("18446744073709551615G"), None);
    }

    #[test]
    fn test_read_memory_value_uses_first_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "1024K").unwrap();
        writeln!(file, "ignored").unwrap();
        assert_eq!(read_memory_value(file.path()), Some(1024 * 1024));
        assert_eq!(read_memory_value(Path::new("/nonexistent/strata/value")), None);
    }

    #[test]
    fn test_host_basics() {
        let page = page_size();
        assert!(page.is_power_of_two());
        assert!(processor_count().unwrap() >= 1);
    }
}
