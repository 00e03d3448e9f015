use std::env;

use crate::error::ConfigError;

pub const ENV_AFFINITIZE_MASK: &str = "STRATA_GC_HEAP_AFFINITIZE_MASK";
pub const ENV_AFFINITIZE_RANGES: &str = "STRATA_GC_HEAP_AFFINITIZE_RANGES";
pub const ENV_CACHE_SIZE_FROM_SYSCONF: &str = "STRATA_GC_CACHE_SIZE_FROM_SYSCONF";

/// Administrator settings the platform layer honors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsConfig {
    /// Heap affinity bitmask over processors 0..64; zero means unset.
    pub affinitize_mask: u64,
    /// Heap affinity range list such as `0-3,8`; wins over the mask.
    pub affinitize_ranges: Option<String>,
    /// Try `sysconf` cache counters before sysfs.
    pub cache_size_from_sysconf: bool,
}

impl OsConfig {
    /// Reads the `STRATA_GC_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from any key lookup, e.g. a fixed map in tests.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_AFFINITIZE_MASK) {
            config.affinitize_mask = parse_mask(&value)
                .ok_or(ConfigError::InvalidValue { key: ENV_AFFINITIZE_MASK, value })?;
        }

        config.affinitize_ranges = lookup(ENV_AFFINITIZE_RANGES).filter(|ranges| !ranges.trim().is_empty());

        if let Some(value) = lookup(ENV_CACHE_SIZE_FROM_SYSCONF) {
            config.cache_size_from_sysconf = parse_flag(&value)
                .ok_or(ConfigError::InvalidValue { key: ENV_CACHE_SIZE_FROM_SYSCONF, value })?;
        }

        Ok(config)
    }
}

/// Hexadecimal with an optional `0x` prefix.
pub fn parse_mask(value: &str) -> Option<u64> {
    let value = value.trim();
    let digits = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")).unwrap_or(value);
    u64::from_str_radix(digits, 16).ok()
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<OsConfig, ConfigError> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        OsConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        assert_eq!(from_pairs(&[]).unwrap(), OsConfig::default());
    }

    #[test]
    fn test_all_keys() {
        let config = from_pairs(&[
            (ENV_AFFINITIZE_MASK, "0xF0"),
            (ENV_AFFINITIZE_RANGES, "0-3,8"),
            (ENV_CACHE_SIZE_FROM_SYSCONF, "TRUE"),
        ])
        .unwrap();
        assert_eq!(config.affinitize_mask, 0xF0);
        assert_eq!(config.affinitize_ranges.as_deref(), Some("0-3,8"));
        assert!(config.cache_size_from_sysconf);
    }

    #[test]
    fn test_blank_ranges_are_unset() {
        let config = from_pairs(&[(ENV_AFFINITIZE_RANGES, "  ")]).unwrap();
        assert_eq!(config.affinitize_ranges, None);
    }

    #[test]
    fn test_invalid_values() {
        assert_eq!(
            from_pairs(&[(ENV_AFFINITIZE_MASK, "zz")]),
            Err(ConfigError::InvalidValue { key: ENV_AFFINITIZE_MASK, value: "zz".to_string() })
        );
        assert!(from_pairs(&[(ENV_CACHE_SIZE_FROM_SYSCONF, "yes")]).is_err());
    }

    #[test]
    fn test_parse_mask() {
        assert_eq!(parse_mask("ff"), Some(0xFF));
        assert_eq!(parse_mask("0X10"), Some(0x10));
        assert_eq!(parse_mask(""), None);
    }
}
