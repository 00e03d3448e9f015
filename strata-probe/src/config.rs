use clap::Parser;
use strata_os::OsConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "Initializes the GC platform layer and reports what it found")]
pub struct Args {
    /// Heap affinity bitmask in hex, overrides STRATA_GC_HEAP_AFFINITIZE_MASK
    #[arg(long, value_parser = parse_hex_mask)]
    pub affinitize_mask: Option<u64>,

    /// Heap affinity ranges such as 0-3,8, overrides STRATA_GC_HEAP_AFFINITIZE_RANGES
    #[arg(long)]
    pub affinitize_ranges: Option<String>,

    /// Try sysconf cache counters before sysfs
    #[arg(long)]
    pub cache_size_from_sysconf: bool,

    /// Pin the probe thread to this processor
    #[arg(long)]
    pub pin: Option<u16>,

    #[arg(long, default_value_t = 1000)]
    pub flush_rounds: u32,

    /// Reserve, commit and decommit this many MiB as a smoke test
    #[arg(long, default_value_t = 0)]
    pub reserve_mib: usize,

    #[arg(long)]
    pub json: bool,
}

fn parse_hex_mask(value: &str) -> Result<u64, String> {
    strata_os::config::parse_mask(value).ok_or_else(|| format!("{value:?} is not a hex mask"))
}

impl Args {
    /// Command-line flags layered over the environment.
    pub fn os_config(&self) -> anyhow::Result<OsConfig> {
        let mut config = OsConfig::from_env()?;
        if let Some(mask) = self.affinitize_mask {
            config.affinitize_mask = mask;
        }
        if let Some(ranges) = &self.affinitize_ranges {
            config.affinitize_ranges = Some(ranges.clone());
        }
        config.cache_size_from_sysconf |= self.cache_size_from_sysconf;
        Ok(config)
    }
}
