use thiserror::Error;

/// Failures that leave the platform layer unusable.
///
/// The collector must not proceed when `OsContext::initialize` returns one of
/// these.
#[derive(Error, Debug)]
pub enum InitError {
    #[error("Failed to query the logical processor count: {0}")]
    ProcessorCount(#[source] std::io::Error),
    #[error("Failed to query total physical memory: {0}")]
    PhysicalMemory(#[source] std::io::Error),
    #[error("Failed to map the write-buffer flush helper page: {0}")]
    HelperPageMap(#[source] std::io::Error),
    #[error("Failed to lock the write-buffer flush helper page: {0}")]
    HelperPageLock(#[source] nix::Error),
}

/// Rejected configuration values.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
}
