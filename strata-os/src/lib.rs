//! Strata OS: the garbage collector's view of the operating system.
//!
//! One [`OsContext`] owns everything discovered at startup: topology, the
//! write buffer flush strategy, memory limit sources and the cache size
//! estimator. Virtual memory, affinity and pressure queries go through it.
//! OS features that are missing degrade to fallbacks instead of failing.

pub mod barrier;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod memory;
pub mod platform;
pub mod pressure;
pub mod thread;

pub use barrier::{FlushStrategy, WriteBufferFlusher};
pub use config::OsConfig;
pub use context::OsContext;
pub use error::{ConfigError, InitError};
pub use memory::{MemoryError, VirtualMemory};
pub use platform::affinity::HeapPlacement;
pub use platform::cpuset::{AffinityError, AffinitySet, MAX_SUPPORTED_CPUS};
pub use pressure::{MemoryProbe, MemorySource, MemoryStatus};
