//! Pool and chain configuration.
//!
//! These are the plain configuration values a deployment layer hands to
//! [`ConnectionManager::from_config`](crate::ConnectionManager::from_config).

use std::time::Duration;

use crate::error::{Error, Result};

/// Default idle timeout for free connections in a bounded pool.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Default maximum size of a bounded pool.
pub const DEFAULT_MAX_SIZE: usize = 10;

/// Configuration for the global bounded pool.
///
/// This struct is marked `#[non_exhaustive]` to allow adding new fields
/// in future minor versions without breaking changes. Use the builder
/// pattern methods or [`Default::default()`] to construct instances.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[non_exhaustive]
pub struct PoolConfig {
    /// Number of free connections idle eviction never goes below.
    pub min_size: usize,

    /// Maximum number of physical connections (active plus free).
    pub max_size: usize,

    /// Time a free connection may stay idle before it is evicted.
    ///
    /// `None` disables idle eviction.
    pub idle_timeout: Option<Duration>,

    /// Time an allocation may block waiting for a slot.
    ///
    /// `None` waits until a slot frees up or the pool is disposed.
    pub acquire_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: DEFAULT_MAX_SIZE,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            acquire_timeout: None,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the eviction floor.
    #[must_use]
    pub fn min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set the idle eviction timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Disable idle eviction.
    #[must_use]
    pub fn no_idle_timeout(mut self) -> Self {
        self.idle_timeout = None;
        self
    }

    /// Set the acquisition timeout for blocked allocations.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::Configuration(
                "max_size must be greater than 0".into(),
            ));
        }
        if self.min_size > self.max_size {
            return Err(Error::Configuration(
                "min_size cannot be greater than max_size".into(),
            ));
        }
        Ok(())
    }
}

/// How connections participate in the ambient transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum TransactionSupport {
    /// Connections are never associated with a transaction.
    #[default]
    None,
    /// The connection's local transaction is enlisted through a
    /// [`LocalTransactionAdapter`](crate::LocalTransactionAdapter).
    Local,
    /// The connection's XA resource is enlisted directly.
    Xa,
}

/// Configuration for a whole policy chain.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[non_exhaustive]
pub struct LeaseConfig {
    /// Global bounded pool settings. `None` leaves out the bounded pool.
    pub pool: Option<PoolConfig>,

    /// Whether connections are cached per calling thread.
    pub thread_scoped: bool,

    /// Transaction association mode.
    pub transaction_support: TransactionSupport,

    /// Whether a transaction-scoped chain serves callers that have no
    /// ambient transaction by delegating straight down.
    pub allow_unbounded_fallthrough: bool,
}

impl LeaseConfig {
    /// Create a configuration with no pooling and no transaction support.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a global bounded pool.
    #[must_use]
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Enable or disable the thread-scoped pool.
    #[must_use]
    pub fn thread_scoped(mut self, enabled: bool) -> Self {
        self.thread_scoped = enabled;
        self
    }

    /// Set the transaction support mode.
    #[must_use]
    pub fn transaction_support(mut self, support: TransactionSupport) -> Self {
        self.transaction_support = support;
        self
    }

    /// Allow allocations without an ambient transaction.
    #[must_use]
    pub fn allow_unbounded_fallthrough(mut self, enabled: bool) -> Self {
        self.allow_unbounded_fallthrough = enabled;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if let Some(pool) = &self.pool {
            pool.validate()?;
        }
        Ok(())
    }
}
