//! Leasing error types.

use std::time::Duration;

use thiserror::Error;

use crate::transaction::XaError;

/// Errors that can occur while leasing, releasing or disposing connections.
#[derive(Debug, Error)]
pub enum Error {
    /// The request named a different connection factory than the one this
    /// manager or policy was bound to.
    #[error("connection factory does not match the configured factory")]
    ConfigurationMismatch,

    /// A transaction-scoped policy requires an ambient transaction and
    /// fallthrough is disabled.
    #[error("no ambient transaction")]
    NoAmbientTransaction,

    /// A blocked allocation was woken because the policy was disposed.
    #[error("interrupted while waiting for a pooled connection")]
    Interrupted,

    /// Failed to acquire a connection within the configured timeout.
    #[error("connection acquisition timeout after {0:?}")]
    AcquisitionTimeout(Duration),

    /// The pool has been disposed.
    #[error("pool is closed")]
    PoolClosed,

    /// Policy or pool configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A policy was used before `initialize` bound it into a chain.
    #[error("policy is not initialized")]
    NotInitialized,

    /// The connection factory or a physical connection reported a failure.
    #[error("resource error: {0}")]
    Resource(String),

    /// Enlistment or completion registration with a transaction failed.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// A distributed-transaction resource failed.
    #[error("XA error: {0}")]
    Xa(#[from] XaError),

    /// The timer facility could not schedule a task.
    #[error("timer error: {0}")]
    Timer(String),
}

impl Error {
    /// Check if this error is transient and may succeed on retry.
    ///
    /// Only waits that ended without a connection are transient; everything
    /// else reflects configuration or collaborator failures.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::AcquisitionTimeout(_) | Self::Interrupted)
    }

    /// Check if this error comes from misconfiguration rather than runtime
    /// conditions.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::ConfigurationMismatch | Self::Configuration(_) | Self::NotInitialized
        )
    }
}

/// Result type for leasing operations.
pub type Result<T> = std::result::Result<T, Error>;
