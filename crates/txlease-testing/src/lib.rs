//! # txlease-testing
//!
//! Test doubles for exercising `txlease` policy chains without a real
//! resource.
//!
//! ## Features
//!
//! - [`MockFactory`] / [`MockConnection`]: connections keyed by a request
//!   string, with event firing and cleanup/destroy bookkeeping
//! - [`MockTransactionManager`] / [`MockTransaction`]: per-thread ambient
//!   transactions completed on demand
//! - [`ManualTimer`]: a virtual clock that fires idle timers deterministically
//!
//! ## Example
//!
//! ```rust,ignore
//! use txlease_testing::{ManualTimer, MockFactory, request};
//!
//! let factory = MockFactory::new();
//! let timer = ManualTimer::new();
//! // build a chain against `factory.as_factory()` ...
//! let handle = manager.allocate(&factory.as_factory(), Some(request("reader")))?;
//! timer.advance(Duration::from_secs(3));
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod connection;
pub mod timer;
pub mod transaction;

pub use connection::{MockConnection, MockFactory, MockHandle, physical, request};
pub use timer::ManualTimer;
pub use transaction::{MockLocalTransaction, MockTransaction, MockTransactionManager, MockXaResource};

/// Install a test-friendly tracing subscriber. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
