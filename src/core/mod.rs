//! Shared runtime plumbing: time, bounded waits, errors, configuration and
//! the audit sink.

pub mod audit;
pub mod clock;
pub mod config;
pub mod error;
pub mod polling;
pub(crate) mod sync;

pub use error::{EntityKind, GatewayError, GatewayResult};
