//! Process-wide tracing setup for the provisioning service.

pub mod tracing;

pub use crate::tracing::LogFormat;

/// Initialize logging using `LOG_FORMAT` and `RUST_LOG`.
///
/// Safe to call multiple times; only the first call installs a subscriber.
pub fn init() {
    tracing::init(LogFormat::from_env());
}
