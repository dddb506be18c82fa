//! proxyd - High-throughput TCP reverse-proxy core
//!
//! Forwards already-accepted TCP connection pairs using one of three
//! strategies (userspace copy, kernel splice, `MSG_ZEROCOPY`), with a
//! hot-reloadable alias/target mapping table and an HTTP control plane for
//! liveness, readiness, metrics, and log rotation.

pub mod config;
pub mod control;
pub mod dispatch;
pub mod forward;
pub mod mapping;
pub mod metrics;
pub mod pipe;
pub mod poll;
pub mod shutdown;
pub mod util;

pub use config::Config;

/// Crate version, reported verbatim by `/versionz` unless overridden in config.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
