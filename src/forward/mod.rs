//! Forwarding strategies
//!
//! Three implementations of the same contract:
//!
//! ```text
//! copy_one_way(src, dst, cfg, on_bytes) -> Ok | EofClean | Err
//! ```
//!
//! `on_bytes(n)` is called exactly once per kernel-acknowledged transfer of
//! `n > 0` bytes toward `dst` (for zerocopy this is the completion event,
//! not the enqueue). All three strategies honor the same `CopyConfig`.

mod lazy;
#[cfg(target_os = "linux")]
mod splice;
#[cfg(target_os = "linux")]
mod zerocopy;

pub use lazy::copy_lazy;
#[cfg(target_os = "linux")]
pub use splice::copy_splice;
#[cfg(target_os = "linux")]
pub use zerocopy::copy_zerocopy;

use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;

/// Data-movement strategy selected per connection pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Userspace read/write loop; the portable fallback.
    Lazy,
    /// In-kernel pipe splicing (Linux only). Default strategy.
    #[default]
    Splice,
    /// `MSG_ZEROCOPY` send with asynchronous completion reaping (Linux only).
    ZeroSend,
}

impl Mode {
    /// Falls back to `Splice` when `s` doesn't match a known mode name.
    pub fn parse(s: &str) -> Mode {
        match s.to_ascii_lowercase().as_str() {
            "lazy" => Mode::Lazy,
            "zerosend" | "zero_send" | "zerocopy" => Mode::ZeroSend,
            "splice" => Mode::Splice,
            _ => Mode::Splice,
        }
    }
}

/// Shared configuration for all three strategies.
#[derive(Debug, Clone, Copy)]
pub struct CopyConfig {
    /// Base unit of per-call transfer. Internally every strategy uses
    /// `4 * buf_size` for pipe capacity / user buffers.
    pub buf_size: usize,
    /// Per-readiness-poll deadline. `Duration::ZERO` waits indefinitely.
    pub timeout: Duration,
}

impl CopyConfig {
    pub fn internal_buf_size(&self) -> usize {
        self.buf_size.saturating_mul(4)
    }
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            buf_size: 16 * 1024,
            timeout: Duration::from_secs(30),
        }
    }
}

/// How a one-way copy concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    /// Forwarding finished some other way worth distinguishing from clean
    /// EOF (currently unused by any strategy but kept so callers can match
    /// exhaustively without surprises if a future strategy needs it).
    Ok,
    /// `src` delivered a clean EOF, or `dst` signalled a broken pipe — both
    /// are normal termination from the dispatcher's point of view.
    EofClean,
}

#[derive(Debug, Error)]
pub enum ForwardError {
    /// Readiness poll timed out — surfaced to the dispatcher rather than
    /// retried internally.
    #[error("readiness poll timed out")]
    TimedOut,
    /// Any other non-recoverable I/O error.
    #[error("fatal I/O error: {0}")]
    FatalIo(#[source] std::io::Error),
}

impl From<std::io::Error> for ForwardError {
    fn from(e: std::io::Error) -> Self {
        ForwardError::FatalIo(e)
    }
}

/// Dispatch to the strategy selected by `cfg`'s caller. Non-Linux builds
/// only ever see `Mode::Lazy` since the other two variants don't compile
/// there; `copy_one_way` is the single entry point the dispatcher (C4)
/// calls so it doesn't need to match on `Mode` itself.
pub async fn copy_one_way(
    mode: Mode,
    src: &TcpStream,
    dst: &TcpStream,
    cfg: CopyConfig,
    on_bytes: impl FnMut(u64) + Send,
) -> Result<CopyOutcome, ForwardError> {
    match mode {
        Mode::Lazy => lazy::copy_lazy(src, dst, cfg, on_bytes).await,
        #[cfg(target_os = "linux")]
        Mode::Splice => splice::copy_splice(src, dst, cfg, on_bytes).await,
        #[cfg(not(target_os = "linux"))]
        Mode::Splice => lazy::copy_lazy(src, dst, cfg, on_bytes).await,
        #[cfg(target_os = "linux")]
        Mode::ZeroSend => zerocopy::copy_zerocopy(src, dst, cfg, on_bytes).await,
        #[cfg(not(target_os = "linux"))]
        Mode::ZeroSend => lazy::copy_lazy(src, dst, cfg, on_bytes).await,
    }
}
