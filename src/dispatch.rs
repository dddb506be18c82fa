//! Pair dispatcher
//!
//! Runs the two directions of a proxied connection concurrently, propagates
//! half-close in each direction as soon as its own copy finishes, and
//! reports at most one error per pair back to the caller — first one in
//! wins, the other is dropped on the floor rather than overwriting it.

use std::os::fd::AsRawFd;
use std::sync::Arc;

use nix::sys::socket::{shutdown, Shutdown};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::forward::{self, CopyConfig, CopyOutcome, ForwardError, Mode};
use crate::metrics::Metrics;

/// Half-close the write side. Operates on the raw fd so it works through a
/// shared `Arc<TcpStream>` without needing exclusive access.
fn half_close_write(stream: &TcpStream) {
    let _ = shutdown(stream.as_raw_fd(), Shutdown::Write);
}

/// How a pair concluded.
#[derive(Debug)]
pub enum PairOutcome {
    /// Both directions reached a clean EOF.
    Clean,
    /// At least one direction failed; this is the first error observed.
    Failed(ForwardError),
}

/// Forward `a <-> b` until both directions are done. Increments and
/// decrements `metrics.connections` around the pair's lifetime, and folds
/// every `on_bytes` call from both directions into `metrics.bytes_forwarded`.
pub async fn copy_pair(a: TcpStream, b: TcpStream, mode: Mode, cfg: CopyConfig, metrics: Arc<Metrics>) -> PairOutcome {
    metrics.connection_opened();
    let outcome = run_pair(a, b, mode, cfg, metrics.clone()).await;
    metrics.connection_closed();
    outcome
}

async fn run_pair(a: TcpStream, b: TcpStream, mode: Mode, cfg: CopyConfig, metrics: Arc<Metrics>) -> PairOutcome {
    let a = Arc::new(a);
    let b = Arc::new(b);
    let (tx, mut rx) = mpsc::channel::<ForwardError>(2);

    let a1 = a.clone();
    let b1 = b.clone();
    let m1 = metrics.clone();
    let tx1 = tx.clone();
    let forward = tokio::spawn(async move {
        let result = forward::copy_one_way(mode, &a1, &b1, cfg, |n| m1.add_bytes(n)).await;
        half_close_write(&b1);
        report(result, &tx1).await;
    });

    let a2 = a.clone();
    let b2 = b.clone();
    let m2 = metrics;
    let tx2 = tx;
    let backward = tokio::spawn(async move {
        let result = forward::copy_one_way(mode, &b2, &a2, cfg, |n| m2.add_bytes(n)).await;
        half_close_write(&a2);
        report(result, &tx2).await;
    });

    let _ = tokio::join!(forward, backward);

    match rx.recv().await {
        Some(e) => PairOutcome::Failed(e),
        None => PairOutcome::Clean,
    }
}

async fn report(result: Result<CopyOutcome, ForwardError>, tx: &mpsc::Sender<ForwardError>) {
    if let Err(e) = result {
        // Bounded at capacity 2 (one slot per direction); a full channel
        // means the other direction already reported, so drop silently.
        let _ = tx.try_send(e);
    }
}
