//! TCP proxy integration tests
//!
//! Exercises `copy_pair` end to end across a real pair of TCP connections,
//! the way a proxied client/target pair actually behaves.

use std::sync::Arc;
use std::time::Duration;

use proxyd::dispatch::{copy_pair, PairOutcome};
use proxyd::forward::{CopyConfig, Mode};
use proxyd::metrics::Metrics;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn connected_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = tokio::spawn(TcpStream::connect(addr));
    let (server, _) = listener.accept().await.unwrap();
    (client.await.unwrap().unwrap(), server)
}

fn test_cfg() -> CopyConfig {
    CopyConfig { buf_size: 4096, timeout: Duration::from_secs(5) }
}

#[tokio::test]
async fn echo_through_proxy_preserves_bytes() {
    let (inbound_near, mut inbound_far) = connected_pair().await;
    let (outbound_near, mut outbound_far) = connected_pair().await;

    let metrics = Arc::new(Metrics::new());
    let pair = tokio::spawn(copy_pair(inbound_near, outbound_near, Mode::Lazy, test_cfg(), metrics.clone()));

    inbound_far.write_all(b"proxied payload").await.unwrap();
    inbound_far.shutdown().await.unwrap();

    let mut received = Vec::new();
    outbound_far.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"proxied payload");

    outbound_far.shutdown().await.unwrap();

    let outcome = pair.await.unwrap();
    assert!(matches!(outcome, PairOutcome::Clean));
    assert_eq!(metrics.snapshot().bytes_forwarded, "proxied payload".len() as u64);
}

#[tokio::test]
async fn connections_counter_returns_to_zero_after_pair_completes() {
    let (inbound_near, mut inbound_far) = connected_pair().await;
    let (outbound_near, mut outbound_far) = connected_pair().await;

    let metrics = Arc::new(Metrics::new());
    let pair = tokio::spawn(copy_pair(inbound_near, outbound_near, Mode::Lazy, test_cfg(), metrics.clone()));

    inbound_far.shutdown().await.unwrap();
    let mut buf = [0u8; 1];
    let _ = outbound_far.read(&mut buf).await;
    outbound_far.shutdown().await.unwrap();

    let _ = pair.await.unwrap();
    assert_eq!(metrics.snapshot().connections, 0);
}
