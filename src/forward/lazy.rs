//! Lazy copy: a plain userspace read/write loop
//!
//! The portable fallback and default for non-Linux targets. No pipe, no
//! kernel flags beyond what the OS socket already provides.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{CopyConfig, CopyOutcome, ForwardError};

/// `&TcpStream` implements `AsyncRead`/`AsyncWrite` directly (tokio keeps
/// this around precisely so a duplex copy doesn't need `.into_split()`), so
/// the two directions of a pair can each hold a plain shared reference.
pub async fn copy_lazy(
    mut src: &TcpStream,
    mut dst: &TcpStream,
    cfg: CopyConfig,
    mut on_bytes: impl FnMut(u64) + Send,
) -> Result<CopyOutcome, ForwardError> {
    let mut buf = vec![0u8; cfg.internal_buf_size()];

    loop {
        let n = match src.read(&mut buf).await {
            Ok(0) => return Ok(CopyOutcome::EofClean),
            Ok(n) => n,
            Err(e) if is_peer_closed(&e) => return Ok(CopyOutcome::EofClean),
            Err(e) => return Err(e.into()),
        };

        if write_all(&mut dst, &buf[..n]).await? {
            on_bytes(n as u64);
        } else {
            return Ok(CopyOutcome::EofClean);
        }
    }
}

/// Writes the whole chunk, looping through partial writes. Returns `false`
/// if `dst` signalled a broken pipe (peer gone, not a fatal error for the
/// pair).
async fn write_all(mut dst: &TcpStream, mut chunk: &[u8]) -> Result<bool, ForwardError> {
    while !chunk.is_empty() {
        match dst.write(chunk).await {
            Ok(0) => return Ok(false),
            Ok(n) => chunk = &chunk[n..],
            Err(e) if is_peer_closed(&e) => return Ok(false),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

fn is_peer_closed(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn byte_conservation_single_write_then_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let writer = tokio::spawn(async move {
            let mut s = TcpStream::connect(addr).await.unwrap();
            s.write_all(b"hello\n").await.unwrap();
            s.shutdown().await.unwrap();
        });

        let (src, _) = listener.accept().await.unwrap();
        let dst_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dst_addr = dst_listener.local_addr().unwrap();
        let dst_client = TcpStream::connect(dst_addr).await.unwrap();
        let (mut dst_server, _) = dst_listener.accept().await.unwrap();

        let total = Arc::new(AtomicU64::new(0));
        let total_clone = total.clone();

        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let mut collected = Vec::new();
            loop {
                let n = dst_server.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                collected.extend_from_slice(&buf[..n]);
            }
            collected
        });

        let cfg = CopyConfig { buf_size: 1024, timeout: std::time::Duration::from_secs(5) };
        let outcome = copy_lazy(&src, &dst_client, cfg, move |n| {
            total_clone.fetch_add(n, Ordering::Relaxed);
        })
        .await
        .unwrap();

        writer.await.unwrap();
        drop(dst_client);
        let received = reader.await.unwrap();

        assert_eq!(outcome, CopyOutcome::EofClean);
        assert_eq!(total.load(Ordering::Relaxed), 6);
        assert_eq!(received, b"hello\n");
    }
}
