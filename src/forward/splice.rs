//! In-kernel pipe splicing (Linux only)
//!
//! Two `splice(2)` calls per chunk: socket -> pipe, then pipe -> socket.
//! Data never crosses into userspace. `SPLICE_F_MOVE` asks the kernel to
//! move pages instead of copying them where it can; `SPLICE_F_MORE` hints
//! more data is coming right behind (matters for TCP_CORK-like batching).

use std::os::fd::{AsRawFd, BorrowedFd};

use nix::errno::Errno;
use nix::fcntl::{splice, SpliceFFlags};
use tokio::net::TcpStream;

use super::{CopyConfig, CopyOutcome, ForwardError};
use crate::pipe::{Pipe, PipeFlags};
use crate::poll::{self, Interest};

fn splice_flags() -> SpliceFFlags {
    SpliceFFlags::SPLICE_F_MOVE | SpliceFFlags::SPLICE_F_MORE
}

pub async fn copy_splice(
    src: &TcpStream,
    dst: &TcpStream,
    cfg: CopyConfig,
    mut on_bytes: impl FnMut(u64) + Send,
) -> Result<CopyOutcome, ForwardError> {
    let mut pipe = Pipe::new(PipeFlags { nonblocking: true }).map_err(map_pipe_err)?;
    if let Err(e) = pipe.set_capacity(cfg.internal_buf_size()) {
        // Best effort: an un-tunable pipe still works, just with a smaller
        // kernel buffer than requested.
        tracing::debug!(error = %e, "could not raise pipe capacity");
    }

    let read_fd = pipe.read_fd().expect("pipe just created");
    let write_fd = pipe.write_fd().expect("pipe just created");

    loop {
        let moved = match splice_to_pipe(src, write_fd, cfg).await? {
            Some(0) => {
                pipe.close();
                return Ok(CopyOutcome::EofClean);
            }
            Some(n) => n,
            None => continue,
        };

        let mut remaining = moved;
        while remaining > 0 {
            match splice_from_pipe(read_fd, dst, remaining, cfg).await? {
                Some(n) if n == 0 => return Ok(CopyOutcome::EofClean),
                Some(n) => remaining -= n,
                None => continue,
            }
        }

        on_bytes(moved as u64);
    }
}

/// Splice from `src`'s socket fd into the pipe's write end. `Ok(None)` means
/// "retry, we just waited out an EAGAIN".
async fn splice_to_pipe(
    src: &TcpStream,
    pipe_write_fd: std::os::fd::RawFd,
    cfg: CopyConfig,
) -> Result<Option<usize>, ForwardError> {
    let raw = src.as_raw_fd();
    let src_fd = unsafe { BorrowedFd::borrow_raw(raw) };
    let dst_fd = unsafe { BorrowedFd::borrow_raw(pipe_write_fd) };

    match splice(src_fd, None, dst_fd, None, cfg.internal_buf_size(), splice_flags()) {
        Ok(n) => Ok(Some(n)),
        Err(Errno::EAGAIN) => {
            wait_readable(src, cfg).await?;
            Ok(None)
        }
        Err(Errno::EPIPE) | Err(Errno::ECONNRESET) => Ok(Some(0)),
        Err(e) => Err(ForwardError::FatalIo(e.into())),
    }
}

/// Splice from the pipe's read end into `dst`'s socket fd.
async fn splice_from_pipe(
    pipe_read_fd: std::os::fd::RawFd,
    dst: &TcpStream,
    want: usize,
    cfg: CopyConfig,
) -> Result<Option<usize>, ForwardError> {
    let src_fd = unsafe { BorrowedFd::borrow_raw(pipe_read_fd) };
    let raw = dst.as_raw_fd();
    let dst_fd = unsafe { BorrowedFd::borrow_raw(raw) };

    match splice(src_fd, None, dst_fd, None, want, splice_flags()) {
        Ok(n) => Ok(Some(n)),
        Err(Errno::EAGAIN) => {
            wait_writable(dst, cfg).await?;
            Ok(None)
        }
        Err(Errno::EPIPE) | Err(Errno::ECONNRESET) => Ok(Some(0)),
        Err(e) => Err(ForwardError::FatalIo(e.into())),
    }
}

async fn wait_readable(fd: &TcpStream, cfg: CopyConfig) -> Result<(), ForwardError> {
    fd.readable().await?;
    match poll::wait(fd, Interest::READ, cfg.timeout) {
        Ok(poll::Outcome::Ready) => Ok(()),
        Ok(poll::Outcome::TimedOut) => Err(ForwardError::TimedOut),
        Err(e) => Err(ForwardError::FatalIo(std::io::Error::other(e))),
    }
}

async fn wait_writable(fd: &TcpStream, cfg: CopyConfig) -> Result<(), ForwardError> {
    fd.writable().await.map_err(ForwardError::from)?;
    match poll::wait(fd, Interest::WRITE, cfg.timeout) {
        Ok(poll::Outcome::Ready) => Ok(()),
        Ok(poll::Outcome::TimedOut) => Err(ForwardError::TimedOut),
        Err(e) => Err(ForwardError::FatalIo(std::io::Error::other(e))),
    }
}

fn map_pipe_err(e: crate::pipe::PipeError) -> ForwardError {
    ForwardError::FatalIo(std::io::Error::other(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn splice_moves_bytes_then_clean_eof() {
        let src_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let src_addr = src_listener.local_addr().unwrap();
        let writer = tokio::spawn(async move {
            let mut s = TcpStream::connect(src_addr).await.unwrap();
            s.write_all(b"splice this\n").await.unwrap();
            s.shutdown().await.unwrap();
        });
        let (src, _) = src_listener.accept().await.unwrap();

        let dst_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dst_addr = dst_listener.local_addr().unwrap();
        let dst_client = TcpStream::connect(dst_addr).await.unwrap();
        let (mut dst_server, _) = dst_listener.accept().await.unwrap();

        let reader = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
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
        let outcome = copy_splice(&src, &dst_client, cfg, |_| {}).await.unwrap();

        writer.await.unwrap();
        drop(dst_client);
        let received = reader.await.unwrap();

        assert_eq!(outcome, CopyOutcome::EofClean);
        assert_eq!(received, b"splice this\n");
    }
}
