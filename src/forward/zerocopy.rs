//! `MSG_ZEROCOPY` send with asynchronous completion reaping (Linux only)
//!
//! `send(2)` with `MSG_ZEROCOPY` returns as soon as the kernel has pinned the
//! caller's pages; it has not actually finished transmitting. The kernel
//! reports completion later on the socket's error queue, in batches that can
//! cover a *range* of send calls at once. Every send gets a sequence number
//! from `SO_ZEROCOPY`'s counter; a completion reports the inclusive range
//! `[lo, hi]` of sequence numbers it covers, not a single id.
//!
//! Two cooperating tasks share one in-flight map, keyed by sequence number,
//! to the byte count sent under that number: the reader/enqueuer (this
//! function's own async loop) reads from `src` and hands chunks to the
//! kernel; a reaper task, spawned alongside it, drains `MSG_ERRQUEUE` and
//! calls `on_bytes` for each completed range as it's retired from the map —
//! bytes are only "forwarded" once the kernel says so, not when `send(2)`
//! returns. `on_bytes` itself is still only ever invoked from this function's
//! own task (not `FnMut`-shareable across threads); the reaper reports
//! completed sums back over a channel instead.

use std::collections::BTreeMap;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::{CopyConfig, CopyOutcome, ForwardError};
use crate::poll::{self, Interest};

const SOL_SOCKET: libc::c_int = libc::SOL_SOCKET;
const SO_ZEROCOPY: libc::c_int = 60;
const MSG_ZEROCOPY: libc::c_int = 0x4000000;

/// Reaper polls the error queue on this cadence when nothing is pending yet.
const REAPER_IDLE_SLEEP: Duration = Duration::from_micros(50);
/// Drain-phase tick while waiting for the reaper to retire the last sends.
const DRAIN_TICK: Duration = Duration::from_micros(200);

type InFlight = Arc<Mutex<BTreeMap<u32, u64>>>;

pub async fn copy_zerocopy(
    src: &TcpStream,
    dst: &TcpStream,
    cfg: CopyConfig,
    mut on_bytes: impl FnMut(u64) + Send,
) -> Result<CopyOutcome, ForwardError> {
    enable_zerocopy(dst)?;

    let in_flight: InFlight = Arc::new(Mutex::new(BTreeMap::new()));
    let (completion_tx, mut completion_rx) = mpsc::unbounded_channel::<u64>();
    let stop = Arc::new(AtomicBool::new(false));
    let reaper_alive = Arc::new(AtomicBool::new(true));

    let reaper = tokio::spawn(reap_task(
        dst.as_raw_fd(),
        in_flight.clone(),
        completion_tx,
        stop.clone(),
        reaper_alive.clone(),
    ));

    let mut seq: u32 = 0;
    let mut read_buf = vec![0u8; cfg.internal_buf_size()];

    let send_result: Result<(), ForwardError> = async {
        loop {
            drain_completions(&mut completion_rx, &mut on_bytes);

            let n = match read_ready(src, &mut read_buf, cfg).await? {
                Some(0) => break,
                Some(n) => n,
                None => continue,
            };

            let this_seq = seq;
            seq = seq.wrapping_add(1);
            in_flight.lock().insert(this_seq, n as u64);

            if send_zerocopy(dst, &read_buf[..n], cfg).await? == SendOutcome::PeerClosed {
                // The kernel never actually queued this send, so no
                // completion will ever arrive for it; drop it here instead
                // of leaving the reaper to wait on it forever.
                in_flight.lock().remove(&this_seq);
                break;
            }
        }
        Ok(())
    }
    .await;

    // Tell the reaper the sender is done enqueueing; it keeps draining until
    // in_flight empties, we time out, or it hits a hard error of its own.
    stop.store(true, Ordering::Release);
    drain_until_empty_or_gone(&mut completion_rx, &in_flight, &reaper_alive, cfg, &mut on_bytes).await;
    let _ = reaper.await;
    drain_completions(&mut completion_rx, &mut on_bytes);

    send_result?;
    Ok(CopyOutcome::EofClean)
}

fn drain_completions(rx: &mut mpsc::UnboundedReceiver<u64>, on_bytes: &mut impl FnMut(u64)) {
    while let Ok(sum) = rx.try_recv() {
        on_bytes(sum);
    }
}

/// Wait for `in_flight` to empty, honoring `cfg.timeout` as the drain
/// deadline. If the reaper has exited (its `recvmsg` hit a hard error), stop
/// waiting immediately — the peer is gone, so whatever is still "in flight"
/// will never complete, and that is not a failure for this copy.
async fn drain_until_empty_or_gone(
    rx: &mut mpsc::UnboundedReceiver<u64>,
    in_flight: &InFlight,
    reaper_alive: &Arc<AtomicBool>,
    cfg: CopyConfig,
    on_bytes: &mut impl FnMut(u64),
) {
    let deadline = tokio::time::Instant::now() + cfg.timeout.max(Duration::from_millis(1));
    loop {
        drain_completions(rx, on_bytes);
        if in_flight.lock().is_empty() {
            return;
        }
        if !reaper_alive.load(Ordering::Acquire) {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep(DRAIN_TICK).await;
    }
}

async fn read_ready(
    src: &TcpStream,
    buf: &mut [u8],
    cfg: CopyConfig,
) -> Result<Option<usize>, ForwardError> {
    use tokio::io::AsyncReadExt;
    let mut src = src;
    match src.read(buf).await {
        Ok(n) => Ok(Some(n)),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            match poll::wait(src, Interest::READ, cfg.timeout) {
                Ok(poll::Outcome::Ready) => Ok(None),
                Ok(poll::Outcome::TimedOut) => Err(ForwardError::TimedOut),
                Err(e) => Err(ForwardError::FatalIo(std::io::Error::other(e))),
            }
        }
        Err(e) => Err(e.into()),
    }
}

fn enable_zerocopy(sock: &TcpStream) -> Result<(), ForwardError> {
    let fd = sock.as_raw_fd();
    let one: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            SOL_SOCKET,
            SO_ZEROCOPY,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(ForwardError::FatalIo(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// How a `send_zerocopy` call concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendOutcome {
    /// The whole chunk was handed to the kernel.
    Sent,
    /// `dst` is gone (`EPIPE`/`ECONNRESET`); the chunk was not fully sent and
    /// never will be, so the caller must stop enqueueing more sends.
    PeerClosed,
}

/// Send `chunk` with `MSG_ZEROCOPY`, retrying on `EAGAIN`/`ENOBUFS` by
/// waiting for writability. `ENOBUFS` means the completion queue is full;
/// draining happens on the reaper's own task, concurrently with this wait.
async fn send_zerocopy(sock: &TcpStream, chunk: &[u8], cfg: CopyConfig) -> Result<SendOutcome, ForwardError> {
    let fd = sock.as_raw_fd();
    let mut offset = 0usize;
    while offset < chunk.len() {
        let rc = unsafe {
            libc::send(
                fd,
                chunk[offset..].as_ptr() as *const libc::c_void,
                chunk.len() - offset,
                MSG_ZEROCOPY | libc::MSG_DONTWAIT,
            )
        };
        if rc >= 0 {
            offset += rc as usize;
            continue;
        }
        let errno = Errno::last();
        match errno {
            Errno::EAGAIN | Errno::ENOBUFS => {
                sock.writable().await.map_err(ForwardError::from)?;
                match poll::wait(sock, Interest::WRITE, cfg.timeout) {
                    Ok(poll::Outcome::Ready) => {}
                    Ok(poll::Outcome::TimedOut) => return Err(ForwardError::TimedOut),
                    Err(e) => return Err(ForwardError::FatalIo(std::io::Error::other(e))),
                }
            }
            Errno::EPIPE | Errno::ECONNRESET => return Ok(SendOutcome::PeerClosed),
            other => return Err(ForwardError::FatalIo(std::io::Error::from(other))),
        }
    }
    Ok(SendOutcome::Sent)
}

/// Runs on its own task for the duration of the one-way copy: repeatedly
/// drains `MSG_ERRQUEUE` on `fd`, folding each completion's byte sum into
/// `completion_tx`. Exits once `stop` is set and `in_flight` is empty, or
/// immediately on a hard `recvmsg` error (flips `alive` to false so the
/// sender knows not to wait for it any longer).
async fn reap_task(
    fd: RawFd,
    in_flight: InFlight,
    completion_tx: mpsc::UnboundedSender<u64>,
    stop: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
) {
    loop {
        match reap_once(fd, &in_flight) {
            Ok(Some(sum)) => {
                if sum > 0 {
                    let _ = completion_tx.send(sum);
                }
            }
            Ok(None) => {
                if stop.load(Ordering::Acquire) && in_flight.lock().is_empty() {
                    return;
                }
                tokio::time::sleep(REAPER_IDLE_SLEEP).await;
            }
            Err(_) => {
                alive.store(false, Ordering::Release);
                return;
            }
        }
    }
}

/// One non-blocking attempt to read a completion off `MSG_ERRQUEUE`.
/// `Ok(None)` means `EAGAIN` (nothing pending); `Ok(Some(0))` means a
/// completion record that didn't decode to a known range (e.g. not a
/// zerocopy origin) — still worth another immediate retry, not a sleep.
fn reap_once(fd: RawFd, in_flight: &InFlight) -> Result<Option<u64>, ForwardError> {
    let mut cmsg_buf = [0u8; 256];
    let mut iov = libc::iovec {
        iov_base: std::ptr::null_mut(),
        iov_len: 0,
    };
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 0;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len();

    let rc = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT) };
    if rc < 0 {
        let errno = Errno::last();
        if errno == Errno::EAGAIN {
            return Ok(None);
        }
        return Err(ForwardError::FatalIo(std::io::Error::from(errno)));
    }

    let Some((lo, hi)) = extract_completion_range(&msg) else {
        return Ok(Some(0));
    };

    let mut guard = in_flight.lock();
    let mut sum = 0u64;
    for id in lo..=hi {
        if let Some(bytes) = guard.remove(&id) {
            sum += bytes;
        }
    }
    Ok(Some(sum))
}

/// Walk the control message chain looking for `SOL_IP`/`SOL_IPV6` level
/// `IP_RECVERR`/`IPV6_RECVERR` carrying a `sock_extended_err`, and decode the
/// inclusive completion range `[hi - lo + 1, hi]` where `hi = ee_info`,
/// `lo = ee_data`: crediting only `ee_info` would under-count coalesced
/// completions, since the kernel can report one completion record covering
/// several sends.
fn extract_completion_range(msg: &libc::msghdr) -> Option<(u32, u32)> {
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            let c = &*cmsg;
            let is_err_level = (c.cmsg_level == libc::SOL_IP && c.cmsg_type == libc::IP_RECVERR)
                || (c.cmsg_level == libc::SOL_IPV6 && c.cmsg_type == libc::IPV6_RECVERR);
            if is_err_level {
                let data_ptr = libc::CMSG_DATA(cmsg) as *const libc::sock_extended_err;
                let mut err = MaybeUninit::<libc::sock_extended_err>::uninit();
                std::ptr::copy_nonoverlapping(data_ptr, err.as_mut_ptr(), 1);
                let err = err.assume_init();
                let hi = err.ee_info;
                let lo = hi.wrapping_sub(err.ee_data);
                return Some((lo.wrapping_add(1), hi));
            }
            cmsg = libc::CMSG_NXTHDR(msg as *const _ as *mut _, cmsg);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_range_is_inclusive_not_single_key() {
        let mut in_flight = BTreeMap::new();
        for seq in 0u32..5 {
            in_flight.insert(seq, 100);
        }
        let lo = 1u32;
        let hi = 3u32;
        let mut sum = 0u64;
        for id in lo..=hi {
            if let Some(bytes) = in_flight.remove(&id) {
                sum += bytes;
            }
        }
        assert_eq!(sum, 300);
        assert_eq!(in_flight.len(), 2);
        assert!(in_flight.contains_key(&0));
        assert!(in_flight.contains_key(&4));
    }

    #[tokio::test]
    async fn reaper_exit_unblocks_drain_even_with_in_flight_entries() {
        let in_flight: InFlight = Arc::new(Mutex::new(BTreeMap::new()));
        in_flight.lock().insert(0, 42);

        let (tx, mut rx) = mpsc::unbounded_channel::<u64>();
        let reaper_alive = Arc::new(AtomicBool::new(false));
        let cfg = CopyConfig { buf_size: 1024, timeout: Duration::from_secs(30) };

        let mut collected = 0u64;
        let start = tokio::time::Instant::now();
        drain_until_empty_or_gone(&mut rx, &in_flight, &reaper_alive, cfg, &mut |n| collected += n).await;

        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(collected, 0);
        assert_eq!(in_flight.lock().len(), 1);
        drop(tx);
    }
}
