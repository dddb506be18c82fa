//! Readiness polling
//!
//! Thin wrapper over `poll(2)` used by the splice and zerocopy forwarding
//! strategies to wait for a single fd to become readable or writable before
//! retrying a syscall that returned `EAGAIN`.

use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use thiserror::Error;

/// Events a caller may wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const READ: Interest = Interest { read: true, write: false };
    pub const WRITE: Interest = Interest { read: false, write: true };

    fn to_poll_flags(self) -> PollFlags {
        let mut flags = PollFlags::empty();
        if self.read {
            flags |= PollFlags::POLLIN;
        }
        if self.write {
            flags |= PollFlags::POLLOUT;
        }
        flags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ready,
    TimedOut,
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("poll(2) failed: {0}")]
    Syscall(#[source] Errno),
}

/// Wait for `fd` to become ready for `events`. `timeout == Duration::ZERO`
/// blocks indefinitely. Spurious wakeups are possible; callers must retry on
/// `EAGAIN` after a `Ready` return.
pub fn wait<Fd: AsRawFd>(fd: &Fd, events: Interest, timeout: Duration) -> Result<Outcome, PollError> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd.as_raw_fd()) };
    let mut fds = [PollFd::new(&borrowed, events.to_poll_flags())];

    let poll_timeout: PollTimeout = if timeout.is_zero() {
        PollTimeout::NONE
    } else {
        // PollTimeout in nix 0.29 takes a u16 count of ms-ish units capped
        // well below typical proxy timeouts; clamp to u16::MAX rather than
        // truncate silently into a much shorter (or effectively random) wait.
        let millis = timeout.as_millis().min(u16::MAX as u128) as u16;
        PollTimeout::from(millis)
    };

    loop {
        match poll(&mut fds, poll_timeout) {
            Ok(0) => return Ok(Outcome::TimedOut),
            Ok(_) => return Ok(Outcome::Ready),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(PollError::Syscall(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn listener_is_readable_after_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = std::net::TcpStream::connect(addr).unwrap();

        let outcome = wait(&listener, Interest::READ, Duration::from_secs(5)).unwrap();
        assert_eq!(outcome, Outcome::Ready);
    }

    #[test]
    fn times_out_when_nothing_is_ready() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let outcome = wait(&listener, Interest::READ, Duration::from_millis(50)).unwrap();
        assert_eq!(outcome, Outcome::TimedOut);
    }
}
