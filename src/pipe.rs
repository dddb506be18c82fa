//! Anonymous pipe primitives
//!
//! An owned pair of pipe file descriptors used as the kernel-side buffer for
//! splice-based forwarding. Closing either half is idempotent; dropping the
//! pipe without an explicit close still closes both halves (`OwnedFd`'s own
//! `Drop` does that for us), but callers that care about close ordering
//! should call `close()` explicitly.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::pipe2;
use thiserror::Error;

/// Bitflags controlling pipe creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipeFlags {
    pub nonblocking: bool,
}

#[derive(Debug, Error)]
pub enum PipeError {
    #[error("failed to create pipe: {0}")]
    PipeCreate(#[source] Errno),
    #[error("failed to set pipe capacity: {0}")]
    SetCapacity(#[source] Errno),
    #[error("failed to query pipe capacity: {0}")]
    GetCapacity(#[source] Errno),
    #[error("dup2 failed: {0}")]
    Dup2(#[source] Errno),
}

/// An owned anonymous pipe: a read end and a write end.
///
/// The read end is only ever read from, the write end only ever written to.
/// Both are created `CLOEXEC`; `NONBLOCK` is opt-in via `PipeFlags`.
pub struct Pipe {
    read_end: Option<OwnedFd>,
    write_end: Option<OwnedFd>,
}

impl Pipe {
    /// Create a new pipe pair.
    pub fn new(flags: PipeFlags) -> Result<Self, PipeError> {
        let mut oflags = OFlag::O_CLOEXEC;
        if flags.nonblocking {
            oflags |= OFlag::O_NONBLOCK;
        }
        let (read_end, write_end) = pipe2(oflags).map_err(PipeError::PipeCreate)?;
        Ok(Self {
            read_end: Some(read_end),
            write_end: Some(write_end),
        })
    }

    /// Raw fd of the read end, if still open.
    pub fn read_fd(&self) -> Option<RawFd> {
        self.read_end.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Raw fd of the write end, if still open.
    pub fn write_fd(&self) -> Option<RawFd> {
        self.write_end.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Best-effort capacity tuning. Returns the kernel's authoritative,
    /// possibly-clamped capacity.
    pub fn set_capacity(&self, bytes: usize) -> Result<usize, PipeError> {
        let fd = self
            .write_end
            .as_ref()
            .or(self.read_end.as_ref())
            .expect("pipe closed");
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETPIPE_SZ(bytes as i32))
            .map_err(PipeError::SetCapacity)?;
        self.capacity()
    }

    /// Query the pipe's current capacity.
    pub fn capacity(&self) -> Result<usize, PipeError> {
        let fd = self
            .write_end
            .as_ref()
            .or(self.read_end.as_ref())
            .expect("pipe closed");
        let n = fcntl(fd.as_raw_fd(), FcntlArg::F_GETPIPE_SZ).map_err(PipeError::GetCapacity)?;
        Ok(n as usize)
    }

    /// Bytes currently queued in the pipe (informational only).
    pub fn available(&self) -> Result<usize, PipeError> {
        let fd = match self.read_end.as_ref() {
            Some(fd) => fd,
            None => return Ok(0),
        };
        let mut n: libc::c_int = 0;
        let rc = unsafe { libc::ioctl(fd.as_raw_fd(), libc::FIONREAD, &mut n as *mut _) };
        if rc < 0 {
            return Err(PipeError::GetCapacity(Errno::last()));
        }
        Ok(n as usize)
    }

    /// Close the read half. No-op if already closed.
    pub fn close_read(&mut self) {
        self.read_end.take();
    }

    /// Close the write half. No-op if already closed.
    pub fn close_write(&mut self) {
        self.write_end.take();
    }

    /// Close both halves. No-op for halves already closed.
    pub fn close(&mut self) {
        self.close_read();
        self.close_write();
    }
}

/// Rebind `new_fd` to a duplicate of `old_fd`, closing whatever was at
/// `new_fd` first. On success `new_fd` refers to the same open file
/// description as `old_fd`.
pub fn dup2_into(old_fd: RawFd, new_fd: RawFd) -> Result<RawFd, PipeError> {
    nix::unistd::dup2(old_fd, new_fd).map_err(PipeError::Dup2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::FromRawFd;

    #[test]
    fn roundtrip_bytes_through_pipe() {
        let pipe = Pipe::new(PipeFlags::default()).unwrap();
        let mut write_file = unsafe { std::fs::File::from_raw_fd(pipe.write_fd().unwrap()) };
        let mut read_file = unsafe { std::fs::File::from_raw_fd(pipe.read_fd().unwrap()) };

        write_file.write_all(b"hello\n").unwrap();
        // Avoid double-close: the pipe and the Files now share the fds.
        std::mem::forget(pipe);

        let mut buf = [0u8; 6];
        read_file.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello\n");
    }

    #[test]
    fn capacity_is_clamped_and_authoritative() {
        let pipe = Pipe::new(PipeFlags::default()).unwrap();
        let requested = 4 * 16384;
        let actual = pipe.set_capacity(requested).unwrap();
        assert!(actual > 0);
        assert_eq!(pipe.capacity().unwrap(), actual);
    }

    #[test]
    fn close_is_idempotent() {
        let mut pipe = Pipe::new(PipeFlags::default()).unwrap();
        pipe.close_read();
        pipe.close_read();
        pipe.close();
        assert!(pipe.read_fd().is_none());
        assert!(pipe.write_fd().is_none());
    }

    #[test]
    fn dup2_into_makes_new_fd_share_the_old_fds_open_file_description() {
        let mut source = Pipe::new(PipeFlags::default()).unwrap();
        let mut victim = Pipe::new(PipeFlags::default()).unwrap();

        let old_fd = source.write_fd().unwrap();
        let new_fd = victim.write_fd().unwrap();

        let rebound = dup2_into(old_fd, new_fd).unwrap();
        assert_eq!(rebound, new_fd);

        // new_fd now refers to the same open file description as old_fd, so
        // writing through it lands in source's pipe, not victim's original one.
        let payload = b"dup2\n";
        let written = unsafe { libc::write(new_fd, payload.as_ptr() as *const libc::c_void, payload.len()) };
        assert_eq!(written, payload.len() as isize);

        let mut buf = [0u8; 5];
        let read = unsafe {
            libc::read(source.read_fd().unwrap(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };
        assert_eq!(read, buf.len() as isize);
        assert_eq!(&buf, payload);

        source.close();
        victim.close();
    }
}
