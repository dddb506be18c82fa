//! Socket utilities and tuning

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;

/// Socket buffer sizes for high performance
pub const RECV_BUFFER_SIZE: usize = 8 * 1024 * 1024; // 8MB
pub const SEND_BUFFER_SIZE: usize = 8 * 1024 * 1024; // 8MB

/// Listen backlog for proxy-facing listeners.
pub const LISTEN_BACKLOG: i32 = 1024;

/// Bind and listen on `addr` with the buffer/keepalive/nodelay tuning
/// `create_tcp_socket` applies, handing back a tokio listener ready to
/// accept. A bare `TcpListener::bind` would skip the buffer sizing and
/// keepalive tuning entirely, which matters for a proxy expected to move
/// bytes at line rate.
pub fn bind_tcp_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    let socket = create_tcp_socket(addr)?;
    socket.bind(&addr.into()).with_context(|| format!("binding {addr}"))?;
    socket.listen(LISTEN_BACKLOG).with_context(|| format!("listening on {addr}"))?;
    optimize_socket_linux(socket.as_raw_fd())?;
    let std_listener: std::net::TcpListener = socket.into();
    tokio::net::TcpListener::from_std(std_listener).with_context(|| format!("adopting listener for {addr}"))
}

/// Create an optimized, bound (not yet listening) TCP socket for proxying
pub fn create_tcp_socket(addr: SocketAddr) -> Result<Socket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    // Enable address reuse
    socket.set_reuse_address(true)?;

    // Set buffer sizes
    socket.set_recv_buffer_size(RECV_BUFFER_SIZE)?;
    socket.set_send_buffer_size(SEND_BUFFER_SIZE)?;

    // TCP optimizations
    socket.set_nodelay(true)?; // Disable Nagle's algorithm
    socket.set_nonblocking(true)?;

    // TCP keepalive for connection health
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(std::time::Duration::from_secs(60))
        .with_interval(std::time::Duration::from_secs(10));
    socket.set_tcp_keepalive(&keepalive)?;

    Ok(socket)
}

/// Apply socket optimizations for an existing socket
#[cfg(target_os = "linux")]
pub fn optimize_socket_linux(fd: std::os::unix::io::RawFd) -> Result<()> {
    use nix::sys::socket::{setsockopt, sockopt};

    // Enable busy polling for lower latency (requires root)
    let _ = setsockopt(fd, sockopt::Busy, &50);

    // Set priority for QoS
    let _ = setsockopt(fd, sockopt::Priority, &6);

    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn optimize_socket_linux(_fd: std::os::unix::io::RawFd) -> Result<()> {
    Ok(())
}

