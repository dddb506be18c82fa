use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::mapping::MappingTable;
use crate::metrics::Metrics;

const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(15);
const BODY_IO_TIMEOUT: Duration = Duration::from_secs(20);
const MAX_HEADER_BYTES: usize = 1024 * 1024;
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(200);
const ROTATE_TIMEOUT: Duration = Duration::from_secs(100);

/// Everything the control endpoints need to answer a request.
pub struct ControlState {
    pub start_time: Instant,
    pub liveness_delay: Duration,
    pub readiness_delay: Duration,
    pub manual_ready: AtomicBool,
    pub mappings: Arc<MappingTable>,
    pub metrics: Arc<Metrics>,
    pub mapping_path: PathBuf,
    pub version: String,
    pub rotate_script: Option<PathBuf>,
    pub started_at_wall: chrono::DateTime<chrono::Utc>,
}

impl ControlState {
    fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    fn is_live(&self) -> bool {
        self.uptime() > self.liveness_delay
    }

    fn is_ready(&self) -> bool {
        self.manual_ready.load(Ordering::Relaxed) || self.uptime() > self.readiness_delay
    }
}

/// Run the control server's accept loop until `shutdown` is set. Returns
/// once the listener has stopped accepting, within `ACCEPT_POLL_INTERVAL` of
/// `shutdown` flipping to `true`.
pub fn run(addr: SocketAddr, state: Arc<ControlState>, shutdown: Arc<AtomicBool>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(false)?;
    info!(%addr, "control server listening");

    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("control server shutting down");
            return Ok(());
        }

        match accept_with_timeout(&listener, ACCEPT_POLL_INTERVAL) {
            Ok(Some(stream)) => {
                let state = state.clone();
                thread::spawn(move || {
                    if let Err(e) = handle_connection(stream, &state) {
                        debug!(error = %e, "control request error");
                    }
                });
            }
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "control accept error");
            }
        }
    }
}

fn accept_with_timeout(listener: &TcpListener, timeout: Duration) -> std::io::Result<Option<TcpStream>> {
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use std::os::fd::AsFd;

    let borrowed = listener.as_fd();
    let mut fds = [PollFd::new(&borrowed, PollFlags::POLLIN)];
    let millis = timeout.as_millis().min(u16::MAX as u128) as u16;
    match poll(&mut fds, PollTimeout::from(millis)) {
        Ok(0) => Ok(None),
        Ok(_) => {
            let (stream, _) = listener.accept()?;
            Ok(Some(stream))
        }
        Err(nix::errno::Errno::EINTR) => Ok(None),
        Err(e) => Err(std::io::Error::from(e)),
    }
}

fn handle_connection(mut stream: TcpStream, state: &ControlState) -> std::io::Result<()> {
    stream.set_read_timeout(Some(HEADER_READ_TIMEOUT))?;
    stream.set_write_timeout(Some(BODY_IO_TIMEOUT))?;

    let request_line = match read_request_line(&mut stream)? {
        Some(line) => line,
        None => return Ok(()),
    };

    let path = request_line.split_whitespace().nth(1).unwrap_or("/");
    let (status, content_type, body) = route(path, state);

    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes())?;
    stream.flush()
}

/// Reads up to `MAX_HEADER_BYTES` looking for the request line; doesn't
/// bother parsing headers since no endpoint here needs them.
fn read_request_line(stream: &mut TcpStream) -> std::io::Result<Option<String>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 512];
    loop {
        if buf.len() >= MAX_HEADER_BYTES {
            return Ok(None);
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line = String::from_utf8_lossy(&buf[..pos]).trim_end().to_string();
            return Ok(Some(line));
        }
    }
}

fn route(path: &str, state: &ControlState) -> (&'static str, &'static str, String) {
    match path {
        "/healthz" => {
            if state.is_live() {
                ("200 OK", "text/plain", "OK".to_string())
            } else {
                ("503 Service Unavailable", "text/plain", "Not OK".to_string())
            }
        }
        "/readyz" => {
            if state.is_ready() {
                ("200 OK", "text/plain", "Ready".to_string())
            } else {
                ("503 Service Unavailable", "text/plain", "Not Ready".to_string())
            }
        }
        "/pingz" => ("200 OK", "text/plain", "pong".to_string()),
        "/versionz" => ("200 OK", "text/plain", format!("Proxy Version: {}\n", state.version)),
        "/statusz" => {
            if state.is_ready() {
                let body = format!(
                    "Proxyd up since: {}\nLiveness delay: {:?}\nReadiness delay: {:?}\n",
                    state.started_at_wall.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
                    state.liveness_delay,
                    state.readiness_delay,
                );
                ("200 OK", "text/plain", body)
            } else {
                ("503 Service Unavailable", "text/plain", "Not Ready".to_string())
            }
        }
        "/mapz" => {
            let snapshot = state.mappings.snapshot();
            let body = serde_json::to_string(&snapshot).unwrap_or_else(|_| "[]".to_string());
            ("200 OK", "application/json", body)
        }
        "/reloadz" => match state.mappings.load(&state.mapping_path) {
            Ok(()) => ("202 Accepted", "text/plain", "Reload initiated".to_string()),
            Err(e) => {
                error!(error = %e, "mapping reload failed");
                ("500 Internal Server Error", "text/plain", format!("reload failed: {e}"))
            }
        },
        "/rotateLogs" => match run_rotate_script(state.rotate_script.as_deref()) {
            Ok(()) => ("202 Accepted", "text/plain", "Log rotation successful".to_string()),
            Err(e) => {
                error!(error = %e, "log rotation failed");
                ("500 Internal Server Error", "text/plain", format!("rotation failed: {e}"))
            }
        },
        "/metricz" => ("200 OK", "text/plain; version=0.0.4", render_prometheus(state)),
        _ => ("404 Not Found", "text/plain", "not found".to_string()),
    }
}

fn render_prometheus(state: &ControlState) -> String {
    let snapshot = state.metrics.snapshot();
    let uptime = state.uptime().as_secs_f64();
    format!(
        "# HELP proxyd_uptime_seconds Seconds since proxyd started\n\
# TYPE proxyd_uptime_seconds counter\n\
proxyd_uptime_seconds {uptime}\n\
# HELP proxyd_connections_total Total number of TCP connections\n\
# TYPE proxyd_connections_total counter\n\
proxyd_connections_total {}\n\
# HELP proxyd_cache_hits Cache hits when resolving pod IP addresses\n\
# TYPE proxyd_cache_hits counter\n\
proxyd_cache_hits {}\n\
# HELP proxyd_cache_misses Cache misses when resolving pod IP addresses\n\
# TYPE proxyd_cache_misses counter\n\
proxyd_cache_misses {}\n\
# HELP proxyd_reloads Total number of config reloads\n\
# TYPE proxyd_reloads counter\n\
proxyd_reloads {}\n",
        snapshot.connections, snapshot.cache_hits, snapshot.cache_misses, snapshot.reloads,
    )
}

/// Runs the configured rotate script, killing it if it hasn't exited within
/// `ROTATE_TIMEOUT`. No script configured is treated as a no-op success.
fn run_rotate_script(script: Option<&std::path::Path>) -> std::io::Result<()> {
    let Some(script) = script else {
        return Ok(());
    };
    let mut child = Command::new(script)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    let deadline = Instant::now() + ROTATE_TIMEOUT;
    loop {
        match child.try_wait()? {
            Some(status) if status.success() => return Ok(()),
            Some(status) => {
                return Err(std::io::Error::other(format!("rotate script exited with {status}")));
            }
            None => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "rotate script timed out"));
                }
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}
