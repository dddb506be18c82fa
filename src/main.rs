//! proxyd - Entry point
//!
//! Minimal wiring, not a routing engine: one listener per mapping alias,
//! each accepted connection forwarded to that alias's target via
//! `copy_pair`. Acceptance and routing policy beyond this are out of scope.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use proxyd::config::Config;
use proxyd::control::{self, ControlState};
use proxyd::dispatch::copy_pair;
use proxyd::forward::{CopyConfig, Mode};
use proxyd::mapping::MappingTable;
use proxyd::metrics::Metrics;
use proxyd::shutdown::{self, ShutdownRegistry};
use proxyd::util;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).with_context(|| format!("failed to load config from {:?}", config_path))?;

    util::init_tracing(&config.logging)?;
    info!(version = proxyd::VERSION, config_path = ?config_path, "starting proxyd");

    let metrics = Arc::new(Metrics::new());
    let mappings = Arc::new(MappingTable::empty(metrics.clone()));
    mappings
        .load(&config.server.mapping_path)
        .with_context(|| format!("failed to load mapping file {:?}", config.server.mapping_path))?;

    let mode = Mode::parse(&config.forward.mode);
    let cfg = CopyConfig { buf_size: config.forward.buf_size, timeout: config.forward.timeout() };

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let registry = Arc::new(ShutdownRegistry::new());

    let control_state = Arc::new(ControlState {
        start_time: std::time::Instant::now(),
        liveness_delay: config.liveness_delay(),
        readiness_delay: config.readiness_delay(),
        manual_ready: AtomicBool::new(config.control.manual_ready),
        mappings: mappings.clone(),
        metrics: metrics.clone(),
        mapping_path: config.server.mapping_path.clone(),
        version: config.server.version.clone(),
        rotate_script: config.server.rotate_script_path.clone(),
        started_at_wall: chrono::Utc::now(),
    });

    let control_addr: SocketAddr = config.server.control_bind_addr;
    let control_shutdown = shutdown_flag.clone();
    std::thread::spawn(move || {
        if let Err(e) = control::run(control_addr, control_state, control_shutdown) {
            error!(error = %e, "control server exited");
        }
    });
    info!(%control_addr, "control server started");

    shutdown::install(registry.clone(), shutdown_flag.clone());

    let mut listener_tasks = Vec::new();
    for entry in mappings.snapshot() {
        let addr: SocketAddr = match entry.alias.parse() {
            Ok(a) => a,
            Err(e) => {
                warn!(alias = %entry.alias, error = %e, "skipping mapping entry with unparsable alias");
                continue;
            }
        };
        let target = entry.target.clone();
        let metrics = metrics.clone();
        let shutdown_flag = shutdown_flag.clone();

        listener_tasks.push(tokio::spawn(async move {
            if let Err(e) = run_listener(addr, target, mode, cfg, metrics, shutdown_flag).await {
                error!(%addr, error = %e, "listener exited");
            }
        }));
    }

    for task in listener_tasks {
        let _ = task.await;
    }

    info!("proxyd stopped");
    Ok(())
}

/// Accept connections on `addr` and forward each to `target` until
/// `shutdown_flag` is set.
async fn run_listener(
    addr: SocketAddr,
    target: String,
    mode: Mode,
    cfg: CopyConfig,
    metrics: Arc<Metrics>,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<()> {
    let listener = util::bind_tcp_listener(addr)?;
    info!(%addr, %target, "proxy listener bound");

    loop {
        if shutdown_flag.load(Ordering::Relaxed) {
            return Ok(());
        }

        let (inbound, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = tokio::time::sleep(std::time::Duration::from_millis(200)) => continue,
        };

        let target = target.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let outbound = match tokio::net::TcpStream::connect(&target).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(%peer, %target, error = %e, "failed to connect to target");
                    return;
                }
            };

            match copy_pair(inbound, outbound, mode, cfg, metrics).await {
                proxyd::dispatch::PairOutcome::Clean => {}
                proxyd::dispatch::PairOutcome::Failed(e) => {
                    warn!(%peer, %target, error = %e, "pair forwarding failed");
                }
            }
        });
    }
}
