//! Shutdown/signal glue
//!
//! An ordered list of shutdown callbacks invoked exactly once, plus a signal
//! future that also flips an `AtomicBool` other long-running loops (the
//! control server's accept loop) can poll.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::signal;

/// Registry of callbacks to run once, in registration order, on shutdown.
#[derive(Default)]
pub struct ShutdownRegistry {
    callbacks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    invoked: AtomicBool,
}

impl ShutdownRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a callback. No-op once `invoke_all` has already run.
    pub fn register(&self, cb: impl FnOnce() + Send + 'static) {
        self.callbacks.lock().push(Box::new(cb));
    }

    /// Run every registered callback in order. Idempotent: calling this more
    /// than once only runs the callbacks the first time.
    pub fn invoke_all(&self) {
        if self.invoked.swap(true, Ordering::SeqCst) {
            return;
        }
        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        for cb in callbacks {
            cb();
        }
    }
}

/// Resolves once `SIGINT` or `SIGTERM` (Unix) is observed.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Spawns a task that waits for a shutdown signal, flips `shutdown_flag`,
/// and runs `registry.invoke_all()`.
pub fn install(registry: Arc<ShutdownRegistry>, shutdown_flag: Arc<AtomicBool>) {
    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown_flag.store(true, Ordering::SeqCst);
        registry.invoke_all();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn callbacks_run_in_order_exactly_once() {
        let registry = ShutdownRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            registry.register(move || order.lock().push(i));
        }

        registry.invoke_all();
        registry.invoke_all();

        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn invoke_all_is_idempotent_under_repeated_calls() {
        let registry = ShutdownRegistry::new();
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = count.clone();
        registry.register(move || {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        for _ in 0..5 {
            registry.invoke_all();
        }

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }
}
