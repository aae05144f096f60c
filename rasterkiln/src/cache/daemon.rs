//! Background daemon that shrinks an idle cache.
//!
//! The daemon runs in its own thread, watches how long the cache has
//! gone without foreground work, and trims it down to its inactive
//! budget once the configured quiet period passes. It also retries
//! trims that pinned tiles previously blocked.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::core::TileCache;

/// Periodic idle-trim worker for a [`TileCache`].
///
/// Only acts when the cache was built with
/// [`CacheConfig::with_auto_reduce`](super::CacheConfig::with_auto_reduce);
/// otherwise the thread just idles at its check interval. Shut it down
/// with [`TrimDaemon::shutdown`] or by dropping it.
pub struct TrimDaemon {
    thread_handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl TrimDaemon {
    /// Start the daemon, checking the cache every `interval`.
    pub fn start(cache: Arc<TileCache>, interval: Duration) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = shutdown.clone();

        let thread_handle = thread::Builder::new()
            .name("tile-cache-trim".to_string())
            .spawn(move || {
                Self::run_loop(cache, interval, shutdown_flag);
            })
            .expect("failed to spawn trim daemon thread");

        info!(interval_ms = interval.as_millis() as u64, "trim daemon started");

        Self {
            thread_handle: Some(thread_handle),
            shutdown,
        }
    }

    fn run_loop(cache: Arc<TileCache>, interval: Duration, shutdown: Arc<AtomicBool>) {
        // Sleep in short slices so shutdown stays responsive even with
        // long check intervals.
        let nap = interval.min(Duration::from_secs(1)).max(Duration::from_millis(1));
        let mut elapsed = Duration::ZERO;

        loop {
            if shutdown.load(Ordering::Relaxed) {
                debug!("trim daemon received shutdown signal");
                break;
            }

            thread::sleep(nap);
            elapsed += nap;
            if elapsed < interval {
                continue;
            }
            elapsed = Duration::ZERO;

            // Pins may have blocked an earlier trim; retry.
            if cache.is_over_budget() {
                debug!(
                    used = cache.used_bytes(),
                    max = cache.config().max_bytes,
                    "cache over budget, retrying trim"
                );
                cache.trim_to(cache.config().max_bytes);
            }

            let config = cache.config();
            if !config.auto_reduce {
                continue;
            }
            let idle = cache.idle_for();
            if idle < config.inactive_after {
                continue;
            }
            let used = cache.used_bytes();
            if used > config.inactive_max_bytes {
                debug!(
                    used,
                    target = config.inactive_max_bytes,
                    idle_ms = idle.as_millis() as u64,
                    "cache idle, trimming to inactive budget"
                );
                cache.trim_to(config.inactive_max_bytes);
            }
        }

        debug!("trim daemon stopped");
    }

    /// Signal the daemon to stop. Non-blocking; pair with
    /// [`TrimDaemon::join`] for a clean wait.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Wait for the daemon thread to finish.
    pub fn join(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            if let Err(err) = handle.join() {
                warn!("trim daemon thread panicked: {:?}", err);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for TrimDaemon {
    fn drop(&mut self) {
        self.shutdown();
        self.join();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
