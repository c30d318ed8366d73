//! Watchdog: the process-wide ticker driving the due-evaluation pass.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::Notify;

use crate::types::SchedulerError;

use super::SchedulerEngine;

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Short delay before the first tick, so hosts finish wiring up.
const WARMUP: Duration = Duration::from_secs(2);

/// Tick errors kept for diagnostics; beyond this they are dropped.
const ERROR_BUFFER: usize = 4;

/// Drives `run_due` on a fixed cadence until shut down.
pub struct Watchdog {
    shutdown_notify: Arc<Notify>,
    is_running: Arc<RwLock<bool>>,
    errors: mpsc::Receiver<SchedulerError>,
}

impl Watchdog {
    /// Spawn the tick loop: one `run_due` after a short warm-up, then one
    /// every `interval`. Each tick runs to completion on its own; shutdown
    /// stops the loop between ticks, never an in-flight pass.
    pub fn start(engine: Arc<SchedulerEngine>, interval: Duration) -> Self {
        let shutdown_notify = Arc::new(Notify::new());
        let is_running = Arc::new(RwLock::new(true));
        let (tx, rx) = mpsc::channel(ERROR_BUFFER);

        let shutdown = shutdown_notify.clone();
        let running = is_running.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(WARMUP) => {}
                _ = shutdown.notified() => return,
            }

            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.notified() => break,
                }
                if !*running.read() {
                    break;
                }

                let report = engine.run_due().await;
                if report.started > 0 {
                    tracing::debug!(started = report.started, "tick started runs");
                }
                if let Some(err) = report.error {
                    tracing::error!(error = %err, "scheduler tick failed");
                    // Diagnostics only; dropped when the buffer is full.
                    let _ = tx.try_send(err);
                }
            }
            tracing::debug!("watchdog loop stopped");
        });

        Self {
            shutdown_notify,
            is_running,
            errors: rx,
        }
    }

    /// Stop the tick loop. Idempotent; running watchers are unaffected.
    pub async fn shutdown(&self) {
        {
            let running = self.is_running.read();
            if !*running {
                return;
            }
        }
        *self.is_running.write() = false;
        self.shutdown_notify.notify_waiters();
        tracing::info!("watchdog shutdown complete");
    }

    /// Drain one buffered tick error, if any.
    pub fn try_next_error(&mut self) -> Option<SchedulerError> {
        self.errors.try_recv().ok()
    }
}
