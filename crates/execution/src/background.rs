//! Periodic background tasks with graceful shutdown.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Handle to control a running background loop.
#[derive(Debug)]
pub struct BackgroundHandle {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl BackgroundHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Request shutdown and wait for the in-progress tick to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            warn!(task = self.name, error = %e, "background task ended abnormally");
        }
    }
}

/// Run `tick` every `interval` until the returned handle is shut down.
///
/// Ticks never overlap; a tick that overruns the interval delays the next one.
pub(crate) fn spawn_loop<F, Fut>(name: &'static str, interval: Duration, mut tick: F) -> BackgroundHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (shutdown, mut shutdown_rx) = watch::channel(false);

    let join = tokio::spawn(async move {
        info!(task = name, interval_ms = interval.as_millis() as u64, "background task started");

        let mut heartbeat = tokio::time::interval(interval.max(Duration::from_millis(1)));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    tick().await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!(task = name, "background task stopped");
    });

    BackgroundHandle {
        name,
        shutdown,
        join,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn loop_ticks_until_shutdown() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();

        let handle = spawn_loop("test-loop", Duration::from_millis(5), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(handle.name(), "test-loop");
        handle.shutdown().await;

        let observed = ticks.load(Ordering::SeqCst);
        assert!(observed >= 2, "expected several ticks, saw {observed}");

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), observed);
    }
}
