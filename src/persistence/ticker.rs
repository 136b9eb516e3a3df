use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Handle to a running persist interval.
///
/// The task ticks every `period` until [`stop`](Self::stop) is called or the
/// handle is dropped.
pub struct PersistTicker {
    cancel: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl PersistTicker {
    /// Spawn the interval. `on_tick` returns `false` to end the task early.
    pub fn spawn<F>(period: Duration, mut on_tick: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let (cancel, mut cancelled) = broadcast::channel(1);

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            // Skip immediate first tick
            timer.tick().await;

            tracing::debug!(period_ms = period.as_millis() as u64, "Persist interval started");

            loop {
                tokio::select! {
                    _ = cancelled.recv() => break,
                    _ = timer.tick() => {
                        if !on_tick() {
                            break;
                        }
                    }
                }
            }

            tracing::debug!("Persist interval stopped");
        });

        Self { cancel, handle }
    }

    /// Cancel the interval. No tick starts after this returns.
    pub fn stop(self) {
        let _ = self.cancel.send(());
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for PersistTicker {
    fn drop(&mut self) {
        let _ = self.cancel.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let ticker = PersistTicker::spawn(Duration::from_millis(500), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });

        tokio::time::sleep(Duration::from_millis(1_250)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);

        ticker.stop();
        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_can_end_task() {
        let ticker = PersistTicker::spawn(Duration::from_millis(500), || false);

        tokio::time::sleep(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;
        assert!(ticker.is_finished());
    }
}
