use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Handle to a periodic task started with [`run_every`]. `stop` cancels the
/// loop and waits for an in-flight tick to finish.
pub struct TickHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TickHandle {
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

/// Run `tick` every `period`, starting immediately. Ticks do not overlap:
/// the next one is scheduled only after the previous completes, and a slow
/// tick delays rather than bursts the schedule.
pub fn run_every<F, Fut>(period: Duration, mut tick: F) -> TickHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = interval.tick() => {
                    tick().await;
                }
            }
        }
    });

    TickHandle { shutdown_tx, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn ticks_start_immediately_and_repeat() {
        let count = Arc::new(AtomicUsize::new(0));
        let task_count = count.clone();
        let handle = run_every(Duration::from_millis(10), move || {
            let count = task_count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(45)).await;
        handle.stop().await;

        let seen = count.load(Ordering::SeqCst);
        assert!((2..=8).contains(&seen), "tick count out of range: {}", seen);
    }

    #[tokio::test]
    async fn stop_prevents_further_ticks() {
        let count = Arc::new(AtomicUsize::new(0));
        let task_count = count.clone();
        let handle = run_every(Duration::from_millis(5), move || {
            let count = task_count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(12)).await;
        handle.stop().await;
        let seen = count.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }
}
