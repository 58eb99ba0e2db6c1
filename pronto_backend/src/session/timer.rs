use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// A delayed task owned by a session. `cancel` aborts the task; dropping the
/// handle detaches it. The id lets a task that already woke up check whether
/// it is still the one the session is waiting on.
#[derive(Debug)]
pub struct ScheduledTimer {
    id: u64,
    fires_in: Duration,
    handle: JoinHandle<()>,
}

impl ScheduledTimer {
    /// Run `action` after `delay` on the current tokio runtime.
    pub fn spawn<F>(id: u64, delay: Duration, action: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action.await;
        });
        Self {
            id,
            fires_in: delay,
            handle,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn fires_in(&self) -> Duration {
        self.fires_in
    }

    pub fn cancel(self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let timer = ScheduledTimer::spawn(1, Duration::from_secs(5), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(timer.fires_in(), Duration::from_secs(5));

        tokio::time::sleep(Duration::from_millis(4_999)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let timer = ScheduledTimer::spawn(7, Duration::from_secs(1), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(timer.id(), 7);
        timer.cancel();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
