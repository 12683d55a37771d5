use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use tokio::task::JoinSet;

/// Detached work (sends, typing notifications, read markers, media
/// prefetches) that must not outlive the client.
#[derive(Debug, Default)]
pub struct BackgroundTasks {
    tasks: Mutex<JoinSet<()>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn spawn<F>(&self, name: &'static str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.lock();
        // Reap finished tasks so the set doesn't grow without bound
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    tracing::warn!(target: "roomkeeper::tasks::spawn", "Background task panicked: {}", e);
                }
            }
        }
        tracing::trace!(target: "roomkeeper::tasks::spawn", "Spawning background task {}", name);
        tasks.spawn(future);
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    pub fn abort_all(&self) {
        self.lock().abort_all();
    }

    /// Wait for everything spawned so far to finish.
    pub async fn drain(&self) {
        let mut tasks = std::mem::take(&mut *self.lock());
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    tracing::warn!(target: "roomkeeper::tasks::drain", "Background task panicked: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_spawn_and_drain() {
        let tasks = BackgroundTasks::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = counter.clone();
            tasks.spawn("increment", async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        tasks.drain().await;

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(tasks.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_abort_all_cancels_pending_work() {
        let tasks = BackgroundTasks::new();
        let finished = Arc::new(AtomicUsize::new(0));

        let flag = finished.clone();
        tasks.spawn("slow", async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            flag.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(tasks.pending_count(), 1);

        tasks.abort_all();
        tasks.drain().await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }
}
