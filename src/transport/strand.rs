//! Serialising executor for per-transport work.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A serialising executor: posted jobs run one at a time, in post order, on a
/// single spawned task.
///
/// All connection-state mutations, handshake processing and user callbacks of
/// one transport run as strand jobs, which gives them a single total order
/// without a lock around the whole layer. Jobs must be short; anything that
/// waits (timers, socket reads) lives in its own task and posts its
/// continuation back onto the strand.
#[derive(Clone)]
pub struct Strand {
    tx: mpsc::UnboundedSender<Job>,
}

impl Strand {
    /// Create a strand and spawn its draining task.
    ///
    /// The task exits once every handle has been dropped and the queue has
    /// drained. Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
        });
        Self { tx }
    }

    /// Post a job onto the strand.
    ///
    /// Posting never blocks; jobs posted from the same thread run in post
    /// order. A job posted after the strand's task has exited is dropped.
    pub fn post<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let _ = self.tx.send(Box::pin(job));
    }
}

impl Default for Strand {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_jobs_run_in_post_order() {
        let strand = Strand::new();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for i in 0..10 {
            let log = Arc::clone(&log);
            strand.post(async move {
                // Yield so overlap would be visible if jobs interleaved.
                tokio::task::yield_now().await;
                log.lock().push(i);
            });
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*log.lock(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_jobs_never_overlap() {
        let strand = Strand::new();
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let running = Arc::clone(&running);
            let max_seen = Arc::clone(&max_seen);
            strand.post(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
