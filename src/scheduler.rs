//! Bounded-concurrency batch executor.
//!
//! Items are split into ordered batches of `batch_size`. Each batch runs its
//! items on spawned tasks gated by one semaphore of `max_workers` permits that
//! lives for the whole run, so no more than `max_workers` invocations of the
//! work function are ever in flight. Between batches the scheduler sleeps
//! `inter_batch_delay` (not after the last one).
//!
//! A failed or panicking item yields `None` for that item only; the batch and
//! the batches after it carry on. Results within a batch come back in
//! completion order, so callers correlate by the returned item, not by
//! position.
//!
//! There is no mid-batch abort. A [`StopHandle`] only prevents further batches
//! from being scheduled once the in-flight batch finishes.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::retry::{Sleeper, TokioSleeper};

#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    pub max_workers: usize,
    pub batch_size: usize,
    pub inter_batch_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_workers: 2,
            batch_size: 5,
            inter_batch_delay: Duration::from_millis(2500),
        }
    }
}

/// Cooperative stop signal checked between batches.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct BatchScheduler {
    config: BatchConfig,
    sleeper: Arc<dyn Sleeper>,
    stop: StopHandle,
}

impl BatchScheduler {
    pub fn new(config: BatchConfig) -> Self {
        Self::with_sleeper(config, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(config: BatchConfig, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            config,
            sleeper,
            stop: StopHandle::new(),
        }
    }

    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Run `work` over every item; see the module docs for the guarantees.
    ///
    /// Items in batches that were never scheduled (after a stop) are not
    /// returned.
    pub async fn process<T, R, F, Fut>(&self, items: Vec<T>, work: F) -> Vec<(T, Option<R>)>
    where
        T: Clone + Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        self.process_with_progress(items, work, |_, _| {}).await
    }

    /// Like [`BatchScheduler::process`], calling `on_batch(done, total)` after
    /// each batch completes.
    pub async fn process_with_progress<T, R, F, Fut>(
        &self,
        items: Vec<T>,
        work: F,
        on_batch: impl Fn(usize, usize),
    ) -> Vec<(T, Option<R>)>
    where
        T: Clone + Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let total = items.len();
        let max_workers = self.config.max_workers.max(1);
        let batch_size = self.config.batch_size.max(1);
        let semaphore = Arc::new(Semaphore::new(max_workers));
        let work = Arc::new(work);

        let batches: Vec<Vec<T>> = items
            .chunks(batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        let batch_count = batches.len();
        let mut results = Vec::with_capacity(total);

        for (index, batch) in batches.into_iter().enumerate() {
            if self.stop.is_stopped() {
                let skipped = total - results.len();
                warn!(skipped, "stop requested, not scheduling remaining batches");
                break;
            }

            debug!(batch = index + 1, of = batch_count, size = batch.len(), "starting batch");
            let mut set = JoinSet::new();
            for item in batch {
                let semaphore = Arc::clone(&semaphore);
                let work = Arc::clone(&work);
                set.spawn(async move {
                    let result = match semaphore.acquire_owned().await {
                        Ok(permit) => {
                            let fut = work(item.clone());
                            // Inner task isolates panics in the work function.
                            let outcome = tokio::spawn(async move {
                                let r = fut.await;
                                drop(permit);
                                r
                            })
                            .await;
                            match outcome {
                                Ok(Ok(value)) => Some(value),
                                Ok(Err(e)) => {
                                    warn!(error = %e, "work item failed");
                                    None
                                }
                                Err(e) => {
                                    warn!(error = %e, "work item panicked");
                                    None
                                }
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "worker pool closed");
                            None
                        }
                    };
                    (item, result)
                });
            }

            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(pair) => results.push(pair),
                    // Only reachable if the runtime is shutting down.
                    Err(e) => warn!(error = %e, "batch task did not complete"),
                }
            }

            on_batch(results.len(), total);

            if index + 1 < batch_count && !self.stop.is_stopped() {
                self.sleeper.sleep(self.config.inter_batch_delay).await;
            }
        }

        info!(
            processed = results.len(),
            succeeded = results.iter().filter(|(_, r)| r.is_some()).count(),
            "batch run complete"
        );
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RecordingSleeper;
    use std::sync::atomic::AtomicUsize;

    fn config(max_workers: usize, batch_size: usize) -> BatchConfig {
        BatchConfig {
            max_workers,
            batch_size,
            inter_batch_delay: Duration::from_millis(2500),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_never_exceeds_max_workers() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let scheduler = BatchScheduler::with_sleeper(config(2, 10), sleeper);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
        let results = scheduler
            .process((0..10).collect::<Vec<u32>>(), move |n| {
                let (active, peak) = (Arc::clone(&a), Arc::clone(&p));
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(n * 2)
                }
            })
            .await;

        assert_eq!(results.len(), 10);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn failures_are_isolated() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let scheduler = BatchScheduler::with_sleeper(config(3, 2), sleeper);
        let mut results = scheduler
            .process(vec![1u32, 2, 3, 4, 5], |n| async move {
                if n % 2 == 0 {
                    anyhow::bail!("even {}", n)
                }
                Ok(n * 10)
            })
            .await;
        results.sort_by_key(|(n, _)| *n);
        assert_eq!(
            results,
            vec![
                (1, Some(10)),
                (2, None),
                (3, Some(30)),
                (4, None),
                (5, Some(50))
            ]
        );
    }

    #[tokio::test]
    async fn panics_are_isolated() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let scheduler = BatchScheduler::with_sleeper(config(2, 5), sleeper);
        let mut results = scheduler
            .process(vec![1u32, 2, 3], |n| async move {
                if n == 2 {
                    panic!("boom");
                }
                Ok(n)
            })
            .await;
        results.sort_by_key(|(n, _)| *n);
        assert_eq!(results, vec![(1, Some(1)), (2, None), (3, Some(3))]);
    }

    #[tokio::test]
    async fn sleeps_between_batches_only() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let scheduler = BatchScheduler::with_sleeper(config(2, 5), sleeper.clone());
        let results = scheduler
            .process((0..12).collect::<Vec<u32>>(), |n| async move { Ok(n) })
            .await;
        assert_eq!(results.len(), 12);
        // 3 batches -> 2 delays
        assert_eq!(sleeper.waits(), vec![Duration::from_millis(2500); 2]);
    }

    #[tokio::test]
    async fn empty_input() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let scheduler = BatchScheduler::with_sleeper(config(2, 5), sleeper.clone());
        let results = scheduler
            .process(Vec::<u32>::new(), |n| async move { Ok(n) })
            .await;
        assert!(results.is_empty());
        assert!(sleeper.waits().is_empty());
    }

    #[tokio::test]
    async fn stop_prevents_later_batches() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let scheduler = BatchScheduler::with_sleeper(config(2, 2), sleeper.clone());
        let stop = scheduler.stop_handle();
        let results = scheduler
            .process((0..6).collect::<Vec<u32>>(), move |n| {
                let stop = stop.clone();
                async move {
                    if n == 0 {
                        stop.stop();
                    }
                    Ok(n)
                }
            })
            .await;
        // The first batch finishes; nothing after it is scheduled.
        let mut seen: Vec<u32> = results.into_iter().map(|(n, _)| n).collect();
        seen.sort();
        assert_eq!(seen, vec![0, 1]);
        // No inter-batch delay once stopped.
        assert!(sleeper.waits().is_empty());
    }

    #[tokio::test]
    async fn progress_callback_per_batch() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let scheduler = BatchScheduler::with_sleeper(config(2, 2), sleeper);
        let seen = std::sync::Mutex::new(Vec::new());
        scheduler
            .process_with_progress(
                (0..5).collect::<Vec<u32>>(),
                |n| async move { Ok(n) },
                |done, total| seen.lock().unwrap().push((done, total)),
            )
            .await;
        assert_eq!(seen.into_inner().unwrap(), vec![(2, 5), (4, 5), (5, 5)]);
    }
}
