//! Bounded-concurrency batch runner.
//!
//! [`BatchRunner::process`] drives a fixed list of items through an async
//! operation with at most `concurrency` operations in flight. Every item
//! produces exactly one [`Outcome`], and the returned list lines up with the
//! input list index for index, whatever order the operations finish in.
//!
//! All operations are polled from the caller's task, so the admission state
//! (the in-flight set and the pending queue) is only touched between polls.

use anyhow::Result;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Number of operations allowed in flight when nothing else is configured.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// The result of running the operation for a single item.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<R, E> {
    Success(R),
    Failure(E),
}

impl<R, E> Outcome<R, E> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    pub fn success(&self) -> Option<&R> {
        match self {
            Self::Success(value) => Some(value),
            Self::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&E> {
        match self {
            Self::Success(_) => None,
            Self::Failure(err) => Some(err),
        }
    }

    pub fn into_result(self) -> Result<R, E> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure(err) => Err(err),
        }
    }
}

impl<R, E> From<Result<R, E>> for Outcome<R, E> {
    fn from(result: Result<R, E>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(err) => Self::Failure(err),
        }
    }
}

/// Error produced for an item whose operation exceeded the runner's item timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemTimedOut {
    limit: Duration,
}

impl ItemTimedOut {
    pub fn limit(&self) -> Duration {
        self.limit
    }
}

impl fmt::Display for ItemTimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation timed out after {:.1}s", self.limit.as_secs_f64())
    }
}

impl std::error::Error for ItemTimedOut {}

/// Runs async operations over a list of items with a cap on how many run at once.
///
/// # Example
///
/// ```rust,no_run
/// use photo_captioner::runner::BatchRunner;
///
/// # async fn example() -> anyhow::Result<()> {
/// let runner = BatchRunner::new(2)?;
/// let items = vec![1u64, 2, 3];
/// let outcomes = runner
///     .process(&items, |n| async move { Ok::<_, anyhow::Error>(n * 10) })
///     .await;
/// assert_eq!(outcomes.len(), 3);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct BatchRunner {
    concurrency: usize,
    item_timeout: Option<Duration>,
}

impl Default for BatchRunner {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            item_timeout: None,
        }
    }
}

impl BatchRunner {
    /// Create a runner that keeps at most `concurrency` operations in flight.
    ///
    /// A limit of zero could never admit anything and is rejected.
    pub fn new(concurrency: usize) -> Result<Self> {
        if concurrency == 0 {
            anyhow::bail!("Concurrency must be at least 1");
        }
        Ok(Self {
            concurrency,
            item_timeout: None,
        })
    }

    /// Bound every operation by `limit`. An operation that runs longer is
    /// dropped, recorded as a failure, and its slot is handed to the next item.
    pub fn with_item_timeout(mut self, limit: Duration) -> Self {
        self.item_timeout = Some(limit);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn item_timeout(&self) -> Option<Duration> {
        self.item_timeout
    }

    /// Run `operation` once for every item and collect the outcomes in input order.
    ///
    /// The first `concurrency` items start immediately, the rest wait in a FIFO
    /// queue and are admitted one by one as running operations finish. A failing
    /// operation only affects its own outcome.
    pub async fn process<'a, T, R, E, F, Fut>(
        &self,
        items: &'a [T],
        operation: F,
    ) -> Vec<Outcome<R, E>>
    where
        F: Fn(&'a T) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<ItemTimedOut>,
    {
        if items.is_empty() {
            return Vec::new();
        }

        let mut running = FuturesUnordered::new();
        let mut pending: VecDeque<(usize, &'a T)> = VecDeque::new();
        let mut finished: Vec<(usize, Outcome<R, E>)> = Vec::with_capacity(items.len());

        for (index, item) in items.iter().enumerate() {
            if running.len() < self.concurrency {
                log::debug!("Admitting item {index} ({} in flight)", running.len() + 1);
                running.push(guarded(index, operation(item), self.item_timeout));
            } else {
                log::debug!("Deferring item {index} ({} queued)", pending.len() + 1);
                pending.push_back((index, item));
            }
        }

        while let Some((index, result)) = running.next().await {
            log::debug!(
                "Item {index} finished ({})",
                if result.is_ok() { "ok" } else { "failed" }
            );
            finished.push((index, Outcome::from(result)));

            if let Some((next, item)) = pending.pop_front() {
                log::debug!("Admitting queued item {next} ({} still queued)", pending.len());
                running.push(guarded(next, operation(item), self.item_timeout));
            }
        }

        finished.sort_by_key(|(index, _)| *index);
        finished.into_iter().map(|(_, outcome)| outcome).collect()
    }
}

/// Tag an operation with its item index and apply the optional timeout.
async fn guarded<R, E, Fut>(
    index: usize,
    operation: Fut,
    timeout: Option<Duration>,
) -> (usize, Result<R, E>)
where
    Fut: Future<Output = Result<R, E>>,
    E: From<ItemTimedOut>,
{
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, operation).await {
            Ok(result) => result,
            Err(_) => Err(E::from(ItemTimedOut { limit })),
        },
        None => operation.await,
    };
    (index, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Instant;
    use tokio::time::sleep;

    /// Tracks how many operations are running and the most seen at once.
    #[derive(Default)]
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Gauge {
        fn enter(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        fn leave(&self) {
            self.current.fetch_sub(1, Ordering::SeqCst);
        }

        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    // ── construction ─────────────────────────────────────────────────

    #[test]
    fn zero_concurrency_rejected() {
        assert!(BatchRunner::new(0).is_err());
    }

    #[test]
    fn default_concurrency_is_four() {
        let runner = BatchRunner::default();
        assert_eq!(runner.concurrency(), DEFAULT_CONCURRENCY);
        assert_eq!(runner.concurrency(), 4);
        assert!(runner.item_timeout().is_none());
    }

    #[test]
    fn with_item_timeout_sets_limit() {
        let runner = BatchRunner::new(2)
            .unwrap()
            .with_item_timeout(Duration::from_secs(5));
        assert_eq!(runner.item_timeout(), Some(Duration::from_secs(5)));
    }

    // ── process ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn empty_input_never_calls_operation() {
        let runner = BatchRunner::new(3).unwrap();
        let calls = AtomicUsize::new(0);
        let items: Vec<u32> = Vec::new();

        let outcomes = runner
            .process(&items, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<u32, anyhow::Error>(0) }
            })
            .await;

        assert!(outcomes.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn outcomes_follow_input_order() {
        let runner = BatchRunner::new(3).unwrap();
        // Later items finish first
        let items: Vec<u64> = vec![50, 40, 30, 20, 10, 0];

        let outcomes = runner
            .process(&items, |delay| async move {
                sleep(Duration::from_millis(*delay)).await;
                Ok::<u64, anyhow::Error>(*delay * 2)
            })
            .await;

        let values: Vec<u64> = outcomes
            .iter()
            .map(|o| *o.success().expect("all succeed"))
            .collect();
        assert_eq!(values, vec![100, 80, 60, 40, 20, 0]);
    }

    #[tokio::test]
    async fn never_exceeds_concurrency_limit() {
        let runner = BatchRunner::new(3).unwrap();
        let gauge = Gauge::default();
        let items: Vec<u64> = (0..12).map(|i| 5 + (i * 7) % 20).collect();

        let outcomes = runner
            .process(&items, |delay| {
                let gauge = &gauge;
                async move {
                    gauge.enter();
                    sleep(Duration::from_millis(*delay)).await;
                    gauge.leave();
                    Ok::<(), anyhow::Error>(())
                }
            })
            .await;

        assert_eq!(outcomes.len(), 12);
        assert!(outcomes.iter().all(Outcome::is_success));
        assert_eq!(gauge.peak(), 3);
    }

    #[tokio::test]
    async fn failure_is_isolated() {
        let runner = BatchRunner::new(2).unwrap();
        let items = vec![1, 2, 3, 4, 5];

        let outcomes = runner
            .process(&items, |n| async move {
                sleep(Duration::from_millis(5)).await;
                if *n == 3 {
                    anyhow::bail!("item {n} exploded");
                }
                Ok(*n)
            })
            .await;

        assert_eq!(outcomes.len(), 5);
        for (i, outcome) in outcomes.iter().enumerate() {
            if i == 2 {
                let err = outcome.failure().expect("third item fails");
                assert!(err.to_string().contains("exploded"));
            } else {
                assert_eq!(outcome.success(), Some(&items[i]));
            }
        }
    }

    #[tokio::test]
    async fn every_item_can_fail() {
        let runner = BatchRunner::new(2).unwrap();
        let items = vec!["a", "b", "c"];

        let outcomes = runner
            .process(&items, |name| async move {
                Err::<(), anyhow::Error>(anyhow::anyhow!("{name} failed"))
            })
            .await;

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(Outcome::is_failure));
        assert_eq!(outcomes[1].failure().unwrap().to_string(), "b failed");
    }

    #[tokio::test]
    async fn queued_items_start_in_submission_order() {
        let runner = BatchRunner::new(1).unwrap();
        let started = Mutex::new(Vec::new());
        let items = vec!["A", "B", "C"];

        runner
            .process(&items, |name| {
                let started = &started;
                async move {
                    started.lock().unwrap().push(*name);
                    sleep(Duration::from_millis(5)).await;
                    Ok::<(), anyhow::Error>(())
                }
            })
            .await;

        assert_eq!(*started.lock().unwrap(), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn operation_only_invoked_on_admission() {
        let runner = BatchRunner::new(2).unwrap();
        let invoked = AtomicUsize::new(0);
        let completed = Arc::new(AtomicUsize::new(0));
        let peak_at_invoke = AtomicUsize::new(0);
        let items: Vec<u64> = vec![10, 5, 15, 5, 10];

        runner
            .process(&items, |delay| {
                let now = invoked.fetch_add(1, Ordering::SeqCst) + 1;
                let in_flight = now - completed.load(Ordering::SeqCst);
                peak_at_invoke.fetch_max(in_flight, Ordering::SeqCst);
                let completed = Arc::clone(&completed);
                async move {
                    sleep(Duration::from_millis(*delay)).await;
                    completed.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), anyhow::Error>(())
                }
            })
            .await;

        assert_eq!(invoked.load(Ordering::SeqCst), 5);
        assert_eq!(peak_at_invoke.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn two_slots_three_items_scenario() {
        let runner = BatchRunner::new(2).unwrap();
        let gauge = Gauge::default();
        let origin = Instant::now();
        let start_offsets = Mutex::new(vec![Duration::ZERO; 3]);
        let items: Vec<(usize, u64)> = vec![(0, 30), (1, 10), (2, 10)];

        let outcomes = runner
            .process(&items, |(index, delay)| {
                let gauge = &gauge;
                let start_offsets = &start_offsets;
                async move {
                    start_offsets.lock().unwrap()[*index] = origin.elapsed();
                    gauge.enter();
                    sleep(Duration::from_millis(*delay)).await;
                    gauge.leave();
                    Ok::<usize, anyhow::Error>(*index)
                }
            })
            .await;

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(Outcome::is_success));
        assert!(gauge.peak() <= 2);

        let offsets = start_offsets.lock().unwrap();
        // The third item waits for the 10ms item to free a slot
        assert!(offsets[2] >= Duration::from_millis(9), "started at {:?}", offsets[2]);
        // ...but not for the 30ms item
        assert!(offsets[2] < Duration::from_millis(30) + Duration::from_millis(25));
    }

    #[tokio::test]
    async fn slow_item_times_out_without_blocking_others() {
        let runner = BatchRunner::new(1)
            .unwrap()
            .with_item_timeout(Duration::from_millis(20));
        let items: Vec<u64> = vec![1_000, 1];

        let started = Instant::now();
        let outcomes = runner
            .process(&items, |delay| async move {
                sleep(Duration::from_millis(*delay)).await;
                Ok::<u64, anyhow::Error>(*delay)
            })
            .await;

        assert!(started.elapsed() < Duration::from_millis(500));
        let err = outcomes[0].failure().expect("first item times out");
        let timed_out = err.downcast_ref::<ItemTimedOut>().expect("timeout error");
        assert_eq!(timed_out.limit(), Duration::from_millis(20));
        assert_eq!(outcomes[1].success(), Some(&1));
    }

    // ── Outcome ──────────────────────────────────────────────────────

    #[test]
    fn outcome_from_result() {
        let ok: Outcome<u8, String> = Ok(1).into();
        let err: Outcome<u8, String> = Err("no".to_string()).into();
        assert!(ok.is_success());
        assert!(err.is_failure());
        assert_eq!(ok.into_result(), Ok(1));
        assert_eq!(err.into_result(), Err("no".to_string()));
    }

    #[test]
    fn item_timed_out_display() {
        let err = ItemTimedOut {
            limit: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "operation timed out after 1.5s");
    }
}
