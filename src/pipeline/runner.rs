//! Bounded-concurrency runner.
//!
//! Runs one operation per item with two caps: at most `max_concurrent`
//! operations in flight, and new operations started no faster than
//! `max_per_second`. Items are fully isolated from each other.

use std::future::Future;
use std::num::{NonZeroU32, NonZeroUsize};
use std::sync::Arc;

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

type StartLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    pub max_concurrent: NonZeroUsize,
    pub max_per_second: NonZeroU32,
}

impl RunLimits {
    pub fn new(max_concurrent: usize, max_per_second: u32) -> Self {
        Self {
            max_concurrent: NonZeroUsize::new(max_concurrent).unwrap_or(NonZeroUsize::MIN),
            max_per_second: NonZeroU32::new(max_per_second).unwrap_or(NonZeroU32::MIN),
        }
    }
}

/// Run `operation` once for every item and collect the outputs in
/// completion order.
///
/// A panicking operation is logged and contributes no output; every other
/// item still runs to completion.
pub async fn run_each<I, T, F, Fut>(items: Vec<I>, operation: F, limits: RunLimits) -> Vec<T>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    let total = items.len();
    let operation = Arc::new(operation);
    let slots = Arc::new(Semaphore::new(limits.max_concurrent.get()));
    // Burst of one: starts are spaced evenly instead of front-loaded.
    let starts: StartLimiter =
        RateLimiter::direct(Quota::per_second(limits.max_per_second).allow_burst(NonZeroU32::MIN));

    let mut join_set = JoinSet::new();
    let mut outputs = Vec::with_capacity(total);

    for item in items {
        // The semaphore is never closed, so acquire only fails if it were.
        let permit = match slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        starts.until_ready().await;

        let operation = operation.clone();
        join_set.spawn(async move {
            let output = operation(item).await;
            drop(permit);
            output
        });

        // Collect whatever already finished so memory stays bounded.
        while let Some(result) = join_set.try_join_next() {
            collect(result, &mut outputs);
        }
    }

    while let Some(result) = join_set.join_next().await {
        collect(result, &mut outputs);
    }

    tracing::debug!(total, completed = outputs.len(), "Runner batch finished");
    outputs
}

fn collect<T>(result: Result<T, tokio::task::JoinError>, outputs: &mut Vec<T>) {
    match result {
        Ok(output) => outputs.push(output),
        Err(e) => tracing::error!(error = %e, "Runner task panicked or was cancelled"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_never_exceeds_max_concurrent() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let outputs = {
            let active = active.clone();
            let peak = peak.clone();
            run_each(
                (0..100).collect(),
                move |i: usize| {
                    let active = active.clone();
                    let peak = peak.clone();
                    async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        i
                    }
                },
                RunLimits::new(10, 10_000),
            )
            .await
        };

        assert_eq!(outputs.len(), 100);
        assert!(peak.load(Ordering::SeqCst) <= 10);
        assert!(peak.load(Ordering::SeqCst) >= 1);

        let mut sorted = outputs;
        sorted.sort();
        assert_eq!(sorted, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let outputs = run_each(
            vec![1, 2, 3, 4, 5],
            |i: u32| async move {
                if i == 3 {
                    Err(format!("item {} failed", i))
                } else {
                    Ok(i)
                }
            },
            RunLimits::new(2, 1_000),
        )
        .await;

        let mut ok: Vec<u32> = outputs.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
        ok.sort();
        assert_eq!(ok, vec![1, 2, 4, 5]);
        assert_eq!(outputs.iter().filter(|r| r.is_err()).count(), 1);
    }

    #[tokio::test]
    async fn test_panicking_item_does_not_stop_the_batch() {
        let outputs = run_each(
            vec![1, 2, 3],
            |i: u32| async move {
                if i == 2 {
                    panic!("boom");
                }
                i
            },
            RunLimits::new(3, 1_000),
        )
        .await;

        let mut outputs = outputs;
        outputs.sort();
        assert_eq!(outputs, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_start_rate_is_paced() {
        let started = Instant::now();
        let outputs = run_each(
            (0..5).collect(),
            |i: u32| async move { i },
            RunLimits::new(5, 20),
        )
        .await;

        assert_eq!(outputs.len(), 5);
        // Five starts at 20/s with a burst of one need at least four 50ms gaps.
        assert!(started.elapsed() >= Duration::from_millis(190));
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let outputs: Vec<u32> = run_each(Vec::new(), |i: u32| async move { i }, RunLimits::new(1, 1)).await;
        assert!(outputs.is_empty());
    }
}
