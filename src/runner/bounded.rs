//! Bounded wait over a set of spawned tasks.

use std::future::Future;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::task::{AbortHandle, JoinError};
use tokio::time::{timeout_at, Instant};

/// Tasks that finished before the deadline, plus the keys of those that did not.
#[derive(Debug)]
pub struct BoundedWait<K, T> {
    pub completed: Vec<(K, Result<T, JoinError>)>,
    pub pending: Vec<K>,
}

/// Spawn every task and collect results until all finish or `deadline` passes.
///
/// Tasks still running at the deadline are aborted and reported by key in
/// `pending`; the caller never waits past the deadline.
pub async fn wait_bounded<K, T, F, I>(tasks: I, deadline: Duration) -> BoundedWait<K, T>
where
    I: IntoIterator<Item = (K, F)>,
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let deadline = Instant::now() + deadline;
    let mut keys: Vec<Option<K>> = Vec::new();
    let mut aborts: Vec<AbortHandle> = Vec::new();
    let mut running = FuturesUnordered::new();

    for (index, (key, task)) in tasks.into_iter().enumerate() {
        let handle = tokio::spawn(task);
        keys.push(Some(key));
        aborts.push(handle.abort_handle());
        running.push(async move { (index, handle.await) });
    }

    let mut completed = Vec::with_capacity(keys.len());
    loop {
        match timeout_at(deadline, running.next()).await {
            Ok(Some((index, result))) => {
                if let Some(key) = keys[index].take() {
                    completed.push((key, result));
                }
            }
            Ok(None) | Err(_) => break,
        }
    }

    let mut pending = Vec::new();
    for (key, abort) in keys.into_iter().zip(aborts) {
        if let Some(key) = key {
            abort.abort();
            pending.push(key);
        }
    }

    BoundedWait { completed, pending }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn stragglers_are_reported_as_pending() {
        let tasks = [("fast", 1u64), ("slow", 120), ("medium", 10)].map(|(name, secs)| {
            (name, async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                secs
            })
        });

        let wait = wait_bounded(tasks, Duration::from_secs(30)).await;
        let mut done: Vec<_> = wait
            .completed
            .into_iter()
            .map(|(k, r)| (k, r.unwrap()))
            .collect();
        done.sort();
        assert_eq!(done, vec![("fast", 1), ("medium", 10)]);
        assert_eq!(wait.pending, vec!["slow"]);
    }

    type BoxedTask = std::pin::Pin<Box<dyn Future<Output = u8> + Send>>;

    fn boxed(task: impl Future<Output = u8> + Send + 'static) -> BoxedTask {
        Box::pin(task)
    }

    #[tokio::test]
    async fn panics_are_completed_errors() {
        let tasks: Vec<(usize, BoxedTask)> = vec![
            (0, boxed(async { 7 })),
            (
                1,
                boxed(async {
                    let value: u8 = 0;
                    if value == 0 {
                        panic!("boom");
                    }
                    value
                }),
            ),
        ];
        let wait = wait_bounded(tasks, Duration::from_secs(5)).await;
        assert!(wait.pending.is_empty());
        assert_eq!(wait.completed.len(), 2);
        let failed = wait.completed.iter().find(|(k, _)| *k == 1).unwrap();
        assert!(failed.1.as_ref().unwrap_err().is_panic());
    }

    #[tokio::test]
    async fn empty_task_set_returns_immediately() {
        let tasks: Vec<(u8, std::future::Ready<()>)> = Vec::new();
        let wait = wait_bounded(tasks, Duration::from_secs(1)).await;
        assert!(wait.completed.is_empty() && wait.pending.is_empty());
    }
}
