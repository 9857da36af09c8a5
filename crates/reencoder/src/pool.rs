use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use anyhow::{anyhow, Result};
use log::{debug, error};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

/// Work counters shared by every task of a run
#[derive(Debug, Default)]
pub struct Progress {
    queued: AtomicU64,
    completed: AtomicU64,
}

impl Progress {
    /// Count one more file needing work, returning the new total
    pub fn add_queued(&self) -> u64 {
        self.queued.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    /// Count one more finished unit of work, returning the new total
    pub fn complete_one(&self) -> u64 {
        self.completed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
}

/// Per-run state handed to both passes
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub token: CancellationToken,
    pub progress: Arc<Progress>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            progress: Arc::new(Progress::default()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

/// What happened to a unit of work handed to [`WorkerPool::dispatch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Started,
    Cancelled,
}

/// At most `limit` tasks in flight; failures are collected, not raised mid-flight.
/// Cancellation is only checked on dispatch, a started task always runs to completion.
pub struct WorkerPool<T> {
    name: &'static str,
    permits: Arc<Semaphore>,
    tasks: JoinSet<Result<T>>,
    token: CancellationToken,
    results: Vec<T>,
    first_error: Option<anyhow::Error>,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(name: &'static str, limit: usize, token: CancellationToken) -> Self {
        Self {
            name,
            permits: Arc::new(Semaphore::new(limit.max(1))),
            tasks: JoinSet::new(),
            token,
            results: Vec::new(),
            first_error: None,
        }
    }

    /// Wait for a free slot and start `work`, unless the run was cancelled first
    pub async fn dispatch<F>(&mut self, work: F) -> Dispatch
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        self.reap();
        let permits = self.permits.clone();
        let permit = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Dispatch::Cancelled,
            permit = permits.acquire_owned() => match permit {
                Ok(permit) => permit,
                // The semaphore is never closed while the pool is alive
                Err(_) => return Dispatch::Cancelled,
            },
        };

        self.tasks.spawn(async move {
            let _permit = permit;
            work.await
        });
        Dispatch::Started
    }

    /// Whether any finished task returned an error
    pub fn has_failed(&self) -> bool {
        self.first_error.is_some()
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Collect results of tasks that already finished, without waiting
    pub fn reap(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            self.record(joined);
        }
    }

    /// Wait for every started task. Returns their results, or the first error if any task failed.
    pub async fn finish(mut self) -> Result<Vec<T>> {
        debug!("{}: waiting for {} in-flight task(s)", self.name, self.tasks.len());
        while let Some(joined) = self.tasks.join_next().await {
            self.record(joined);
        }
        match self.first_error {
            Some(e) => Err(e),
            None => Ok(self.results),
        }
    }

    fn record(&mut self, joined: Result<Result<T>, JoinError>) {
        let outcome = joined.unwrap_or_else(|e| Err(anyhow!("{} task panicked: {}", self.name, e)));
        match outcome {
            Ok(value) => self.results.push(value),
            Err(e) if self.first_error.is_none() => self.first_error = Some(e),
            Err(e) => error!("{}: additional task failure: {:#}", self.name, e),
        }
    }
}
