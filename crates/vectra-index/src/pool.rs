//! Worker pools for engine calls.
//!
//! Two process-wide pools. The search pool is fixed-size and pre-spawned;
//! the dynamic pool grows on demand up to its cap and lets idle workers
//! expire. Every worker is a dedicated OS thread from spawn to exit, so
//! engine state that is thread-local never observes a migration between
//! calls. Submission blocks once every worker is busy and the queue is
//! full; deadlines are the caller's job.

use std::num::NonZero;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tokio::sync::oneshot;
use tracing::error;

use vectra_core::{Error, Result};

const DYNAMIC_WORKER_EXPIRY: Duration = Duration::from_secs(60);

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Fixed,
    Dynamic,
}

struct Inner {
    tx: Sender<Job>,
    rx: Receiver<Job>,
    cap: usize,
    spawned: AtomicUsize,
    idle: AtomicUsize,
    name: &'static str,
}

pub struct TaskPool {
    inner: Arc<Inner>,
    kind: Kind,
}

/// Resolves when the submitted task completes.
pub struct TaskFuture<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> TaskFuture<T> {
    pub async fn join(self) -> Result<T> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(Error::Canceled("pool worker went away".into())))
    }
}

impl TaskPool {
    /// Fixed pool: `cap` workers, all spawned up front, never purged.
    pub fn fixed(cap: usize, name: &'static str) -> Self {
        let pool = Self::with_kind(cap, name, Kind::Fixed);
        for i in 0..pool.inner.cap {
            pool.spawn_worker(i);
        }
        pool.inner.spawned.store(pool.inner.cap, Ordering::SeqCst);
        pool
    }

    /// Dynamic pool: workers spawned on demand up to `cap`, idle workers
    /// exit after an expiry period.
    pub fn dynamic(cap: usize, name: &'static str) -> Self {
        Self::with_kind(cap, name, Kind::Dynamic)
    }

    fn with_kind(cap: usize, name: &'static str, kind: Kind) -> Self {
        let cap = cap.max(1);
        let (tx, rx) = bounded(cap);
        Self {
            inner: Arc::new(Inner {
                tx,
                rx,
                cap,
                spawned: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                name,
            }),
            kind,
        }
    }

    pub fn cap(&self) -> usize {
        self.inner.cap
    }

    pub fn running(&self) -> usize {
        self.inner.spawned.load(Ordering::SeqCst)
    }

    /// Submit a closure; blocks if the pool's queue is full.
    pub fn submit<T, F>(&self, f: F) -> TaskFuture<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        if self.kind == Kind::Dynamic {
            self.ensure_worker();
        }
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let _ = tx.send(f());
        });
        if self.inner.tx.send(job).is_err() {
            // Channel is closed only if the pool itself was dropped; the
            // receiver side of the oneshot reports the cancellation.
            error!(pool = self.inner.name, "task queue closed, dropping task");
        }
        TaskFuture { rx }
    }

    fn ensure_worker(&self) {
        if self.inner.idle.load(Ordering::SeqCst) > 0 {
            return;
        }
        let grew = self
            .inner
            .spawned
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.inner.cap).then_some(n + 1)
            });
        if let Ok(n) = grew {
            self.spawn_worker(n);
        }
    }

    fn spawn_worker(&self, id: usize) {
        let inner = self.inner.clone();
        let kind = self.kind;
        let result = std::thread::Builder::new()
            .name(format!("{}-{id}", inner.name))
            .spawn(move || match kind {
                Kind::Fixed => {
                    while let Ok(job) = inner.rx.recv() {
                        job();
                    }
                }
                Kind::Dynamic => loop {
                    inner.idle.fetch_add(1, Ordering::SeqCst);
                    let job = inner.rx.recv_timeout(DYNAMIC_WORKER_EXPIRY);
                    inner.idle.fetch_sub(1, Ordering::SeqCst);
                    match job {
                        Ok(job) => job(),
                        Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {
                            inner.spawned.fetch_sub(1, Ordering::SeqCst);
                            return;
                        }
                    }
                },
            });
        if let Err(e) = result {
            if kind == Kind::Dynamic {
                self.inner.spawned.fetch_sub(1, Ordering::SeqCst);
            }
            error!(pool = self.inner.name, "failed to spawn pool worker: {e}");
        }
    }
}

pub fn logical_cpus() -> usize {
    std::thread::available_parallelism().map_or(8, NonZero::get)
}

static SEARCH_POOL: OnceLock<TaskPool> = OnceLock::new();
static DYNAMIC_POOL: OnceLock<TaskPool> = OnceLock::new();

/// Latency-critical pool for search calls.
pub fn search_pool() -> &'static TaskPool {
    SEARCH_POOL.get_or_init(|| TaskPool::fixed(logical_cpus() * 2, "vectra-search"))
}

/// Pool for add/stats/dump and other non-latency-critical engine calls.
pub fn dynamic_pool() -> &'static TaskPool {
    DYNAMIC_POOL.get_or_init(|| TaskPool::dynamic(logical_cpus(), "vectra-dyn"))
}
