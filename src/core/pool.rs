//! Bounded pool of OS-thread workers serving a FIFO task queue.
//!
//! Every registered worker owns one thread and runs at most one task at a
//! time. Tasks are taken from the head of the queue by whichever worker is
//! idle, so they may complete out of submission order. A failing or
//! panicking task only affects its own [`TaskHandle`].

use crossbeam_channel::{Receiver, Sender};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("Task failed: {0}")]
    Task(String),

    #[error("Worker panicked: {0}")]
    Panicked(String),

    #[error("Worker pool is closed")]
    Closed,

    #[error("Failed to spawn worker for pool {pool}: {reason}")]
    Spawn { pool: String, reason: String },

    #[error("Worker pool {0} has no workers")]
    NoWorkers(String),
}

/// Resolves once a worker has finished the submitted task.
#[derive(Debug)]
pub struct TaskHandle<R> {
    rx: oneshot::Receiver<Result<R, PoolError>>,
}

impl<R> Future for TaskHandle<R> {
    type Output = Result<R, PoolError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(PoolError::Closed)))
    }
}

struct Job<T, R> {
    task: T,
    reply: oneshot::Sender<Result<R, PoolError>>,
}

struct WorkerSlot {
    id: Uuid,
    thread: JoinHandle<()>,
}

pub struct WorkerPool<T, R> {
    name: String,
    // `None` once the pool is closed; workers stop when the last sender is gone.
    jobs_tx: Mutex<Option<Sender<Job<T, R>>>>,
    jobs_rx: Receiver<Job<T, R>>,
    busy: Arc<AtomicUsize>,
    workers: Mutex<Vec<WorkerSlot>>,
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T, R> WorkerPool<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// An empty pool. Tasks submitted before any worker is registered wait
    /// in the queue.
    pub fn new(name: impl Into<String>) -> Self {
        let (jobs_tx, jobs_rx) = crossbeam_channel::unbounded();
        Self {
            name: name.into(),
            jobs_tx: Mutex::new(Some(jobs_tx)),
            jobs_rx,
            busy: Arc::new(AtomicUsize::new(0)),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Build a pool with `count` workers, each produced by `factory`.
    pub fn with_workers<F, W>(name: impl Into<String>, count: usize, factory: F) -> Result<Self, PoolError>
    where
        F: Fn() -> W,
        W: FnMut(T) -> anyhow::Result<R> + Send + 'static,
    {
        let pool = Self::new(name);
        if count == 0 {
            return Err(PoolError::NoWorkers(pool.name.clone()));
        }
        for _ in 0..count {
            pool.register(factory())?;
        }
        Ok(pool)
    }

    /// Add a worker. It starts pulling from the queue immediately.
    pub fn register<W>(&self, worker: W) -> Result<Uuid, PoolError>
    where
        W: FnMut(T) -> anyhow::Result<R> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let jobs = self.jobs_rx.clone();
        let busy = Arc::clone(&self.busy);
        let thread = thread::Builder::new()
            .name(format!("{}-{}", self.name, &id.simple().to_string()[..8]))
            .spawn(move || worker_loop(jobs, busy, worker))
            .map_err(|e| PoolError::Spawn {
                pool: self.name.clone(),
                reason: e.to_string(),
            })?;

        log::debug!("Registered worker {} in pool {}", id, self.name);
        lock(&self.workers).push(WorkerSlot { id, thread });
        Ok(id)
    }

    /// Queue a task without blocking the caller.
    pub fn submit(&self, task: T) -> TaskHandle<R> {
        let (reply, rx) = oneshot::channel();
        if let Some(jobs) = lock(&self.jobs_tx).as_ref() {
            // A failed send hands the job back; dropping it resolves the
            // handle with `PoolError::Closed`.
            let _ = jobs.send(Job { task, reply });
        }
        TaskHandle { rx }
    }

    pub fn worker_count(&self) -> usize {
        lock(&self.workers).len()
    }

    pub fn worker_ids(&self) -> Vec<Uuid> {
        lock(&self.workers).iter().map(|slot| slot.id).collect()
    }

    /// Tasks waiting for an idle worker.
    pub fn pending(&self) -> usize {
        self.jobs_rx.len()
    }

    /// Tasks currently executing.
    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    /// Stop accepting work, drop queued tasks and wait for running ones.
    pub fn shutdown(self) {
        self.close();
        let workers = std::mem::take(&mut *lock(&self.workers));
        for slot in workers {
            if slot.thread.join().is_err() {
                log::warn!("Worker {} in pool {} exited abnormally", slot.id, self.name);
            }
        }
    }

    fn close(&self) {
        lock(&self.jobs_tx).take();
        // Dropped jobs drop their reply senders, so their handles resolve
        // with `PoolError::Closed`.
        while self.jobs_rx.try_recv().is_ok() {}
    }
}

impl<T, R> Drop for WorkerPool<T, R> {
    fn drop(&mut self) {
        lock(&self.jobs_tx).take();
        while self.jobs_rx.try_recv().is_ok() {}
    }
}

fn worker_loop<T, R, W>(jobs: Receiver<Job<T, R>>, busy: Arc<AtomicUsize>, mut worker: W)
where
    W: FnMut(T) -> anyhow::Result<R>,
{
    for Job { task, reply } in jobs.iter() {
        busy.fetch_add(1, Ordering::SeqCst);
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| worker(task))) {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(PoolError::Task(format!("{:#}", e))),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::warn!("Worker panicked: {}", message);
                Err(PoolError::Panicked(message))
            }
        };
        busy.fetch_sub(1, Ordering::SeqCst);
        // The caller may have dropped its handle; that is not an error.
        let _ = reply.send(outcome);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_submit_and_await() {
        let pool = WorkerPool::with_workers("double", 2, || |x: u32| -> anyhow::Result<u32> { Ok(x * 2) }).unwrap();

        let handles: Vec<_> = (0..10).map(|i| pool.submit(i)).collect();
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        assert_eq!(results, (0..10).map(|i| i * 2).collect::<Vec<_>>());
        assert_eq!(pool.worker_count(), 2);
    }

    #[tokio::test]
    async fn test_single_worker_serves_fifo() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let order_clone = order.clone();
        let pool = WorkerPool::new("fifo");
        pool.register(move |i: usize| {
            order_clone.lock().unwrap().push(i);
            Ok(i)
        })
        .unwrap();

        let handles: Vec<_> = (0..50).map(|i| pool.submit(i)).collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_at_most_one_task_per_worker() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let pool = {
            let running = running.clone();
            let peak = peak.clone();
            WorkerPool::with_workers("bounded", 3, move || {
                let running = running.clone();
                let peak = peak.clone();
                move |_: ()| -> anyhow::Result<()> {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(5));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap()
        };

        let handles: Vec<_> = (0..30).map(|_| pool.submit(())).collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.busy(), 0);
        assert_eq!(pool.pending(), 0);
    }

    #[tokio::test]
    async fn test_submit_does_not_block_when_workers_busy() {
        let (started_tx, started_rx) = crossbeam_channel::bounded(1);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);

        let pool = WorkerPool::new("gated");
        pool.register(move |x: u32| -> anyhow::Result<u32> {
            if x == 0 {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            }
            Ok(x)
        })
        .unwrap();

        let first = pool.submit(0);
        started_rx.recv().unwrap();

        // The only worker is held inside the first task.
        let second = pool.submit(1);
        let third = pool.submit(2);
        assert_eq!(pool.busy(), 1);
        assert_eq!(pool.pending(), 2);

        release_tx.send(()).unwrap();
        assert_eq!(first.await.unwrap(), 0);
        assert_eq!(second.await.unwrap(), 1);
        assert_eq!(third.await.unwrap(), 2);
        assert_eq!(pool.pending(), 0);
    }

    #[tokio::test]
    async fn test_task_error_is_isolated() {
        let pool = WorkerPool::with_workers("fallible", 1, || {
            |x: i32| -> anyhow::Result<i32> {
                if x < 0 {
                    anyhow::bail!("negative input {}", x);
                }
                Ok(x)
            }
        })
        .unwrap();

        let bad = pool.submit(-1);
        let good = pool.submit(7);

        let err = bad.await.unwrap_err();
        assert!(matches!(err, PoolError::Task(ref msg) if msg.contains("negative input -1")));
        assert_eq!(good.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_panicking_worker_stays_usable() {
        let pool = WorkerPool::with_workers("panicky", 1, || {
            |x: i32| -> anyhow::Result<i32> {
                if x == 0 {
                    panic!("zero is not allowed");
                }
                Ok(10 / x)
            }
        })
        .unwrap();

        let boom = pool.submit(0);
        let fine = pool.submit(5);

        assert!(matches!(boom.await, Err(PoolError::Panicked(ref msg)) if msg.contains("zero")));
        assert_eq!(fine.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_closed() {
        let pool = WorkerPool::with_workers("closing", 1, || |x: u8| -> anyhow::Result<u8> { Ok(x) }).unwrap();
        pool.close();
        assert_eq!(pool.submit(1).await, Err(PoolError::Closed));
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_queued_tasks_wait_for_registration() {
        let pool = WorkerPool::new("late");
        let handle = pool.submit(3u32);
        assert_eq!(pool.pending(), 1);

        let id = pool.register(|x: u32| Ok(x + 1)).unwrap();
        assert_eq!(pool.worker_ids(), vec![id]);
        assert_eq!(handle.await.unwrap(), 4);
    }

    #[test]
    fn test_pool_without_workers_is_rejected() {
        let result = WorkerPool::with_workers("empty", 0, || |x: u8| -> anyhow::Result<u8> { Ok(x) });
        assert!(matches!(result, Err(PoolError::NoWorkers(ref name)) if name == "empty"));
    }

    #[tokio::test]
    async fn test_shutdown_drops_queued_tasks() {
        let (started_tx, started_rx) = crossbeam_channel::bounded(1);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);

        let pool = WorkerPool::new("draining");
        pool.register(move |x: u32| -> anyhow::Result<u32> {
            if x == 0 {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            }
            Ok(x)
        })
        .unwrap();

        let running = pool.submit(0);
        started_rx.recv().unwrap();
        let queued = pool.submit(1);

        pool.close();
        release_tx.send(()).unwrap();
        assert_eq!(running.await.unwrap(), 0);
        assert_eq!(queued.await, Err(PoolError::Closed));
        pool.shutdown();
    }
}
