//! Memory-aware batching over [`TaskHandle`]s.
//!
//! Two entry points:
//! - [`BatchProcessor::process`] awaits already-submitted handles in batches
//!   whose size adapts to memory pressure.
//! - [`BatchProcessor::process_double_loop`] walks an A x B cross product,
//!   submitting at most `chunk_size` tasks before awaiting them, so the full
//!   cross product of tasks never exists at once.

use crate::core::pool::{PoolError, TaskHandle};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Usage ratio above which the next batch shrinks.
pub const MEMORY_THRESHOLD: f64 = 0.7;
pub const INITIAL_CHUNK_SIZE: usize = 1000;
pub const MIN_CHUNK_SIZE: usize = 100;
pub const MAX_CHUNK_SIZE: usize = 10_000;

/// Source of the memory usage ratio consulted between batches.
pub trait MemoryProbe: Send + Sync {
    /// Used / total, in `[0, 1]`.
    fn usage_ratio(&self) -> f64;
}

/// Reads this process's resident memory through `sysinfo`.
///
/// The ratio is the process's resident set over the memory it could still
/// grow into (its own resident set plus what the system has available), so
/// memory held by other processes only matters through what it leaves over.
pub struct SystemMemory {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl SystemMemory {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                log::warn!("Cannot read own pid, batch sizes will not adapt: {}", e);
                None
            }
        };
        Self {
            pid,
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemory {
    fn usage_ratio(&self) -> f64 {
        let Some(pid) = self.pid else {
            return 0.0;
        };
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_memory();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), false);
        match system.process(pid) {
            Some(process) => process_usage_ratio(process.memory(), system.available_memory()),
            None => 0.0,
        }
    }
}

/// `resident / (resident + available)`, clamped to `[0, 1]`.
pub fn process_usage_ratio(resident: u64, available: u64) -> f64 {
    let reachable = resident.saturating_add(available);
    if reachable == 0 {
        return 0.0;
    }
    (resident as f64 / reachable as f64).clamp(0.0, 1.0)
}

pub struct DoubleLoopOptions<'a> {
    /// Tasks submitted before the batch is awaited.
    pub chunk_size: usize,
    /// Called once per completed task, after its batch resolves.
    pub on_progress: Option<&'a mut (dyn FnMut() + Send)>,
}

impl DoubleLoopOptions<'_> {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            on_progress: None,
        }
    }
}

pub struct BatchProcessor {
    chunk_size: AtomicUsize,
    probe: Box<dyn MemoryProbe>,
}

impl BatchProcessor {
    pub fn new() -> Self {
        Self::with_probe(SystemMemory::new(), INITIAL_CHUNK_SIZE)
    }

    pub fn with_probe(probe: impl MemoryProbe + 'static, initial_chunk_size: usize) -> Self {
        Self {
            chunk_size: AtomicUsize::new(initial_chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)),
            probe: Box::new(probe),
        }
    }

    /// Size of the next batch taken by [`process`](Self::process).
    pub fn chunk_size(&self) -> usize {
        self.chunk_size.load(Ordering::Relaxed)
    }

    /// Await `handles` batch by batch, resizing between batches.
    /// Results keep the input order.
    pub async fn process<R>(&self, handles: Vec<TaskHandle<R>>) -> Vec<Result<R, PoolError>> {
        let mut results = Vec::with_capacity(handles.len());
        let mut remaining = handles.into_iter();

        loop {
            let batch: Vec<TaskHandle<R>> = remaining.by_ref().take(self.chunk_size()).collect();
            if batch.is_empty() {
                break;
            }
            for handle in batch {
                results.push(handle.await);
            }
            self.adjust_chunk_size();
        }

        results
    }

    /// Number of tasks a double loop will create: the caller's estimate if
    /// given, otherwise a counting pass with the same filter.
    pub fn expected_total<A, B>(
        a: &[A],
        b: &[B],
        filter: &impl Fn(&A, &B) -> bool,
        estimate: Option<usize>,
    ) -> usize {
        if let Some(estimate) = estimate {
            return estimate;
        }
        a.iter()
            .map(|item_a| b.iter().filter(|item_b| filter(item_a, item_b)).count())
            .sum()
    }

    /// Stream the filtered cross product of `a` and `b` through `create_task`.
    ///
    /// At most `options.chunk_size` handles are outstanding at any time.
    /// `None` results and failed tasks are dropped from the output.
    pub async fn process_double_loop<A, B, R, P, F>(
        &self,
        a: &[A],
        b: &[B],
        filter: P,
        mut create_task: F,
        mut options: DoubleLoopOptions<'_>,
    ) -> Vec<R>
    where
        P: Fn(&A, &B) -> bool,
        F: FnMut(&A, &B) -> TaskHandle<Option<R>>,
    {
        let chunk_size = options.chunk_size.max(1);
        let mut results = Vec::new();
        let mut batch = Vec::with_capacity(chunk_size.min(a.len().saturating_mul(b.len())));

        for item_a in a {
            for item_b in b {
                if !filter(item_a, item_b) {
                    continue;
                }

                batch.push(create_task(item_a, item_b));

                if batch.len() >= chunk_size {
                    drain_batch(&mut batch, &mut results, &mut options.on_progress).await;
                }
            }
        }

        if !batch.is_empty() {
            drain_batch(&mut batch, &mut results, &mut options.on_progress).await;
        }

        results
    }

    fn adjust_chunk_size(&self) {
        let ratio = self.probe.usage_ratio();
        let current = self.chunk_size();
        let next = if ratio > MEMORY_THRESHOLD {
            (current * 4 / 5).max(MIN_CHUNK_SIZE)
        } else {
            (current * 6 / 5).min(MAX_CHUNK_SIZE)
        };

        if next != current {
            log::debug!(
                "Memory usage {:.2}: batch size {} -> {}",
                ratio,
                current,
                next
            );
        }
        self.chunk_size.store(next, Ordering::Relaxed);
    }
}

impl Default for BatchProcessor {
    fn default() -> Self {
        Self::new()
    }
}

async fn drain_batch<R>(
    batch: &mut Vec<TaskHandle<Option<R>>>,
    results: &mut Vec<R>,
    on_progress: &mut Option<&mut (dyn FnMut() + Send)>,
) {
    let completed = batch.len();
    for handle in batch.drain(..) {
        match handle.await {
            Ok(Some(result)) => results.push(result),
            Ok(None) => {}
            Err(e) => log::warn!("Comparison task failed: {}", e),
        }
    }

    if let Some(callback) = on_progress.as_mut() {
        for _ in 0..completed {
            callback();
        }
    }
}
