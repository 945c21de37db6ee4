use crate::core::batch::BatchProcessor;
use crate::core::image::{ImagePool, image_worker};
use crate::core::pool::{PoolError, WorkerPool};
use crate::core::text::{DiffPool, diff_worker};
use crate::settings::WorkerMode;
use std::sync::Arc;

/// Process-wide worker pools, built once and handed to every comparator.
pub struct Workers {
    pub diff: Arc<DiffPool>,
    pub image: Arc<ImagePool>,
    pub batch: Arc<BatchProcessor>,
    mode: WorkerMode,
}

impl Workers {
    pub fn new(mode: WorkerMode) -> Result<Self, PoolError> {
        Self::with_batch_processor(mode, BatchProcessor::new())
    }

    pub fn with_batch_processor(mode: WorkerMode, batch: BatchProcessor) -> Result<Self, PoolError> {
        let count = mode.worker_count();
        log::debug!("Starting {} diff and {} image workers", count, count);

        Ok(Self {
            diff: Arc::new(WorkerPool::with_workers("diff", count, diff_worker)?),
            image: Arc::new(WorkerPool::with_workers("image", count, image_worker)?),
            batch: Arc::new(batch),
            mode,
        })
    }

    pub fn mode(&self) -> WorkerMode {
        self.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::text::DiffTask;

    #[test]
    fn test_single_mode_has_one_worker_per_pool() {
        let workers = Workers::new(WorkerMode::Single).unwrap();
        assert_eq!(workers.mode(), WorkerMode::Single);
        assert_eq!(workers.diff.worker_count(), 1);
        assert_eq!(workers.image.worker_count(), 1);
    }

    #[tokio::test]
    async fn test_diff_pool_scores_tasks() {
        let workers = Workers::new(WorkerMode::Multi).unwrap();
        assert_eq!(workers.diff.worker_count(), num_cpus::get().max(1));

        let hit = workers.diff.submit(DiffTask {
            a_idx: 0,
            b_idx: 1,
            a: "same words".into(),
            b: "same words".into(),
            threshold: 0.7,
        });
        let miss = workers.diff.submit(DiffTask {
            a_idx: 0,
            b_idx: 2,
            a: "same words".into(),
            b: "other text".into(),
            threshold: 0.7,
        });

        let hit = hit.await.unwrap().unwrap();
        assert_eq!((hit.a_idx, hit.b_idx), (0, 1));
        assert_eq!(hit.outcome.similarity, 1.0);
        assert!(miss.await.unwrap().is_none());
    }
}
