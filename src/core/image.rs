use crate::core::batch::{BatchProcessor, DoubleLoopOptions};
use crate::core::document::ImageUnit;
use crate::core::perceptual::PerceptualHash;
use crate::core::pool::WorkerPool;
use crate::core::progress::{ComparePhase, PairProgress};
use crate::core::report::ImageMatch;
use crate::core::variants::VariantService;
use crate::core::workers::Workers;
use crate::settings::ImageSettings;
use anyhow::Context;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

pub enum ImageTask {
    Hash {
        idx: usize,
        path: PathBuf,
        size: u32,
    },
    Compare {
        a_idx: usize,
        b_idx: usize,
        a: Arc<PerceptualHash>,
        b: Arc<PerceptualHash>,
        similarity: f64,
    },
}

pub enum ImageOutcome {
    Hashed {
        idx: usize,
        hash: PerceptualHash,
    },
    Matched {
        a_idx: usize,
        b_idx: usize,
        similarity: f64,
    },
}

pub type ImagePool = WorkerPool<ImageTask, Option<ImageOutcome>>;

pub fn image_worker()
-> impl FnMut(ImageTask) -> anyhow::Result<Option<ImageOutcome>> + Send + 'static {
    |task: ImageTask| -> anyhow::Result<Option<ImageOutcome>> {
        match task {
            ImageTask::Hash { idx, path, size } => {
                let hash = PerceptualHash::from_path(&path, size)
                    .with_context(|| format!("Failed to hash image {}", path.display()))?;
                Ok(Some(ImageOutcome::Hashed { idx, hash }))
            }
            ImageTask::Compare {
                a_idx,
                b_idx,
                a,
                b,
                similarity,
            } => {
                let agreement = a.agreement(&b);
                Ok((agreement > similarity).then_some(ImageOutcome::Matched {
                    a_idx,
                    b_idx,
                    similarity: agreement,
                }))
            }
        }
    }
}

/// Aspect pre-filter: the ratio of the two height/width ratios must lie in
/// `[similarity, 2 - similarity]`.
pub fn within_aspect_band(a: &ImageUnit, b: &ImageUnit, similarity: f64) -> bool {
    if a.width == 0 || b.width == 0 || b.height == 0 {
        return false;
    }
    let aspect_a = a.height as f64 / a.width as f64;
    let aspect_b = b.height as f64 / b.width as f64;
    let ratio = aspect_a / aspect_b;
    ratio >= similarity && ratio <= 2.0 - similarity
}

struct Hashed<'a> {
    unit: &'a ImageUnit,
    hash: Arc<PerceptualHash>,
}

pub struct ImageComparator {
    settings: ImageSettings,
    chunk_size: usize,
    pool: Arc<ImagePool>,
    batch: Arc<BatchProcessor>,
}

impl ImageComparator {
    pub fn new(workers: &Workers, settings: ImageSettings, chunk_size: usize) -> Self {
        Self {
            settings,
            chunk_size,
            pool: Arc::clone(&workers.image),
            batch: Arc::clone(&workers.batch),
        }
    }

    pub fn settings(&self) -> &ImageSettings {
        &self.settings
    }

    fn eligible(&self, unit: &ImageUnit) -> bool {
        unit.width >= self.settings.min_size && unit.height >= self.settings.min_size
    }

    pub async fn compare_images(
        &self,
        images_a: &[ImageUnit],
        images_b: &[ImageUnit],
        progress: &PairProgress,
    ) -> Vec<ImageMatch> {
        let similarity = self.settings.similarity;
        let eligible_a: Vec<&ImageUnit> = images_a.iter().filter(|u| self.eligible(u)).collect();
        let eligible_b: Vec<&ImageUnit> = images_b.iter().filter(|u| self.eligible(u)).collect();

        let band = |a: &ImageUnit, b: &ImageUnit| within_aspect_band(a, b, similarity);
        let has_partner_a = |a: &&ImageUnit| eligible_b.iter().any(|b| band(*a, *b));
        let has_partner_b = |b: &&ImageUnit| eligible_a.iter().any(|a| band(*a, *b));

        // Only images that can pass the pre-filter with some partner are hashed.
        let wanted_a: Vec<&ImageUnit> = eligible_a.iter().copied().filter(has_partner_a).collect();
        let wanted_b: Vec<&ImageUnit> = eligible_b.iter().copied().filter(has_partner_b).collect();
        if wanted_a.is_empty() || wanted_b.is_empty() {
            progress.send(ComparePhase::Image, 0, 0);
            return Vec::new();
        }

        let mut hashes = self.hash_all(wanted_a.iter().chain(wanted_b.iter()).copied()).await;
        let split = wanted_a.len();
        let hashed_a: Vec<(usize, Hashed)> = wanted_a
            .iter()
            .enumerate()
            .filter_map(|(idx, unit)| {
                hashes.remove(&idx).map(|hash| (idx, Hashed { unit: *unit, hash }))
            })
            .collect();
        let hashed_b: Vec<(usize, Hashed)> = wanted_b
            .iter()
            .enumerate()
            .filter_map(|(idx, unit)| {
                hashes
                    .remove(&(idx + split))
                    .map(|hash| (idx, Hashed { unit: *unit, hash }))
            })
            .collect();

        let filter = |(_, a): &(usize, Hashed), (_, b): &(usize, Hashed)| band(a.unit, b.unit);
        let total = BatchProcessor::expected_total(&hashed_a, &hashed_b, &filter, None);
        let mut tracker = progress.tracker(ComparePhase::Image, total);
        let mut on_progress = || tracker.tick();

        let outcomes = self
            .batch
            .process_double_loop(
                &hashed_a,
                &hashed_b,
                filter,
                |(a_idx, a), (b_idx, b)| {
                    self.pool.submit(ImageTask::Compare {
                        a_idx: *a_idx,
                        b_idx: *b_idx,
                        a: Arc::clone(&a.hash),
                        b: Arc::clone(&b.hash),
                        similarity,
                    })
                },
                DoubleLoopOptions {
                    chunk_size: self.chunk_size,
                    on_progress: Some(&mut on_progress),
                },
            )
            .await;

        let mut matches: Vec<(usize, usize, f64)> = outcomes
            .into_iter()
            .filter_map(|outcome| match outcome {
                ImageOutcome::Matched {
                    a_idx,
                    b_idx,
                    similarity,
                } => Some((a_idx, b_idx, similarity)),
                ImageOutcome::Hashed { .. } => None,
            })
            .collect();
        matches.sort_by_key(|(a_idx, b_idx, _)| (*a_idx, *b_idx));

        matches
            .into_iter()
            .map(|(a_idx, b_idx, similarity)| {
                let a = wanted_a[a_idx];
                let b = wanted_b[b_idx];
                ImageMatch {
                    images: [a.image.clone(), b.image.clone()],
                    pages: [a.page_number, b.page_number],
                    similarity,
                }
            })
            .collect()
    }

    /// Hash every unit on the pool. Keys are positions in `units`; images
    /// that fail to hash are logged and left out.
    async fn hash_all<'a>(
        &self,
        units: impl Iterator<Item = &'a ImageUnit>,
    ) -> HashMap<usize, Arc<PerceptualHash>> {
        let size = self.settings.resize_width;
        let handles = units
            .enumerate()
            .map(|(idx, unit)| {
                self.pool.submit(ImageTask::Hash {
                    idx,
                    path: VariantService::best_source(&unit.image, size),
                    size,
                })
            })
            .collect();

        let mut hashes = HashMap::new();
        for result in self.batch.process(handles).await {
            match result {
                Ok(Some(ImageOutcome::Hashed { idx, hash })) => {
                    hashes.insert(idx, Arc::new(hash));
                }
                Ok(_) => {}
                Err(e) => log::warn!("Skipping image: {}", e),
            }
        }
        hashes
    }
}
