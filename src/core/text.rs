//! Sentence-level text comparison.
//!
//! Units shorter than `min_length` are dropped, units resembling any unit of
//! the exclusion document are removed, and the survivors of both sides are
//! cross-compared with the word-level diff. Pairs whose lengths are too far
//! apart to ever reach the threshold are skipped before diffing.

use crate::core::batch::{BatchProcessor, DoubleLoopOptions};
use crate::core::diff::{self, DiffOutcome};
use crate::core::document::TextUnit;
use crate::core::pool::WorkerPool;
use crate::core::progress::{ComparePhase, PairProgress};
use crate::core::report::{MatchSide, SimilarityMatch};
use crate::core::workers::Workers;
use crate::settings::TextSettings;
use std::collections::HashSet;
use std::sync::Arc;

/// One diff job. Texts are shared so queued jobs stay cheap.
pub struct DiffTask {
    pub a_idx: usize,
    pub b_idx: usize,
    pub a: Arc<str>,
    pub b: Arc<str>,
    pub threshold: f64,
}

pub struct DiffMatch {
    pub a_idx: usize,
    pub b_idx: usize,
    pub outcome: DiffOutcome,
}

pub type DiffPool = WorkerPool<DiffTask, Option<DiffMatch>>;

/// Worker body for the diff pool: a match when similarity reaches the
/// task's threshold, `None` otherwise.
pub fn diff_worker() -> impl FnMut(DiffTask) -> anyhow::Result<Option<DiffMatch>> + Send + 'static {
    |task: DiffTask| -> anyhow::Result<Option<DiffMatch>> {
        let outcome = diff::compare(&task.a, &task.b);
        Ok((outcome.similarity >= task.threshold).then(|| DiffMatch {
            a_idx: task.a_idx,
            b_idx: task.b_idx,
            outcome,
        }))
    }
}

/// Length pre-filter: `shorter / longer` must reach `threshold`.
///
/// The diff similarity of two units is at most `shorter / longer`, so no
/// pair that could meet the threshold is skipped, whichever side comes first.
pub fn within_length_band(len_a: usize, len_b: usize, threshold: f64) -> bool {
    let (shorter, longer) = (len_a.min(len_b), len_a.max(len_b));
    if shorter == 0 {
        return false;
    }
    shorter as f64 / longer as f64 >= threshold
}

struct Candidate<'a> {
    unit: &'a TextUnit,
    text: Arc<str>,
    len: usize,
}

impl<'a> Candidate<'a> {
    fn new(unit: &'a TextUnit) -> Self {
        let text = unit.text.trim();
        Self {
            unit,
            len: text.chars().count(),
            text: Arc::from(text),
        }
    }
}

struct ExclusionUnit {
    text: Arc<str>,
    len: usize,
}

pub struct TextComparator {
    settings: TextSettings,
    chunk_size: usize,
    pool: Arc<DiffPool>,
    batch: Arc<BatchProcessor>,
    exclusion: Vec<ExclusionUnit>,
}

impl TextComparator {
    pub fn new(workers: &Workers, settings: TextSettings, chunk_size: usize) -> Self {
        Self {
            settings,
            chunk_size,
            pool: Arc::clone(&workers.diff),
            batch: Arc::clone(&workers.batch),
            exclusion: Vec::new(),
        }
    }

    /// Units of the exclusion document. Empty units are ignored.
    pub fn with_exclusion(mut self, units: &[TextUnit]) -> Self {
        self.exclusion = units
            .iter()
            .filter_map(|unit| {
                let text = unit.text.trim();
                let len = text.chars().count();
                (len > 0).then(|| ExclusionUnit {
                    text: Arc::from(text),
                    len,
                })
            })
            .collect();
        self
    }

    pub fn settings(&self) -> &TextSettings {
        &self.settings
    }

    pub async fn find_similarities(
        &self,
        units_a: &[TextUnit],
        units_b: &[TextUnit],
        progress: &PairProgress,
    ) -> Vec<SimilarityMatch> {
        let candidates_a = self.prepare(units_a);
        let candidates_b = self.prepare(units_b);

        let (candidates_a, candidates_b) = if self.exclusion.is_empty() {
            (candidates_a, candidates_b)
        } else {
            self.remove_excluded(candidates_a, candidates_b, progress).await
        };

        let threshold = self.settings.threshold;
        let filter = |a: &Candidate, b: &Candidate| within_length_band(a.len, b.len, threshold);
        let total = BatchProcessor::expected_total(&candidates_a, &candidates_b, &filter, None);
        let mut tracker = progress.tracker(ComparePhase::Text, total);
        let mut on_progress = || tracker.tick();

        let indexed_a: Vec<(usize, &Candidate)> = candidates_a.iter().enumerate().collect();
        let indexed_b: Vec<(usize, &Candidate)> = candidates_b.iter().enumerate().collect();

        let mut matches = self
            .batch
            .process_double_loop(
                &indexed_a,
                &indexed_b,
                |(_, a), (_, b)| filter(*a, *b),
                |(a_idx, a), (b_idx, b)| {
                    self.pool.submit(DiffTask {
                        a_idx: *a_idx,
                        b_idx: *b_idx,
                        a: Arc::clone(&a.text),
                        b: Arc::clone(&b.text),
                        threshold,
                    })
                },
                DoubleLoopOptions {
                    chunk_size: self.chunk_size,
                    on_progress: Some(&mut on_progress),
                },
            )
            .await;
        matches.sort_by_key(|m| (m.a_idx, m.b_idx));

        matches
            .into_iter()
            .map(|m| {
                let a = candidates_a[m.a_idx].unit;
                let b = candidates_b[m.b_idx].unit;
                SimilarityMatch {
                    a: MatchSide {
                        text: a.text.clone(),
                        annotated_text: m.outcome.annotated_a,
                        page_number: a.page_number,
                    },
                    b: MatchSide {
                        text: b.text.clone(),
                        annotated_text: m.outcome.annotated_b,
                        page_number: b.page_number,
                    },
                    similarity: m.outcome.similarity,
                }
            })
            .collect()
    }

    fn prepare<'a>(&self, units: &'a [TextUnit]) -> Vec<Candidate<'a>> {
        let min_length = self.settings.min_length.max(1);
        units
            .iter()
            .map(Candidate::new)
            .filter(|candidate| candidate.len >= min_length)
            .collect()
    }

    /// Drop every unit of either side that resembles some exclusion unit.
    async fn remove_excluded<'a>(
        &self,
        candidates_a: Vec<Candidate<'a>>,
        candidates_b: Vec<Candidate<'a>>,
        progress: &PairProgress,
    ) -> (Vec<Candidate<'a>>, Vec<Candidate<'a>>) {
        let threshold = self.settings.threshold;
        let split = candidates_a.len();
        let all: Vec<(usize, &Candidate)> = candidates_a
            .iter()
            .chain(candidates_b.iter())
            .enumerate()
            .collect();
        let exclusion: Vec<(usize, &ExclusionUnit)> = self.exclusion.iter().enumerate().collect();

        let filter = |(_, u): &(usize, &Candidate), (_, e): &(usize, &ExclusionUnit)| {
            within_length_band(u.len, e.len, threshold)
        };
        let total = BatchProcessor::expected_total(&all, &exclusion, &filter, None);
        let mut tracker = progress.tracker(ComparePhase::Exclusion, total);
        let mut on_progress = || tracker.tick();

        let hits = self
            .batch
            .process_double_loop(
                &all,
                &exclusion,
                filter,
                |(u_idx, u), (e_idx, e)| {
                    self.pool.submit(DiffTask {
                        a_idx: *u_idx,
                        b_idx: *e_idx,
                        a: Arc::clone(&u.text),
                        b: Arc::clone(&e.text),
                        threshold,
                    })
                },
                DoubleLoopOptions {
                    chunk_size: self.chunk_size,
                    on_progress: Some(&mut on_progress),
                },
            )
            .await;

        let excluded: HashSet<usize> = hits.into_iter().map(|hit| hit.a_idx).collect();
        if !excluded.is_empty() {
            log::debug!("Exclusion removed {} text units", excluded.len());
        }

        let keep_a = candidates_a
            .into_iter()
            .enumerate()
            .filter(|(idx, _)| !excluded.contains(idx))
            .map(|(_, c)| c)
            .collect();
        let keep_b = candidates_b
            .into_iter()
            .enumerate()
            .filter(|(idx, _)| !excluded.contains(&(idx + split)))
            .map(|(_, c)| c)
            .collect();
        (keep_a, keep_b)
    }
}
