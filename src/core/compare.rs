//! Comparison orchestrator.
//!
//! A run moves through `Idle -> MatrixBuilt -> Comparing -> Persisted`.
//! The matrix holds only lightweight document references; full parses are
//! loaded from the cache one pair at a time and every pair result is
//! persisted as soon as it is assembled.

use crate::core::cache::{CacheError, ContentCache};
use crate::core::document::{ComparisonPair, DocRef, ParsedDocument, build_pairs};
use crate::core::hash::ContentHash;
use crate::core::image::ImageComparator;
use crate::core::metadata::compare_metadata;
use crate::core::parser::DocumentParser;
use crate::core::progress::{ComparePhase, PairProgress, ProgressSender};
use crate::core::report::{PairResult, ResultSettings};
use crate::core::text::TextComparator;
use crate::core::workers::Workers;
use crate::settings::Settings;
use chrono::Utc;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CompareError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("No input documents given")]
    EmptyInput,

    #[error("The comparison matrix has not been built")]
    MatrixNotBuilt,

    #[error("Document {hash} is not in the cache")]
    Hydration { hash: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Idle,
    MatrixBuilt,
    Comparing,
    Persisted,
}

/// Outcome of one run, read back from the cache.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub group_id: String,
    pub results: Vec<PairResult>,
    /// Pairs that failed and are absent from `results`.
    pub failed: Vec<Uuid>,
}

pub struct ComparisonService {
    cache: Arc<ContentCache>,
    parser: Arc<dyn DocumentParser>,
    workers: Arc<Workers>,
    settings: Settings,
    matrix: Vec<ComparisonPair>,
    state: RunState,
    progress_sender: Option<ProgressSender>,
}

impl ComparisonService {
    pub fn new(
        cache: Arc<ContentCache>,
        parser: Arc<dyn DocumentParser>,
        workers: Arc<Workers>,
        settings: Settings,
    ) -> Self {
        Self {
            cache,
            parser,
            workers,
            settings,
            matrix: Vec::new(),
            state: RunState::Idle,
            progress_sender: None,
        }
    }

    /// Send per-pair progress events to `sender`.
    pub fn with_progress_sender(mut self, sender: ProgressSender) -> Self {
        self.progress_sender = Some(sender);
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn matrix(&self) -> &[ComparisonPair] {
        &self.matrix
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    /// Make sure `path` is parsed and cached.
    pub fn ingest(&self, path: &Path) -> Result<ParsedDocument, CompareError> {
        Ok(self.cache.ingest(path, self.parser.as_ref())?)
    }

    /// Hash and parse every input, then pair them up.
    ///
    /// Byte-identical inputs are hashed into one cache entry and parsed once
    /// but still take part in the matrix individually. Any unreadable or
    /// unparsable input fails the whole call.
    pub fn build_matrix(&mut self, inputs: &[PathBuf]) -> Result<Vec<ComparisonPair>, CompareError> {
        if inputs.is_empty() {
            return Err(CompareError::EmptyInput);
        }

        let mut refs = Vec::with_capacity(inputs.len());
        let mut unique: HashMap<ContentHash, PathBuf> = HashMap::new();
        for (path, hash) in self.cache.hash_service().hash_files(inputs) {
            let hash = hash.map_err(CacheError::from)?;
            unique.entry(hash.clone()).or_insert_with(|| path.clone());
            refs.push(DocRef::new(&path, hash));
        }

        let cache = &self.cache;
        let parser = self.parser.as_ref();
        unique
            .par_iter()
            .map(|(hash, path)| cache.ingest_hashed(path, hash, parser).map(|_| ()))
            .collect::<Result<Vec<()>, CacheError>>()?;

        self.matrix = build_pairs(&refs);
        self.state = RunState::MatrixBuilt;
        log::info!(
            "Built comparison matrix: {} inputs ({} unique), {} pairs",
            refs.len(),
            unique.len(),
            self.matrix.len()
        );
        Ok(self.matrix.clone())
    }

    /// Compare the pairs of the last built matrix.
    pub async fn run_matrix(
        &mut self,
        exclusion: Option<&ParsedDocument>,
    ) -> Result<RunOutcome, CompareError> {
        if self.state == RunState::Idle {
            return Err(CompareError::MatrixNotBuilt);
        }
        let pairs = self.matrix.clone();
        self.run(&pairs, exclusion).await
    }

    /// Compare `pairs` in order, persisting each result under a fresh group.
    /// A failing pair is logged and left out; the run carries on.
    pub async fn run(
        &mut self,
        pairs: &[ComparisonPair],
        exclusion: Option<&ParsedDocument>,
    ) -> Result<RunOutcome, CompareError> {
        let group_id = Uuid::new_v4().to_string();
        self.state = RunState::Comparing;
        log::info!("Starting run {} with {} pairs", group_id, pairs.len());

        let chunk_size = self.settings.batch.chunk_size;
        let mut text = TextComparator::new(&self.workers, self.settings.text.clone(), chunk_size);
        if let Some(exclusion) = exclusion {
            text = text.with_exclusion(&exclusion.texts);
        }
        let image = ImageComparator::new(&self.workers, self.settings.image.clone(), chunk_size);

        let mut failed = Vec::new();
        for (idx, pair) in pairs.iter().enumerate() {
            let progress = PairProgress::new(pair.id, self.progress_sender.clone());

            let persisted = match self.compare_pair(&group_id, pair, &text, &image, &progress).await {
                Ok(result) => self
                    .cache
                    .append_pair_result(&group_id, pair.id, &result)
                    .map_err(CompareError::from),
                Err(e) => Err(e),
            };
            if let Err(e) = persisted {
                log::warn!(
                    "Pair {} ({} / {}) failed: {}",
                    pair.id,
                    pair.a.file_name,
                    pair.b.file_name,
                    e
                );
                failed.push(pair.id);
            }

            progress.send(ComparePhase::Pair, idx + 1, pairs.len());
        }

        let results = self.cache.read_results(&group_id)?;
        self.state = RunState::Persisted;
        log::info!(
            "Run {} finished: {} results, {} failed",
            group_id,
            results.len(),
            failed.len()
        );

        Ok(RunOutcome {
            group_id,
            results,
            failed,
        })
    }

    /// Build the matrix for `inputs` and run it, with an optional
    /// exclusion document.
    pub async fn process_files(
        &mut self,
        inputs: &[PathBuf],
        exclusion: Option<&Path>,
    ) -> Result<RunOutcome, CompareError> {
        let exclusion = exclusion.map(|path| self.ingest(path)).transpose()?;
        self.build_matrix(inputs)?;
        self.run_matrix(exclusion.as_ref()).await
    }

    async fn compare_pair(
        &self,
        group_id: &str,
        pair: &ComparisonPair,
        text: &TextComparator,
        image: &ImageComparator,
        progress: &PairProgress,
    ) -> Result<PairResult, CompareError> {
        let start = Utc::now();
        let doc_a = self.hydrate(&pair.a)?;
        let doc_b = self.hydrate(&pair.b)?;

        let text_similarities = text
            .find_similarities(&doc_a.texts, &doc_b.texts, progress)
            .await;
        let image_matches = image
            .compare_images(&doc_a.images, &doc_b.images, progress)
            .await;
        let metadata_matches = compare_metadata(&doc_a.metadata, &doc_b.metadata);

        let end = Utc::now();
        let duration = (end - start).num_milliseconds();
        log::info!(
            "Compared {} / {} in {}ms: {} text, {} image matches",
            pair.a.file_name,
            pair.b.file_name,
            duration,
            text_similarities.len(),
            image_matches.len()
        );

        Ok(PairResult {
            group_id: Some(group_id.to_string()),
            uuid: pair.id,
            names: [pair.a.file_name.clone(), pair.b.file_name.clone()],
            files: [doc_a.file_path, doc_b.file_path],
            text_similarities,
            image_matches,
            metadata_matches,
            start_time: start.timestamp_millis(),
            end_time: end.timestamp_millis(),
            duration,
            settings: ResultSettings {
                text: text.settings().clone(),
                image: image.settings().clone(),
            },
        })
    }

    fn hydrate(&self, doc: &DocRef) -> Result<ParsedDocument, CompareError> {
        self.cache
            .read_parsed_document(&doc.file_hash)?
            .ok_or_else(|| CompareError::Hydration {
                hash: doc.file_hash.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::{FILES_DIR, PARSE_FILE};
    use crate::core::hash::HashAlgorithm;
    use crate::core::parser::ParserRegistry;
    use crate::settings::{TextSettings, WorkerMode};
    use std::collections::HashSet;
    use std::fs;
    use tempfile::TempDir;

    fn service(temp_dir: &TempDir, min_length: usize) -> ComparisonService {
        let cache = ContentCache::open(temp_dir.path().join("cache"), HashAlgorithm::Sha256).unwrap();
        let settings = Settings {
            cache_dir: temp_dir.path().join("cache"),
            text: TextSettings {
                threshold: 0.7,
                min_length,
            },
            ..Settings::default()
        };
        ComparisonService::new(
            Arc::new(cache),
            Arc::new(ParserRegistry::with_builtin()),
            Arc::new(Workers::new(WorkerMode::Single).unwrap()),
            settings,
        )
    }

    fn write_inputs(temp_dir: &TempDir, contents: &[&str]) -> Vec<PathBuf> {
        contents
            .iter()
            .enumerate()
            .map(|(idx, content)| {
                let path = temp_dir.path().join(format!("bid{}.txt", idx));
                fs::write(&path, content).unwrap();
                path
            })
            .collect()
    }

    #[test]
    fn test_matrix_completeness() {
        let temp_dir = TempDir::new().unwrap();
        let mut service = service(&temp_dir, 5);
        let inputs = write_inputs(&temp_dir, &["one.", "two.", "three.", "four.", "four."]);

        let pairs = service.build_matrix(&inputs).unwrap();
        assert_eq!(pairs.len(), 10);
        assert_eq!(service.state(), RunState::MatrixBuilt);

        let combos: HashSet<(String, String)> = pairs
            .iter()
            .map(|p| (p.a.file_name.clone(), p.b.file_name.clone()))
            .collect();
        assert_eq!(combos.len(), 10);
        assert!(pairs.iter().all(|p| p.a.file_path != p.b.file_path));

        // Identical content shares one cache entry.
        let entries = fs::read_dir(temp_dir.path().join("cache").join(FILES_DIR))
            .unwrap()
            .count();
        assert_eq!(entries, 4);
    }

    #[test]
    fn test_empty_and_missing_inputs() {
        let temp_dir = TempDir::new().unwrap();
        let mut service = service(&temp_dir, 5);
        assert!(matches!(service.build_matrix(&[]), Err(CompareError::EmptyInput)));

        let missing = vec![temp_dir.path().join("missing.txt")];
        assert!(matches!(service.build_matrix(&missing), Err(CompareError::Cache(_))));
        assert_eq!(service.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_run_before_matrix_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut service = service(&temp_dir, 5);
        assert!(matches!(
            service.run_matrix(None).await,
            Err(CompareError::MatrixNotBuilt)
        ));
    }

    #[tokio::test]
    async fn test_end_to_end_two_documents() {
        let temp_dir = TempDir::new().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut service = service(&temp_dir, 5).with_progress_sender(tx);
        let inputs = write_inputs(&temp_dir, &["The quick brown fox", "The quick brown fox jumps"]);

        let outcome = service.process_files(&inputs, None).await.unwrap();
        assert_eq!(service.state(), RunState::Persisted);
        assert!(outcome.failed.is_empty());
        assert_eq!(outcome.results.len(), 1);

        let result = &outcome.results[0];
        assert_eq!(result.group_id.as_deref(), Some(outcome.group_id.as_str()));
        assert_eq!(result.names, ["bid0.txt".to_string(), "bid1.txt".to_string()]);
        assert_eq!(result.text_similarities.len(), 1);
        assert_eq!(
            result.text_similarities[0].b.annotated_text,
            "<b>The quick brown fox</b> jumps"
        );
        assert_eq!(result.settings.text.min_length, 5);
        assert_eq!(result.metadata_matches.len(), 4);

        let mut saw_pair_event = false;
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.pair_id, result.uuid);
            saw_pair_event |= event.phase == ComparePhase::Pair && event.label == "1/1";
        }
        assert!(saw_pair_event);
    }

    #[tokio::test]
    async fn test_exclusion_document_applies_to_run() {
        let temp_dir = TempDir::new().unwrap();
        let mut service = service(&temp_dir, 5);
        let inputs = write_inputs(
            &temp_dir,
            &[
                "The bidder accepts all terms.\nDelivery within 30 days.",
                "The bidder accepts all terms.\nDelivery within 90 days flat.",
            ],
        );
        let exclusion = temp_dir.path().join("tender.txt");
        fs::write(&exclusion, "The bidder accepts all terms.").unwrap();

        let outcome = service.process_files(&inputs, Some(&exclusion)).await.unwrap();
        let matches = &outcome.results[0].text_similarities;
        assert!(matches.iter().all(|m| m.a.text != "The bidder accepts all terms."));
    }

    #[tokio::test]
    async fn test_failing_pair_does_not_abort_run() {
        let temp_dir = TempDir::new().unwrap();
        let mut service = service(&temp_dir, 5);
        let inputs = write_inputs(
            &temp_dir,
            &["Shared sentence here.", "Shared sentence here.", "Another document."],
        );

        let pairs = service.build_matrix(&inputs).unwrap();
        assert_eq!(pairs.len(), 3);

        // Lose the third document's parse after the matrix was built.
        let hash = pairs[1].b.file_hash.clone();
        fs::remove_file(
            temp_dir
                .path()
                .join("cache")
                .join(FILES_DIR)
                .join(hash.as_str())
                .join(PARSE_FILE),
        )
        .unwrap();

        let outcome = service.run_matrix(None).await.unwrap();
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.failed.len(), 2);
        assert_eq!(outcome.results[0].uuid, pairs[0].id);
        assert_eq!(outcome.results[0].text_similarities.len(), 1);
    }
}
