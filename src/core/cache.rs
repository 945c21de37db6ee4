//! Content-addressed on-disk cache.
//!
//! ```text
//! <root>/files/<hash>/main.<ext>
//! <root>/files/<hash>/parse.json
//! <root>/files/<hash>/images/<name>.png (+ .100/.200/.300.png)
//! <root>/result/<group>/<pair>.json
//! ```
//!
//! Every write goes to a temporary sibling and is renamed into place, and is
//! skipped when the target already exists. Identical content always hashes
//! to the same key, so concurrent writers of one key are harmless.

use crate::core::document::{ImageUnit, ParsedDocument, display_name};
use crate::core::hash::{ContentHash, HashAlgorithm, HashError, HashService};
use crate::core::parser::{DocumentParser, ParseError};
use crate::core::report::{GroupedResults, PairResult};
use crate::core::variants::VariantService;
use image::{DynamicImage, GenericImageView};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use uuid::Uuid;
use walkdir::WalkDir;

pub const FILES_DIR: &str = "files";
pub const RESULT_DIR: &str = "result";
pub const PARSE_FILE: &str = "parse.json";
pub const IMAGES_DIR: &str = "images";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Hash computation error: {0}")]
    Hash(#[from] HashError),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
}

pub struct ContentCache {
    root: PathBuf,
    hash_service: HashService,
    variants: VariantService,
    writes: AtomicUsize,
}

impl ContentCache {
    /// Open (creating if needed) a cache rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, algorithm: HashAlgorithm) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(root.join(FILES_DIR))?;
        fs::create_dir_all(root.join(RESULT_DIR))?;

        Ok(Self {
            root,
            hash_service: HashService::new(algorithm),
            variants: VariantService::new(),
            writes: AtomicUsize::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn hash_service(&self) -> &HashService {
        &self.hash_service
    }

    /// Files written by this instance since it was opened.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn hash(&self, path: &Path) -> Result<ContentHash, CacheError> {
        Ok(self.hash_service.compute_content_hash(path)?)
    }

    pub fn entry_dir(&self, hash: &ContentHash) -> PathBuf {
        self.root.join(FILES_DIR).join(hash.as_str())
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.entry_dir(hash).join(PARSE_FILE).is_file()
    }

    /// Copy the source bytes into the entry as `main.<ext>`.
    pub fn store_source(&self, hash: &ContentHash, source: &Path) -> Result<PathBuf, CacheError> {
        let extension = source
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_else(|| "bin".to_string());
        let target = self.entry_dir(hash).join(format!("main.{}", extension));
        self.persist(&target, |tmp| fs::copy(source, tmp).map(|_| ()))?;
        Ok(target)
    }

    /// Returns `false` when an entry for `hash` already existed.
    pub fn store_parsed_document(
        &self,
        hash: &ContentHash,
        document: &ParsedDocument,
    ) -> Result<bool, CacheError> {
        let target = self.entry_dir(hash).join(PARSE_FILE);
        if target.exists() {
            return Ok(false);
        }
        let bytes = serde_json::to_vec_pretty(document)?;
        self.persist(&target, |tmp| fs::write(tmp, &bytes))
    }

    pub fn read_parsed_document(
        &self,
        hash: &ContentHash,
    ) -> Result<Option<ParsedDocument>, CacheError> {
        let path = self.entry_dir(hash).join(PARSE_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let content = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&content)?))
    }

    /// Write `img` as `images/<name>.png` plus its downsampled variants.
    /// Files that already exist are left alone.
    pub fn store_image(
        &self,
        hash: &ContentHash,
        name: &str,
        img: &DynamicImage,
    ) -> Result<PathBuf, CacheError> {
        let images_dir = self.entry_dir(hash).join(IMAGES_DIR);
        let primary = images_dir.join(format!("{}.png", sanitize_name(name)));

        if !primary.exists() {
            let bytes = VariantService::encode_png(img)?;
            self.persist(&primary, |tmp| fs::write(tmp, &bytes))?;
        }

        for width in self.variants.applicable_widths(img) {
            let target = VariantService::variant_path(&primary, width);
            if target.exists() {
                continue;
            }
            let resized = self.variants.resize_to_width(img, width);
            let bytes = VariantService::encode_png(&resized)?;
            self.persist(&target, |tmp| fs::write(tmp, &bytes))?;
        }

        Ok(primary)
    }

    /// Hash `source` and make sure its parse is cached.
    pub fn ingest(
        &self,
        source: &Path,
        parser: &dyn DocumentParser,
    ) -> Result<ParsedDocument, CacheError> {
        let hash = self.hash(source)?;
        self.ingest_hashed(source, &hash, parser)
    }

    /// Like [`ingest`](Self::ingest) with the hash already known. A cached
    /// parse is returned as is and the parser is not invoked.
    pub fn ingest_hashed(
        &self,
        source: &Path,
        hash: &ContentHash,
        parser: &dyn DocumentParser,
    ) -> Result<ParsedDocument, CacheError> {
        let file_path = self.store_source(hash, source)?;

        if let Some(document) = self.read_parsed_document(hash)? {
            log::debug!("Cache hit for {} ({})", source.display(), hash);
            return Ok(document);
        }

        log::info!("Parsing {} ({})", source.display(), hash);
        let raw = parser.parse(source)?;

        let mut images = Vec::with_capacity(raw.images.len());
        for raw_image in &raw.images {
            let (width, height) = raw_image.image.dimensions();
            let image = self.store_image(hash, &raw_image.name, &raw_image.image)?;
            images.push(ImageUnit {
                page_number: raw_image.page_number,
                image,
                width,
                height,
            });
        }

        let document = ParsedDocument {
            file_name: display_name(source),
            file_path,
            file_hash: hash.clone(),
            metadata: raw.metadata,
            texts: raw.texts,
            images,
        };
        self.store_parsed_document(hash, &document)?;
        Ok(document)
    }

    /// Persist one pair result as `result/<group>/<pair>.json`.
    pub fn append_pair_result(
        &self,
        group_id: &str,
        pair_id: Uuid,
        result: &PairResult,
    ) -> Result<PathBuf, CacheError> {
        let target = self
            .root
            .join(RESULT_DIR)
            .join(group_id)
            .join(format!("{}.json", pair_id));
        let bytes = serde_json::to_vec_pretty(result)?;
        self.persist(&target, |tmp| fs::write(tmp, &bytes))?;
        Ok(target)
    }

    /// Results of one group in file-name order. Unknown groups are empty.
    pub fn read_results(&self, group_id: &str) -> Result<Vec<PairResult>, CacheError> {
        let dir = self.root.join(RESULT_DIR).join(group_id);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if is_result_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        Ok(paths.iter().filter_map(|path| read_result(path)).collect())
    }

    /// Every persisted result, grouped by group id.
    pub fn read_all_results(&self) -> Result<GroupedResults, CacheError> {
        let mut paths = Vec::new();
        for entry in WalkDir::new(self.root.join(RESULT_DIR))
            .min_depth(1)
            .max_depth(2)
        {
            let entry = entry.map_err(io::Error::from)?;
            if entry.file_type().is_file() && is_result_file(entry.path()) {
                paths.push(entry.into_path());
            }
        }
        paths.sort();

        let mut grouped = GroupedResults::default();
        for path in &paths {
            if let Some(result) = read_result(path) {
                grouped.push(result);
            }
        }
        Ok(grouped)
    }

    /// Write through a temporary sibling and rename it into place.
    /// Returns `false` when `target` was already present.
    fn persist<F>(&self, target: &Path, write: F) -> Result<bool, CacheError>
    where
        F: FnOnce(&Path) -> io::Result<()>,
    {
        if target.exists() {
            return Ok(false);
        }
        let dir = target.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)?;

        let tmp = dir.join(format!(
            ".{}.{}.tmp",
            display_name(target),
            Uuid::new_v4().simple()
        ));
        if let Err(e) = write(&tmp) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        match fs::rename(&tmp, target) {
            Ok(()) => {
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                // Another writer may have won the race with identical bytes.
                if target.exists() {
                    Ok(false)
                } else {
                    Err(e.into())
                }
            }
        }
    }
}

fn is_result_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .is_some_and(|name| name.to_string_lossy().starts_with('.'));
    !hidden && path.extension().is_some_and(|ext| ext == "json")
}

fn read_result(path: &Path) -> Option<PairResult> {
    let parsed = fs::read(path)
        .map_err(CacheError::from)
        .and_then(|bytes| serde_json::from_slice(&bytes).map_err(CacheError::from));
    match parsed {
        Ok(result) => Some(result),
        Err(e) => {
            log::warn!("Skipping unreadable result {}: {}", path.display(), e);
            None
        }
    }
}

fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "image".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::document::TextUnit;
    use crate::core::parser::{PlainTextParser, RawDocument, RawImage};
    use crate::core::report::ResultSettings;
    use crate::settings::{ImageSettings, TextSettings};
    use image::{ImageBuffer, Rgb};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    /// Counts invocations and delegates to the plain-text parser.
    struct CountingParser {
        calls: AtomicUsize,
        with_image: bool,
    }

    impl CountingParser {
        fn new(with_image: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                with_image,
            }
        }
    }

    impl DocumentParser for CountingParser {
        fn parse(&self, source: &Path) -> Result<RawDocument, ParseError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut raw = PlainTextParser.parse(source)?;
            if self.with_image {
                let img = ImageBuffer::from_fn(250, 120, |x, y| {
                    let intensity = ((x + y) % 256) as u8;
                    Rgb([intensity, intensity, intensity])
                });
                raw.images.push(RawImage {
                    page_number: 1,
                    name: "p1 logo".to_string(),
                    image: DynamicImage::ImageRgb8(img),
                });
            }
            Ok(raw)
        }
    }

    fn sample_result(group_id: &str, uuid: Uuid) -> PairResult {
        PairResult {
            group_id: Some(group_id.to_string()),
            uuid,
            names: ["a.txt".to_string(), "b.txt".to_string()],
            files: [PathBuf::from("a.txt"), PathBuf::from("b.txt")],
            text_similarities: Vec::new(),
            image_matches: Vec::new(),
            metadata_matches: Vec::new(),
            start_time: 0,
            end_time: 5,
            duration: 5,
            settings: ResultSettings {
                text: TextSettings::default(),
                image: ImageSettings::default(),
            },
        }
    }

    #[test]
    fn test_ingest_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ContentCache::open(temp_dir.path().join("cache"), HashAlgorithm::Sha256).unwrap();
        let parser = CountingParser::new(false);

        let first = temp_dir.path().join("first.txt");
        let second = temp_dir.path().join("second.txt");
        fs::write(&first, "Identical bid content here.").unwrap();
        fs::write(&second, "Identical bid content here.").unwrap();

        let doc1 = cache.ingest(&first, &parser).unwrap();
        let writes_after_first = cache.write_count();
        assert!(writes_after_first >= 2);

        let doc2 = cache.ingest(&second, &parser).unwrap();
        assert_eq!(parser.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.write_count(), writes_after_first);
        assert_eq!(doc1, doc2);

        let entries: Vec<_> = fs::read_dir(temp_dir.path().join("cache").join(FILES_DIR))
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
        assert!(cache.contains(&doc1.file_hash));
        assert!(doc1.file_path.ends_with("main.txt"));
    }

    #[test]
    fn test_store_parsed_document_is_noop_when_present() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ContentCache::open(temp_dir.path(), HashAlgorithm::Blake3).unwrap();
        let hash = ContentHash("abc123".to_string());
        let document = ParsedDocument {
            file_name: "x.txt".to_string(),
            file_path: PathBuf::from("x.txt"),
            file_hash: hash.clone(),
            metadata: BTreeMap::new(),
            texts: vec![TextUnit {
                page_number: 1,
                text: "first".to_string(),
            }],
            images: Vec::new(),
        };

        assert!(cache.read_parsed_document(&hash).unwrap().is_none());
        assert!(cache.store_parsed_document(&hash, &document).unwrap());

        let mut changed = document.clone();
        changed.texts[0].text = "second".to_string();
        assert!(!cache.store_parsed_document(&hash, &changed).unwrap());
        assert_eq!(cache.read_parsed_document(&hash).unwrap().unwrap(), document);
        assert_eq!(cache.write_count(), 1);
    }

    #[test]
    fn test_ingest_stores_images_and_variants() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ContentCache::open(temp_dir.path().join("cache"), HashAlgorithm::Sha256).unwrap();
        let source = temp_dir.path().join("bid.txt");
        fs::write(&source, "Some text.").unwrap();

        let document = cache.ingest(&source, &CountingParser::new(true)).unwrap();
        assert_eq!(document.images.len(), 1);

        let unit = &document.images[0];
        assert_eq!((unit.width, unit.height), (250, 120));
        assert!(unit.image.ends_with("images/p1_logo.png"));
        assert!(unit.image.is_file());
        assert!(VariantService::variant_path(&unit.image, 100).is_file());
        assert!(VariantService::variant_path(&unit.image, 200).is_file());
        assert!(!VariantService::variant_path(&unit.image, 300).exists());
    }

    #[test]
    fn test_results_survive_restart() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("cache");
        let group_id = "group-1";

        let mut ids: Vec<Uuid> = (0..6).map(|_| Uuid::new_v4()).collect();
        {
            let cache = ContentCache::open(&root, HashAlgorithm::Sha256).unwrap();
            for id in &ids[..3] {
                cache
                    .append_pair_result(group_id, *id, &sample_result(group_id, *id))
                    .unwrap();
            }
        }

        // Leftover from a crashed write must be ignored.
        fs::write(root.join(RESULT_DIR).join(group_id).join(".partial.json.tmp"), b"{").unwrap();

        let reopened = ContentCache::open(&root, HashAlgorithm::Sha256).unwrap();
        let results = reopened.read_results(group_id).unwrap();

        let mut persisted = ids.drain(..3).collect::<Vec<_>>();
        persisted.sort_by_key(|id| id.to_string());
        let read_ids: Vec<Uuid> = results.iter().map(|r| r.uuid).collect();
        assert_eq!(read_ids, persisted);
    }

    #[test]
    fn test_unknown_group_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ContentCache::open(temp_dir.path(), HashAlgorithm::Sha256).unwrap();
        assert!(cache.read_results("missing").unwrap().is_empty());
    }

    #[test]
    fn test_read_all_results_grouped() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ContentCache::open(temp_dir.path(), HashAlgorithm::Sha256).unwrap();

        for group in ["g1", "g1", "g2"] {
            let id = Uuid::new_v4();
            cache.append_pair_result(group, id, &sample_result(group, id)).unwrap();
        }
        let id = Uuid::new_v4();
        let mut legacy = sample_result("g3", id);
        legacy.group_id = None;
        cache.append_pair_result("g3", id, &legacy).unwrap();

        let grouped = cache.read_all_results().unwrap();
        assert_eq!(grouped.groups["g1"].len(), 2);
        assert_eq!(grouped.groups["g2"].len(), 1);
        assert_eq!(grouped.ungrouped.len(), 1);
        assert_eq!(grouped.len(), 4);
    }

    #[test]
    fn test_missing_source_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ContentCache::open(temp_dir.path(), HashAlgorithm::Sha256).unwrap();
        let result = cache.ingest(&temp_dir.path().join("absent.txt"), &PlainTextParser);
        assert!(matches!(result, Err(CacheError::Hash(HashError::MissingFile { .. }))));
    }
}
