//! Document parsers.
//!
//! PDF decoding lives outside this crate and plugs in through
//! [`DocumentParser`]. Two built-in parsers cover pre-parsed JSON documents
//! and plain text files.

use crate::core::document::TextUnit;
use image::DynamicImage;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Unsupported document type: {extension}")]
    Unsupported { extension: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid document JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),
}

/// Image as delivered by a parser, before it is stored in the cache.
pub struct RawImage {
    pub page_number: u32,
    /// File stem used inside the cache entry's `images/` directory.
    pub name: String,
    pub image: DynamicImage,
}

/// Parser output. The cache turns it into a `ParsedDocument`.
#[derive(Default)]
pub struct RawDocument {
    pub metadata: BTreeMap<String, String>,
    pub texts: Vec<TextUnit>,
    pub images: Vec<RawImage>,
}

pub trait DocumentParser: Send + Sync {
    fn parse(&self, source: &Path) -> Result<RawDocument, ParseError>;
}

const SENTENCE_TERMINATORS: &[char] = &[
    '.', '!', '?', ';', '。', '！', '？', '；', '‼', '‽', '⁇', '⁈', '⁉',
];

/// Fold full-width ASCII to half-width and collapse whitespace.
pub fn normalize_text(text: &str) -> String {
    let folded = text.chars().map(|c| match c as u32 {
        0xFF01..=0xFF5E => char::from_u32(c as u32 - 0xFEE0).unwrap_or(c),
        0x3000 => ' ',
        _ => c,
    });

    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for c in folded {
        if c.is_whitespace() {
            pending_space = !out.is_empty();
        } else {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            out.push(c);
        }
    }
    out
}

/// Split normalised text into sentences. A run of terminators stays with
/// the sentence it closes; fragments made only of terminators are dropped.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut closing = false;

    let mut flush = |current: &mut String| {
        let sentence = current.trim();
        if sentence.chars().any(|c| !SENTENCE_TERMINATORS.contains(&c)) {
            sentences.push(sentence.to_string());
        }
        current.clear();
    };

    for c in text.chars() {
        if c == '\n' || c == '\r' {
            flush(&mut current);
            closing = false;
            continue;
        }
        let terminator = SENTENCE_TERMINATORS.contains(&c);
        if closing && !terminator {
            flush(&mut current);
        }
        current.push(c);
        closing = terminator;
    }
    flush(&mut current);

    sentences
}

/// Sentence units of one page of raw text.
pub fn page_units(page_number: u32, raw: &str) -> Vec<TextUnit> {
    raw.lines()
        .flat_map(|line| split_sentences(&normalize_text(line)))
        .map(|text| TextUnit { page_number, text })
        .collect()
}

/// `.txt` documents. A form feed starts a new page.
pub struct PlainTextParser;

impl DocumentParser for PlainTextParser {
    fn parse(&self, source: &Path) -> Result<RawDocument, ParseError> {
        let content = fs::read_to_string(source)?;
        let texts = content
            .split('\u{000C}')
            .enumerate()
            .flat_map(|(idx, page)| page_units(idx as u32 + 1, page))
            .collect();

        Ok(RawDocument {
            texts,
            ..RawDocument::default()
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonText {
    page_number: u32,
    text: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonImage {
    page_number: u32,
    path: PathBuf,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
struct JsonDocument {
    #[serde(default)]
    metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    texts: Vec<JsonText>,
    #[serde(default)]
    images: Vec<JsonImage>,
}

/// Pre-parsed `.json` documents, as produced by an external PDF extractor.
///
/// Text units are taken as given. Image paths are resolved relative to the
/// JSON file and decoded eagerly.
pub struct JsonDocumentParser;

impl DocumentParser for JsonDocumentParser {
    fn parse(&self, source: &Path) -> Result<RawDocument, ParseError> {
        let content = fs::read_to_string(source)?;
        let document: JsonDocument = serde_json::from_str(&content)?;
        let base = source.parent().unwrap_or_else(|| Path::new("."));

        let metadata = document
            .metadata
            .into_iter()
            .filter_map(|(key, value)| match value {
                serde_json::Value::Null => None,
                serde_json::Value::String(s) => Some((key, s)),
                other => Some((key, other.to_string())),
            })
            .collect();

        let texts = document
            .texts
            .into_iter()
            .filter_map(|unit| {
                let text = normalize_text(&unit.text);
                (!text.is_empty()).then_some(TextUnit {
                    page_number: unit.page_number,
                    text,
                })
            })
            .collect();

        let mut images = Vec::with_capacity(document.images.len());
        for (idx, entry) in document.images.into_iter().enumerate() {
            let path = if entry.path.is_absolute() {
                entry.path
            } else {
                base.join(&entry.path)
            };
            let image = image::open(&path)?;
            images.push(RawImage {
                page_number: entry.page_number,
                name: entry
                    .name
                    .unwrap_or_else(|| format!("p{}_{}", entry.page_number, idx)),
                image,
            });
        }

        Ok(RawDocument {
            metadata,
            texts,
            images,
        })
    }
}

/// Chooses a parser by lower-cased file extension.
pub struct ParserRegistry {
    parsers: HashMap<String, Arc<dyn DocumentParser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self {
            parsers: HashMap::new(),
        }
    }

    /// Registry with the JSON and plain-text parsers.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("json", Arc::new(JsonDocumentParser));
        registry.register("txt", Arc::new(PlainTextParser));
        registry
    }

    pub fn register(&mut self, extension: &str, parser: Arc<dyn DocumentParser>) {
        self.parsers.insert(extension.to_ascii_lowercase(), parser);
    }

    pub fn supports(&self, path: &Path) -> bool {
        self.parsers.contains_key(&extension_of(path))
    }

    fn parser_for(&self, path: &Path) -> Result<&Arc<dyn DocumentParser>, ParseError> {
        let extension = extension_of(path);
        self.parsers
            .get(&extension)
            .ok_or(ParseError::Unsupported { extension })
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl DocumentParser for ParserRegistry {
    fn parse(&self, source: &Path) -> Result<RawDocument, ParseError> {
        self.parser_for(source)?.parse(source)
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}
