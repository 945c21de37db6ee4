use crate::core::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// One comparable piece of text, usually a sentence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextUnit {
    pub page_number: u32,
    pub text: String,
}

/// An image extracted from a document and stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageUnit {
    pub page_number: u32,
    /// Primary image file inside the cache entry.
    pub image: PathBuf,
    pub width: u32,
    pub height: u32,
}

/// Parse result persisted as `parse.json` in a cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedDocument {
    pub file_name: String,
    /// Copy of the source bytes inside the cache entry.
    pub file_path: PathBuf,
    pub file_hash: ContentHash,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub texts: Vec<TextUnit>,
    #[serde(default)]
    pub images: Vec<ImageUnit>,
}

/// A submitted input, identified by its content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocRef {
    pub file_name: String,
    pub file_path: PathBuf,
    pub file_hash: ContentHash,
}

impl DocRef {
    pub fn new(file_path: &Path, file_hash: ContentHash) -> Self {
        Self {
            file_name: display_name(file_path),
            file_path: file_path.to_path_buf(),
            file_hash,
        }
    }
}

/// Unordered pair of distinct inputs to compare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonPair {
    pub id: Uuid,
    pub a: DocRef,
    pub b: DocRef,
}

/// Every pair `(i, j)` with `i < j`, each with a fresh id.
pub fn build_pairs(docs: &[DocRef]) -> Vec<ComparisonPair> {
    let mut pairs = Vec::with_capacity(docs.len() * docs.len().saturating_sub(1) / 2);
    for (i, a) in docs.iter().enumerate() {
        for b in &docs[i + 1..] {
            pairs.push(ComparisonPair {
                id: Uuid::new_v4(),
                a: a.clone(),
                b: b.clone(),
            });
        }
    }
    pairs
}

pub fn display_name(path: &Path) -> String {
    path.file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string()
}
