use crate::settings::{ImageSettings, TextSettings};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// One side of a text match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchSide {
    pub text: String,
    /// `text` with unchanged spans wrapped in `<b>` markers.
    pub annotated_text: String,
    pub page_number: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityMatch {
    pub a: MatchSide,
    pub b: MatchSide,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMatch {
    pub images: [PathBuf; 2],
    pub pages: [u32; 2],
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataMatch {
    pub label: String,
    pub a: Option<String>,
    pub b: Option<String>,
    pub same: bool,
}

/// Settings in effect when a pair was compared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSettings {
    pub text: TextSettings,
    pub image: ImageSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairResult {
    #[serde(default)]
    pub group_id: Option<String>,
    pub uuid: Uuid,
    pub names: [String; 2],
    pub files: [PathBuf; 2],
    pub text_similarities: Vec<SimilarityMatch>,
    pub image_matches: Vec<ImageMatch>,
    pub metadata_matches: Vec<MetadataMatch>,
    /// Milliseconds since the Unix epoch.
    pub start_time: i64,
    pub end_time: i64,
    /// Milliseconds.
    pub duration: i64,
    pub settings: ResultSettings,
}

/// Every persisted result, keyed by group id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GroupedResults {
    pub groups: BTreeMap<String, Vec<PairResult>>,
    pub ungrouped: Vec<PairResult>,
}

impl GroupedResults {
    pub fn push(&mut self, result: PairResult) {
        match result.group_id.clone() {
            Some(group_id) => self.groups.entry(group_id).or_default().push(result),
            None => self.ungrouped.push(result),
        }
    }

    pub fn len(&self) -> usize {
        self.groups.values().map(Vec::len).sum::<usize>() + self.ungrouped.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
