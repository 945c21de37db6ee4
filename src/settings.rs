//! Run configuration.
//!
//! Settings are plain structs with documented defaults. They can be loaded
//! from a TOML file and are applied before a run starts; the effective text
//! and image settings are recorded in every pair result.

use crate::core::hash::HashAlgorithm;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Text comparison settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TextSettings {
    /// Minimum diff similarity for a match, and the exclusion cut-off.
    /// Default 0.7.
    pub threshold: f64,
    /// Units shorter than this many characters are ignored. Default 10.
    #[serde(alias = "min_length")]
    pub min_length: usize,
}

impl Default for TextSettings {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            min_length: 10,
        }
    }
}

/// Image comparison settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ImageSettings {
    /// Bit agreement a pair must exceed. Default 0.9.
    pub similarity: f64,
    /// Images narrower or shorter than this are skipped. Default 100.
    #[serde(alias = "min_size")]
    pub min_size: u32,
    /// Side of the square grid the perceptual hash is computed on. Default 100.
    #[serde(alias = "resize_width")]
    pub resize_width: u32,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            similarity: 0.9,
            min_size: 100,
            resize_width: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Tasks submitted per batch in the filtered double loop. Default 1000.
    pub chunk_size: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self { chunk_size: 1000 }
    }
}

/// How many workers each pool gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// One worker per pool.
    Single,
    /// One worker per logical CPU.
    #[default]
    Multi,
}

impl WorkerMode {
    pub fn worker_count(self) -> usize {
        match self {
            Self::Single => 1,
            Self::Multi => num_cpus::get().max(1),
        }
    }
}

impl FromStr for WorkerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "multi" => Ok(Self::Multi),
            other => Err(format!("unknown worker mode '{}' (expected single or multi)", other)),
        }
    }
}

impl fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single => f.write_str("single"),
            Self::Multi => f.write_str("multi"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root of the content-addressed cache.
    pub cache_dir: PathBuf,
    pub hash_algorithm: HashAlgorithm,
    pub workers: WorkerMode,
    pub text: TextSettings,
    pub image: ImageSettings,
    pub batch: BatchSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            hash_algorithm: HashAlgorithm::default(),
            workers: WorkerMode::default(),
            text: TextSettings::default(),
            image: ImageSettings::default(),
            batch: BatchSettings::default(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("bidscan"))
        .unwrap_or_else(|| PathBuf::from("./cache"))
}

impl Settings {
    /// Load settings from a TOML file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.text.threshold) {
            bail!("text.threshold must be within [0, 1], got {}", self.text.threshold);
        }
        if !(0.0..=1.0).contains(&self.image.similarity) {
            bail!(
                "image.similarity must be within [0, 1], got {}",
                self.image.similarity
            );
        }
        if self.image.resize_width == 0 {
            bail!("image.resize_width must be greater than 0");
        }
        if self.batch.chunk_size == 0 {
            bail!("batch.chunk_size must be greater than 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.text.threshold, 0.7);
        assert_eq!(settings.text.min_length, 10);
        assert_eq!(settings.image.similarity, 0.9);
        assert_eq!(settings.image.min_size, 100);
        assert_eq!(settings.batch.chunk_size, 1000);
        assert_eq!(settings.workers, WorkerMode::Multi);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bidscan.toml");
        fs::write(
            &path,
            r#"
cache_dir = "/tmp/bidscan-cache"
workers = "single"
hash_algorithm = "blake3"

[text]
threshold = 0.8
min_length = 15

[image]
minSize = 300
"#,
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.cache_dir, PathBuf::from("/tmp/bidscan-cache"));
        assert_eq!(settings.workers, WorkerMode::Single);
        assert_eq!(settings.hash_algorithm, HashAlgorithm::Blake3);
        assert_eq!(settings.text.threshold, 0.8);
        assert_eq!(settings.text.min_length, 15);
        assert_eq!(settings.image.min_size, 300);
        assert_eq!(settings.image.similarity, 0.9);
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.toml");
        fs::write(&path, "[text]\nthreshold = 1.5\n").unwrap();

        let err = Settings::load(&path).unwrap_err();
        assert!(err.to_string().contains("text.threshold"));
    }

    #[test]
    fn test_unknown_hash_algorithm_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.toml");
        fs::write(&path, "hash_algorithm = \"md5\"\n").unwrap();

        assert!(Settings::load(&path).is_err());
    }

    #[test]
    fn test_worker_mode_parsing() {
        assert_eq!("single".parse::<WorkerMode>().unwrap(), WorkerMode::Single);
        assert_eq!("MULTI".parse::<WorkerMode>().unwrap(), WorkerMode::Multi);
        assert!("many".parse::<WorkerMode>().is_err());
        assert_eq!(WorkerMode::Single.worker_count(), 1);
        assert!(WorkerMode::Multi.worker_count() >= 1);
    }

    #[test]
    fn test_settings_serialize_in_camel_case() {
        let json = serde_json::to_value(TextSettings::default()).unwrap();
        assert_eq!(json["minLength"], 10);
        let json = serde_json::to_value(ImageSettings::default()).unwrap();
        assert_eq!(json["minSize"], 100);
        assert_eq!(json["resizeWidth"], 100);
    }
}
