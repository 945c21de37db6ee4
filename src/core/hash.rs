use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("The file does not exist: {path}")]
    MissingFile { path: String },

    #[error("Unsupported hash algorithm: {name} (expected sha256 or blake3)")]
    UnsupportedAlgorithm { name: String },
}

/// Digest used to key cache entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Blake3,
}

impl FromStr for HashAlgorithm {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(Self::Sha256),
            "blake3" => Ok(Self::Blake3),
            _ => Err(HashError::UnsupportedAlgorithm {
                name: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => f.write_str("sha256"),
            Self::Blake3 => f.write_str("blake3"),
        }
    }
}

/// Hex digest of a file's bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(pub String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

enum Digester {
    Sha256(Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl Digester {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            HashAlgorithm::Blake3 => Self::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        match self {
            Self::Sha256(hasher) => hasher.update(bytes),
            Self::Blake3(hasher) => {
                hasher.update(bytes);
            }
        }
    }

    fn finish(self) -> String {
        match self {
            Self::Sha256(hasher) => format!("{:x}", hasher.finalize()),
            Self::Blake3(hasher) => hasher.finalize().to_hex().to_string(),
        }
    }
}

/// Computes content hashes used as cache keys
pub struct HashService {
    algorithm: HashAlgorithm,
}

impl HashService {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self { algorithm }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Stream the file through the configured digest.
    /// Identical bytes always produce the identical key.
    pub fn compute_content_hash(&self, file_path: &Path) -> Result<ContentHash, HashError> {
        if !file_path.is_file() {
            return Err(HashError::MissingFile {
                path: file_path.to_string_lossy().to_string(),
            });
        }

        let file = File::open(file_path)?;
        let mut reader = BufReader::new(file);
        let mut buffer = [0; 8192];

        let mut digester = Digester::new(self.algorithm);
        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            digester.update(&buffer[..bytes_read]);
        }

        let digest = digester.finish();
        Ok(ContentHash(digest))
    }

    /// Compute content hashes for multiple files in parallel.
    /// Results keep the input order.
    pub fn hash_files(&self, file_paths: &[PathBuf]) -> Vec<(PathBuf, Result<ContentHash, HashError>)> {
        file_paths
            .par_iter()
            .map(|path| (path.clone(), self.compute_content_hash(path)))
            .collect()
    }
}

impl Default for HashService {
    fn default() -> Self {
        Self::new(HashAlgorithm::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_compute_content_hash() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("bid.txt");
        fs::write(&file_path, b"Hello, World!").unwrap();

        let hash_service = HashService::default();
        let hash = hash_service.compute_content_hash(&file_path).unwrap();
        let hash2 = hash_service.compute_content_hash(&file_path).unwrap();
        assert_eq!(hash, hash2);

        // 64 hex characters for SHA-256
        assert_eq!(hash.as_str().len(), 64);
        assert!(hash.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_blake3_differs_from_sha256() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("bid.txt");
        fs::write(&file_path, b"Same content").unwrap();

        let sha = HashService::new(HashAlgorithm::Sha256)
            .compute_content_hash(&file_path)
            .unwrap();
        let blake = HashService::new(HashAlgorithm::Blake3)
            .compute_content_hash(&file_path)
            .unwrap();

        assert_eq!(blake.as_str().len(), 64);
        assert_ne!(sha, blake);
    }

    #[test]
    fn test_streamed_digest_matches_one_shot_digest() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("large.bin");
        // Spans several read buffers and ends mid-buffer.
        let content: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&file_path, &content).unwrap();

        let sha = HashService::new(HashAlgorithm::Sha256)
            .compute_content_hash(&file_path)
            .unwrap();
        assert_eq!(sha.as_str(), format!("{:x}", Sha256::digest(&content)));

        let blake = HashService::new(HashAlgorithm::Blake3)
            .compute_content_hash(&file_path)
            .unwrap();
        assert_eq!(blake.as_str(), blake3::hash(&content).to_hex().as_str());
    }

    #[test]
    fn test_identical_files_same_hash() {
        let temp_dir = TempDir::new().unwrap();
        let file1 = temp_dir.path().join("file1.txt");
        let file2 = temp_dir.path().join("file2.txt");
        fs::write(&file1, b"Identical content").unwrap();
        fs::write(&file2, b"Identical content").unwrap();

        let hash_service = HashService::default();
        assert_eq!(
            hash_service.compute_content_hash(&file1).unwrap(),
            hash_service.compute_content_hash(&file2).unwrap()
        );
    }

    #[test]
    fn test_missing_file_is_an_input_error() {
        let temp_dir = TempDir::new().unwrap();
        let result = HashService::default().compute_content_hash(&temp_dir.path().join("nope.pdf"));
        assert!(matches!(result, Err(HashError::MissingFile { .. })));
    }

    #[test]
    fn test_unsupported_algorithm_rejected() {
        assert_eq!("SHA256".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha256);
        assert_eq!("blake3".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Blake3);
        assert!(matches!(
            "md5".parse::<HashAlgorithm>(),
            Err(HashError::UnsupportedAlgorithm { .. })
        ));
    }

    #[test]
    fn test_batch_hashing_keeps_order() {
        let temp_dir = TempDir::new().unwrap();
        let file1 = temp_dir.path().join("file1.txt");
        let file2 = temp_dir.path().join("file2.txt");
        fs::write(&file1, b"Content 1").unwrap();
        fs::write(&file2, b"Content 2").unwrap();

        let results = HashService::default().hash_files(&[file1.clone(), file2.clone()]);

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, file1);
        assert_eq!(results[1].0, file2);
        let hash1 = results[0].1.as_ref().unwrap();
        let hash2 = results[1].1.as_ref().unwrap();
        assert_ne!(hash1, hash2);
    }
}
