use image::DynamicImage;
use image_hasher::{HashAlg, HasherConfig, ImageHash};
use std::path::Path;

/// Mean hash of an image: one bit per cell of a `size x size` grayscale
/// grid, set when the cell is brighter than the grid's mean.
#[derive(Debug, Clone, PartialEq)]
pub struct PerceptualHash {
    hash: ImageHash,
    bits: u32,
}

impl PerceptualHash {
    pub fn from_image(img: &DynamicImage, size: u32) -> Self {
        let size = size.max(1);
        let hasher = HasherConfig::new()
            .hash_size(size, size)
            .hash_alg(HashAlg::Mean)
            .to_hasher();

        Self {
            hash: hasher.hash_image(img),
            bits: size * size,
        }
    }

    pub fn from_path(path: &Path, size: u32) -> Result<Self, image::ImageError> {
        let img = image::open(path)?;
        Ok(Self::from_image(&img, size))
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Fraction of bits both hashes agree on. Hashes of different sizes
    /// never agree.
    pub fn agreement(&self, other: &PerceptualHash) -> f64 {
        if self.bits != other.bits || self.bits == 0 {
            return 0.0;
        }
        let distance = self.hash.dist(&other.hash).min(self.bits);
        (self.bits - distance) as f64 / self.bits as f64
    }
}
