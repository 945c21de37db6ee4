use image::{DynamicImage, GenericImageView, ImageFormat, imageops::FilterType};
use std::io::Cursor;
use std::path::{Path, PathBuf};

/// Widths of the downsampled copies kept next to every stored image.
pub const VARIANT_WIDTHS: [u32; 3] = [100, 200, 300];

/// Produces the primary PNG and its downsampled variants.
///
/// Variant files are named `<stem>.<width>.png` next to the primary
/// `<stem>.png`. Images already narrower than a variant width get no variant
/// for that width.
pub struct VariantService {
    widths: Vec<u32>,
}

impl VariantService {
    pub fn new() -> Self {
        Self::with_widths(&VARIANT_WIDTHS)
    }

    pub fn with_widths(widths: &[u32]) -> Self {
        Self {
            widths: widths.to_vec(),
        }
    }

    pub fn widths(&self) -> &[u32] {
        &self.widths
    }

    /// Path of the `width` variant of `primary`.
    pub fn variant_path(primary: &Path, width: u32) -> PathBuf {
        let stem = primary
            .file_stem()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        primary.with_file_name(format!("{}.{}.png", stem, width))
    }

    /// The variant for `width` if it was written, otherwise the primary.
    pub fn best_source(primary: &Path, width: u32) -> PathBuf {
        let variant = Self::variant_path(primary, width);
        if variant.is_file() {
            variant
        } else {
            primary.to_path_buf()
        }
    }

    /// Widths for which `img` gets a downsampled copy.
    pub fn applicable_widths(&self, img: &DynamicImage) -> Vec<u32> {
        let (width, _) = img.dimensions();
        self.widths.iter().copied().filter(|w| *w < width).collect()
    }

    /// Scale `img` to `target_width`, keeping the aspect ratio.
    pub fn resize_to_width(&self, img: &DynamicImage, target_width: u32) -> DynamicImage {
        let (width, height) = img.dimensions();
        let ratio = target_width as f32 / width as f32;
        let new_height = ((height as f32 * ratio) as u32).max(1);

        // Lanczos3 keeps edges crisp enough for hashing at small sizes.
        img.resize_exact(target_width, new_height, FilterType::Lanczos3)
    }

    pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
        Ok(bytes)
    }
}

impl Default for VariantService {
    fn default() -> Self {
        Self::new()
    }
}
