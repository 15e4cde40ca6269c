//! Image normalization: turns any accepted input into one canonical on-disk
//! image that is safe to hand to the recognition engine.
//!
//! The canonical image is 8-bit RGB, no side below the configured minimum,
//! and its longest side no larger than the configured maximum. It is written
//! to a path derived from the request slot, so repeated attempts for the same
//! request overwrite the same file.

use crate::schema::ImageDiagnostics;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageOutputFormat, Rgb, RgbImage};
use ndarray::Array3;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_SIDE: u32 = 2048;
pub const DEFAULT_MIN_WIDTH: u32 = 100;
pub const DEFAULT_MIN_HEIGHT: u32 = 50;

/// JPEG quality used when the PNG write fails.
const FALLBACK_JPEG_QUALITY: u8 = 95;

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("unsupported input: {0}")]
    UnsupportedInputType(String),

    #[error("unsupported channel layout: {channels} channels (expected 3 or 4)")]
    UnsupportedChannelLayout { channels: usize },

    #[error("image too small: {width}x{height} (minimum {min_width}x{min_height})")]
    ImageTooSmall {
        width: u32,
        height: u32,
        min_width: u32,
        min_height: u32,
    },

    #[error("cannot read image: {0}")]
    Unreadable(String),

    #[error("failed to write canonical image to {path}: {cause}")]
    Persistence { path: PathBuf, cause: String },
}

/// In-memory pixel array, shape `(height, width, channels)`.
#[derive(Debug, Clone)]
pub enum PixelArray {
    U8(Array3<u8>),
    U16(Array3<u16>),
    F32(Array3<f32>),
    F64(Array3<f64>),
}

impl PixelArray {
    fn dims(&self) -> (usize, usize, usize) {
        match self {
            Self::U8(a) => a.dim(),
            Self::U16(a) => a.dim(),
            Self::F32(a) => a.dim(),
            Self::F64(a) => a.dim(),
        }
    }

    /// Convert to 8-bit samples in row-major order. Non-`u8` arrays whose
    /// maximum is at most 1.0 are treated as normalized and scaled by 255;
    /// anything else is cast directly, saturating at the `u8` range.
    fn to_u8_samples(&self) -> Vec<u8> {
        match self {
            Self::U8(a) => a.iter().copied().collect(),
            Self::U16(a) => rescale(a.iter().map(|&v| f64::from(v))),
            Self::F32(a) => rescale(a.iter().map(|&v| f64::from(v))),
            Self::F64(a) => rescale(a.iter().copied()),
        }
    }
}

fn rescale<I>(values: I) -> Vec<u8>
where
    I: Iterator<Item = f64> + Clone,
{
    let max = values.clone().fold(f64::NEG_INFINITY, f64::max);
    if max <= 1.0 {
        values
            .map(|v| (v * 255.0).round().clamp(0.0, 255.0) as u8)
            .collect()
    } else {
        values.map(|v| v.clamp(0.0, 255.0) as u8).collect()
    }
}

/// Anything that can write itself to an image file.
pub trait SaveToPath: Send {
    fn save_to(&self, path: &Path) -> anyhow::Result<()>;
}

impl SaveToPath for DynamicImage {
    fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.save_with_format(path, ImageFormat::Png)?;
        Ok(())
    }
}

/// An input image in one of the accepted representations.
pub enum SourceImage {
    /// Path to an encoded image file.
    Path(PathBuf),
    /// Encoded bytes, e.g. an uploaded payload.
    Encoded(Vec<u8>),
    /// Raw pixel array.
    Pixels(PixelArray),
    /// Already decoded image.
    Decoded(DynamicImage),
    /// Any object able to save itself to a path.
    Saveable(Box<dyn SaveToPath>),
}

impl SourceImage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Path(_) => "path",
            Self::Encoded(_) => "encoded bytes",
            Self::Pixels(_) => "pixel array",
            Self::Decoded(_) => "decoded image",
            Self::Saveable(_) => "saveable object",
        }
    }
}

/// Identifies one extraction request; all of its files live under this name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestSlot(String);

impl RequestSlot {
    /// Build a slot from an arbitrary label. Characters unsafe in file names
    /// are replaced with `_`.
    pub fn new(label: &str) -> Self {
        let cleaned: String = label
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if cleaned.is_empty() {
            Self("request".to_string())
        } else {
            Self(cleaned)
        }
    }

    /// A fresh unique slot.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn canonical_path(&self, dir: &Path, format: ImageFormat) -> PathBuf {
        let ext = match format {
            ImageFormat::Jpeg => "jpg",
            _ => "png",
        };
        dir.join(format!("{}_canonical.{}", self.0, ext))
    }

    fn staging_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}_staged.png", self.0))
    }
}

/// Size bounds for canonical images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLimits {
    pub max_side: u32,
    pub min_width: u32,
    pub min_height: u32,
}

impl Default for ImageLimits {
    fn default() -> Self {
        Self {
            max_side: DEFAULT_MAX_SIDE,
            min_width: DEFAULT_MIN_WIDTH,
            min_height: DEFAULT_MIN_HEIGHT,
        }
    }
}

/// A verified canonical image on disk.
#[derive(Debug, Clone)]
pub struct CanonicalImage {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub sha256: String,
}

impl CanonicalImage {
    pub fn diagnostics(&self) -> ImageDiagnostics {
        ImageDiagnostics {
            width: self.width,
            height: self.height,
            pixel_count: u64::from(self.width) * u64::from(self.height),
            format: format!("{:?}", self.format).to_uppercase(),
            color_mode: "RGB".to_string(),
            sha256: self.sha256.clone(),
        }
    }

    /// Delete the file. Failures are logged only.
    pub fn discard(&self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove canonical image {:?}: {}", self.path, e);
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageNormalizer {
    work_dir: PathBuf,
    limits: ImageLimits,
}

impl ImageNormalizer {
    pub fn new(work_dir: impl Into<PathBuf>, limits: ImageLimits) -> Self {
        Self {
            work_dir: work_dir.into(),
            limits,
        }
    }

    /// Normalize `source` into the canonical image for `slot`.
    pub fn normalize(
        &self,
        source: SourceImage,
        slot: &RequestSlot,
    ) -> Result<CanonicalImage, NormalizeError> {
        fs::create_dir_all(&self.work_dir).map_err(|e| NormalizeError::Persistence {
            path: self.work_dir.clone(),
            cause: e.to_string(),
        })?;

        debug!("Normalizing {} for slot {}", source.kind(), slot.as_str());
        let rgb = self.load_rgb(source, slot)?;
        let source_size = rgb.dimensions();
        let bounded = self.bounded_size(source_size);
        self.check_minimum(source_size, bounded)?;
        let rgb = resize_to(rgb, bounded);

        let (path, format) = self.write(&rgb, slot)?;
        let canonical = verify_or_remove(&path, format)?;

        info!(
            slot = slot.as_str(),
            width = canonical.width,
            height = canonical.height,
            "Canonical image written to {:?}",
            canonical.path
        );
        Ok(canonical)
    }

    fn load_rgb(&self, source: SourceImage, slot: &RequestSlot) -> Result<RgbImage, NormalizeError> {
        match source {
            SourceImage::Path(path) => Ok(to_rgb(open_path(&path)?)),
            SourceImage::Encoded(bytes) => Ok(to_rgb(decode_bytes(&bytes)?)),
            SourceImage::Pixels(pixels) => pixels_to_rgb(&pixels),
            SourceImage::Decoded(image) => Ok(to_rgb(image)),
            SourceImage::Saveable(object) => {
                let staging = slot.staging_path(&self.work_dir);
                object
                    .save_to(&staging)
                    .map_err(|e| NormalizeError::UnsupportedInputType(format!(
                        "object could not save itself: {}",
                        e
                    )))?;
                let image = open_path(&staging);
                if let Err(e) = fs::remove_file(&staging) {
                    debug!("Could not remove staging file {:?}: {}", staging, e);
                }
                Ok(to_rgb(image?))
            }
        }
    }

    /// Both the source and the canonical size must meet the minimum, so a
    /// downscale never produces an image below it. Errors carry the source size.
    fn check_minimum(&self, source: (u32, u32), canonical: (u32, u32)) -> Result<(), NormalizeError> {
        let fits = |(w, h): (u32, u32)| w >= self.limits.min_width && h >= self.limits.min_height;
        if fits(source) && fits(canonical) {
            return Ok(());
        }
        Err(NormalizeError::ImageTooSmall {
            width: source.0,
            height: source.1,
            min_width: self.limits.min_width,
            min_height: self.limits.min_height,
        })
    }

    /// Size with the longest side at most the maximum, keeping aspect ratio.
    fn bounded_size(&self, (width, height): (u32, u32)) -> (u32, u32) {
        let longest = width.max(height);
        if longest <= self.limits.max_side {
            return (width, height);
        }

        let scale = f64::from(self.limits.max_side) / f64::from(longest);
        if width >= height {
            (
                self.limits.max_side,
                ((f64::from(height) * scale).round() as u32).max(1),
            )
        } else {
            (
                ((f64::from(width) * scale).round() as u32).max(1),
                self.limits.max_side,
            )
        }
    }

    /// Write PNG, falling back to JPEG once before giving up.
    fn write(&self, rgb: &RgbImage, slot: &RequestSlot) -> Result<(PathBuf, ImageFormat), NormalizeError> {
        let png_path = slot.canonical_path(&self.work_dir, ImageFormat::Png);
        let png_err = match rgb.save_with_format(&png_path, ImageFormat::Png) {
            Ok(()) => return Ok((png_path, ImageFormat::Png)),
            Err(e) => e,
        };
        warn!("PNG write to {:?} failed ({}), trying JPEG", png_path, png_err);
        remove_partial(&png_path);

        let jpeg_path = slot.canonical_path(&self.work_dir, ImageFormat::Jpeg);
        let written = fs::File::create(&jpeg_path)
            .map_err(|e| e.to_string())
            .and_then(|file| {
                let mut writer = BufWriter::new(file);
                DynamicImage::ImageRgb8(rgb.clone())
                    .write_to(&mut writer, ImageOutputFormat::Jpeg(FALLBACK_JPEG_QUALITY))
                    .map_err(|e| e.to_string())?;
                writer.flush().map_err(|e| e.to_string())
            });

        match written {
            Ok(()) => Ok((jpeg_path, ImageFormat::Jpeg)),
            Err(cause) => {
                remove_partial(&jpeg_path);
                Err(NormalizeError::Persistence {
                    path: png_path,
                    cause: format!("png: {}; jpeg fallback: {}", png_err, cause),
                })
            }
        }
    }
}

fn resize_to(rgb: RgbImage, (width, height): (u32, u32)) -> RgbImage {
    if rgb.dimensions() == (width, height) {
        return rgb;
    }
    info!(
        "Downscaling {}x{} to {}x{}",
        rgb.width(),
        rgb.height(),
        width,
        height
    );
    image::imageops::resize(&rgb, width, height, FilterType::Lanczos3)
}

/// Remove a partially written canonical file. Anything that is not a
/// regular file is left alone.
fn remove_partial(path: &Path) {
    if path.is_file() {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to remove partial file {:?}: {}", path, e);
        }
    }
}

/// Verify a freshly written file, removing it when it does not check out.
fn verify_or_remove(path: &Path, format: ImageFormat) -> Result<CanonicalImage, NormalizeError> {
    verify(path, format).map_err(|e| {
        remove_partial(path);
        e
    })
}

/// Re-open the written file and confirm it decodes.
fn verify(path: &Path, format: ImageFormat) -> Result<CanonicalImage, NormalizeError> {
    let persistence = |cause: String| NormalizeError::Persistence {
        path: path.to_path_buf(),
        cause,
    };

    let bytes = fs::read(path).map_err(|e| persistence(e.to_string()))?;
    if bytes.is_empty() {
        return Err(persistence("written file is empty".to_string()));
    }
    let decoded = image::load_from_memory_with_format(&bytes, format)
        .map_err(|e| persistence(format!("written file does not decode: {}", e)))?;

    let sha256 = format!("{:x}", Sha256::digest(&bytes));
    Ok(CanonicalImage {
        path: path.to_path_buf(),
        width: decoded.width(),
        height: decoded.height(),
        format,
        sha256,
    })
}

fn open_path(path: &Path) -> Result<DynamicImage, NormalizeError> {
    let bytes = fs::read(path)
        .map_err(|e| NormalizeError::Unreadable(format!("{}: {}", path.display(), e)))?;
    decode_bytes(&bytes)
}

fn decode_bytes(bytes: &[u8]) -> Result<DynamicImage, NormalizeError> {
    let reader = image::io::Reader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| NormalizeError::Unreadable(e.to_string()))?;
    if reader.format().is_none() {
        return Err(NormalizeError::UnsupportedInputType(
            "payload is not a recognized image format".to_string(),
        ));
    }
    reader.decode().map_err(|e| match e {
        image::ImageError::Unsupported(u) => NormalizeError::UnsupportedInputType(u.to_string()),
        other => NormalizeError::Unreadable(other.to_string()),
    })
}

/// Convert any decoded image to RGB. Alpha is composited onto white.
fn to_rgb(image: DynamicImage) -> RgbImage {
    if image.color().has_alpha() {
        let rgba = image.to_rgba8();
        RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
            let [r, g, b, a] = rgba.get_pixel(x, y).0;
            Rgb([blend_white(r, a), blend_white(g, a), blend_white(b, a)])
        })
    } else {
        image.to_rgb8()
    }
}

fn blend_white(channel: u8, alpha: u8) -> u8 {
    let c = u32::from(channel);
    let a = u32::from(alpha);
    ((c * a + 255 * (255 - a) + 127) / 255) as u8
}

fn pixels_to_rgb(pixels: &PixelArray) -> Result<RgbImage, NormalizeError> {
    let (height, width, channels) = pixels.dims();
    if height == 0 || width == 0 {
        return Err(NormalizeError::UnsupportedInputType(format!(
            "empty pixel array ({}x{}x{})",
            height, width, channels
        )));
    }
    if channels != 3 && channels != 4 {
        return Err(NormalizeError::UnsupportedChannelLayout { channels });
    }

    let too_large = || {
        NormalizeError::UnsupportedInputType(format!("pixel array too large: {}x{}", width, height))
    };
    let w = u32::try_from(width).map_err(|_| too_large())?;
    let h = u32::try_from(height).map_err(|_| too_large())?;

    let samples = pixels.to_u8_samples();
    let rgb: Vec<u8> = if channels == 4 {
        samples
            .chunks_exact(4)
            .flat_map(|px| {
                let a = px[3];
                [blend_white(px[0], a), blend_white(px[1], a), blend_white(px[2], a)]
            })
            .collect()
    } else {
        samples
    };

    RgbImage::from_raw(w, h, rgb).ok_or_else(|| {
        NormalizeError::UnsupportedInputType("pixel buffer does not match its shape".to_string())
    })
}
