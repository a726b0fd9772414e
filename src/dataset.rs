//! Dataset access: directory listing, PNG decoding and mask pairing.
//!
//! Images are decoded as RGB, resized to the configured size with a
//! bilinear filter and scaled to `[0, 1]`, matching how the carpet
//! experiments fed data into the patch extractor.

use crate::config::LabelPairing;
use crate::error::{OcnnError, Result};
use image::imageops::FilterType;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Number of color channels of every image and patch.
pub const CHANNELS: usize = 3;

/// A 3-channel raster, HWC row-major, values in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    height: usize,
    width: usize,
    data: Vec<f32>,
}

impl Image {
    /// Create an image from HWC data.
    ///
    /// # Errors
    ///
    /// Returns an error if `data.len() != height * width * 3` or any value is
    /// not finite.
    pub fn new(height: usize, width: usize, data: Vec<f32>) -> Result<Self> {
        let expected = height * width * CHANNELS;
        if data.len() != expected {
            return Err(OcnnError::dimension_mismatch(
                format!("{height}x{width}x{CHANNELS} = {expected} values"),
                format!("{} values", data.len()),
            ));
        }
        if data.iter().any(|v| !v.is_finite()) {
            return Err(OcnnError::dimension_mismatch(
                "finite pixel values",
                "NaN or infinite value",
            ));
        }
        Ok(Self {
            height,
            width,
            data,
        })
    }

    /// An all-zero image (used as the mask of a defect-free test image).
    #[must_use]
    pub fn zeros(height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            data: vec![0.0; height * width * CHANNELS],
        }
    }

    /// Image height in pixels.
    #[must_use]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Image width in pixels.
    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Raw HWC values.
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Value at `(y, x, channel)`.
    ///
    /// # Panics
    ///
    /// Panics if the coordinates are out of bounds.
    #[must_use]
    pub fn pixel(&self, y: usize, x: usize, channel: usize) -> f32 {
        self.data[(y * self.width + x) * CHANNELS + channel]
    }

    /// Build from an 8-bit RGB buffer, scaling to `[0, 1]`.
    #[must_use]
    pub fn from_rgb8(buffer: &image::RgbImage) -> Self {
        let (width, height) = buffer.dimensions();
        let data = buffer
            .as_raw()
            .iter()
            .map(|&b| f32::from(b) / 255.0)
            .collect();
        Self {
            height: height as usize,
            width: width as usize,
            data,
        }
    }
}

/// One test image and the mask that labels it, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledSample {
    /// Test image path.
    pub image_path: PathBuf,
    /// Ground-truth mask path; `None` means the image is defect-free.
    pub mask_path: Option<PathBuf>,
}

/// List `*.png` files of a directory (non-recursive), sorted by file name.
///
/// # Errors
///
/// Returns [`OcnnError::DatasetNotFound`] if `dir` is not a directory.
pub fn list_png_files(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(OcnnError::DatasetNotFound {
            path: dir.to_path_buf(),
        });
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_png = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("png"));
        if is_png && path.is_file() {
            files.push(path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    debug!(dir = %dir.display(), count = files.len(), "listed png files");
    Ok(files)
}

/// Decode a PNG, resize it to `height × width` and scale to `[0, 1]`.
///
/// # Errors
///
/// Returns [`OcnnError::ImageDecode`] if the file cannot be opened or decoded.
pub fn load_image(path: impl AsRef<Path>, height: usize, width: usize) -> Result<Image> {
    let path = path.as_ref();
    let decoded = image::open(path).map_err(|e| OcnnError::ImageDecode {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let rgb = decoded.to_rgb8();

    let target_w = u32::try_from(width)
        .map_err(|_| OcnnError::invalid_config(format!("image width {width} too large")))?;
    let target_h = u32::try_from(height)
        .map_err(|_| OcnnError::invalid_config(format!("image height {height} too large")))?;

    if rgb.dimensions() == (target_w, target_h) {
        return Ok(Image::from_rgb8(&rgb));
    }
    let resized = image::imageops::resize(&rgb, target_w, target_h, FilterType::Triangle);
    Ok(Image::from_rgb8(&resized))
}

/// Load every listed image at the given size.
///
/// # Errors
///
/// Returns the first decoding error encountered.
pub fn load_images(paths: &[PathBuf], height: usize, width: usize) -> Result<Vec<Image>> {
    paths
        .iter()
        .map(|path| load_image(path, height, width))
        .collect()
}

/// Load the mask of a sample, or an all-zero mask for defect-free images.
///
/// # Errors
///
/// Returns an error if the mask file cannot be decoded.
pub fn load_mask(sample: &LabeledSample, height: usize, width: usize) -> Result<Image> {
    match &sample.mask_path {
        Some(path) => load_image(path, height, width),
        None => Ok(Image::zeros(height, width)),
    }
}

/// Pair test images with their ground-truth masks.
///
/// With [`LabelPairing::ByFilename`], `NNN.png` is paired with
/// `NNN{mask_suffix}.png` (or a mask with the identical stem); images without
/// a mask are defect-free. With [`LabelPairing::EnumerationOrder`], the two
/// sorted listings are zipped and must have equal length.
///
/// # Errors
///
/// Returns [`OcnnError::LabelAlignment`] if enumeration-order pairing is
/// requested on listings of different lengths.
pub fn pair_test_with_masks(
    test_files: &[PathBuf],
    mask_files: &[PathBuf],
    pairing: LabelPairing,
    mask_suffix: &str,
) -> Result<Vec<LabeledSample>> {
    match pairing {
        LabelPairing::EnumerationOrder => {
            if test_files.len() != mask_files.len() {
                return Err(OcnnError::label_alignment(format!(
                    "{} test images but {} masks",
                    test_files.len(),
                    mask_files.len()
                )));
            }
            Ok(test_files
                .iter()
                .zip(mask_files)
                .map(|(image, mask)| LabeledSample {
                    image_path: image.clone(),
                    mask_path: Some(mask.clone()),
                })
                .collect())
        }
        LabelPairing::ByFilename => {
            let masks: HashMap<String, &PathBuf> = mask_files
                .iter()
                .filter_map(|path| file_stem(path).map(|stem| (stem, path)))
                .collect();

            let mut used = 0usize;
            let samples: Vec<LabeledSample> = test_files
                .iter()
                .map(|image| {
                    let mask_path = file_stem(image).and_then(|stem| {
                        masks
                            .get(&format!("{stem}{mask_suffix}"))
                            .or_else(|| masks.get(&stem))
                            .map(|path| (*path).clone())
                    });
                    if mask_path.is_some() {
                        used += 1;
                    }
                    LabeledSample {
                        image_path: image.clone(),
                        mask_path,
                    }
                })
                .collect();

            if used < mask_files.len() {
                warn!(
                    unmatched = mask_files.len() - used,
                    "ground-truth masks without a matching test image"
                );
            }
            Ok(samples)
        }
    }
}

fn file_stem(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
}
