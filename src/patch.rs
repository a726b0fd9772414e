//! Non-overlapping square patch extraction.
//!
//! An `H × W × 3` image is cut into `(H/P) × (W/P)` patches of `P × P × 3`,
//! row blocks outer and column blocks inner. A patch size that does not
//! divide the image is rejected rather than truncated.

use crate::dataset::{Image, CHANNELS};
use crate::error::{OcnnError, Result};

/// A `P × P × 3` crop, HWC row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    size: usize,
    data: Vec<f32>,
}

impl Patch {
    /// Create a patch from HWC data.
    ///
    /// # Errors
    ///
    /// Returns an error if `data.len() != size * size * 3`.
    pub fn new(size: usize, data: Vec<f32>) -> Result<Self> {
        let expected = size * size * CHANNELS;
        if data.len() != expected {
            return Err(OcnnError::dimension_mismatch(
                format!("{size}x{size}x{CHANNELS} = {expected} values"),
                format!("{} values", data.len()),
            ));
        }
        Ok(Self { size, data })
    }

    /// Side length in pixels.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
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
        self.data[(y * self.size + x) * CHANNELS + channel]
    }

    /// True if any value is strictly positive.
    #[must_use]
    pub fn has_positive_pixel(&self) -> bool {
        self.data.iter().any(|&v| v > 0.0)
    }
}

/// Layout of patches over an image of a fixed size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchGrid {
    rows: usize,
    cols: usize,
    patch_size: usize,
}

impl PatchGrid {
    /// Grid for `height × width` images cut into `patch_size` squares.
    ///
    /// # Errors
    ///
    /// Returns [`OcnnError::InvalidPatchGrid`] if `patch_size` is zero or does
    /// not divide both dimensions.
    pub fn new(height: usize, width: usize, patch_size: usize) -> Result<Self> {
        if patch_size == 0 || height % patch_size != 0 || width % patch_size != 0 {
            return Err(OcnnError::InvalidPatchGrid {
                height,
                width,
                patch_size,
            });
        }
        Ok(Self {
            rows: height / patch_size,
            cols: width / patch_size,
            patch_size,
        })
    }

    /// Grid matching an image's size.
    ///
    /// # Errors
    ///
    /// See [`PatchGrid::new`].
    pub fn for_image(image: &Image, patch_size: usize) -> Result<Self> {
        Self::new(image.height(), image.width(), patch_size)
    }

    /// Patch rows.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Patch columns.
    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Patch side length.
    #[must_use]
    pub fn patch_size(&self) -> usize {
        self.patch_size
    }

    /// Patches per image.
    #[must_use]
    pub fn patches_per_image(&self) -> usize {
        self.rows * self.cols
    }

    /// Image height covered by the grid.
    #[must_use]
    pub fn image_height(&self) -> usize {
        self.rows * self.patch_size
    }

    /// Image width covered by the grid.
    #[must_use]
    pub fn image_width(&self) -> usize {
        self.cols * self.patch_size
    }

    fn check_image(&self, image: &Image) -> Result<()> {
        if image.height() != self.image_height() || image.width() != self.image_width() {
            return Err(OcnnError::dimension_mismatch(
                format!("{}x{} image", self.image_height(), self.image_width()),
                format!("{}x{} image", image.height(), image.width()),
            ));
        }
        Ok(())
    }
}

/// Cut one image into patches in row-major block order.
///
/// # Errors
///
/// Returns an error if the image size does not match the grid.
pub fn image_patches(image: &Image, grid: &PatchGrid) -> Result<Vec<Patch>> {
    grid.check_image(image)?;

    let p = grid.patch_size;
    let row_len = p * CHANNELS;
    let src = image.as_slice();
    let src_stride = image.width() * CHANNELS;

    let mut patches = Vec::with_capacity(grid.patches_per_image());
    for block_row in 0..grid.rows {
        for block_col in 0..grid.cols {
            let mut data = Vec::with_capacity(p * row_len);
            for y in 0..p {
                let start = (block_row * p + y) * src_stride + block_col * row_len;
                data.extend_from_slice(&src[start..start + row_len]);
            }
            patches.push(Patch { size: p, data });
        }
    }
    Ok(patches)
}

/// Cut a batch of equal-sized images into one flat patch sequence, grouped
/// image by image.
///
/// # Errors
///
/// Returns an error if the patch size does not divide the images or the
/// images differ in size.
pub fn extract_patches(images: &[Image], patch_size: usize) -> Result<Vec<Patch>> {
    let Some(first) = images.first() else {
        return Ok(Vec::new());
    };
    let grid = PatchGrid::for_image(first, patch_size)?;

    let mut patches = Vec::with_capacity(images.len() * grid.patches_per_image());
    for image in images {
        patches.extend(image_patches(image, &grid)?);
    }
    Ok(patches)
}

/// Rebuild an image from its patches in row-major block order.
///
/// # Errors
///
/// Returns an error if the patch count or any patch size disagrees with the
/// grid.
pub fn reassemble(patches: &[Patch], grid: &PatchGrid) -> Result<Image> {
    if patches.len() != grid.patches_per_image() {
        return Err(OcnnError::dimension_mismatch(
            format!("{} patches", grid.patches_per_image()),
            format!("{} patches", patches.len()),
        ));
    }

    let p = grid.patch_size;
    let row_len = p * CHANNELS;
    let width = grid.image_width();
    let dst_stride = width * CHANNELS;
    let mut data = vec![0.0; grid.image_height() * dst_stride];

    for (index, patch) in patches.iter().enumerate() {
        if patch.size != p {
            return Err(OcnnError::dimension_mismatch(
                format!("patch size {p}"),
                format!("patch size {}", patch.size),
            ));
        }
        let block_row = index / grid.cols;
        let block_col = index % grid.cols;
        for y in 0..p {
            let dst = (block_row * p + y) * dst_stride + block_col * row_len;
            data[dst..dst + row_len].copy_from_slice(&patch.data[y * row_len..(y + 1) * row_len]);
        }
    }

    Image::new(grid.image_height(), width, data)
}
