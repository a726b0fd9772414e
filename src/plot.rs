//! SVG rendering of ROC curves and labelled patch grids.

use crate::dataset::CHANNELS;
use crate::error::{OcnnError, Result};
use crate::evaluation::RocCurve;
use crate::patch::Patch;
use plotters::prelude::*;
use std::ops::Range;
use std::path::{Path, PathBuf};

/// Patches per row and per column of a grid figure.
pub const GRID_SIDE: usize = 16;

/// Patches drawn in one grid figure.
pub const GRID_PATCHES: usize = GRID_SIDE * GRID_SIDE;

/// Grid of the first test patches marked by ground truth.
pub const LABELS_GRID_FILE: &str = "patches_labels.svg";

/// Grid of the first test patches marked by prediction.
pub const PREDICTIONS_GRID_FILE: &str = "patches_pred.svg";

/// Leading rows of the red channel overwritten on a marked patch.
const TINT_ROWS: usize = 32;
const TINT_VALUE: f32 = 0.9;
/// Drawn pixels per cell edge; larger patches are block-averaged.
const CELL_PIXELS: usize = 16;
const CELL_SIZE: u32 = 48;

/// Axis window of a ROC plot.
#[derive(Debug, Clone, PartialEq)]
pub struct PlotWindow {
    /// False positive rate range
    pub x: Range<f64>,
    /// True positive rate range
    pub y: Range<f64>,
}

impl PlotWindow {
    /// The full unit square.
    #[must_use]
    pub fn full() -> Self {
        Self {
            x: 0.0..1.0,
            y: 0.0..1.0,
        }
    }

    /// Top-left corner, where a good detector lives.
    #[must_use]
    pub fn zoomed() -> Self {
        Self {
            x: 0.0..0.2,
            y: 0.8..1.0,
        }
    }
}

fn plot_err(context: &str, e: impl std::fmt::Display) -> OcnnError {
    OcnnError::Plot(format!("{context}: {e}"))
}

/// Draw the curve, the chance diagonal and an AUC legend into an SVG file.
///
/// # Errors
///
/// Returns [`OcnnError::Plot`] if any drawing call fails.
pub fn render_roc(
    curve: &RocCurve,
    title: &str,
    window: &PlotWindow,
    path: impl AsRef<Path>,
) -> Result<()> {
    let path = path.as_ref();
    let root = SVGBackend::new(path, (640, 560)).into_drawing_area();
    root.fill(&WHITE).map_err(|e| plot_err("backend error", e))?;

    {
        let mut chart = ChartBuilder::on(&root)
            .margin(15)
            .caption(title, ("sans-serif", 22))
            .set_label_area_size(LabelAreaPosition::Left, 50)
            .set_label_area_size(LabelAreaPosition::Bottom, 45)
            .build_cartesian_2d(window.x.clone(), window.y.clone())
            .map_err(|e| plot_err("chart build error", e))?;

        chart
            .configure_mesh()
            .x_desc("False positive rate")
            .y_desc("True positive rate")
            .draw()
            .map_err(|e| plot_err("mesh error", e))?;

        chart
            .draw_series(LineSeries::new(
                vec![(0.0, 0.0), (1.0, 1.0)],
                BLACK.mix(0.5).stroke_width(1),
            ))
            .map_err(|e| plot_err("draw error", e))?;

        let points: Vec<(f64, f64)> = curve
            .fpr
            .iter()
            .copied()
            .zip(curve.tpr.iter().copied())
            .collect();
        chart
            .draw_series(LineSeries::new(points, RED.stroke_width(2)))
            .map_err(|e| plot_err("draw error", e))?
            .label(format!("ROC (area = {:.3})", curve.auc()))
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], RED.stroke_width(2)));

        chart
            .configure_series_labels()
            .position(SeriesLabelPosition::LowerRight)
            .background_style(&WHITE.mix(0.8))
            .border_style(&BLACK)
            .draw()
            .map_err(|e| plot_err("legend error", e))?;
    }

    root.present().map_err(|e| plot_err("render error", e))?;
    Ok(())
}

/// Write the full and zoomed ROC plots into `dir`, returning both paths.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or a plot fails.
pub fn render_roc_pair(
    curve: &RocCurve,
    experiment: &str,
    dir: impl AsRef<Path>,
) -> Result<(PathBuf, PathBuf)> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    let full = dir.join("roc.svg");
    let zoom = dir.join("roc_zoom.svg");
    render_roc(curve, &format!("ROC curve: {experiment}"), &PlotWindow::full(), &full)?;
    render_roc(
        curve,
        &format!("ROC curve (zoomed in at top left): {experiment}"),
        &PlotWindow::zoomed(),
        &zoom,
    )?;
    Ok((full, zoom))
}

/// Pixels of a patch with the first [`TINT_ROWS`] rows of red set to 0.9.
fn tinted(patch: &Patch) -> Vec<f32> {
    let size = patch.size();
    let mut data = patch.as_slice().to_vec();
    for y in 0..TINT_ROWS.min(size) {
        for x in 0..size {
            data[(y * size + x) * CHANNELS] = TINT_VALUE;
        }
    }
    data
}

/// Average RGB of the `block × block` square at block coordinates `(by, bx)`.
fn block_color(data: &[f32], size: usize, block: usize, by: usize, bx: usize) -> RGBColor {
    let mut sum = [0.0f32; CHANNELS];
    let mut count = 0.0f32;
    for y in by * block..((by + 1) * block).min(size) {
        for x in bx * block..((bx + 1) * block).min(size) {
            let pixel = &data[(y * size + x) * CHANNELS..(y * size + x + 1) * CHANNELS];
            for (s, &v) in sum.iter_mut().zip(pixel) {
                *s += v;
            }
            count += 1.0;
        }
    }
    let to_byte = |v: f32| (v / count * 255.0).round().clamp(0.0, 255.0) as u8;
    RGBColor(to_byte(sum[0]), to_byte(sum[1]), to_byte(sum[2]))
}

/// Draw up to [`GRID_PATCHES`] patches in a 16×16 grid, titling each with
/// its mark. Patches whose mark is `1` get their top red rows tinted.
///
/// # Errors
///
/// Returns [`OcnnError::Plot`] if there is nothing to draw or a drawing call
/// fails.
pub fn render_patch_grid(
    patches: &[Patch],
    marks: &[u8],
    title: &str,
    path: impl AsRef<Path>,
) -> Result<()> {
    let count = patches.len().min(marks.len()).min(GRID_PATCHES);
    if count == 0 {
        return Err(OcnnError::Plot("no patches to draw".to_string()));
    }
    let side = CELL_SIZE * GRID_SIDE as u32;
    let root = SVGBackend::new(path.as_ref(), (side, side + 40)).into_drawing_area();
    root.fill(&WHITE).map_err(|e| plot_err("backend error", e))?;
    let body = root
        .titled(title, ("sans-serif", 22))
        .map_err(|e| plot_err("title error", e))?;
    let cells = body.split_evenly((GRID_SIDE, GRID_SIDE));

    for ((cell, patch), &mark) in cells.iter().zip(patches).zip(marks).take(count) {
        let inner = cell
            .titled(&mark.to_string(), ("sans-serif", 11))
            .map_err(|e| plot_err("title error", e))?;
        let (width, height) = inner.dim_in_pixel();
        let size = patch.size();
        let data = if mark == 1 {
            tinted(patch)
        } else {
            patch.as_slice().to_vec()
        };

        let block = size.div_ceil(CELL_PIXELS).max(1);
        let blocks = size.div_ceil(block);
        let edge = |i: usize, extent: u32| (i * extent as usize / blocks) as i32;
        for by in 0..blocks {
            for bx in 0..blocks {
                let color = block_color(&data, size, block, by, bx);
                inner
                    .draw(&Rectangle::new(
                        [(edge(bx, width), edge(by, height)), (edge(bx + 1, width), edge(by + 1, height))],
                        color.filled(),
                    ))
                    .map_err(|e| plot_err("draw error", e))?;
            }
        }
    }

    root.present().map_err(|e| plot_err("render error", e))?;
    Ok(())
}

/// Write the ground-truth and prediction grids into `dir`.
///
/// Predictions are marked when they reach 0.5, which for a thresholded
/// decision rule means exactly the `1.0` outputs.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or a plot fails.
pub fn render_patch_grids(
    patches: &[Patch],
    labels: &[u8],
    predictions: &[f32],
    experiment: &str,
    dir: impl AsRef<Path>,
) -> Result<(PathBuf, PathBuf)> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    let labels_path = dir.join(LABELS_GRID_FILE);
    let predictions_path = dir.join(PREDICTIONS_GRID_FILE);
    let marks: Vec<u8> = predictions.iter().map(|&p| u8::from(p >= 0.5)).collect();

    render_patch_grid(
        patches,
        labels,
        &format!("Ground-truth labels: {experiment}"),
        &labels_path,
    )?;
    render_patch_grid(
        patches,
        &marks,
        &format!("Predictions: {experiment}"),
        &predictions_path,
    )?;
    Ok((labels_path, predictions_path))
}
