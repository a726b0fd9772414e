//! Experiment orchestration.
//!
//! [`Experiment::run`] threads one [`ExperimentConfig`] through the whole
//! pipeline:
//!
//! 1. list and load the normal training images, cut patches and extract
//!    features image by image;
//! 2. train the head against Gaussian pseudo-negatives;
//! 3. pair test images with masks and label every patch;
//! 4. score the test patches and apply the decision rule;
//! 5. compute the ROC curve and write reports, plots and the trained head;
//!    with plots enabled, the first 256 test patches are drawn twice, marked
//!    by ground truth and by prediction.
//!
//! [`ExperimentContext`] carries the run's seeded RNG, its output directory,
//! wall-clock timing and the scalar metrics reported at the end.

use crate::classifier::ClassifierHead;
use crate::config::{ExperimentConfig, LabelPairing};
use crate::dataset::{list_png_files, load_image, load_mask, pair_test_with_masks};
use crate::error::{OcnnError, Result};
use crate::evaluation::{roc_curve, EvaluationReport, RocCurve};
use crate::features::{ConvBackbone, FeatureExtractor, InputNormalization};
use crate::inference::InferenceModel;
use crate::labels::{balance_normal_patches, patch_labels, ANOMALOUS};
use crate::patch::{image_patches, Patch, PatchGrid};
use crate::persist::{save_head, HEAD_FILE};
use crate::plot::{render_patch_grids, render_roc_pair, GRID_PATCHES};
use crate::trainer::{EpochSummary, Trainer};
use crate::weights::WeightStore;
use aprender::primitives::Matrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Report file written into the output directory.
pub const REPORT_FILE: &str = "report.json";

/// ROC points file written into the output directory.
pub const ROC_FILE: &str = "roc.csv";

/// A scalar recorded during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    /// Integer metric (e.g., patch count)
    Int(i64),
    /// Float metric (e.g., AUC)
    Float(f64),
    /// Duration metric
    Duration(Duration),
    /// String metric
    String(String),
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v:.4}"),
            Self::Duration(d) => write!(f, "{:.2}ms", d.as_secs_f64() * 1000.0),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

/// Per-run state: seeded RNG, output directory, timing and metrics.
#[derive(Debug)]
pub struct ExperimentContext {
    name: String,
    output_dir: PathBuf,
    seed: u64,
    rng: StdRng,
    start_time: Instant,
    metrics: BTreeMap<String, MetricValue>,
}

impl ExperimentContext {
    /// Create the context and its output directory.
    ///
    /// The RNG uses the configured seed, or a BLAKE3 hash of the experiment
    /// name when none is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the output directory cannot be created.
    pub fn new(config: &ExperimentConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.output_dir)?;
        let seed = config
            .seed
            .unwrap_or_else(|| hash_name_to_seed(&config.name));
        Ok(Self {
            name: config.name.clone(),
            output_dir: config.output_dir.clone(),
            seed,
            rng: StdRng::seed_from_u64(seed),
            start_time: Instant::now(),
            metrics: BTreeMap::new(),
        })
    }

    /// Path of a file inside the output directory.
    #[must_use]
    pub fn path(&self, filename: &str) -> PathBuf {
        self.output_dir.join(filename)
    }

    /// Output directory.
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Experiment name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Seed the RNG started from.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// The run's deterministic RNG.
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Elapsed time since the context was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Record an integer metric.
    pub fn record_metric(&mut self, name: &str, value: i64) {
        self.metrics.insert(name.to_string(), MetricValue::Int(value));
    }

    /// Record a float metric.
    pub fn record_float_metric(&mut self, name: &str, value: f64) {
        self.metrics
            .insert(name.to_string(), MetricValue::Float(value));
    }

    /// Record a duration metric.
    pub fn record_duration(&mut self, name: &str, duration: Duration) {
        self.metrics
            .insert(name.to_string(), MetricValue::Duration(duration));
    }

    /// Record a string metric.
    pub fn record_string_metric(&mut self, name: &str, value: impl Into<String>) {
        self.metrics
            .insert(name.to_string(), MetricValue::String(value.into()));
    }

    /// Get a recorded metric.
    #[must_use]
    pub fn get_metric(&self, name: &str) -> Option<&MetricValue> {
        self.metrics.get(name)
    }

    /// Log the elapsed time and every recorded metric.
    pub fn report(&self) {
        info!(
            experiment = %self.name,
            elapsed_ms = self.elapsed().as_secs_f64() * 1000.0,
            "run finished"
        );
        for (name, value) in &self.metrics {
            info!(metric = %name, value = %value, "run metric");
        }
    }
}

/// Hash an experiment name to a deterministic u64 seed.
#[must_use]
pub fn hash_name_to_seed(name: &str) -> u64 {
    let hash = blake3::hash(name.as_bytes());
    let bytes = hash.as_bytes();
    u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

/// Build the configured VGG16 backbone from its SafeTensors weights.
///
/// # Errors
///
/// Returns an error if no weights file is configured or it cannot be
/// loaded.
pub fn backbone_from_config(config: &ExperimentConfig) -> Result<ConvBackbone> {
    let path = config.backbone_weights.as_ref().ok_or_else(|| {
        OcnnError::invalid_config("backbone_weights must point to a VGG16 safetensors file")
    })?;
    let store = WeightStore::from_safetensors_file(path)?;
    info!(
        path = %path.display(),
        tensors = store.tensor_count(),
        parameters = store.total_parameters(),
        "loaded backbone weights"
    );
    Ok(ConvBackbone::vgg16(&store)?.with_normalization(normalization(config)))
}

/// Input normalization selected by the configuration.
#[must_use]
pub fn normalization(config: &ExperimentConfig) -> InputNormalization {
    if config.imagenet_normalize {
        InputNormalization::ImageNet
    } else {
        InputNormalization::Identity
    }
}

/// Labelled test-set scores.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestScores {
    /// Patch labels in evaluation order.
    pub labels: Vec<u8>,
    /// Decision-rule outputs aligned with `labels`.
    pub predictions: Vec<f32>,
    /// Position of each patch in the unbalanced test stream.
    pub indices: Vec<usize>,
}

/// Everything a finished run produced.
#[derive(Debug)]
pub struct ExperimentOutcome<E> {
    /// Trained model.
    pub model: InferenceModel<E>,
    /// ROC curve over the test patches.
    pub curve: RocCurve,
    /// Summary report.
    pub report: EvaluationReport,
    /// Saved head.
    pub head_path: PathBuf,
    /// Written JSON report.
    pub report_path: PathBuf,
    /// Written ROC points.
    pub roc_path: PathBuf,
    /// Full and zoomed plots, when rendered.
    pub plot_paths: Option<(PathBuf, PathBuf)>,
    /// Ground-truth and prediction patch grids, when rendered.
    pub grid_paths: Option<(PathBuf, PathBuf)>,
}

/// One configured run over one feature extractor.
#[derive(Debug)]
pub struct Experiment<E> {
    config: ExperimentConfig,
    extractor: E,
}

impl<E: FeatureExtractor> Experiment<E> {
    /// Validate the configuration and bind an extractor.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: ExperimentConfig, extractor: E) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, extractor })
    }

    /// The run configuration.
    #[must_use]
    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    fn grid(&self) -> Result<PatchGrid> {
        PatchGrid::new(
            self.config.image_height,
            self.config.image_width,
            self.config.patch_size,
        )
    }

    /// Feature matrix of every training patch, one row per patch.
    ///
    /// # Errors
    ///
    /// Returns an error if the training directory is missing or empty, or
    /// an image cannot be decoded.
    pub fn train_features(&self) -> Result<Matrix<f32>> {
        let files = list_png_files(&self.config.train_dir)?;
        if files.is_empty() {
            return Err(OcnnError::EmptyDataset {
                path: self.config.train_dir.clone(),
            });
        }
        let grid = self.grid()?;
        let dim = self.extractor.output_dim();

        let mut data = Vec::with_capacity(files.len() * grid.patches_per_image() * dim);
        for path in &files {
            let image = load_image(path, self.config.image_height, self.config.image_width)?;
            let patches = image_patches(&image, &grid)?;
            let features = self.extractor.extract_batch(&patches)?;
            data.extend_from_slice(features.as_slice());
        }
        let rows = data.len() / dim;
        info!(images = files.len(), patches = rows, dim, "extracted training features");
        Matrix::from_vec(rows, dim, data).map_err(|e| OcnnError::Aprender(e.to_string()))
    }

    /// Train a head on the training features.
    ///
    /// # Errors
    ///
    /// Returns an error if feature extraction or training fails.
    pub fn train(&self, ctx: &mut ExperimentContext) -> Result<(ClassifierHead, Vec<EpochSummary>)> {
        let features = self.train_features()?;
        ctx.record_metric("train_patches", features.n_rows() as i64);

        let rng = StdRng::seed_from_u64(ctx.rng().gen());
        let mut trainer = Trainer::new(&self.config, self.extractor.output_dim(), rng)?;
        let history = trainer.train(&features)?;
        ctx.record_metric("optimizer_steps", i64::from(trainer.steps()));
        Ok((trainer.into_head(), history))
    }

    fn mask_files(&self) -> Result<Vec<PathBuf>> {
        let dir = &self.config.ground_truth_dir;
        if !dir.is_dir() && self.config.pairing == LabelPairing::ByFilename {
            warn!(dir = %dir.display(), "no ground-truth directory, every test patch is normal");
            return Ok(Vec::new());
        }
        list_png_files(dir)
    }
}

/// Score and label every test patch image by image.
///
/// # Errors
///
/// Returns an error if the test set cannot be read, paired or scored.
pub fn score_test_set<E: FeatureExtractor>(
    config: &ExperimentConfig,
    model: &InferenceModel<E>,
    mask_files: &[PathBuf],
) -> Result<TestScores> {
    let test_files = list_png_files(&config.test_dir)?;
    if test_files.is_empty() {
        return Err(OcnnError::EmptyDataset {
            path: config.test_dir.clone(),
        });
    }
    let samples = pair_test_with_masks(&test_files, mask_files, config.pairing, &config.mask_suffix)?;
    let grid = PatchGrid::new(config.image_height, config.image_width, config.patch_size)?;

    let mut scores = TestScores::default();
    for sample in &samples {
        let image = load_image(&sample.image_path, config.image_height, config.image_width)?;
        let mask = load_mask(sample, config.image_height, config.image_width)?;

        let patches = image_patches(&image, &grid)?;
        let mask_patches = image_patches(&mask, &grid)?;
        scores.labels.extend(patch_labels(&mask_patches));
        scores
            .predictions
            .extend(model.predict(&patches, config.decision)?);
    }

    scores.indices = (0..scores.labels.len()).collect();

    if config.balance_test_set {
        let items: Vec<(f32, usize)> = scores.predictions.into_iter().zip(scores.indices).collect();
        let (kept, labels) = balance_normal_patches(items, scores.labels)?;
        let (predictions, indices) = kept.into_iter().unzip();
        scores = TestScores {
            labels,
            predictions,
            indices,
        };
    }
    info!(
        images = samples.len(),
        patches = scores.labels.len(),
        anomalous = scores.labels.iter().filter(|&&l| l == ANOMALOUS).count(),
        "scored test set"
    );
    Ok(scores)
}

/// Reload the test patches at increasing stream positions `indices`.
///
/// # Errors
///
/// Returns an error if an index lies beyond the test images or an image
/// cannot be loaded.
pub fn load_test_patches(config: &ExperimentConfig, indices: &[usize]) -> Result<Vec<Patch>> {
    let test_files = list_png_files(&config.test_dir)?;
    let grid = PatchGrid::new(config.image_height, config.image_width, config.patch_size)?;
    let per_image = grid.patches_per_image();

    let mut current: Option<(usize, Vec<Patch>)> = None;
    let mut patches = Vec::with_capacity(indices.len());
    for &index in indices {
        let image_index = index / per_image;
        if current.as_ref().map(|(i, _)| *i) != Some(image_index) {
            let path = test_files.get(image_index).ok_or_else(|| {
                OcnnError::label_alignment(format!(
                    "patch {index} lies beyond {} test images",
                    test_files.len()
                ))
            })?;
            let image = load_image(path, config.image_height, config.image_width)?;
            current = Some((image_index, image_patches(&image, &grid)?));
        }
        if let Some((_, image)) = &current {
            patches.push(image[index % per_image].clone());
        }
    }
    Ok(patches)
}

fn render_grids(
    config: &ExperimentConfig,
    scores: &TestScores,
    ctx: &ExperimentContext,
) -> Result<(PathBuf, PathBuf)> {
    let count = scores.indices.len().min(GRID_PATCHES);
    let patches = load_test_patches(config, &scores.indices[..count])?;
    render_patch_grids(
        &patches,
        &scores.labels[..count],
        &scores.predictions[..count],
        &config.name,
        ctx.output_dir(),
    )
}

impl<E: FeatureExtractor> Experiment<E> {
    /// Run the full pipeline and write every output.
    ///
    /// # Errors
    ///
    /// Returns the first error from loading, training, scoring, evaluation
    /// or writing outputs. Plot rendering failures are logged and skipped.
    pub fn run(self) -> Result<ExperimentOutcome<E>> {
        let mut ctx = ExperimentContext::new(&self.config)?;
        info!(experiment = %ctx.name(), seed = ctx.seed(), "starting run");

        let (head, history) = self.train(&mut ctx)?;
        let mask_files = self.mask_files()?;
        let Self { config, extractor } = self;
        let model = InferenceModel::new(extractor, head)?;

        let scores = score_test_set(&config, &model, &mask_files)?;
        let curve = roc_curve(&scores.labels, &scores.predictions)?;
        let report = EvaluationReport::new(
            config.name.clone(),
            &scores.labels,
            &curve,
            config.decision,
            history,
        );
        info!(auc = report.auc, points = curve.len(), "ROC computed");

        let report_path = ctx.path(REPORT_FILE);
        report.write_json(&report_path)?;
        let roc_path = ctx.path(ROC_FILE);
        curve.write_csv(&roc_path)?;
        let head_path = ctx.path(HEAD_FILE);
        save_head(model.head(), &config.name, &head_path)?;

        let plot_paths = if config.render_plots {
            match render_roc_pair(&curve, &config.name, ctx.output_dir()) {
                Ok(paths) => Some(paths),
                Err(e) => {
                    warn!(error = %e, "skipping ROC plots");
                    None
                }
            }
        } else {
            None
        };
        let grid_paths = if config.render_plots {
            match render_grids(&config, &scores, &ctx) {
                Ok(paths) => Some(paths),
                Err(e) => {
                    warn!(error = %e, "skipping patch grids");
                    None
                }
            }
        } else {
            None
        };

        ctx.record_metric("test_patches", report.patches as i64);
        ctx.record_metric("anomalous_patches", report.anomalous as i64);
        ctx.record_float_metric("auc", report.auc);
        ctx.record_duration("wall_time", ctx.elapsed());
        ctx.record_string_metric("output_dir", ctx.output_dir().display().to_string());
        ctx.report();

        Ok(ExperimentOutcome {
            model,
            curve,
            report,
            head_path,
            report_path,
            roc_path,
            plot_paths,
            grid_paths,
        })
    }
}
