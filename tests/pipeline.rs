//! End-to-end runs over a small synthetic carpet dataset.

#![allow(clippy::disallowed_methods)]

use image::{Rgb, RgbImage};
use ocnn_mvtec::config::{DecisionRule, ExperimentConfig, LabelPairing, TrainingMetric};
use ocnn_mvtec::experiment::{load_test_patches, Experiment};
use ocnn_mvtec::features::{BackboneLayer, ConvBackbone, FeatureExtractor};
use ocnn_mvtec::patch::Patch;
use ocnn_mvtec::persist::{load_head, HeadInfo};
use ocnn_mvtec::{OcnnError, Result};
use std::path::Path;
use tempfile::TempDir;

const SIZE: u32 = 64;

/// Per-channel mean and maximum of a patch.
struct ChannelStats;

impl FeatureExtractor for ChannelStats {
    fn output_dim(&self) -> usize {
        6
    }

    fn extract(&self, patch: &Patch) -> Result<Vec<f32>> {
        let mut sum = [0.0f32; 3];
        let mut max = [0.0f32; 3];
        for (i, &v) in patch.as_slice().iter().enumerate() {
            sum[i % 3] += v;
            max[i % 3] = max[i % 3].max(v);
        }
        let n = (patch.size() * patch.size()) as f32;
        Ok(vec![
            sum[0] / n,
            sum[1] / n,
            sum[2] / n,
            max[0],
            max[1],
            max[2],
        ])
    }
}

/// Textured carpet-like image with an optional bright square in the top-left block.
fn carpet(seed: u32, defect: bool) -> RgbImage {
    RgbImage::from_fn(SIZE, SIZE, |x, y| {
        if defect && x < 20 && y < 20 {
            return Rgb([250, 40, 40]);
        }
        let v = 90 + ((x * 7 + y * 13 + seed * 5) % 23) as u8;
        Rgb([v, v.saturating_sub(10), v.saturating_sub(20)])
    })
}

fn defect_mask() -> RgbImage {
    RgbImage::from_fn(SIZE, SIZE, |x, y| {
        if x < 20 && y < 20 {
            Rgb([255, 255, 255])
        } else {
            Rgb([0, 0, 0])
        }
    })
}

fn save(image: &RgbImage, path: &Path) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    image.save(path).unwrap();
}

/// Layout: `train/good`, `test/color` and `ground_truth/color`.
fn synthetic_dataset() -> (TempDir, ExperimentConfig) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    for i in 0..4 {
        save(&carpet(i, false), &root.join(format!("train/good/{i:03}.png")));
    }
    save(&carpet(10, true), &root.join("test/color/000.png"));
    save(&carpet(11, false), &root.join("test/color/001.png"));
    save(&carpet(12, true), &root.join("test/color/002.png"));
    save(&defect_mask(), &root.join("ground_truth/color/000_mask.png"));
    save(&defect_mask(), &root.join("ground_truth/color/002_mask.png"));

    let config = ExperimentConfig {
        name: "synthetic-carpet".to_string(),
        train_dir: root.join("train/good"),
        test_dir: root.join("test/color"),
        ground_truth_dir: root.join("ground_truth/color"),
        image_height: SIZE as usize,
        image_width: SIZE as usize,
        patch_size: 32,
        batch_size: 4,
        epochs: 2,
        noise_std: 0.1,
        learning_rate: 1e-3,
        decision: DecisionRule::RawScore,
        pairing: LabelPairing::ByFilename,
        metrics: vec![TrainingMetric::Accuracy, TrainingMetric::CrossEntropy],
        seed: Some(33),
        log_every: 1,
        output_dir: root.join("out"),
        render_plots: false,
        ..ExperimentConfig::carpet_raw_score()
    };
    (dir, config)
}

#[test]
fn test_run_writes_outputs() {
    let (_dir, config) = synthetic_dataset();
    let outcome = Experiment::new(config.clone(), ChannelStats)
        .unwrap()
        .run()
        .unwrap();

    // 3 test images × 4 blocks; the defect covers only the top-left block
    assert_eq!(outcome.report.patches, 12);
    assert_eq!(outcome.report.anomalous, 2);
    assert_eq!(outcome.report.normal, 10);
    assert!((0.0..=1.0).contains(&outcome.report.auc));
    assert_eq!(outcome.report.training.len(), 2);
    assert!(outcome.plot_paths.is_none());
    assert!(outcome.grid_paths.is_none());

    assert!(outcome.report_path.is_file());
    assert!(outcome.roc_path.is_file());
    assert!(outcome.head_path.is_file());
    assert!(outcome.report_path.starts_with(&config.output_dir));

    let csv = std::fs::read_to_string(&outcome.roc_path).unwrap();
    assert!(csv.starts_with("threshold,fpr,tpr\n"));
    assert_eq!(csv.lines().count(), outcome.curve.len() + 1);

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&outcome.report_path).unwrap()).unwrap();
    assert_eq!(json["experiment"], "synthetic-carpet");
    assert_eq!(json["patches"], 12);
    assert_eq!(json["training"].as_array().unwrap().len(), 2);
}

#[test]
fn test_saved_head_matches_trained_head() {
    let (_dir, config) = synthetic_dataset();
    let outcome = Experiment::new(config, ChannelStats).unwrap().run().unwrap();

    let loaded = load_head(&outcome.head_path).unwrap();
    assert_eq!(&loaded, outcome.model.head());
    assert_eq!(loaded.input_dim(), 6);

    let info = HeadInfo::from_path(&outcome.head_path).unwrap();
    assert_eq!(info.name(), Some("synthetic-carpet"));
}

#[test]
fn test_same_seed_same_report() {
    let (_dir, config) = synthetic_dataset();
    let first = Experiment::new(config.clone(), ChannelStats).unwrap().run().unwrap();
    let second = Experiment::new(config, ChannelStats).unwrap().run().unwrap();
    assert_eq!(first.curve, second.curve);
    assert_eq!(first.report.training, second.report.training);
}

#[test]
fn test_balanced_threshold_run_with_conv_backbone() {
    let (_dir, config) = synthetic_dataset();
    let config = ExperimentConfig {
        decision: DecisionRule::Threshold(0.5),
        balance_test_set: true,
        epochs: 1,
        ..config
    };
    let layers = [
        BackboneLayer::Conv3x3 { out_channels: 4 },
        BackboneLayer::MaxPool2x2,
        BackboneLayer::Conv3x3 { out_channels: 8 },
        BackboneLayer::MaxPool2x2,
    ];
    let backbone = ConvBackbone::random(&layers, 7).unwrap();
    assert_eq!(backbone.output_dim(), 8);

    let outcome = Experiment::new(config, backbone).unwrap().run().unwrap();
    // balancing keeps both anomalous patches and as many normal ones
    assert_eq!(outcome.report.patches, 4);
    assert_eq!(outcome.report.anomalous, 2);
    // hard predictions give at most one interior point
    assert!(outcome.curve.len() <= 3);
    assert!((0.0..=1.0).contains(&outcome.report.auc));
}

#[test]
fn test_plots_rendered_when_enabled() {
    let (_dir, config) = synthetic_dataset();
    let config = ExperimentConfig {
        render_plots: true,
        epochs: 1,
        ..config
    };
    let outcome = Experiment::new(config.clone(), ChannelStats)
        .unwrap()
        .run()
        .unwrap();

    let (roc, zoom) = outcome.plot_paths.unwrap();
    assert!(roc.is_file() && zoom.is_file());
    let (labels, predictions) = outcome.grid_paths.unwrap();
    assert!(labels.ends_with("patches_labels.svg"));
    assert!(predictions.ends_with("patches_pred.svg"));
    assert!(labels.starts_with(&config.output_dir));
    assert!(predictions.is_file());
}

#[test]
fn test_reloaded_patches_follow_balanced_indices() {
    let (_dir, config) = synthetic_dataset();
    // balancing 12 patches with anomalies at 0 and 8 drops the first 8 normals
    let indices = [0, 8, 10, 11];
    let patches = load_test_patches(&config, &indices).unwrap();
    assert_eq!(patches.len(), 4);
    // the defect square is bright red in the top-left block of images 0 and 2
    assert!(patches[0].as_slice()[0] > 0.9);
    assert!(patches[1].as_slice()[0] > 0.9);
    assert!(patches[2].as_slice()[0] < 0.9);

    assert!(load_test_patches(&config, &[12]).is_err());
}

#[test]
fn test_masks_without_defects_fail_evaluation() {
    let (dir, config) = synthetic_dataset();
    std::fs::remove_dir_all(dir.path().join("ground_truth")).unwrap();

    let result = Experiment::new(config, ChannelStats).unwrap().run();
    assert!(matches!(result, Err(OcnnError::Evaluation { .. })));
}

#[test]
fn test_empty_training_set() {
    let (dir, config) = synthetic_dataset();
    let train_dir = dir.path().join("train/good");
    std::fs::remove_dir_all(&train_dir).unwrap();
    std::fs::create_dir_all(&train_dir).unwrap();

    let result = Experiment::new(config, ChannelStats).unwrap().run();
    assert!(matches!(result, Err(OcnnError::EmptyDataset { .. })));
}
