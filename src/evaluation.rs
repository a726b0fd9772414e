//! ROC curve and AUC over patch-level labels and scores.
//!
//! Thresholds are the distinct scores in decreasing order, preceded by `+∞`
//! so the curve starts at `(0, 0)`. Points that lie on a straight segment
//! between their neighbours are dropped.

use crate::config::DecisionRule;
use crate::error::{OcnnError, Result};
use crate::labels::ANOMALOUS;
use crate::trainer::EpochSummary;
use serde::Serialize;
use std::fmt::Write as _;
use std::path::Path;

/// Receiver operating characteristic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RocCurve {
    /// False positive rates, non-decreasing from 0 to 1.
    pub fpr: Vec<f64>,
    /// True positive rates, non-decreasing from 0 to 1.
    pub tpr: Vec<f64>,
    /// Score thresholds; the first is `+∞`.
    pub thresholds: Vec<f64>,
}

impl RocCurve {
    /// Number of points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fpr.len()
    }

    /// True if the curve has no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fpr.is_empty()
    }

    /// Area under this curve.
    #[must_use]
    pub fn auc(&self) -> f64 {
        auc(&self.fpr, &self.tpr)
    }

    /// CSV rendering with a `threshold,fpr,tpr` header.
    #[must_use]
    pub fn to_csv(&self) -> String {
        let mut out = String::from("threshold,fpr,tpr\n");
        for ((t, f), p) in self.thresholds.iter().zip(&self.fpr).zip(&self.tpr) {
            // writing into a String cannot fail
            let _ = writeln!(out, "{t},{f},{p}");
        }
        out
    }

    /// Write [`RocCurve::to_csv`] to a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_csv())?;
        Ok(())
    }
}

/// Compute the ROC curve of `scores` against binary `labels`.
///
/// # Errors
///
/// Returns an error if the lengths differ, a score is NaN, or the labels
/// contain only one class.
pub fn roc_curve(labels: &[u8], scores: &[f32]) -> Result<RocCurve> {
    if labels.len() != scores.len() {
        return Err(OcnnError::label_alignment(format!(
            "{} labels but {} scores",
            labels.len(),
            scores.len()
        )));
    }
    if scores.iter().any(|s| s.is_nan()) {
        return Err(OcnnError::evaluation("scores contain NaN"));
    }
    let positives = labels.iter().filter(|&&l| l == ANOMALOUS).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return Err(OcnnError::evaluation(format!(
            "ROC needs both classes, got {positives} anomalous and {negatives} normal"
        )));
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    // cumulative counts at the last index of every distinct score
    let mut tps = Vec::new();
    let mut fps = Vec::new();
    let mut thresholds = Vec::new();
    let mut tp = 0usize;
    for (rank, &idx) in order.iter().enumerate() {
        if labels[idx] == ANOMALOUS {
            tp += 1;
        }
        let last_of_run = order
            .get(rank + 1)
            .map_or(true, |&next| scores[next] != scores[idx]);
        if last_of_run {
            tps.push(tp);
            fps.push(rank + 1 - tp);
            thresholds.push(f64::from(scores[idx]));
        }
    }

    let keep = collinear_mask(&fps, &tps);
    let mut curve = RocCurve {
        fpr: vec![0.0],
        tpr: vec![0.0],
        thresholds: vec![f64::INFINITY],
    };
    for (i, keep) in keep.into_iter().enumerate() {
        if keep {
            curve.fpr.push(fps[i] as f64 / negatives as f64);
            curve.tpr.push(tps[i] as f64 / positives as f64);
            curve.thresholds.push(thresholds[i]);
        }
    }
    Ok(curve)
}

/// Keep endpoints and every point where either series bends.
fn collinear_mask(fps: &[usize], tps: &[usize]) -> Vec<bool> {
    let n = fps.len();
    if n <= 2 {
        return vec![true; n];
    }
    let bends = |v: &[usize], i: usize| {
        // second difference != 0
        v[i - 1] + v[i + 1] != 2 * v[i]
    };
    (0..n)
        .map(|i| i == 0 || i == n - 1 || bends(fps, i) || bends(tps, i))
        .collect()
}

/// Area under a curve by the trapezoidal rule.
///
/// Returns `0.0` for fewer than two points.
#[must_use]
pub fn auc(x: &[f64], y: &[f64]) -> f64 {
    x.windows(2)
        .zip(y.windows(2))
        .map(|(xs, ys)| (xs[1] - xs[0]) * (ys[1] + ys[0]) / 2.0)
        .sum()
}

/// Summary written at the end of a run.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    /// Experiment name
    pub experiment: String,
    /// Area under the ROC curve
    pub auc: f64,
    /// Evaluated test patches
    pub patches: usize,
    /// Anomalous test patches
    pub anomalous: usize,
    /// Normal test patches
    pub normal: usize,
    /// Rule applied to scores before the ROC
    pub decision: DecisionRule,
    /// Points on the ROC curve
    pub roc_points: usize,
    /// Per-epoch training summaries
    pub training: Vec<EpochSummary>,
}

impl EvaluationReport {
    /// Build a report from labels, the curve and training history.
    #[must_use]
    pub fn new(
        experiment: impl Into<String>,
        labels: &[u8],
        curve: &RocCurve,
        decision: DecisionRule,
        training: Vec<EpochSummary>,
    ) -> Self {
        let anomalous = labels.iter().filter(|&&l| l == ANOMALOUS).count();
        Self {
            experiment: experiment.into(),
            auc: curve.auc(),
            patches: labels.len(),
            anomalous,
            normal: labels.len() - anomalous,
            decision,
            roc_points: curve.len(),
            training,
        }
    }

    /// Pretty JSON rendering.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the JSON report to a file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json_pretty()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_example() {
        // labels [0, 0, 1, 1], scores [0.1, 0.4, 0.35, 0.8]
        let curve = roc_curve(&[0, 0, 1, 1], &[0.1, 0.4, 0.35, 0.8]).unwrap();
        assert_eq!(curve.fpr, vec![0.0, 0.0, 0.5, 0.5, 1.0]);
        assert_eq!(curve.tpr, vec![0.0, 0.5, 0.5, 1.0, 1.0]);
        assert!(curve.thresholds[0].is_infinite());
        assert!((curve.thresholds[1] - 0.8).abs() < 1e-6);
        assert!((curve.thresholds[4] - 0.1).abs() < 1e-6);
        assert!((curve.auc() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_collinear_points_dropped() {
        let curve = roc_curve(&[1, 1, 1, 0, 0], &[0.9, 0.8, 0.7, 0.1, 0.2]).unwrap();
        assert_eq!(curve.fpr, vec![0.0, 0.0, 0.0, 1.0]);
        assert_eq!(curve.tpr, vec![0.0, 1.0 / 3.0, 1.0, 1.0]);
        assert_eq!(curve.auc(), 1.0);
    }

    #[test]
    fn test_ties_share_a_threshold() {
        let curve = roc_curve(&[0, 1, 0, 1], &[0.5, 0.5, 0.5, 0.5]).unwrap();
        assert_eq!(curve.fpr, vec![0.0, 1.0]);
        assert_eq!(curve.tpr, vec![0.0, 1.0]);
        assert!((curve.auc() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_hard_predictions() {
        // thresholded 0/1 predictions give a three-point curve
        let curve = roc_curve(&[0, 0, 1, 1], &[0.0, 1.0, 1.0, 1.0]).unwrap();
        assert_eq!(curve.fpr, vec![0.0, 0.5, 1.0]);
        assert_eq!(curve.tpr, vec![0.0, 1.0, 1.0]);
        assert!((curve.auc() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_inverted_scores() {
        let curve = roc_curve(&[1, 1, 0, 0], &[0.1, 0.2, 0.8, 0.9]).unwrap();
        assert_eq!(curve.auc(), 0.0);
    }

    #[test]
    fn test_degenerate_labels_rejected() {
        assert!(matches!(
            roc_curve(&[0, 0, 0], &[0.1, 0.2, 0.3]),
            Err(OcnnError::Evaluation { .. })
        ));
        assert!(matches!(
            roc_curve(&[1, 1], &[0.1, 0.2]),
            Err(OcnnError::Evaluation { .. })
        ));
    }

    #[test]
    fn test_length_and_nan_checks() {
        assert!(matches!(
            roc_curve(&[0, 1], &[0.1]),
            Err(OcnnError::LabelAlignment { .. })
        ));
        assert!(roc_curve(&[0, 1], &[0.1, f32::NAN]).is_err());
    }

    #[test]
    fn test_auc_trapezoid() {
        assert_eq!(auc(&[0.0, 1.0], &[0.0, 1.0]), 0.5);
        assert_eq!(auc(&[0.0, 0.5, 1.0], &[0.5, 0.5, 1.0]), 0.25 + 0.375);
        assert_eq!(auc(&[0.0], &[1.0]), 0.0);
    }

    #[test]
    fn test_csv_rendering() {
        let curve = roc_curve(&[0, 1], &[0.25, 0.75]).unwrap();
        let csv = curve.to_csv();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "threshold,fpr,tpr");
        assert_eq!(lines[1], "inf,0,0");
        assert_eq!(lines.len(), 1 + curve.len());
    }

    #[test]
    fn test_report_counts() {
        let labels = [0, 1, 0, 0];
        let curve = roc_curve(&labels, &[0.1, 0.9, 0.2, 0.3]).unwrap();
        let report = EvaluationReport::new("unit", &labels, &curve, DecisionRule::RawScore, vec![]);
        assert_eq!(report.patches, 4);
        assert_eq!(report.anomalous, 1);
        assert_eq!(report.normal, 3);
        assert_eq!(report.auc, 1.0);

        let json = report.to_json_pretty().unwrap();
        assert!(json.contains("\"experiment\": \"unit\""));
        assert!(json.contains("\"kind\": \"raw_score\""));
    }
}
