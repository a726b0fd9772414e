//! Streaming training metrics.
//!
//! Every metric moves through `Reset -> Accumulating -> Read -> Reset`.
//! A freshly reset metric reports `0.0`.

use crate::config::TrainingMetric;
use std::collections::BTreeMap;

/// Where a metric is in its epoch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricPhase {
    /// No batch seen since the last reset.
    Reset,
    /// At least one batch accumulated.
    Accumulating,
    /// Result reported; the next step is a reset.
    Read,
}

/// Fraction of predictions `p > 0.5` that match the label.
#[derive(Debug, Clone)]
pub struct BinaryAccuracy {
    correct: u64,
    total: u64,
    phase: MetricPhase,
}

impl Default for BinaryAccuracy {
    fn default() -> Self {
        Self::new()
    }
}

impl BinaryAccuracy {
    /// Decision threshold on the sigmoid output.
    pub const THRESHOLD: f32 = 0.5;

    /// Create a reset metric.
    #[must_use]
    pub fn new() -> Self {
        Self {
            correct: 0,
            total: 0,
            phase: MetricPhase::Reset,
        }
    }

    /// Accumulate one batch of probabilities and labels.
    pub fn update(&mut self, probabilities: &[f32], labels: &[f32]) {
        for (&p, &y) in probabilities.iter().zip(labels) {
            let predicted = if p > Self::THRESHOLD { 1.0 } else { 0.0 };
            if predicted == y {
                self.correct += 1;
            }
            self.total += 1;
        }
        self.phase = MetricPhase::Accumulating;
    }

    /// Current value without changing phase.
    #[must_use]
    pub fn result(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }

    /// Report the value and mark the metric as read.
    pub fn read(&mut self) -> f64 {
        self.phase = MetricPhase::Read;
        self.result()
    }

    /// Clear accumulated state.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> MetricPhase {
        self.phase
    }
}

/// Mean binary cross-entropy with probabilities clipped to `[ε, 1 - ε]`.
#[derive(Debug, Clone)]
pub struct BinaryCrossEntropy {
    sum: f64,
    count: u64,
    phase: MetricPhase,
}

impl Default for BinaryCrossEntropy {
    fn default() -> Self {
        Self::new()
    }
}

impl BinaryCrossEntropy {
    /// Probability clipping bound.
    pub const EPSILON: f32 = 1e-7;

    /// Create a reset metric.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sum: 0.0,
            count: 0,
            phase: MetricPhase::Reset,
        }
    }

    /// Accumulate one batch.
    pub fn update(&mut self, probabilities: &[f32], labels: &[f32]) {
        for (&p, &y) in probabilities.iter().zip(labels) {
            let p = f64::from(p.clamp(Self::EPSILON, 1.0 - Self::EPSILON));
            let y = f64::from(y);
            self.sum += -(y * p.ln() + (1.0 - y) * (1.0 - p).ln());
            self.count += 1;
        }
        self.phase = MetricPhase::Accumulating;
    }

    /// Current mean without changing phase.
    #[must_use]
    pub fn result(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Report the value and mark the metric as read.
    pub fn read(&mut self) -> f64 {
        self.phase = MetricPhase::Read;
        self.result()
    }

    /// Clear accumulated state.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> MetricPhase {
        self.phase
    }
}

/// A configured metric instance.
#[derive(Debug, Clone)]
pub enum Metric {
    /// Binary accuracy
    Accuracy(BinaryAccuracy),
    /// Binary cross-entropy
    CrossEntropy(BinaryCrossEntropy),
}

impl Metric {
    fn from_kind(kind: TrainingMetric) -> Self {
        match kind {
            TrainingMetric::Accuracy => Self::Accuracy(BinaryAccuracy::new()),
            TrainingMetric::CrossEntropy => Self::CrossEntropy(BinaryCrossEntropy::new()),
        }
    }

    /// Report name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Accuracy(_) => "accuracy",
            Self::CrossEntropy(_) => "binary_crossentropy",
        }
    }

    fn update(&mut self, probabilities: &[f32], labels: &[f32]) {
        match self {
            Self::Accuracy(m) => m.update(probabilities, labels),
            Self::CrossEntropy(m) => m.update(probabilities, labels),
        }
    }

    fn result(&self) -> f64 {
        match self {
            Self::Accuracy(m) => m.result(),
            Self::CrossEntropy(m) => m.result(),
        }
    }

    fn read(&mut self) -> f64 {
        match self {
            Self::Accuracy(m) => m.read(),
            Self::CrossEntropy(m) => m.read(),
        }
    }

    fn reset(&mut self) {
        match self {
            Self::Accuracy(m) => m.reset(),
            Self::CrossEntropy(m) => m.reset(),
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> MetricPhase {
        match self {
            Self::Accuracy(m) => m.phase(),
            Self::CrossEntropy(m) => m.phase(),
        }
    }
}

/// The metrics tracked during training, updated together.
#[derive(Debug, Clone, Default)]
pub struct MetricSet {
    metrics: Vec<Metric>,
}

impl MetricSet {
    /// Build from configured kinds; duplicates are kept once.
    #[must_use]
    pub fn from_config(kinds: &[TrainingMetric]) -> Self {
        let mut metrics: Vec<Metric> = Vec::with_capacity(kinds.len());
        for &kind in kinds {
            let metric = Metric::from_kind(kind);
            if metrics.iter().all(|m| m.name() != metric.name()) {
                metrics.push(metric);
            }
        }
        Self { metrics }
    }

    /// Tracked metrics.
    #[must_use]
    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    /// Update every metric with one batch.
    pub fn update(&mut self, probabilities: &[f32], labels: &[f32]) {
        for metric in &mut self.metrics {
            metric.update(probabilities, labels);
        }
    }

    /// Current values without changing phase.
    #[must_use]
    pub fn results(&self) -> BTreeMap<String, f64> {
        self.metrics
            .iter()
            .map(|m| (m.name().to_string(), m.result()))
            .collect()
    }

    /// Report every value and mark each metric as read.
    pub fn read(&mut self) -> BTreeMap<String, f64> {
        self.metrics
            .iter_mut()
            .map(|m| (m.name().to_string(), m.read()))
            .collect()
    }

    /// Reset every metric.
    pub fn reset(&mut self) {
        for metric in &mut self.metrics {
            metric.reset();
        }
    }
}
