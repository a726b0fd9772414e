//! End-to-end patch scoring: frozen extractor followed by the trained head.

use crate::classifier::ClassifierHead;
use crate::config::DecisionRule;
use crate::error::{OcnnError, Result};
use crate::features::FeatureExtractor;
use crate::patch::Patch;

/// Patches scored per extractor call.
pub const SCORE_CHUNK: usize = 256;

/// A feature extractor composed with a classifier head.
#[derive(Debug)]
pub struct InferenceModel<E> {
    extractor: E,
    head: ClassifierHead,
}

impl<E: FeatureExtractor> InferenceModel<E> {
    /// Compose an extractor and a head.
    ///
    /// # Errors
    ///
    /// Returns an error if the extractor output width differs from the head
    /// input width.
    pub fn new(extractor: E, head: ClassifierHead) -> Result<Self> {
        if extractor.output_dim() != head.input_dim() {
            return Err(OcnnError::dimension_mismatch(
                format!("head input width {}", head.input_dim()),
                format!("extractor output width {}", extractor.output_dim()),
            ));
        }
        Ok(Self { extractor, head })
    }

    /// The feature extractor.
    #[must_use]
    pub fn extractor(&self) -> &E {
        &self.extractor
    }

    /// The classifier head.
    #[must_use]
    pub fn head(&self) -> &ClassifierHead {
        &self.head
    }

    /// Sigmoid score per patch; higher means more anomalous.
    ///
    /// # Errors
    ///
    /// Returns an error if feature extraction fails.
    pub fn score(&self, patches: &[Patch]) -> Result<Vec<f32>> {
        let mut scores = Vec::with_capacity(patches.len());
        for chunk in patches.chunks(SCORE_CHUNK) {
            let features = self.extractor.extract_batch(chunk)?;
            scores.extend(self.head.scores(&features)?);
        }
        Ok(scores)
    }

    /// Scores passed through a decision rule.
    ///
    /// # Errors
    ///
    /// Returns an error if scoring fails.
    pub fn predict(&self, patches: &[Patch], rule: DecisionRule) -> Result<Vec<f32>> {
        Ok(self
            .score(patches)?
            .into_iter()
            .map(|s| rule.apply(s))
            .collect())
    }
}
