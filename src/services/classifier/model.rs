// Model-Backed Classifier
// Pluggable backend contract (inference, one training step, artifact export)
// and the default multinomial logistic regression over hashed n-grams

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::features::FeatureVector;
use super::rules::RuleClassifier;
use super::{ClassifierError, ParagraphScorer, Score, ScoringContext};
use crate::models::Role;

/// Share of an input's feature buckets that must have been seen in training
/// before the model's prediction is trusted over the rules.
const MIN_COVERAGE: f64 = 0.5;

/// One labeled example, featurized through the shared normalization
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingExample {
    pub features: FeatureVector,
    /// Index into `Role::LABELS`
    pub label: usize,
}

impl TrainingExample {
    /// `None` for roles the model does not predict (Unclassified)
    pub fn from_text(text: &str, role: Role, dim: usize) -> Option<Self> {
        role.label_index().map(|label| Self {
            features: FeatureVector::from_text(text, dim),
            label,
        })
    }
}

/// Inference and training primitives supplied by a model implementation.
/// `predict` returns one probability per entry of `Role::LABELS`.
pub trait ModelBackend: Send + Sync {
    fn feature_dim(&self) -> usize;

    fn predict(&self, features: &FeatureVector) -> Result<Vec<f64>, ClassifierError>;

    /// Whether the input resembles what the model was trained on
    fn covers(&self, features: &FeatureVector) -> bool;

    /// Run one incremental update; returns the mean loss over the batch
    fn train_step(&mut self, batch: &[TrainingExample]) -> Result<f64, ClassifierError>;

    fn export(&self) -> Result<serde_json::Value, ClassifierError>;
}

/// Creates backends from scratch or from a checkpoint artifact
pub trait BackendFactory: Send + Sync {
    fn fresh(&self) -> Box<dyn ModelBackend>;

    fn restore(&self, artifact: &serde_json::Value) -> Result<Box<dyn ModelBackend>, ClassifierError>;
}

/// A backend restored from a specific checkpoint version
pub struct LoadedModel {
    pub version: u64,
    pub backend: Box<dyn ModelBackend>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinearBackend {
    feature_dim: usize,
    learning_rate: f64,
    /// One weight row per label
    weights: Vec<Vec<f64>>,
    bias: Vec<f64>,
    /// Feature buckets observed during training
    seen: BTreeSet<usize>,
    steps: u64,
}

impl LinearBackend {
    pub fn new(feature_dim: usize, learning_rate: f64) -> Self {
        let labels = Role::LABELS.len();
        Self {
            feature_dim,
            learning_rate,
            weights: vec![vec![0.0; feature_dim]; labels],
            bias: vec![0.0; labels],
            seen: BTreeSet::new(),
            steps: 0,
        }
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    fn probabilities(&self, features: &FeatureVector) -> Vec<f64> {
        let logits: Vec<f64> = self
            .weights
            .iter()
            .zip(&self.bias)
            .map(|(row, b)| b + features.dot(row))
            .collect();
        softmax(&logits)
    }

    fn check_dim(&self, features: &FeatureVector) -> Result<(), ClassifierError> {
        if features.dim != self.feature_dim {
            return Err(ClassifierError::Backend(format!(
                "feature dimension {} does not match model dimension {}",
                features.dim, self.feature_dim
            )));
        }
        Ok(())
    }
}

fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

impl ModelBackend for LinearBackend {
    fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    fn predict(&self, features: &FeatureVector) -> Result<Vec<f64>, ClassifierError> {
        self.check_dim(features)?;
        Ok(self.probabilities(features))
    }

    fn covers(&self, features: &FeatureVector) -> bool {
        if features.is_empty() || self.seen.is_empty() {
            return false;
        }
        let known = features.buckets().filter(|b| self.seen.contains(b)).count();
        known as f64 / features.entries.len() as f64 >= MIN_COVERAGE
    }

    fn train_step(&mut self, batch: &[TrainingExample]) -> Result<f64, ClassifierError> {
        if batch.is_empty() {
            return Ok(0.0);
        }

        let mut total_loss = 0.0;
        for example in batch {
            self.check_dim(&example.features)?;
            if example.label >= self.bias.len() {
                return Err(ClassifierError::Backend(format!(
                    "label index {} out of range",
                    example.label
                )));
            }

            let probs = self.probabilities(&example.features);
            total_loss -= probs[example.label].max(1e-12).ln();

            for (k, p) in probs.iter().enumerate() {
                let grad = p - if k == example.label { 1.0 } else { 0.0 };
                self.bias[k] -= self.learning_rate * grad;
                for (bucket, value) in &example.features.entries {
                    self.weights[k][*bucket] -= self.learning_rate * grad * value;
                }
            }
            self.seen.extend(example.features.buckets());
        }
        self.steps += 1;

        let loss = total_loss / batch.len() as f64;
        if !loss.is_finite() {
            return Err(ClassifierError::Backend("training diverged".to_string()));
        }
        Ok(loss)
    }

    fn export(&self) -> Result<serde_json::Value, ClassifierError> {
        serde_json::to_value(self).map_err(|e| ClassifierError::Backend(e.to_string()))
    }
}

pub struct LinearFactory {
    feature_dim: usize,
    learning_rate: f64,
}

impl LinearFactory {
    pub fn new(feature_dim: usize, learning_rate: f64) -> Self {
        Self {
            feature_dim: feature_dim.max(1),
            learning_rate,
        }
    }
}

impl BackendFactory for LinearFactory {
    fn fresh(&self) -> Box<dyn ModelBackend> {
        Box::new(LinearBackend::new(self.feature_dim, self.learning_rate))
    }

    fn restore(&self, artifact: &serde_json::Value) -> Result<Box<dyn ModelBackend>, ClassifierError> {
        let mut backend: LinearBackend = serde_json::from_value(artifact.clone())
            .map_err(|e| ClassifierError::Backend(format!("invalid artifact: {}", e)))?;

        let labels = Role::LABELS.len();
        let shape_ok = backend.feature_dim == self.feature_dim
            && backend.bias.len() == labels
            && backend.weights.len() == labels
            && backend.weights.iter().all(|row| row.len() == self.feature_dim);
        if !shape_ok {
            return Err(ClassifierError::Backend(format!(
                "artifact shape does not match feature dimension {}",
                self.feature_dim
            )));
        }

        backend.learning_rate = self.learning_rate;
        Ok(Box::new(backend))
    }
}

/// Scores with the model, deferring to the rules for inputs the model has
/// not seen enough of
pub struct ModelClassifier {
    version: u64,
    backend: Box<dyn ModelBackend>,
    rules: RuleClassifier,
}

impl ModelClassifier {
    pub fn new(model: LoadedModel, rules: RuleClassifier) -> Self {
        Self {
            version: model.version,
            backend: model.backend,
            rules,
        }
    }
}

impl ParagraphScorer for ModelClassifier {
    fn name(&self) -> &'static str {
        "model"
    }

    fn version(&self) -> Option<u64> {
        Some(self.version)
    }

    fn score(&self, text: &str, ctx: &ScoringContext<'_>) -> Result<Score, ClassifierError> {
        let features = FeatureVector::from_text(text, self.backend.feature_dim());
        if !self.backend.covers(&features) {
            debug!(index = ctx.index, "[model] out of distribution, using rules");
            return self.rules.score(text, ctx);
        }

        let probs = self.backend.predict(&features)?;
        let (best, confidence) = probs
            .iter()
            .copied()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |acc, (i, p)| if p > acc.1 { (i, p) } else { acc });
        let role = Role::LABELS
            .get(best)
            .copied()
            .ok_or_else(|| ClassifierError::Backend("empty prediction".to_string()))?;

        Ok(Score::new(role, confidence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIM: usize = 4096;

    fn examples() -> Vec<TrainingExample> {
        [
            ("What is venue?", Role::Question),
            ("What is jurisdiction?", Role::Question),
            ("Define negligence in tort law?", Role::Question),
            ("The place where the trial is held.", Role::Answer),
            ("The power of a court to hear a case.", Role::Answer),
            ("Page 1 of 10", Role::Ignore),
            ("Page 2 of 10", Role::Ignore),
        ]
        .iter()
        .filter_map(|(t, r)| TrainingExample::from_text(t, *r, DIM))
        .collect()
    }

    fn trained() -> LinearBackend {
        let mut backend = LinearBackend::new(DIM, 0.5);
        let batch = examples();
        for _ in 0..50 {
            backend.train_step(&batch).unwrap();
        }
        backend
    }

    #[test]
    fn test_unclassified_is_not_a_training_label() {
        assert!(TrainingExample::from_text("Anything", Role::Unclassified, DIM).is_none());
    }

    #[test]
    fn test_training_reduces_loss() {
        let mut backend = LinearBackend::new(DIM, 0.5);
        let batch = examples();
        let first = backend.train_step(&batch).unwrap();
        let mut last = first;
        for _ in 0..20 {
            last = backend.train_step(&batch).unwrap();
        }
        assert!(last < first);
        assert_eq!(backend.steps(), 21);
    }

    #[test]
    fn test_model_classifier_predicts_trained_roles() {
        let rules = RuleClassifier::new().unwrap();
        let classifier = ModelClassifier::new(
            LoadedModel { version: 1, backend: Box::new(trained()) },
            rules,
        );
        let ctx = ScoringContext::default();

        let q = classifier.score("What is venue?", &ctx).unwrap();
        assert_eq!(q.role, Role::Question);
        let i = classifier.score("Page 2 of 10", &ctx).unwrap();
        assert_eq!(i.role, Role::Ignore);
    }

    #[test]
    fn test_out_of_distribution_uses_rules() {
        let rules = RuleClassifier::new().unwrap();
        let classifier = ModelClassifier::new(
            LoadedModel { version: 1, backend: Box::new(trained()) },
            rules,
        );
        let ctx = ScoringContext { previous_role: Some(Role::Question), index: 7, ..Default::default() };
        let text = "Zebras migrate seasonally across grasslands.";

        let expected = RuleClassifier::new().unwrap().score(text, &ctx).unwrap();
        assert_eq!(classifier.score(text, &ctx).unwrap(), expected);
    }

    #[test]
    fn test_restore_round_trip_is_deterministic() {
        let backend = trained();
        let artifact = backend.export().unwrap();
        let factory = LinearFactory::new(DIM, 0.5);
        let restored = factory.restore(&artifact).unwrap();

        let fv = FeatureVector::from_text("What is jurisdiction?", DIM);
        let original = backend.predict(&fv).unwrap();
        let reloaded = restored.predict(&fv).unwrap();
        for (a, b) in original.iter().zip(&reloaded) {
            assert!((a - b).abs() < 1e-9);
        }
        assert_eq!(reloaded, restored.predict(&fv).unwrap());
    }

    #[test]
    fn test_restore_rejects_wrong_dimension() {
        let artifact = LinearBackend::new(128, 0.5).export().unwrap();
        let factory = LinearFactory::new(DIM, 0.5);
        assert!(matches!(factory.restore(&artifact), Err(ClassifierError::Backend(_))));
        assert!(factory.restore(&serde_json::json!({"bogus": true})).is_err());
    }

    #[test]
    fn test_probabilities_sum_to_one() {
        let backend = trained();
        let probs = backend
            .predict(&FeatureVector::from_text("The place of trial.", DIM))
            .unwrap();
        assert_eq!(probs.len(), Role::LABELS.len());
        assert!((probs.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }
}
