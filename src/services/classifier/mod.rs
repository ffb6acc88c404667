// Classifier Strategy
// Paragraph scoring behind one capability interface, with a rule-based
// variant that is always available and a model-backed variant restored
// from the newest loadable checkpoint.

pub mod features;
pub mod model;
pub mod rules;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::models::Role;
use crate::services::config_store::AnalyzerType;

pub use features::FeatureVector;
pub use model::{
    BackendFactory, LinearBackend, LinearFactory, LoadedModel, ModelBackend, ModelClassifier,
    TrainingExample,
};
pub use rules::RuleClassifier;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClassifierError {
    #[error("Classifier unavailable: {0}")]
    Unavailable(String),
    #[error("Model backend error: {0}")]
    Backend(String),
}

/// Surroundings of the paragraph being scored
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoringContext<'a> {
    pub index: usize,
    pub total: usize,
    pub previous_text: Option<&'a str>,
    pub next_text: Option<&'a str>,
    /// Role already assigned in this pass to the nearest earlier paragraph
    /// that is not Ignore
    pub previous_role: Option<Role>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub role: Role,
    pub confidence: f64,
}

impl Score {
    pub fn new(role: Role, confidence: f64) -> Self {
        Self {
            role,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// Anything that can assign a role and confidence to a paragraph.
/// Implementations must be deterministic for a fixed state and input.
pub trait ParagraphScorer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Checkpoint version backing this scorer, if any
    fn version(&self) -> Option<u64> {
        None
    }

    fn score(&self, text: &str, ctx: &ScoringContext<'_>) -> Result<Score, ClassifierError>;
}

/// Pick the scorer for a load: the model-backed variant when a checkpoint was
/// restored (and the analyzer type allows it), the rule-based variant otherwise.
pub fn select_scorer(
    analyzer: AnalyzerType,
    loaded: Option<LoadedModel>,
) -> Result<Arc<dyn ParagraphScorer>, ClassifierError> {
    let rules = RuleClassifier::new()?;

    if analyzer == AnalyzerType::Rules {
        info!("[classifier] using rule-based classifier (configured)");
        return Ok(Arc::new(rules));
    }

    match loaded {
        Some(model) => {
            info!(
                version = model.version,
                "[classifier] using model-backed classifier"
            );
            Ok(Arc::new(ModelClassifier::new(model, rules)))
        }
        None => {
            if analyzer == AnalyzerType::Model {
                warn!("[classifier] no loadable checkpoint; falling back to rules");
            } else {
                info!("[classifier] no checkpoint yet; using rule-based classifier");
            }
            Ok(Arc::new(rules))
        }
    }
}
