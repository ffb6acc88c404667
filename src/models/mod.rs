// qaVerifier Data Models
// Paragraph roles, corrections and the shapes handed to the UI collaborator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub mod document;

pub use document::{Document, DocumentError, DocumentSnapshot};

// ============ Roles ============

/// Role of a paragraph in the Q&A structure
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Question,
    Answer,
    Ignore,   // headers, footers, page markers
    Unclassified,
}

impl Role {
    /// Roles a trained model can predict, in output-vector order
    pub const LABELS: [Role; 3] = [Role::Question, Role::Answer, Role::Ignore];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Question => "question",
            Role::Answer => "answer",
            Role::Ignore => "ignore",
            Role::Unclassified => "unclassified",
        }
    }

    /// Position in `Role::LABELS`, `None` for Unclassified
    pub fn label_index(&self) -> Option<usize> {
        Role::LABELS.iter().position(|r| r == self)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "question" | "q" => Ok(Role::Question),
            "answer" | "a" => Ok(Role::Answer),
            "ignore" | "i" => Ok(Role::Ignore),
            "unclassified" | "u" | "?" => Ok(Role::Unclassified),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

// ============ Paragraphs ============

/// Stable, position-independent paragraph identifier
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ParagraphId(pub Uuid);

impl ParagraphId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ParagraphId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ParagraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The mutable part of a paragraph; commands capture it as pre/post state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParagraphState {
    pub text: String,
    pub role: Role,
    pub confidence: f64,
    pub merged_into: Option<ParagraphId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Paragraph {
    pub id: ParagraphId,
    /// Position in the source document
    pub index: usize,
    /// Text as loaded; never changes
    pub source_text: String,
    /// Current text, including anything merged into this paragraph
    pub text: String,
    pub role: Role,
    /// Confidence of the last classification pass; 0 once assigned by the operator
    pub confidence: f64,
    /// Role the classifier assigned at load time
    pub classified_role: Role,
    /// Answer this paragraph was merged into
    pub merged_into: Option<ParagraphId>,
}

impl Paragraph {
    pub fn new(index: usize, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            id: ParagraphId::new(),
            index,
            source_text: text.clone(),
            text,
            role: Role::Unclassified,
            confidence: 0.0,
            classified_role: Role::Unclassified,
            merged_into: None,
        }
    }

    pub fn state(&self) -> ParagraphState {
        ParagraphState {
            text: self.text.clone(),
            role: self.role,
            confidence: self.confidence,
            merged_into: self.merged_into,
        }
    }

    pub fn is_merged(&self) -> bool {
        self.merged_into.is_some()
    }

    pub fn matches_filter(&self, filter: &str) -> bool {
        filter.is_empty() || self.text.to_lowercase().contains(&filter.to_lowercase())
    }
}

// ============ Statistics ============

/// Per-role paragraph counts, maintained incrementally by `Document`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoleStatistics {
    pub question: usize,
    pub answer: usize,
    pub ignore: usize,
    pub unclassified: usize,
}

impl RoleStatistics {
    pub fn count(&self, role: Role) -> usize {
        match role {
            Role::Question => self.question,
            Role::Answer => self.answer,
            Role::Ignore => self.ignore,
            Role::Unclassified => self.unclassified,
        }
    }

    pub fn total(&self) -> usize {
        self.question + self.answer + self.ignore + self.unclassified
    }

    pub(crate) fn add(&mut self, role: Role) {
        *self.slot(role) += 1;
    }

    pub(crate) fn remove(&mut self, role: Role) {
        let slot = self.slot(role);
        *slot = slot.saturating_sub(1);
    }

    fn slot(&mut self, role: Role) -> &mut usize {
        match role {
            Role::Question => &mut self.question,
            Role::Answer => &mut self.answer,
            Role::Ignore => &mut self.ignore,
            Role::Unclassified => &mut self.unclassified,
        }
    }
}

// ============ Corrections ============

/// A disagreement between the classifier and the operator, recorded at save time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Correction {
    pub paragraph_id: ParagraphId,
    pub text: String,
    pub classified_role: Role,
    pub confirmed_role: Role,
    pub timestamp: DateTime<Utc>,
}

// ============ Export ============

/// One row of the tabular export (`role, text`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportRow {
    pub role: Role,
    pub text: String,
}

/// A numbered question with the answers that follow it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QaPair {
    pub number: usize,
    pub question: String,
    pub answers: Vec<String>,
}

// ============ Training ============

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrainingStatus {
    Idle,
    Collecting,
    Training,
    Checkpointing,
    Recovering,
}

impl fmt::Display for TrainingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrainingStatus::Idle => "idle",
            TrainingStatus::Collecting => "collecting",
            TrainingStatus::Training => "training",
            TrainingStatus::Checkpointing => "checkpointing",
            TrainingStatus::Recovering => "recovering",
        };
        f.write_str(s)
    }
}
