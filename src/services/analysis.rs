// Analysis Service
// Single entry point for the UI collaborator: scores documents on load, routes
// edits through the command history, records corrections on save and owns the
// background training orchestrator.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{
    Correction, Document, DocumentError, ExportRow, ParagraphId, QaPair, Role, RoleStatistics,
    TrainingStatus,
};
use crate::services::classifier::{
    select_scorer, BackendFactory, ClassifierError, LinearFactory, LoadedModel, ParagraphScorer,
    RuleClassifier, ScoringContext,
};
use crate::services::config_store::{AnalyzerType, AppConfig, AppPaths};
use crate::services::correction_log::{CorrectionLog, CorrectionLogError, CorrectionRecord};
use crate::services::history::{Command, CommandHistory, Edit, HistoryError};
use crate::services::text_processor::preview;
use crate::services::training::{
    CheckpointError, CheckpointStore, TrainingError, TrainingOrchestrator, TrainingSnapshot,
};

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("No document loaded")]
    NoDocument,
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
    #[error(transparent)]
    CorrectionLog(#[from] CorrectionLogError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Training(#[from] TrainingError),
}

/// Summary of a document load
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadReport {
    pub document: String,
    pub paragraphs: usize,
    pub classifier: String,
    pub model_version: Option<u64>,
    pub estimated_questions: usize,
    /// Paragraphs downgraded to Unclassified by the confidence threshold
    pub below_threshold: usize,
    pub statistics: RoleStatistics,
}

pub struct AnalysisService {
    config: AppConfig,
    factory: Arc<dyn BackendFactory>,
    store: CheckpointStore,
    log: Arc<CorrectionLog>,
    orchestrator: Option<TrainingOrchestrator>,
    scorer: Arc<dyn ParagraphScorer>,
    rules: RuleClassifier,
    document: Option<Document>,
    history: CommandHistory,
    session_id: Uuid,
    /// Corrections already logged this session, by paragraph and confirmed role
    recorded: HashMap<ParagraphId, Role>,
}

impl AnalysisService {
    /// Service with the default linear model backend
    pub fn new(config: AppConfig, paths: &AppPaths) -> Result<Self, AnalysisError> {
        let factory = Arc::new(LinearFactory::new(
            config.training.feature_dim,
            config.training.learning_rate,
        ));
        Self::with_factory(config, paths, factory)
    }

    pub fn with_factory(
        config: AppConfig,
        paths: &AppPaths,
        factory: Arc<dyn BackendFactory>,
    ) -> Result<Self, AnalysisError> {
        let store = CheckpointStore::new(paths.checkpoints_dir())?;
        let log = Arc::new(CorrectionLog::open(paths.corrections_file())?);

        let orchestrator = if config.training.enabled {
            Some(TrainingOrchestrator::start(
                store.clone(),
                log.clone(),
                factory.clone(),
                config.training.clone(),
            )?)
        } else {
            info!("[analysis] background training disabled");
            None
        };

        let loaded = load_model(&config, &store, factory.as_ref());
        let scorer = select_scorer(config.analysis.analyzer_type, loaded)?;
        let history = CommandHistory::new(config.analysis.max_history);

        let session_id = Uuid::new_v4();
        info!(session = %session_id, classifier = scorer.name(), "[analysis] service ready");

        Ok(Self {
            config,
            factory,
            store,
            log,
            orchestrator,
            scorer,
            rules: RuleClassifier::new()?,
            document: None,
            history,
            session_id,
            recorded: HashMap::new(),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn classifier_name(&self) -> &'static str {
        self.scorer.name()
    }

    pub fn document(&self) -> Option<&Document> {
        self.document.as_ref()
    }

    /// Switch to the newest checkpoint if one appeared since the last load
    fn refresh_classifier(&mut self) -> Result<(), AnalysisError> {
        if self.config.analysis.analyzer_type == AnalyzerType::Rules {
            return Ok(());
        }
        let newest = self.store.list_versions()?.last().copied();
        if newest.is_none() || newest == self.scorer.version() {
            return Ok(());
        }

        let loaded = load_model(&self.config, &self.store, self.factory.as_ref());
        self.scorer = select_scorer(self.config.analysis.analyzer_type, loaded)?;
        Ok(())
    }

    /// Score every paragraph and make the result the current document.
    /// On failure the previous document (if any) is left untouched.
    pub fn load<I, S>(&mut self, name: &str, paragraphs: I) -> Result<LoadReport, AnalysisError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.refresh_classifier()?;

        let mut doc = Document::from_texts(name, paragraphs)?;
        let texts: Vec<String> = doc.paragraphs().iter().map(|p| p.text.clone()).collect();
        let ids = doc.ids();
        let total = texts.len();
        let threshold = self.config.analysis.confidence_threshold;

        let mut previous_role = None;
        let mut below_threshold = 0;
        for (index, id) in ids.into_iter().enumerate() {
            let ctx = ScoringContext {
                index,
                total,
                previous_text: index.checked_sub(1).map(|i| texts[i].as_str()),
                next_text: texts.get(index + 1).map(String::as_str),
                previous_role,
            };
            let score = self.scorer.score(&texts[index], &ctx)?;

            let role = if score.confidence < threshold {
                below_threshold += 1;
                Role::Unclassified
            } else {
                score.role
            };
            doc.assign_classification(id, role, score.confidence)?;
            if role != Role::Ignore {
                previous_role = Some(role);
            }
        }

        let estimated_questions = self.rules.estimate_question_count(&texts);
        doc.assign_expected_questions(estimated_questions);

        let report = LoadReport {
            document: name.to_string(),
            paragraphs: total,
            classifier: self.scorer.name().to_string(),
            model_version: self.scorer.version(),
            estimated_questions,
            below_threshold,
            statistics: doc.statistics(),
        };
        info!(
            paragraphs = report.paragraphs,
            questions = report.statistics.question,
            unclassified = report.statistics.unclassified,
            "[analysis] loaded {} with {} classifier",
            name,
            report.classifier
        );

        self.history.clear();
        self.recorded.clear();
        self.document = Some(doc);
        Ok(report)
    }

    pub fn issue(&mut self, edit: &Edit) -> Result<Command, AnalysisError> {
        let doc = self.document.as_mut().ok_or(AnalysisError::NoDocument)?;
        Ok(self.history.execute(doc, edit)?.clone())
    }

    pub fn undo(&mut self) -> Result<Command, AnalysisError> {
        let doc = self.document.as_mut().ok_or(AnalysisError::NoDocument)?;
        Ok(self.history.undo(doc)?)
    }

    pub fn redo(&mut self) -> Result<Command, AnalysisError> {
        let doc = self.document.as_mut().ok_or(AnalysisError::NoDocument)?;
        Ok(self.history.redo(doc)?)
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    /// Log every paragraph whose role differs from its load-time classification
    /// and tell the orchestrator a save boundary occurred. A mismatch already
    /// logged this session with the same role is not logged again.
    pub fn record_save(&mut self) -> Result<Vec<Correction>, AnalysisError> {
        let doc = self.document.as_ref().ok_or(AnalysisError::NoDocument)?;
        let now = Utc::now();

        let corrections: Vec<Correction> = doc
            .paragraphs()
            .iter()
            .filter(|p| p.role != p.classified_role)
            .filter(|p| self.recorded.get(&p.id) != Some(&p.role))
            .map(|p| Correction {
                paragraph_id: p.id,
                text: p.text.clone(),
                classified_role: p.classified_role,
                confirmed_role: p.role,
                timestamp: now,
            })
            .collect();

        let records: Vec<CorrectionRecord> = corrections
            .iter()
            .map(|c| CorrectionRecord {
                session_id: self.session_id,
                document: doc.name().to_string(),
                correction: c.clone(),
            })
            .collect();
        self.log.append(&records)?;

        for c in &corrections {
            info!(
                "[analysis] correction {} -> {}: {}",
                c.classified_role,
                c.confirmed_role,
                preview(&c.text, 60)
            );
            self.recorded.insert(c.paragraph_id, c.confirmed_role);
        }

        if let Some(orchestrator) = &self.orchestrator {
            orchestrator.notify_save();
        }
        Ok(corrections)
    }

    pub fn training_status(&self) -> TrainingStatus {
        self.orchestrator
            .as_ref()
            .map_or(TrainingStatus::Idle, |o| o.status())
    }

    pub fn training_snapshot(&self) -> Option<TrainingSnapshot> {
        self.orchestrator.as_ref().map(|o| o.snapshot())
    }

    pub fn orchestrator(&self) -> Option<&TrainingOrchestrator> {
        self.orchestrator.as_ref()
    }

    /// Start a training cycle on everything pending
    pub fn train_now(&self) -> bool {
        match &self.orchestrator {
            Some(o) => {
                o.force_train();
                true
            }
            None => {
                warn!("[analysis] training requested while disabled");
                false
            }
        }
    }

    pub fn export_rows(&self) -> Result<Vec<ExportRow>, AnalysisError> {
        Ok(self.document.as_ref().ok_or(AnalysisError::NoDocument)?.export_rows())
    }

    pub fn qa_pairs(&self) -> Result<Vec<QaPair>, AnalysisError> {
        Ok(self.document.as_ref().ok_or(AnalysisError::NoDocument)?.qa_pairs())
    }

    /// Logged corrections per confirmed role
    pub fn correction_stats(&self) -> Result<RoleStatistics, AnalysisError> {
        Ok(self.log.stats()?)
    }

    pub fn checkpoint_versions(&self) -> Result<Vec<u64>, AnalysisError> {
        Ok(self.store.list_versions()?)
    }

    /// Drop all corrections and checkpoints and go back to the rules
    pub fn reset_training(&mut self) -> Result<(), AnalysisError> {
        match &self.orchestrator {
            Some(o) => o.reset()?,
            None => {
                self.store.purge()?;
                self.log.reset()?;
            }
        }
        self.recorded.clear();
        self.scorer = select_scorer(self.config.analysis.analyzer_type, None)?;
        info!("[analysis] training data reset");
        Ok(())
    }

    /// Stop background training; idempotent
    pub fn shutdown(&mut self) {
        if let Some(orchestrator) = self.orchestrator.as_mut() {
            orchestrator.shutdown();
        }
    }

    #[cfg(test)]
    fn set_role_by_index(&mut self, index: usize, role: Role) -> Result<Command, AnalysisError> {
        let id = self.document().ok_or(AnalysisError::NoDocument)?.ids()[index];
        self.issue(&Edit::SetRole { id, role })
    }
}

fn load_model(
    config: &AppConfig,
    store: &CheckpointStore,
    factory: &dyn BackendFactory,
) -> Option<LoadedModel> {
    if config.analysis.analyzer_type == AnalyzerType::Rules {
        return None;
    }
    store.load_model(factory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    const FIVE_PARAGRAPHS: [&str; 5] = [
        "CIVIL PROCEDURE REVIEW",
        "1. What is jurisdiction?",
        "It is the power of a court to hear a case.",
        "The court must also have venue over the parties.",
        "Page 1 of 1",
    ];

    fn service(dir: &TempDir, training: bool) -> AnalysisService {
        let mut config = AppConfig::default();
        config.data_dir = Some(dir.path().to_path_buf());
        config.training.enabled = training;
        let paths = AppPaths::resolve(&config).unwrap();
        AnalysisService::new(config, &paths).unwrap()
    }

    fn roles(service: &AnalysisService) -> Vec<Role> {
        service
            .document()
            .unwrap()
            .paragraphs()
            .iter()
            .map(|p| p.role)
            .collect()
    }

    #[test]
    fn test_end_to_end_correction_and_export() {
        let dir = TempDir::new().unwrap();
        let mut svc = service(&dir, true);

        let report = svc.load("review.docx", FIVE_PARAGRAPHS).unwrap();
        assert_eq!(report.classifier, "rules");
        assert_eq!(report.model_version, None);
        assert_eq!(
            roles(&svc),
            vec![Role::Ignore, Role::Question, Role::Answer, Role::Answer, Role::Ignore]
        );

        svc.set_role_by_index(2, Role::Question).unwrap();
        let corrections = svc.record_save().unwrap();
        assert_eq!(corrections.len(), 1);

        let p3 = svc.document().unwrap().paragraphs()[2].clone();
        let logged = svc.log.read_all().unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].correction.paragraph_id, p3.id);
        assert_eq!(logged[0].correction.classified_role, Role::Answer);
        assert_eq!(logged[0].correction.confirmed_role, Role::Question);
        assert_eq!(logged[0].session_id, svc.session_id());

        let rows = svc.export_rows().unwrap();
        let exported: Vec<(Role, &str)> = rows.iter().map(|r| (r.role, r.text.as_str())).collect();
        assert_eq!(
            exported,
            vec![
                (Role::Question, FIVE_PARAGRAPHS[1]),
                (Role::Question, FIVE_PARAGRAPHS[2]),
                (Role::Answer, FIVE_PARAGRAPHS[3]),
            ]
        );

        // Saving again does not duplicate the record
        assert!(svc.record_save().unwrap().is_empty());
        assert_eq!(svc.log.len(), 1);
    }

    #[test]
    fn test_next_load_uses_new_checkpoint() {
        let dir = TempDir::new().unwrap();
        let mut svc = service(&dir, true);
        svc.load("review.docx", FIVE_PARAGRAPHS).unwrap();
        svc.set_role_by_index(2, Role::Question).unwrap();
        svc.record_save().unwrap();

        // One correction is not enough for automatic training
        let orchestrator = svc.orchestrator().unwrap();
        assert!(orchestrator.settle(Duration::from_secs(10)));
        assert_eq!(orchestrator.snapshot().status, TrainingStatus::Collecting);
        assert!(svc.checkpoint_versions().unwrap().is_empty());

        assert!(svc.train_now());
        let snapshot = svc
            .orchestrator()
            .unwrap()
            .wait_for(Duration::from_secs(10), |s| s.cycles_completed == 1)
            .unwrap();
        assert_eq!(snapshot.latest_version, Some(1));

        let report = svc.load("review.docx", FIVE_PARAGRAPHS).unwrap();
        assert_eq!(report.classifier, "model");
        assert_eq!(report.model_version, Some(1));
    }

    #[test]
    fn test_low_confidence_becomes_unclassified() {
        let dir = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.data_dir = Some(dir.path().to_path_buf());
        config.training.enabled = false;
        config.analysis.confidence_threshold = 0.99;
        let paths = AppPaths::resolve(&config).unwrap();
        let mut svc = AnalysisService::new(config, &paths).unwrap();

        let report = svc.load("review.docx", FIVE_PARAGRAPHS).unwrap();
        assert_eq!(report.below_threshold, 5);
        assert!(roles(&svc).iter().all(|r| *r == Role::Unclassified));
        let doc = svc.document().unwrap();
        assert!(doc.paragraphs().iter().all(|p| p.confidence > 0.0));
    }

    #[test]
    fn test_edits_require_document() {
        let dir = TempDir::new().unwrap();
        let mut svc = service(&dir, false);
        assert!(matches!(svc.undo(), Err(AnalysisError::NoDocument)));
        assert!(matches!(svc.record_save(), Err(AnalysisError::NoDocument)));
        assert!(matches!(svc.export_rows(), Err(AnalysisError::NoDocument)));
    }

    #[test]
    fn test_failed_load_creates_no_document() {
        let dir = TempDir::new().unwrap();
        let mut svc = service(&dir, false);
        let err = svc.load("blank.docx", ["", "  "]).unwrap_err();
        assert!(matches!(err, AnalysisError::Document(DocumentError::EmptyDocument)));
        assert!(svc.document().is_none());
    }

    #[test]
    fn test_undo_redo_through_service() {
        let dir = TempDir::new().unwrap();
        let mut svc = service(&dir, false);
        svc.load("review.docx", FIVE_PARAGRAPHS).unwrap();
        let before = svc.document().unwrap().snapshot();

        svc.set_role_by_index(3, Role::Ignore).unwrap();
        svc.undo().unwrap();
        assert_eq!(svc.document().unwrap().snapshot(), before);
        svc.redo().unwrap();
        assert_eq!(svc.document().unwrap().paragraphs()[3].role, Role::Ignore);

        // Undone edits are not corrections
        svc.undo().unwrap();
        assert!(svc.record_save().unwrap().is_empty());
    }

    #[test]
    fn test_merge_exports_single_row() {
        let dir = TempDir::new().unwrap();
        let mut svc = service(&dir, false);
        svc.load("review.docx", FIVE_PARAGRAPHS).unwrap();
        let ids = svc.document().unwrap().ids();

        svc.issue(&Edit::MergeIntoPreviousAnswer { id: ids[3] }).unwrap();
        let rows = svc.export_rows().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[1].text,
            format!("{}{}", FIVE_PARAGRAPHS[2], FIVE_PARAGRAPHS[3])
        );
    }

    #[test]
    fn test_reset_training_without_worker() {
        let dir = TempDir::new().unwrap();
        let mut svc = service(&dir, false);
        svc.load("review.docx", FIVE_PARAGRAPHS).unwrap();
        svc.set_role_by_index(4, Role::Answer).unwrap();
        svc.record_save().unwrap();
        assert_eq!(svc.correction_stats().unwrap().answer, 1);

        svc.reset_training().unwrap();
        assert_eq!(svc.correction_stats().unwrap().total(), 0);
        assert_eq!(svc.classifier_name(), "rules");
        assert_eq!(svc.training_status(), TrainingStatus::Idle);
    }

    #[test]
    fn test_expected_count_override() {
        let dir = TempDir::new().unwrap();
        let mut svc = service(&dir, false);
        let report = svc.load("review.docx", FIVE_PARAGRAPHS).unwrap();
        let doc = svc.document().unwrap();
        assert_eq!(doc.expected_questions(), report.estimated_questions);

        svc.issue(&Edit::SetExpectedCount { count: 1 }).unwrap();
        assert_eq!(svc.document().unwrap().missing_questions(), 0);
        svc.undo().unwrap();
        assert_eq!(
            svc.document().unwrap().expected_questions(),
            report.estimated_questions
        );
    }

    #[test]
    fn test_merge_root_keeps_its_row() {
        let dir = TempDir::new().unwrap();
        let mut svc = service(&dir, false);
        svc.load("review.docx", FIVE_PARAGRAPHS).unwrap();
        let ids = svc.document().unwrap().ids();

        svc.issue(&Edit::MergeBatch { ids: vec![ids[3]] }).unwrap();
        let err = svc.set_role_by_index(2, Role::Ignore).unwrap_err();
        assert!(matches!(
            err,
            AnalysisError::History(HistoryError::Document(DocumentError::HasMergedParagraphs(_)))
        ));
        assert_eq!(svc.export_rows().unwrap().len(), 2);
    }
}
