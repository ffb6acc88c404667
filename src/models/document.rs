// Document Model
// Ordered paragraphs with incremental role statistics and the mutation
// primitives the command history is built on.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::{ExportRow, Paragraph, ParagraphId, ParagraphState, QaPair, Role, RoleStatistics};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DocumentError {
    #[error("Unknown paragraph: {0}")]
    UnknownParagraph(ParagraphId),
    #[error("No preceding answer to merge paragraph {0} into")]
    NoPrecedingAnswer(ParagraphId),
    #[error("Paragraph {0} is merged into an answer; unmerge it first")]
    MergedParagraph(ParagraphId),
    #[error("Paragraph {0} has paragraphs merged into it and must stay an answer")]
    HasMergedParagraphs(ParagraphId),
    #[error("Document contains no readable paragraphs")]
    EmptyDocument,
}

/// Structural view used to compare document states (edit counter excluded)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSnapshot {
    pub paragraphs: Vec<Paragraph>,
    pub statistics: RoleStatistics,
    pub expected_questions: usize,
}

#[derive(Debug, Clone)]
pub struct Document {
    name: String,
    paragraphs: Vec<Paragraph>,
    positions: HashMap<ParagraphId, usize>,
    stats: RoleStatistics,
    expected_questions: usize,
    edit_count: u64,
}

impl Document {
    /// Build a document from source paragraphs; blank entries are skipped.
    pub fn from_texts<I, S>(name: impl Into<String>, texts: I) -> Result<Self, DocumentError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let paragraphs: Vec<Paragraph> = texts
            .into_iter()
            .map(|t| t.as_ref().trim().to_string())
            .filter(|t| !t.is_empty())
            .enumerate()
            .map(|(index, text)| Paragraph::new(index, text))
            .collect();

        if paragraphs.is_empty() {
            return Err(DocumentError::EmptyDocument);
        }

        let positions = paragraphs
            .iter()
            .enumerate()
            .map(|(pos, p)| (p.id, pos))
            .collect();
        let mut stats = RoleStatistics::default();
        for p in &paragraphs {
            stats.add(p.role);
        }

        Ok(Self {
            name: name.into(),
            paragraphs,
            positions,
            stats,
            expected_questions: 0,
            edit_count: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn paragraphs(&self) -> &[Paragraph] {
        &self.paragraphs
    }

    pub fn len(&self) -> usize {
        self.paragraphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paragraphs.is_empty()
    }

    pub fn ids(&self) -> Vec<ParagraphId> {
        self.paragraphs.iter().map(|p| p.id).collect()
    }

    pub fn get(&self, id: ParagraphId) -> Result<&Paragraph, DocumentError> {
        self.position(id).map(|pos| &self.paragraphs[pos])
    }

    pub fn position(&self, id: ParagraphId) -> Result<usize, DocumentError> {
        self.positions
            .get(&id)
            .copied()
            .ok_or(DocumentError::UnknownParagraph(id))
    }

    pub fn statistics(&self) -> RoleStatistics {
        self.stats
    }

    /// Number of mutations applied since load, undo and redo included
    pub fn edit_count(&self) -> u64 {
        self.edit_count
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            paragraphs: self.paragraphs.clone(),
            statistics: self.stats,
            expected_questions: self.expected_questions,
        }
    }

    /// How many questions the operator expects the document to contain
    pub fn expected_questions(&self) -> usize {
        self.expected_questions
    }

    /// Questions still to be marked against the expected count
    pub fn missing_questions(&self) -> usize {
        self.expected_questions.saturating_sub(self.stats.question)
    }

    /// Whether any paragraph is merged into `id`
    pub fn has_merged_paragraphs(&self, id: ParagraphId) -> bool {
        self.paragraphs.iter().any(|p| p.merged_into == Some(id))
    }

    /// Ids of paragraphs whose text contains `filter` (case-insensitive)
    pub fn find(&self, filter: &str) -> Vec<ParagraphId> {
        self.paragraphs
            .iter()
            .filter(|p| p.matches_filter(filter))
            .map(|p| p.id)
            .collect()
    }

    /// Record the load-time classification of a paragraph.
    pub(crate) fn assign_classification(
        &mut self,
        id: ParagraphId,
        role: Role,
        confidence: f64,
    ) -> Result<(), DocumentError> {
        let pos = self.position(id)?;
        let para = &mut self.paragraphs[pos];
        self.stats.remove(para.role);
        para.role = role;
        para.classified_role = role;
        para.confidence = confidence.clamp(0.0, 1.0);
        self.stats.add(role);
        Ok(())
    }

    /// Load-time estimate; not counted as an edit.
    pub(crate) fn assign_expected_questions(&mut self, count: usize) {
        self.expected_questions = count;
    }

    /// Operator override of the expected question count
    pub fn set_expected_questions(&mut self, count: usize) {
        self.expected_questions = count;
        self.edit_count += 1;
    }

    /// Fails with the reason `set_role(id, role)` would be rejected, if any.
    pub fn check_role_change(&self, id: ParagraphId, role: Role) -> Result<(), DocumentError> {
        let pos = self.position(id)?;
        if self.paragraphs[pos].is_merged() {
            return Err(DocumentError::MergedParagraph(id));
        }
        // A merge root carries its children's text; it can only stay an answer.
        if role != Role::Answer && self.has_merged_paragraphs(id) {
            return Err(DocumentError::HasMergedParagraphs(id));
        }
        Ok(())
    }

    /// Operator role assignment; confidence drops to 0 for manual roles.
    pub fn set_role(&mut self, id: ParagraphId, role: Role) -> Result<(), DocumentError> {
        self.check_role_change(id, role)?;
        let pos = self.position(id)?;

        let para = &mut self.paragraphs[pos];
        self.stats.remove(para.role);
        para.role = role;
        para.confidence = 0.0;
        self.stats.add(role);
        self.edit_count += 1;
        Ok(())
    }

    /// Append this paragraph's text to the preceding Answer and mark it merged.
    ///
    /// The preceding Answer is the nearest earlier paragraph that is not Ignore;
    /// when that paragraph is itself merged, the text goes to the root of its chain.
    /// Returns the id of the answer that received the text.
    pub fn merge_into_previous_answer(
        &mut self,
        id: ParagraphId,
    ) -> Result<ParagraphId, DocumentError> {
        let root = self.merge_target(id)?;
        let pos = self.position(id)?;
        let root_pos = self.position(root)?;

        let merged_text = self.paragraphs[pos].text.clone();
        self.paragraphs[root_pos].text.push_str(&merged_text);

        let para = &mut self.paragraphs[pos];
        self.stats.remove(para.role);
        para.role = Role::Answer;
        para.confidence = 0.0;
        para.merged_into = Some(root);
        self.stats.add(Role::Answer);
        self.edit_count += 1;

        debug!("[document] merged paragraph {} into answer {}", id, root);
        Ok(root)
    }

    /// The answer a merge of `id` would append to, without mutating anything.
    pub fn merge_target(&self, id: ParagraphId) -> Result<ParagraphId, DocumentError> {
        let pos = self.position(id)?;
        if self.paragraphs[pos].is_merged() {
            return Err(DocumentError::NoPrecedingAnswer(id));
        }

        let preceding = self.paragraphs[..pos]
            .iter()
            .rev()
            .find(|p| p.role != Role::Ignore)
            .filter(|p| p.role == Role::Answer)
            .map(|p| p.id)
            .ok_or(DocumentError::NoPrecedingAnswer(id))?;

        let root = self.resolve_root(preceding);
        if self.get(root)?.role != Role::Answer {
            return Err(DocumentError::NoPrecedingAnswer(id));
        }
        Ok(root)
    }

    /// Overwrite the mutable state of a paragraph. Used to replay command
    /// pre/post states exactly.
    pub fn restore_state(
        &mut self,
        id: ParagraphId,
        state: &ParagraphState,
    ) -> Result<(), DocumentError> {
        let pos = self.position(id)?;
        let para = &mut self.paragraphs[pos];
        self.stats.remove(para.role);
        para.text = state.text.clone();
        para.role = state.role;
        para.confidence = state.confidence;
        para.merged_into = state.merged_into;
        self.stats.add(state.role);
        self.edit_count += 1;
        Ok(())
    }

    fn resolve_root(&self, id: ParagraphId) -> ParagraphId {
        let mut current = id;
        // Chains are acyclic: a link always points to an earlier paragraph.
        while let Some(next) = self
            .position(current)
            .ok()
            .and_then(|pos| self.paragraphs[pos].merged_into)
        {
            current = next;
        }
        current
    }

    /// Tabular export: one row per non-Ignore paragraph in source order;
    /// merged paragraphs are carried by the answer they were merged into.
    pub fn export_rows(&self) -> Vec<ExportRow> {
        self.paragraphs
            .iter()
            .filter(|p| p.role != Role::Ignore && !p.is_merged())
            .map(|p| ExportRow {
                role: p.role,
                text: p.text.clone(),
            })
            .collect()
    }

    /// Questions numbered in source order, each with the answers that follow it.
    /// Answers that appear before the first question are dropped.
    pub fn qa_pairs(&self) -> Vec<QaPair> {
        let mut pairs: Vec<QaPair> = Vec::new();
        for row in self.export_rows() {
            match row.role {
                Role::Question => pairs.push(QaPair {
                    number: pairs.len() + 1,
                    question: row.text,
                    answers: Vec::new(),
                }),
                Role::Answer => {
                    if let Some(current) = pairs.last_mut() {
                        current.answers.push(row.text);
                    }
                }
                Role::Ignore | Role::Unclassified => {}
            }
        }
        pairs
    }

    #[cfg(test)]
    fn rescan_statistics(&self) -> RoleStatistics {
        let mut stats = RoleStatistics::default();
        for p in &self.paragraphs {
            stats.add(p.role);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(texts: &[&str]) -> Document {
        Document::from_texts("test.docx", texts.iter().copied()).unwrap()
    }

    #[test]
    fn test_empty_document_rejected() {
        let result = Document::from_texts("empty.docx", ["", "   "]);
        assert_eq!(result.unwrap_err(), DocumentError::EmptyDocument);
    }

    #[test]
    fn test_set_role_updates_statistics_incrementally() {
        let mut d = doc(&["What is venue?", "The place of trial.", "Footer"]);
        let ids = d.ids();
        assert_eq!(d.statistics().unclassified, 3);

        d.set_role(ids[0], Role::Question).unwrap();
        d.set_role(ids[1], Role::Answer).unwrap();
        d.set_role(ids[2], Role::Ignore).unwrap();

        let stats = d.statistics();
        assert_eq!(stats.question, 1);
        assert_eq!(stats.answer, 1);
        assert_eq!(stats.ignore, 1);
        assert_eq!(stats.unclassified, 0);
        assert_eq!(stats, d.rescan_statistics());
        assert_eq!(d.edit_count(), 3);
    }

    #[test]
    fn test_set_role_unknown_paragraph() {
        let mut d = doc(&["One"]);
        let stranger = ParagraphId::new();
        assert_eq!(
            d.set_role(stranger, Role::Answer),
            Err(DocumentError::UnknownParagraph(stranger))
        );
        assert_eq!(d.edit_count(), 0);
    }

    #[test]
    fn test_manual_role_zeroes_confidence() {
        let mut d = doc(&["What is a tort?"]);
        let id = d.ids()[0];
        d.assign_classification(id, Role::Question, 0.9).unwrap();
        d.set_role(id, Role::Answer).unwrap();
        let p = d.get(id).unwrap();
        assert_eq!(p.confidence, 0.0);
        assert_eq!(p.classified_role, Role::Question);
    }

    #[test]
    fn test_merge_into_previous_answer() {
        let mut d = doc(&["A", "B"]);
        let ids = d.ids();
        d.set_role(ids[0], Role::Answer).unwrap();

        let root = d.merge_into_previous_answer(ids[1]).unwrap();
        assert_eq!(root, ids[0]);
        assert_eq!(d.get(ids[0]).unwrap().text, "AB");
        let merged = d.get(ids[1]).unwrap();
        assert_eq!(merged.role, Role::Answer);
        assert_eq!(merged.merged_into, Some(ids[0]));
        assert_eq!(d.len(), 2);
        assert_eq!(d.statistics(), d.rescan_statistics());
    }

    #[test]
    fn test_merge_twice_fails() {
        let mut d = doc(&["A", "B"]);
        let ids = d.ids();
        d.set_role(ids[0], Role::Answer).unwrap();
        d.merge_into_previous_answer(ids[1]).unwrap();
        assert_eq!(
            d.merge_into_previous_answer(ids[1]),
            Err(DocumentError::NoPrecedingAnswer(ids[1]))
        );
        assert_eq!(d.get(ids[0]).unwrap().text, "AB");
    }

    #[test]
    fn test_merge_skips_ignored_paragraphs() {
        let mut d = doc(&["Answer text. ", "Page 2", "continued."]);
        let ids = d.ids();
        d.set_role(ids[0], Role::Answer).unwrap();
        d.set_role(ids[1], Role::Ignore).unwrap();

        d.merge_into_previous_answer(ids[2]).unwrap();
        assert_eq!(d.get(ids[0]).unwrap().text, "Answer text.continued.");
    }

    #[test]
    fn test_merge_requires_answer() {
        let mut d = doc(&["What is venue?", "More words"]);
        let ids = d.ids();
        d.set_role(ids[0], Role::Question).unwrap();
        assert_eq!(
            d.merge_into_previous_answer(ids[1]),
            Err(DocumentError::NoPrecedingAnswer(ids[1]))
        );
        assert_eq!(
            d.merge_into_previous_answer(ids[0]),
            Err(DocumentError::NoPrecedingAnswer(ids[0]))
        );
    }

    #[test]
    fn test_merge_chain_resolves_to_root() {
        let mut d = doc(&["A", "B", "C"]);
        let ids = d.ids();
        d.set_role(ids[0], Role::Answer).unwrap();
        d.merge_into_previous_answer(ids[1]).unwrap();
        let root = d.merge_into_previous_answer(ids[2]).unwrap();

        assert_eq!(root, ids[0]);
        assert_eq!(d.get(ids[0]).unwrap().text, "ABC");
        assert_eq!(d.get(ids[2]).unwrap().merged_into, Some(ids[0]));
    }

    #[test]
    fn test_merged_paragraph_role_is_locked() {
        let mut d = doc(&["A", "B"]);
        let ids = d.ids();
        d.set_role(ids[0], Role::Answer).unwrap();
        d.merge_into_previous_answer(ids[1]).unwrap();
        assert_eq!(
            d.set_role(ids[1], Role::Question),
            Err(DocumentError::MergedParagraph(ids[1]))
        );
    }

    #[test]
    fn test_merge_root_role_is_locked() {
        let mut d = doc(&["What is venue?", "The place", " of trial."]);
        let ids = d.ids();
        d.set_role(ids[0], Role::Question).unwrap();
        d.set_role(ids[1], Role::Answer).unwrap();
        d.merge_into_previous_answer(ids[2]).unwrap();

        for role in [Role::Ignore, Role::Question, Role::Unclassified] {
            assert_eq!(
                d.set_role(ids[1], role),
                Err(DocumentError::HasMergedParagraphs(ids[1]))
            );
        }
        d.set_role(ids[1], Role::Answer).unwrap();

        let rows = d.export_rows();
        assert_eq!(rows.len(), 2);
        assert_eq!((rows[1].role, rows[1].text.as_str()), (Role::Answer, "The placeof trial."));
    }

    #[test]
    fn test_merge_requires_answer_root() {
        let mut d = doc(&["A", "B", "C"]);
        let ids = d.ids();
        d.set_role(ids[0], Role::Answer).unwrap();
        d.merge_into_previous_answer(ids[1]).unwrap();

        // Force the root away from Answer the way a stale replay could.
        let mut state = d.get(ids[0]).unwrap().state();
        state.role = Role::Question;
        d.restore_state(ids[0], &state).unwrap();

        assert_eq!(
            d.merge_into_previous_answer(ids[2]),
            Err(DocumentError::NoPrecedingAnswer(ids[2]))
        );
        assert_eq!(d.get(ids[0]).unwrap().text, "AB");
    }

    #[test]
    fn test_expected_questions() {
        let mut d = doc(&["What is A?", "What is B?", "B."]);
        let ids = d.ids();
        d.assign_expected_questions(2);
        assert_eq!(d.edit_count(), 0);
        assert_eq!(d.missing_questions(), 2);

        d.set_role(ids[0], Role::Question).unwrap();
        assert_eq!(d.missing_questions(), 1);

        d.set_expected_questions(1);
        assert_eq!(d.expected_questions(), 1);
        assert_eq!(d.missing_questions(), 0);
        assert_eq!(d.edit_count(), 2);
    }

    #[test]
    fn test_export_rows_skip_ignore_and_merged() {
        let mut d = doc(&["Header", "1. What is venue?", "The place", " of trial.", "Page 1"]);
        let ids = d.ids();
        d.set_role(ids[0], Role::Ignore).unwrap();
        d.set_role(ids[1], Role::Question).unwrap();
        d.set_role(ids[2], Role::Answer).unwrap();
        d.merge_into_previous_answer(ids[3]).unwrap();
        d.set_role(ids[4], Role::Ignore).unwrap();

        let rows = d.export_rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].role, Role::Question);
        assert_eq!(rows[1].text, "The placeof trial.");
    }

    #[test]
    fn test_qa_pairs_numbering() {
        let mut d = doc(&["Stray answer", "What is A?", "A is a letter.", "What is B?", "B too.", "Also B."]);
        let ids = d.ids();
        let roles = [
            Role::Answer,
            Role::Question,
            Role::Answer,
            Role::Question,
            Role::Answer,
            Role::Answer,
        ];
        for (id, role) in ids.iter().zip(roles) {
            d.set_role(*id, role).unwrap();
        }

        let pairs = d.qa_pairs();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].number, 1);
        assert_eq!(pairs[0].answers, vec!["A is a letter."]);
        assert_eq!(pairs[1].number, 2);
        assert_eq!(pairs[1].answers.len(), 2);
    }

    #[test]
    fn test_find_is_case_insensitive() {
        let d = doc(&["What is Jurisdiction?", "Power of a court.", "jurisdiction again"]);
        assert_eq!(d.find("JURISDICTION").len(), 2);
        assert_eq!(d.find("").len(), 3);
    }
}
