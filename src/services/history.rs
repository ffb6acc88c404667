// Command History
// Linear undo/redo over immutable command records. Each command carries the
// exact pre and post state of every paragraph it touched, so applying and
// inverting are plain state writes against the document.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::models::{Document, DocumentError, ParagraphId, ParagraphState, Role};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HistoryError {
    #[error("Nothing to undo")]
    NothingToUndo,
    #[error("Nothing to redo")]
    NothingToRedo,
    #[error("No paragraphs selected")]
    EmptySelection,
    #[error(transparent)]
    Document(#[from] DocumentError),
}

/// An operator's intent, resolved into a `Command` against the current document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Edit {
    SetRole { id: ParagraphId, role: Role },
    SetRoleBatch { ids: Vec<ParagraphId>, role: Role },
    MergeIntoPreviousAnswer { id: ParagraphId },
    /// Merge every selected paragraph, in source order, as one command
    MergeBatch { ids: Vec<ParagraphId> },
    SetExpectedCount { count: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    SetRole,
    SetRoleBatch,
    MergeIntoPreviousAnswer,
    InverseOfMerge,
    SetExpectedCount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub id: ParagraphId,
    pub pre: ParagraphState,
    pub post: ParagraphState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountChange {
    pub pre: usize,
    pub post: usize,
}

/// A reversible document mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub kind: CommandKind,
    pub changes: Vec<StateChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_questions: Option<CountChange>,
}

impl Command {
    fn paragraphs(kind: CommandKind, changes: Vec<StateChange>) -> Self {
        Self {
            kind,
            changes,
            expected_questions: None,
        }
    }

    pub fn targets(&self) -> Vec<ParagraphId> {
        self.changes.iter().map(|c| c.id).collect()
    }

    /// The command that undoes this one
    pub fn inverse(&self) -> Command {
        let kind = match self.kind {
            CommandKind::MergeIntoPreviousAnswer => CommandKind::InverseOfMerge,
            CommandKind::InverseOfMerge => CommandKind::MergeIntoPreviousAnswer,
            other => other,
        };
        Command {
            kind,
            changes: self
                .changes
                .iter()
                .rev()
                .map(|c| StateChange {
                    id: c.id,
                    pre: c.post.clone(),
                    post: c.pre.clone(),
                })
                .collect(),
            expected_questions: self.expected_questions.map(|c| CountChange {
                pre: c.post,
                post: c.pre,
            }),
        }
    }

    /// Write every post-state. Targets are checked first so a stale command
    /// never applies partially.
    pub fn apply(&self, doc: &mut Document) -> Result<(), DocumentError> {
        for change in &self.changes {
            doc.position(change.id)?;
        }
        for change in &self.changes {
            doc.restore_state(change.id, &change.post)?;
        }
        if let Some(count) = self.expected_questions {
            doc.set_expected_questions(count.post);
        }
        Ok(())
    }

    /// Perform `edit` on the document and record what changed
    pub fn perform(doc: &mut Document, edit: &Edit) -> Result<Command, HistoryError> {
        match edit {
            Edit::SetRole { id, role } => {
                let pre = doc.get(*id)?.state();
                doc.set_role(*id, *role)?;
                let post = doc.get(*id)?.state();
                Ok(Command::paragraphs(
                    CommandKind::SetRole,
                    vec![StateChange { id: *id, pre, post }],
                ))
            }
            Edit::SetRoleBatch { ids, role } => {
                let ids = dedupe(ids)?;

                // Validate the whole selection before touching anything.
                let mut pres = Vec::with_capacity(ids.len());
                for id in &ids {
                    doc.check_role_change(*id, *role)?;
                    pres.push(doc.get(*id)?.state());
                }

                let mut changes = Vec::with_capacity(ids.len());
                for (id, pre) in ids.into_iter().zip(pres) {
                    doc.set_role(id, *role)?;
                    let post = doc.get(id)?.state();
                    changes.push(StateChange { id, pre, post });
                }
                Ok(Command::paragraphs(CommandKind::SetRoleBatch, changes))
            }
            Edit::MergeIntoPreviousAnswer { id } => {
                let changes = merge_all(doc, &[*id])?;
                Ok(Command::paragraphs(CommandKind::MergeIntoPreviousAnswer, changes))
            }
            Edit::MergeBatch { ids } => {
                let mut ids = dedupe(ids)?;
                let mut order = Vec::with_capacity(ids.len());
                for id in &ids {
                    order.push(doc.position(*id)?);
                }
                let mut keyed: Vec<(usize, ParagraphId)> = order.into_iter().zip(ids).collect();
                keyed.sort_unstable_by_key(|(pos, _)| *pos);
                ids = keyed.into_iter().map(|(_, id)| id).collect();

                // Merge on a copy so a failure part-way leaves the document untouched.
                let mut scratch = doc.clone();
                let changes = merge_all(&mut scratch, &ids)?;
                *doc = scratch;
                Ok(Command::paragraphs(CommandKind::MergeIntoPreviousAnswer, changes))
            }
            Edit::SetExpectedCount { count } => {
                let pre = doc.expected_questions();
                doc.set_expected_questions(*count);
                Ok(Command {
                    kind: CommandKind::SetExpectedCount,
                    changes: Vec::new(),
                    expected_questions: Some(CountChange { pre, post: *count }),
                })
            }
        }
    }
}

fn dedupe(ids: &[ParagraphId]) -> Result<Vec<ParagraphId>, HistoryError> {
    let mut seen = HashSet::new();
    let ids: Vec<ParagraphId> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();
    if ids.is_empty() {
        return Err(HistoryError::EmptySelection);
    }
    Ok(ids)
}

/// Merge each id in turn. Every touched paragraph appears once, with its state
/// before the first merge and after the last.
fn merge_all(doc: &mut Document, ids: &[ParagraphId]) -> Result<Vec<StateChange>, DocumentError> {
    let mut pres: Vec<(ParagraphId, ParagraphState)> = Vec::new();
    for id in ids {
        let root = doc.merge_target(*id)?;
        for touched in [root, *id] {
            if !pres.iter().any(|(seen, _)| *seen == touched) {
                pres.push((touched, doc.get(touched)?.state()));
            }
        }
        doc.merge_into_previous_answer(*id)?;
    }

    pres.into_iter()
        .map(|(id, pre)| {
            Ok(StateChange {
                id,
                pre,
                post: doc.get(id)?.state(),
            })
        })
        .collect()
}

/// Single linear undo/redo stack. Executing a new command clears redo.
pub struct CommandHistory {
    undo_stack: VecDeque<Command>,
    redo_stack: Vec<Command>,
    max_history: usize,
}

impl CommandHistory {
    pub fn new(max_history: usize) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: Vec::new(),
            max_history: max_history.max(1),
        }
    }

    pub fn execute(&mut self, doc: &mut Document, edit: &Edit) -> Result<&Command, HistoryError> {
        let command = Command::perform(doc, edit)?;
        debug!(
            kind = ?command.kind,
            paragraphs = command.changes.len(),
            "[history] executed"
        );

        self.redo_stack.clear();
        self.undo_stack.push_back(command);
        if self.undo_stack.len() > self.max_history {
            self.undo_stack.pop_front();
            info!("[history] dropped oldest command (limit {})", self.max_history);
        }
        self.undo_stack.back().ok_or(HistoryError::NothingToUndo)
    }

    /// Revert the most recent command; returns the inverse that was applied
    pub fn undo(&mut self, doc: &mut Document) -> Result<Command, HistoryError> {
        let command = self.undo_stack.pop_back().ok_or(HistoryError::NothingToUndo)?;
        let inverse = command.inverse();
        if let Err(e) = inverse.apply(doc) {
            self.undo_stack.push_back(command);
            return Err(e.into());
        }
        debug!(kind = ?inverse.kind, "[history] undo");
        self.redo_stack.push(command);
        Ok(inverse)
    }

    /// Re-apply the most recently undone command
    pub fn redo(&mut self, doc: &mut Document) -> Result<Command, HistoryError> {
        let command = self.redo_stack.pop().ok_or(HistoryError::NothingToRedo)?;
        if let Err(e) = command.apply(doc) {
            self.redo_stack.push(command);
            return Err(e.into());
        }
        debug!(kind = ?command.kind, "[history] redo");
        self.undo_stack.push_back(command.clone());
        Ok(command)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }
}
