// Rule-Based Classifier
// Weighted surface-feature scoring for questions, structural heuristics for
// headings and page markers, and answer-block continuation

use regex::Regex;
use tracing::debug;

use super::{ClassifierError, ParagraphScorer, Score, ScoringContext};
use crate::models::Role;
use crate::services::text_processor::has_sentence_end_punctuation;

/// Question scoring weights
const W_QUESTION_MARK: i32 = 10;
const W_QUESTION_START: i32 = 8;
const W_WH_WORDS: i32 = 5;
const W_ACTION_WORDS: i32 = 5;
const W_NUMERIC_REFERENCE: i32 = 7;
const W_LENGTH: i32 = 3;
const W_NEXT_NUMBERED: i32 = 2;
const W_ANSWER_START: i32 = -5;
const W_HEADING_STYLE: i32 = -3;
const W_NUMBERED_START: i32 = 15;
const W_PREVIOUS_WAS_QUESTION: i32 = 3;
const W_CONTAINS_VS: i32 = 4;

/// Minimum weighted score for a Question
const QUESTION_SCORE_MIN: i32 = 15;
/// Paragraphs shorter than this are never scored as questions
const MIN_QUESTION_CHARS: usize = 8;
/// Leading positions where short unpunctuated lines count as front matter
const FRONT_MATTER_POSITIONS: usize = 5;
const FRONT_MATTER_MAX_CHARS: usize = 50;
const DEFAULT_QUESTION_COUNT: usize = 25;

pub struct RuleClassifier {
    question_start: Regex,
    wh_words: Regex,
    action_words: Regex,
    numeric_reference: Regex,
    numbered_start: Regex,
    numbered_prefix: Regex,
    answer_start: Regex,
    wh_start: Regex,
    versus: Regex,
    page_marker: Regex,
    title_count: Regex,
}

fn compile(pattern: &str) -> Result<Regex, ClassifierError> {
    Regex::new(pattern).map_err(|e| ClassifierError::Unavailable(format!("rule pattern: {}", e)))
}

impl RuleClassifier {
    pub fn new() -> Result<Self, ClassifierError> {
        Ok(Self {
            question_start: compile(
                r"(?i)^(what|when|where|why|how|name|which|is|are|does|do|can|could|would|should|list|explain|define|describe|identify)\b",
            )?,
            wh_words: compile(r"(?i)\b(what|when|where|why|how)\b")?,
            action_words: compile(r"(?i)\b(name|list|identify|describe|define|explain|discuss)\b")?,
            numeric_reference: compile(
                r"(?i)\d+\s+(kinds|types|requirements|grounds|factors|situations|matters|things|elements|cases|examples)",
            )?,
            numbered_start: compile(r"^\s*\d+\s*[\.\)]\s+")?,
            numbered_prefix: compile(r"^\s*(\d+)[\.\)]")?,
            answer_start: compile(r"^(The|A|An|Both|It|I|We|There|This|These|Those)\b")?,
            wh_start: compile(r"(?i)^(what|when|where|why|how)\b")?,
            versus: compile(r"(?i)\b(vs|versus)\b")?,
            page_marker: compile(r"(?i)^(page\s+\d+(\s+of\s+\d+)?|\d+)$")?,
            title_count: compile(r"(?i)(\d+)\s*(questions|problems|items)")?,
        })
    }

    /// Weighted likelihood that `text` is a question
    pub fn question_score(&self, text: &str, ctx: &ScoringContext<'_>) -> i32 {
        let mut score = 0;
        let len = text.chars().count();

        if text.contains('?') {
            score += W_QUESTION_MARK;
        }
        if self.question_start.is_match(text) {
            score += W_QUESTION_START;
        }
        if self.wh_words.is_match(text) {
            score += W_WH_WORDS;
        }
        if self.action_words.is_match(text) {
            score += W_ACTION_WORDS;
        }
        if self.numeric_reference.is_match(text) {
            score += W_NUMERIC_REFERENCE;
        }
        if len > 30 && len < 200 {
            score += W_LENGTH;
        }
        if ctx.next_text.is_some_and(|next| self.numbered_prefix.is_match(next)) {
            score += W_NEXT_NUMBERED;
        }
        if self.answer_start.is_match(text) {
            score += W_ANSWER_START;
        }
        if is_heading_style(text) {
            score += W_HEADING_STYLE;
        }
        if self.numbered_start.is_match(text) {
            score += W_NUMBERED_START;
        }
        if ctx
            .previous_text
            .is_some_and(|prev| prev.contains('?') || self.wh_start.is_match(prev))
        {
            score += W_PREVIOUS_WAS_QUESTION;
        }
        if self.versus.is_match(text) {
            score += W_CONTAINS_VS;
        }

        score
    }

    pub fn is_page_marker(&self, text: &str) -> bool {
        self.page_marker.is_match(text.trim())
    }

    /// Expected number of questions, from the strongest structural signal:
    /// a count in the header, the largest sequence number, the count of
    /// numbered paragraphs, the count of question marks, else a default.
    pub fn estimate_question_count<S: AsRef<str>>(&self, paragraphs: &[S]) -> usize {
        let title_count = paragraphs.iter().take(10).find_map(|p| {
            self.title_count
                .captures(p.as_ref())
                .and_then(|c| c[1].parse::<usize>().ok())
        });
        if let Some(count) = title_count {
            return count;
        }

        let numbers: Vec<usize> = paragraphs
            .iter()
            .filter_map(|p| {
                self.numbered_prefix
                    .captures(p.as_ref())
                    .and_then(|c| c[1].parse::<usize>().ok())
            })
            .collect();
        let max_seq = numbers.iter().copied().max().unwrap_or(0);
        if max_seq > 10 {
            return max_seq;
        }
        if numbers.len() > 10 {
            return numbers.len();
        }

        let question_marks = paragraphs.iter().filter(|p| p.as_ref().contains('?')).count();
        if question_marks > 5 {
            return question_marks;
        }

        DEFAULT_QUESTION_COUNT
    }
}

/// All-caps text (at least one cased letter) or a `**` prefix
fn is_heading_style(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.starts_with("**") {
        return true;
    }
    let mut cased = trimmed
        .chars()
        .filter(|c| c.is_lowercase() || c.is_uppercase())
        .peekable();
    cased.peek().is_some() && cased.all(char::is_uppercase)
}

impl ParagraphScorer for RuleClassifier {
    fn name(&self) -> &'static str {
        "rules"
    }

    fn score(&self, text: &str, ctx: &ScoringContext<'_>) -> Result<Score, ClassifierError> {
        let text = text.trim();
        let in_answer_block = matches!(ctx.previous_role, Some(Role::Question | Role::Answer));

        if self.is_page_marker(text) {
            return Ok(Score::new(Role::Ignore, 0.9));
        }
        if is_heading_style(text) {
            return Ok(Score::new(Role::Ignore, 0.8));
        }

        if text.chars().count() >= MIN_QUESTION_CHARS {
            let score = self.question_score(text, ctx);
            if score >= QUESTION_SCORE_MIN {
                debug!(index = ctx.index, score, "[rules] question");
                return Ok(Score::new(
                    Role::Question,
                    (0.5 + score as f64 / 60.0).min(0.95),
                ));
            }
        }

        if !in_answer_block
            && ctx.index < FRONT_MATTER_POSITIONS
            && text.chars().count() < FRONT_MATTER_MAX_CHARS
            && !has_sentence_end_punctuation(text)
        {
            return Ok(Score::new(Role::Ignore, 0.6));
        }

        match ctx.previous_role {
            Some(Role::Question) => Ok(Score::new(Role::Answer, 0.8)),
            Some(Role::Answer) => Ok(Score::new(Role::Answer, 0.7)),
            _ => Ok(Score::new(Role::Unclassified, 0.3)),
        }
    }
}
