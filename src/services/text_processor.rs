// Text Processing Service
// Paragraph splitting for plain-text input and the single normalization
// routine shared by model inference and model training.

use regex::Regex;
use std::sync::LazyLock;

/// Token budget for model input; longer paragraphs are truncated.
pub const MAX_MODEL_TOKENS: usize = 128;

static SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\u{3000}\u{00A0}]").unwrap());
static HSPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t\x0C\x0B]+").unwrap());
static BLANK_LINE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n\s*\n").unwrap());
static NON_WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\s\?]").unwrap());
static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Normalize punctuation and whitespace in extracted text
pub fn normalize_punctuation(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let s = text
        .replace(['\u{201c}', '\u{201d}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace('\u{2014}', "-");

    let s = SPACE_RE.replace_all(&s, " ");
    let s = s.replace("\r\n", "\n").replace('\r', "\n");
    let s = HSPACE_RE.replace_all(&s, " ");

    s.lines()
        .map(|ln| ln.trim())
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Split plain text into paragraphs.
///
/// Text containing blank lines is split on them and each block's lines are
/// joined with a space; otherwise every non-empty line is a paragraph.
pub fn split_paragraphs(text: &str) -> Vec<String> {
    let text = normalize_punctuation(text);
    if text.is_empty() {
        return Vec::new();
    }

    if BLANK_LINE_RE.is_match(&text) {
        BLANK_LINE_RE
            .split(&text)
            .map(|block| {
                block
                    .lines()
                    .map(str::trim)
                    .filter(|ln| !ln.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .filter(|p| !p.is_empty())
            .collect()
    } else {
        text.lines()
            .map(str::trim)
            .filter(|ln| !ln.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Model input normalization. Inference and training both go through this
/// function; nothing else may prepare text for the model.
///
/// Lowercases, keeps word characters and `?` (split out as its own token),
/// collapses whitespace and truncates to `MAX_MODEL_TOKENS` tokens.
pub fn normalize_for_model(text: &str) -> String {
    let lower = text.to_lowercase();
    let cleaned = NON_WORD_RE.replace_all(&lower, " ");
    let spaced = cleaned.replace('?', " ? ");
    let collapsed = WS_RE.replace_all(spaced.trim(), " ");

    collapsed
        .split(' ')
        .filter(|t| !t.is_empty())
        .take(MAX_MODEL_TOKENS)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Unigrams and bigrams of the normalized text
pub fn model_ngrams(text: &str) -> Vec<String> {
    let normalized = normalize_for_model(text);
    let tokens: Vec<&str> = normalized.split(' ').filter(|t| !t.is_empty()).collect();

    let mut grams: Vec<String> = tokens.iter().map(|t| t.to_string()).collect();
    grams.extend(tokens.windows(2).map(|w| format!("{} {}", w[0], w[1])));
    grams
}

/// Check if text ends with sentence-ending punctuation
pub fn has_sentence_end_punctuation(s: &str) -> bool {
    matches!(
        s.trim().chars().last(),
        Some('。' | '！' | '？' | '.' | '!' | '?')
    )
}

/// Shorten text for log output
pub fn preview(s: &str, max_chars: usize) -> String {
    let mut out: String = s.chars().take(max_chars).collect();
    if s.chars().count() > max_chars {
        out.push_str("...");
    }
    out.replace('\n', " ")
}
