// Document Reader
// Extracts ordered paragraph text from .docx and plain-text files

use std::fs;
use std::path::Path;

use docx_rs::{read_docx, DocumentChild, ParagraphChild, RunChild};
use thiserror::Error;
use tracing::info;

use super::text_processor::{normalize_punctuation, split_paragraphs};

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse docx: {0}")]
    Docx(String),
    #[error("Unsupported file type: {0}")]
    UnsupportedFormat(String),
    #[error("No readable paragraphs in {0}")]
    Empty(String),
}

/// A file's display name and its paragraphs in source order
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub name: String,
    pub paragraphs: Vec<String>,
}

/// Read a document from disk. Never returns an empty paragraph list.
pub fn read_document(path: &Path) -> Result<SourceDocument, ReaderError> {
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string());
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    let bytes = fs::read(path).map_err(|source| ReaderError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let paragraphs = match ext.as_str() {
        "docx" => docx_paragraphs(&bytes)?,
        "txt" | "md" => split_paragraphs(&String::from_utf8_lossy(&bytes)),
        other => return Err(ReaderError::UnsupportedFormat(other.to_string())),
    };

    if paragraphs.is_empty() {
        return Err(ReaderError::Empty(name));
    }

    info!(
        "[document_reader] read {} paragraphs from {}",
        paragraphs.len(),
        name
    );
    Ok(SourceDocument { name, paragraphs })
}

/// Paragraph texts of a .docx; runs within a paragraph are concatenated.
pub fn docx_paragraphs(bytes: &[u8]) -> Result<Vec<String>, ReaderError> {
    let docx = read_docx(bytes).map_err(|e| ReaderError::Docx(format!("{:?}", e)))?;

    let paragraphs = docx
        .document
        .children
        .iter()
        .filter_map(|child| match child {
            DocumentChild::Paragraph(para) => Some(para),
            _ => None,
        })
        .map(|para| {
            let mut text = String::new();
            for child in &para.children {
                if let ParagraphChild::Run(run) = child {
                    for rc in &run.children {
                        if let RunChild::Text(t) = rc {
                            text.push_str(&t.text);
                        }
                    }
                }
            }
            normalize_punctuation(&text)
        })
        .filter(|t| !t.is_empty())
        .collect();

    Ok(paragraphs)
}
