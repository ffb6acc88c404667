// Export Service
// Writes verified labeling as CSV: flat `role,text` rows or grouped Q&A rows

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use thiserror::Error;
use tracing::info;

use crate::models::{ExportRow, QaPair};

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Failed to write export: {0}")]
    Io(#[from] std::io::Error),
}

/// Quote a CSV field when it contains a delimiter, quote or line break
pub fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Write `role,text` rows
pub fn write_rows<W: Write>(
    out: &mut W,
    rows: &[ExportRow],
    include_header: bool,
) -> Result<(), ExportError> {
    if include_header {
        writeln!(out, "role,text")?;
    }
    for row in rows {
        writeln!(out, "{},{}", row.role, csv_field(&row.text))?;
    }
    Ok(())
}

/// Write one row per question: `"<n>. question",answer,answer,...`
pub fn write_qa_pairs<W: Write>(out: &mut W, pairs: &[QaPair]) -> Result<(), ExportError> {
    for pair in pairs {
        let mut fields = vec![csv_field(&format!("{}. {}", pair.number, pair.question))];
        fields.extend(pair.answers.iter().map(|a| csv_field(a)));
        writeln!(out, "{}", fields.join(","))?;
    }
    Ok(())
}

pub fn write_rows_csv(path: &Path, rows: &[ExportRow], include_header: bool) -> Result<(), ExportError> {
    let mut out = BufWriter::new(File::create(path)?);
    write_rows(&mut out, rows, include_header)?;
    out.flush()?;
    info!("[export] wrote {} rows to {}", rows.len(), path.display());
    Ok(())
}

pub fn write_qa_csv(path: &Path, pairs: &[QaPair]) -> Result<(), ExportError> {
    let mut out = BufWriter::new(File::create(path)?);
    write_qa_pairs(&mut out, pairs)?;
    out.flush()?;
    info!("[export] wrote {} questions to {}", pairs.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    #[test]
    fn test_csv_field_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a, b"), "\"a, b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_write_rows_with_header() {
        let rows = vec![
            ExportRow { role: Role::Question, text: "What is venue?".into() },
            ExportRow { role: Role::Answer, text: "Place, of trial.".into() },
        ];
        let mut buf = Vec::new();
        write_rows(&mut buf, &rows, true).unwrap();
        let csv = String::from_utf8(buf).unwrap();
        assert_eq!(csv, "role,text\nquestion,What is venue?\nanswer,\"Place, of trial.\"\n");
    }

    #[test]
    fn test_write_qa_pairs() {
        let pairs = vec![QaPair {
            number: 1,
            question: "What is venue?".into(),
            answers: vec!["The place of trial.".into(), "See rule 3.".into()],
        }];
        let mut buf = Vec::new();
        write_qa_pairs(&mut buf, &pairs).unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "1. What is venue?,The place of trial.,See rule 3.\n"
        );
    }
}
