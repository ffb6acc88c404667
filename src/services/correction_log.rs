// Correction Log
// Append-only JSON-lines store of operator corrections, shared between the
// interactive path (writer) and the training worker (reader)

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{Correction, RoleStatistics};

#[derive(Error, Debug)]
pub enum CorrectionLogError {
    #[error("Correction log I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize correction: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One persisted line: the correction plus the session and document it came from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CorrectionRecord {
    pub session_id: Uuid,
    pub document: String,
    #[serde(flatten)]
    pub correction: Correction,
}

pub struct CorrectionLog {
    path: PathBuf,
    /// Number of valid records; the lock also serializes file access
    count: Mutex<usize>,
}

impl CorrectionLog {
    /// Open (or create) the log at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CorrectionLogError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if !path.exists() {
            File::create(&path)?;
        }

        let count = read_records(&path)?.len();
        info!("[correction_log] opened {} ({} records)", path.display(), count);
        Ok(Self {
            path,
            count: Mutex::new(count),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        // A panic while holding the lock cannot leave the count ahead of the file.
        self.count.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append records; returns the log length afterwards
    pub fn append(&self, records: &[CorrectionRecord]) -> Result<usize, CorrectionLogError> {
        let mut count = self.lock();
        if records.is_empty() {
            return Ok(*count);
        }

        let mut buf = String::new();
        for record in records {
            buf.push_str(&serde_json::to_string(record)?);
            buf.push('\n');
        }

        let mut f = OpenOptions::new().append(true).create(true).open(&self.path)?;
        f.write_all(buf.as_bytes())?;
        f.sync_data()?;

        *count += records.len();
        debug!(
            appended = records.len(),
            total = *count,
            "[correction_log] appended corrections"
        );
        Ok(*count)
    }

    /// All valid records in append order; unreadable lines are skipped
    pub fn read_all(&self) -> Result<Vec<CorrectionRecord>, CorrectionLogError> {
        let _guard = self.lock();
        read_records(&self.path)
    }

    pub fn len(&self) -> usize {
        *self.lock()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counts per confirmed role
    pub fn stats(&self) -> Result<RoleStatistics, CorrectionLogError> {
        let mut stats = RoleStatistics::default();
        for record in self.read_all()? {
            stats.add(record.correction.confirmed_role);
        }
        Ok(stats)
    }

    /// Drop every record
    pub fn reset(&self) -> Result<(), CorrectionLogError> {
        let mut count = self.lock();
        File::create(&self.path)?;
        *count = 0;
        info!("[correction_log] reset {}", self.path.display());
        Ok(())
    }
}

fn read_records(path: &Path) -> Result<Vec<CorrectionRecord>, CorrectionLogError> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CorrectionRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(
                "[correction_log] skipping unreadable line {} in {}: {}",
                line_no + 1,
                path.display(),
                e
            ),
        }
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ParagraphId, Role};
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(text: &str, confirmed: Role) -> CorrectionRecord {
        CorrectionRecord {
            session_id: Uuid::new_v4(),
            document: "review.docx".to_string(),
            correction: Correction {
                paragraph_id: ParagraphId::new(),
                text: text.to_string(),
                classified_role: Role::Answer,
                confirmed_role: confirmed,
                timestamp: Utc::now(),
            },
        }
    }

    #[test]
    fn test_append_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("corrections.jsonl");
        {
            let log = CorrectionLog::open(&path).unwrap();
            assert_eq!(log.append(&[record("What is venue?", Role::Question)]).unwrap(), 1);
        }

        let log = CorrectionLog::open(&path).unwrap();
        assert_eq!(log.len(), 1);
        let records = log.read_all().unwrap();
        assert_eq!(records[0].correction.confirmed_role, Role::Question);
        assert_eq!(records[0].document, "review.docx");
    }

    #[test]
    fn test_corrupt_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("corrections.jsonl");
        let log = CorrectionLog::open(&path).unwrap();
        log.append(&[record("First", Role::Answer)]).unwrap();

        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "{{not json").unwrap();
        drop(f);
        log.append(&[record("Second", Role::Ignore)]).unwrap();

        let reopened = CorrectionLog::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.read_all().unwrap().len(), 2);
    }

    #[test]
    fn test_stats_and_reset() {
        let dir = TempDir::new().unwrap();
        let log = CorrectionLog::open(dir.path().join("c.jsonl")).unwrap();
        log.append(&[
            record("Q one?", Role::Question),
            record("Q two?", Role::Question),
            record("Footer", Role::Ignore),
        ])
        .unwrap();

        let stats = log.stats().unwrap();
        assert_eq!(stats.question, 2);
        assert_eq!(stats.ignore, 1);

        log.reset().unwrap();
        assert!(log.is_empty());
        assert!(log.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_record_serialization_is_flat() {
        let json = serde_json::to_string(&record("Text", Role::Answer)).unwrap();
        assert!(json.contains("\"sessionId\""));
        assert!(json.contains("\"confirmedRole\":\"answer\""));
        assert!(!json.contains("\"correction\""));
    }
}
