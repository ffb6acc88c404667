// qaVerifier Core Services

pub mod analysis;
pub mod classifier;
pub mod config_store;
pub mod correction_log;
pub mod document_reader;
pub mod export;
pub mod history;
pub mod text_processor;
pub mod training;

pub use analysis::{AnalysisError, AnalysisService, LoadReport};
pub use config_store::*;
pub use correction_log::{CorrectionLog, CorrectionLogError, CorrectionRecord};
pub use document_reader::{read_document, ReaderError, SourceDocument};
pub use export::{write_qa_csv, write_rows_csv, ExportError};
pub use history::{Command, CommandHistory, CommandKind, CountChange, Edit, HistoryError, StateChange};
pub use text_processor::*;
