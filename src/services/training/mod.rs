// Training Services
// Checkpoint persistence and the background training worker

pub mod checkpoint;
pub mod orchestrator;

pub use checkpoint::{Checkpoint, CheckpointError, CheckpointMeta, CheckpointStore, StagedCheckpoint};
pub use orchestrator::{build_examples, TrainingError, TrainingOrchestrator, TrainingSnapshot};
