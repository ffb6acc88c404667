// Training Orchestrator
// Background worker that turns accumulated corrections into new checkpoint
// versions. The interactive path talks to it only through commands and an
// observable status snapshot.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::checkpoint::{CheckpointError, CheckpointMeta, CheckpointStore};
use crate::models::{Role, TrainingStatus};
use crate::services::classifier::{BackendFactory, ModelBackend, TrainingExample};
use crate::services::config_store::TrainingConfig;
use crate::services::correction_log::{CorrectionLog, CorrectionLogError, CorrectionRecord};
use crate::services::text_processor::normalize_for_model;

/// Corrections shorter than this are not used for training
const MIN_EXAMPLE_CHARS: usize = 10;
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("Training step failed: {0}")]
    StepFailed(String),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Log(#[from] CorrectionLogError),
    #[error("Training cycle cancelled")]
    Cancelled,
    #[error("Training worker unavailable: {0}")]
    Worker(String),
}

enum TrainingCommand {
    CorrectionsAppended,
    SaveBoundary,
    ForceTrain,
    Reset(oneshot::Sender<Result<(), String>>),
    /// Answered once every earlier command has been handled
    Settle(oneshot::Sender<()>),
    Shutdown,
}

/// Observable orchestrator state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingSnapshot {
    pub status: TrainingStatus,
    /// Newest committed checkpoint version
    pub latest_version: Option<u64>,
    /// Corrections logged since the newest checkpoint's cycle started
    pub pending: usize,
    pub cycles_completed: u64,
    /// Incomplete checkpoint writes discarded at startup
    pub recovered: usize,
    pub last_error: Option<String>,
}

pub struct TrainingOrchestrator {
    tx: mpsc::UnboundedSender<TrainingCommand>,
    status_rx: watch::Receiver<TrainingSnapshot>,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TrainingOrchestrator {
    /// Spawn the worker. Recovery of interrupted checkpoint writes happens on
    /// the worker; the snapshot reports `Recovering` until it is done.
    pub fn start(
        store: CheckpointStore,
        log: Arc<CorrectionLog>,
        factory: Arc<dyn BackendFactory>,
        config: TrainingConfig,
    ) -> Result<Self, TrainingError> {
        let needs_recovery = !store.incomplete()?.is_empty();
        let latest = store.load_latest()?.map(|cp| cp.meta);
        let consumed = latest.as_ref().map_or(0, |m| m.corrections_consumed);

        let initial = TrainingSnapshot {
            status: if needs_recovery {
                TrainingStatus::Recovering
            } else {
                TrainingStatus::Idle
            },
            latest_version: latest.as_ref().map(|m| m.version),
            pending: log.len().saturating_sub(consumed),
            cycles_completed: 0,
            recovered: 0,
            last_error: None,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(initial);
        let cancel = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            store,
            log,
            factory,
            config,
            cancel: cancel.clone(),
            status_tx,
            consumed,
        };
        let handle = std::thread::Builder::new()
            .name("qa-training".to_string())
            .spawn(move || worker.run(rx))
            .map_err(|e| TrainingError::Worker(e.to_string()))?;

        info!("[training] orchestrator started");
        Ok(Self {
            tx,
            status_rx,
            cancel,
            handle: Some(handle),
        })
    }

    fn send(&self, command: TrainingCommand) {
        if self.tx.send(command).is_err() {
            warn!("[training] worker is not running; notification dropped");
        }
    }

    /// New corrections were appended to the log
    pub fn notify_corrections(&self) {
        self.send(TrainingCommand::CorrectionsAppended);
    }

    /// The operator saved or exported a document
    pub fn notify_save(&self) {
        self.send(TrainingCommand::SaveBoundary);
    }

    /// Train on whatever is pending, regardless of batch size
    pub fn force_train(&self) {
        self.send(TrainingCommand::ForceTrain);
    }

    /// Clear the correction log and every checkpoint. Runs on the worker so it
    /// never races a cycle.
    pub fn reset(&self) -> Result<(), TrainingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(TrainingCommand::Reset(reply_tx))
            .map_err(|_| TrainingError::Worker("worker stopped".to_string()))?;
        reply_rx
            .blocking_recv()
            .map_err(|_| TrainingError::Worker("worker stopped".to_string()))?
            .map_err(TrainingError::Worker)
    }

    /// Block until the worker has handled every command sent so far, including
    /// any cycle they started. Returns false on timeout or if the worker stopped.
    pub fn settle(&self, timeout: Duration) -> bool {
        let (reply_tx, mut reply_rx) = oneshot::channel();
        if self.tx.send(TrainingCommand::Settle(reply_tx)).is_err() {
            return false;
        }
        let deadline = Instant::now() + timeout;
        loop {
            match reply_rx.try_recv() {
                Ok(()) => return true,
                Err(oneshot::error::TryRecvError::Closed) => return false,
                Err(oneshot::error::TryRecvError::Empty) => {}
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn snapshot(&self) -> TrainingSnapshot {
        self.status_rx.borrow().clone()
    }

    pub fn status(&self) -> TrainingStatus {
        self.status_rx.borrow().status
    }

    pub fn subscribe(&self) -> watch::Receiver<TrainingSnapshot> {
        self.status_rx.clone()
    }

    /// Poll the snapshot until `pred` holds or `timeout` elapses
    pub fn wait_for<F>(&self, timeout: Duration, pred: F) -> Option<TrainingSnapshot>
    where
        F: Fn(&TrainingSnapshot) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let snapshot = self.snapshot();
            if pred(&snapshot) {
                return Some(snapshot);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Stop the worker. An in-flight cycle aborts at its next chunk boundary
    /// unless it is already checkpointing.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.cancel.store(true, Ordering::SeqCst);
        let _ = self.tx.send(TrainingCommand::Shutdown);
        if handle.join().is_err() {
            warn!("[training] worker panicked during shutdown");
        }
        info!("[training] orchestrator stopped");
    }
}

impl Drop for TrainingOrchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    store: CheckpointStore,
    log: Arc<CorrectionLog>,
    factory: Arc<dyn BackendFactory>,
    config: TrainingConfig,
    cancel: Arc<AtomicBool>,
    status_tx: watch::Sender<TrainingSnapshot>,
    /// Log length at the start of the cycle that produced the newest checkpoint
    consumed: usize,
}

impl Worker {
    fn run(mut self, mut rx: mpsc::UnboundedReceiver<TrainingCommand>) {
        self.recover();
        self.maybe_train(false);

        while let Some(command) = rx.blocking_recv() {
            match command {
                TrainingCommand::CorrectionsAppended => self.maybe_train(false),
                TrainingCommand::SaveBoundary => self.maybe_train(true),
                TrainingCommand::ForceTrain => self.run_cycle(),
                TrainingCommand::Reset(reply) => {
                    let _ = reply.send(self.reset().map_err(|e| e.to_string()));
                }
                TrainingCommand::Settle(reply) => {
                    let _ = reply.send(());
                }
                TrainingCommand::Shutdown => break,
            }
        }
        debug!("[training] worker exiting");
    }

    fn publish(&self, update: impl FnOnce(&mut TrainingSnapshot)) {
        self.status_tx.send_modify(update);
    }

    fn pending(&self) -> usize {
        self.log.len().saturating_sub(self.consumed)
    }

    fn recover(&mut self) {
        let recovered = match self.store.discard_incomplete() {
            Ok(n) => n,
            Err(e) => {
                warn!("[training] recovery could not clean checkpoints: {}", e);
                0
            }
        };
        if recovered > 0 {
            info!(recovered, "[training] discarded interrupted checkpoint writes");
        }

        let pending = self.pending();
        self.publish(|s| {
            s.status = TrainingStatus::Idle;
            s.recovered = recovered;
            s.pending = pending;
        });
    }

    fn maybe_train(&mut self, save_boundary: bool) {
        let pending = self.pending();
        let due = pending >= self.config.min_batch_size.max(1) || (save_boundary && pending > 0);

        if due && self.ready() {
            self.run_cycle();
        } else {
            self.publish_waiting(pending);
        }
    }

    /// Enough usable examples for an automatic cycle
    fn ready(&self) -> bool {
        match self.log.read_all() {
            Ok(records) => {
                let examples = build_examples(&records, self.config.feature_dim);
                let ready = is_ready(&examples, self.config.min_training_examples);
                if !ready {
                    debug!(
                        examples = examples.len(),
                        "[training] not enough data to train yet"
                    );
                }
                ready
            }
            Err(e) => {
                warn!("[training] could not read corrections: {}", e);
                false
            }
        }
    }

    fn publish_waiting(&self, pending: usize) {
        self.publish(|s| {
            s.pending = pending;
            s.status = if pending > 0 {
                TrainingStatus::Collecting
            } else {
                TrainingStatus::Idle
            };
        });
    }

    fn run_cycle(&mut self) {
        self.publish(|s| s.status = TrainingStatus::Training);

        let outcome = self.train();
        let mut error = None;
        let mut committed = None;
        match outcome {
            Ok(Some((version, consumed))) => {
                self.consumed = consumed;
                committed = Some(version);
            }
            Ok(None) => {
                debug!("[training] no usable examples; cycle skipped");
                self.publish_waiting(self.pending());
                return;
            }
            Err(TrainingError::Cancelled) => info!("[training] cycle cancelled before checkpointing"),
            Err(e) => {
                warn!("[training] cycle failed, previous checkpoint retained: {}", e);
                error = Some(e.to_string());
            }
        }

        let pending = self.pending();
        self.publish(|s| {
            s.status = TrainingStatus::Idle;
            s.pending = pending;
            if let Some(version) = committed {
                s.latest_version = Some(version);
                s.cycles_completed += 1;
                s.last_error = None;
            }
            if error.is_some() {
                s.last_error = error;
            }
        });
    }

    /// One full cycle; returns the committed version and the log length it consumed
    fn train(&mut self) -> Result<Option<(u64, usize)>, TrainingError> {
        let records = self.log.read_all()?;
        let consumed = records.len();
        let examples = build_examples(&records, self.config.feature_dim);
        if examples.is_empty() {
            return Ok(None);
        }

        let mut backend: Box<dyn ModelBackend> = match self.store.load_model(self.factory.as_ref()) {
            Some(loaded) => {
                debug!(version = loaded.version, "[training] warm start");
                loaded.backend
            }
            None => self.factory.fresh(),
        };

        info!(
            examples = examples.len(),
            epochs = self.config.epochs,
            "[training] cycle started"
        );
        let chunk_size = self.config.chunk_size.max(1);
        for epoch in 0..self.config.epochs.max(1) {
            let mut loss_sum = 0.0;
            let mut chunks = 0usize;
            for chunk in examples.chunks(chunk_size) {
                if self.cancel.load(Ordering::SeqCst) {
                    return Err(TrainingError::Cancelled);
                }
                loss_sum += backend
                    .train_step(chunk)
                    .map_err(|e| TrainingError::StepFailed(e.to_string()))?;
                chunks += 1;
            }
            debug!(epoch, loss = loss_sum / chunks.max(1) as f64, "[training] epoch done");
        }
        if self.cancel.load(Ordering::SeqCst) {
            return Err(TrainingError::Cancelled);
        }

        self.publish(|s| s.status = TrainingStatus::Checkpointing);
        let artifact = backend
            .export()
            .map_err(|e| TrainingError::StepFailed(e.to_string()))?;
        let meta = CheckpointMeta {
            version: self.store.next_version()?,
            created_at: Utc::now(),
            example_count: examples.len(),
            corrections_consumed: consumed,
            feature_dim: backend.feature_dim(),
        };
        let version = self.store.stage(&meta, &artifact)?.commit()?;

        info!(version, examples = meta.example_count, "[training] new checkpoint");
        Ok(Some((version, consumed)))
    }

    fn reset(&mut self) -> Result<(), TrainingError> {
        self.store.purge()?;
        self.log.reset()?;
        self.consumed = 0;
        self.publish(|s| {
            s.status = TrainingStatus::Idle;
            s.latest_version = None;
            s.pending = 0;
            s.last_error = None;
        });
        info!("[training] training data reset");
        Ok(())
    }
}

/// At least `min_total` examples and at least one for every label
pub fn is_ready(examples: &[TrainingExample], min_total: usize) -> bool {
    let mut counts = [0usize; Role::LABELS.len()];
    for example in examples {
        if let Some(count) = counts.get_mut(example.label) {
            *count += 1;
        }
    }
    examples.len() >= min_total.max(1) && counts.iter().all(|c| *c > 0)
}

/// Usable training examples from the log: Unclassified confirmations and very
/// short texts are skipped, and a text confirmed more than once keeps only its
/// latest role.
pub fn build_examples(records: &[CorrectionRecord], feature_dim: usize) -> Vec<TrainingExample> {
    let mut seen = HashSet::new();
    let mut latest: Vec<(&str, Role)> = Vec::new();

    for record in records.iter().rev() {
        let correction = &record.correction;
        if correction.confirmed_role == Role::Unclassified
            || correction.text.trim().chars().count() < MIN_EXAMPLE_CHARS
        {
            continue;
        }
        if seen.insert(normalize_for_model(&correction.text)) {
            latest.push((correction.text.as_str(), correction.confirmed_role));
        }
    }
    latest.reverse();

    latest
        .into_iter()
        .filter_map(|(text, role)| TrainingExample::from_text(text, role, feature_dim))
        .collect()
}
