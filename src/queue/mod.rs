//! Durable transcription job queue.
//!
//! The queue owns the pending-job list and its on-disk mirror. Jobs are
//! processed in insertion order, one batch at a time, and only while the
//! injected connectivity provider reports the network as usable. Failures
//! are classified: transient ones keep the job queued for a later pass,
//! permanent ones drop it and mark the recording as failed. Callers never
//! see errors from the queue; outcomes are observable through broadcast
//! events and the queue depth.

mod snapshot;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::network::ConnectivityProvider;
use crate::protocol::{Transcriber, TranscriptionRequest};
use crate::store::RecordingStore;
use crate::Result;

/// How one job left a processing pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Transcript stored, job removed
    Completed,
    /// Permanent failure, job removed
    Dropped,
    /// Transient failure, job kept for the next pass
    Retained,
}

/// State changes broadcast to listeners.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// Pending-job count changed (enqueue or removal)
    DepthChanged(usize),
    /// A processing pass was requested while the network is unusable
    Paused,
    /// One job finished a processing attempt
    JobFinished { id: Uuid, outcome: JobOutcome },
    /// A full batch finished; `pending` jobs remain queued for retry
    BatchFinished {
        succeeded: usize,
        failed: usize,
        pending: usize,
    },
}

/// Configuration for the transcription queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Durable snapshot of pending job ids
    pub snapshot_path: std::path::PathBuf,
    /// Delay before the single deferred re-attempt after a batch
    pub retry_delay: Duration,
    /// Refinement instruction; stage 2 is skipped when absent
    pub refinement_prompt: Option<String>,
}

impl QueueConfig {
    pub fn new(snapshot_path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            snapshot_path: snapshot_path.into(),
            retry_delay: Duration::from_secs(30),
            refinement_prompt: None,
        }
    }

    pub fn with_refinement_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.refinement_prompt = Some(prompt.into());
        self
    }
}

/// Durable queue of pending transcription jobs.
///
/// Cheap to clone; all clones share the same state. One instance per
/// process: the coordinating context constructs it with its collaborators
/// and owns it for the process lifetime.
#[derive(Clone)]
pub struct TranscriptionQueue {
    config: Arc<QueueConfig>,
    connectivity: Arc<dyn ConnectivityProvider>,
    transcriber: Arc<dyn Transcriber>,
    store: Arc<dyn RecordingStore>,
    pending: Arc<RwLock<Vec<Uuid>>>,
    /// At most one batch in flight
    processing: Arc<AtomicBool>,
    /// At most one deferred re-attempt scheduled
    retry_scheduled: Arc<AtomicBool>,
    events: broadcast::Sender<QueueEvent>,
}

impl TranscriptionQueue {
    /// Create a queue, restoring the pending-job list from its snapshot.
    pub async fn new(
        config: QueueConfig,
        connectivity: Arc<dyn ConnectivityProvider>,
        transcriber: Arc<dyn Transcriber>,
        store: Arc<dyn RecordingStore>,
    ) -> Result<Self> {
        let restored = snapshot::load(&config.snapshot_path)?;
        if !restored.is_empty() {
            info!(jobs = restored.len(), "restored pending transcription jobs");
        }
        let (events, _) = broadcast::channel(64);

        Ok(Self {
            config: Arc::new(config),
            connectivity,
            transcriber,
            store,
            pending: Arc::new(RwLock::new(restored)),
            processing: Arc::new(AtomicBool::new(false)),
            retry_scheduled: Arc::new(AtomicBool::new(false)),
            events,
        })
    }

    /// Subscribe to queue state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Number of pending jobs.
    pub async fn len(&self) -> usize {
        self.pending.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.read().await.is_empty()
    }

    /// Snapshot of the pending job ids, in processing order.
    pub async fn pending_jobs(&self) -> Vec<Uuid> {
        self.pending.read().await.clone()
    }

    /// Queue a finished recording for transcription.
    ///
    /// Idempotent: re-enqueueing an id that is already pending is a no-op.
    /// The updated list is persisted before a processing pass is attempted.
    pub async fn enqueue(&self, id: Uuid) {
        let depth = {
            let mut pending = self.pending.write().await;
            if pending.contains(&id) {
                debug!(%id, "job already queued");
                return;
            }
            pending.push(id);
            self.persist(&pending);
            pending.len()
        };

        info!(%id, depth, "queued recording for transcription");
        self.emit(QueueEvent::DepthChanged(depth));
        self.process_if_possible().await;
    }

    /// Start a processing pass if connectivity allows, no batch is running,
    /// and jobs are pending. Each failed precondition is a quiet no-op; an
    /// unusable network additionally emits [`QueueEvent::Paused`].
    pub async fn process_if_possible(&self) {
        if !self.connectivity.usable_for_transcription().await {
            debug!("queue paused: offline");
            self.emit(QueueEvent::Paused);
            return;
        }
        if self.pending.read().await.is_empty() {
            return;
        }
        if self
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("batch already in flight");
            return;
        }

        let queue = self.clone();
        tokio::spawn(async move {
            queue.run_batch().await;
        });
    }

    /// Manual trigger for a processing pass, identical to
    /// [`Self::process_if_possible`].
    pub async fn attempt_process_pending(&self) {
        self.process_if_possible().await;
    }

    /// Process every job that was pending when the batch started. Jobs
    /// enqueued while the batch runs are picked up by the next one.
    async fn run_batch(&self) {
        let batch = self.pending.read().await.clone();
        debug!(jobs = batch.len(), "starting transcription batch");

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        for id in batch {
            match self.process_job(id).await {
                JobOutcome::Completed => succeeded += 1,
                JobOutcome::Dropped => failed += 1,
                JobOutcome::Retained => {}
            }
        }

        self.processing.store(false, Ordering::Release);

        let pending = self.len().await;
        info!(succeeded, failed, pending, "transcription batch finished");
        self.emit(QueueEvent::BatchFinished {
            succeeded,
            failed,
            pending,
        });

        if pending > 0 && self.connectivity.usable_for_transcription().await {
            self.schedule_retry();
        }
    }

    async fn process_job(&self, id: Uuid) -> JobOutcome {
        let Some(recording) = self.store.resolve(id).await else {
            // The media is gone; retrying cannot help.
            warn!(%id, "recording no longer exists, dropping job");
            return self.drop_job(id).await;
        };

        let mut request = TranscriptionRequest::new(recording);
        if let Some(prompt) = &self.config.refinement_prompt {
            request = request.with_refinement(prompt.clone());
        }

        match self.transcriber.transcribe(request).await {
            Ok(result) => {
                if let Err(err) = self
                    .store
                    .set_transcript(id, &result.final_text, result.original.as_deref())
                    .await
                {
                    error!(%id, error = %err, "failed to persist transcript, keeping job queued");
                    self.emit(QueueEvent::JobFinished {
                        id,
                        outcome: JobOutcome::Retained,
                    });
                    return JobOutcome::Retained;
                }
                self.store.mark_transcription_status(id, true).await;
                self.remove(id).await;
                info!(%id, "transcription complete");
                self.emit(QueueEvent::JobFinished {
                    id,
                    outcome: JobOutcome::Completed,
                });
                JobOutcome::Completed
            }
            Err(err) if err.is_recoverable() => {
                warn!(%id, error = %err, "transcription failed, will retry");
                self.emit(QueueEvent::JobFinished {
                    id,
                    outcome: JobOutcome::Retained,
                });
                JobOutcome::Retained
            }
            Err(err) => {
                error!(%id, error = %err, "transcription failed permanently, dropping job");
                self.drop_job(id).await
            }
        }
    }

    async fn drop_job(&self, id: Uuid) -> JobOutcome {
        self.remove(id).await;
        self.store.mark_transcription_status(id, false).await;
        self.emit(QueueEvent::JobFinished {
            id,
            outcome: JobOutcome::Dropped,
        });
        JobOutcome::Dropped
    }

    async fn remove(&self, id: Uuid) {
        let depth = {
            let mut pending = self.pending.write().await;
            pending.retain(|job| *job != id);
            self.persist(&pending);
            pending.len()
        };
        self.emit(QueueEvent::DepthChanged(depth));
    }

    /// Schedule exactly one deferred re-attempt after the configured delay.
    fn schedule_retry(&self) {
        if self
            .retry_scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        debug!(delay = ?self.config.retry_delay, "scheduling deferred re-attempt");
        let queue = self.clone();
        tokio::spawn(async move {
            sleep(queue.config.retry_delay).await;
            queue.retry_scheduled.store(false, Ordering::Release);
            queue.process_if_possible().await;
        });
    }

    /// Mirror the pending list to disk. A persistence failure is logged and
    /// the in-memory queue keeps going; the next mutation retries the write.
    fn persist(&self, pending: &[Uuid]) {
        if let Err(err) = snapshot::save(&self.config.snapshot_path, pending) {
            error!(error = %err, "failed to persist queue snapshot");
        }
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }
}
