//! Nudge Transcriber - offline-resilient voice journal transcription
//!
//! This crate is the transcription pipeline behind the Nudge journaling app.
//! Finished voice recordings are queued for remote transcription, and the
//! queue survives process restarts and network outages:
//!
//! - Durable pending-job list with atomic snapshot writes
//! - Active network quality probing that gates queue processing
//! - Two-stage speech-to-text + transcript refinement protocol
//! - Recoverable/non-recoverable failure classification with retry-or-drop
//! - Broadcast events for queue depth, pauses and per-job completion
//!
//! # Example
//!
//! ```no_run
//! use nudge_transcriber::{
//!     network::{MonitorConfig, NetworkMonitor},
//!     protocol::{ClientConfig, TranscriptionClient},
//!     queue::{QueueConfig, TranscriptionQueue},
//!     store::FsRecordingStore,
//! };
//! use std::sync::Arc;
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let monitor = Arc::new(NetworkMonitor::new(MonitorConfig::default()));
//!     let client = Arc::new(TranscriptionClient::new(ClientConfig::new("sk-...")));
//!     let store = Arc::new(FsRecordingStore::new("/var/lib/nudge/recordings")?);
//!
//!     let queue = TranscriptionQueue::new(
//!         QueueConfig::new("/var/lib/nudge/queue.json"),
//!         monitor.clone(),
//!         client,
//!         store,
//!     )
//!     .await?;
//!
//!     // A finished recording is handed to the queue by id; everything
//!     // else (gating, retries, persistence) happens behind the scenes.
//!     queue.enqueue(Uuid::new_v4()).await;
//!     Ok(())
//! }
//! ```

pub mod network;
pub mod protocol;
pub mod queue;
pub mod store;

// Re-export commonly used types for convenience
pub use network::{ConnectivityProvider, MonitorConfig, NetworkEvent, NetworkMonitor, NetworkQuality};
pub use protocol::{
    ClientConfig, TranscribeError, Transcriber, TranscriptionClient, TranscriptionRequest,
    TranscriptionResult,
};
pub use queue::{JobOutcome, QueueConfig, QueueEvent, TranscriptionQueue};
pub use store::{FsRecordingStore, RecordingStore, TranscriptRecord};

// Error types
use thiserror::Error;

/// Errors that can occur in the nudge-transcriber system
#[derive(Error, Debug)]
pub enum NudgeTranscriberError {
    /// Transcription protocol failure
    #[error("Transcription error: {0}")]
    Transcription(#[from] protocol::TranscribeError),

    /// Recording store failure
    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),

    /// Queue snapshot encoding/decoding error
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// UUID parsing error
    #[error("UUID error: {0}")]
    Uuid(#[from] uuid::Error),
}

/// Result type alias for nudge-transcriber operations
pub type Result<T> = std::result::Result<T, NudgeTranscriberError>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_constants() {
        assert!(!VERSION.is_empty());
        assert_eq!(NAME, "nudge-transcriber");
    }
}
