//! Recording store collaborator.
//!
//! The queue never manages audio file lifecycle itself; it resolves job ids
//! to files and hands finished transcripts back through this trait. The
//! filesystem implementation below backs the service binary: recordings are
//! `<id>.<ext>` audio files in one directory, transcripts land next to them
//! as `<id>.json` records, and a permanently failed job leaves a
//! `<id>.failed` marker so it is not re-queued by the spool scanner.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

/// Audio extensions the store recognizes, most common first.
const AUDIO_EXTENSIONS: &[&str] = &["m4a", "mp4", "mp3", "wav", "flac", "ogg", "webm", "aac"];

/// External collaborator owning recordings and their transcripts.
#[async_trait]
pub trait RecordingStore: Send + Sync {
    /// Resolve a job id to the audio file backing it, if it still exists.
    async fn resolve(&self, id: Uuid) -> Option<PathBuf>;

    /// Persist the finished transcript for a recording.
    async fn set_transcript(
        &self,
        id: Uuid,
        final_text: &str,
        original_text: Option<&str>,
    ) -> Result<()>;

    /// Record whether transcription ultimately succeeded for this id.
    async fn mark_transcription_status(&self, id: Uuid, succeeded: bool);
}

/// Stored transcript record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptRecord {
    /// Final (possibly refined) transcript text
    pub final_text: String,
    /// Raw stage-1 transcript when refinement ran
    pub original_text: Option<String>,
    /// Timestamp when transcription completed
    pub transcribed_at: DateTime<Utc>,
}

/// Directory-backed [`RecordingStore`] used by the service binary.
pub struct FsRecordingStore {
    root: PathBuf,
}

impl FsRecordingStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create recordings directory {}", root.display()))?;
        Ok(Self { root })
    }

    fn transcript_path(&self, id: Uuid) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    fn failed_marker_path(&self, id: Uuid) -> PathBuf {
        self.root.join(format!("{id}.failed"))
    }

    /// Whether a transcript record already exists for this id.
    pub fn has_transcript(&self, id: Uuid) -> bool {
        self.transcript_path(id).exists()
    }

    /// Load a stored transcript record.
    pub async fn transcript(&self, id: Uuid) -> Result<TranscriptRecord> {
        let path = self.transcript_path(id);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read transcript {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse transcript {}", path.display()))
    }

    /// Scan the directory for recordings that still need transcription.
    ///
    /// Skips ids that already have a transcript and ids marked permanently
    /// failed; those need user intervention (re-record, fix credentials)
    /// rather than another automatic attempt.
    pub async fn pending_recordings(&self) -> Result<Vec<Uuid>> {
        let mut seen = HashSet::new();
        let mut pending = Vec::new();

        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .with_context(|| format!("Failed to read {}", self.root.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(id) = recording_id(&path) else {
                continue;
            };
            if !seen.insert(id) {
                continue;
            }
            if self.has_transcript(id) || self.failed_marker_path(id).exists() {
                continue;
            }
            pending.push(id);
        }

        Ok(pending)
    }
}

/// Parse `<uuid>.<audio-ext>` file names; anything else is not a recording.
fn recording_id(path: &Path) -> Option<Uuid> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    if !AUDIO_EXTENSIONS.contains(&extension.as_str()) {
        return None;
    }
    Uuid::parse_str(path.file_stem()?.to_str()?).ok()
}

#[async_trait]
impl RecordingStore for FsRecordingStore {
    async fn resolve(&self, id: Uuid) -> Option<PathBuf> {
        for extension in AUDIO_EXTENSIONS {
            let candidate = self.root.join(format!("{id}.{extension}"));
            if candidate.exists() {
                return Some(candidate);
            }
        }
        debug!(%id, "no recording file found for job");
        None
    }

    async fn set_transcript(
        &self,
        id: Uuid,
        final_text: &str,
        original_text: Option<&str>,
    ) -> Result<()> {
        let record = TranscriptRecord {
            final_text: final_text.to_string(),
            original_text: original_text.map(str::to_string),
            transcribed_at: Utc::now(),
        };

        let path = self.transcript_path(id);
        let encoded = serde_json::to_vec_pretty(&record)?;
        tokio::fs::write(&path, encoded)
            .await
            .with_context(|| format!("Failed to write transcript {}", path.display()))?;
        Ok(())
    }

    async fn mark_transcription_status(&self, id: Uuid, succeeded: bool) {
        let marker = self.failed_marker_path(id);
        if succeeded {
            if let Err(err) = tokio::fs::remove_file(&marker).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(%id, error = %err, "failed to clear failure marker");
                }
            }
        } else if let Err(err) = tokio::fs::write(&marker, b"").await {
            warn!(%id, error = %err, "failed to write failure marker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store_with_recording(id: Uuid) -> (TempDir, FsRecordingStore) {
        let dir = TempDir::new().unwrap();
        let store = FsRecordingStore::new(dir.path()).unwrap();
        std::fs::write(dir.path().join(format!("{id}.m4a")), b"fake audio").unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_resolve_finds_recording() {
        let id = Uuid::new_v4();
        let (_dir, store) = store_with_recording(id).await;

        let path = store.resolve(id).await.unwrap();
        assert!(path.ends_with(format!("{id}.m4a")));
        assert!(store.resolve(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_set_transcript_roundtrip() {
        let id = Uuid::new_v4();
        let (_dir, store) = store_with_recording(id).await;

        store
            .set_transcript(id, "Tried rock climbing today.", Some("tried rock climbing today"))
            .await
            .unwrap();

        assert!(store.has_transcript(id));
        let record = store.transcript(id).await.unwrap();
        assert_eq!(record.final_text, "Tried rock climbing today.");
        assert_eq!(record.original_text.as_deref(), Some("tried rock climbing today"));
    }

    #[tokio::test]
    async fn test_failure_marker_lifecycle() {
        let id = Uuid::new_v4();
        let (dir, store) = store_with_recording(id).await;
        let marker = dir.path().join(format!("{id}.failed"));

        store.mark_transcription_status(id, false).await;
        assert!(marker.exists());

        store.mark_transcription_status(id, true).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_pending_skips_transcribed_and_failed() {
        let dir = TempDir::new().unwrap();
        let store = FsRecordingStore::new(dir.path()).unwrap();

        let fresh = Uuid::new_v4();
        let done = Uuid::new_v4();
        let failed = Uuid::new_v4();
        for id in [fresh, done, failed] {
            std::fs::write(dir.path().join(format!("{id}.wav")), b"audio").unwrap();
        }
        // Stray non-recording files are ignored by the scan.
        std::fs::write(dir.path().join("notes.txt"), b"not audio").unwrap();

        store.set_transcript(done, "done", None).await.unwrap();
        store.mark_transcription_status(failed, false).await;

        let pending = store.pending_recordings().await.unwrap();
        assert_eq!(pending, vec![fresh]);
    }
}
