use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use nudge_transcriber::{
    network::{MonitorConfig, NetworkEvent, NetworkMonitor},
    protocol::{
        ClientConfig, TranscriptionClient, DEFAULT_REFINEMENT_MODEL, DEFAULT_REFINEMENT_URL,
        DEFAULT_TRANSCRIPTION_MODEL, DEFAULT_TRANSCRIPTION_URL,
    },
    queue::{QueueConfig, TranscriptionQueue},
    store::FsRecordingStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::interval;
use tracing::{error, info, warn};

/// Default system instruction for the transcript refinement pass.
const DEFAULT_REFINEMENT_PROMPT: &str = "You clean up voice journal transcripts. Fix punctuation \
    and obvious transcription mistakes, keep the author's words and tone, and do not add \
    commentary.";

#[derive(Parser)]
#[command(name = "nudge-transcriber")]
#[command(about = "Offline-resilient transcription daemon for Nudge voice journals")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Args {
    /// Directory holding recordings and their finished transcripts
    #[arg(long, default_value = "/var/lib/nudge-transcriber/recordings")]
    pub recordings_dir: PathBuf,

    /// Durable snapshot of the pending-job queue
    #[arg(long, default_value = "/var/lib/nudge-transcriber/queue.json")]
    pub queue_file: PathBuf,

    /// API key for the transcription service
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true, default_value = "")]
    pub api_key: String,

    /// Speech-to-text endpoint
    #[arg(long, default_value = DEFAULT_TRANSCRIPTION_URL)]
    pub transcription_url: String,

    /// Chat-completion endpoint for transcript refinement
    #[arg(long, default_value = DEFAULT_REFINEMENT_URL)]
    pub refinement_url: String,

    /// Speech-to-text model
    #[arg(long, default_value = DEFAULT_TRANSCRIPTION_MODEL)]
    pub transcription_model: String,

    /// Refinement model
    #[arg(long, default_value = DEFAULT_REFINEMENT_MODEL)]
    pub refinement_model: String,

    /// System instruction for the refinement pass
    #[arg(long, default_value = DEFAULT_REFINEMENT_PROMPT)]
    pub refinement_prompt: String,

    /// Store raw speech-to-text output without the refinement pass
    #[arg(long)]
    pub skip_refinement: bool,

    /// URL probed to estimate network quality
    #[arg(long, default_value = "https://www.gstatic.com/generate_204")]
    pub probe_url: String,

    /// Seconds between scheduled quality probes
    #[arg(long, default_value = "120")]
    pub probe_interval: u64,

    /// Seconds before a deferred re-attempt when jobs remain queued
    #[arg(long, default_value = "30")]
    pub retry_delay: u64,

    /// Seconds between scans of the recordings directory
    #[arg(long, default_value = "15")]
    pub scan_interval: u64,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Daemon wiring: the coordinating context that owns the monitor, the queue
/// and the store for the process lifetime.
pub struct TranscriberService {
    args: Args,
    monitor: Arc<NetworkMonitor>,
    queue: TranscriptionQueue,
    store: Arc<FsRecordingStore>,
}

impl TranscriberService {
    pub async fn new(args: Args) -> Result<Self> {
        if args.api_key.trim().is_empty() {
            warn!("no API key configured; every transcription attempt will be dropped");
        }

        let monitor = Arc::new(NetworkMonitor::new(MonitorConfig {
            probe_url: args.probe_url.clone(),
            ..MonitorConfig::default()
        }));

        let mut client_config = ClientConfig::new(args.api_key.clone());
        client_config.transcription_url = args.transcription_url.clone();
        client_config.refinement_url = args.refinement_url.clone();
        client_config.transcription_model = args.transcription_model.clone();
        client_config.refinement_model = args.refinement_model.clone();
        let client = Arc::new(TranscriptionClient::new(client_config));

        let store = Arc::new(
            FsRecordingStore::new(&args.recordings_dir)
                .context("Failed to open recordings directory")?,
        );

        let mut queue_config = QueueConfig::new(&args.queue_file);
        queue_config.retry_delay = Duration::from_secs(args.retry_delay);
        if !args.skip_refinement {
            queue_config = queue_config.with_refinement_prompt(args.refinement_prompt.clone());
        }

        let queue = TranscriptionQueue::new(queue_config, monitor.clone(), client, store.clone())
            .await
            .context("Failed to restore transcription queue")?;

        Ok(Self {
            args,
            monitor,
            queue,
            store,
        })
    }

    pub async fn start(&self) -> Result<()> {
        // Establish an initial quality estimate, then keep it fresh.
        self.monitor.probe_quality(true).await;
        let probe_handle = self
            .monitor
            .spawn_probe_loop(Duration::from_secs(self.args.probe_interval));
        let scan_handle = self.spawn_scan_loop();
        let regate_handle = self.spawn_regate_loop();

        // Jobs restored from the snapshot should not wait for the scanner.
        self.queue.attempt_process_pending().await;

        info!("transcriber service started");
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C signal");
            }
            _ = wait_for_term_signal() => {
                info!("Received TERM signal");
            }
        }

        probe_handle.abort();
        scan_handle.abort();
        regate_handle.abort();

        info!("transcriber service stopped");
        Ok(())
    }

    /// Periodically sweep the recordings directory for files that still
    /// need transcription. Enqueueing is idempotent, so re-seeing a pending
    /// recording is harmless.
    fn spawn_scan_loop(&self) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let queue = self.queue.clone();
        let every = Duration::from_secs(self.args.scan_interval);

        tokio::spawn(async move {
            let mut ticker = interval(every);
            loop {
                ticker.tick().await;
                match store.pending_recordings().await {
                    Ok(pending) => {
                        for id in pending {
                            queue.enqueue(id).await;
                        }
                    }
                    Err(err) => {
                        error!(error = %err, "failed to scan recordings directory");
                    }
                }
            }
        })
    }

    /// Re-gate the queue whenever network quality becomes usable again.
    fn spawn_regate_loop(&self) -> tokio::task::JoinHandle<()> {
        let mut events = self.monitor.subscribe();
        let queue = self.queue.clone();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(NetworkEvent::QualityChanged { quality }) if quality.usable_for_transcription() => {
                        queue.process_if_possible().await;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(unix)]
async fn wait_for_term_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    if let Ok(mut stream) = signal(SignalKind::terminate()) {
        stream.recv().await;
    }
}

#[cfg(not(unix))]
async fn wait_for_term_signal() {
    futures::future::pending::<()>().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level: tracing::Level = args.log_level.into();
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    info!("Starting Nudge Transcriber v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration:");
    info!("  Recordings dir: {}", args.recordings_dir.display());
    info!("  Queue file: {}", args.queue_file.display());
    info!("  Transcription model: {}", args.transcription_model);
    info!("  Refinement: {}", if args.skip_refinement { "disabled" } else { args.refinement_model.as_str() });
    info!("  Probe URL: {}", args.probe_url);
    info!("  Log level: {:?}", args.log_level);

    let service = TranscriberService::new(args)
        .await
        .context("Failed to create transcriber service")?;

    if let Err(e) = service.start().await {
        error!("Service error: {}", e);
        return Err(e);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parsing() {
        let args = Args::parse_from([
            "nudge-transcriber",
            "--recordings-dir",
            "/tmp/nudge/recordings",
            "--skip-refinement",
            "--log-level",
            "debug",
        ]);

        assert_eq!(args.recordings_dir, PathBuf::from("/tmp/nudge/recordings"));
        assert!(args.skip_refinement);
        assert!(matches!(args.log_level, LogLevel::Debug));
        assert_eq!(args.retry_delay, 30);
    }

    #[test]
    fn test_defaults_follow_service_endpoints() {
        let args = Args::parse_from(["nudge-transcriber"]);
        assert_eq!(args.transcription_url, DEFAULT_TRANSCRIPTION_URL);
        assert_eq!(args.refinement_url, DEFAULT_REFINEMENT_URL);
        assert_eq!(args.transcription_model, "whisper-1");
    }
}
