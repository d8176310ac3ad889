//! Network connectivity and quality monitoring.
//!
//! The monitor answers one question for the transcription queue: is the
//! network currently good enough to push a multi-megabyte audio upload
//! through? Reachability changes arrive via [`NetworkMonitor::set_connected`]
//! from whatever platform signal the embedder has; usability is estimated by
//! actively probing a small well-known URL and classifying the round trip.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

/// Discrete network usability tiers, ordered worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    /// No probe has completed yet
    Unknown,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl NetworkQuality {
    /// Whether an upload-heavy transcription call is worth attempting.
    pub fn usable_for_transcription(&self) -> bool {
        matches!(self, Self::Fair | Self::Good | Self::Excellent)
    }
}

impl std::fmt::Display for NetworkQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Poor => write!(f, "poor"),
            Self::Fair => write!(f, "fair"),
            Self::Good => write!(f, "good"),
            Self::Excellent => write!(f, "excellent"),
        }
    }
}

/// Classify a probe round trip into a quality tier.
pub fn classify_latency(elapsed: Duration) -> NetworkQuality {
    let millis = elapsed.as_millis();
    if millis < 150 {
        NetworkQuality::Excellent
    } else if millis < 400 {
        NetworkQuality::Good
    } else if millis < 1000 {
        NetworkQuality::Fair
    } else {
        NetworkQuality::Poor
    }
}

/// State changes broadcast to listeners (queue gating, UI badges).
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    ConnectivityChanged { connected: bool },
    QualityChanged { quality: NetworkQuality },
}

/// Configuration for the quality probe
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Fixed low-payload URL probed for round-trip latency
    pub probe_url: String,
    /// Hard timeout on the probe request
    pub probe_timeout: Duration,
    /// Minimum interval between unforced probes while quality is healthy
    pub probe_throttle: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_url: "https://www.gstatic.com/generate_204".to_string(),
            probe_timeout: Duration::from_secs(5),
            probe_throttle: Duration::from_secs(300),
        }
    }
}

/// Read-only view of connectivity state, injected into the queue.
///
/// [`NetworkMonitor`] is the production implementation; tests substitute a
/// fixed-state fake.
#[async_trait]
pub trait ConnectivityProvider: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn current_quality(&self) -> NetworkQuality;

    /// Combined gate the queue checks before each processing pass.
    async fn usable_for_transcription(&self) -> bool {
        self.is_connected() && self.current_quality().await.usable_for_transcription()
    }
}

/// Observes reachability and actively probes network quality.
///
/// One instance per process; the coordinating context owns it and hands an
/// `Arc` to the queue. Quality is only ever mutated by the probe (or the
/// pessimistic reset on disconnect) and every change is broadcast.
pub struct NetworkMonitor {
    config: MonitorConfig,
    http: reqwest::Client,
    connected: AtomicBool,
    quality: RwLock<NetworkQuality>,
    /// Completion time of the last successful probe, for throttling
    last_probe: RwLock<Option<Instant>>,
    /// At most one probe in flight; losers return the last known value
    probing: AtomicBool,
    events: broadcast::Sender<NetworkEvent>,
}

impl NetworkMonitor {
    /// Create a monitor. The path is assumed present until the embedder's
    /// reachability signal says otherwise; quality starts `Unknown` and is
    /// therefore not usable until a probe succeeds.
    pub fn new(config: MonitorConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.probe_timeout)
            .user_agent(format!("{}/{}", crate::NAME, crate::VERSION))
            .build()
            .expect("Failed to create HTTP client");
        let (events, _) = broadcast::channel(16);

        Self {
            config,
            http,
            connected: AtomicBool::new(true),
            quality: RwLock::new(NetworkQuality::Unknown),
            last_probe: RwLock::new(None),
            probing: AtomicBool::new(false),
            events,
        }
    }

    /// Subscribe to connectivity and quality change events.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    /// Feed a reachability transition from the underlying platform signal.
    ///
    /// Coming back online forces an immediate probe; going offline resets
    /// quality to `Poor` at once rather than waiting for a probe to fail.
    pub async fn set_connected(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::AcqRel);
        if was == connected {
            return;
        }

        info!(connected, "network reachability changed");
        let _ = self
            .events
            .send(NetworkEvent::ConnectivityChanged { connected });

        if connected {
            self.probe_quality(true).await;
        } else {
            self.set_quality(NetworkQuality::Poor).await;
        }
    }

    /// Estimate current network quality with a small timed GET.
    ///
    /// Re-probing is skipped while the last successful probe is fresh and
    /// quality is healthy, unless `force` is set. Probe failures never
    /// propagate; they simply yield `Poor` for this cycle.
    pub async fn probe_quality(&self, force: bool) -> NetworkQuality {
        if !force && self.probe_is_fresh().await {
            return self.current_quality().await;
        }

        if self
            .probing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("quality probe already in flight");
            return self.current_quality().await;
        }

        let started = Instant::now();
        let quality = match self.http.get(&self.config.probe_url).send().await {
            Ok(response) if response.status().is_success() => {
                let elapsed = started.elapsed();
                *self.last_probe.write().await = Some(Instant::now());
                let quality = classify_latency(elapsed);
                debug!(elapsed_ms = elapsed.as_millis() as u64, %quality, "quality probe completed");
                quality
            }
            Ok(response) => {
                warn!(status = %response.status(), "quality probe got non-success status");
                NetworkQuality::Poor
            }
            Err(err) => {
                warn!(error = %err, "quality probe failed");
                NetworkQuality::Poor
            }
        };

        self.set_quality(quality).await;
        self.probing.store(false, Ordering::Release);
        quality
    }

    /// Spawn a background task that keeps quality fresh on a fixed cadence.
    ///
    /// The caller owns the handle and aborts it on shutdown.
    pub fn spawn_probe_loop(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(every);
            loop {
                ticker.tick().await;
                monitor.probe_quality(false).await;
            }
        })
    }

    async fn probe_is_fresh(&self) -> bool {
        let quality = *self.quality.read().await;
        if matches!(quality, NetworkQuality::Unknown | NetworkQuality::Poor) {
            return false;
        }
        match *self.last_probe.read().await {
            Some(at) => at.elapsed() < self.config.probe_throttle,
            None => false,
        }
    }

    async fn set_quality(&self, quality: NetworkQuality) {
        let mut current = self.quality.write().await;
        if *current == quality {
            return;
        }
        *current = quality;
        drop(current);

        info!(%quality, "network quality changed");
        let _ = self.events.send(NetworkEvent::QualityChanged { quality });
    }
}

#[async_trait]
impl ConnectivityProvider for NetworkMonitor {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn current_quality(&self) -> NetworkQuality {
        *self.quality.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_monitor(probe_url: &str) -> NetworkMonitor {
        NetworkMonitor::new(MonitorConfig {
            probe_url: probe_url.to_string(),
            probe_timeout: Duration::from_secs(2),
            probe_throttle: Duration::from_secs(300),
        })
    }

    #[test]
    fn test_latency_classification() {
        assert_eq!(classify_latency(Duration::from_millis(100)), NetworkQuality::Excellent);
        assert_eq!(classify_latency(Duration::from_millis(300)), NetworkQuality::Good);
        assert_eq!(classify_latency(Duration::from_millis(800)), NetworkQuality::Fair);
        assert_eq!(classify_latency(Duration::from_millis(1200)), NetworkQuality::Poor);
    }

    #[test]
    fn test_classification_boundaries() {
        assert_eq!(classify_latency(Duration::from_millis(149)), NetworkQuality::Excellent);
        assert_eq!(classify_latency(Duration::from_millis(150)), NetworkQuality::Good);
        assert_eq!(classify_latency(Duration::from_millis(399)), NetworkQuality::Good);
        assert_eq!(classify_latency(Duration::from_millis(400)), NetworkQuality::Fair);
        assert_eq!(classify_latency(Duration::from_millis(999)), NetworkQuality::Fair);
        assert_eq!(classify_latency(Duration::from_millis(1000)), NetworkQuality::Poor);
    }

    #[test]
    fn test_usability_mapping() {
        assert!(!NetworkQuality::Unknown.usable_for_transcription());
        assert!(!NetworkQuality::Poor.usable_for_transcription());
        assert!(NetworkQuality::Fair.usable_for_transcription());
        assert!(NetworkQuality::Good.usable_for_transcription());
        assert!(NetworkQuality::Excellent.usable_for_transcription());
    }

    #[tokio::test]
    async fn test_failed_probe_yields_poor() {
        // Nothing listens on port 9; the probe error must map to Poor.
        let monitor = test_monitor("http://127.0.0.1:9/");
        let quality = monitor.probe_quality(true).await;
        assert_eq!(quality, NetworkQuality::Poor);
        assert_eq!(monitor.current_quality().await, NetworkQuality::Poor);
    }

    #[tokio::test]
    async fn test_disconnect_resets_quality_without_probing() {
        let monitor = test_monitor("http://127.0.0.1:9/");
        *monitor.quality.write().await = NetworkQuality::Good;
        let mut events = monitor.subscribe();

        monitor.set_connected(false).await;

        assert!(!monitor.is_connected());
        assert_eq!(monitor.current_quality().await, NetworkQuality::Poor);
        assert!(!monitor.usable_for_transcription().await);

        let event = events.recv().await.unwrap();
        assert!(matches!(event, NetworkEvent::ConnectivityChanged { connected: false }));
    }

    #[tokio::test]
    async fn test_throttle_returns_cached_quality() {
        // The URL is unreachable, so any real probe would degrade quality to
        // Poor; still reading Good proves the throttle short-circuited.
        let monitor = test_monitor("http://127.0.0.1:9/");
        *monitor.quality.write().await = NetworkQuality::Good;
        *monitor.last_probe.write().await = Some(Instant::now());

        let quality = monitor.probe_quality(false).await;
        assert_eq!(quality, NetworkQuality::Good);
    }

    #[tokio::test]
    async fn test_poor_quality_is_always_reprobed() {
        let monitor = test_monitor("http://127.0.0.1:9/");
        *monitor.quality.write().await = NetworkQuality::Poor;
        *monitor.last_probe.write().await = Some(Instant::now());

        // Not throttled while Poor, so the unreachable URL is probed again.
        assert!(!monitor.probe_is_fresh().await);
        let quality = monitor.probe_quality(false).await;
        assert_eq!(quality, NetworkQuality::Poor);
    }
}
