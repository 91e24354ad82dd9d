//! Face tracking: detector samples in, room events out

use crate::attention::AttentionEstimator;
use crate::config::{ClientConfig, MetricsPayload};
use crate::emotion::EmotionClassifier;
use crate::error::{ClientError, Result};
use crate::events::RoomEvent;
use crate::frame_loop::{start_loop, FrameScheduler};
use crate::landmarks::LandmarkMesh;
use crate::metrics::{MetricsAggregator, MetricsSummary, TransmitPolicy};
use crate::room::RoomState;
use smallvec::SmallVec;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// External face detector. `None` means no face in this frame.
pub trait LandmarkSource: Send {
    fn detect(&mut self) -> Option<LandmarkMesh>;
}

/// Plays back meshes recorded as JSON lines.
pub struct ReplaySource {
    meshes: Vec<LandmarkMesh>,
    next: usize,
    looping: bool,
}

impl ReplaySource {
    pub fn new(meshes: Vec<LandmarkMesh>, looping: bool) -> Self {
        Self {
            meshes,
            next: 0,
            looping,
        }
    }

    /// One mesh per line; blank lines are skipped.
    pub fn from_path(path: impl AsRef<Path>, looping: bool) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let mut meshes = Vec::new();
        for (number, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let mesh = serde_json::from_str(line).map_err(|e| {
                ClientError::Protocol(format!("{}:{}: {}", path.display(), number + 1, e))
            })?;
            meshes.push(mesh);
        }
        info!("📼 Loaded {} recorded meshes from {}", meshes.len(), path.display());
        Ok(Self::new(meshes, looping))
    }

    pub fn len(&self) -> usize {
        self.meshes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty()
    }
}

impl LandmarkSource for ReplaySource {
    fn detect(&mut self) -> Option<LandmarkMesh> {
        if self.next >= self.meshes.len() {
            if !self.looping || self.meshes.is_empty() {
                return None;
            }
            self.next = 0;
        }
        let mesh = self.meshes.get(self.next).cloned();
        self.next += 1;
        mesh
    }
}

/// Scores frames and decides what goes to the room.
pub struct FaceTracker {
    estimator: AttentionEstimator,
    classifier: EmotionClassifier,
    aggregator: MetricsAggregator,
    policy: TransmitPolicy,
    payload: MetricsPayload,
}

impl FaceTracker {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            estimator: AttentionEstimator::default(),
            classifier: EmotionClassifier::default(),
            aggregator: MetricsAggregator::default(),
            policy: TransmitPolicy::new(config.metrics_cadence, &config.metrics_checkpoints),
            payload: config.metrics_payload,
        }
    }

    /// Open a fresh window for a new attempt.
    pub fn begin(&mut self) {
        self.aggregator.start_window();
        self.policy.reset();
    }

    /// Whether an attempt's window is open. A resumed run keeps adding to it.
    pub fn in_attempt(&self) -> bool {
        self.aggregator.is_open()
    }

    /// Drop the current attempt's history without closing the window.
    pub fn reset(&mut self) {
        self.aggregator.reset();
        self.policy.reset();
    }

    pub fn process_frame(
        &mut self,
        mesh: &LandmarkMesh,
        time_remaining: Option<u32>,
    ) -> SmallVec<[RoomEvent; 2]> {
        let attention = self.estimator.estimate(mesh);
        let emotion = self.classifier.classify(mesh);
        self.aggregator.record(&attention, &emotion);

        let mut out = SmallVec::new();
        if self.payload.sends_raw() {
            out.push(RoomEvent::TrackingSample { attention, emotion });
        }
        if self.payload.sends_summary() {
            if let Some(reason) = self.policy.poll(Instant::now(), time_remaining) {
                debug!("📊 Metrics due: {:?}", reason);
                out.push(RoomEvent::MetricsReport(self.aggregator.summary()));
            }
        }
        out
    }

    pub fn summary(&self) -> MetricsSummary {
        self.aggregator.summary()
    }

    /// Close the window and return its final summary.
    pub fn finish(&mut self) -> MetricsSummary {
        self.aggregator.stop_window();
        self.aggregator.summary()
    }
}

/// Everything one tracking run needs; handed back when the run ends.
pub struct Tracking<S> {
    pub tracker: FaceTracker,
    pub source: Box<dyn LandmarkSource>,
    pub scheduler: S,
}

/// Drive the tracker frame by frame until `cancel` fires, the scheduler runs
/// out or the room stops listening.
pub async fn run_tracking<S: FrameScheduler>(
    mut parts: Tracking<S>,
    room: watch::Receiver<RoomState>,
    events: mpsc::UnboundedSender<RoomEvent>,
    cancel: CancellationToken,
) -> Tracking<S> {
    let Tracking {
        tracker,
        source,
        scheduler,
    } = &mut parts;

    if tracker.in_attempt() {
        info!(
            "🎥 Face tracking resumed at {} frames",
            tracker.summary().total_frames_processed
        );
    } else {
        tracker.begin();
        info!("🎥 Face tracking started");
    }

    let room_gone = AtomicBool::new(false);
    let mut no_face = 0u64;

    let frames = start_loop(
        scheduler,
        |_| {
            let Some(mesh) = source.detect() else {
                no_face += 1;
                return;
            };
            let remaining = room.borrow().time_remaining();
            for event in tracker.process_frame(&mesh, remaining) {
                if events.send(event).is_err() {
                    room_gone.store(true, Ordering::Relaxed);
                }
            }
        },
        || cancel.is_cancelled() || room_gone.load(Ordering::Relaxed),
    )
    .await;

    if room_gone.load(Ordering::Relaxed) {
        warn!("Room event queue closed, tracking stopped");
    }

    // the window stays open; a reconnect resumes the same attempt
    let summary = tracker.summary();
    info!(
        "🎥 Face tracking paused after {} frames ({} without a face), avg attention {:.1}",
        frames, no_face, summary.average_attention_score
    );
    parts
}
