//! Metrics aggregation and the transmit policy for tracking summaries
//!
//! The aggregator folds every recorded frame into running sums, so a summary
//! is always computed over the whole current window without keeping the
//! individual samples around.

use crate::attention::{AttentionSample, GOOD_ATTENTION_THRESHOLD};
use crate::emotion::{Emotion, EmotionSample};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Summary sent to the service as `attention_metrics`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub average_attention_score: f32,
    /// Fraction in [0,1] of frames scoring above the good-attention threshold.
    pub attention_percentage: f32,
    pub total_frames_processed: u64,
    pub tracking_duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dominant_emotion: Option<Emotion>,
}

impl MetricsSummary {
    pub fn empty() -> Self {
        Self {
            average_attention_score: 0.0,
            attention_percentage: 0.0,
            total_frames_processed: 0,
            tracking_duration_seconds: 0.0,
            dominant_emotion: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsAggregator {
    threshold: f32,
    frames: u64,
    score_sum: f64,
    good_frames: u64,
    emotion_counts: [u64; 5],
    window_open: bool,
    started_at: Option<Instant>,
    stopped_at: Option<Instant>,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new(GOOD_ATTENTION_THRESHOLD)
    }
}

impl MetricsAggregator {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            frames: 0,
            score_sum: 0.0,
            good_frames: 0,
            emotion_counts: [0; 5],
            window_open: false,
            started_at: None,
            stopped_at: None,
        }
    }

    /// Clear history and open a new window starting now.
    pub fn start_window(&mut self) {
        self.clear();
        self.window_open = true;
        self.started_at = Some(Instant::now());
        debug!("📊 Metrics window opened");
    }

    /// Close the window. History is kept so the final summary stays available.
    pub fn stop_window(&mut self) {
        if self.window_open {
            self.window_open = false;
            self.stopped_at = Some(Instant::now());
            debug!("📊 Metrics window closed after {} frames", self.frames);
        }
    }

    pub fn is_open(&self) -> bool {
        self.window_open
    }

    /// Fold one frame into the window. Ignored while no window is open.
    pub fn record(&mut self, attention: &AttentionSample, emotion: &EmotionSample) {
        if !self.window_open {
            return;
        }
        let score = attention.attention_score.clamp(0.0, 100.0);
        self.frames += 1;
        self.score_sum += f64::from(score);
        if score > self.threshold {
            self.good_frames += 1;
        }
        self.emotion_counts[emotion.emotion.index()] += 1;
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Summary of the current window. No side effects.
    pub fn summary(&self) -> MetricsSummary {
        if self.frames == 0 {
            return MetricsSummary {
                tracking_duration_seconds: self.elapsed().as_secs_f64(),
                ..MetricsSummary::empty()
            };
        }

        let frames = self.frames as f64;
        let dominant = Emotion::ALL
            .iter()
            .copied()
            .fold((None, 0u64), |acc, emotion| {
                let count = self.emotion_counts[emotion.index()];
                if count > acc.1 {
                    (Some(emotion), count)
                } else {
                    acc
                }
            })
            .0;

        MetricsSummary {
            average_attention_score: (self.score_sum / frames) as f32,
            attention_percentage: (self.good_frames as f64 / frames) as f32,
            total_frames_processed: self.frames,
            tracking_duration_seconds: self.elapsed().as_secs_f64(),
            dominant_emotion: dominant,
        }
    }

    /// Drop history and start time. An open window stays open and restarts its clock.
    pub fn reset(&mut self) {
        self.clear();
        if self.window_open {
            self.started_at = Some(Instant::now());
        }
        debug!("📊 Metrics reset");
    }

    fn clear(&mut self) {
        self.frames = 0;
        self.score_sum = 0.0;
        self.good_frames = 0;
        self.emotion_counts = [0; 5];
        self.started_at = None;
        self.stopped_at = None;
    }

    fn elapsed(&self) -> Duration {
        match (self.started_at, self.stopped_at) {
            (Some(start), Some(stop)) => stop.saturating_duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }
}

/// Why a summary is due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitReason {
    TrackingStarted,
    Cadence,
    /// Remaining-time checkpoint, in seconds
    Checkpoint(u32),
}

/// Decides when a tracking summary goes out: once on start, every `cadence`,
/// and once per remaining-time checkpoint.
#[derive(Debug, Clone)]
pub struct TransmitPolicy {
    cadence: Duration,
    checkpoints: SmallVec<[u32; 4]>,
    fired: SmallVec<[u32; 4]>,
    started: bool,
    last_sent: Option<Instant>,
}

impl TransmitPolicy {
    pub fn new(cadence: Duration, checkpoints: &[u32]) -> Self {
        let mut checkpoints: SmallVec<[u32; 4]> = checkpoints.iter().copied().collect();
        // largest first so a big jump in remaining time fires the nearest one
        checkpoints.sort_unstable_by(|a, b| b.cmp(a));
        checkpoints.dedup();
        Self {
            cadence,
            checkpoints,
            fired: SmallVec::new(),
            started: false,
            last_sent: None,
        }
    }

    pub fn poll(&mut self, now: Instant, time_remaining: Option<u32>) -> Option<TransmitReason> {
        if !self.started {
            self.started = true;
            self.last_sent = Some(now);
            return Some(TransmitReason::TrackingStarted);
        }

        if let Some(remaining) = time_remaining {
            let crossed: SmallVec<[u32; 4]> = self
                .checkpoints
                .iter()
                .copied()
                .filter(|cp| remaining <= *cp && !self.fired.contains(cp))
                .collect();
            if let Some(lowest) = crossed.iter().copied().min() {
                // one send covers every checkpoint crossed since the last poll
                self.fired.extend(crossed);
                self.last_sent = Some(now);
                return Some(TransmitReason::Checkpoint(lowest));
            }
        }

        let due = self
            .last_sent
            .map_or(true, |last| now.saturating_duration_since(last) >= self.cadence);
        if due {
            self.last_sent = Some(now);
            return Some(TransmitReason::Cadence);
        }

        None
    }

    /// Forget everything so the next poll counts as a fresh start.
    pub fn reset(&mut self) {
        self.started = false;
        self.fired.clear();
        self.last_sent = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attention::GazeDirection;

    fn attention(score: f32) -> AttentionSample {
        AttentionSample {
            is_looking_at_camera: score > GOOD_ATTENTION_THRESHOLD,
            attention_score: score,
            gaze_direction: GazeDirection::Center,
        }
    }

    fn emotion(emotion: Emotion) -> EmotionSample {
        EmotionSample {
            emotion,
            confidence: 50.0,
        }
    }

    #[test]
    fn empty_window_reports_zero() {
        let mut agg = MetricsAggregator::default();
        agg.start_window();
        let summary = agg.summary();
        assert_eq!(summary.average_attention_score, 0.0);
        assert_eq!(summary.attention_percentage, 0.0);
        assert_eq!(summary.total_frames_processed, 0);
        assert!(summary.dominant_emotion.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn summary_is_mean_and_fraction_above_threshold() {
        let mut agg = MetricsAggregator::default();
        agg.start_window();
        for score in [100.0, 80.0, 70.0, 50.0] {
            agg.record(&attention(score), &emotion(Emotion::Neutral));
        }

        let summary = agg.summary();
        assert_eq!(summary.total_frames_processed, 4);
        assert!((summary.average_attention_score - 75.0).abs() < 1e-4);
        // 70 itself is not above the threshold
        assert!((summary.attention_percentage - 0.5).abs() < 1e-6);
        assert_eq!(summary, agg.summary());
    }

    #[test]
    fn records_outside_a_window_are_ignored() {
        let mut agg = MetricsAggregator::default();
        agg.record(&attention(90.0), &emotion(Emotion::Happy));
        assert_eq!(agg.frames(), 0);

        agg.start_window();
        agg.record(&attention(90.0), &emotion(Emotion::Happy));
        agg.stop_window();
        agg.record(&attention(10.0), &emotion(Emotion::Sad));

        let summary = agg.summary();
        assert_eq!(summary.total_frames_processed, 1);
        assert_eq!(summary.dominant_emotion, Some(Emotion::Happy));
    }

    #[test]
    fn dominant_emotion_breaks_ties_in_label_order() {
        let mut agg = MetricsAggregator::default();
        agg.start_window();
        agg.record(&attention(90.0), &emotion(Emotion::Angry));
        agg.record(&attention(90.0), &emotion(Emotion::Sad));
        agg.record(&attention(90.0), &emotion(Emotion::Angry));
        agg.record(&attention(90.0), &emotion(Emotion::Sad));
        assert_eq!(agg.summary().dominant_emotion, Some(Emotion::Sad));
    }

    #[tokio::test(start_paused = true)]
    async fn duration_follows_the_window() {
        let mut agg = MetricsAggregator::default();
        agg.start_window();
        tokio::time::advance(Duration::from_secs(12)).await;
        assert_eq!(agg.summary().tracking_duration_seconds, 12.0);

        agg.stop_window();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(agg.summary().tracking_duration_seconds, 12.0);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_history_but_keeps_window_state() {
        let mut agg = MetricsAggregator::default();
        agg.start_window();
        agg.record(&attention(90.0), &emotion(Emotion::Happy));
        tokio::time::advance(Duration::from_secs(3)).await;

        agg.reset();
        assert!(agg.is_open());
        assert_eq!(agg.summary().total_frames_processed, 0);
        assert_eq!(agg.summary().tracking_duration_seconds, 0.0);

        agg.record(&attention(40.0), &emotion(Emotion::Sad));
        assert_eq!(agg.frames(), 1);

        agg.stop_window();
        agg.reset();
        assert!(!agg.is_open());
        assert_eq!(agg.summary(), MetricsSummary::empty());
    }

    #[test]
    fn summary_wire_shape() {
        let summary = MetricsSummary {
            average_attention_score: 81.5,
            attention_percentage: 0.75,
            total_frames_processed: 40,
            tracking_duration_seconds: 2.0,
            dominant_emotion: Some(Emotion::Happy),
        };
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["averageAttentionScore"], 81.5);
        assert_eq!(value["attentionPercentage"], 0.75);
        assert_eq!(value["totalFramesProcessed"], 40);
        assert_eq!(value["trackingDurationSeconds"], 2.0);
        assert_eq!(value["dominantEmotion"], "Happy");
    }

    #[tokio::test(start_paused = true)]
    async fn policy_fires_on_start_then_on_cadence() {
        let mut policy = TransmitPolicy::new(Duration::from_secs(5), &[10, 5, 1]);
        let t0 = Instant::now();

        assert_eq!(policy.poll(t0, Some(120)), Some(TransmitReason::TrackingStarted));
        assert_eq!(policy.poll(t0 + Duration::from_secs(4), Some(116)), None);
        assert_eq!(
            policy.poll(t0 + Duration::from_secs(5), Some(115)),
            Some(TransmitReason::Cadence)
        );
        assert_eq!(policy.poll(t0 + Duration::from_secs(6), Some(114)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn checkpoints_fire_once_each() {
        let mut policy = TransmitPolicy::new(Duration::from_secs(60), &[10, 5, 1]);
        let t0 = Instant::now();
        policy.poll(t0, Some(30));

        assert_eq!(
            policy.poll(t0 + Duration::from_secs(20), Some(10)),
            Some(TransmitReason::Checkpoint(10))
        );
        assert_eq!(policy.poll(t0 + Duration::from_secs(21), Some(9)), None);
        assert_eq!(
            policy.poll(t0 + Duration::from_secs(25), Some(5)),
            Some(TransmitReason::Checkpoint(5))
        );
        // jumping past the last checkpoint still fires it once
        assert_eq!(
            policy.poll(t0 + Duration::from_secs(29), Some(0)),
            Some(TransmitReason::Checkpoint(1))
        );
        assert_eq!(policy.poll(t0 + Duration::from_secs(29), Some(0)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn skipped_checkpoints_collapse_into_one_send() {
        let mut policy = TransmitPolicy::new(Duration::from_secs(60), &[10, 5, 1]);
        let t0 = Instant::now();
        policy.poll(t0, Some(30));

        assert_eq!(
            policy.poll(t0 + Duration::from_secs(1), Some(3)),
            Some(TransmitReason::Checkpoint(5))
        );
        assert_eq!(
            policy.poll(t0 + Duration::from_secs(2), Some(1)),
            Some(TransmitReason::Checkpoint(1))
        );

        policy.reset();
        assert_eq!(
            policy.poll(t0 + Duration::from_secs(3), Some(1)),
            Some(TransmitReason::TrackingStarted)
        );
    }
}
