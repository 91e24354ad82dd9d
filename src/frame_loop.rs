//! Per-frame scheduling
//!
//! The frame loop never schedules itself. It asks a [`FrameScheduler`] for the
//! next frame and checks its stop condition before every frame, so tests can
//! drive single frames with [`StepScheduler`] instead of real display timing.

use std::future::Future;
use tokio::time::{interval, Duration, Interval, MissedTickBehavior};

pub trait FrameScheduler: Send {
    /// Resolve when the next frame is due. `false` ends the loop.
    fn next_frame(&mut self) -> impl Future<Output = bool> + Send;
}

/// Real-time scheduler at a fixed frame rate. Late frames are skipped, not bunched.
pub struct IntervalScheduler {
    ticker: Interval,
}

impl IntervalScheduler {
    pub fn new(fps: u32) -> Self {
        let period = Duration::from_secs_f64(1.0 / f64::from(fps.max(1)));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { ticker }
    }
}

impl FrameScheduler for IntervalScheduler {
    async fn next_frame(&mut self) -> bool {
        self.ticker.tick().await;
        true
    }
}

/// Yields a fixed number of frames immediately, then reports exhaustion.
pub struct StepScheduler {
    remaining: u64,
}

impl StepScheduler {
    pub fn new(frames: u64) -> Self {
        Self { remaining: frames }
    }
}

impl FrameScheduler for StepScheduler {
    async fn next_frame(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        tokio::task::yield_now().await;
        true
    }
}

/// Run `on_frame` once per scheduled frame until `stop` returns true or the
/// scheduler is exhausted. Returns the number of frames run.
pub async fn start_loop<S, F, C>(scheduler: &mut S, mut on_frame: F, mut stop: C) -> u64
where
    S: FrameScheduler,
    F: FnMut(u64),
    C: FnMut() -> bool,
{
    let mut frames = 0u64;
    while !stop() {
        if !scheduler.next_frame().await {
            break;
        }
        if stop() {
            break;
        }
        on_frame(frames);
        frames += 1;
    }
    frames
}
