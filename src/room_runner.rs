//! Room runner - connects the event queue to the state machine and the channel

use crate::context::AppContext;
use crate::error::Result;
use crate::events::{ChannelEvent, RoomEvent};
use crate::frame_loop::{FrameScheduler, IntervalScheduler};
use crate::media::AudioUplink;
use crate::room::{RoomState, RoomStateMachine, RoomStatus};
use crate::session_channel::SessionChannel;
use crate::tracking::{run_tracking, Tracking};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Face tracking runs only while the room is `Active`.
enum TrackingSlot<S> {
    Idle(Option<Tracking<S>>),
    Running {
        cancel: CancellationToken,
        handle: JoinHandle<Tracking<S>>,
    },
}

impl<S: FrameScheduler + 'static> TrackingSlot<S> {
    fn sync(
        &mut self,
        status: RoomStatus,
        state_rx: &watch::Receiver<RoomState>,
        events_tx: &mpsc::UnboundedSender<RoomEvent>,
    ) -> Option<(CancellationToken, JoinHandle<Tracking<S>>)> {
        match self {
            TrackingSlot::Idle(parts) if status == RoomStatus::Active => {
                let parts = parts.take()?;
                let cancel = CancellationToken::new();
                let handle = tokio::spawn(run_tracking(
                    parts,
                    state_rx.clone(),
                    events_tx.clone(),
                    cancel.clone(),
                ));
                *self = TrackingSlot::Running { cancel, handle };
                None
            }
            TrackingSlot::Running { .. } if status != RoomStatus::Active => {
                match std::mem::replace(self, TrackingSlot::Idle(None)) {
                    TrackingSlot::Running { cancel, handle } => Some((cancel, handle)),
                    TrackingSlot::Idle(_) => None,
                }
            }
            _ => None,
        }
    }

    /// Stop a running task and close the attempt's window.
    async fn finish(&mut self) {
        *self = match std::mem::replace(self, TrackingSlot::Idle(None)) {
            TrackingSlot::Running { cancel, handle } => {
                TrackingSlot::Idle(join_tracking(cancel, handle).await)
            }
            idle => idle,
        };
        if let TrackingSlot::Idle(Some(parts)) = self {
            if parts.tracker.in_attempt() {
                let summary = parts.tracker.finish();
                info!(
                    "📊 Attempt closed: {} frames, avg attention {:.1}, {:.0}% attentive",
                    summary.total_frames_processed,
                    summary.average_attention_score,
                    summary.attention_percentage * 100.0
                );
            }
        }
    }
}

async fn join_tracking<S>(
    cancel: CancellationToken,
    handle: JoinHandle<Tracking<S>>,
) -> Option<Tracking<S>> {
    cancel.cancel();
    match handle.await {
        Ok(parts) => Some(parts),
        Err(e) => {
            error!("Tracking task failed: {}", e);
            None
        }
    }
}

/// Microphone uplink. Opened on the first `Active` and kept across room
/// channel drops; stopped when the match ends or the user leaves.
struct AudioSlot {
    pcm: mpsc::Receiver<Vec<i16>>,
    uplink: Option<AudioUplink>,
    opened: bool,
    exhausted: bool,
}

impl AudioSlot {
    async fn sync(
        &mut self,
        state: &RoomState,
        ctx: &AppContext,
        events_tx: &mpsc::UnboundedSender<RoomEvent>,
    ) {
        if state.status() == RoomStatus::Active && !self.opened && !state.left() {
            self.opened = true;
            let opened = async {
                let mut uplink = AudioUplink::connect(ctx, events_tx.clone()).await?;
                uplink.start().await?;
                Ok::<_, crate::media::MediaError>(uplink)
            };
            match opened.await {
                Ok(uplink) => self.uplink = Some(uplink),
                Err(e) => {
                    warn!("❌ Audio uplink unavailable: {}", e);
                    let _ = events_tx.send(RoomEvent::MediaFailure(format!("audio uplink: {e}")));
                }
            }
        } else if state.status().is_terminal() || state.left() {
            self.stop().await;
        }
    }

    async fn push(&mut self, samples: Option<Vec<i16>>) {
        let Some(samples) = samples else {
            debug!("PCM source finished");
            self.exhausted = true;
            return;
        };
        if let Some(uplink) = self.uplink.as_mut() {
            if let Err(e) = uplink.push_pcm(&samples).await {
                warn!("PCM chunk dropped: {}", e);
            }
        }
    }

    async fn stop(&mut self) {
        if let Some(uplink) = self.uplink.take() {
            if let Err(e) = uplink.stop().await {
                warn!("Audio uplink did not close cleanly: {}", e);
            }
        }
    }
}

/// Next PCM chunk once the uplink is streaming; pending otherwise.
async fn next_chunk(audio: &mut Option<AudioSlot>) -> Option<Vec<i16>> {
    match audio {
        Some(slot) if slot.uplink.is_some() && !slot.exhausted => slot.pcm.recv().await,
        _ => std::future::pending().await,
    }
}

/// Owns the state machine, the room channel, the tracking task and the
/// optional audio uplink for one session.
pub struct RoomRunner<S = IntervalScheduler> {
    ctx: AppContext,
    session_id: String,
    events_tx: mpsc::UnboundedSender<RoomEvent>,
    events_rx: mpsc::UnboundedReceiver<RoomEvent>,
    state_tx: watch::Sender<RoomState>,
    tracking: Option<Tracking<S>>,
    pcm: Option<mpsc::Receiver<Vec<i16>>>,
}

impl RoomRunner<IntervalScheduler> {
    pub fn new(ctx: AppContext, session_id: impl Into<String>) -> Self {
        let session_id = session_id.into();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(RoomStateMachine::new(session_id.clone()).state().clone());
        Self {
            ctx,
            session_id,
            events_tx,
            events_rx,
            state_tx,
            tracking: None,
            pcm: None,
        }
    }
}

impl<S: FrameScheduler + 'static> RoomRunner<S> {
    pub fn with_tracking<T: FrameScheduler + 'static>(self, tracking: Tracking<T>) -> RoomRunner<T> {
        RoomRunner {
            ctx: self.ctx,
            session_id: self.session_id,
            events_tx: self.events_tx,
            events_rx: self.events_rx,
            state_tx: self.state_tx,
            tracking: Some(tracking),
            pcm: self.pcm,
        }
    }

    /// Stream 16-bit mono PCM chunks to the transcription service while the
    /// match runs. Transcripts come back as this participant's transcript.
    pub fn with_audio(mut self, pcm: mpsc::Receiver<Vec<i16>>) -> Self {
        self.pcm = Some(pcm);
        self
    }

    /// Queue for local actions (`Ready`, `Leave`) and media failures.
    pub fn events(&self) -> mpsc::UnboundedSender<RoomEvent> {
        self.events_tx.clone()
    }

    /// Snapshot published after every event.
    pub fn subscribe(&self) -> watch::Receiver<RoomState> {
        self.state_tx.subscribe()
    }

    /// Run until the user leaves. Returns the last room state.
    pub async fn run(self) -> Result<RoomState> {
        let RoomRunner {
            ctx,
            session_id,
            events_tx,
            mut events_rx,
            state_tx,
            tracking,
            pcm,
        } = self;

        let mut machine = RoomStateMachine::new(session_id.clone());
        let mut channel = SessionChannel::new(ctx.clone(), events_tx.clone());
        let mut slot = TrackingSlot::Idle(tracking);
        let mut audio = pcm.map(|pcm| AudioSlot {
            pcm,
            uplink: None,
            opened: false,
            exhausted: false,
        });
        let state_rx = state_tx.subscribe();

        if let Err(e) = channel.connect(&session_id).await {
            machine.on_event(RoomEvent::Channel(ChannelEvent::Failed {
                reason: e.to_string(),
            }));
            publish(&state_tx, &machine);
            return Err(e);
        }

        let mut countdown = interval(Duration::from_secs(1));
        countdown.set_missed_tick_behavior(MissedTickBehavior::Delay);
        countdown.tick().await;

        info!("🏠 Room runner started for {}", session_id);

        loop {
            tokio::select! {
                _ = countdown.tick() => {
                    machine.on_event(RoomEvent::Tick);
                }
                event = events_rx.recv() => {
                    match event {
                        Some(event) => machine.on_event(event),
                        None => {
                            info!("Room event queue closed");
                            break;
                        }
                    }
                }
                chunk = next_chunk(&mut audio) => {
                    if let Some(audio) = audio.as_mut() {
                        audio.push(chunk).await;
                    }
                    continue;
                }
            }

            for message in machine.drain_messages() {
                match channel.send(&message).await {
                    Ok(true) => {}
                    Ok(false) => debug!("{} not sent, channel closed", message.kind()),
                    Err(e) => warn!("Failed to send {}: {}", message.kind(), e),
                }
            }

            if let Some((cancel, handle)) = slot.sync(machine.status(), &state_rx, &events_tx) {
                slot = TrackingSlot::Idle(join_tracking(cancel, handle).await);
            }
            if let Some(audio) = audio.as_mut() {
                audio.sync(machine.state(), &ctx, &events_tx).await;
            }

            publish(&state_tx, &machine);

            if machine.state().left() {
                break;
            }
        }

        slot.finish().await;
        if let Some(audio) = audio.as_mut() {
            audio.stop().await;
        }
        channel.disconnect().await;
        publish(&state_tx, &machine);
        info!("🏠 Room runner stopped ({})", machine.status());
        Ok(machine.state().clone())
    }
}

fn publish(state_tx: &watch::Sender<RoomState>, machine: &RoomStateMachine) {
    let snapshot = machine.state();
    state_tx.send_if_modified(|current| {
        if current == snapshot {
            false
        } else {
            *current = snapshot.clone();
            true
        }
    });
}
