//! Room state machine
//!
//! Authoritative client-side model of one practice session. It is driven only
//! by [`RoomEvent`]s, performs no I/O, and queues outbound frames that the
//! runner drains and forwards to the session channel after every event.

use crate::attention::AttentionSample;
use crate::emotion::EmotionSample;
use crate::events::{ChannelEvent, RoomEvent};
use crate::protocol::{
    ConnectedPayload, GradeResult, InboundMessage, OutboundMessage, PlayerReadyPayload, Question,
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomStatus {
    Connecting,
    Connected,
    Waiting,
    Active,
    Completed,
    Disconnected,
    Error,
}

impl RoomStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomStatus::Connecting => "connecting",
            RoomStatus::Connected => "connected",
            RoomStatus::Waiting => "waiting",
            RoomStatus::Active => "active",
            RoomStatus::Completed => "completed",
            RoomStatus::Disconnected => "disconnected",
            RoomStatus::Error => "error",
        }
    }

    /// No message moves the room out of these.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RoomStatus::Completed | RoomStatus::Error)
    }
}

impl std::fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest tracking sample relayed from the peer
#[derive(Debug, Clone, PartialEq)]
pub struct PeerTracking {
    pub attention: AttentionSample,
    pub emotion: Option<EmotionSample>,
}

/// Read-only view of the session. Only [`RoomStateMachine`] mutates it.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomState {
    session_id: String,
    status: RoomStatus,
    self_id: Option<String>,
    peer_id: Option<String>,
    peer_present: bool,
    self_ready: bool,
    peer_ready: bool,
    question: Option<Question>,
    match_duration: Option<u32>,
    time_remaining: Option<u32>,
    time_warning: Option<String>,
    self_transcript: String,
    peer_transcript: String,
    peer_speaking: bool,
    peer_tracking: Option<PeerTracking>,
    self_result: Option<GradeResult>,
    peer_result: Option<GradeResult>,
    error: Option<String>,
    media_error: Option<String>,
    reconnect_attempt: Option<u32>,
    left: bool,
}

impl RoomState {
    fn new(session_id: String) -> Self {
        Self {
            session_id,
            status: RoomStatus::Connecting,
            self_id: None,
            peer_id: None,
            peer_present: false,
            self_ready: false,
            peer_ready: false,
            question: None,
            match_duration: None,
            time_remaining: None,
            time_warning: None,
            self_transcript: String::new(),
            peer_transcript: String::new(),
            peer_speaking: false,
            peer_tracking: None,
            self_result: None,
            peer_result: None,
            error: None,
            media_error: None,
            reconnect_attempt: None,
            left: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
    pub fn status(&self) -> RoomStatus {
        self.status
    }
    pub fn self_id(&self) -> Option<&str> {
        self.self_id.as_deref()
    }
    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }
    pub fn peer_present(&self) -> bool {
        self.peer_present
    }
    pub fn self_ready(&self) -> bool {
        self.self_ready
    }
    pub fn peer_ready(&self) -> bool {
        self.peer_ready
    }
    pub fn question(&self) -> Option<&Question> {
        self.question.as_ref()
    }
    pub fn match_duration(&self) -> Option<u32> {
        self.match_duration
    }
    pub fn time_remaining(&self) -> Option<u32> {
        self.time_remaining
    }
    pub fn time_warning(&self) -> Option<&str> {
        self.time_warning.as_deref()
    }
    pub fn self_transcript(&self) -> &str {
        &self.self_transcript
    }
    pub fn peer_transcript(&self) -> &str {
        &self.peer_transcript
    }
    pub fn peer_speaking(&self) -> bool {
        self.peer_speaking
    }
    pub fn peer_tracking(&self) -> Option<&PeerTracking> {
        self.peer_tracking.as_ref()
    }
    pub fn self_result(&self) -> Option<&GradeResult> {
        self.self_result.as_ref()
    }
    pub fn peer_result(&self) -> Option<&GradeResult> {
        self.peer_result.as_ref()
    }
    /// Reason shown to the user when `status` is `Error`.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
    pub fn media_error(&self) -> Option<&str> {
        self.media_error.as_deref()
    }
    /// Set while the channel is retrying.
    pub fn reconnect_attempt(&self) -> Option<u32> {
        self.reconnect_attempt
    }
    pub fn left(&self) -> bool {
        self.left
    }

    fn is_self(&self, player: &str) -> bool {
        self.self_id.as_deref() == Some(player)
    }
}

pub struct RoomStateMachine {
    state: RoomState,

    /// Auto-ready fires once per instance, however often `Connected` is re-entered.
    auto_ready_issued: bool,

    /// Outbound message queue (drained after each event)
    outbound: Vec<OutboundMessage>,
}

impl RoomStateMachine {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            state: RoomState::new(session_id.into()),
            auto_ready_issued: false,
            outbound: Vec::new(),
        }
    }

    pub fn state(&self) -> &RoomState {
        &self.state
    }

    pub fn status(&self) -> RoomStatus {
        self.state.status
    }

    /// Take the frames queued by the last events.
    pub fn drain_messages(&mut self) -> Vec<OutboundMessage> {
        std::mem::take(&mut self.outbound)
    }

    pub fn on_event(&mut self, event: RoomEvent) {
        if self.state.left {
            debug!("Room already left, ignoring {:?}", event);
            return;
        }

        match event {
            RoomEvent::Channel(channel) => self.on_channel(channel),

            RoomEvent::Ready => match self.state.status {
                RoomStatus::Connected | RoomStatus::Waiting => self.issue_ready(),
                status => debug!("Ready ignored while {}", status),
            },

            RoomEvent::Leave => {
                info!("🚪 Leaving room {}", self.state.session_id);
                self.state.left = true;
            }

            RoomEvent::Tick => {
                if self.state.status != RoomStatus::Active {
                    return;
                }
                if let Some(remaining) = self.state.time_remaining {
                    let remaining = remaining.saturating_sub(1);
                    self.state.time_remaining = Some(remaining);
                    if remaining == 0 {
                        info!("⏰ Local timer ran out");
                        self.complete();
                    }
                }
            }

            RoomEvent::TrackingSample { attention, emotion } => {
                if self.state.status == RoomStatus::Active {
                    self.outbound.push(OutboundMessage::FacialTracking {
                        attention,
                        emotion,
                        timestamp: chrono::Utc::now().timestamp_millis(),
                    });
                }
            }

            RoomEvent::MetricsReport(summary) => {
                if self.state.status == RoomStatus::Active {
                    self.outbound.push(OutboundMessage::AttentionMetrics(summary));
                } else {
                    debug!("Metrics report dropped while {}", self.state.status);
                }
            }

            RoomEvent::MediaFailure(reason) => {
                warn!("📷 Media failure: {}", reason);
                self.state.media_error = Some(reason);
            }
        }
    }

    fn on_channel(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened => {
                self.state.reconnect_attempt = None;
                if matches!(
                    self.state.status,
                    RoomStatus::Disconnected | RoomStatus::Connecting
                ) {
                    self.state.status = RoomStatus::Connecting;
                }
            }

            ChannelEvent::Message(message) => self.on_message(message),

            ChannelEvent::Unrecognized(tag) => {
                warn!("⚠️ Dropping frame with unrecognized tag {:?}", tag);
            }

            ChannelEvent::Closed { code, reason } => {
                if self.state.status.is_terminal() {
                    debug!("Channel closed ({}) after room finished", code);
                    return;
                }
                info!("🔌 Channel closed: {} {}", code, reason);
                self.state.status = RoomStatus::Disconnected;
                self.state.peer_speaking = false;
            }

            ChannelEvent::Reconnecting { attempt, delay } => {
                debug!("Reconnect attempt {} after {:?}", attempt, delay);
                self.state.reconnect_attempt = Some(attempt);
                if self.state.status == RoomStatus::Disconnected {
                    self.state.status = RoomStatus::Connecting;
                }
            }

            ChannelEvent::Failed { reason } => self.fail(reason),
        }
    }

    fn on_message(&mut self, message: InboundMessage) {
        if self.state.status == RoomStatus::Completed {
            self.on_message_after_completion(message);
            return;
        }

        match message {
            InboundMessage::Connected(payload) => self.on_connected(payload),

            InboundMessage::PlayerJoined { player } => {
                if !self.state.is_self(&player) {
                    info!("👋 Peer {} joined", player);
                    self.state.peer_id = Some(player);
                    self.state.peer_present = true;
                }
            }

            InboundMessage::PlayerLeft { player } => {
                if !self.state.is_self(&player) {
                    info!("👋 Peer {} left", player);
                    self.state.peer_present = false;
                    self.state.peer_speaking = false;
                }
            }

            InboundMessage::PlayerReady(payload) => self.on_player_ready(payload),

            InboundMessage::TimeUpdate { time_remaining } => {
                if self.state.status == RoomStatus::Error {
                    return;
                }
                self.state.time_remaining = Some(time_remaining);
                if time_remaining == 0 && self.state.status == RoomStatus::Active {
                    self.complete();
                }
            }

            InboundMessage::TimeWarning {
                message,
                time_remaining,
            } => {
                info!("⏳ {}", message);
                self.state.time_warning = Some(message);
                if let Some(remaining) = time_remaining {
                    self.state.time_remaining = Some(remaining);
                }
            }

            InboundMessage::MatchTimeExpired { message } => {
                if self.state.status == RoomStatus::Active {
                    info!("⏰ Match time expired: {}", message);
                    self.state.time_remaining = Some(0);
                    self.complete();
                } else {
                    debug!("Expiry ignored while {}", self.state.status);
                }
            }

            InboundMessage::MatchGraded { results } => {
                self.store_results(results);
                if self.state.status == RoomStatus::Active {
                    self.complete();
                }
            }

            InboundMessage::Transcription { player, text, .. } => {
                self.append_transcript(player.as_deref(), &text);
            }

            InboundMessage::PlayerSpeaking {
                player,
                speaking,
                text,
            } => {
                if !self.state.is_self(&player) {
                    self.state.peer_speaking = speaking;
                }
                if let Some(text) = text {
                    self.append_transcript(Some(player.as_str()), &text);
                }
            }

            InboundMessage::FacialTracking {
                player,
                attention,
                emotion,
                ..
            } => {
                let from_self = player.as_deref().is_some_and(|p| self.state.is_self(p));
                if !from_self {
                    self.state.peer_tracking = Some(PeerTracking { attention, emotion });
                }
            }

            InboundMessage::Error { reason } => self.fail(reason),
        }
    }

    /// Status is frozen; late grades and presence are still recorded.
    fn on_message_after_completion(&mut self, message: InboundMessage) {
        match message {
            InboundMessage::MatchGraded { results } => self.store_results(results),
            InboundMessage::PlayerLeft { player } if !self.state.is_self(&player) => {
                self.state.peer_present = false;
                self.state.peer_speaking = false;
            }
            InboundMessage::Transcription { player, text, .. } => {
                self.append_transcript(player.as_deref(), &text);
            }
            other => debug!("Room completed, ignoring {:?}", other),
        }
    }

    fn on_connected(&mut self, payload: ConnectedPayload) {
        if self.state.status == RoomStatus::Error {
            return;
        }
        info!(
            "✅ Joined room {} as {} (ready: {})",
            self.state.session_id, payload.player_uid, payload.is_ready
        );

        self.state.self_id = Some(payload.player_uid);
        self.state.self_ready = payload.is_ready;
        self.state.reconnect_attempt = None;
        if let Some(question) = payload.question {
            self.state.question = Some(question);
        }
        if payload.match_duration_seconds.is_some() {
            self.state.match_duration = payload.match_duration_seconds;
        }
        if payload.time_remaining.is_some() {
            self.state.time_remaining = payload.time_remaining;
        }

        match payload.status.as_deref() {
            Some("active") if self.state.question.is_some() => {
                // match started while we were away
                self.state.self_ready = true;
                self.state.peer_ready = true;
                if self.state.time_remaining.is_none() {
                    self.state.time_remaining = self.state.match_duration;
                }
                self.activate();
            }
            Some("completed") => self.complete(),
            _ => {
                self.state.status = RoomStatus::Connected;
                if !self.state.self_ready && !self.auto_ready_issued {
                    self.auto_ready_issued = true;
                    info!("🙋 Auto-ready");
                    self.issue_ready();
                }
            }
        }
    }

    fn on_player_ready(&mut self, payload: PlayerReadyPayload) {
        if self.state.status == RoomStatus::Error {
            return;
        }

        if self.state.is_self(&payload.player) {
            self.state.self_ready = true;
        } else {
            self.state.peer_id.get_or_insert(payload.player.clone());
            self.state.peer_present = true;
            self.state.peer_ready = true;
        }

        if payload.both_ready {
            if self.state.status == RoomStatus::Active {
                return;
            }
            self.state.self_ready = true;
            self.state.peer_ready = true;
            if payload.question.is_some() {
                self.state.question = payload.question;
            }
            self.state.match_duration = payload.match_duration_seconds;
            self.state.time_remaining = payload.match_duration_seconds;
            self.activate();
        } else if self.state.is_self(&payload.player) && self.state.status == RoomStatus::Connected
        {
            self.state.status = RoomStatus::Waiting;
            info!("⏳ Waiting for peer");
        }
    }

    fn issue_ready(&mut self) {
        // optimistic; the service confirms with player_ready
        self.state.self_ready = true;
        self.outbound.push(OutboundMessage::Ready);
    }

    fn activate(&mut self) {
        info!(
            "🎬 Match active ({}s)",
            self.state.time_remaining.unwrap_or_default()
        );
        self.state.status = RoomStatus::Active;
    }

    fn complete(&mut self) {
        info!("🏁 Match completed");
        self.state.status = RoomStatus::Completed;
        self.state.peer_speaking = false;
    }

    fn fail(&mut self, reason: String) {
        if self.state.status == RoomStatus::Completed {
            warn!("Error after completion: {}", reason);
            return;
        }
        if self.state.status == RoomStatus::Error && self.state.error.is_some() {
            // the first reason is the one the service gave
            debug!("Further error ignored: {}", reason);
            return;
        }
        warn!("❌ Room error: {}", reason);
        self.state.error = Some(reason);
        self.state.status = RoomStatus::Error;
    }

    fn store_results(&mut self, results: Vec<GradeResult>) {
        for result in results {
            if self.state.is_self(&result.player) {
                self.state.self_result = Some(result);
            } else {
                self.state.peer_result = Some(result);
            }
        }
    }

    /// No participant id means the frame came from our own transcriber.
    fn append_transcript(&mut self, player: Option<&str>, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let target = match player {
            Some(p) if !self.state.is_self(p) => &mut self.state.peer_transcript,
            _ => &mut self.state.self_transcript,
        };
        if !target.is_empty() {
            target.push(' ');
        }
        target.push_str(text);
    }
}
