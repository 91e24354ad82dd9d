use crate::attention::AttentionSample;
use crate::emotion::EmotionSample;
use crate::metrics::MetricsSummary;
use crate::protocol::InboundMessage;
use std::time::Duration;

/// What the session channel reports to the room
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Socket open and auth frame written.
    Opened,
    Message(InboundMessage),
    /// Frame with a tag this client does not handle.
    Unrecognized(String),
    Closed {
        code: u16,
        reason: String,
    },
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    /// Terminal; the channel will not retry.
    Failed {
        reason: String,
    },
}

/// Single event queue consumed by the room runner
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    Channel(ChannelEvent),
    /// Local ready action.
    Ready,
    /// Local leave action.
    Leave,
    /// One second of local countdown.
    Tick,
    TrackingSample {
        attention: AttentionSample,
        emotion: EmotionSample,
    },
    MetricsReport(MetricsSummary),
    MediaFailure(String),
}

impl From<ChannelEvent> for RoomEvent {
    fn from(event: ChannelEvent) -> Self {
        RoomEvent::Channel(event)
    }
}
