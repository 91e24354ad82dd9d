//! Wire types for the room channel
//!
//! Every JSON frame carries a `"type"` tag. Rejection frames the service sends
//! before a socket is fully set up have no tag, only an `"error"` string; those
//! decode as [`InboundMessage::Error`].

use crate::attention::AttentionSample;
use crate::emotion::EmotionSample;
use crate::error::Result;
use crate::metrics::MetricsSummary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tags this client understands. Anything else is dropped.
pub const KNOWN_TAGS: [&str; 12] = [
    "connected",
    "player_joined",
    "player_left",
    "player_ready",
    "time_update",
    "time_warning",
    "match_time_expired",
    "match_graded",
    "transcription",
    "player_speaking",
    "facial_tracking",
    "error",
];

/// Interview question handed out when both participants are ready
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    /// Opaque; the service has used both numbers and strings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    #[serde(alias = "question")]
    pub text: String,
    #[serde(rename = "answerCriteria", default, skip_serializing_if = "Option::is_none")]
    pub criteria: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConnectedPayload {
    #[serde(default)]
    pub match_id: Option<String>,
    pub player_uid: String,
    #[serde(default)]
    pub is_ready: bool,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub question: Option<Question>,
    #[serde(default)]
    pub time_remaining: Option<u32>,
    #[serde(default)]
    pub match_duration_seconds: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PlayerReadyPayload {
    pub player: String,
    #[serde(default)]
    pub both_ready: bool,
    #[serde(default)]
    pub question: Option<Question>,
    #[serde(default)]
    pub match_duration_seconds: Option<u32>,
}

/// One participant's grade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeResult {
    pub player: String,
    pub score: f32,
    #[serde(default)]
    pub feedback: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Connected(ConnectedPayload),
    PlayerJoined {
        player: String,
    },
    PlayerLeft {
        player: String,
    },
    PlayerReady(PlayerReadyPayload),
    TimeUpdate {
        time_remaining: u32,
    },
    TimeWarning {
        #[serde(default)]
        message: String,
        #[serde(default)]
        time_remaining: Option<u32>,
    },
    MatchTimeExpired {
        #[serde(default)]
        message: String,
    },
    MatchGraded {
        #[serde(default)]
        results: Vec<GradeResult>,
    },
    Transcription {
        #[serde(default)]
        player: Option<String>,
        text: String,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
    PlayerSpeaking {
        player: String,
        speaking: bool,
        #[serde(default)]
        text: Option<String>,
    },
    FacialTracking {
        #[serde(default)]
        player: Option<String>,
        attention: AttentionSample,
        #[serde(default)]
        emotion: Option<EmotionSample>,
        #[serde(default)]
        timestamp: Option<i64>,
    },
    Error {
        #[serde(alias = "message", alias = "error")]
        reason: String,
    },
}

/// Result of decoding one text frame
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(InboundMessage),
    /// Unknown or missing tag; carries the tag for logging.
    Unrecognized(String),
}

/// Decode a text frame. Unknown tags are not an error; malformed payloads
/// for a known tag are.
pub fn decode_inbound(text: &str) -> Result<Decoded> {
    let value: serde_json::Value = serde_json::from_str(text)?;

    let tag = match value.get("type").and_then(|t| t.as_str()) {
        Some(tag) => tag.to_string(),
        None => {
            if let Some(reason) = value.get("error").and_then(|e| e.as_str()) {
                return Ok(Decoded::Message(InboundMessage::Error {
                    reason: reason.to_string(),
                }));
            }
            return Ok(Decoded::Unrecognized("<untagged>".to_string()));
        }
    };

    if !KNOWN_TAGS.contains(&tag.as_str()) {
        return Ok(Decoded::Unrecognized(tag));
    }

    Ok(Decoded::Message(serde_json::from_value(value)?))
}

/// Frames this client sends
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Auth {
        token: String,
    },
    Ready,
    AttentionMetrics(MetricsSummary),
    FacialTracking {
        attention: AttentionSample,
        emotion: EmotionSample,
        timestamp: i64,
    },
    StartAudio,
    StopAudio,
    ResetTranscript,
}

impl OutboundMessage {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Tag name, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Auth { .. } => "auth",
            OutboundMessage::Ready => "ready",
            OutboundMessage::AttentionMetrics(_) => "attention_metrics",
            OutboundMessage::FacialTracking { .. } => "facial_tracking",
            OutboundMessage::StartAudio => "start_audio",
            OutboundMessage::StopAudio => "stop_audio",
            OutboundMessage::ResetTranscript => "reset_transcript",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attention::GazeDirection;
    use crate::emotion::Emotion;
    use serde_json::json;

    fn decode(value: serde_json::Value) -> Decoded {
        decode_inbound(&value.to_string()).unwrap()
    }

    #[test]
    fn connected_with_active_match() {
        let decoded = decode(json!({
            "type": "connected",
            "match_id": "m-1",
            "player_uid": "alice",
            "status": "active",
            "is_ready": true,
            "question": { "id": 7, "question": "Tell me about a conflict", "answerCriteria": "STAR" },
            "time_remaining": 420,
            "match_duration_seconds": 420
        }));

        let Decoded::Message(InboundMessage::Connected(payload)) = decoded else {
            panic!("expected connected, got {decoded:?}");
        };
        assert_eq!(payload.player_uid, "alice");
        assert!(payload.is_ready);
        assert_eq!(payload.status.as_deref(), Some("active"));
        let question = payload.question.unwrap();
        assert_eq!(question.text, "Tell me about a conflict");
        assert_eq!(question.criteria.as_deref(), Some("STAR"));
        assert_eq!(payload.time_remaining, Some(420));
    }

    #[test]
    fn connected_with_null_time_remaining() {
        let decoded = decode(json!({
            "type": "connected",
            "player_uid": "bob",
            "status": "waiting",
            "is_ready": true,
            "question": { "id": "q9", "text": "Why us?" },
            "time_remaining": null
        }));
        let Decoded::Message(InboundMessage::Connected(payload)) = decoded else {
            panic!("expected connected");
        };
        assert_eq!(payload.time_remaining, None);
        assert_eq!(payload.question.unwrap().text, "Why us?");
    }

    #[test]
    fn player_ready_without_question() {
        let decoded = decode(json!({
            "type": "player_ready",
            "player": "alice",
            "both_ready": false,
            "question": null,
            "match_duration_seconds": null
        }));
        assert_eq!(
            decoded,
            Decoded::Message(InboundMessage::PlayerReady(PlayerReadyPayload {
                player: "alice".into(),
                both_ready: false,
                question: None,
                match_duration_seconds: None,
            }))
        );
    }

    #[test]
    fn time_update_ignores_extra_fields() {
        let decoded = decode(json!({
            "type": "time_update", "time_remaining": 390, "minutes": 6, "seconds": 30
        }));
        assert_eq!(
            decoded,
            Decoded::Message(InboundMessage::TimeUpdate { time_remaining: 390 })
        );
    }

    #[test]
    fn transcription_timestamp_is_parsed() {
        let decoded = decode(json!({
            "type": "transcription",
            "player": "bob",
            "text": "hello there",
            "timestamp": "2024-05-01T12:30:00Z"
        }));
        let Decoded::Message(InboundMessage::Transcription { timestamp, text, .. }) = decoded else {
            panic!("expected transcription");
        };
        assert_eq!(text, "hello there");
        assert_eq!(timestamp.unwrap().to_rfc3339(), "2024-05-01T12:30:00+00:00");
    }

    #[test]
    fn facial_tracking_uses_camel_case_samples() {
        let decoded = decode(json!({
            "type": "facial_tracking",
            "player": "bob",
            "attention": { "isLookingAtCamera": true, "attentionScore": 85.0, "gazeDirection": "Center" },
            "emotion": { "emotion": "Neutral", "confidence": 70.0 },
            "timestamp": 1714566600000i64
        }));
        let Decoded::Message(InboundMessage::FacialTracking { attention, emotion, .. }) = decoded
        else {
            panic!("expected facial_tracking");
        };
        assert!(attention.is_looking_at_camera);
        assert_eq!(attention.gaze_direction, GazeDirection::Center);
        assert_eq!(emotion.unwrap().emotion, Emotion::Neutral);
    }

    #[test]
    fn untagged_error_frame_maps_to_error() {
        assert_eq!(
            decode(json!({ "error": "Not authenticated" })),
            Decoded::Message(InboundMessage::Error {
                reason: "Not authenticated".into()
            })
        );
        assert_eq!(
            decode(json!({ "type": "error", "message": "Room is full" })),
            Decoded::Message(InboundMessage::Error {
                reason: "Room is full".into()
            })
        );
    }

    #[test]
    fn unknown_tags_are_not_errors() {
        assert_eq!(
            decode(json!({ "type": "signal", "from": "bob", "signal": {} })),
            Decoded::Unrecognized("signal".into())
        );
        assert_eq!(
            decode(json!({ "hello": 1 })),
            Decoded::Unrecognized("<untagged>".into())
        );
    }

    #[test]
    fn malformed_known_tag_is_an_error() {
        assert!(decode_inbound(r#"{"type":"time_update","time_remaining":"soon"}"#).is_err());
        assert!(decode_inbound("not json").is_err());
    }

    #[test]
    fn outbound_frames() {
        let auth = OutboundMessage::Auth {
            token: "tok".into(),
        };
        assert_eq!(auth.to_json().unwrap(), r#"{"type":"auth","token":"tok"}"#);
        assert_eq!(OutboundMessage::Ready.to_json().unwrap(), r#"{"type":"ready"}"#);
        assert_eq!(
            OutboundMessage::StopAudio.to_json().unwrap(),
            r#"{"type":"stop_audio"}"#
        );

        let metrics = OutboundMessage::AttentionMetrics(MetricsSummary::empty());
        let value: serde_json::Value = serde_json::from_str(&metrics.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "attention_metrics");
        assert_eq!(value["totalFramesProcessed"], 0);
        assert_eq!(metrics.kind(), "attention_metrics");
    }
}
