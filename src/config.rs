//! Client configuration

use crate::error::{ClientError, Result};
use std::time::Duration;

/// What the face tracker sends to the service while a match is active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsPayload {
    /// Periodic `attention_metrics` summaries
    Summary,
    /// One `facial_tracking` frame per processed video frame
    RawSample,
    Both,
}

impl MetricsPayload {
    pub fn sends_summary(&self) -> bool {
        matches!(self, Self::Summary | Self::Both)
    }

    pub fn sends_raw(&self) -> bool {
        matches!(self, Self::RawSample | Self::Both)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::RawSample => "raw",
            Self::Both => "both",
        }
    }
}

impl std::str::FromStr for MetricsPayload {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "summary" => Ok(Self::Summary),
            "raw" | "raw_sample" | "sample" => Ok(Self::RawSample),
            "both" => Ok(Self::Both),
            other => Err(ClientError::Config(format!("unknown metrics payload {other:?}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// HTTP origin of the session service, e.g. `http://localhost:8000`
    pub server_url: String,
    pub reconnect_delay: Duration,
    /// Wait after `stop_audio` before the audio channel is closed
    pub audio_close_grace: Duration,
    pub metrics_cadence: Duration,
    /// Remaining-time checkpoints (seconds) that force a metrics send
    pub metrics_checkpoints: Vec<u32>,
    pub frame_rate: u32,
    pub metrics_payload: MetricsPayload,
    pub queue_poll_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8000".to_string(),
            reconnect_delay: Duration::from_secs(3),
            audio_close_grace: Duration::from_millis(1500),
            metrics_cadence: Duration::from_secs(5),
            metrics_checkpoints: vec![10, 5, 1],
            frame_rate: 30,
            metrics_payload: MetricsPayload::Summary,
            queue_poll_interval: Duration::from_secs(2),
        }
    }
}

impl ClientConfig {
    /// Defaults overlaid with `MATCHROOM_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("MATCHROOM_SERVER_URL") {
            config.server_url = url.trim_end_matches('/').to_string();
        }
        if let Some(ms) = lookup("MATCHROOM_RECONNECT_DELAY_MS") {
            config.reconnect_delay = Duration::from_millis(parse_number("MATCHROOM_RECONNECT_DELAY_MS", &ms)?);
        }
        if let Some(ms) = lookup("MATCHROOM_AUDIO_GRACE_MS") {
            config.audio_close_grace = Duration::from_millis(parse_number("MATCHROOM_AUDIO_GRACE_MS", &ms)?);
        }
        if let Some(secs) = lookup("MATCHROOM_METRICS_CADENCE_SECS") {
            config.metrics_cadence = Duration::from_secs(parse_number("MATCHROOM_METRICS_CADENCE_SECS", &secs)?);
        }
        if let Some(fps) = lookup("MATCHROOM_FPS") {
            let fps = parse_number("MATCHROOM_FPS", &fps)?;
            if fps == 0 {
                return Err(ClientError::Config("MATCHROOM_FPS must be positive".into()));
            }
            config.frame_rate = u32::try_from(fps)
                .map_err(|_| ClientError::Config(format!("MATCHROOM_FPS out of range: {fps}")))?;
        }
        if let Some(mode) = lookup("MATCHROOM_METRICS_PAYLOAD") {
            config.metrics_payload = mode.parse()?;
        }

        config.ws_base()?;
        Ok(config)
    }

    /// WebSocket origin derived from `server_url`.
    pub fn ws_base(&self) -> Result<String> {
        let url = self.server_url.trim_end_matches('/');
        if let Some(rest) = url.strip_prefix("https://") {
            Ok(format!("wss://{rest}"))
        } else if let Some(rest) = url.strip_prefix("http://") {
            Ok(format!("ws://{rest}"))
        } else if url.starts_with("ws://") || url.starts_with("wss://") {
            Ok(url.to_string())
        } else {
            Err(ClientError::InvalidUrl(self.server_url.clone()))
        }
    }

    pub fn http_base(&self) -> Result<String> {
        let url = self.server_url.trim_end_matches('/');
        if let Some(rest) = url.strip_prefix("wss://") {
            Ok(format!("https://{rest}"))
        } else if let Some(rest) = url.strip_prefix("ws://") {
            Ok(format!("http://{rest}"))
        } else if url.starts_with("http://") || url.starts_with("https://") {
            Ok(url.to_string())
        } else {
            Err(ClientError::InvalidUrl(self.server_url.clone()))
        }
    }

    /// Session ids become one path segment, so only URL-unreserved characters are accepted.
    pub fn room_url(&self, session_id: &str) -> Result<String> {
        let valid = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~'));
        if !valid || session_id == "." || session_id == ".." {
            return Err(ClientError::InvalidSessionId(session_id.to_string()));
        }
        Ok(format!("{}/ws/room/{}", self.ws_base()?, session_id))
    }

    pub fn practice_url(&self) -> Result<String> {
        Ok(format!("{}/ws/practice", self.ws_base()?))
    }

    pub fn join_url(&self) -> Result<String> {
        Ok(format!("{}/ws/join", self.ws_base()?))
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.frame_rate.max(1)))
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| ClientError::Config(format!("{key} is not a number: {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_the_protocol_constants() {
        let config = ClientConfig::default();
        assert_eq!(config.reconnect_delay, Duration::from_secs(3));
        assert_eq!(config.audio_close_grace, Duration::from_millis(1500));
        assert_eq!(config.metrics_cadence, Duration::from_secs(5));
        assert_eq!(config.metrics_checkpoints, vec![10, 5, 1]);
        assert_eq!(config.room_url("abc").unwrap(), "ws://localhost:8000/ws/room/abc");
    }

    #[test]
    fn env_overlay() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("MATCHROOM_SERVER_URL", "https://prep.example.com/"),
            ("MATCHROOM_RECONNECT_DELAY_MS", "250"),
            ("MATCHROOM_FPS", "15"),
            ("MATCHROOM_METRICS_PAYLOAD", "both"),
        ]))
        .unwrap();

        assert_eq!(config.ws_base().unwrap(), "wss://prep.example.com");
        assert_eq!(config.http_base().unwrap(), "https://prep.example.com");
        assert_eq!(config.reconnect_delay, Duration::from_millis(250));
        assert_eq!(config.frame_rate, 15);
        assert_eq!(config.metrics_payload, MetricsPayload::Both);
    }

    #[test]
    fn bad_values_are_config_errors() {
        assert!(matches!(
            ClientConfig::from_lookup(lookup(&[("MATCHROOM_FPS", "fast")])),
            Err(ClientError::Config(_))
        ));
        assert!(matches!(
            ClientConfig::from_lookup(lookup(&[("MATCHROOM_FPS", "0")])),
            Err(ClientError::Config(_))
        ));
        assert!(matches!(
            ClientConfig::from_lookup(lookup(&[("MATCHROOM_SERVER_URL", "localhost:8000")])),
            Err(ClientError::InvalidUrl(_))
        ));
    }

    #[test]
    fn session_ids_must_be_one_path_segment() {
        let config = ClientConfig::default();
        assert_eq!(
            config.room_url("m_42.b~c").unwrap(),
            "ws://localhost:8000/ws/room/m_42.b~c"
        );
        for bad in ["", "..", "a/b", "m?x=1", "m 42", "m#1", "m%2F"] {
            assert!(
                matches!(config.room_url(bad), Err(ClientError::InvalidSessionId(_))),
                "{bad:?} accepted"
            );
        }
    }

    #[test]
    fn payload_modes() {
        assert!(MetricsPayload::Summary.sends_summary());
        assert!(!MetricsPayload::Summary.sends_raw());
        assert!(MetricsPayload::Both.sends_raw() && MetricsPayload::Both.sends_summary());
        assert_eq!("raw".parse::<MetricsPayload>().unwrap(), MetricsPayload::RawSample);
    }
}
