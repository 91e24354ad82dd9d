//! Matchmaking client - identity check, queue status and the join queue

use crate::context::AppContext;
use crate::error::ClientError;
use crate::session_channel::{authorized_request, close_normally, WsSink, WsStream};

use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use reqwest::header::COOKIE;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const USER_AGENT: &str = concat!("matchroom/", env!("CARGO_PKG_VERSION"));
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum MatchmakingError {
    #[error("No credential stored, sign in first")]
    MissingCredential,

    #[error("Not authenticated")]
    Unauthenticated,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {0}: {1}")]
    Api(u16, String),

    #[error("Queue channel error: {0}")]
    Channel(#[from] ClientError),

    #[error("Unexpected queue frame: {0}")]
    Protocol(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for MatchmakingError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        MatchmakingError::Channel(ClientError::WebSocket(e))
    }
}

pub type Result<T> = std::result::Result<T, MatchmakingError>;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Identity {
    pub uid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Deserialize)]
struct IdentityEnvelope {
    user: Identity,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueueStatus {
    pub queue_size: u32,
    pub estimated_wait_seconds: u32,
    #[serde(default)]
    pub estimated_wait_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Queued { user: String },
    MatchFound { partner: String, match_id: String },
    /// The service refused the join; it closes the socket right after.
    Rejected(String),
}

impl QueueEvent {
    fn parse(text: &str) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| MatchmakingError::Protocol(e.to_string()))?;
        let field = |name: &str| value.get(name).and_then(|v| v.as_str()).map(str::to_string);

        if let Some(reason) = field("error") {
            return Ok(QueueEvent::Rejected(reason));
        }
        match field("status").as_deref() {
            Some("queued") => Ok(QueueEvent::Queued {
                user: field("user").unwrap_or_default(),
            }),
            Some("match_found") => {
                // ids may arrive as numbers
                let id = |name: &str| match value.get(name) {
                    Some(serde_json::Value::String(s)) => Some(s.clone()),
                    Some(serde_json::Value::Number(n)) => Some(n.to_string()),
                    _ => None,
                };
                match (id("partner"), id("match_id")) {
                    (Some(partner), Some(match_id)) => Ok(QueueEvent::MatchFound { partner, match_id }),
                    _ => Err(MatchmakingError::Protocol(text.to_string())),
                }
            }
            _ => Err(MatchmakingError::Protocol(text.to_string())),
        }
    }
}

#[derive(Clone)]
pub struct MatchmakingClient {
    ctx: AppContext,
    http: reqwest::Client,
}

impl MatchmakingClient {
    pub fn new(ctx: AppContext) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(Self { ctx, http })
    }

    fn token(&self) -> Result<String> {
        self.ctx.credential().ok_or(MatchmakingError::MissingCredential)
    }

    fn endpoint(&self, path: &str) -> Result<String> {
        Ok(format!("{}{}", self.ctx.config.http_base()?, path))
    }

    /// Confirm the stored credential is still accepted before opening a channel.
    pub async fn check_identity(&self) -> Result<Identity> {
        let token = self.token()?;
        let response = self
            .http
            .get(self.endpoint("/api/auth/me")?)
            .header(COOKIE, format!("session_token={token}"))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(MatchmakingError::Unauthenticated);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MatchmakingError::Api(status.as_u16(), body));
        }

        let envelope: IdentityEnvelope = response.json().await?;
        info!("👤 Signed in as {} ({})", envelope.user.name, envelope.user.uid);
        Ok(envelope.user)
    }

    pub async fn queue_status(&self) -> Result<QueueStatus> {
        let response = self
            .http
            .get(self.endpoint("/api/matchmaking/queue-status")?)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MatchmakingError::Api(status.as_u16(), body));
        }
        Ok(response.json().await?)
    }

    /// Poll queue status until `cancel` fires or the receiver is dropped.
    /// Failed polls are logged and skipped.
    pub fn poll_queue_status(&self, every: Duration, cancel: CancellationToken) -> mpsc::Receiver<QueueStatus> {
        let (tx, rx) = mpsc::channel(8);
        let client = self.clone();

        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match client.queue_status().await {
                    Ok(status) => {
                        if tx.send(status).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Queue status poll failed: {}", e),
                }
            }
            debug!("Queue status polling stopped");
        });

        rx
    }

    /// Enter the matchmaking queue.
    pub async fn join(&self) -> Result<QueueTicket> {
        let token = self.token()?;
        let request = authorized_request(&self.ctx.config.join_url()?, &token)?;
        let (ws, _) = connect_async(request).await?;
        let (sink, stream) = ws.split();
        info!("🎯 Joined matchmaking queue");
        Ok(QueueTicket {
            sink,
            stream,
            done: false,
        })
    }
}

/// A place in the queue. Dropping it or calling [`QueueTicket::leave`] dequeues.
pub struct QueueTicket {
    sink: WsSink,
    stream: SplitStream<WsStream>,
    done: bool,
}

impl QueueTicket {
    /// Next queue event, or `None` once the service closed the socket.
    pub async fn next_event(&mut self) -> Result<Option<QueueEvent>> {
        if self.done {
            return Ok(None);
        }
        while let Some(message) = self.stream.next().await {
            match message? {
                Message::Text(text) => {
                    let event = QueueEvent::parse(text.as_str())?;
                    debug!("Queue event: {:?}", event);
                    return Ok(Some(event));
                }
                Message::Close(frame) => {
                    debug!("Queue socket closed: {:?}", frame);
                    break;
                }
                _ => {}
            }
        }
        self.done = true;
        Ok(None)
    }

    pub async fn leave(mut self) {
        close_normally(&mut self.sink, "left queue").await;
        info!("🚪 Left matchmaking queue");
    }
}
