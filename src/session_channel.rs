//! Room channel client with reconnect supervision
//!
//! One supervisor task owns the read half of the socket and the reconnect
//! loop. The write half is shared behind a mutex so `send` can be called from
//! the runner while the supervisor is reading. Nothing here returns errors to
//! the room; failures become [`ChannelEvent`]s on the room's event queue.

use crate::context::AppContext;
use crate::error::{ClientError, Result};
use crate::events::{ChannelEvent, RoomEvent};
use crate::protocol::{decode_inbound, Decoded, OutboundMessage};

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{header::COOKIE, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const NORMAL_CLOSURE: u16 = 1000;
pub const POLICY_VIOLATION: u16 = 1008;
/// Reported when the socket dropped without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
pub(crate) type WsSink = futures_util::stream::SplitSink<WsStream, Message>;
type SharedSink = Arc<Mutex<Option<WsSink>>>;

/// What to do after the socket closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    /// Normal closure; stay closed.
    Normal,
    /// Policy violation; fatal, surfaced to the user.
    AuthRejected,
    /// Anything else; retry once after the delay.
    Reconnect(Duration),
}

impl CloseDisposition {
    pub fn classify(code: u16, delay: Duration) -> Self {
        match code {
            NORMAL_CLOSURE => Self::Normal,
            POLICY_VIOLATION => Self::AuthRejected,
            _ => Self::Reconnect(delay),
        }
    }
}

/// Handshake request carrying the credential as the `session_token` cookie.
pub(crate) fn authorized_request(url: &str, token: &str) -> Result<Request> {
    let mut request = url
        .into_client_request()
        .map_err(|_| ClientError::InvalidUrl(url.to_string()))?;
    let cookie = HeaderValue::from_str(&format!("session_token={token}"))
        .map_err(|_| ClientError::InvalidCredential)?;
    request.headers_mut().insert(COOKIE, cookie);
    Ok(request)
}

/// Send a 1000 close frame and shut the sink.
pub(crate) async fn close_normally(sink: &mut WsSink, reason: &'static str) {
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: Utf8Bytes::from_static(reason),
    };
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        debug!("Close frame not delivered: {}", e);
    }
    let _ = sink.close().await;
}

pub struct SessionChannel {
    ctx: AppContext,
    events: mpsc::UnboundedSender<RoomEvent>,
    writer: SharedSink,
    open: Arc<AtomicBool>,
    cancel: Option<CancellationToken>,
    supervisor: Option<JoinHandle<()>>,
}

impl SessionChannel {
    pub fn new(ctx: AppContext, events: mpsc::UnboundedSender<RoomEvent>) -> Self {
        Self {
            ctx,
            events,
            writer: Arc::new(Mutex::new(None)),
            open: Arc::new(AtomicBool::new(false)),
            cancel: None,
            supervisor: None,
        }
    }

    /// Start the supervisor for `session_id`. No-op while one is running.
    ///
    /// A missing credential fails immediately and is not retried.
    pub async fn connect(&mut self, session_id: &str) -> Result<()> {
        if self.supervisor.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("Channel already running, connect ignored");
            return Ok(());
        }

        let token = self.ctx.credential().ok_or_else(|| {
            error!("❌ No credential stored, cannot open room channel");
            ClientError::MissingCredential
        })?;
        let url = self.ctx.config.room_url(session_id)?;
        // validate once so the supervisor never has to
        authorized_request(&url, &token)?;

        let cancel = CancellationToken::new();
        let supervisor = Supervisor {
            url,
            token,
            writer: self.writer.clone(),
            open: self.open.clone(),
            events: self.events.clone(),
            reconnect_delay: self.ctx.config.reconnect_delay,
            cancel: cancel.clone(),
        };

        info!("🔗 Opening room channel for session {}", session_id);
        self.cancel = Some(cancel);
        self.supervisor = Some(tokio::spawn(supervisor.run()));
        Ok(())
    }

    /// Whether a socket is currently open and authenticated.
    pub fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Write one frame. `Ok(false)` when no socket is open; nothing is queued.
    pub async fn send(&self, message: &OutboundMessage) -> Result<bool> {
        let json = message.to_json()?;
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(sink) if self.open.load(Ordering::SeqCst) => {
                sink.send(Message::text(json)).await?;
                debug!("📤 Sent {}", message.kind());
                Ok(true)
            }
            _ => {
                warn!("📭 Channel closed, dropping {}", message.kind());
                Ok(false)
            }
        }
    }

    pub async fn send_binary(&self, data: Vec<u8>) -> Result<bool> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(sink) if self.open.load(Ordering::SeqCst) => {
                sink.send(Message::binary(data)).await?;
                Ok(true)
            }
            _ => {
                warn!("📭 Channel closed, dropping {} byte binary frame", data.len());
                Ok(false)
            }
        }
    }

    /// Stop the supervisor, cancel any pending reconnect and close with 1000.
    pub async fn disconnect(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }

        let sink = self.writer.lock().await.take();
        self.open.store(false, Ordering::SeqCst);
        if let Some(mut sink) = sink {
            close_normally(&mut sink, "client left").await;
            info!("👋 Room channel closed");
        }

        if let Some(handle) = self.supervisor.take() {
            if let Err(e) = handle.await {
                warn!("Channel supervisor ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for SessionChannel {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

struct Supervisor {
    url: String,
    token: String,
    writer: SharedSink,
    open: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<RoomEvent>,
    reconnect_delay: Duration,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(self) {
        let mut attempt = 0u32;

        loop {
            let (code, reason) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                closed = self.connect_and_read(&mut attempt) => closed,
            };

            if !self.emit(ChannelEvent::Closed {
                code,
                reason: reason.clone(),
            }) {
                break;
            }

            match CloseDisposition::classify(code, self.reconnect_delay) {
                CloseDisposition::Normal => {
                    info!("🔌 Room channel closed normally");
                    break;
                }
                CloseDisposition::AuthRejected => {
                    error!("🚫 Room channel rejected by policy: {}", reason);
                    let reason = if reason.is_empty() {
                        "authentication rejected".to_string()
                    } else {
                        reason
                    };
                    self.emit(ChannelEvent::Failed { reason });
                    break;
                }
                CloseDisposition::Reconnect(delay) => {
                    attempt += 1;
                    warn!(
                        "🔄 Room channel dropped ({}), reconnect #{} in {:?}",
                        code, attempt, delay
                    );
                    if !self.emit(ChannelEvent::Reconnecting { attempt, delay }) {
                        break;
                    }
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.open.store(false, Ordering::SeqCst);
        debug!("Channel supervisor stopped");
    }

    /// One connection lifetime. Returns the close code and reason.
    async fn connect_and_read(&self, attempt: &mut u32) -> (u16, String) {
        let request = match authorized_request(&self.url, &self.token) {
            Ok(request) => request,
            Err(e) => return (ABNORMAL_CLOSURE, e.to_string()),
        };

        let ws = match connect_async(request).await {
            Ok((ws, _response)) => ws,
            Err(e) => {
                warn!("Room channel open failed: {}", e);
                return (ABNORMAL_CLOSURE, e.to_string());
            }
        };

        let (mut sink, mut stream) = ws.split();

        // auth must be the first frame on the wire
        let auth = OutboundMessage::Auth {
            token: self.token.clone(),
        };
        let sent = match auth.to_json() {
            Ok(json) => sink.send(Message::text(json)).await.map_err(ClientError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!("Auth frame not delivered: {}", e);
            return (ABNORMAL_CLOSURE, e.to_string());
        }

        *self.writer.lock().await = Some(sink);
        self.open.store(true, Ordering::SeqCst);
        *attempt = 0;
        info!("✅ Room channel open");
        self.emit(ChannelEvent::Opened);

        let mut closed = (ABNORMAL_CLOSURE, String::new());
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => self.dispatch(text.as_str()),
                Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                    Ok(text) => self.dispatch(text),
                    Err(_) => debug!("Ignoring {} byte binary frame", bytes.len()),
                },
                Ok(Message::Close(frame)) => {
                    if let Some(frame) = frame {
                        closed = (u16::from(frame.code), frame.reason.as_str().to_string());
                    }
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Room channel error: {}", e);
                    closed.1 = e.to_string();
                    break;
                }
            }
        }

        self.open.store(false, Ordering::SeqCst);
        self.writer.lock().await.take();
        closed
    }

    fn dispatch(&self, text: &str) {
        let event = match decode_inbound(text) {
            Ok(Decoded::Message(message)) => {
                debug!("📥 {:?}", message);
                ChannelEvent::Message(message)
            }
            Ok(Decoded::Unrecognized(tag)) => {
                warn!("⚠️ Unrecognized frame tag {:?}, dropped", tag);
                ChannelEvent::Unrecognized(tag)
            }
            Err(e) => {
                warn!("⚠️ Malformed frame dropped: {} ({})", e, text);
                ChannelEvent::Unrecognized(format!("malformed: {e}"))
            }
        };
        self.emit(event);
    }

    fn emit(&self, event: ChannelEvent) -> bool {
        if self.events.send(RoomEvent::Channel(event)).is_err() {
            debug!("Room event queue gone, stopping supervisor");
            self.cancel.cancel();
            return false;
        }
        true
    }
}
