//! Camera / microphone handles and the audio uplink
//!
//! Device handles are scoped: acquired only on an explicit enable, stopped on
//! disable and on drop. They are independent of the room channel, so losing
//! the channel never keeps the camera alive and vice versa.
//!
//! `MediaSession` is for embedders that own real devices; the CLI has none and
//! feeds `RoomRunner::with_audio` from a PCM file instead.

use crate::context::AppContext;
use crate::error::ClientError;
use crate::events::{ChannelEvent, RoomEvent};
use crate::protocol::{InboundMessage, OutboundMessage};
use crate::session_channel::{authorized_request, close_normally, WsSink};

use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Camera,
    Microphone,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Camera => f.write_str("camera"),
            TrackKind::Microphone => f.write_str("microphone"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    /// Fatal; the user has to grant access.
    #[error("{0} permission denied")]
    PermissionDenied(TrackKind),

    #[error("{0} unavailable: {1}")]
    Unavailable(TrackKind, String),

    #[error("audio channel error: {0}")]
    Channel(#[from] ClientError),

    #[error("audio channel closed")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for MediaError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        MediaError::Channel(ClientError::WebSocket(e))
    }
}

pub type Result<T> = std::result::Result<T, MediaError>;

/// A live device stream
pub trait DeviceTrack: Send {
    fn kind(&self) -> TrackKind;
    fn label(&self) -> &str;
    /// Release the device. Must be idempotent.
    fn stop(&mut self);
}

/// Platform device access (external collaborator)
pub trait MediaDevices: Send + Sync {
    fn request_camera(&self) -> impl Future<Output = Result<Box<dyn DeviceTrack>>> + Send;
    fn request_microphone(&self) -> impl Future<Output = Result<Box<dyn DeviceTrack>>> + Send;
}

pub struct MediaSession<D: MediaDevices> {
    devices: D,
    camera: Option<Box<dyn DeviceTrack>>,
    microphone: Option<Box<dyn DeviceTrack>>,
    failures: Option<mpsc::UnboundedSender<RoomEvent>>,
}

impl<D: MediaDevices> MediaSession<D> {
    pub fn new(devices: D) -> Self {
        Self {
            devices,
            camera: None,
            microphone: None,
            failures: None,
        }
    }

    /// Report acquisition failures to the room as `MediaFailure`.
    pub fn report_to(mut self, events: mpsc::UnboundedSender<RoomEvent>) -> Self {
        self.failures = Some(events);
        self
    }

    pub fn camera_enabled(&self) -> bool {
        self.camera.is_some()
    }

    pub fn microphone_enabled(&self) -> bool {
        self.microphone.is_some()
    }

    pub async fn enable_camera(&mut self) -> Result<()> {
        if self.camera.is_some() {
            return Ok(());
        }
        let track = self.devices.request_camera().await;
        self.camera = Some(self.accept(track)?);
        Ok(())
    }

    pub fn disable_camera(&mut self) {
        release(&mut self.camera);
    }

    pub async fn enable_microphone(&mut self) -> Result<()> {
        if self.microphone.is_some() {
            return Ok(());
        }
        let track = self.devices.request_microphone().await;
        self.microphone = Some(self.accept(track)?);
        Ok(())
    }

    pub fn disable_microphone(&mut self) {
        release(&mut self.microphone);
    }

    fn accept(&self, track: Result<Box<dyn DeviceTrack>>) -> Result<Box<dyn DeviceTrack>> {
        match track {
            Ok(track) => {
                info!("🎛️ {} enabled ({})", track.kind(), track.label());
                Ok(track)
            }
            Err(e) => {
                warn!("❌ {}", e);
                if let Some(events) = &self.failures {
                    let _ = events.send(RoomEvent::MediaFailure(e.to_string()));
                }
                Err(e)
            }
        }
    }
}

fn release(slot: &mut Option<Box<dyn DeviceTrack>>) {
    if let Some(mut track) = slot.take() {
        track.stop();
        info!("🎛️ {} released", track.kind());
    }
}

impl<D: MediaDevices> Drop for MediaSession<D> {
    fn drop(&mut self) {
        release(&mut self.camera);
        release(&mut self.microphone);
    }
}

/// Streams microphone PCM to the transcription service.
///
/// Transcripts the service sends back are fed to the room as the local
/// participant's `transcription` messages.
pub struct AudioUplink {
    sink: Option<WsSink>,
    reader: Option<JoinHandle<()>>,
    grace: Duration,
    streaming: bool,
}

impl AudioUplink {
    pub async fn connect(ctx: &AppContext, transcripts: mpsc::UnboundedSender<RoomEvent>) -> Result<Self> {
        let token = ctx.credential().ok_or(ClientError::MissingCredential)?;
        let url = ctx.config.practice_url()?;
        let request = authorized_request(&url, &token)?;

        let (ws, _) = connect_async(request).await?;
        let (sink, mut stream) = ws.split();
        info!("🎙️ Audio uplink connected");

        let reader = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => forward_transcript(text.as_str(), &transcripts),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("Audio uplink read error: {}", e);
                        break;
                    }
                }
            }
            debug!("Audio uplink reader stopped");
        });

        Ok(Self {
            sink: Some(sink),
            reader: Some(reader),
            grace: ctx.config.audio_close_grace,
            streaming: false,
        })
    }

    pub async fn start(&mut self) -> Result<()> {
        self.send_control(&OutboundMessage::StartAudio).await?;
        self.streaming = true;
        Ok(())
    }

    /// 16-bit little-endian mono PCM.
    pub async fn push_pcm(&mut self, samples: &[i16]) -> Result<()> {
        if !self.streaming {
            debug!("PCM pushed before start_audio, dropped");
            return Ok(());
        }
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let sink = self.sink.as_mut().ok_or(MediaError::Closed)?;
        sink.send(Message::binary(bytes)).await?;
        Ok(())
    }

    pub async fn reset_transcript(&mut self) -> Result<()> {
        self.send_control(&OutboundMessage::ResetTranscript).await
    }

    /// Send `stop_audio`, give the service the grace period to flush the
    /// last buffer, then close with 1000.
    pub async fn stop(mut self) -> Result<()> {
        self.streaming = false;
        self.send_control(&OutboundMessage::StopAudio).await?;
        tokio::time::sleep(self.grace).await;
        if let Some(mut sink) = self.sink.take() {
            close_normally(&mut sink, "audio stopped").await;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        info!("🎙️ Audio uplink closed");
        Ok(())
    }

    async fn send_control(&mut self, message: &OutboundMessage) -> Result<()> {
        let json = message.to_json()?;
        let sink = self.sink.as_mut().ok_or(MediaError::Closed)?;
        sink.send(Message::text(json)).await?;
        debug!("🎙️ Sent {}", message.kind());
        Ok(())
    }
}

impl Drop for AudioUplink {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

fn forward_transcript(text: &str, transcripts: &mpsc::UnboundedSender<RoomEvent>) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            warn!("Malformed transcription frame: {}", e);
            return;
        }
    };
    match value.get("type").and_then(|t| t.as_str()) {
        Some("transcription") => {
            let Some(text) = value.get("text").and_then(|t| t.as_str()) else {
                return;
            };
            let message = InboundMessage::Transcription {
                player: None,
                text: text.to_string(),
                timestamp: None,
            };
            let _ = transcripts.send(RoomEvent::Channel(ChannelEvent::Message(message)));
        }
        Some("status") => debug!("Transcriber status: {}", value),
        other => debug!("Ignoring transcriber frame {:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_async;

    struct FakeTrack {
        kind: TrackKind,
        stopped: Arc<AtomicUsize>,
    }

    impl DeviceTrack for FakeTrack {
        fn kind(&self) -> TrackKind {
            self.kind
        }
        fn label(&self) -> &str {
            "fake"
        }
        fn stop(&mut self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeDevices {
        deny_camera: bool,
        requests: Arc<AtomicUsize>,
        stopped: Arc<AtomicUsize>,
    }

    impl FakeDevices {
        fn track(&self, kind: TrackKind) -> Box<dyn DeviceTrack> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            Box::new(FakeTrack {
                kind,
                stopped: self.stopped.clone(),
            })
        }
    }

    impl MediaDevices for FakeDevices {
        async fn request_camera(&self) -> Result<Box<dyn DeviceTrack>> {
            if self.deny_camera {
                return Err(MediaError::PermissionDenied(TrackKind::Camera));
            }
            Ok(self.track(TrackKind::Camera))
        }

        async fn request_microphone(&self) -> Result<Box<dyn DeviceTrack>> {
            Ok(self.track(TrackKind::Microphone))
        }
    }

    #[tokio::test]
    async fn tracks_are_released_on_disable_and_drop() {
        let devices = FakeDevices::default();
        let requests = devices.requests.clone();
        let stopped = devices.stopped.clone();
        let mut session = MediaSession::new(devices);

        session.enable_camera().await.unwrap();
        session.enable_camera().await.unwrap();
        session.enable_microphone().await.unwrap();
        assert_eq!(requests.load(Ordering::SeqCst), 2);

        session.disable_camera();
        session.disable_camera();
        assert!(!session.camera_enabled());
        assert_eq!(stopped.load(Ordering::SeqCst), 1);

        drop(session);
        assert_eq!(stopped.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permission_denial_is_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = MediaSession::new(FakeDevices {
            deny_camera: true,
            ..FakeDevices::default()
        })
        .report_to(tx);

        assert!(matches!(
            session.enable_camera().await,
            Err(MediaError::PermissionDenied(TrackKind::Camera))
        ));
        assert!(!session.camera_enabled());
        assert_eq!(
            rx.try_recv().unwrap(),
            RoomEvent::MediaFailure("camera permission denied".into())
        );

        // microphone is independent
        session.enable_microphone().await.unwrap();
        assert!(session.microphone_enabled());
    }

    #[tokio::test]
    async fn uplink_streams_pcm_and_closes_after_grace() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ctx = AppContext::in_memory(ClientConfig {
            server_url: format!("http://{}", listener.local_addr().unwrap()),
            audio_close_grace: Duration::from_millis(150),
            ..ClientConfig::default()
        });
        ctx.set_credential("tok").unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            let text = |m: Message| serde_json::from_str::<serde_json::Value>(m.to_text().unwrap()).unwrap();
            assert_eq!(text(ws.next().await.unwrap().unwrap()), json!({ "type": "start_audio" }));

            let Message::Binary(pcm) = ws.next().await.unwrap().unwrap() else {
                panic!("expected binary pcm");
            };
            assert_eq!(pcm.to_vec(), vec![0x01, 0x00, 0xff, 0xff, 0x00, 0x80]);

            assert_eq!(
                text(ws.next().await.unwrap().unwrap()),
                json!({ "type": "reset_transcript" })
            );
            ws.send(Message::text(json!({ "type": "status", "message": "ok" }).to_string()))
                .await
                .unwrap();
            ws.send(Message::text(json!({ "type": "transcription", "text": "hello" }).to_string()))
                .await
                .unwrap();

            assert_eq!(text(ws.next().await.unwrap().unwrap()), json!({ "type": "stop_audio" }));
            let stopped_at = std::time::Instant::now();
            match ws.next().await {
                Some(Ok(Message::Close(Some(frame)))) => assert_eq!(u16::from(frame.code), 1000),
                other => panic!("expected close, got {other:?}"),
            }
            assert!(stopped_at.elapsed() >= Duration::from_millis(100));
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut uplink = AudioUplink::connect(&ctx, tx).await.unwrap();

        // ignored until start_audio
        uplink.push_pcm(&[7, 7]).await.unwrap();
        uplink.start().await.unwrap();
        uplink.push_pcm(&[1, -1, i16::MIN]).await.unwrap();
        uplink.reset_transcript().await.unwrap();

        let event = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(
            event,
            RoomEvent::Channel(ChannelEvent::Message(InboundMessage::Transcription {
                player: None,
                text: "hello".into(),
                timestamp: None,
            }))
        );

        uplink.stop().await.unwrap();
        server.await.unwrap();
    }
}
