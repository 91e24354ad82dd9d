//! matchroom - join the practice queue or sit in a practice room from the terminal

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use matchroom::context::JsonFileStore;
use matchroom::frame_loop::IntervalScheduler;
use matchroom::matchmaking::{MatchmakingClient, QueueEvent};
use matchroom::tracking::{FaceTracker, ReplaySource, Tracking};
use matchroom::events::RoomEvent;
use matchroom::{AppContext, ClientConfig, RoomRunner, RoomState, RoomStatus};
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "matchroom")]
#[command(about = "Live interview practice client")]
#[command(version)]
struct Cli {
    /// Session token to store before running the command
    #[arg(long, env = "MATCHROOM_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Session service origin, overrides MATCHROOM_SERVER_URL
    #[arg(long)]
    server: Option<String>,

    /// Where the credential and preferences are kept
    #[arg(long, env = "MATCHROOM_STORE")]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Wait in the matchmaking queue until a partner is found
    Queue,
    /// Join a practice room
    Room {
        #[arg(long)]
        session: String,
        /// Recorded face meshes (JSON lines) to replay while the match is active
        #[arg(long)]
        replay: Option<PathBuf>,
        /// Raw 16 kHz mono s16le audio streamed as the microphone
        #[arg(long)]
        pcm: Option<PathBuf>,
    },
    /// Forget the stored credential
    Logout,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "matchroom=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = ClientConfig::from_env().context("Invalid MATCHROOM_* configuration")?;
    if let Some(server) = cli.server {
        config.server_url = server.trim_end_matches('/').to_string();
    }

    let store_path = match cli.store {
        Some(path) => path,
        None => dirs::config_dir()
            .context("No config directory on this platform, pass --store")?
            .join("matchroom")
            .join("store.json"),
    };
    let store = JsonFileStore::open(&store_path)
        .with_context(|| format!("Failed to open store {}", store_path.display()))?;
    let ctx = AppContext::new(config, Arc::new(store));

    if let Some(token) = cli.token {
        ctx.set_credential(&token).context("Failed to store credential")?;
    }

    match cli.command {
        Command::Queue => queue(ctx).await,
        Command::Room {
            session,
            replay,
            pcm,
        } => room(ctx, session, replay, pcm).await,
        Command::Logout => {
            ctx.clear_credential().context("Failed to clear credential")?;
            println!("Signed out");
            Ok(())
        }
    }
}

async fn queue(ctx: AppContext) -> Result<()> {
    let client = MatchmakingClient::new(ctx.clone()).context("Failed to build HTTP client")?;
    let identity = client.check_identity().await.context("Identity check failed")?;
    println!("👤 {} <{}>", identity.name, identity.email);

    let mut ticket = client.join().await.context("Failed to join the queue")?;
    let cancel = CancellationToken::new();
    let mut statuses = client.poll_queue_status(ctx.config.queue_poll_interval, cancel.clone());

    let outcome = loop {
        tokio::select! {
            event = ticket.next_event() => {
                match event.context("Queue channel failed")? {
                    Some(QueueEvent::Queued { user }) => println!("⏳ Queued as {user}"),
                    Some(QueueEvent::MatchFound { partner, match_id }) => {
                        println!("🎉 Matched with {partner}");
                        println!("{match_id}");
                        break Ok(());
                    }
                    Some(QueueEvent::Rejected(reason)) => break Err(anyhow::anyhow!("Queue rejected: {reason}")),
                    None => break Err(anyhow::anyhow!("Queue closed before a match was found")),
                }
            }
            Some(status) = statuses.recv() => {
                println!(
                    "   {} waiting, estimated wait {}",
                    status.queue_size, status.estimated_wait_text
                );
            }
            _ = signal::ctrl_c() => {
                info!("Interrupted, leaving queue");
                break Ok(());
            }
        }
    };

    cancel.cancel();
    ticket.leave().await;
    outcome
}

async fn room(
    ctx: AppContext,
    session: String,
    replay: Option<PathBuf>,
    pcm: Option<PathBuf>,
) -> Result<()> {
    if session.trim().is_empty() {
        bail!("--session must not be empty");
    }

    let mut runner = RoomRunner::new(ctx.clone(), session);
    if let Some(path) = pcm {
        runner = runner.with_audio(pcm_file(&path)?);
    }
    if let Some(path) = replay {
        let source = ReplaySource::from_path(&path, true)
            .with_context(|| format!("Failed to load {}", path.display()))?;
        if source.is_empty() {
            warn!("{} holds no meshes, tracking will idle", path.display());
        }
        runner = runner.with_tracking(Tracking {
            tracker: FaceTracker::new(&ctx.config),
            source: Box::new(source),
            scheduler: IntervalScheduler::new(ctx.config.frame_rate),
        });
    }

    let events = runner.events();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Interrupted, leaving room");
            let _ = events.send(RoomEvent::Leave);
        }
    });

    let printer = tokio::spawn(print_changes(runner.subscribe()));
    let result = runner.run().await;
    let _ = printer.await;

    let last = result.context("Room session failed")?;
    if let Some(reason) = last.error() {
        bail!("Room ended with an error: {reason}");
    }
    Ok(())
}

/// 100 ms at 16 kHz
const PCM_CHUNK_SAMPLES: usize = 1600;

/// Feed a raw s16le file in chunks, paced like a live microphone.
fn pcm_file(path: &Path) -> Result<mpsc::Receiver<Vec<i16>>> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let samples: Vec<i16> = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    info!("🎙️ Loaded {:.1}s of audio from {}", samples.len() as f64 / 16_000.0, path.display());

    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        for chunk in samples.chunks(PCM_CHUNK_SAMPLES) {
            ticker.tick().await;
            if tx.send(chunk.to_vec()).await.is_err() {
                break;
            }
        }
    });
    Ok(rx)
}

/// Print what changed between successive room snapshots.
async fn print_changes(mut state: watch::Receiver<RoomState>) {
    let mut last_status: Option<RoomStatus> = None;
    let mut self_len = 0;
    let mut peer_len = 0;
    let mut warned = false;
    let mut graded = false;
    let mut media_reported = false;

    loop {
        let snapshot = state.borrow_and_update().clone();

        if last_status != Some(snapshot.status()) {
            match (snapshot.status(), snapshot.reconnect_attempt()) {
                (RoomStatus::Connecting, Some(attempt)) => println!("🔄 Reconnecting (attempt {attempt})"),
                (RoomStatus::Active, _) => {
                    println!("▶️  Match started");
                    if let Some(question) = snapshot.question() {
                        println!("❓ {}", question.text);
                    }
                }
                (RoomStatus::Error, _) => {
                    println!("❌ {}", snapshot.error().unwrap_or("unknown error"));
                }
                (status, _) => println!("🏠 {status}"),
            }
            last_status = Some(snapshot.status());
        }

        if let Some(text) = unseen(snapshot.self_transcript(), &mut self_len) {
            println!("🗣️  you: {text}");
        }
        if let Some(text) = unseen(snapshot.peer_transcript(), &mut peer_len) {
            println!("🗣️  peer: {text}");
        }
        if let (Some(warning), false) = (snapshot.time_warning(), warned) {
            println!("⏰ {warning}");
            warned = true;
        }
        if let (Some(result), false) = (snapshot.self_result(), graded) {
            println!("📝 Score {:.1}: {}", result.score, result.feedback);
            graded = true;
        }
        if let (Some(error), false) = (snapshot.media_error(), media_reported) {
            warn!("Media unavailable: {}", error);
            media_reported = true;
        }

        if snapshot.left() || state.changed().await.is_err() {
            break;
        }
    }
}

/// Text appended since the last call; restarts if the transcript was cleared.
fn unseen<'a>(transcript: &'a str, seen: &mut usize) -> Option<&'a str> {
    if transcript.len() < *seen {
        *seen = 0;
    }
    let fresh = transcript.get(*seen..)?.trim();
    *seen = transcript.len();
    (!fresh.is_empty()).then_some(fresh)
}
