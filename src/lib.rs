//! matchroom - client core for live two-person interview practice sessions
//!
//! Scores the local participant's attention and expression from a face mesh
//! every frame, keeps the room state in sync with the session service and
//! handles the matchmaking queue that leads into a room.

#![forbid(unsafe_code)]

pub mod attention;
pub mod config;
pub mod context;
pub mod emotion;
pub mod error;
pub mod events;
pub mod frame_loop;
pub mod landmarks;
pub mod matchmaking;
pub mod media;
pub mod metrics;
pub mod protocol;
pub mod room;
pub mod room_runner;
pub mod session_channel;
pub mod tracking;

pub use config::ClientConfig;
pub use context::AppContext;
pub use error::{ClientError, Result};
pub use room::{RoomState, RoomStatus};
pub use room_runner::RoomRunner;
