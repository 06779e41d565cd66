//! # sonar-server
//!
//! Live "new audio" notifications over WebSocket.
//!
//! - `websocket`: connection registry, subscription index, per-connection
//!   protocol loop, idle reaper, and the broadcast dispatcher
//! - `artifacts`: upload, history, and static file routes that feed the dispatcher
//! - `server`: router assembly and process wiring

pub mod artifacts;
pub mod config;
pub mod health;
pub mod server;
pub mod websocket;

pub use config::{ConfigError, ServerConfig};
pub use server::{build_router, start, AppState, ServerHandle};
pub use websocket::dispatcher::{ArtifactNotifier, BroadcastReport, Dispatcher, NotifyError};
pub use websocket::registry::Registry;
