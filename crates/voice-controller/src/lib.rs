//! Voice session controller.
//!
//! Joins voice channels on behalf of a bot user, one session per guild, and
//! hands each session's media work to an isolated worker:
//!
//! - Correlates the two signaling updates that make up a voice handshake
//!   (voice state and voice server) into a `SessionInit`
//! - Keeps a registry of pending and active sessions, one per guild
//! - Drives each worker through the command/event protocol in
//!   `worker_protocol`
//! - Tears sessions down on request, on implicit leave, on worker fault and
//!   at shutdown
//!
//! # Architecture
//!
//! ```text
//! VoiceManagerHandle ──▶ VoiceManagerActor
//!                        ├── SignalingGateway (events in, join/leave out)
//!                        ├── WorkerSpawner    (fresh worker per session)
//!                        └── SessionActor × N ──▶ WorkerHandle
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Controller and session actors
//! - [`audio`] - Audio sources for `speak`
//! - [`config`] - Configuration from environment
//! - [`errors`] - Error types with error codes
//! - [`handshake`] - Voice handshake correlation
//! - [`observability`] - Metrics
//! - [`registry`] - Guild → session registry
//! - [`signaling`] - Gateway seam and the in-process event bus
//! - [`worker`] - Worker handles and spawners

#![warn(clippy::pedantic)]

pub mod actors;
pub mod audio;
pub mod config;
pub mod errors;
pub mod handshake;
pub mod observability;
pub mod registry;
pub mod signaling;
pub mod worker;

pub use actors::{ControllerStatus, SessionInfo, SessionPhase, SpeakReport, VoiceManagerHandle};
pub use audio::AudioSource;
pub use config::Config;
pub use errors::VcError;
pub use signaling::{EventBus, SignalingGateway, VoiceServer, VoiceState, VoiceStateRequest};
pub use worker::{ConfiguredSpawner, InProcessSpawner, ProcessSpawner, WorkerSpawner};
