//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via
//! `tokio::sync::mpsc`. Request-reply uses `tokio::sync::oneshot`.

use crate::audio::AudioSource;
use crate::errors::VcError;
use crate::worker::WorkerHandle;

use common::types::{ChannelId, GuildId, UserId};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Messages sent to `VoiceManagerActor`.
#[derive(Debug)]
pub enum ControllerMessage {
    /// Join a voice channel.
    Connect {
        guild_id: GuildId,
        channel_id: ChannelId,
        user_id: UserId,
        /// Resolved once the session is recorded as active, or on failure.
        respond_to: oneshot::Sender<Result<SessionInfo, VcError>>,
    },

    /// Leave a voice channel.
    Disconnect {
        guild_id: GuildId,
        channel_id: ChannelId,
        respond_to: oneshot::Sender<Result<(), VcError>>,
    },

    /// Transmit audio in a guild's session.
    Speak {
        guild_id: GuildId,
        source: AudioSource,
        priority: bool,
        respond_to: oneshot::Sender<Result<SpeakReport, VcError>>,
    },

    /// Abort a connect that is still handshaking.
    CancelConnect {
        guild_id: GuildId,
        /// Resolved once the pending connect has been torn down.
        respond_to: oneshot::Sender<Result<(), VcError>>,
    },

    /// Look up the session (pending or active) for a guild.
    GetSession {
        guild_id: GuildId,
        respond_to: oneshot::Sender<Option<SessionInfo>>,
    },

    /// Get controller status.
    GetStatus {
        respond_to: oneshot::Sender<ControllerStatus>,
    },

    /// Disconnect every session, then stop.
    Shutdown {
        /// Time allowed for sessions to disconnect before the controller is
        /// cancelled.
        deadline: Duration,
        respond_to: oneshot::Sender<Result<(), VcError>>,
    },

    /// A handshake task finished (internal).
    HandshakeFinished {
        guild_id: GuildId,
        attempt: u64,
        started_at: Instant,
        outcome: Result<WorkerHandle, VcError>,
        respond_to: oneshot::Sender<Result<SessionInfo, VcError>>,
    },

    /// A session actor finished (internal).
    SessionEnded {
        guild_id: GuildId,
        attempt: u64,
        reason: EndReason,
        outcome: Result<(), VcError>,
        respond_to: Option<oneshot::Sender<Result<(), VcError>>>,
    },
}

/// Messages sent to `SessionActor`.
#[derive(Debug)]
pub enum SessionMessage {
    /// Run one speaking burst.
    Speak {
        source: AudioSource,
        priority: bool,
        respond_to: oneshot::Sender<Result<SpeakReport, VcError>>,
    },

    /// Tear the session down.
    Disconnect {
        reason: EndReason,
        respond_to: Option<oneshot::Sender<Result<(), VcError>>>,
    },
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// `disconnect` was called.
    Requested,
    /// The gateway reported the local user left the channel.
    ImplicitLeave,
    /// The controller is shutting down.
    Shutdown,
    /// The worker terminated unexpectedly.
    Faulted,
}

impl EndReason {
    /// Returns the reason as a string for logs and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            EndReason::Requested => "requested",
            EndReason::ImplicitLeave => "implicit_leave",
            EndReason::Shutdown => "shutdown",
            EndReason::Faulted => "faulted",
        }
    }

    /// Whether the gateway must be told to leave the channel.
    #[must_use]
    pub const fn needs_leave_request(&self) -> bool {
        !matches!(self, EndReason::ImplicitLeave)
    }
}

/// Lifecycle phase of a guild's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Connect in progress.
    Handshaking,
    /// Session established.
    Active,
    /// Teardown in progress.
    Disconnecting,
}

/// Snapshot of a guild's session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub phase: SessionPhase,
    /// Time since the connect started (handshaking) or completed (otherwise).
    pub elapsed: Duration,
}

/// Result of a completed speaking burst.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpeakReport {
    /// `SendAudio` commands sent.
    pub chunks: u64,
    /// Audio bytes sent.
    pub bytes: u64,
}

/// Status of the `VoiceManagerActor`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerStatus {
    /// Controller instance ID.
    pub controller_id: String,
    /// Established sessions.
    pub active_sessions: usize,
    /// Connects still handshaking.
    pub pending_connects: usize,
    /// Whether the controller is shutting down.
    pub is_draining: bool,
}
