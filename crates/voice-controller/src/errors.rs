//! Voice controller error types.
//!
//! Every public operation returns `Result<_, VcError>`. Internal details
//! (worker exit reasons, gateway failures) stay in the `Display` output for
//! logs; [`VcError::client_message`] gives a caller-safe summary.

use common::types::{ChannelId, GuildId};
use thiserror::Error;

/// Voice controller error type.
///
/// Error codes:
/// - Caller errors (`AlreadyConnected`, `NotConnected`, `WrongChannel`): 1-3
/// - Handshake outcomes (`HandshakeTimeout`, `Cancelled`): 4-5
/// - `AudioSource`: 6
/// - Worker, signaling and internal failures: 7
#[derive(Debug, Error)]
pub enum VcError {
    /// A session (or a pending connect) already exists for the guild.
    #[error("Already connected in guild {0}")]
    AlreadyConnected(GuildId),

    /// No active session exists for the guild.
    #[error("Not connected in guild {0}")]
    NotConnected(GuildId),

    /// The request named a channel other than the session's channel.
    #[error("Guild {guild_id} session is in channel {active}, not {requested}")]
    WrongChannel {
        guild_id: GuildId,
        requested: ChannelId,
        active: ChannelId,
    },

    /// The worker exited, closed its channel or missed an acknowledgment.
    #[error("Worker failure: {0}")]
    WorkerFailure(String),

    /// The voice state and voice server updates did not both arrive in time.
    #[error("Voice handshake timed out in guild {0}")]
    HandshakeTimeout(GuildId),

    /// The operation was cancelled (explicit cancel or shutdown).
    #[error("Operation cancelled")]
    Cancelled,

    /// The signaling gateway failed or closed an event stream.
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// The audio source failed while being streamed.
    #[error("Audio source error: {0}")]
    AudioSource(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error (actor mailbox or response channel failures).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl VcError {
    /// Returns a stable numeric code for this error.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            VcError::AlreadyConnected(_) => 1,
            VcError::NotConnected(_) => 2,
            VcError::WrongChannel { .. } => 3,
            VcError::HandshakeTimeout(_) => 4,
            VcError::Cancelled => 5,
            VcError::AudioSource(_) => 6,
            VcError::WorkerFailure(_)
            | VcError::Signaling(_)
            | VcError::Config(_)
            | VcError::Internal(_) => 7,
        }
    }

    /// Returns a caller-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            VcError::AlreadyConnected(_)
            | VcError::NotConnected(_)
            | VcError::WrongChannel { .. }
            | VcError::HandshakeTimeout(_)
            | VcError::Cancelled => self.to_string(),
            VcError::AudioSource(_) => "Audio source failed".to_string(),
            VcError::WorkerFailure(_) => "Voice connection failed".to_string(),
            VcError::Signaling(_) | VcError::Config(_) | VcError::Internal(_) => {
                "An internal error occurred".to_string()
            }
        }
    }

    /// Whether this error is the caller's fault rather than a runtime failure.
    #[must_use]
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            VcError::AlreadyConnected(_) | VcError::NotConnected(_) | VcError::WrongChannel { .. }
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(VcError::AlreadyConnected(GuildId(1)).error_code(), 1);
        assert_eq!(VcError::NotConnected(GuildId(1)).error_code(), 2);
        assert_eq!(
            VcError::WrongChannel {
                guild_id: GuildId(1),
                requested: ChannelId(11),
                active: ChannelId(10),
            }
            .error_code(),
            3
        );
        assert_eq!(VcError::HandshakeTimeout(GuildId(1)).error_code(), 4);
        assert_eq!(VcError::Cancelled.error_code(), 5);
        assert_eq!(VcError::AudioSource("eof".to_string()).error_code(), 6);
        assert_eq!(VcError::WorkerFailure("gone".to_string()).error_code(), 7);
        assert_eq!(VcError::Internal("x".to_string()).error_code(), 7);
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let err = VcError::WorkerFailure("process exited with status 101 at /opt/vw".to_string());
        assert!(!err.client_message().contains("/opt/vw"));
        assert_eq!(err.client_message(), "Voice connection failed");

        let err = VcError::Signaling("shard 3 socket reset".to_string());
        assert_eq!(err.client_message(), "An internal error occurred");
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            VcError::WrongChannel {
                guild_id: GuildId(1),
                requested: ChannelId(11),
                active: ChannelId(10),
            }
            .to_string(),
            "Guild 1 session is in channel 10, not 11"
        );
        assert_eq!(
            VcError::HandshakeTimeout(GuildId(5)).to_string(),
            "Voice handshake timed out in guild 5"
        );
    }

    #[test]
    fn test_caller_errors() {
        assert!(VcError::NotConnected(GuildId(1)).is_caller_error());
        assert!(VcError::AlreadyConnected(GuildId(1)).is_caller_error());
        assert!(!VcError::WorkerFailure("x".to_string()).is_caller_error());
        assert!(!VcError::Cancelled.is_caller_error());
    }
}
