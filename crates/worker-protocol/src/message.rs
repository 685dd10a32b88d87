//! Worker protocol message types.

use bytes::Bytes;
use common::secret::SecretString;
use common::types::{GuildId, UserId};

/// Tag identifying a protocol message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Establish the session (controller → worker)
    Init = 0x01,
    /// Session established (worker → controller)
    Connected = 0x02,
    /// Request teardown (controller → worker)
    Disconnect = 0x03,
    /// Teardown complete (worker → controller)
    Disconnected = 0x04,
    /// Begin audio transmission (controller → worker)
    StartSpeak = 0x05,
    /// One audio chunk (controller → worker)
    SendAudio = 0x06,
    /// End audio transmission (controller → worker)
    StopSpeak = 0x07,
    /// All chunks of the current burst accepted (worker → controller)
    SentAudio = 0x08,
}

impl MessageKind {
    /// Parse a wire tag.
    #[must_use]
    pub const fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(Self::Init),
            0x02 => Some(Self::Connected),
            0x03 => Some(Self::Disconnect),
            0x04 => Some(Self::Disconnected),
            0x05 => Some(Self::StartSpeak),
            0x06 => Some(Self::SendAudio),
            0x07 => Some(Self::StopSpeak),
            0x08 => Some(Self::SentAudio),
            _ => None,
        }
    }

    /// Whether this kind travels from the controller to the worker.
    #[must_use]
    pub const fn is_command(self) -> bool {
        matches!(
            self,
            Self::Init | Self::Disconnect | Self::StartSpeak | Self::SendAudio | Self::StopSpeak
        )
    }

    /// Stable name used in logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Connected => "connected",
            Self::Disconnect => "disconnect",
            Self::Disconnected => "disconnected",
            Self::StartSpeak => "start_speak",
            Self::SendAudio => "send_audio",
            Self::StopSpeak => "stop_speak",
            Self::SentAudio => "sent_audio",
        }
    }
}

/// Correlated handshake result handed to a freshly spawned worker.
///
/// Built from a voice state update (session id) and a voice server update
/// (token, endpoint) for the same guild. Credentials are redacted in `Debug`.
#[derive(Debug, Clone)]
pub struct SessionInit {
    /// Guild the session belongs to.
    pub guild_id: GuildId,
    /// Local user joining voice.
    pub user_id: UserId,
    /// Gateway session id from the voice state update.
    pub session_id: SecretString,
    /// Voice server token from the voice server update.
    pub token: SecretString,
    /// Voice server endpoint (`host:port`).
    pub endpoint: String,
}

/// Message sent from the controller to a worker.
#[derive(Debug, Clone)]
pub enum WorkerCommand {
    /// Establish the media session. Sent exactly once, first.
    Init(SessionInit),
    /// Tear the media session down; the worker exits after acknowledging.
    Disconnect,
    /// Begin a speaking burst.
    StartSpeak { priority: bool },
    /// One chunk of audio for the current burst.
    SendAudio { chunk: Bytes },
    /// End the current speaking burst.
    StopSpeak,
}

impl WorkerCommand {
    /// Wire kind of this command.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::Init(_) => MessageKind::Init,
            Self::Disconnect => MessageKind::Disconnect,
            Self::StartSpeak { .. } => MessageKind::StartSpeak,
            Self::SendAudio { .. } => MessageKind::SendAudio,
            Self::StopSpeak => MessageKind::StopSpeak,
        }
    }
}

/// Message sent from a worker to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The media session is established.
    Connected,
    /// The media session is torn down.
    Disconnected,
    /// Every chunk of the current burst has been accepted.
    SentAudio,
}

impl WorkerEvent {
    /// Wire kind of this event.
    #[must_use]
    pub const fn kind(self) -> MessageKind {
        match self {
            Self::Connected => MessageKind::Connected,
            Self::Disconnected => MessageKind::Disconnected,
            Self::SentAudio => MessageKind::SentAudio,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_parse_back() {
        for tag in 0x01..=0x08 {
            let kind = MessageKind::from_u8(tag).unwrap();
            assert_eq!(kind as u8, tag);
        }
        assert_eq!(MessageKind::from_u8(0x00), None);
        assert_eq!(MessageKind::from_u8(0x09), None);
    }

    #[test]
    fn test_direction_split() {
        assert!(WorkerCommand::StopSpeak.kind().is_command());
        assert!(WorkerCommand::StartSpeak { priority: true }.kind().is_command());
        assert!(!WorkerEvent::SentAudio.kind().is_command());
        assert!(!WorkerEvent::Connected.kind().is_command());
    }

    #[test]
    fn test_session_init_debug_redacts_credentials() {
        let init = SessionInit {
            guild_id: GuildId(1),
            user_id: UserId(7),
            session_id: SecretString::from("sess1"),
            token: SecretString::from("s1"),
            endpoint: "host:1".to_string(),
        };

        let debug = format!("{:?}", WorkerCommand::Init(init));
        assert!(debug.contains("host:1"));
        assert!(!debug.contains("sess1"));
        assert!(!debug.contains("\"s1\""));
    }
}
