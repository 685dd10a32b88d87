//! Pre-configured test data fixtures for controller testing.
//!
//! Provides:
//! - Well-known guild, channel and user ids
//! - Voice state and voice server updates
//! - A controller configuration with test-friendly timeouts

use common::secret::SecretString;
use common::types::{ChannelId, GuildId, UserId};
use voice_controller::{Config, VoiceServer, VoiceState};

/// Guild used by most tests.
pub const GUILD: GuildId = GuildId(81_384_788_765_712_384);

/// A second, independent guild.
pub const OTHER_GUILD: GuildId = GuildId(41_771_983_423_143_937);

/// Voice channel in [`GUILD`].
pub const CHANNEL: ChannelId = ChannelId(1_100_000_000_000_000_010);

/// Another voice channel in [`GUILD`].
pub const OTHER_CHANNEL: ChannelId = ChannelId(1_100_000_000_000_000_011);

/// The bot user.
pub const USER: UserId = UserId(1_000_000_000_000_000_007);

/// Some other member of the guild.
pub const OTHER_USER: UserId = UserId(1_000_000_000_000_000_008);

/// Session id carried by [`voice_state`] fixtures.
pub const SESSION_ID: &str = "session-abc123";

/// Token carried by [`voice_server`] fixtures.
pub const TOKEN: &str = "voice-token-xyz";

/// Endpoint carried by [`voice_server`] fixtures.
pub const ENDPOINT: &str = "us-east1.voice.test:443";

/// Voice state update for `user_id` in `channel_id` (`None` = left voice).
#[must_use]
pub fn voice_state(
    guild_id: GuildId,
    channel_id: Option<ChannelId>,
    user_id: UserId,
    session_id: &str,
) -> VoiceState {
    VoiceState {
        guild_id,
        channel_id,
        user_id,
        session_id: SecretString::from(session_id),
    }
}

/// Voice server update for `guild_id`.
#[must_use]
pub fn voice_server(guild_id: GuildId, token: &str, endpoint: &str) -> VoiceServer {
    VoiceServer {
        guild_id,
        token: SecretString::from(token),
        endpoint: endpoint.to_string(),
    }
}

/// Configuration used by controller tests.
///
/// Handshake timeout 10s, disconnect timeout 2s, in-process workers.
#[must_use]
pub fn test_config() -> Config {
    Config {
        controller_id: "vc-test".to_string(),
        handshake_timeout_seconds: 10,
        disconnect_timeout_seconds: 2,
        ..Config::default()
    }
}
