//! Signaling gateway interface.
//!
//! The controller consumes the platform gateway through three narrow
//! capabilities: subscribe to voice state updates, subscribe to voice server
//! updates, and send a voice state request (join or leave). Dropping a
//! [`Subscription`] unsubscribes.
//!
//! [`EventBus`] is the in-process implementation: the gateway integration
//! publishes decoded dispatch events into it and drains outbound requests.

mod bus;

pub use bus::{EventBus, DEFAULT_EVENT_CAPACITY};

use crate::errors::VcError;

use common::secret::SecretString;
use common::types::{ChannelId, GuildId, UserId};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::sync::broadcast;
use tracing::warn;

/// Voice state update for one user in one guild.
///
/// `channel_id == None` means the user left voice in that guild.
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceState {
    pub guild_id: GuildId,
    pub channel_id: Option<ChannelId>,
    pub user_id: UserId,
    pub session_id: SecretString,
}

/// Voice server assignment for a guild.
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceServer {
    pub guild_id: GuildId,
    pub token: SecretString,
    pub endpoint: String,
}

/// Outbound voice state request (join with `Some(channel)`, leave with `None`).
///
/// Serializes to the gateway's voice state update payload; `shard` selects
/// the connection it must be sent on and is not part of the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoiceStateRequest {
    #[serde(skip)]
    pub shard: u32,
    pub guild_id: GuildId,
    pub channel_id: Option<ChannelId>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

impl VoiceStateRequest {
    /// Join `channel_id` in `guild_id`.
    #[must_use]
    pub fn join(
        guild_id: GuildId,
        channel_id: ChannelId,
        shard_count: u32,
        self_mute: bool,
        self_deaf: bool,
    ) -> Self {
        Self {
            shard: guild_id.shard(shard_count),
            guild_id,
            channel_id: Some(channel_id),
            self_mute,
            self_deaf,
        }
    }

    /// Leave voice in `guild_id`.
    #[must_use]
    pub fn leave(guild_id: GuildId, shard_count: u32) -> Self {
        Self {
            shard: guild_id.shard(shard_count),
            guild_id,
            channel_id: None,
            self_mute: false,
            self_deaf: false,
        }
    }
}

/// Subscription to one kind of signaling event.
///
/// Backed by a broadcast receiver. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription<T> {
    receiver: broadcast::Receiver<T>,
}

impl<T: Clone> Subscription<T> {
    /// Wrap a broadcast receiver.
    #[must_use]
    pub fn new(receiver: broadcast::Receiver<T>) -> Self {
        Self { receiver }
    }

    /// Receive the next event.
    ///
    /// A lagging subscriber skips the overwritten events with a warning and
    /// keeps going.
    ///
    /// # Errors
    ///
    /// Returns `VcError::Signaling` once the event stream is closed.
    pub async fn recv(&mut self) -> Result<T, VcError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Ok(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        target: "vc.signaling",
                        skipped = skipped,
                        "Signaling subscription lagged, events skipped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(VcError::Signaling("event stream closed".to_string()));
                }
            }
        }
    }

    /// Take the next event if one is already queued.
    ///
    /// Returns `None` when nothing is queued or the stream is closed; the
    /// next `recv` reports the closure.
    pub fn try_recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(
                        target: "vc.signaling",
                        skipped = skipped,
                        "Signaling subscription lagged, events skipped"
                    );
                }
                Err(
                    broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed,
                ) => return None,
            }
        }
    }
}

/// Signaling gateway as seen by the controller.
pub trait SignalingGateway: Send + Sync + 'static {
    /// Subscribe to voice state updates.
    fn subscribe_voice_states(&self) -> Subscription<VoiceState>;

    /// Subscribe to voice server updates.
    fn subscribe_voice_servers(&self) -> Subscription<VoiceServer>;

    /// Send a voice state request on the shard that owns the guild.
    fn request_voice_state(
        &self,
        request: VoiceStateRequest,
    ) -> impl Future<Output = Result<(), VcError>> + Send;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;

    #[test]
    fn test_voice_state_deserializes_dispatch_payload() {
        let state: VoiceState = serde_json::from_str(
            r#"{"guild_id":"1","channel_id":"10","user_id":"7","session_id":"sess1"}"#,
        )
        .unwrap();
        assert_eq!(state.guild_id, GuildId(1));
        assert_eq!(state.channel_id, Some(ChannelId(10)));
        assert_eq!(state.session_id.expose_secret(), "sess1");
        assert!(!format!("{state:?}").contains("sess1"));

        let left: VoiceState = serde_json::from_str(
            r#"{"guild_id":"1","channel_id":null,"user_id":"7","session_id":"sess1"}"#,
        )
        .unwrap();
        assert_eq!(left.channel_id, None);
    }

    #[test]
    fn test_voice_state_request_payload() {
        let join = VoiceStateRequest::join(GuildId(3 << 22), ChannelId(10), 4, true, false);
        assert_eq!(join.shard, 3);

        let json = serde_json::to_value(&join).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "guild_id": (3_u64 << 22).to_string(),
                "channel_id": "10",
                "self_mute": true,
                "self_deaf": false,
            })
        );

        let leave = VoiceStateRequest::leave(GuildId(1), 4);
        let json = serde_json::to_value(&leave).unwrap();
        assert_eq!(json.get("channel_id"), Some(&serde_json::Value::Null));
    }

    #[tokio::test]
    async fn test_subscription_skips_lagged_events() {
        let (tx, rx) = broadcast::channel(2);
        let mut sub = Subscription::new(rx);

        for i in 0..4_u32 {
            tx.send(i).unwrap();
        }

        // The two oldest events were overwritten.
        assert_eq!(sub.recv().await.unwrap(), 2);
        assert_eq!(sub.recv().await.unwrap(), 3);

        drop(tx);
        assert!(matches!(sub.recv().await, Err(VcError::Signaling(_))));
    }

    #[test]
    fn test_try_recv_takes_only_queued_events() {
        let (tx, rx) = broadcast::channel(2);
        let mut sub = Subscription::new(rx);
        assert_eq!(sub.try_recv(), None);

        for i in 0..3_u32 {
            tx.send(i).unwrap();
        }
        // Lag is skipped, the rest is returned in order.
        assert_eq!(sub.try_recv(), Some(1));
        assert_eq!(sub.try_recv(), Some(2));
        assert_eq!(sub.try_recv(), None);

        drop(tx);
        assert_eq!(sub.try_recv(), None);
    }
}
