//! Voice handshake correlation.
//!
//! Joining a voice channel produces two independent gateway events: a voice
//! state update carrying the session id and a voice server update carrying
//! the token and endpoint. They arrive in either order, possibly interleaved
//! with events for other guilds and users. [`HandshakeCorrelator`] holds one
//! slot per event kind and produces the [`SessionInit`] exactly once, when
//! both slots hold events for the requested guild.

use crate::errors::VcError;
use crate::signaling::{Subscription, VoiceServer, VoiceState};

use common::types::{ChannelId, GuildId, UserId};
use tracing::{debug, trace};
use worker_protocol::SessionInit;

/// Two-slot correlator for one connect request.
#[derive(Debug)]
pub struct HandshakeCorrelator {
    guild_id: GuildId,
    channel_id: ChannelId,
    user_id: UserId,
    state: Option<VoiceState>,
    server: Option<VoiceServer>,
    completed: bool,
}

impl HandshakeCorrelator {
    /// Correlator for `user_id` joining `channel_id` in `guild_id`.
    #[must_use]
    pub fn new(guild_id: GuildId, channel_id: ChannelId, user_id: UserId) -> Self {
        Self {
            guild_id,
            channel_id,
            user_id,
            state: None,
            server: None,
            completed: false,
        }
    }

    /// Guild this correlator is waiting on.
    #[must_use]
    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    /// Whether the `SessionInit` has already been produced.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completed
    }

    /// Offer a voice state update and complete if both slots are full.
    ///
    /// Ignored unless it is for this guild, channel and user. A later
    /// matching update replaces an earlier one.
    pub fn offer_state(&mut self, state: &VoiceState) -> Option<SessionInit> {
        self.buffer_state(state);
        self.complete()
    }

    /// Offer a voice server update and complete if both slots are full.
    ///
    /// Ignored unless it is for this guild. A later matching update replaces
    /// an earlier one.
    pub fn offer_server(&mut self, server: &VoiceServer) -> Option<SessionInit> {
        self.buffer_server(server);
        self.complete()
    }

    /// Store a matching voice state update without completing. Returns
    /// whether it matched.
    pub fn buffer_state(&mut self, state: &VoiceState) -> bool {
        if self.completed
            || state.guild_id != self.guild_id
            || state.user_id != self.user_id
            || state.channel_id != Some(self.channel_id)
        {
            trace!(
                target: "vc.handshake",
                guild_id = %state.guild_id,
                "Voice state update not for this handshake"
            );
            return false;
        }

        debug!(
            target: "vc.handshake",
            guild_id = %self.guild_id,
            replaced = self.state.is_some(),
            "Voice state update matched"
        );
        self.state = Some(state.clone());
        true
    }

    /// Store a matching voice server update without completing. Returns
    /// whether it matched.
    pub fn buffer_server(&mut self, server: &VoiceServer) -> bool {
        if self.completed || server.guild_id != self.guild_id {
            trace!(
                target: "vc.handshake",
                guild_id = %server.guild_id,
                "Voice server update not for this handshake"
            );
            return false;
        }

        debug!(
            target: "vc.handshake",
            guild_id = %self.guild_id,
            endpoint = %server.endpoint,
            replaced = self.server.is_some(),
            "Voice server update matched"
        );
        self.server = Some(server.clone());
        true
    }

    /// Produce the `SessionInit` if both slots are full and it has not been
    /// produced yet.
    pub fn complete(&mut self) -> Option<SessionInit> {
        if self.state.is_none() || self.server.is_none() {
            return None;
        }
        let (Some(state), Some(server)) = (self.state.take(), self.server.take()) else {
            return None;
        };
        self.completed = true;

        Some(SessionInit {
            guild_id: self.guild_id,
            user_id: self.user_id,
            session_id: state.session_id,
            token: server.token,
            endpoint: server.endpoint,
        })
    }
}

/// Drive `correlator` from the two subscriptions until it completes.
///
/// The two streams are separate queues, so after each received event
/// everything already queued on both is buffered before completion is
/// attempted. A newer duplicate that was delivered alongside the completing
/// event replaces the older one.
///
/// Both subscriptions are owned by the returned future, so they are dropped
/// (unsubscribed) on success, on error, and when the future is cancelled.
///
/// # Errors
///
/// Returns `VcError::Signaling` if either event stream closes first.
pub async fn await_session_init(
    mut correlator: HandshakeCorrelator,
    mut states: Subscription<VoiceState>,
    mut servers: Subscription<VoiceServer>,
) -> Result<SessionInit, VcError> {
    loop {
        tokio::select! {
            biased;
            state = states.recv() => {
                correlator.buffer_state(&state?);
            }
            server = servers.recv() => {
                correlator.buffer_server(&server?);
            }
        }

        while let Some(state) = states.try_recv() {
            correlator.buffer_state(&state);
        }
        while let Some(server) = servers.try_recv() {
            correlator.buffer_server(&server);
        }

        if let Some(init) = correlator.complete() {
            debug!(
                target: "vc.handshake",
                guild_id = %correlator.guild_id(),
                "Handshake correlated"
            );
            return Ok(init);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::secret::{ExposeSecret, SecretString};
    use tokio::sync::broadcast;

    fn state(guild: u64, channel: Option<u64>, user: u64, session: &str) -> VoiceState {
        VoiceState {
            guild_id: GuildId(guild),
            channel_id: channel.map(ChannelId),
            user_id: UserId(user),
            session_id: SecretString::from(session),
        }
    }

    fn server(guild: u64, token: &str, endpoint: &str) -> VoiceServer {
        VoiceServer {
            guild_id: GuildId(guild),
            token: SecretString::from(token),
            endpoint: endpoint.to_string(),
        }
    }

    fn correlator() -> HandshakeCorrelator {
        HandshakeCorrelator::new(GuildId(1), ChannelId(10), UserId(7))
    }

    fn assert_init(init: &SessionInit, session: &str, token: &str, endpoint: &str) {
        assert_eq!(init.guild_id, GuildId(1));
        assert_eq!(init.user_id, UserId(7));
        assert_eq!(init.session_id.expose_secret(), session);
        assert_eq!(init.token.expose_secret(), token);
        assert_eq!(init.endpoint, endpoint);
    }

    #[test]
    fn test_state_then_server() {
        let mut c = correlator();
        assert!(c.offer_state(&state(1, Some(10), 7, "sess1")).is_none());
        let init = c.offer_server(&server(1, "s1", "host:1")).unwrap();
        assert_init(&init, "sess1", "s1", "host:1");
        assert!(c.is_complete());
    }

    #[test]
    fn test_either_order_yields_same_init() {
        let mut a = correlator();
        a.offer_state(&state(1, Some(10), 7, "sess1"));
        let from_state_first = a.offer_server(&server(1, "s1", "host:1")).unwrap();

        let mut b = correlator();
        b.offer_server(&server(1, "s1", "host:1"));
        let from_server_first = b.offer_state(&state(1, Some(10), 7, "sess1")).unwrap();

        assert_init(&from_state_first, "sess1", "s1", "host:1");
        assert_init(&from_server_first, "sess1", "s1", "host:1");
    }

    #[test]
    fn test_unrelated_events_are_ignored() {
        let mut c = correlator();

        // Other guild, other channel, left voice, other user.
        assert!(c.offer_state(&state(2, Some(10), 7, "other")).is_none());
        assert!(c.offer_state(&state(1, Some(11), 7, "other")).is_none());
        assert!(c.offer_state(&state(1, None, 7, "other")).is_none());
        assert!(c.offer_state(&state(1, Some(10), 8, "other")).is_none());
        assert!(c.offer_server(&server(2, "other", "other:1")).is_none());

        c.offer_state(&state(1, Some(10), 7, "sess1"));
        let init = c.offer_server(&server(1, "s1", "host:1")).unwrap();
        assert_init(&init, "sess1", "s1", "host:1");
    }

    #[test]
    fn test_last_write_wins_before_completion() {
        let mut c = correlator();
        c.offer_server(&server(1, "s-old", "old:1"));
        c.offer_server(&server(1, "s-new", "new:1"));

        let init = c.offer_state(&state(1, Some(10), 7, "sess1")).unwrap();
        assert_init(&init, "sess1", "s-new", "new:1");
    }

    #[test]
    fn test_produces_init_exactly_once() {
        let mut c = correlator();
        c.offer_state(&state(1, Some(10), 7, "sess1"));
        assert!(c.offer_server(&server(1, "s1", "host:1")).is_some());

        assert!(c.offer_server(&server(1, "s2", "host:2")).is_none());
        assert!(c.offer_state(&state(1, Some(10), 7, "sess2")).is_none());
    }

    #[tokio::test]
    async fn test_await_session_init_from_subscriptions() {
        let (state_tx, state_rx) = broadcast::channel(8);
        let (server_tx, server_rx) = broadcast::channel(8);

        let task = tokio::spawn(await_session_init(
            correlator(),
            Subscription::new(state_rx),
            Subscription::new(server_rx),
        ));

        server_tx.send(server(2, "other", "other:1")).unwrap();
        server_tx.send(server(1, "s1", "host:1")).unwrap();
        state_tx.send(state(1, Some(10), 7, "sess1")).unwrap();

        let init = task.await.unwrap().unwrap();
        assert_init(&init, "sess1", "s1", "host:1");

        // Both subscriptions were dropped with the future.
        assert_eq!(state_tx.receiver_count(), 0);
        assert_eq!(server_tx.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_await_session_init_prefers_newest_queued_update() {
        let (state_tx, state_rx) = broadcast::channel(8);
        let (server_tx, server_rx) = broadcast::channel(8);
        let states = Subscription::new(state_rx);
        let servers = Subscription::new(server_rx);

        // All queued before the first poll: the state alone could complete
        // with either server update.
        state_tx.send(state(1, Some(10), 7, "sess1")).unwrap();
        server_tx.send(server(1, "s-old", "old:1")).unwrap();
        server_tx.send(server(1, "s-new", "new:1")).unwrap();

        let init = await_session_init(correlator(), states, servers)
            .await
            .unwrap();
        assert_init(&init, "sess1", "s-new", "new:1");
    }

    #[tokio::test]
    async fn test_await_session_init_prefers_newest_queued_state() {
        let (state_tx, state_rx) = broadcast::channel(8);
        let (server_tx, server_rx) = broadcast::channel(8);
        let states = Subscription::new(state_rx);
        let servers = Subscription::new(server_rx);

        state_tx.send(state(1, Some(10), 7, "stale")).unwrap();
        state_tx.send(state(1, Some(10), 7, "fresh")).unwrap();
        server_tx.send(server(1, "s1", "host:1")).unwrap();

        let init = await_session_init(correlator(), states, servers)
            .await
            .unwrap();
        assert_init(&init, "fresh", "s1", "host:1");
    }

    #[tokio::test]
    async fn test_await_session_init_fails_on_closed_stream() {
        let (state_tx, state_rx) = broadcast::channel::<VoiceState>(8);
        let (_server_tx, server_rx) = broadcast::channel::<VoiceServer>(8);
        drop(state_tx);

        let result = await_session_init(
            correlator(),
            Subscription::new(state_rx),
            Subscription::new(server_rx),
        )
        .await;
        assert!(matches!(result, Err(VcError::Signaling(_))));
    }
}
