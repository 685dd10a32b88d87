//! Mock signaling gateway for controller testing.
//!
//! Provides a gateway that can be configured to:
//! - Answer join requests with the voice state and voice server updates, in
//!   either order, or with only one of them (or none)
//! - Echo leave requests as a `channel_id = None` state update
//! - Fail every request
//! - Hold leave requests for a while, like a slow gateway
//!
//! Every request is recorded. Events are published synchronously from
//! `request_voice_state`, after the request is recorded, so a subscriber that
//! subscribed before requesting always sees them.
//!
//! # Example
//!
//! ```rust,ignore
//! use vc_test_utils::{JoinResponse, MockGateway};
//!
//! let gateway = MockGateway::builder()
//!     .respond(JoinResponse::ServerFirst)
//!     .build();
//!
//! // Hand Arc::new(gateway) to the controller...
//! ```

use crate::fixtures::{voice_server, voice_state, ENDPOINT, SESSION_ID, TOKEN, USER};

use common::types::{GuildId, UserId};
use std::sync::Mutex;
use std::time::Duration;
use voice_controller::signaling::{Subscription, DEFAULT_EVENT_CAPACITY};
use voice_controller::{
    EventBus, SignalingGateway, VcError, VoiceServer, VoiceState, VoiceStateRequest,
};

/// How the mock answers a join request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinResponse {
    /// Voice state update, then voice server update.
    #[default]
    StateFirst,
    /// Voice server update, then voice state update.
    ServerFirst,
    /// Only the voice state update (the handshake never completes).
    StateOnly,
    /// Only the voice server update (the handshake never completes).
    ServerOnly,
    /// Nothing; the test publishes events itself.
    Silent,
}

/// Mock signaling gateway.
#[derive(Debug)]
pub struct MockGateway {
    bus: EventBus,
    response: JoinResponse,
    echo_leave: bool,
    fail_requests: bool,
    leave_delay: Option<Duration>,
    user_id: UserId,
    session_id: String,
    token: String,
    endpoint: String,
    requests: Mutex<Vec<VoiceStateRequest>>,
}

impl MockGateway {
    /// Create a new MockGateway builder.
    #[must_use]
    pub fn builder() -> MockGatewayBuilder {
        MockGatewayBuilder::default()
    }

    /// Gateway that answers joins state-first and echoes leaves.
    #[must_use]
    pub fn answering() -> Self {
        Self::builder().build()
    }

    /// Gateway that records requests and publishes nothing.
    #[must_use]
    pub fn silent() -> Self {
        Self::builder().respond(JoinResponse::Silent).build()
    }

    /// Publish a voice state update as the gateway would.
    pub fn publish_voice_state(&self, state: VoiceState) -> usize {
        self.bus.publish_voice_state(state)
    }

    /// Publish a voice server update as the gateway would.
    pub fn publish_voice_server(&self, server: VoiceServer) -> usize {
        self.bus.publish_voice_server(server)
    }

    /// Every request received so far, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<VoiceStateRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Join requests received for `guild_id`.
    #[must_use]
    pub fn joins(&self, guild_id: GuildId) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.guild_id == guild_id && r.channel_id.is_some())
            .count()
    }

    /// Leave requests received for `guild_id`.
    #[must_use]
    pub fn leaves(&self, guild_id: GuildId) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.guild_id == guild_id && r.channel_id.is_none())
            .count()
    }

    /// Live voice state subscriptions.
    #[must_use]
    pub fn voice_state_subscribers(&self) -> usize {
        self.bus.voice_state_subscribers()
    }

    /// Live voice server subscriptions.
    #[must_use]
    pub fn voice_server_subscribers(&self) -> usize {
        self.bus.voice_server_subscribers()
    }

    fn answer(&self, request: &VoiceStateRequest) {
        let Some(channel_id) = request.channel_id else {
            if self.echo_leave {
                self.publish_voice_state(voice_state(
                    request.guild_id,
                    None,
                    self.user_id,
                    &self.session_id,
                ));
            }
            return;
        };

        let state = || voice_state(request.guild_id, Some(channel_id), self.user_id, &self.session_id);
        let server = || voice_server(request.guild_id, &self.token, &self.endpoint);

        match self.response {
            JoinResponse::StateFirst => {
                self.publish_voice_state(state());
                self.publish_voice_server(server());
            }
            JoinResponse::ServerFirst => {
                self.publish_voice_server(server());
                self.publish_voice_state(state());
            }
            JoinResponse::StateOnly => {
                self.publish_voice_state(state());
            }
            JoinResponse::ServerOnly => {
                self.publish_voice_server(server());
            }
            JoinResponse::Silent => {}
        }
    }
}

impl SignalingGateway for MockGateway {
    fn subscribe_voice_states(&self) -> Subscription<VoiceState> {
        self.bus.subscribe_voice_states()
    }

    fn subscribe_voice_servers(&self) -> Subscription<VoiceServer> {
        self.bus.subscribe_voice_servers()
    }

    async fn request_voice_state(&self, request: VoiceStateRequest) -> Result<(), VcError> {
        if let (None, Some(delay)) = (request.channel_id, self.leave_delay) {
            tokio::time::sleep(delay).await;
        }

        self.requests.lock().unwrap().push(request.clone());

        if self.fail_requests {
            return Err(VcError::Signaling("mock gateway rejects requests".to_string()));
        }

        self.answer(&request);
        Ok(())
    }
}

/// Builder for MockGateway configuration.
#[derive(Debug)]
pub struct MockGatewayBuilder {
    response: JoinResponse,
    echo_leave: bool,
    fail_requests: bool,
    leave_delay: Option<Duration>,
    user_id: UserId,
    session_id: String,
    token: String,
    endpoint: String,
}

impl Default for MockGatewayBuilder {
    fn default() -> Self {
        Self {
            response: JoinResponse::default(),
            echo_leave: true,
            fail_requests: false,
            leave_delay: None,
            user_id: USER,
            session_id: SESSION_ID.to_string(),
            token: TOKEN.to_string(),
            endpoint: ENDPOINT.to_string(),
        }
    }
}

impl MockGatewayBuilder {
    /// How join requests are answered.
    #[must_use]
    pub fn respond(mut self, response: JoinResponse) -> Self {
        self.response = response;
        self
    }

    /// Do not publish a state update for leave requests.
    #[must_use]
    pub fn without_leave_echo(mut self) -> Self {
        self.echo_leave = false;
        self
    }

    /// Fail every request with a signaling error.
    #[must_use]
    pub fn fail_requests(mut self) -> Self {
        self.fail_requests = true;
        self
    }

    /// Hold each leave request for `delay` before recording and answering
    /// it.
    #[must_use]
    pub fn with_leave_delay(mut self, delay: Duration) -> Self {
        self.leave_delay = Some(delay);
        self
    }

    /// User the published state updates belong to.
    #[must_use]
    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = user_id;
        self
    }

    /// Session id carried by published state updates.
    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Token and endpoint carried by published server updates.
    #[must_use]
    pub fn with_server(mut self, token: impl Into<String>, endpoint: impl Into<String>) -> Self {
        self.token = token.into();
        self.endpoint = endpoint.into();
        self
    }

    /// Build the MockGateway.
    #[must_use]
    pub fn build(self) -> MockGateway {
        let (bus, _requests) = EventBus::new(DEFAULT_EVENT_CAPACITY);

        MockGateway {
            bus,
            response: self.response,
            echo_leave: self.echo_leave,
            fail_requests: self.fail_requests,
            leave_delay: self.leave_delay,
            user_id: self.user_id,
            session_id: self.session_id,
            token: self.token,
            endpoint: self.endpoint,
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{CHANNEL, GUILD};
    use common::secret::ExposeSecret;

    fn join() -> VoiceStateRequest {
        VoiceStateRequest::join(GUILD, CHANNEL, 1, false, false)
    }

    #[tokio::test]
    async fn test_server_first_order() {
        let gateway = MockGateway::builder()
            .respond(JoinResponse::ServerFirst)
            .build();
        let mut states = gateway.subscribe_voice_states();
        let mut servers = gateway.subscribe_voice_servers();

        gateway.request_voice_state(join()).await.unwrap();

        let server = servers.recv().await.unwrap();
        assert_eq!(server.token.expose_secret(), TOKEN);
        let state = states.recv().await.unwrap();
        assert_eq!(state.channel_id, Some(CHANNEL));
        assert_eq!(gateway.joins(GUILD), 1);
    }

    #[tokio::test]
    async fn test_leave_is_echoed() {
        let gateway = MockGateway::answering();
        let mut states = gateway.subscribe_voice_states();

        gateway
            .request_voice_state(VoiceStateRequest::leave(GUILD, 1))
            .await
            .unwrap();

        assert_eq!(states.recv().await.unwrap().channel_id, None);
        assert_eq!(gateway.leaves(GUILD), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_delay_holds_only_leaves() {
        let gateway = MockGateway::builder()
            .with_leave_delay(Duration::from_secs(1))
            .build();

        let started = tokio::time::Instant::now();
        gateway.request_voice_state(join()).await.unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);

        gateway
            .request_voice_state(VoiceStateRequest::leave(GUILD, 1))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(gateway.leaves(GUILD), 1);
    }

    #[tokio::test]
    async fn test_failing_gateway_still_records() {
        let gateway = MockGateway::builder().fail_requests().build();

        let result = gateway.request_voice_state(join()).await;
        assert!(matches!(result, Err(VcError::Signaling(_))));
        assert_eq!(gateway.requests().len(), 1);
    }
}
