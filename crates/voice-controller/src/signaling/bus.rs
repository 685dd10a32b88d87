//! In-process signaling event bus.

use super::{SignalingGateway, Subscription, VoiceServer, VoiceState, VoiceStateRequest};
use crate::errors::VcError;

use tokio::sync::{broadcast, mpsc};
use tracing::trace;

/// Default capacity of each event stream and of the request queue.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// In-process [`SignalingGateway`].
///
/// The gateway integration calls [`EventBus::publish_voice_state`] and
/// [`EventBus::publish_voice_server`] for every decoded dispatch event, and
/// forwards each [`VoiceStateRequest`] from the receiver returned by
/// [`EventBus::new`] to the shard it names.
#[derive(Debug, Clone)]
pub struct EventBus {
    states: broadcast::Sender<VoiceState>,
    servers: broadcast::Sender<VoiceServer>,
    requests: mpsc::Sender<VoiceStateRequest>,
}

impl EventBus {
    /// Create a bus and the receiver for outbound voice state requests.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<VoiceStateRequest>) {
        let capacity = capacity.max(1);
        let (states, _) = broadcast::channel(capacity);
        let (servers, _) = broadcast::channel(capacity);
        let (requests, request_rx) = mpsc::channel(capacity);

        (
            Self {
                states,
                servers,
                requests,
            },
            request_rx,
        )
    }

    /// Publish a voice state update. Returns the number of subscribers
    /// that received it.
    pub fn publish_voice_state(&self, state: VoiceState) -> usize {
        trace!(
            target: "vc.signaling",
            guild_id = %state.guild_id,
            user_id = %state.user_id,
            "Publishing voice state update"
        );
        self.states.send(state).unwrap_or(0)
    }

    /// Publish a voice server update. Returns the number of subscribers
    /// that received it.
    pub fn publish_voice_server(&self, server: VoiceServer) -> usize {
        trace!(
            target: "vc.signaling",
            guild_id = %server.guild_id,
            "Publishing voice server update"
        );
        self.servers.send(server).unwrap_or(0)
    }

    /// Number of live voice state subscriptions.
    #[must_use]
    pub fn voice_state_subscribers(&self) -> usize {
        self.states.receiver_count()
    }

    /// Number of live voice server subscriptions.
    #[must_use]
    pub fn voice_server_subscribers(&self) -> usize {
        self.servers.receiver_count()
    }
}

impl SignalingGateway for EventBus {
    fn subscribe_voice_states(&self) -> Subscription<VoiceState> {
        Subscription::new(self.states.subscribe())
    }

    fn subscribe_voice_servers(&self) -> Subscription<VoiceServer> {
        Subscription::new(self.servers.subscribe())
    }

    async fn request_voice_state(&self, request: VoiceStateRequest) -> Result<(), VcError> {
        self.requests
            .send(request)
            .await
            .map_err(|e| VcError::Signaling(format!("gateway request channel closed: {e}")))
    }
}
