//! `VoiceManagerActor` - singleton supervisor for voice sessions.
//!
//! The `VoiceManagerActor` is the top-level actor of the controller:
//!
//! - Owns the session registry; no other task mutates it
//! - Runs one handshake task per pending connect
//! - Supervises N `SessionActor` instances (panic detection via `JoinHandle`)
//! - Watches voice state updates for implicit leaves
//! - Owns the root `CancellationToken`
//!
//! # Connect
//!
//! The guild is reserved in the registry before anything else happens, so a
//! second connect for the same guild fails with `AlreadyConnected` even while
//! the first is still handshaking. The handshake task subscribes to both
//! update kinds, sends the join request, then waits for the `SessionInit` and
//! a freshly spawned worker concurrently. It reports back with
//! `HandshakeFinished`; the actor records the session as active before the
//! caller is resolved.
//!
//! # Graceful Shutdown
//!
//! 1. Sets `accepting_new = false`
//! 2. Cancels pending handshakes
//! 3. Sends `Disconnect` to every active session and waits for them, bounded
//!    by the deadline
//! 4. Cancels the root `CancellationToken`

use crate::audio::AudioSource;
use crate::config::Config;
use crate::errors::VcError;
use crate::handshake::{await_session_init, HandshakeCorrelator};
use crate::observability::metrics;
use crate::registry::{PendingSession, SessionRegistry, SessionSlot};
use crate::signaling::{SignalingGateway, Subscription, VoiceState, VoiceStateRequest};
use crate::worker::{WorkerHandle, WorkerSpawner, WorkerSpec};

use super::messages::{
    ControllerMessage, ControllerStatus, EndReason, SessionInfo, SessionMessage, SessionPhase,
    SpeakReport,
};
use super::session::{SessionActor, SessionActorHandle, SessionIdentity, SessionSettings};

use common::types::{ChannelId, GuildId, UserId};
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use worker_protocol::{WorkerCommand, WorkerEvent};

/// Default channel buffer size for the controller mailbox.
const CONTROLLER_CHANNEL_BUFFER: usize = 1000;

/// Handle to the `VoiceManagerActor`.
///
/// This is the public interface of the controller. All methods are async and
/// return results via oneshot channels.
#[derive(Debug, Clone)]
pub struct VoiceManagerHandle {
    sender: mpsc::Sender<ControllerMessage>,
    cancel_token: CancellationToken,
}

impl VoiceManagerHandle {
    /// Create a new `VoiceManagerActor` and return a handle to it.
    ///
    /// This spawns the actor task and returns immediately. The actor
    /// subscribes to voice state updates before this returns.
    ///
    /// # Arguments
    ///
    /// * `config` - Controller configuration
    /// * `gateway` - Signaling gateway (event source and request sink)
    /// * `spawner` - Produces a fresh worker per session
    #[must_use]
    pub fn new<G, S>(config: Config, gateway: Arc<G>, spawner: Arc<S>) -> Self
    where
        G: SignalingGateway,
        S: WorkerSpawner,
    {
        let (sender, receiver) = mpsc::channel(CONTROLLER_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = VoiceManagerActor::new(
            config,
            gateway,
            spawner,
            receiver,
            sender.downgrade(),
            cancel_token.clone(),
        );

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    /// Join `channel_id` in `guild_id` as `user_id`.
    ///
    /// Resolves once the worker reports `Connected` and the session is
    /// recorded as active.
    ///
    /// # Errors
    ///
    /// - `AlreadyConnected` if the guild has an active or pending session
    /// - `HandshakeTimeout` if the handshake does not finish in time
    /// - `Cancelled` if `cancel_connect` or shutdown interrupted the handshake
    /// - `WorkerFailure` if the worker could not be started or connected
    pub async fn connect(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        user_id: UserId,
    ) -> Result<SessionInfo, VcError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::Connect {
                guild_id,
                channel_id,
                user_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| VcError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| VcError::Internal(format!("response receive failed: {e}")))?
    }

    /// Leave the voice channel in `guild_id`.
    ///
    /// # Errors
    ///
    /// - `NotConnected` if the guild has no active session
    /// - `WrongChannel` if the session is in another channel
    /// - `WorkerFailure` if the worker did not acknowledge in time (the
    ///   session is removed regardless)
    pub async fn disconnect(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<(), VcError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::Disconnect {
                guild_id,
                channel_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| VcError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| VcError::Internal(format!("response receive failed: {e}")))?
    }

    /// Transmit `source` in `guild_id`'s session as one speaking burst.
    ///
    /// # Errors
    ///
    /// - `NotConnected` if the guild has no active session
    /// - `AudioSource` if the source fails mid-stream (the burst is closed)
    /// - `WorkerFailure` if the worker exits during the burst
    pub async fn speak(
        &self,
        guild_id: GuildId,
        source: impl Into<AudioSource>,
        priority: bool,
    ) -> Result<SpeakReport, VcError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::Speak {
                guild_id,
                source: source.into(),
                priority,
                respond_to: tx,
            })
            .await
            .map_err(|e| VcError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| VcError::Internal(format!("response receive failed: {e}")))?
    }

    /// Abort the pending connect for `guild_id`.
    ///
    /// Resolves once the handshake has been torn down; the pending `connect`
    /// call fails with `Cancelled`.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` if no connect is pending for the guild.
    pub async fn cancel_connect(&self, guild_id: GuildId) -> Result<(), VcError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::CancelConnect {
                guild_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| VcError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| VcError::Internal(format!("response receive failed: {e}")))?
    }

    /// Snapshot of the guild's session, pending or active.
    pub async fn session(&self, guild_id: GuildId) -> Result<Option<SessionInfo>, VcError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::GetSession {
                guild_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| VcError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| VcError::Internal(format!("response receive failed: {e}")))
    }

    /// Get the current controller status.
    pub async fn status(&self) -> Result<ControllerStatus, VcError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| VcError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| VcError::Internal(format!("response receive failed: {e}")))
    }

    /// Disconnect every session, waiting up to `deadline`, then stop the
    /// controller.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), VcError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::Shutdown {
                deadline,
                respond_to: tx,
            })
            .await
            .map_err(|e| VcError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| VcError::Internal(format!("response receive failed: {e}")))?
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Internal state for a managed session.
#[derive(Debug)]
struct ManagedSession {
    /// Handle to the session actor.
    handle: SessionActorHandle,
    /// Join handle for monitoring the actor task.
    task_handle: JoinHandle<()>,
}

/// The `VoiceManagerActor` implementation.
///
/// This struct owns the actor state and runs the message loop.
pub struct VoiceManagerActor<G, S> {
    config: Config,
    gateway: Arc<G>,
    spawner: Arc<S>,
    /// Message receiver.
    receiver: mpsc::Receiver<ControllerMessage>,
    /// Sender handed to handshake tasks and session actors for reporting
    /// back. Weak, so the mailbox closes once every handle is dropped.
    reports: mpsc::WeakSender<ControllerMessage>,
    /// Cancellation token (root).
    cancel_token: CancellationToken,
    registry: SessionRegistry<ManagedSession>,
    next_attempt: u64,
    /// Whether the controller is accepting new connects.
    accepting_new: bool,
    /// Voice state updates, for implicit leave detection.
    states: Option<Subscription<VoiceState>>,
}

impl<G: SignalingGateway, S: WorkerSpawner> VoiceManagerActor<G, S> {
    /// Create a new controller actor (not started).
    fn new(
        config: Config,
        gateway: Arc<G>,
        spawner: Arc<S>,
        receiver: mpsc::Receiver<ControllerMessage>,
        reports: mpsc::WeakSender<ControllerMessage>,
        cancel_token: CancellationToken,
    ) -> Self {
        let states = Some(gateway.subscribe_voice_states());

        Self {
            config,
            gateway,
            spawner,
            receiver,
            reports,
            cancel_token,
            registry: SessionRegistry::new(),
            next_attempt: 1,
            accepting_new: true,
            states,
        }
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "vc.actor.controller", fields(controller_id = %self.config.controller_id))]
    async fn run(mut self) {
        info!(
            target: "vc.actor.controller",
            controller_id = %self.config.controller_id,
            "VoiceManagerActor started"
        );

        loop {
            // Check for terminated session actors
            self.check_session_health().await;

            tokio::select! {
                // Handle cancellation
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "vc.actor.controller",
                        controller_id = %self.config.controller_id,
                        "VoiceManagerActor received cancellation signal"
                    );
                    self.drain_mailbox();
                    break;
                }

                // Handle messages
                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => self.handle_message(message),
                        None => {
                            info!(
                                target: "vc.actor.controller",
                                controller_id = %self.config.controller_id,
                                "VoiceManagerActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }

                // Watch for implicit leaves
                state = next_voice_state(&mut self.states) => {
                    match state {
                        Ok(state) => self.observe_voice_state(&state),
                        Err(e) => {
                            warn!(
                                target: "vc.actor.controller",
                                controller_id = %self.config.controller_id,
                                error = %e,
                                "Voice state stream closed, implicit leave detection disabled"
                            );
                            self.states = None;
                        }
                    }
                }
            }
        }

        // Session actors hold child tokens; make sure they wind down even
        // when the loop ended because every handle was dropped.
        self.cancel_token.cancel();

        info!(
            target: "vc.actor.controller",
            controller_id = %self.config.controller_id,
            sessions_remaining = self.registry.len(),
            "VoiceManagerActor stopped"
        );
    }

    /// Handle a single message.
    fn handle_message(&mut self, message: ControllerMessage) {
        match message {
            ControllerMessage::Connect {
                guild_id,
                channel_id,
                user_id,
                respond_to,
            } => self.connect(guild_id, channel_id, user_id, respond_to),

            ControllerMessage::Disconnect {
                guild_id,
                channel_id,
                respond_to,
            } => self.disconnect(guild_id, channel_id, respond_to),

            ControllerMessage::Speak {
                guild_id,
                source,
                priority,
                respond_to,
            } => self.speak(guild_id, source, priority, respond_to),

            ControllerMessage::CancelConnect {
                guild_id,
                respond_to,
            } => self.cancel_connect(guild_id, respond_to),

            ControllerMessage::GetSession {
                guild_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.session_info(guild_id));
            }

            ControllerMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            ControllerMessage::Shutdown {
                deadline,
                respond_to,
            } => self.initiate_shutdown(deadline, respond_to),

            ControllerMessage::HandshakeFinished {
                guild_id,
                attempt,
                started_at,
                outcome,
                respond_to,
            } => self.handshake_finished(guild_id, attempt, started_at, outcome, respond_to),

            ControllerMessage::SessionEnded {
                guild_id,
                attempt,
                reason,
                outcome,
                respond_to,
            } => self.session_ended(guild_id, attempt, reason, outcome, respond_to),
        }
    }

    /// Reserve the guild and start the handshake task.
    fn connect(
        &mut self,
        guild_id: GuildId,
        channel_id: ChannelId,
        user_id: UserId,
        respond_to: oneshot::Sender<Result<SessionInfo, VcError>>,
    ) {
        if !self.accepting_new {
            metrics::record_connect("cancelled");
            let _ = respond_to.send(Err(VcError::Cancelled));
            return;
        }

        let attempt = self.next_attempt;
        self.next_attempt += 1;

        let cancel_token = self.cancel_token.child_token();
        let started_at = Instant::now();
        let pending = PendingSession {
            attempt,
            channel_id,
            user_id,
            cancel_token: cancel_token.clone(),
            started_at,
            cancel_waiters: Vec::new(),
        };

        if let Err(e) = self.registry.reserve(guild_id, pending) {
            debug!(
                target: "vc.actor.controller",
                guild_id = %guild_id,
                "Connect rejected, guild already has a session"
            );
            metrics::record_connect(metrics::connect_outcome(&Err(&e)));
            let _ = respond_to.send(Err(e));
            return;
        }

        info!(
            target: "vc.actor.controller",
            guild_id = %guild_id,
            channel_id = %channel_id,
            attempt = attempt,
            "Connect started"
        );

        let task = HandshakeTask {
            guild_id,
            channel_id,
            user_id,
            attempt,
            started_at,
            timeout: self.config.handshake_timeout(),
            shard_count: self.config.shard_count,
            self_mute: self.config.self_mute,
            self_deaf: self.config.self_deaf,
            gateway: Arc::clone(&self.gateway),
            spawner: Arc::clone(&self.spawner),
            controller: self.reports.clone(),
            cancel_token,
        };

        tokio::spawn(task.run(respond_to));
    }

    /// Promote (or discard) a finished handshake.
    fn handshake_finished(
        &mut self,
        guild_id: GuildId,
        attempt: u64,
        started_at: Instant,
        outcome: Result<WorkerHandle, VcError>,
        respond_to: oneshot::Sender<Result<SessionInfo, VcError>>,
    ) {
        let Some(pending) = self
            .registry
            .pending_mut(guild_id)
            .filter(|pending| pending.attempt == attempt)
        else {
            // Reservation is gone; nothing may be activated.
            if let Ok(worker) = outcome {
                tokio::spawn(worker.terminate());
            }
            metrics::record_connect("cancelled");
            let _ = respond_to.send(Err(VcError::Cancelled));
            return;
        };

        let cancelled = pending.cancel_token.is_cancelled();
        let waiters = std::mem::take(&mut pending.cancel_waiters);
        let channel_id = pending.channel_id;
        let user_id = pending.user_id;

        let result = match outcome {
            Ok(worker) if !cancelled => {
                self.activate(guild_id, channel_id, attempt, worker)
                    .map(|()| SessionInfo {
                        guild_id,
                        channel_id,
                        user_id,
                        phase: SessionPhase::Active,
                        elapsed: Duration::ZERO,
                    })
            }
            Ok(worker) => {
                // Cancelled after the worker connected: tear it back down.
                self.registry.remove(guild_id);
                let gateway = Arc::clone(&self.gateway);
                let leave = VoiceStateRequest::leave(guild_id, self.config.shard_count);
                tokio::spawn(async move {
                    worker.terminate().await;
                    if let Err(e) = gateway.request_voice_state(leave).await {
                        warn!(
                            target: "vc.actor.controller",
                            guild_id = %guild_id,
                            error = %e,
                            "Failed to send leave request for cancelled connect"
                        );
                    }
                });
                Err(VcError::Cancelled)
            }
            Err(e) => {
                self.registry.remove(guild_id);
                Err(e)
            }
        };

        match &result {
            Ok(_) => {
                metrics::record_handshake_duration(started_at.elapsed());
                info!(
                    target: "vc.actor.controller",
                    guild_id = %guild_id,
                    channel_id = %channel_id,
                    attempt = attempt,
                    "Session active"
                );
            }
            Err(e) => info!(
                target: "vc.actor.controller",
                guild_id = %guild_id,
                attempt = attempt,
                error = %e,
                "Connect failed"
            ),
        }

        metrics::record_connect(metrics::connect_outcome(&result.as_ref().map(|_| ())));
        metrics::set_sessions_active(self.registry.active_count());

        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
        let _ = respond_to.send(result);
    }

    /// Spawn the session actor and record the session as active.
    fn activate(
        &mut self,
        guild_id: GuildId,
        channel_id: ChannelId,
        attempt: u64,
        worker: WorkerHandle,
    ) -> Result<(), VcError> {
        let (handle, task_handle) = SessionActor::spawn(
            SessionIdentity {
                guild_id,
                channel_id,
                attempt,
            },
            SessionSettings {
                disconnect_timeout: self.config.disconnect_timeout(),
                shard_count: self.config.shard_count,
            },
            worker,
            Arc::clone(&self.gateway),
            self.reports.clone(),
            self.cancel_token.child_token(),
        );

        let managed = ManagedSession {
            handle: handle.clone(),
            task_handle,
        };

        self.registry
            .activate(guild_id, attempt, managed)
            .inspect_err(|_| handle.cancel())
    }

    fn disconnect(
        &mut self,
        guild_id: GuildId,
        channel_id: ChannelId,
        respond_to: oneshot::Sender<Result<(), VcError>>,
    ) {
        let active = match self.registry.active_mut(guild_id) {
            Some(active) if !active.disconnecting => active,
            _ => {
                let _ = respond_to.send(Err(VcError::NotConnected(guild_id)));
                return;
            }
        };

        if active.channel_id != channel_id {
            let _ = respond_to.send(Err(VcError::WrongChannel {
                guild_id,
                requested: channel_id,
                active: active.channel_id,
            }));
            return;
        }

        active.disconnecting = true;
        let message = SessionMessage::Disconnect {
            reason: EndReason::Requested,
            respond_to: Some(respond_to),
        };

        if let Err(message) = active.handle.handle.try_deliver(message) {
            active.disconnecting = false;
            if let SessionMessage::Disconnect {
                respond_to: Some(respond_to),
                ..
            } = message
            {
                let _ = respond_to.send(Err(VcError::Internal(
                    "session mailbox unavailable".to_string(),
                )));
            }
            return;
        }

        info!(
            target: "vc.actor.controller",
            guild_id = %guild_id,
            channel_id = %channel_id,
            "Disconnect requested"
        );
    }

    fn speak(
        &mut self,
        guild_id: GuildId,
        source: AudioSource,
        priority: bool,
        respond_to: oneshot::Sender<Result<SpeakReport, VcError>>,
    ) {
        let Some(active) = self
            .registry
            .active(guild_id)
            .filter(|active| !active.disconnecting)
        else {
            let _ = respond_to.send(Err(VcError::NotConnected(guild_id)));
            return;
        };

        let message = SessionMessage::Speak {
            source,
            priority,
            respond_to,
        };

        if let Err(SessionMessage::Speak { respond_to, .. }) = active.handle.handle.try_deliver(message)
        {
            let _ = respond_to.send(Err(VcError::Internal(
                "session mailbox unavailable".to_string(),
            )));
        }
    }

    fn cancel_connect(&mut self, guild_id: GuildId, respond_to: oneshot::Sender<Result<(), VcError>>) {
        match self.registry.pending_mut(guild_id) {
            Some(pending) => {
                info!(
                    target: "vc.actor.controller",
                    guild_id = %guild_id,
                    attempt = pending.attempt,
                    "Cancelling pending connect"
                );
                pending.cancel_token.cancel();
                pending.cancel_waiters.push(respond_to);
            }
            None => {
                let _ = respond_to.send(Err(VcError::NotConnected(guild_id)));
            }
        }
    }

    /// Remove a finished session and resolve its disconnect, if any.
    fn session_ended(
        &mut self,
        guild_id: GuildId,
        attempt: u64,
        reason: EndReason,
        outcome: Result<(), VcError>,
        respond_to: Option<oneshot::Sender<Result<(), VcError>>>,
    ) {
        self.registry.remove_attempt(guild_id, attempt);

        metrics::record_disconnect(reason.as_str());
        metrics::set_sessions_active(self.registry.active_count());

        match &outcome {
            Ok(()) => info!(
                target: "vc.actor.controller",
                guild_id = %guild_id,
                reason = reason.as_str(),
                "Session ended"
            ),
            Err(e) => warn!(
                target: "vc.actor.controller",
                guild_id = %guild_id,
                reason = reason.as_str(),
                error = %e,
                "Session ended with error"
            ),
        }

        if let Some(respond_to) = respond_to {
            let _ = respond_to.send(outcome);
        }
    }

    /// React to a voice state update for implicit leaves.
    fn observe_voice_state(&mut self, state: &VoiceState) {
        let Some(active) = self.registry.active_mut(state.guild_id) else {
            return;
        };
        if active.user_id != state.user_id || active.disconnecting {
            return;
        }

        match state.channel_id {
            None => {
                info!(
                    target: "vc.actor.controller",
                    guild_id = %state.guild_id,
                    channel_id = %active.channel_id,
                    "Local user left voice, tearing session down"
                );
                active.disconnecting = true;
                let message = SessionMessage::Disconnect {
                    reason: EndReason::ImplicitLeave,
                    respond_to: None,
                };
                if active.handle.handle.try_deliver(message).is_err() {
                    active.disconnecting = false;
                    warn!(
                        target: "vc.actor.controller",
                        guild_id = %state.guild_id,
                        "Session mailbox unavailable for implicit leave"
                    );
                }
            }
            Some(channel_id) if channel_id != active.channel_id => {
                info!(
                    target: "vc.actor.controller",
                    guild_id = %state.guild_id,
                    from = %active.channel_id,
                    to = %channel_id,
                    "Local user moved channels, ignoring"
                );
            }
            Some(_) => {}
        }
    }

    fn session_info(&self, guild_id: GuildId) -> Option<SessionInfo> {
        match self.registry.get(guild_id)? {
            SessionSlot::Pending(pending) => Some(SessionInfo {
                guild_id,
                channel_id: pending.channel_id,
                user_id: pending.user_id,
                phase: SessionPhase::Handshaking,
                elapsed: pending.started_at.elapsed(),
            }),
            SessionSlot::Active(active) => Some(SessionInfo {
                guild_id,
                channel_id: active.channel_id,
                user_id: active.user_id,
                phase: if active.disconnecting {
                    SessionPhase::Disconnecting
                } else {
                    SessionPhase::Active
                },
                elapsed: active.connected_at.elapsed(),
            }),
        }
    }

    fn get_status(&self) -> ControllerStatus {
        ControllerStatus {
            controller_id: self.config.controller_id.clone(),
            active_sessions: self.registry.active_count(),
            pending_connects: self.registry.pending_count(),
            is_draining: !self.accepting_new,
        }
    }

    /// Stop accepting connects, disconnect every session, then cancel.
    ///
    /// The wait runs on its own task so the actor keeps processing the
    /// sessions' `SessionEnded` reports.
    fn initiate_shutdown(&mut self, deadline: Duration, respond_to: oneshot::Sender<Result<(), VcError>>) {
        info!(
            target: "vc.actor.controller",
            controller_id = %self.config.controller_id,
            active_sessions = self.registry.active_count(),
            pending_connects = self.registry.pending_count(),
            deadline_secs = deadline.as_secs(),
            "Initiating graceful shutdown"
        );

        self.accepting_new = false;

        for (_, pending) in self.registry.pending_sessions() {
            pending.cancel_token.cancel();
        }

        let guilds: Vec<GuildId> = self
            .registry
            .active_sessions()
            .filter(|(_, active)| !active.disconnecting)
            .map(|(guild_id, _)| guild_id)
            .collect();

        let mut acknowledgments = Vec::with_capacity(guilds.len());
        for guild_id in guilds {
            let Some(active) = self.registry.active_mut(guild_id) else {
                continue;
            };
            let (tx, rx) = oneshot::channel();
            let message = SessionMessage::Disconnect {
                reason: EndReason::Shutdown,
                respond_to: Some(tx),
            };
            if active.handle.handle.try_deliver(message).is_ok() {
                active.disconnecting = true;
                acknowledgments.push(rx);
            }
        }

        let cancel_token = self.cancel_token.clone();
        let controller_id = self.config.controller_id.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(deadline, join_all(acknowledgments)).await {
                Ok(results) => info!(
                    target: "vc.actor.controller",
                    controller_id = %controller_id,
                    sessions = results.len(),
                    "All sessions disconnected"
                ),
                Err(_) => warn!(
                    target: "vc.actor.controller",
                    controller_id = %controller_id,
                    "Shutdown deadline elapsed with sessions still disconnecting"
                ),
            }
            cancel_token.cancel();
            let _ = respond_to.send(Ok(()));
        });
    }

    /// Answer everything still queued after cancellation.
    fn drain_mailbox(&mut self) {
        self.receiver.close();
        while let Ok(message) = self.receiver.try_recv() {
            match message {
                ControllerMessage::Connect { respond_to, .. } => {
                    let _ = respond_to.send(Err(VcError::Cancelled));
                }
                ControllerMessage::Disconnect { respond_to, .. }
                | ControllerMessage::CancelConnect { respond_to, .. }
                | ControllerMessage::Shutdown { respond_to, .. } => {
                    let _ = respond_to.send(Err(VcError::Cancelled));
                }
                ControllerMessage::Speak { respond_to, .. } => {
                    let _ = respond_to.send(Err(VcError::Cancelled));
                }
                ControllerMessage::GetSession {
                    guild_id,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.session_info(guild_id));
                }
                ControllerMessage::GetStatus { respond_to } => {
                    let _ = respond_to.send(self.get_status());
                }
                ControllerMessage::HandshakeFinished {
                    outcome,
                    respond_to,
                    ..
                } => {
                    if let Ok(worker) = outcome {
                        tokio::spawn(worker.terminate());
                    }
                    let _ = respond_to.send(Err(VcError::Cancelled));
                }
                ControllerMessage::SessionEnded {
                    outcome,
                    respond_to,
                    ..
                } => {
                    if let Some(respond_to) = respond_to {
                        let _ = respond_to.send(outcome);
                    }
                }
            }
        }
    }

    /// Check health of session actors.
    ///
    /// A session actor reports `SessionEnded` before it exits, so a finished
    /// task normally has its report queued. A panicked one never reports; its
    /// slot is dropped here.
    async fn check_session_health(&mut self) {
        let finished: Vec<GuildId> = self
            .registry
            .active_sessions()
            .filter(|(_, active)| active.handle.task_handle.is_finished())
            .map(|(guild_id, _)| guild_id)
            .collect();

        for guild_id in finished {
            let Some(SessionSlot::Active(active)) = self.registry.remove(guild_id) else {
                continue;
            };

            match active.handle.task_handle.await {
                Ok(()) => debug!(
                    target: "vc.actor.controller",
                    guild_id = %guild_id,
                    "Session actor exited"
                ),
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "vc.actor.controller",
                            guild_id = %guild_id,
                            error = ?join_error,
                            "Session actor panicked"
                        );
                        metrics::record_disconnect(EndReason::Faulted.as_str());
                    }
                }
            }

            metrics::set_sessions_active(self.registry.active_count());
        }
    }
}

/// Next voice state update, or never when the subscription is gone.
async fn next_voice_state(
    states: &mut Option<Subscription<VoiceState>>,
) -> Result<VoiceState, VcError> {
    match states {
        Some(states) => states.recv().await,
        None => std::future::pending().await,
    }
}

/// One connect's handshake, run on its own task.
struct HandshakeTask<G, S> {
    guild_id: GuildId,
    channel_id: ChannelId,
    user_id: UserId,
    attempt: u64,
    started_at: Instant,
    timeout: Option<Duration>,
    shard_count: u32,
    self_mute: bool,
    self_deaf: bool,
    gateway: Arc<G>,
    spawner: Arc<S>,
    controller: mpsc::WeakSender<ControllerMessage>,
    cancel_token: CancellationToken,
}

impl<G: SignalingGateway, S: WorkerSpawner> HandshakeTask<G, S> {
    #[instrument(
        skip_all,
        name = "vc.handshake",
        fields(guild_id = %self.guild_id, channel_id = %self.channel_id, attempt = self.attempt)
    )]
    async fn run(self, respond_to: oneshot::Sender<Result<SessionInfo, VcError>>) {
        let outcome = tokio::select! {
            () = self.cancel_token.cancelled() => Err(VcError::Cancelled),
            result = self.establish_within_timeout() => result,
        };

        if let Err(e) = &outcome {
            debug!(
                target: "vc.handshake",
                guild_id = %self.guild_id,
                error = %e,
                "Handshake failed, leaving channel"
            );
            self.leave().await;
        }

        let message = ControllerMessage::HandshakeFinished {
            guild_id: self.guild_id,
            attempt: self.attempt,
            started_at: self.started_at,
            outcome,
            respond_to,
        };

        let undelivered = match self.controller.upgrade() {
            Some(controller) => controller.send(message).await.err().map(|e| e.0),
            None => Some(message),
        };

        // Controller is gone; the session can never be recorded.
        if let Some(ControllerMessage::HandshakeFinished {
            outcome,
            respond_to,
            ..
        }) = undelivered
        {
            if let Ok(worker) = outcome {
                worker.terminate().await;
                self.leave().await;
            }
            let _ = respond_to.send(Err(VcError::Cancelled));
        }
    }

    async fn establish_within_timeout(&self) -> Result<WorkerHandle, VcError> {
        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.establish())
                .await
                .unwrap_or_else(|_| {
                    warn!(
                        target: "vc.handshake",
                        guild_id = %self.guild_id,
                        timeout_secs = timeout.as_secs(),
                        "Handshake timed out"
                    );
                    Err(VcError::HandshakeTimeout(self.guild_id))
                }),
            None => self.establish().await,
        }
    }

    /// Join request, then `SessionInit` and worker in parallel, then `Init`.
    async fn establish(&self) -> Result<WorkerHandle, VcError> {
        let correlator = HandshakeCorrelator::new(self.guild_id, self.channel_id, self.user_id);
        // Subscribe before requesting so neither update can be missed.
        let states = self.gateway.subscribe_voice_states();
        let servers = self.gateway.subscribe_voice_servers();

        let request = VoiceStateRequest::join(
            self.guild_id,
            self.channel_id,
            self.shard_count,
            self.self_mute,
            self.self_deaf,
        );
        self.gateway.request_voice_state(request).await?;

        let spec = WorkerSpec {
            guild_id: self.guild_id,
            channel_id: self.channel_id,
        };
        let spawn_worker = async {
            self.spawner
                .spawn(spec)
                .await
                .inspect_err(|_| metrics::record_worker_failure("spawn"))
        };

        let (init, mut worker) =
            tokio::try_join!(await_session_init(correlator, states, servers), spawn_worker)?;

        match connect_worker(&mut worker, init).await {
            Ok(()) => Ok(worker),
            Err(e) => {
                metrics::record_worker_failure("init");
                worker.terminate().await;
                Err(e)
            }
        }
    }

    async fn leave(&self) {
        let request = VoiceStateRequest::leave(self.guild_id, self.shard_count);
        if let Err(e) = self.gateway.request_voice_state(request).await {
            warn!(
                target: "vc.handshake",
                guild_id = %self.guild_id,
                error = %e,
                "Failed to send leave request"
            );
        }
    }
}

/// Send `Init` and wait for `Connected`.
async fn connect_worker(
    worker: &mut WorkerHandle,
    init: worker_protocol::SessionInit,
) -> Result<(), VcError> {
    worker.send(WorkerCommand::Init(init)).await?;

    loop {
        match worker.recv().await {
            Some(WorkerEvent::Connected) => {
                debug!(
                    target: "vc.handshake",
                    worker = %worker.name(),
                    "Worker connected"
                );
                return Ok(());
            }
            Some(event) => warn!(
                target: "vc.handshake",
                worker = %worker.name(),
                event = event.kind().as_str(),
                "Unexpected worker event before Connected"
            ),
            None => {
                return Err(VcError::WorkerFailure(format!(
                    "worker {} exited before Connected",
                    worker.name()
                )))
            }
        }
    }
}
