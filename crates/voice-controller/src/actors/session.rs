//! `SessionActor` - owns one guild's worker once the session is established.
//!
//! The session actor is the only task that talks to an established worker.
//! Speak and disconnect requests for the guild queue in its mailbox and run
//! one at a time, so bursts never interleave and a disconnect waits for the
//! burst in progress.
//!
//! # Speak
//!
//! ```text
//! StartSpeak(priority) → SendAudio × N → (await SentAudio) → StopSpeak
//! ```
//!
//! The wait is skipped when no chunk was sent. An audio source error stops
//! the stream; the burst is still closed and the call fails with
//! `AudioSource`.
//!
//! # Teardown
//!
//! `Disconnect` → `Disconnected` (bounded by the disconnect timeout), then
//! the gateway leave request, then `SessionEnded` to the controller, which
//! removes the registry entry and resolves the caller.
//!
//! A worker that exits on its own ends the session as `Faulted`. The
//! controller is told first, so the registry entry is gone before the failed
//! speak and any queued requests are answered with `WorkerFailure`; the leave
//! request follows.

use super::messages::{ControllerMessage, EndReason, SessionMessage, SpeakReport};
use crate::audio::AudioSource;
use crate::errors::VcError;
use crate::observability::metrics;
use crate::signaling::{SignalingGateway, VoiceStateRequest};
use crate::worker::WorkerHandle;

use bytes::Bytes;
use common::types::{ChannelId, GuildId};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use worker_protocol::{WorkerCommand, WorkerEvent, MAX_FRAME_LENGTH};

/// Channel buffer size for the session mailbox.
const SESSION_CHANNEL_BUFFER: usize = 64;

/// Largest audio chunk that fits in one `SendAudio` frame.
pub const MAX_AUDIO_CHUNK: usize = MAX_FRAME_LENGTH - 1;

/// Handle to a `SessionActor`.
#[derive(Debug, Clone)]
pub struct SessionActorHandle {
    sender: mpsc::Sender<SessionMessage>,
    cancel_token: CancellationToken,
}

impl SessionActorHandle {
    /// Queue a message without waiting. On failure the message is handed
    /// back so its response channel can be answered.
    ///
    /// # Errors
    ///
    /// Returns the message if the mailbox is full or closed.
    pub fn try_deliver(&self, message: SessionMessage) -> Result<(), SessionMessage> {
        self.sender.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(message)
            | mpsc::error::TrySendError::Closed(message) => message,
        })
    }

    /// Cancel the actor (terminates the worker without a graceful disconnect).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Static facts about the session an actor owns.
#[derive(Debug, Clone, Copy)]
pub struct SessionIdentity {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    /// Connect attempt the session came from.
    pub attempt: u64,
}

/// Settings a session actor needs from the controller configuration.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub disconnect_timeout: Duration,
    pub shard_count: u32,
}

/// How the message loop ended.
enum Exit {
    /// Report to the controller.
    Ended {
        reason: EndReason,
        outcome: Result<(), VcError>,
        respond_to: Option<oneshot::Sender<Result<(), VcError>>>,
    },
    /// The worker exited on its own, possibly during a speak.
    Faulted {
        error: String,
        speak: Option<oneshot::Sender<Result<SpeakReport, VcError>>>,
    },
    /// Cancelled or detached: nobody to report to.
    Silent,
}

/// The `SessionActor` implementation.
pub struct SessionActor<G> {
    identity: SessionIdentity,
    settings: SessionSettings,
    worker: WorkerHandle,
    gateway: Arc<G>,
    receiver: mpsc::Receiver<SessionMessage>,
    controller: mpsc::WeakSender<ControllerMessage>,
    cancel_token: CancellationToken,
}

impl<G: SignalingGateway> SessionActor<G> {
    /// Spawn a session actor around an already connected worker.
    pub fn spawn(
        identity: SessionIdentity,
        settings: SessionSettings,
        worker: WorkerHandle,
        gateway: Arc<G>,
        controller: mpsc::WeakSender<ControllerMessage>,
        cancel_token: CancellationToken,
    ) -> (SessionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);

        let actor = Self {
            identity,
            settings,
            worker,
            gateway,
            receiver,
            controller,
            cancel_token: cancel_token.clone(),
        };

        let task_handle = tokio::spawn(actor.run());

        (
            SessionActorHandle {
                sender,
                cancel_token,
            },
            task_handle,
        )
    }

    /// Run the actor message loop.
    #[instrument(
        skip_all,
        name = "vc.actor.session",
        fields(guild_id = %self.identity.guild_id, channel_id = %self.identity.channel_id)
    )]
    async fn run(mut self) {
        info!(
            target: "vc.actor.session",
            guild_id = %self.identity.guild_id,
            channel_id = %self.identity.channel_id,
            worker = %self.worker.name(),
            "SessionActor started"
        );

        let exit = self.message_loop().await;

        match exit {
            Exit::Ended {
                reason,
                outcome,
                respond_to,
            } => {
                self.fail_queued(|| {
                    VcError::WorkerFailure("session ended before request ran".to_string())
                });
                let outcome = self.leave_channel(reason, outcome).await;
                self.report(reason, outcome, respond_to).await;
            }
            Exit::Faulted { error, speak } => {
                self.report(
                    EndReason::Faulted,
                    Err(VcError::WorkerFailure(error.clone())),
                    None,
                )
                .await;
                if let Some(respond_to) = speak {
                    let _ = respond_to.send(Err(VcError::WorkerFailure(error)));
                }
                self.fail_queued(|| {
                    VcError::WorkerFailure("session ended before request ran".to_string())
                });
                // Failure is logged; nobody is waiting on it.
                let _ = self.send_leave().await;
            }
            Exit::Silent => {
                self.fail_queued(|| VcError::Cancelled);
            }
        }

        let SessionActor { worker, identity, .. } = self;
        worker.terminate().await;

        info!(
            target: "vc.actor.session",
            guild_id = %identity.guild_id,
            "SessionActor stopped"
        );
    }

    async fn message_loop(&mut self) -> Exit {
        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "vc.actor.session",
                        guild_id = %self.identity.guild_id,
                        "SessionActor received cancellation signal"
                    );
                    return Exit::Silent;
                }

                msg = self.receiver.recv() => match msg {
                    Some(SessionMessage::Speak { source, priority, respond_to }) => {
                        let cancel_token = self.cancel_token.clone();
                        let result = tokio::select! {
                            () = cancel_token.cancelled() => Err(VcError::Cancelled),
                            result = self.speak(source, priority) => result,
                        };

                        match result {
                            // Answered once the controller has dropped the session.
                            Err(VcError::WorkerFailure(error)) => {
                                metrics::record_worker_failure("speak");
                                return Exit::Faulted {
                                    error,
                                    speak: Some(respond_to),
                                };
                            }
                            Err(VcError::Cancelled) => {
                                let _ = respond_to.send(Err(VcError::Cancelled));
                                return Exit::Silent;
                            }
                            result => {
                                let _ = respond_to.send(result);
                            }
                        }
                    }

                    Some(SessionMessage::Disconnect { reason, respond_to }) => {
                        let outcome = self.disconnect_worker().await;
                        if outcome.is_err() {
                            metrics::record_worker_failure("disconnect");
                        }
                        return Exit::Ended { reason, outcome, respond_to };
                    }

                    None => {
                        debug!(
                            target: "vc.actor.session",
                            guild_id = %self.identity.guild_id,
                            "SessionActor channel closed, exiting"
                        );
                        return Exit::Silent;
                    }
                },

                event = self.worker.recv() => match event {
                    Some(WorkerEvent::SentAudio) => {
                        debug!(
                            target: "vc.actor.session",
                            guild_id = %self.identity.guild_id,
                            "Discarding SentAudio outside a burst"
                        );
                    }
                    Some(event) => {
                        warn!(
                            target: "vc.actor.session",
                            guild_id = %self.identity.guild_id,
                            event = event.kind().as_str(),
                            "Unexpected worker event while idle"
                        );
                    }
                    None => {
                        error!(
                            target: "vc.actor.session",
                            guild_id = %self.identity.guild_id,
                            worker = %self.worker.name(),
                            "Worker terminated unexpectedly"
                        );
                        metrics::record_worker_failure("idle");
                        return Exit::Faulted {
                            error: "worker terminated unexpectedly".to_string(),
                            speak: None,
                        };
                    }
                },
            }
        }
    }

    /// Run one speaking burst.
    async fn speak(&mut self, source: AudioSource, priority: bool) -> Result<SpeakReport, VcError> {
        debug!(
            target: "vc.actor.session",
            guild_id = %self.identity.guild_id,
            priority = priority,
            source = ?source,
            "Starting speaking burst"
        );

        self.worker
            .send(WorkerCommand::StartSpeak { priority })
            .await?;

        let mut report = SpeakReport::default();
        let streamed = match source {
            AudioSource::Buffer(chunk) => self.send_chunk(chunk, &mut report).await,
            AudioSource::Stream(mut chunks) => loop {
                match chunks.next().await {
                    Some(Ok(chunk)) => {
                        if let Err(e) = self.send_chunk(chunk, &mut report).await {
                            break Err(e);
                        }
                    }
                    Some(Err(e)) => break Err(VcError::AudioSource(e.to_string())),
                    None => break Ok(()),
                }
            },
        };

        if let Err(VcError::WorkerFailure(msg)) = streamed {
            return Err(VcError::WorkerFailure(msg));
        }

        if report.chunks > 0 {
            self.await_sent_audio().await?;
        }
        self.worker.send(WorkerCommand::StopSpeak).await?;
        metrics::record_audio_chunks_sent(report.chunks);

        match streamed {
            Ok(()) => {
                debug!(
                    target: "vc.actor.session",
                    guild_id = %self.identity.guild_id,
                    chunks = report.chunks,
                    bytes = report.bytes,
                    "Speaking burst finished"
                );
                Ok(report)
            }
            Err(e) => {
                warn!(
                    target: "vc.actor.session",
                    guild_id = %self.identity.guild_id,
                    chunks = report.chunks,
                    error = %e,
                    "Speaking burst aborted by audio source"
                );
                Err(e)
            }
        }
    }

    async fn send_chunk(&mut self, chunk: Bytes, report: &mut SpeakReport) -> Result<(), VcError> {
        if chunk.len() > MAX_AUDIO_CHUNK {
            return Err(VcError::AudioSource(format!(
                "chunk of {} bytes exceeds the {MAX_AUDIO_CHUNK} byte limit",
                chunk.len()
            )));
        }

        let len = chunk.len() as u64;
        self.worker.send(WorkerCommand::SendAudio { chunk }).await?;
        report.chunks += 1;
        report.bytes += len;
        Ok(())
    }

    /// Wait for the burst's `SentAudio`, latched from `StartSpeak` onward.
    async fn await_sent_audio(&mut self) -> Result<(), VcError> {
        loop {
            match self.worker.recv().await {
                Some(WorkerEvent::SentAudio) => return Ok(()),
                Some(event) => warn!(
                    target: "vc.actor.session",
                    guild_id = %self.identity.guild_id,
                    event = event.kind().as_str(),
                    "Unexpected worker event during burst"
                ),
                None => {
                    return Err(VcError::WorkerFailure(
                        "worker terminated before SentAudio".to_string(),
                    ))
                }
            }
        }
    }

    /// Ask the worker to disconnect and wait for its acknowledgment.
    async fn disconnect_worker(&mut self) -> Result<(), VcError> {
        self.worker.send(WorkerCommand::Disconnect).await?;

        let timeout = self.settings.disconnect_timeout;
        let worker = &mut self.worker;
        let acknowledged = async {
            loop {
                match worker.recv().await {
                    Some(WorkerEvent::Disconnected) => return Ok(()),
                    Some(event) => debug!(
                        target: "vc.actor.session",
                        event = event.kind().as_str(),
                        "Discarding worker event during disconnect"
                    ),
                    None => {
                        return Err(VcError::WorkerFailure(
                            "worker terminated before Disconnected".to_string(),
                        ))
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, acknowledged).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    target: "vc.actor.session",
                    guild_id = %self.identity.guild_id,
                    timeout_secs = timeout.as_secs(),
                    "Worker did not acknowledge Disconnect, terminating"
                );
                Err(VcError::WorkerFailure(format!(
                    "no Disconnected within {}s",
                    timeout.as_secs()
                )))
            }
        }
    }

    /// Send the gateway leave request when the reason calls for one.
    ///
    /// A failed leave request turns a successful teardown into a signaling
    /// error; an earlier error wins.
    async fn leave_channel(
        &self,
        reason: EndReason,
        outcome: Result<(), VcError>,
    ) -> Result<(), VcError> {
        if !reason.needs_leave_request() {
            return outcome;
        }

        match self.send_leave().await {
            Ok(()) => outcome,
            Err(e) => outcome.and(Err(e)),
        }
    }

    async fn send_leave(&self) -> Result<(), VcError> {
        let request = VoiceStateRequest::leave(self.identity.guild_id, self.settings.shard_count);
        self.gateway
            .request_voice_state(request)
            .await
            .inspect_err(|e| {
                warn!(
                    target: "vc.actor.session",
                    guild_id = %self.identity.guild_id,
                    error = %e,
                    "Failed to send leave request"
                );
            })
    }

    async fn report(
        &self,
        reason: EndReason,
        outcome: Result<(), VcError>,
        respond_to: Option<oneshot::Sender<Result<(), VcError>>>,
    ) {
        let message = ControllerMessage::SessionEnded {
            guild_id: self.identity.guild_id,
            attempt: self.identity.attempt,
            reason,
            outcome,
            respond_to,
        };

        let undelivered = match self.controller.upgrade() {
            Some(controller) => controller.send(message).await.err().map(|e| e.0),
            None => Some(message),
        };

        // Controller is gone; answer the caller directly.
        if let Some(ControllerMessage::SessionEnded {
            outcome,
            respond_to: Some(respond_to),
            ..
        }) = undelivered
        {
            let _ = respond_to.send(outcome);
        }
    }

    /// Answer every request still queued in the mailbox.
    fn fail_queued(&mut self, error: impl Fn() -> VcError) {
        self.receiver.close();
        while let Ok(message) = self.receiver.try_recv() {
            match message {
                SessionMessage::Speak { respond_to, .. } => {
                    let _ = respond_to.send(Err(error()));
                }
                SessionMessage::Disconnect {
                    respond_to: Some(respond_to),
                    ..
                } => {
                    let _ = respond_to.send(Err(error()));
                }
                SessionMessage::Disconnect { respond_to: None, .. } => {}
            }
        }
    }
}
