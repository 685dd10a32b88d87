//! `WorkerRuntime` - worker-side protocol state machine.
//!
//! One runtime runs per voice session, inside its own task (in-process
//! workers) or its own process (`voice-worker` binary). It consumes
//! [`WorkerCommand`]s in order and answers with [`WorkerEvent`]s:
//!
//! - `Init` → `transport.connect()` → `Connected`
//! - `StartSpeak` opens a burst, `StopSpeak` closes it
//! - `SendAudio` → `transport.send_audio()`; the first time the inbox is
//!   drained after a chunk, the burst is acknowledged with its single
//!   `SentAudio`. That marks every chunk sent up to that point as accepted;
//!   chunks that arrive later in the same burst are not acknowledged again,
//!   so with a slow source `SentAudio` can precede the last chunk
//! - `Disconnect` → `transport.disconnect()` → `Disconnected`, then exit
//!
//! A transport failure ends the runtime without an acknowledgment. The
//! controller sees the event channel close and treats the session as faulted.

use crate::transport::{MediaTransport, TransportError};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use worker_protocol::{SessionInit, WorkerCommand, WorkerEvent};

/// How a worker runtime ended normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Acknowledged a `Disconnect`.
    Disconnected,
    /// The command channel closed without a `Disconnect`.
    Detached,
    /// The cancellation token fired.
    Cancelled,
}

/// Abnormal worker termination.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The media transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The event channel to the controller closed.
    #[error("Controller went away")]
    ControllerGone,
}

/// Whether the runtime keeps going after a command.
enum Flow {
    Continue,
    Exit,
}

/// An open speaking burst.
struct Burst {
    priority: bool,
    chunks: u64,
    acknowledged: bool,
}

/// Worker-side protocol state machine.
pub struct WorkerRuntime<T> {
    /// Worker name (`<guild>/<channel>`), for logs.
    name: String,
    /// Media transport for this session.
    transport: T,
    /// Commands from the controller.
    commands: mpsc::Receiver<WorkerCommand>,
    /// Events to the controller.
    events: mpsc::Sender<WorkerEvent>,
    /// Cancellation (terminate).
    cancel_token: CancellationToken,
    /// Set once `Init` succeeded.
    connected: bool,
    /// Current speaking burst.
    burst: Option<Burst>,
}

impl<T: MediaTransport> WorkerRuntime<T> {
    /// Create a runtime (not started).
    pub fn new(
        name: impl Into<String>,
        transport: T,
        commands: mpsc::Receiver<WorkerCommand>,
        events: mpsc::Sender<WorkerEvent>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            transport,
            commands,
            events,
            cancel_token,
            connected: false,
            burst: None,
        }
    }

    /// Run the runtime on its own task, logging how it ended.
    pub fn spawn(self) -> JoinHandle<()> {
        let name = self.name.clone();
        tokio::spawn(async move {
            match self.run().await {
                Ok(exit) => debug!(
                    target: "vc.worker",
                    worker = %name,
                    exit = ?exit,
                    "Worker task finished"
                ),
                Err(e) => warn!(
                    target: "vc.worker",
                    worker = %name,
                    error = %e,
                    "Worker task failed"
                ),
            }
        })
    }

    /// Run the command loop until disconnect, detach, cancellation or failure.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails or the controller disappears
    /// while an acknowledgment is owed.
    #[instrument(skip_all, name = "vc.worker", fields(worker = %self.name))]
    pub async fn run(mut self) -> Result<WorkerExit, WorkerError> {
        debug!(target: "vc.worker", worker = %self.name, "Worker started");

        let result = self.command_loop().await;
        self.transport.disconnect().await;

        match &result {
            Ok(exit) => info!(
                target: "vc.worker",
                worker = %self.name,
                exit = ?exit,
                "Worker stopped"
            ),
            Err(e) => error!(
                target: "vc.worker",
                worker = %self.name,
                error = %e,
                "Worker stopped on error"
            ),
        }

        result
    }

    async fn command_loop(&mut self) -> Result<WorkerExit, WorkerError> {
        loop {
            let command = tokio::select! {
                () = self.cancel_token.cancelled() => return Ok(WorkerExit::Cancelled),
                command = self.commands.recv() => command,
            };

            let Some(command) = command else {
                return Ok(WorkerExit::Detached);
            };

            if let Flow::Exit = self.handle_command(command).await? {
                return Ok(WorkerExit::Disconnected);
            }
        }
    }

    async fn handle_command(&mut self, command: WorkerCommand) -> Result<Flow, WorkerError> {
        match command {
            WorkerCommand::Init(init) => {
                self.handle_init(init).await?;
                Ok(Flow::Continue)
            }

            WorkerCommand::Disconnect => {
                self.transport.disconnect().await;
                self.emit(WorkerEvent::Disconnected).await?;
                Ok(Flow::Exit)
            }

            command if !self.connected => {
                warn!(
                    target: "vc.worker",
                    worker = %self.name,
                    kind = command.kind().as_str(),
                    "Command before Init ignored"
                );
                Ok(Flow::Continue)
            }

            WorkerCommand::StartSpeak { priority } => {
                if self.burst.is_some() {
                    warn!(
                        target: "vc.worker",
                        worker = %self.name,
                        "StartSpeak during an open burst, restarting burst"
                    );
                }
                self.transport.set_speaking(true, priority).await?;
                self.burst = Some(Burst {
                    priority,
                    chunks: 0,
                    acknowledged: false,
                });
                Ok(Flow::Continue)
            }

            WorkerCommand::SendAudio { chunk } => {
                self.transport.send_audio(chunk).await?;
                self.acknowledge_if_drained().await?;
                Ok(Flow::Continue)
            }

            WorkerCommand::StopSpeak => {
                match self.burst.take() {
                    Some(burst) => {
                        debug!(
                            target: "vc.worker",
                            worker = %self.name,
                            priority = burst.priority,
                            chunks = burst.chunks,
                            "Burst finished"
                        );
                        self.transport.set_speaking(false, false).await?;
                    }
                    None => debug!(
                        target: "vc.worker",
                        worker = %self.name,
                        "StopSpeak without an open burst"
                    ),
                }
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_init(&mut self, init: SessionInit) -> Result<(), WorkerError> {
        if self.connected {
            warn!(
                target: "vc.worker",
                worker = %self.name,
                "Duplicate Init ignored"
            );
            return Ok(());
        }

        self.transport.connect(&init).await?;
        self.connected = true;

        info!(
            target: "vc.worker",
            worker = %self.name,
            guild_id = %init.guild_id,
            endpoint = %init.endpoint,
            "Media session established"
        );

        self.emit(WorkerEvent::Connected).await
    }

    /// Emit the burst's single `SentAudio` the first time no further command
    /// is queued after a chunk.
    async fn acknowledge_if_drained(&mut self) -> Result<(), WorkerError> {
        let drained = self.commands.is_empty();
        let Some(burst) = self.burst.as_mut() else {
            debug!(
                target: "vc.worker",
                worker = %self.name,
                "Audio outside a burst"
            );
            return Ok(());
        };

        burst.chunks += 1;
        if burst.acknowledged || !drained {
            return Ok(());
        }
        burst.acknowledged = true;
        self.emit(WorkerEvent::SentAudio).await
    }

    async fn emit(&self, event: WorkerEvent) -> Result<(), WorkerError> {
        self.events
            .send(event)
            .await
            .map_err(|_| WorkerError::ControllerGone)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::transport::DiscardTransport;
    use bytes::Bytes;
    use common::secret::SecretString;
    use common::types::{GuildId, UserId};
    use std::time::Duration;

    struct Harness {
        commands: mpsc::Sender<WorkerCommand>,
        events: mpsc::Receiver<WorkerEvent>,
        cancel_token: CancellationToken,
        task: JoinHandle<Result<WorkerExit, WorkerError>>,
    }

    fn start(transport: DiscardTransport) -> Harness {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (evt_tx, evt_rx) = mpsc::channel(32);
        let cancel_token = CancellationToken::new();
        let runtime = WorkerRuntime::new("1/10", transport, cmd_rx, evt_tx, cancel_token.clone());
        Harness {
            commands: cmd_tx,
            events: evt_rx,
            cancel_token,
            task: tokio::spawn(runtime.run()),
        }
    }

    fn init(endpoint: &str) -> WorkerCommand {
        WorkerCommand::Init(SessionInit {
            guild_id: GuildId(1),
            user_id: UserId(7),
            session_id: SecretString::from("sess1"),
            token: SecretString::from("s1"),
            endpoint: endpoint.to_string(),
        })
    }

    async fn next_event(events: &mut mpsc::Receiver<WorkerEvent>) -> Option<WorkerEvent> {
        tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("timed out waiting for worker event")
    }

    #[tokio::test]
    async fn test_init_then_disconnect() {
        let mut h = start(DiscardTransport::default());

        h.commands.send(init("host:1")).await.unwrap();
        assert_eq!(next_event(&mut h.events).await, Some(WorkerEvent::Connected));

        h.commands.send(WorkerCommand::Disconnect).await.unwrap();
        assert_eq!(
            next_event(&mut h.events).await,
            Some(WorkerEvent::Disconnected)
        );

        // The worker terminates itself after acknowledging.
        assert_eq!(next_event(&mut h.events).await, None);
        assert_eq!(h.task.await.unwrap().unwrap(), WorkerExit::Disconnected);
    }

    #[tokio::test]
    async fn test_burst_is_acknowledged_once() {
        let mut h = start(DiscardTransport::default());
        h.commands.send(init("host:1")).await.unwrap();
        assert_eq!(next_event(&mut h.events).await, Some(WorkerEvent::Connected));

        // Queue the whole burst before the worker gets to it.
        h.commands
            .send(WorkerCommand::StartSpeak { priority: false })
            .await
            .unwrap();
        for chunk in [&b"chunk1"[..], &b"chunk2"[..], &b"chunk3"[..]] {
            h.commands
                .send(WorkerCommand::SendAudio {
                    chunk: Bytes::copy_from_slice(chunk),
                })
                .await
                .unwrap();
        }

        assert_eq!(next_event(&mut h.events).await, Some(WorkerEvent::SentAudio));

        h.commands.send(WorkerCommand::StopSpeak).await.unwrap();
        h.commands.send(WorkerCommand::Disconnect).await.unwrap();

        // No second SentAudio for the same burst.
        assert_eq!(
            next_event(&mut h.events).await,
            Some(WorkerEvent::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_ack_marks_first_drained_point_of_burst() {
        let mut h = start(DiscardTransport::default());
        h.commands.send(init("host:1")).await.unwrap();
        assert_eq!(next_event(&mut h.events).await, Some(WorkerEvent::Connected));

        // A slow source: the worker catches up after the first chunk.
        h.commands
            .send(WorkerCommand::StartSpeak { priority: false })
            .await
            .unwrap();
        h.commands
            .send(WorkerCommand::SendAudio {
                chunk: Bytes::from_static(b"first"),
            })
            .await
            .unwrap();
        assert_eq!(next_event(&mut h.events).await, Some(WorkerEvent::SentAudio));

        h.commands
            .send(WorkerCommand::SendAudio {
                chunk: Bytes::from_static(b"late"),
            })
            .await
            .unwrap();
        h.commands.send(WorkerCommand::StopSpeak).await.unwrap();
        h.commands.send(WorkerCommand::Disconnect).await.unwrap();

        // The late chunk is not acknowledged a second time.
        assert_eq!(
            next_event(&mut h.events).await,
            Some(WorkerEvent::Disconnected)
        );
    }

    #[test]
    fn test_run_future_is_send() {
        fn assert_send<F: Send>(_: &F) {}

        let (_cmd_tx, cmd_rx) = mpsc::channel(1);
        let (evt_tx, _evt_rx) = mpsc::channel(1);
        let runtime = WorkerRuntime::new(
            "1/10",
            DiscardTransport::default(),
            cmd_rx,
            evt_tx,
            CancellationToken::new(),
        );

        // Spawned onto the multi-threaded runtime by in-process spawners.
        let run = runtime.run();
        assert_send(&run);
    }

    #[tokio::test]
    async fn test_each_burst_gets_its_own_ack() {
        let mut h = start(DiscardTransport::default());
        h.commands.send(init("host:1")).await.unwrap();
        assert_eq!(next_event(&mut h.events).await, Some(WorkerEvent::Connected));

        for _ in 0..2 {
            h.commands
                .send(WorkerCommand::StartSpeak { priority: true })
                .await
                .unwrap();
            h.commands
                .send(WorkerCommand::SendAudio {
                    chunk: Bytes::from_static(b"pcm"),
                })
                .await
                .unwrap();
            assert_eq!(next_event(&mut h.events).await, Some(WorkerEvent::SentAudio));
            h.commands.send(WorkerCommand::StopSpeak).await.unwrap();
        }

        h.cancel_token.cancel();
        assert_eq!(h.task.await.unwrap().unwrap(), WorkerExit::Cancelled);
    }

    #[tokio::test]
    async fn test_commands_before_init_are_ignored() {
        let mut h = start(DiscardTransport::default());

        h.commands
            .send(WorkerCommand::StartSpeak { priority: false })
            .await
            .unwrap();
        h.commands
            .send(WorkerCommand::SendAudio {
                chunk: Bytes::from_static(b"early"),
            })
            .await
            .unwrap();
        h.commands.send(init("host:1")).await.unwrap();

        assert_eq!(next_event(&mut h.events).await, Some(WorkerEvent::Connected));
    }

    #[tokio::test]
    async fn test_failed_connect_exits_without_ack() {
        let mut h = start(DiscardTransport::default());

        h.commands.send(init("")).await.unwrap();

        assert_eq!(next_event(&mut h.events).await, None);
        let result = h.task.await.unwrap();
        assert!(matches!(
            result,
            Err(WorkerError::Transport(TransportError::Connect(_)))
        ));
    }

    #[tokio::test]
    async fn test_dropped_controller_detaches_worker() {
        let h = start(DiscardTransport::default());
        drop(h.commands);
        assert_eq!(h.task.await.unwrap().unwrap(), WorkerExit::Detached);
    }
}
