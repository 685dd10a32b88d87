//! Scripted workers for controller testing.
//!
//! [`ScriptedWorkerSpawner`] hands the controller ordinary `WorkerHandle`s,
//! but the other end of each handle is a [`WorkerProbe`] owned by the test:
//! the test reads the commands the controller sent and emits events at the
//! moment it chooses. Dropping a probe (or calling [`WorkerProbe::crash`])
//! looks to the controller like a worker that died.
//!
//! # Example
//!
//! ```rust,ignore
//! let (spawner, mut workers) = ScriptedWorkerSpawner::new();
//! // ... controller.connect(...) in a task ...
//! let mut worker = workers.next().await;
//! worker.expect_init().await;
//! worker.emit(WorkerEvent::Connected);
//! ```

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use voice_controller::worker::{WorkerHandle, WorkerSpawner, WorkerSpec};
use voice_controller::VcError;
use worker_protocol::{SessionInit, WorkerCommand, WorkerEvent};

/// How long probe expectations wait before failing the test.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of each scripted worker channel.
const PROBE_CHANNEL_CAPACITY: usize = 64;

/// Spawner whose workers are driven by the test.
#[derive(Debug)]
pub struct ScriptedWorkerSpawner {
    probes: mpsc::UnboundedSender<WorkerProbe>,
    fail_spawn: Arc<AtomicBool>,
    spawned: Arc<AtomicUsize>,
}

impl ScriptedWorkerSpawner {
    /// Create a spawner and the receiver of its probes.
    #[must_use]
    pub fn new() -> (Self, WorkerProbes) {
        let (tx, rx) = mpsc::unbounded_channel();
        let fail_spawn = Arc::new(AtomicBool::new(false));
        let spawned = Arc::new(AtomicUsize::new(0));

        (
            Self {
                probes: tx,
                fail_spawn: Arc::clone(&fail_spawn),
                spawned: Arc::clone(&spawned),
            },
            WorkerProbes {
                probes: rx,
                fail_spawn,
                spawned,
            },
        )
    }

    /// Create a spawner whose every spawn fails.
    #[must_use]
    pub fn failing() -> (Self, WorkerProbes) {
        let (spawner, probes) = Self::new();
        probes.fail_spawns(true);
        (spawner, probes)
    }
}

impl WorkerSpawner for ScriptedWorkerSpawner {
    async fn spawn(&self, spec: WorkerSpec) -> Result<WorkerHandle, VcError> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(VcError::WorkerFailure("scripted spawn failure".to_string()));
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(PROBE_CHANNEL_CAPACITY);
        let (evt_tx, evt_rx) = mpsc::channel(PROBE_CHANNEL_CAPACITY);
        let cancel_token = CancellationToken::new();

        // The "worker task" only lives until the controller terminates it.
        let task_token = cancel_token.clone();
        let task = tokio::spawn(async move { task_token.cancelled().await });

        self.spawned.fetch_add(1, Ordering::SeqCst);
        let _ = self.probes.send(WorkerProbe {
            spec,
            commands: cmd_rx,
            events: Some(evt_tx),
            cancel_token: cancel_token.clone(),
        });

        Ok(WorkerHandle::from_channels(
            spec.name(),
            cmd_tx,
            evt_rx,
            cancel_token,
            task,
        ))
    }
}

/// Receiver side of a [`ScriptedWorkerSpawner`].
#[derive(Debug)]
pub struct WorkerProbes {
    probes: mpsc::UnboundedReceiver<WorkerProbe>,
    fail_spawn: Arc<AtomicBool>,
    spawned: Arc<AtomicUsize>,
}

impl WorkerProbes {
    /// Next spawned worker. Panics if none is spawned within [`PROBE_TIMEOUT`].
    pub async fn next(&mut self) -> WorkerProbe {
        tokio::time::timeout(PROBE_TIMEOUT, self.probes.recv())
            .await
            .expect("timed out waiting for a worker to be spawned")
            .expect("spawner dropped")
    }

    /// Next spawned worker, if one is already waiting.
    pub fn try_next(&mut self) -> Option<WorkerProbe> {
        self.probes.try_recv().ok()
    }

    /// Make subsequent spawns fail (or succeed again).
    pub fn fail_spawns(&self, fail: bool) {
        self.fail_spawn.store(fail, Ordering::SeqCst);
    }

    /// Number of workers spawned so far.
    #[must_use]
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

/// Test-side end of one scripted worker.
#[derive(Debug)]
pub struct WorkerProbe {
    spec: WorkerSpec,
    commands: mpsc::Receiver<WorkerCommand>,
    events: Option<mpsc::Sender<WorkerEvent>>,
    cancel_token: CancellationToken,
}

impl WorkerProbe {
    /// What the worker was spawned for.
    #[must_use]
    pub fn spec(&self) -> WorkerSpec {
        self.spec
    }

    /// Next command from the controller. Panics after [`PROBE_TIMEOUT`] or if
    /// the controller dropped the handle.
    pub async fn expect_command(&mut self) -> WorkerCommand {
        tokio::time::timeout(PROBE_TIMEOUT, self.commands.recv())
            .await
            .expect("timed out waiting for a worker command")
            .expect("worker handle dropped")
    }

    /// Next command, if one is already queued.
    pub fn try_command(&mut self) -> Option<WorkerCommand> {
        self.commands.try_recv().ok()
    }

    /// Expect `Init` and return its payload.
    pub async fn expect_init(&mut self) -> SessionInit {
        match self.expect_command().await {
            WorkerCommand::Init(init) => init,
            other => panic!("expected Init, got {:?}", other.kind()),
        }
    }

    /// Expect `StartSpeak` and return its priority flag.
    pub async fn expect_start_speak(&mut self) -> bool {
        match self.expect_command().await {
            WorkerCommand::StartSpeak { priority } => priority,
            other => panic!("expected StartSpeak, got {:?}", other.kind()),
        }
    }

    /// Expect `SendAudio` and return its chunk.
    pub async fn expect_send_audio(&mut self) -> Bytes {
        match self.expect_command().await {
            WorkerCommand::SendAudio { chunk } => chunk,
            other => panic!("expected SendAudio, got {:?}", other.kind()),
        }
    }

    /// Expect `StopSpeak`.
    pub async fn expect_stop_speak(&mut self) {
        match self.expect_command().await {
            WorkerCommand::StopSpeak => {}
            other => panic!("expected StopSpeak, got {:?}", other.kind()),
        }
    }

    /// Expect `Disconnect`.
    pub async fn expect_disconnect(&mut self) {
        match self.expect_command().await {
            WorkerCommand::Disconnect => {}
            other => panic!("expected Disconnect, got {:?}", other.kind()),
        }
    }

    /// Acknowledge `Init` with `Connected`.
    pub async fn accept_init(&mut self) -> SessionInit {
        let init = self.expect_init().await;
        self.emit(WorkerEvent::Connected);
        init
    }

    /// Acknowledge `Disconnect` with `Disconnected`.
    pub async fn accept_disconnect(&mut self) {
        self.expect_disconnect().await;
        self.emit(WorkerEvent::Disconnected);
    }

    /// Send an event to the controller.
    pub fn emit(&self, event: WorkerEvent) {
        if let Some(events) = &self.events {
            events
                .try_send(event)
                .expect("worker event channel full or closed");
        }
    }

    /// Close the event channel, as if the worker died.
    pub fn crash(&mut self) {
        self.events = None;
    }

    /// Whether the controller terminated this worker.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Wait until the controller terminates this worker.
    pub async fn expect_terminated(&self) {
        tokio::time::timeout(PROBE_TIMEOUT, self.cancel_token.cancelled())
            .await
            .expect("timed out waiting for worker termination");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::{ChannelId, GuildId};

    fn spec() -> WorkerSpec {
        WorkerSpec {
            guild_id: GuildId(1),
            channel_id: ChannelId(10),
        }
    }

    #[tokio::test]
    async fn test_probe_sees_commands_and_emits_events() {
        let (spawner, mut probes) = ScriptedWorkerSpawner::new();
        let mut handle = spawner.spawn(spec()).await.unwrap();
        let mut probe = probes.next().await;
        assert_eq!(probe.spec(), spec());
        assert_eq!(probes.spawned(), 1);

        handle.send(WorkerCommand::StopSpeak).await.unwrap();
        probe.expect_stop_speak().await;

        probe.emit(WorkerEvent::SentAudio);
        assert_eq!(handle.recv().await, Some(WorkerEvent::SentAudio));

        probe.crash();
        assert_eq!(handle.recv().await, None);

        handle.terminate().await;
        assert!(probe.is_terminated());
    }

    #[tokio::test]
    async fn test_failing_spawner() {
        let (spawner, probes) = ScriptedWorkerSpawner::failing();
        assert!(matches!(
            spawner.spawn(spec()).await,
            Err(VcError::WorkerFailure(_))
        ));
        assert_eq!(probes.spawned(), 0);

        probes.fail_spawns(false);
        assert!(spawner.spawn(spec()).await.is_ok());
    }
}
