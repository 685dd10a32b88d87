//! Worker handles and spawners.
//!
//! A [`WorkerHandle`] is the controller's only view of a worker: `send` a
//! command, `recv` the next event, `terminate`. It does not care how the
//! worker is isolated. Two [`WorkerSpawner`]s produce handles:
//!
//! - [`InProcessSpawner`] runs a `WorkerRuntime` on a tokio task.
//! - [`ProcessSpawner`] launches the `voice-worker` binary and speaks the
//!   framed protocol over its stdin/stdout.

mod in_process;
mod process;

pub use in_process::InProcessSpawner;
pub use process::ProcessSpawner;

use crate::config::Config;
use crate::errors::VcError;

use common::types::{ChannelId, GuildId};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};
use voice_worker::DiscardTransport;
use worker_protocol::{WorkerCommand, WorkerEvent};

/// How long `terminate` waits for the worker's task to finish.
const WORKER_TERMINATE_TIMEOUT: Duration = Duration::from_secs(2);

/// What a worker is being spawned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSpec {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
}

impl WorkerSpec {
    /// Worker name used in logs (`<guild>/<channel>`).
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}/{}", self.guild_id, self.channel_id)
    }
}

/// Capability handle to one worker.
///
/// Dropping the handle cancels the worker; `terminate` also waits for it.
pub struct WorkerHandle {
    name: String,
    commands: mpsc::Sender<WorkerCommand>,
    events: mpsc::Receiver<WorkerEvent>,
    cancel_token: CancellationToken,
    task: JoinHandle<()>,
    _cancel_on_drop: DropGuard,
}

impl WorkerHandle {
    /// Assemble a handle from the worker's channels.
    ///
    /// `task` drives the worker (the runtime itself, or the pump feeding a
    /// child process) and must stop when `cancel_token` fires.
    #[must_use]
    pub fn from_channels(
        name: impl Into<String>,
        commands: mpsc::Sender<WorkerCommand>,
        events: mpsc::Receiver<WorkerEvent>,
        cancel_token: CancellationToken,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            name: name.into(),
            commands,
            events,
            _cancel_on_drop: cancel_token.clone().drop_guard(),
            cancel_token,
            task,
        }
    }

    /// Worker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send a command. Commands are delivered in send order.
    ///
    /// # Errors
    ///
    /// Returns `VcError::WorkerFailure` if the worker's inbox is closed.
    pub async fn send(&self, command: WorkerCommand) -> Result<(), VcError> {
        let kind = command.kind();
        self.commands.send(command).await.map_err(|_| {
            VcError::WorkerFailure(format!(
                "worker {} inbox closed while sending {}",
                self.name,
                kind.as_str()
            ))
        })
    }

    /// Receive the next event. `None` means the worker is gone.
    pub async fn recv(&mut self) -> Option<WorkerEvent> {
        self.events.recv().await
    }

    /// Whether the worker's driving task has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the worker and wait briefly for its task to finish.
    pub async fn terminate(self) {
        self.cancel_token.cancel();

        match tokio::time::timeout(WORKER_TERMINATE_TIMEOUT, self.task).await {
            Ok(Ok(())) => debug!(
                target: "vc.worker",
                worker = %self.name,
                "Worker terminated"
            ),
            Ok(Err(e)) => warn!(
                target: "vc.worker",
                worker = %self.name,
                error = %e,
                "Worker task failed during termination"
            ),
            Err(_) => warn!(
                target: "vc.worker",
                worker = %self.name,
                "Worker termination timed out"
            ),
        }
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.name)
            .field("finished", &self.task.is_finished())
            .finish_non_exhaustive()
    }
}

/// Produces a fresh worker per session.
pub trait WorkerSpawner: Send + Sync + 'static {
    /// Start a worker for `spec`. The returned handle is ready to receive
    /// `Init`.
    fn spawn(
        &self,
        spec: WorkerSpec,
    ) -> impl Future<Output = Result<WorkerHandle, VcError>> + Send;
}

/// Spawner selected by configuration: child processes when
/// `VOICE_WORKER_PROGRAM` is set, in-process discard workers otherwise.
#[derive(Debug)]
pub enum ConfiguredSpawner {
    InProcess(InProcessSpawner<fn(&WorkerSpec) -> DiscardTransport>),
    Process(ProcessSpawner),
}

impl ConfiguredSpawner {
    /// Pick the spawner for `config`.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        match &config.worker_program {
            Some(program) => Self::Process(ProcessSpawner::new(program)),
            None => Self::InProcess(InProcessSpawner::discard()),
        }
    }
}

impl WorkerSpawner for ConfiguredSpawner {
    async fn spawn(&self, spec: WorkerSpec) -> Result<WorkerHandle, VcError> {
        match self {
            Self::InProcess(spawner) => spawner.spawn(spec).await,
            Self::Process(spawner) => spawner.spawn(spec).await,
        }
    }
}
