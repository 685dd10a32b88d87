//! Child-process workers: the `voice-worker` binary over framed stdio.

use super::{WorkerHandle, WorkerSpawner, WorkerSpec};
use crate::errors::VcError;

use futures_util::{SinkExt, StreamExt};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use voice_worker::WORKER_CHANNEL_CAPACITY;
use worker_protocol::{CommandCodec, EventCodec, WorkerCommand, WorkerEvent};

/// How long a detached child gets to exit on its own before it is killed.
const CHILD_EXIT_GRACE: Duration = Duration::from_secs(1);

/// Spawns one `voice-worker` child process per session.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessSpawner {
    /// Spawner running `program`.
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
        }
    }

    /// Extra arguments passed to every worker.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self, spec: WorkerSpec) -> Result<WorkerHandle, VcError> {
        let name = spec.name();

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("VOICE_WORKER_NAME", &name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                VcError::WorkerFailure(format!(
                    "failed to spawn {}: {e}",
                    self.program.display()
                ))
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(VcError::WorkerFailure(
                "worker process stdio not captured".to_string(),
            ));
        };

        info!(
            target: "vc.worker",
            worker = %name,
            pid = child.id(),
            "Worker process spawned"
        );

        let (cmd_tx, cmd_rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
        let (evt_tx, evt_rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
        let cancel_token = CancellationToken::new();

        let task = tokio::spawn(pump(
            name.clone(),
            child,
            stdin,
            stdout,
            cmd_rx,
            evt_tx,
            cancel_token.clone(),
        ));

        Ok(WorkerHandle::from_channels(
            name,
            cmd_tx,
            evt_rx,
            cancel_token,
            task,
        ))
    }
}

/// Move frames between the handle's channels and the child's pipes, then
/// reap the child.
async fn pump(
    name: String,
    mut child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    mut commands: mpsc::Receiver<WorkerCommand>,
    events: mpsc::Sender<WorkerEvent>,
    cancel_token: CancellationToken,
) {
    let mut sink = FramedWrite::new(stdin, CommandCodec);
    let mut stream = FramedRead::new(stdout, EventCodec);

    let cancelled = loop {
        tokio::select! {
            () = cancel_token.cancelled() => break true,

            command = commands.recv() => {
                let Some(command) = command else {
                    // Handle dropped; closing stdin detaches the worker.
                    break false;
                };
                if let Err(e) = sink.send(command).await {
                    warn!(
                        target: "vc.worker",
                        worker = %name,
                        error = %e,
                        "Failed to write command to worker process"
                    );
                    break false;
                }
            }

            event = stream.next() => match event {
                Some(Ok(event)) => {
                    if events.send(event).await.is_err() {
                        break false;
                    }
                }
                Some(Err(e)) => {
                    warn!(
                        target: "vc.worker",
                        worker = %name,
                        error = %e,
                        "Invalid event frame from worker process"
                    );
                    break false;
                }
                None => {
                    debug!(
                        target: "vc.worker",
                        worker = %name,
                        "Worker process closed stdout"
                    );
                    break false;
                }
            },
        }
    };

    // Dropping the event sender tells the handle the worker is gone.
    drop(events);
    drop(sink);

    if !cancelled {
        if let Ok(status) = tokio::time::timeout(CHILD_EXIT_GRACE, child.wait()).await {
            match status {
                Ok(status) => debug!(
                    target: "vc.worker",
                    worker = %name,
                    status = %status,
                    "Worker process exited"
                ),
                Err(e) => warn!(
                    target: "vc.worker",
                    worker = %name,
                    error = %e,
                    "Failed to wait for worker process"
                ),
            }
            return;
        }
    }

    if let Err(e) = child.kill().await {
        warn!(
            target: "vc.worker",
            worker = %name,
            error = %e,
            "Failed to kill worker process"
        );
    } else {
        debug!(
            target: "vc.worker",
            worker = %name,
            "Worker process killed"
        );
    }
}
