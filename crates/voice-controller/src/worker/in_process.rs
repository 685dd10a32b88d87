//! In-process workers: a `WorkerRuntime` on a tokio task.

use super::{WorkerHandle, WorkerSpawner, WorkerSpec};
use crate::errors::VcError;

use std::fmt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use voice_worker::{DiscardTransport, MediaTransport, WorkerRuntime, WORKER_CHANNEL_CAPACITY};

/// Spawns workers as tokio tasks, building a transport per worker.
pub struct InProcessSpawner<F> {
    make_transport: F,
}

impl<F> InProcessSpawner<F> {
    /// Spawner that calls `make_transport` for every new worker.
    pub fn new(make_transport: F) -> Self {
        Self { make_transport }
    }
}

impl InProcessSpawner<fn(&WorkerSpec) -> DiscardTransport> {
    /// Spawner whose workers discard all audio.
    #[must_use]
    pub fn discard() -> Self {
        Self::new(|_| DiscardTransport::default())
    }
}

impl<F> fmt::Debug for InProcessSpawner<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessSpawner").finish_non_exhaustive()
    }
}

impl<F, T> WorkerSpawner for InProcessSpawner<F>
where
    F: Fn(&WorkerSpec) -> T + Send + Sync + 'static,
    T: MediaTransport,
{
    async fn spawn(&self, spec: WorkerSpec) -> Result<WorkerHandle, VcError> {
        let name = spec.name();
        let (cmd_tx, cmd_rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
        let (evt_tx, evt_rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
        let cancel_token = CancellationToken::new();

        let transport = (self.make_transport)(&spec);
        let task = WorkerRuntime::new(name.clone(), transport, cmd_rx, evt_tx, cancel_token.clone())
            .spawn();

        debug!(
            target: "vc.worker",
            worker = %name,
            "In-process worker spawned"
        );

        Ok(WorkerHandle::from_channels(
            name,
            cmd_tx,
            evt_rx,
            cancel_token,
            task,
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::secret::SecretString;
    use common::types::{ChannelId, GuildId, UserId};
    use worker_protocol::{SessionInit, WorkerCommand, WorkerEvent};

    fn spec() -> WorkerSpec {
        WorkerSpec {
            guild_id: GuildId(1),
            channel_id: ChannelId(10),
        }
    }

    #[tokio::test]
    async fn test_in_process_worker_connects_and_disconnects() {
        let spawner = InProcessSpawner::discard();
        let mut worker = spawner.spawn(spec()).await.unwrap();
        assert_eq!(worker.name(), "1/10");

        worker
            .send(WorkerCommand::Init(SessionInit {
                guild_id: GuildId(1),
                user_id: UserId(7),
                session_id: SecretString::from("sess1"),
                token: SecretString::from("s1"),
                endpoint: "host:1".to_string(),
            }))
            .await
            .unwrap();
        assert_eq!(worker.recv().await, Some(WorkerEvent::Connected));

        worker.send(WorkerCommand::Disconnect).await.unwrap();
        assert_eq!(worker.recv().await, Some(WorkerEvent::Disconnected));
        assert_eq!(worker.recv().await, None);

        worker.terminate().await;
    }

    #[tokio::test]
    async fn test_terminate_stops_idle_worker() {
        let spawner = InProcessSpawner::discard();
        let worker = spawner.spawn(spec()).await.unwrap();
        assert!(!worker.is_finished());
        worker.terminate().await;
    }
}
