//! Framed byte-stream bridge.
//!
//! Runs a [`WorkerRuntime`] behind a pair of byte streams: commands are read
//! from `reader` with [`CommandCodec`], events are written to `writer` with
//! [`EventCodec`]. The `voice-worker` binary passes stdin and stdout.

use crate::runtime::{WorkerError, WorkerExit, WorkerRuntime};
use crate::transport::MediaTransport;
use crate::WORKER_CHANNEL_CAPACITY;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use worker_protocol::{CommandCodec, EventCodec};

/// Serve one voice session over a framed byte stream.
///
/// Returns when the runtime exits. A decode error on `reader` is treated
/// like the controller detaching: the runtime sees its inbox close.
///
/// # Errors
///
/// Propagates the runtime's [`WorkerError`].
pub async fn serve<R, W, T>(
    name: &str,
    reader: R,
    writer: W,
    transport: T,
    cancel_token: CancellationToken,
) -> Result<WorkerExit, WorkerError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    T: MediaTransport,
{
    let (cmd_tx, cmd_rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
    let (evt_tx, mut evt_rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);

    let reader_task = tokio::spawn(async move {
        let mut frames = FramedRead::new(reader, CommandCodec);
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(command) => {
                    if cmd_tx.send(command).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!(target: "vc.worker", error = %e, "Failed to decode command frame");
                    break;
                }
            }
        }
        debug!(target: "vc.worker", "Command stream closed");
    });

    let writer_task = tokio::spawn(async move {
        let mut sink = FramedWrite::new(writer, EventCodec);
        while let Some(event) = evt_rx.recv().await {
            if let Err(e) = sink.send(event).await {
                error!(target: "vc.worker", error = %e, "Failed to write event frame");
                break;
            }
        }
    });

    let result = WorkerRuntime::new(name, transport, cmd_rx, evt_tx, cancel_token)
        .run()
        .await;

    // The runtime dropped its event sender, so the writer drains and exits.
    if let Err(e) = writer_task.await {
        error!(target: "vc.worker", error = %e, "Event writer task panicked");
    }
    reader_task.abort();

    result
}
