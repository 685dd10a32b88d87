//! Media transport seam.
//!
//! The worker drives a [`MediaTransport`] for the real-time side of a voice
//! session (voice server websocket, UDP discovery, encryption, pacing). None of
//! that lives in this workspace; the runtime only needs the four operations
//! below. [`DiscardTransport`] accepts everything and keeps counters, which is
//! what the stock `voice-worker` binary and the tests run with.

use bytes::Bytes;
use std::future::Future;
use thiserror::Error;
use tracing::debug;
use worker_protocol::SessionInit;

/// Media transport failure. Any error is fatal for the worker.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not establish the media session.
    #[error("Transport connect failed: {0}")]
    Connect(String),

    /// Sending audio or updating the speaking state failed.
    #[error("Transport send failed: {0}")]
    Send(String),

    /// The transport was used after it closed.
    #[error("Transport closed")]
    Closed,
}

/// Media transport driven by the worker runtime.
pub trait MediaTransport: Send + Sync + 'static {
    /// Establish the media session described by `init`.
    fn connect(
        &mut self,
        init: &SessionInit,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Toggle the speaking indicator. `priority` is only meaningful when
    /// `speaking` is true.
    fn set_speaking(
        &mut self,
        speaking: bool,
        priority: bool,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Queue one audio chunk for transmission.
    fn send_audio(&mut self, chunk: Bytes)
        -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Close the media session. Must be idempotent.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;
}

/// Transport that accepts and drops all audio.
#[derive(Debug, Default)]
pub struct DiscardTransport {
    endpoint: Option<String>,
    speaking: bool,
    chunks_sent: u64,
    bytes_sent: u64,
}

impl DiscardTransport {
    /// Endpoint of the current session, if connected.
    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Whether the speaking indicator is on.
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Chunks accepted since creation.
    #[must_use]
    pub fn chunks_sent(&self) -> u64 {
        self.chunks_sent
    }

    /// Audio bytes accepted since creation.
    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }
}

impl MediaTransport for DiscardTransport {
    async fn connect(&mut self, init: &SessionInit) -> Result<(), TransportError> {
        if init.endpoint.is_empty() {
            return Err(TransportError::Connect("empty voice endpoint".to_string()));
        }
        debug!(
            target: "vc.worker.transport",
            guild_id = %init.guild_id,
            endpoint = %init.endpoint,
            "Discard transport connected"
        );
        self.endpoint = Some(init.endpoint.clone());
        Ok(())
    }

    async fn set_speaking(&mut self, speaking: bool, _priority: bool) -> Result<(), TransportError> {
        if self.endpoint.is_none() {
            return Err(TransportError::Closed);
        }
        self.speaking = speaking;
        Ok(())
    }

    async fn send_audio(&mut self, chunk: Bytes) -> Result<(), TransportError> {
        if self.endpoint.is_none() {
            return Err(TransportError::Closed);
        }
        self.chunks_sent += 1;
        self.bytes_sent += chunk.len() as u64;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.endpoint = None;
        self.speaking = false;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::secret::SecretString;
    use common::types::{GuildId, UserId};

    fn init(endpoint: &str) -> SessionInit {
        SessionInit {
            guild_id: GuildId(1),
            user_id: UserId(7),
            session_id: SecretString::from("sess1"),
            token: SecretString::from("s1"),
            endpoint: endpoint.to_string(),
        }
    }

    #[tokio::test]
    async fn test_discard_transport_counts_audio() {
        let mut transport = DiscardTransport::default();
        transport.connect(&init("host:1")).await.unwrap();
        assert_eq!(transport.endpoint(), Some("host:1"));

        transport.set_speaking(true, false).await.unwrap();
        transport
            .send_audio(Bytes::from_static(b"abc"))
            .await
            .unwrap();
        transport.send_audio(Bytes::from_static(b"de")).await.unwrap();

        assert!(transport.is_speaking());
        assert_eq!(transport.chunks_sent(), 2);
        assert_eq!(transport.bytes_sent(), 5);

        transport.disconnect().await;
        assert!(transport.endpoint().is_none());
        assert!(!transport.is_speaking());
    }

    #[tokio::test]
    async fn test_discard_transport_rejects_use_before_connect() {
        let mut transport = DiscardTransport::default();
        let result = transport.send_audio(Bytes::from_static(b"x")).await;
        assert!(matches!(result, Err(TransportError::Closed)));

        let result = transport.connect(&init("")).await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }
}
