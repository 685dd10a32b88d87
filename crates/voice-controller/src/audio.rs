//! Audio sources for `speak`.
//!
//! A source is either a bounded buffer, sent to the worker as one chunk, or
//! a stream of chunks forwarded in the order they are produced. The audio is
//! opaque to the controller; encoding is the caller's business.

use bytes::Bytes;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use std::fmt;
use std::io;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

/// Audio to transmit during one speaking burst.
pub enum AudioSource {
    /// A complete buffer, sent as a single chunk.
    Buffer(Bytes),
    /// Incrementally produced chunks.
    Stream(BoxStream<'static, io::Result<Bytes>>),
}

impl AudioSource {
    /// Source for a complete buffer.
    pub fn buffer(data: impl Into<Bytes>) -> Self {
        Self::Buffer(data.into())
    }

    /// Source for a stream of chunks.
    pub fn stream<S>(chunks: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self::Stream(chunks.boxed())
    }

    /// Source reading chunks from `reader` until EOF.
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        Self::stream(ReaderStream::new(reader))
    }

    /// Source for a fixed list of chunks, streamed in order.
    pub fn from_chunks<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Bytes>,
        I::IntoIter: Send + 'static,
    {
        Self::stream(stream::iter(chunks.into_iter().map(Ok)))
    }

    /// Whether this is a bounded buffer.
    #[must_use]
    pub fn is_buffer(&self) -> bool {
        matches!(self, Self::Buffer(_))
    }
}

impl From<Bytes> for AudioSource {
    fn from(data: Bytes) -> Self {
        Self::Buffer(data)
    }
}

impl From<Vec<u8>> for AudioSource {
    fn from(data: Vec<u8>) -> Self {
        Self::Buffer(Bytes::from(data))
    }
}

impl fmt::Debug for AudioSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffer(data) => f.debug_tuple("Buffer").field(&data.len()).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    async fn collect(source: AudioSource) -> Vec<Bytes> {
        match source {
            AudioSource::Buffer(data) => vec![data],
            AudioSource::Stream(chunks) => chunks.map(|c| c.unwrap()).collect().await,
        }
    }

    #[tokio::test]
    async fn test_from_chunks_preserves_order() {
        let source = AudioSource::from_chunks(vec![
            Bytes::from_static(b"chunk1"),
            Bytes::from_static(b"chunk2"),
            Bytes::from_static(b"chunk3"),
        ]);
        assert!(!source.is_buffer());

        let chunks = collect(source).await;
        assert_eq!(
            chunks,
            vec![
                Bytes::from_static(b"chunk1"),
                Bytes::from_static(b"chunk2"),
                Bytes::from_static(b"chunk3"),
            ]
        );
    }

    #[tokio::test]
    async fn test_from_reader_reads_to_eof() {
        let data = vec![7_u8; 10_000];
        let source = AudioSource::from_reader(std::io::Cursor::new(data.clone()));

        let chunks = collect(source).await;
        assert!(chunks.len() > 1);
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(joined, data);
    }

    #[test]
    fn test_debug_shows_length_only() {
        let source = AudioSource::from(vec![1_u8, 2, 3]);
        assert!(source.is_buffer());
        assert_eq!(format!("{source:?}"), "Buffer(3)");
    }
}
