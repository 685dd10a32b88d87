//! Binary framing for worker protocol messages.
//!
//! Used when a worker runs as a child process and messages cross a pipe.
//!
//! Frame format:
//! - Body Length: 4 bytes (big endian, excludes itself)
//! - Kind: 1 byte ([`MessageKind`] tag)
//! - Payload: `Body Length - 1` bytes, kind specific
//!
//! Payloads:
//! - `Init`: guild id (8 bytes), user id (8 bytes), then session id, token and
//!   endpoint, each as a 2 byte length followed by UTF-8
//! - `StartSpeak`: priority (1 byte, 0 or 1)
//! - `SendAudio`: the raw chunk
//! - everything else: empty

use crate::message::{MessageKind, SessionInit, WorkerCommand, WorkerEvent};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use common::secret::{ExposeSecret, SecretString};
use common::types::{GuildId, UserId};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the body length prefix.
const LENGTH_PREFIX: usize = 4;

/// Largest accepted frame body (1 MiB).
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Error type for codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Insufficient data to decode
    #[error("Insufficient data")]
    InsufficientData,

    /// Frame body is empty or exceeds [`MAX_FRAME_LENGTH`]
    #[error("Invalid frame length: {0}")]
    InvalidLength(usize),

    /// Unknown kind tag
    #[error("Invalid message kind: {0}")]
    InvalidKind(u8),

    /// Known kind, but it travels in the other direction
    #[error("Unexpected message kind for this direction: {}", .0.as_str())]
    UnexpectedDirection(MessageKind),

    /// Invalid payload format
    #[error("Invalid payload: {0}")]
    InvalidFormat(String),

    /// I/O error from the underlying pipe
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encode a controller → worker command as a complete frame.
///
/// # Errors
///
/// Returns an error if the frame would exceed [`MAX_FRAME_LENGTH`] or a
/// string field exceeds 65535 bytes.
pub fn encode_command(command: &WorkerCommand) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::new();
    write_command(command, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a worker → controller event as a complete frame.
///
/// # Errors
///
/// Infallible for the current event set; kept fallible for symmetry.
pub fn encode_event(event: WorkerEvent) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::new();
    write_event(event, &mut buf)?;
    Ok(buf.freeze())
}

/// Decode one complete command frame.
///
/// # Errors
///
/// Returns an error if the frame is truncated, malformed, or carries an
/// event kind.
pub fn decode_command(data: &mut impl Buf) -> Result<WorkerCommand, CodecError> {
    let mut body = read_body(data)?;
    parse_command(&mut body)
}

/// Decode one complete event frame.
///
/// # Errors
///
/// Returns an error if the frame is truncated, malformed, or carries a
/// command kind.
pub fn decode_event(data: &mut impl Buf) -> Result<WorkerEvent, CodecError> {
    let mut body = read_body(data)?;
    parse_event(&mut body)
}

/// `tokio_util` codec for the command direction.
///
/// The controller encodes with it; the worker decodes with it.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandCodec;

/// `tokio_util` codec for the event direction.
///
/// The worker encodes with it; the controller decodes with it.
#[derive(Debug, Default, Clone, Copy)]
pub struct EventCodec;

impl Encoder<WorkerCommand> for CommandCodec {
    type Error = CodecError;

    fn encode(&mut self, item: WorkerCommand, dst: &mut BytesMut) -> Result<(), Self::Error> {
        write_command(&item, dst)
    }
}

impl Decoder for CommandCodec {
    type Item = WorkerCommand;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match split_frame(src)? {
            Some(mut body) => parse_command(&mut body).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<WorkerEvent> for EventCodec {
    type Error = CodecError;

    fn encode(&mut self, item: WorkerEvent, dst: &mut BytesMut) -> Result<(), Self::Error> {
        write_event(item, dst)
    }
}

impl Decoder for EventCodec {
    type Item = WorkerEvent;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match split_frame(src)? {
            Some(mut body) => parse_event(&mut body).map(Some),
            None => Ok(None),
        }
    }
}

fn write_command(command: &WorkerCommand, dst: &mut BytesMut) -> Result<(), CodecError> {
    let mut body = BytesMut::new();
    body.put_u8(command.kind() as u8);

    match command {
        WorkerCommand::Init(init) => {
            body.put_u64(init.guild_id.get());
            body.put_u64(init.user_id.get());
            put_string(&mut body, init.session_id.expose_secret())?;
            put_string(&mut body, init.token.expose_secret())?;
            put_string(&mut body, &init.endpoint)?;
        }
        WorkerCommand::StartSpeak { priority } => body.put_u8(u8::from(*priority)),
        WorkerCommand::SendAudio { chunk } => body.extend_from_slice(chunk),
        WorkerCommand::Disconnect | WorkerCommand::StopSpeak => {}
    }

    write_frame(&body, dst)
}

fn write_event(event: WorkerEvent, dst: &mut BytesMut) -> Result<(), CodecError> {
    write_frame(&[event.kind() as u8], dst)
}

fn write_frame(body: &[u8], dst: &mut BytesMut) -> Result<(), CodecError> {
    if body.is_empty() || body.len() > MAX_FRAME_LENGTH {
        return Err(CodecError::InvalidLength(body.len()));
    }
    let len = u32::try_from(body.len()).map_err(|_| CodecError::InvalidLength(body.len()))?;

    dst.reserve(LENGTH_PREFIX + body.len());
    dst.put_u32(len);
    dst.extend_from_slice(body);
    Ok(())
}

/// Read the length prefix and return the validated body length.
fn body_length(mut prefix: &[u8]) -> Result<usize, CodecError> {
    let len = prefix.get_u32() as usize;
    if len == 0 || len > MAX_FRAME_LENGTH {
        return Err(CodecError::InvalidLength(len));
    }
    Ok(len)
}

/// Take one frame body off `data`. Nothing is consumed unless the whole
/// frame is present and its length valid.
fn read_body(data: &mut impl Buf) -> Result<Bytes, CodecError> {
    if data.remaining() < LENGTH_PREFIX {
        return Err(CodecError::InsufficientData);
    }
    let len = match data.chunk().get(..LENGTH_PREFIX) {
        Some(prefix) => body_length(prefix)?,
        // Prefix split across chunks: it cannot be peeked, only read.
        None => {
            let len = body_length(&data.get_u32().to_be_bytes())?;
            if data.remaining() < len {
                return Err(CodecError::InsufficientData);
            }
            return Ok(data.copy_to_bytes(len));
        }
    };
    if data.remaining() < LENGTH_PREFIX + len {
        return Err(CodecError::InsufficientData);
    }
    data.advance(LENGTH_PREFIX);
    Ok(data.copy_to_bytes(len))
}

/// Split one complete frame body off the front of `src`, if available.
fn split_frame(src: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
    if src.len() < LENGTH_PREFIX {
        return Ok(None);
    }
    let len = body_length(src.as_ref())?;

    let frame_len = LENGTH_PREFIX + len;
    if src.len() < frame_len {
        src.reserve(frame_len - src.len());
        return Ok(None);
    }

    src.advance(LENGTH_PREFIX);
    Ok(Some(src.split_to(len).freeze()))
}

fn read_kind(body: &mut Bytes) -> Result<MessageKind, CodecError> {
    if !body.has_remaining() {
        return Err(CodecError::InsufficientData);
    }
    let tag = body.get_u8();
    MessageKind::from_u8(tag).ok_or(CodecError::InvalidKind(tag))
}

fn parse_command(body: &mut Bytes) -> Result<WorkerCommand, CodecError> {
    let kind = read_kind(body)?;
    let command = match kind {
        MessageKind::Init => {
            if body.remaining() < 16 {
                return Err(CodecError::InsufficientData);
            }
            let guild_id = GuildId(body.get_u64());
            let user_id = UserId(body.get_u64());
            let session_id = SecretString::from(get_string(body)?);
            let token = SecretString::from(get_string(body)?);
            let endpoint = get_string(body)?;
            WorkerCommand::Init(SessionInit {
                guild_id,
                user_id,
                session_id,
                token,
                endpoint,
            })
        }
        MessageKind::StartSpeak => {
            if !body.has_remaining() {
                return Err(CodecError::InsufficientData);
            }
            let priority = match body.get_u8() {
                0 => false,
                1 => true,
                other => {
                    return Err(CodecError::InvalidFormat(format!(
                        "priority flag must be 0 or 1, got {other}"
                    )))
                }
            };
            WorkerCommand::StartSpeak { priority }
        }
        MessageKind::SendAudio => WorkerCommand::SendAudio {
            chunk: body.copy_to_bytes(body.remaining()),
        },
        MessageKind::Disconnect => WorkerCommand::Disconnect,
        MessageKind::StopSpeak => WorkerCommand::StopSpeak,
        MessageKind::Connected | MessageKind::Disconnected | MessageKind::SentAudio => {
            return Err(CodecError::UnexpectedDirection(kind));
        }
    };

    expect_consumed(body, kind)?;
    Ok(command)
}

fn parse_event(body: &mut Bytes) -> Result<WorkerEvent, CodecError> {
    let kind = read_kind(body)?;
    let event = match kind {
        MessageKind::Connected => WorkerEvent::Connected,
        MessageKind::Disconnected => WorkerEvent::Disconnected,
        MessageKind::SentAudio => WorkerEvent::SentAudio,
        _ => return Err(CodecError::UnexpectedDirection(kind)),
    };

    expect_consumed(body, kind)?;
    Ok(event)
}

fn expect_consumed(body: &Bytes, kind: MessageKind) -> Result<(), CodecError> {
    if body.has_remaining() {
        return Err(CodecError::InvalidFormat(format!(
            "{} bytes of trailing data after {}",
            body.remaining(),
            kind.as_str()
        )));
    }
    Ok(())
}

fn put_string(buf: &mut BytesMut, value: &str) -> Result<(), CodecError> {
    let len = u16::try_from(value.len())
        .map_err(|_| CodecError::InvalidFormat(format!("string too long: {}", value.len())))?;
    buf.put_u16(len);
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

fn get_string(body: &mut Bytes) -> Result<String, CodecError> {
    if body.remaining() < 2 {
        return Err(CodecError::InsufficientData);
    }
    let len = usize::from(body.get_u16());
    if body.remaining() < len {
        return Err(CodecError::InsufficientData);
    }
    let raw = body.copy_to_bytes(len);
    String::from_utf8(raw.to_vec())
        .map_err(|e| CodecError::InvalidFormat(format!("invalid UTF-8: {e}")))
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::cast_possible_truncation
)]
mod tests {
    use super::*;

    fn sample_init() -> SessionInit {
        SessionInit {
            guild_id: GuildId(1),
            user_id: UserId(7),
            session_id: SecretString::from("sess1"),
            token: SecretString::from("s1"),
            endpoint: "host:1".to_string(),
        }
    }

    #[test]
    fn test_init_frame_layout() {
        let frame = encode_command(&WorkerCommand::Init(sample_init())).unwrap();

        // 1 kind + 16 ids + (2 + 5) + (2 + 2) + (2 + 6) strings
        let body_len = 1 + 16 + 7 + 4 + 8;
        assert_eq!(frame.len(), LENGTH_PREFIX + body_len);
        assert_eq!(frame.get(..4), Some(&(body_len as u32).to_be_bytes()[..]));
        assert_eq!(frame.get(4), Some(&(MessageKind::Init as u8)));

        let decoded = decode_command(&mut frame.clone()).unwrap();
        let WorkerCommand::Init(init) = decoded else {
            panic!("expected Init, got {decoded:?}");
        };
        assert_eq!(init.guild_id, GuildId(1));
        assert_eq!(init.user_id, UserId(7));
        assert_eq!(init.session_id.expose_secret(), "sess1");
        assert_eq!(init.token.expose_secret(), "s1");
        assert_eq!(init.endpoint, "host:1");
    }

    #[test]
    fn test_send_audio_carries_chunk_verbatim() {
        let chunk = Bytes::from_static(&[0xF8, 0xFF, 0xFE]);
        let frame = encode_command(&WorkerCommand::SendAudio {
            chunk: chunk.clone(),
        })
        .unwrap();

        match decode_command(&mut frame.clone()).unwrap() {
            WorkerCommand::SendAudio { chunk: decoded } => assert_eq!(decoded, chunk),
            other => panic!("expected SendAudio, got {other:?}"),
        }
    }

    #[test]
    fn test_start_speak_priority_flag() {
        let frame = encode_command(&WorkerCommand::StartSpeak { priority: true }).unwrap();
        assert!(matches!(
            decode_command(&mut frame.clone()).unwrap(),
            WorkerCommand::StartSpeak { priority: true }
        ));

        let bad = Bytes::from_static(&[0, 0, 0, 2, 0x05, 0x07]);
        assert!(matches!(
            decode_command(&mut bad.clone()),
            Err(CodecError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_direction_is_enforced() {
        let event_frame = encode_event(WorkerEvent::SentAudio).unwrap();
        assert!(matches!(
            decode_command(&mut event_frame.clone()),
            Err(CodecError::UnexpectedDirection(MessageKind::SentAudio))
        ));

        let command_frame = encode_command(&WorkerCommand::StopSpeak).unwrap();
        assert!(matches!(
            decode_event(&mut command_frame.clone()),
            Err(CodecError::UnexpectedDirection(MessageKind::StopSpeak))
        ));
    }

    #[test]
    fn test_malformed_frames() {
        // Truncated header
        assert!(matches!(
            decode_event(&mut Bytes::from_static(&[0, 0])),
            Err(CodecError::InsufficientData)
        ));
        // Zero-length body
        assert!(matches!(
            decode_event(&mut Bytes::from_static(&[0, 0, 0, 0])),
            Err(CodecError::InvalidLength(0))
        ));
        // Unknown kind
        assert!(matches!(
            decode_event(&mut Bytes::from_static(&[0, 0, 0, 1, 0x42])),
            Err(CodecError::InvalidKind(0x42))
        ));
        // Trailing bytes after an empty-payload kind
        assert!(matches!(
            decode_event(&mut Bytes::from_static(&[0, 0, 0, 2, 0x02, 0x00])),
            Err(CodecError::InvalidFormat(_))
        ));
        // Init cut off inside the endpoint string
        let frame = encode_command(&WorkerCommand::Init(sample_init())).unwrap();
        let len = frame.len() - 3;
        let mut truncated = BytesMut::from(frame.get(..len).unwrap());
        truncated
            .get_mut(..4)
            .unwrap()
            .copy_from_slice(&((len - 4) as u32).to_be_bytes());
        assert!(matches!(
            decode_command(&mut truncated.freeze()),
            Err(CodecError::InsufficientData)
        ));
    }

    #[test]
    fn test_failed_decode_leaves_buffer_untouched() {
        let frame = encode_command(&WorkerCommand::SendAudio {
            chunk: Bytes::from_static(b"opus"),
        })
        .unwrap();

        // Body still incomplete: nothing is consumed, retry succeeds later.
        let mut partial = frame.slice(..frame.len() - 1);
        assert!(matches!(
            decode_command(&mut partial),
            Err(CodecError::InsufficientData)
        ));
        assert_eq!(partial.len(), frame.len() - 1);

        // Invalid length is rejected before anything is read.
        let mut zero = Bytes::from_static(&[0, 0, 0, 0, 0x02]);
        assert!(matches!(
            decode_event(&mut zero),
            Err(CodecError::InvalidLength(0))
        ));
        assert_eq!(zero.len(), 5);

        let mut whole = frame;
        assert!(matches!(
            decode_command(&mut whole).unwrap(),
            WorkerCommand::SendAudio { chunk } if chunk.as_ref() == b"opus"
        ));
        assert!(whole.is_empty());
    }

    #[test]
    fn test_oversized_audio_rejected_on_encode() {
        let chunk = Bytes::from(vec![0u8; MAX_FRAME_LENGTH]);
        let result = encode_command(&WorkerCommand::SendAudio { chunk });
        assert!(matches!(result, Err(CodecError::InvalidLength(_))));
    }

    #[test]
    fn test_stream_decoder_handles_partial_and_batched_frames() {
        let mut wire = BytesMut::new();
        let mut codec = CommandCodec;
        codec
            .encode(WorkerCommand::StartSpeak { priority: false }, &mut wire)
            .unwrap();
        codec
            .encode(
                WorkerCommand::SendAudio {
                    chunk: Bytes::from_static(b"chunk1"),
                },
                &mut wire,
            )
            .unwrap();
        codec.encode(WorkerCommand::StopSpeak, &mut wire).unwrap();

        // Feed the bytes in two uneven pieces.
        let mut rx = BytesMut::new();
        let second = wire.split_off(7);
        rx.extend_from_slice(&wire);

        let first = codec.decode(&mut rx).unwrap();
        assert!(matches!(
            first,
            Some(WorkerCommand::StartSpeak { priority: false })
        ));
        assert!(codec.decode(&mut rx).unwrap().is_none());

        rx.extend_from_slice(&second);
        match codec.decode(&mut rx).unwrap() {
            Some(WorkerCommand::SendAudio { chunk }) => assert_eq!(&chunk[..], b"chunk1"),
            other => panic!("expected SendAudio, got {other:?}"),
        }
        assert!(matches!(
            codec.decode(&mut rx).unwrap(),
            Some(WorkerCommand::StopSpeak)
        ));
        assert!(codec.decode(&mut rx).unwrap().is_none());
    }

    #[test]
    fn test_stream_decoder_rejects_oversized_length() {
        let mut rx = BytesMut::new();
        rx.put_u32(u32::try_from(MAX_FRAME_LENGTH + 1).unwrap());
        let result = EventCodec.decode(&mut rx);
        assert!(matches!(result, Err(CodecError::InvalidLength(_))));
    }
}
