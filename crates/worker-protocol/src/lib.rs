//! Message protocol spoken between the voice controller and a media worker.
//!
//! A worker is an isolated unit (a task or a child process) that owns the
//! media transport for exactly one voice session. The controller talks to it
//! only through the discrete messages defined here:
//!
//! ```text
//! controller ──Init──────────────▶ worker
//! controller ◀──────────Connected── worker
//! controller ──StartSpeak(prio)──▶ worker
//! controller ──SendAudio(chunk)──▶ worker   (one per chunk, in order)
//! controller ◀──────────SentAudio── worker   (once per speaking burst)
//! controller ──StopSpeak─────────▶ worker
//! controller ──Disconnect────────▶ worker
//! controller ◀───────Disconnected── worker
//! ```
//!
//! Messages are FIFO per direction. [`codec`] provides the binary framing
//! used when the worker runs out of process.

#![warn(clippy::pedantic)]

pub mod codec;
pub mod message;

pub use codec::{CodecError, CommandCodec, EventCodec, MAX_FRAME_LENGTH};
pub use message::{MessageKind, SessionInit, WorkerCommand, WorkerEvent};
