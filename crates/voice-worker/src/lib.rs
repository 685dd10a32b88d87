//! Voice Worker Library
//!
//! Worker side of the voice session protocol. A worker owns exactly one voice
//! session: it receives the correlated [`SessionInit`](worker_protocol::SessionInit),
//! brings up the media transport, streams audio chunks while speaking, and
//! acknowledges teardown.
//!
//! # Deployment
//!
//! The same [`WorkerRuntime`] runs in two shapes:
//!
//! - **In-process**: the controller spawns it on a tokio task and talks over
//!   `mpsc` channels.
//! - **Child process**: the `voice-worker` binary runs it behind [`serve`],
//!   with length-prefixed frames on stdin (commands) and stdout (events).
//!   Logs go to stderr.
//!
//! # Modules
//!
//! - [`runtime`] - Protocol state machine
//! - [`stdio`] - Framed byte-stream bridge for the child-process shape
//! - [`transport`] - Media transport seam

#![warn(clippy::pedantic)]

pub mod runtime;
pub mod stdio;
pub mod transport;

pub use runtime::{WorkerError, WorkerExit, WorkerRuntime};
pub use stdio::serve;
pub use transport::{DiscardTransport, MediaTransport, TransportError};

/// Capacity of the command and event channels feeding a runtime.
pub const WORKER_CHANNEL_CAPACITY: usize = 64;
