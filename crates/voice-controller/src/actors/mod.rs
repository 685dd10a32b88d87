//! Actor model implementation for the voice controller.
//!
//! ```text
//! VoiceManagerActor (singleton per controller)
//! ├── owns the SessionRegistry
//! ├── runs one handshake task per pending connect
//! │   └── correlates voice state + voice server updates, spawns the worker
//! └── supervises N SessionActors
//!     └── SessionActor (one per active session)
//!         └── owns the WorkerHandle
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single writer**: only the controller actor touches the registry, so
//!   reserve/activate/remove never race
//! - **Serialized per guild**: speak and disconnect for one guild queue in its
//!   session actor's mailbox
//! - **CancellationToken propagation**: handshakes and sessions run on child
//!   tokens of the controller's root token
//! - **Report back, never share**: handshake tasks and session actors report
//!   their outcome to the controller as messages
//!
//! # Modules
//!
//! - [`controller`] - `VoiceManagerActor` and its public handle
//! - [`session`] - `SessionActor` per active session
//! - [`messages`] - Message types for actor communication

pub mod controller;
pub mod messages;
pub mod session;

// Re-export primary types
pub use controller::{VoiceManagerActor, VoiceManagerHandle};
pub use messages::*;
pub use session::{SessionActor, SessionActorHandle, MAX_AUDIO_CHUNK};
