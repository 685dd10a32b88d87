//! Secret types for protecting voice credentials from accidental logging.
//!
//! Voice handshakes carry two credentials: the gateway session id delivered
//! with the voice state update and the server token delivered with the voice
//! server update. Both end up in the worker's `Init` payload. They are held as
//! [`SecretString`] everywhere so that deriving `Debug` on an event or command
//! never prints them.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct ServerAssignment {
//!     endpoint: String,
//!     token: SecretString,
//! }
//!
//! let assignment = ServerAssignment {
//!     endpoint: "voice-eu.example:443".to_string(),
//!     token: SecretString::from("s1"),
//! };
//!
//! assert!(!format!("{assignment:?}").contains("\"s1\""));
//! assert_eq!(assignment.token.expose_secret(), "s1");
//! ```
//!
//! Secrets are only exposed at the two boundaries that need the raw value:
//! the worker protocol encoder and the media transport's connect call.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
