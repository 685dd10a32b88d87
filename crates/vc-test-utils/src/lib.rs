//! # VC Test Utilities
//!
//! Shared test utilities for the voice controller.
//!
//! This crate provides mock implementations and test fixtures for
//! exercising the controller without a real gateway or media workers.
//!
//! ## Modules
//!
//! - `mock_gateway` - Scriptable signaling gateway that records requests
//! - `mock_worker` - Worker spawner whose workers are driven by the test
//! - `fixtures` - Pre-configured ids, events and configuration
//!
//! ## Usage
//!
//! ```rust,ignore
//! use vc_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     // Gateway that answers joins with the server update first
//!     let gateway = Arc::new(MockGateway::builder().respond(JoinResponse::ServerFirst).build());
//!     let (spawner, mut workers) = ScriptedWorkerSpawner::new();
//!
//!     let controller = VoiceManagerHandle::new(test_config(), gateway, Arc::new(spawner));
//!     let connect = tokio::spawn(async move { controller.connect(GUILD, CHANNEL, USER).await });
//!
//!     let mut worker = workers.next().await;
//!     worker.expect_init().await;
//!     worker.emit(WorkerEvent::Connected);
//! }
//! ```

pub mod fixtures;
pub mod mock_gateway;
pub mod mock_worker;

// Re-export commonly used items
pub use fixtures::*;
pub use mock_gateway::*;
pub use mock_worker::*;
