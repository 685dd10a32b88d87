//! Common utilities and types shared across the voice workspace crates.

#![warn(clippy::pedantic)]

/// Module for snowflake identifier types and shard routing
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;
