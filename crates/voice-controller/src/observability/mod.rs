//! Observability module for the voice controller.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit fields,
//! so voice credentials never reach a span. Metric labels are bounded.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `vc_sessions_active` | Gauge | none | Current active voice sessions |
//! | `vc_connect_total` | Counter | `outcome` | Connect results |
//! | `vc_handshake_duration_seconds` | Histogram | none | Connect request to worker `Connected` |
//! | `vc_disconnect_total` | Counter | `reason` | Session teardowns |
//! | `vc_worker_failures_total` | Counter | `operation` | Worker crashes and missed acknowledgments |
//! | `vc_audio_chunks_sent_total` | Counter | none | Audio chunks handed to workers |

pub mod metrics;

pub use metrics::{
    connect_outcome, record_audio_chunks_sent, record_connect, record_disconnect,
    record_handshake_duration, record_worker_failure, set_sessions_active,
};
