//! Metrics definitions for the voice controller.
//!
//! All metrics follow Prometheus naming conventions:
//! - `vc_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! The embedding application installs the recorder; without one the calls
//! are no-ops.
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `outcome`: success, already_connected, timeout, cancelled, worker_failure, signaling, error
//! - `reason`: requested, implicit_leave, shutdown, faulted
//! - `operation`: spawn, init, disconnect, speak, idle

use crate::errors::VcError;

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Set the number of active voice sessions.
///
/// Metric: `vc_sessions_active`
/// Labels: none
pub fn set_sessions_active(count: usize) {
    // usize to f64 conversion is safe for realistic session counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("vc_sessions_active").set(count as f64);
}

/// Record the result of a connect call.
///
/// Metric: `vc_connect_total`
/// Labels: `outcome`
pub fn record_connect(outcome: &'static str) {
    counter!("vc_connect_total", "outcome" => outcome).increment(1);
}

/// Time from connect request to worker `Connected`.
///
/// Metric: `vc_handshake_duration_seconds`
/// Labels: none
pub fn record_handshake_duration(duration: Duration) {
    histogram!("vc_handshake_duration_seconds").record(duration.as_secs_f64());
}

/// Record a completed session teardown.
///
/// Metric: `vc_disconnect_total`
/// Labels: `reason`
pub fn record_disconnect(reason: &'static str) {
    counter!("vc_disconnect_total", "reason" => reason).increment(1);
}

/// Record a worker failure.
///
/// Metric: `vc_worker_failures_total`
/// Labels: `operation`
///
/// Any non-zero rate means workers are crashing or missing acknowledgments.
pub fn record_worker_failure(operation: &'static str) {
    counter!("vc_worker_failures_total", "operation" => operation).increment(1);
}

/// Record audio chunks handed to a worker.
///
/// Metric: `vc_audio_chunks_sent_total`
/// Labels: none
pub fn record_audio_chunks_sent(count: u64) {
    counter!("vc_audio_chunks_sent_total").increment(count);
}

/// Bounded `outcome` label for a connect result.
#[must_use]
pub fn connect_outcome(result: &Result<(), &VcError>) -> &'static str {
    match result {
        Ok(()) => "success",
        Err(VcError::AlreadyConnected(_)) => "already_connected",
        Err(VcError::HandshakeTimeout(_)) => "timeout",
        Err(VcError::Cancelled) => "cancelled",
        Err(VcError::WorkerFailure(_)) => "worker_failure",
        Err(VcError::Signaling(_)) => "signaling",
        Err(_) => "error",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::types::GuildId;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_metrics_are_recorded_with_bounded_labels() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            set_sessions_active(2);
            record_connect("success");
            record_connect("success");
            record_connect("timeout");
            record_handshake_duration(Duration::from_millis(120));
            record_disconnect("requested");
            record_worker_failure("speak");
            record_audio_chunks_sent(3);
        });

        let metrics = snapshotter.snapshot().into_vec();
        let find = |name: &str, label: Option<(&str, &str)>| {
            metrics
                .iter()
                .find(|(key, _, _, _)| {
                    let key = key.key();
                    key.name() == name
                        && label.map_or(true, |(k, v)| {
                            key.labels().any(|l| l.key() == k && l.value() == v)
                        })
                })
                .map(|(_, _, _, value)| value.clone())
        };

        assert!(matches!(
            find("vc_sessions_active", None),
            Some(DebugValue::Gauge(v)) if (v.into_inner() - 2.0).abs() < f64::EPSILON
        ));
        assert!(matches!(
            find("vc_connect_total", Some(("outcome", "success"))),
            Some(DebugValue::Counter(2))
        ));
        assert!(matches!(
            find("vc_connect_total", Some(("outcome", "timeout"))),
            Some(DebugValue::Counter(1))
        ));
        assert!(matches!(
            find("vc_handshake_duration_seconds", None),
            Some(DebugValue::Histogram(samples)) if samples.len() == 1
        ));
        assert!(matches!(
            find("vc_disconnect_total", Some(("reason", "requested"))),
            Some(DebugValue::Counter(1))
        ));
        assert!(matches!(
            find("vc_worker_failures_total", Some(("operation", "speak"))),
            Some(DebugValue::Counter(1))
        ));
        assert!(matches!(
            find("vc_audio_chunks_sent_total", None),
            Some(DebugValue::Counter(3))
        ));
    }

    #[test]
    fn test_connect_outcome_labels() {
        assert_eq!(connect_outcome(&Ok(())), "success");
        assert_eq!(
            connect_outcome(&Err(&VcError::AlreadyConnected(GuildId(1)))),
            "already_connected"
        );
        assert_eq!(
            connect_outcome(&Err(&VcError::HandshakeTimeout(GuildId(1)))),
            "timeout"
        );
        assert_eq!(connect_outcome(&Err(&VcError::Cancelled)), "cancelled");
        assert_eq!(
            connect_outcome(&Err(&VcError::Internal("x".to_string()))),
            "error"
        );
    }
}
