//! Voice controller configuration.
//!
//! Configuration is loaded from environment variables. Nothing in here is
//! secret, so the derived `Debug` is safe to log.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default number of gateway shards.
pub const DEFAULT_SHARD_COUNT: u32 = 1;

/// Default time allowed for both handshake events to arrive.
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECONDS: u64 = 15;

/// Default time allowed for a worker to acknowledge `Disconnect`.
pub const DEFAULT_DISCONNECT_TIMEOUT_SECONDS: u64 = 5;

/// Default controller instance ID prefix.
pub const DEFAULT_CONTROLLER_ID_PREFIX: &str = "vc";

/// Voice controller configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Unique identifier for this controller instance (logs only).
    pub controller_id: String,

    /// Number of gateway shards, used to route voice state requests.
    pub shard_count: u32,

    /// Handshake timeout in seconds. `0` disables the timeout.
    pub handshake_timeout_seconds: u64,

    /// Disconnect acknowledgment timeout in seconds (at least 1).
    pub disconnect_timeout_seconds: u64,

    /// Join voice channels self-muted.
    pub self_mute: bool,

    /// Join voice channels self-deafened.
    pub self_deaf: bool,

    /// Path of the `voice-worker` binary. `None` runs workers in-process.
    pub worker_program: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            controller_id: generate_controller_id(),
            shard_count: DEFAULT_SHARD_COUNT,
            handshake_timeout_seconds: DEFAULT_HANDSHAKE_TIMEOUT_SECONDS,
            disconnect_timeout_seconds: DEFAULT_DISCONNECT_TIMEOUT_SECONDS,
            self_mute: false,
            self_deaf: false,
            worker_program: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for unparseable or out-of-range values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for unparseable or out-of-range values.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let controller_id = vars
            .get("VOICE_CONTROLLER_ID")
            .cloned()
            .unwrap_or_else(generate_controller_id);

        let shard_count = parse_var(vars, "VOICE_SHARD_COUNT", DEFAULT_SHARD_COUNT)?;
        if shard_count == 0 {
            return Err(ConfigError::InvalidValue(
                "VOICE_SHARD_COUNT must be at least 1".to_string(),
            ));
        }

        let handshake_timeout_seconds = parse_var(
            vars,
            "VOICE_HANDSHAKE_TIMEOUT_SECONDS",
            DEFAULT_HANDSHAKE_TIMEOUT_SECONDS,
        )?;

        let disconnect_timeout_seconds = parse_var(
            vars,
            "VOICE_DISCONNECT_TIMEOUT_SECONDS",
            DEFAULT_DISCONNECT_TIMEOUT_SECONDS,
        )?;
        if disconnect_timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "VOICE_DISCONNECT_TIMEOUT_SECONDS must be at least 1".to_string(),
            ));
        }

        let self_mute = parse_bool(vars, "VOICE_SELF_MUTE")?;
        let self_deaf = parse_bool(vars, "VOICE_SELF_DEAF")?;

        let worker_program = vars
            .get("VOICE_WORKER_PROGRAM")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        Ok(Config {
            controller_id,
            shard_count,
            handshake_timeout_seconds,
            disconnect_timeout_seconds,
            self_mute,
            self_deaf,
            worker_program,
        })
    }

    /// Handshake timeout, or `None` when disabled.
    #[must_use]
    pub fn handshake_timeout(&self) -> Option<Duration> {
        (self.handshake_timeout_seconds > 0)
            .then(|| Duration::from_secs(self.handshake_timeout_seconds))
    }

    /// Disconnect acknowledgment timeout.
    #[must_use]
    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.disconnect_timeout_seconds.max(1))
    }
}

fn generate_controller_id() -> String {
    let hostname = env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
    let uuid_suffix = uuid::Uuid::new_v4().to_string();
    let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
    format!("{DEFAULT_CONTROLLER_ID_PREFIX}-{hostname}-{short_suffix}")
}

fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name}={raw}"))),
        None => Ok(default),
    }
}

fn parse_bool(vars: &HashMap<String, String>, name: &str) -> Result<bool, ConfigError> {
    match vars.get(name).map(|s| s.trim().to_ascii_lowercase()).as_deref() {
        None | Some("") => Ok(false),
        Some("true" | "1" | "yes") => Ok(true),
        Some("false" | "0" | "no") => Ok(false),
        Some(other) => Err(ConfigError::InvalidValue(format!("{name}={other}"))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&HashMap::new()).expect("Config should load successfully");

        assert_eq!(config.shard_count, DEFAULT_SHARD_COUNT);
        assert_eq!(
            config.handshake_timeout(),
            Some(Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECONDS))
        );
        assert_eq!(
            config.disconnect_timeout(),
            Duration::from_secs(DEFAULT_DISCONNECT_TIMEOUT_SECONDS)
        );
        assert!(!config.self_mute);
        assert!(!config.self_deaf);
        assert!(config.worker_program.is_none());
        // Controller ID should be auto-generated
        assert!(config.controller_id.starts_with("vc-"));
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let vars = HashMap::from([
            ("VOICE_CONTROLLER_ID".to_string(), "vc-custom-001".to_string()),
            ("VOICE_SHARD_COUNT".to_string(), "16".to_string()),
            ("VOICE_HANDSHAKE_TIMEOUT_SECONDS".to_string(), "30".to_string()),
            ("VOICE_DISCONNECT_TIMEOUT_SECONDS".to_string(), "2".to_string()),
            ("VOICE_SELF_MUTE".to_string(), "true".to_string()),
            ("VOICE_SELF_DEAF".to_string(), "1".to_string()),
            (
                "VOICE_WORKER_PROGRAM".to_string(),
                "/usr/local/bin/voice-worker".to_string(),
            ),
        ]);

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.controller_id, "vc-custom-001");
        assert_eq!(config.shard_count, 16);
        assert_eq!(config.handshake_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.disconnect_timeout(), Duration::from_secs(2));
        assert!(config.self_mute);
        assert!(config.self_deaf);
        assert_eq!(
            config.worker_program,
            Some(PathBuf::from("/usr/local/bin/voice-worker"))
        );
    }

    #[test]
    fn test_zero_handshake_timeout_disables() {
        let vars = HashMap::from([(
            "VOICE_HANDSHAKE_TIMEOUT_SECONDS".to_string(),
            "0".to_string(),
        )]);
        let config = Config::from_vars(&vars).unwrap();
        assert_eq!(config.handshake_timeout(), None);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        for (name, value) in [
            ("VOICE_SHARD_COUNT", "0"),
            ("VOICE_SHARD_COUNT", "many"),
            ("VOICE_HANDSHAKE_TIMEOUT_SECONDS", "-1"),
            ("VOICE_DISCONNECT_TIMEOUT_SECONDS", "0"),
            ("VOICE_SELF_MUTE", "maybe"),
        ] {
            let vars = HashMap::from([(name.to_string(), value.to_string())]);
            let result = Config::from_vars(&vars);
            assert!(
                matches!(result, Err(ConfigError::InvalidValue(_))),
                "{name}={value} should be rejected"
            );
        }
    }

    #[test]
    fn test_blank_worker_program_means_in_process() {
        let vars = HashMap::from([("VOICE_WORKER_PROGRAM".to_string(), "  ".to_string())]);
        let config = Config::from_vars(&vars).unwrap();
        assert!(config.worker_program.is_none());
    }
}
