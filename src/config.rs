use std::env;
use std::num::ParseIntError;
use std::time::Duration;

use crate::media_setup::DEFAULT_STUN_URL;

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct Config {
    pub signaling_url: String,
    pub room_id: String,
    pub self_description: String,
    pub stun_url: String,
    pub agent_server_url: Option<String>,
    pub request_timeout: Duration,
    pub metrics_port: Option<u16>,
    pub rust_log: String,
}

#[derive(Debug)]
pub enum ConfigError {
    MissingVariable(String),
    InvalidUrl(String, String),
    InvalidTimeout(String, ParseIntError),
    InvalidPort(String, ParseIntError),
    PortOutOfRange(u16),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVariable(var) => write!(f, "{} is required", var),
            ConfigError::InvalidUrl(var, reason) => {
                write!(f, "{} must be a valid URL ({})", var, reason)
            }
            ConfigError::InvalidTimeout(val, err) => write!(
                f,
                "REQUEST_CONNECTION_TIMEOUT_MS must be a number of milliseconds (got '{}': {})",
                val, err
            ),
            ConfigError::InvalidPort(val, err) => {
                write!(
                    f,
                    "METRICS_PORT must be a valid port number (got '{}': {})",
                    val, err
                )
            }
            ConfigError::PortOutOfRange(port) => {
                write!(f, "METRICS_PORT must be between 1 and 65535 (got {})", port)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

fn required(var: &str) -> Result<String, ConfigError> {
    env::var(var)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingVariable(var.to_string()))
}

fn optional(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.is_empty())
}

fn check_url(var: &str, value: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(value)
        .map_err(|e| ConfigError::InvalidUrl(var.to_string(), e.to_string()))?;
    if !schemes.contains(&parsed.scheme()) {
        return Err(ConfigError::InvalidUrl(
            var.to_string(),
            format!("scheme must be one of {:?}", schemes),
        ));
    }
    Ok(())
}

/// Validates environment variables and returns a Config object
/// Returns an error if any required variable is missing or invalid
pub fn validate_env() -> Result<Config, ConfigError> {
    let signaling_url = required("SIGNALING_URL")?;
    check_url("SIGNALING_URL", &signaling_url, &["ws", "wss"])?;

    let room_id = required("ROOM_ID")?;

    let self_description = optional("SELF_DESCRIPTION").unwrap_or_else(|| "Peer".to_string());
    let stun_url = optional("STUN_URL").unwrap_or_else(|| DEFAULT_STUN_URL.to_string());

    let agent_server_url = optional("AGENT_SERVER_URL");
    if let Some(url) = &agent_server_url {
        check_url("AGENT_SERVER_URL", url, &["http", "https"])?;
    }

    let request_timeout = match optional("REQUEST_CONNECTION_TIMEOUT_MS") {
        Some(raw) => {
            let ms: u64 = raw
                .parse()
                .map_err(|e| ConfigError::InvalidTimeout(raw.clone(), e))?;
            Duration::from_millis(ms)
        }
        None => Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
    };

    let metrics_port = match optional("METRICS_PORT") {
        Some(raw) => {
            let port: u16 = raw
                .parse()
                .map_err(|e| ConfigError::InvalidPort(raw.clone(), e))?;
            if port == 0 {
                return Err(ConfigError::PortOutOfRange(port));
            }
            Some(port)
        }
        None => None,
    };

    // Optional: RUST_LOG (defaults to "info")
    let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| {
        tracing::warn!("RUST_LOG not set, using default: info");
        "info".to_string()
    });

    let config = Config {
        signaling_url,
        room_id,
        self_description,
        stun_url,
        agent_server_url,
        request_timeout,
        metrics_port,
        rust_log,
    };

    tracing::info!(
        signaling_url = %config.signaling_url,
        room_id = %config.room_id,
        self_description = %config.self_description,
        agent_server_url = ?config.agent_server_url,
        request_timeout_ms = config.request_timeout.as_millis() as u64,
        metrics_port = ?config.metrics_port,
        "Configuration"
    );

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    use std::sync::Mutex;

    lazy_static::lazy_static! {
        static ref ENV_MUTEX: Mutex<()> = Mutex::new(());
    }

    const ALL_VARS: &[&str] = &[
        "SIGNALING_URL",
        "ROOM_ID",
        "SELF_DESCRIPTION",
        "STUN_URL",
        "AGENT_SERVER_URL",
        "REQUEST_CONNECTION_TIMEOUT_MS",
        "METRICS_PORT",
        "RUST_LOG",
    ];

    struct EnvGuard<'a> {
        _guard: std::sync::MutexGuard<'a, ()>,
    }

    impl<'a> EnvGuard<'a> {
        /// Locks the environment and starts from a clean slate.
        fn new() -> Self {
            let guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            for var in ALL_VARS {
                env::remove_var(var);
            }
            EnvGuard { _guard: guard }
        }

        fn set(&mut self, key: &str, value: &str) {
            env::set_var(key, value);
        }

        fn minimal(&mut self) {
            self.set("SIGNALING_URL", "wss://relay.example.com/ws");
            self.set("ROOM_ID", "standup");
        }
    }

    impl<'a> Drop for EnvGuard<'a> {
        fn drop(&mut self) {
            for var in ALL_VARS {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn test_validate_env_defaults() {
        let mut guard = EnvGuard::new();
        guard.minimal();

        let config = validate_env().expect("Expected valid configuration");
        assert_eq!(config.room_id, "standup");
        assert_eq!(config.self_description, "Peer");
        assert_eq!(config.stun_url, DEFAULT_STUN_URL);
        assert_eq!(config.agent_server_url, None);
        assert_eq!(config.request_timeout, Duration::from_millis(10_000));
        assert_eq!(config.metrics_port, None);
        assert_eq!(config.rust_log, "info");
    }

    #[test]
    fn test_validate_env_full_configuration() {
        let mut guard = EnvGuard::new();
        guard.minimal();
        guard.set("SELF_DESCRIPTION", "Agent");
        guard.set("AGENT_SERVER_URL", "http://localhost:8000");
        guard.set("REQUEST_CONNECTION_TIMEOUT_MS", "2500");
        guard.set("METRICS_PORT", "9100");
        guard.set("RUST_LOG", "debug");

        let config = validate_env().expect("Expected valid configuration");
        assert_eq!(config.self_description, "Agent");
        assert_eq!(config.agent_server_url.as_deref(), Some("http://localhost:8000"));
        assert_eq!(config.request_timeout, Duration::from_millis(2500));
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.rust_log, "debug");
    }

    #[test]
    fn test_validate_env_missing_signaling_url() {
        let mut guard = EnvGuard::new();
        guard.set("ROOM_ID", "standup");

        let err = validate_env().unwrap_err();
        assert!(matches!(err, ConfigError::MissingVariable(_)));
        assert!(err.to_string().contains("SIGNALING_URL is required"));
    }

    #[test]
    fn test_validate_env_missing_room_id() {
        let mut guard = EnvGuard::new();
        guard.set("SIGNALING_URL", "ws://localhost:8080");

        let err = validate_env().unwrap_err();
        assert!(err.to_string().contains("ROOM_ID is required"));
    }

    #[test]
    fn test_validate_env_rejects_http_signaling_url() {
        let mut guard = EnvGuard::new();
        guard.minimal();
        guard.set("SIGNALING_URL", "http://localhost:8080");

        let err = validate_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl(_, _)));
    }

    #[test]
    fn test_validate_env_invalid_timeout() {
        let mut guard = EnvGuard::new();
        guard.minimal();
        guard.set("REQUEST_CONNECTION_TIMEOUT_MS", "soon");

        let err = validate_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTimeout(_, _)));
    }

    #[test]
    fn test_validate_env_metrics_port_edge_cases() {
        let test_cases = vec![("1", Some(1)), ("65535", Some(65535)), ("0", None), ("65536", None)];

        for (port_str, expected) in test_cases {
            let mut guard = EnvGuard::new();
            guard.minimal();
            guard.set("METRICS_PORT", port_str);

            let result = validate_env();
            match expected {
                Some(port) => {
                    let config =
                        result.unwrap_or_else(|e| panic!("port {} rejected: {}", port_str, e));
                    assert_eq!(config.metrics_port, Some(port));
                }
                None => assert!(result.is_err(), "Expected port {} to be invalid", port_str),
            }
        }
    }
}
