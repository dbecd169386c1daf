use secrecy::{ExposeSecret, Secret};
use serde::{Serialize, Serializer};
use serde_json::json;
use std::env;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvironmentVariable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Parsed session credentials.
///
/// The service hands out a complete auth frame of the form
/// `42["auth",{"session":"...","isDemo":1,"uid":123,"platform":1}]`; callers
/// may supply either that full string or just the raw session token.
#[derive(Debug, Clone)]
pub struct SessionCredentials {
    pub session: Secret<String>,
    pub is_demo: bool,
    pub uid: u64,
    pub platform: u32,
    pub fast_history: bool,
}

impl SessionCredentials {
    /// Build from a raw session token.
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: Secret::new(session.into()),
            is_demo: true,
            uid: 0,
            platform: 1,
            fast_history: true,
        }
    }

    /// Parse either a complete `42["auth",{...}]` string or a raw token.
    pub fn parse(ssid: &str) -> Result<Self, ConfigError> {
        const PREFIX: &str = "42[\"auth\",";
        if let Some(rest) = ssid.strip_prefix(PREFIX) {
            let json_part = rest.strip_suffix(']').ok_or_else(|| {
                ConfigError::InvalidConfiguration("unterminated auth message".to_string())
            })?;
            let body: serde_json::Value = serde_json::from_str(json_part).map_err(|e| {
                ConfigError::InvalidConfiguration(format!("malformed auth message: {e}"))
            })?;
            let session = body
                .get("session")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    ConfigError::InvalidConfiguration("auth message missing session".to_string())
                })?
                .to_string();
            Ok(Self {
                session: Secret::new(session),
                is_demo: body.get("isDemo").and_then(serde_json::Value::as_u64) != Some(0),
                uid: body.get("uid").and_then(serde_json::Value::as_u64).unwrap_or(0),
                platform: body
                    .get("platform")
                    .and_then(serde_json::Value::as_u64)
                    .unwrap_or(1) as u32,
                fast_history: body
                    .get("isFastHistory")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(true),
            })
        } else {
            Ok(Self::new(ssid))
        }
    }

    /// Render the auth frame body sent during the handshake.
    pub fn auth_body(&self) -> serde_json::Value {
        json!({
            "session": self.session.expose_secret(),
            "isDemo": u8::from(self.is_demo),
            "uid": self.uid,
            "platform": self.platform,
            "isFastHistory": self.fast_history,
        })
    }

    #[must_use]
    pub const fn demo(mut self, is_demo: bool) -> Self {
        self.is_demo = is_demo;
        self
    }

    #[must_use]
    pub const fn uid(mut self, uid: u64) -> Self {
        self.uid = uid;
        self
    }

    #[must_use]
    pub const fn platform(mut self, platform: u32) -> Self {
        self.platform = platform;
        self
    }
}

// Never expose the session token in serialized form.
impl Serialize for SessionCredentials {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("SessionCredentials", 4)?;
        state.serialize_field("session", "[REDACTED]")?;
        state.serialize_field("is_demo", &self.is_demo)?;
        state.serialize_field("uid", &self.uid)?;
        state.serialize_field("platform", &self.platform)?;
        state.end()
    }
}

/// Client configuration covering credentials, endpoint preferences and the
/// timing knobs of the connection layer.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub credentials: SessionCredentials,
    /// Preferred region names tried first, in order.
    pub preferred_regions: Vec<String>,
    pub persistent_connection: bool,
    pub auto_reconnect: bool,
    /// Deadline for each correlated request.
    pub operation_timeout: Duration,
    /// Deadline for the authentication handshake on a single endpoint.
    pub auth_timeout: Duration,
    /// Number of endpoints tried before `connect()` fails.
    pub max_connect_attempts: u32,
    pub heartbeat_interval: Duration,
    /// Degrade when no inbound activity for `heartbeat_interval * multiplier`.
    pub heartbeat_timeout_multiplier: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub rate_limit_window: Duration,
    pub rate_limit_quota: u32,
    /// When enabled, read-only queries pending at the moment of a connection
    /// loss are replayed after re-authentication instead of failing.
    pub retry_reads_after_reconnect: bool,
}

impl ClientConfig {
    pub fn new(credentials: SessionCredentials) -> Self {
        Self {
            credentials,
            preferred_regions: Vec::new(),
            persistent_connection: false,
            auto_reconnect: true,
            operation_timeout: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(10),
            max_connect_attempts: 3,
            heartbeat_interval: Duration::from_secs(20),
            heartbeat_timeout_multiplier: 3,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
            max_reconnect_attempts: 10,
            rate_limit_window: Duration::from_secs(1),
            rate_limit_quota: 10,
            retry_reads_after_reconnect: false,
        }
    }

    /// Read configuration from environment variables.
    ///
    /// Recognized variables:
    /// - `POCKET_SSID` - complete auth frame or raw session token (required)
    /// - `POCKET_DEMO` - optional, defaults to true
    pub fn from_env() -> Result<Self, ConfigError> {
        let ssid = env::var("POCKET_SSID")
            .map_err(|_| ConfigError::MissingEnvironmentVariable("POCKET_SSID".to_string()))?;
        let mut credentials = SessionCredentials::parse(&ssid)?;
        if let Ok(demo) = env::var("POCKET_DEMO") {
            credentials.is_demo = demo.parse::<bool>().unwrap_or(true);
        }
        Ok(Self::new(credentials))
    }

    /// Read configuration from a .env file and the environment.
    #[cfg(feature = "env-file")]
    pub fn from_env_file() -> Result<Self, ConfigError> {
        match dotenv::dotenv() {
            Ok(_) => {}
            Err(dotenv::Error::Io(io_err)) if io_err.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "Failed to load .env file: {e}"
                )));
            }
        }
        Self::from_env()
    }

    #[must_use]
    pub fn preferred_regions(mut self, regions: Vec<String>) -> Self {
        self.preferred_regions = regions;
        self
    }

    #[must_use]
    pub const fn persistent(mut self, persistent: bool) -> Self {
        self.persistent_connection = persistent;
        self
    }

    #[must_use]
    pub const fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    #[must_use]
    pub const fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub const fn reconnect_backoff(mut self, base: Duration, max: Duration, attempts: u32) -> Self {
        self.reconnect_base_delay = base;
        self.reconnect_max_delay = max;
        self.max_reconnect_attempts = attempts;
        self
    }

    #[must_use]
    pub const fn rate_limit(mut self, quota: u32, window: Duration) -> Self {
        self.rate_limit_quota = quota;
        self.rate_limit_window = window;
        self
    }

    #[must_use]
    pub const fn retry_reads_after_reconnect(mut self, enabled: bool) -> Self {
        self.retry_reads_after_reconnect = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_complete_auth_message() {
        let ssid = r#"42["auth",{"session":"abc123","isDemo":0,"uid":42,"platform":3}]"#;
        let creds = SessionCredentials::parse(ssid).unwrap();
        assert_eq!(creds.session.expose_secret(), "abc123");
        assert!(!creds.is_demo);
        assert_eq!(creds.uid, 42);
        assert_eq!(creds.platform, 3);
    }

    #[test]
    fn raw_token_falls_back_to_defaults() {
        let creds = SessionCredentials::parse("rawtoken").unwrap();
        assert_eq!(creds.session.expose_secret(), "rawtoken");
        assert!(creds.is_demo);
        assert_eq!(creds.uid, 0);
    }

    #[test]
    fn malformed_auth_message_is_rejected() {
        assert!(SessionCredentials::parse(r#"42["auth",{"session":]"#).is_err());
        assert!(SessionCredentials::parse(r#"42["auth",{"uid":1}]"#).is_err());
    }

    #[test]
    fn serialization_redacts_session() {
        let creds = SessionCredentials::new("topsecret");
        let out = serde_json::to_string(&creds).unwrap();
        assert!(!out.contains("topsecret"));
        assert!(out.contains("[REDACTED]"));
    }
}
