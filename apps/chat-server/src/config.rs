use std::time::Duration;

use chat_common::id::{prefix, prefixed_ulid};

use crate::hub::connection::ConnectionSettings;
use crate::hub::HubSettings;

/// Chat server configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identity of this process on the backplane. Must be unique per instance.
    pub server_name: String,
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Redis connection string (`redis://host:port/db`).
    /// When unset the process runs on the in-memory broker.
    pub redis_url: Option<String>,
    /// Origins allowed to open a WebSocket. Empty allows any origin.
    pub allowed_origins: Vec<String>,
    /// Seconds a connection may stay silent (no pong) before it is dropped.
    pub pong_wait_secs: u64,
    /// Seconds allowed for a single socket write.
    pub write_wait_secs: u64,
    /// Largest inbound frame, in bytes.
    pub max_message_size: usize,
    /// Lifetime of the per-server presence counters.
    pub presence_ttl_secs: u64,
    /// Upper bound on any single broker round-trip.
    pub broker_timeout_secs: u64,
    /// How long a room with no local members is kept before eviction.
    pub empty_room_grace_secs: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            server_name: std::env::var("SERVER_NAME")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| prefixed_ulid(prefix::SERVER)),
            port: parsed_var("PORT", 8080),
            redis_url: std::env::var("REDIS_URL").ok().filter(|s| !s.is_empty()),
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            pong_wait_secs: nonzero_var("PONG_WAIT_SECS", 60),
            write_wait_secs: nonzero_var("WRITE_WAIT_SECS", 10),
            max_message_size: parsed_var("MAX_MESSAGE_SIZE", 512),
            presence_ttl_secs: nonzero_var("PRESENCE_TTL_SECS", 3600),
            broker_timeout_secs: nonzero_var("BROKER_TIMEOUT_SECS", 5),
            empty_room_grace_secs: parsed_var("EMPTY_ROOM_GRACE_SECS", 600),
        }
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            pong_wait: Duration::from_secs(self.pong_wait_secs),
            write_wait: Duration::from_secs(self.write_wait_secs),
            max_message_size: self.max_message_size,
            ..ConnectionSettings::default()
        }
    }

    pub fn hub_settings(&self) -> HubSettings {
        let presence_ttl = Duration::from_secs(self.presence_ttl_secs);
        HubSettings {
            server_id: self.server_name.clone(),
            presence_ttl,
            presence_refresh: presence_ttl / 2,
            broker_timeout: Duration::from_secs(self.broker_timeout_secs),
            empty_room_grace: Duration::from_secs(self.empty_room_grace_secs),
            ..HubSettings::default()
        }
    }

    /// Whether a WebSocket handshake from `origin` may proceed.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.allowed_origins.is_empty() {
            return true;
        }
        origin.is_some_and(|o| self.allowed_origins.iter().any(|allowed| allowed == o))
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Like [`parsed_var`], but a zero is rejected in favour of `default`.
fn nonzero_var(name: &str, default: u64) -> u64 {
    nonzero_or(name, parsed_var(name, default), default)
}

fn nonzero_or(name: &str, value: u64, default: u64) -> u64 {
    if value == 0 {
        tracing::warn!(name, default, "zero is not allowed, using default");
        return default;
    }
    value
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_origins(origins: &[&str]) -> Config {
        Config {
            server_name: "srv_test".to_string(),
            port: 0,
            redis_url: None,
            allowed_origins: origins.iter().map(|s| s.to_string()).collect(),
            pong_wait_secs: 60,
            write_wait_secs: 10,
            max_message_size: 512,
            presence_ttl_secs: 3600,
            broker_timeout_secs: 5,
            empty_room_grace_secs: 600,
        }
    }

    #[test]
    fn split_list_trims_and_skips_empty() {
        assert_eq!(
            split_list(" http://a.test, ,http://b.test,"),
            vec!["http://a.test".to_string(), "http://b.test".to_string()]
        );
    }

    #[test]
    fn zero_durations_fall_back_to_default() {
        assert_eq!(nonzero_or("PONG_WAIT_SECS", 0, 60), 60);
        assert_eq!(nonzero_or("PONG_WAIT_SECS", 30, 60), 30);
    }

    #[test]
    fn empty_allow_list_accepts_any_origin() {
        let config = config_with_origins(&[]);
        assert!(config.origin_allowed(None));
        assert!(config.origin_allowed(Some("http://anything.test")));
    }

    #[test]
    fn allow_list_requires_matching_origin() {
        let config = config_with_origins(&["http://chat.test"]);
        assert!(config.origin_allowed(Some("http://chat.test")));
        assert!(!config.origin_allowed(Some("http://evil.test")));
        assert!(!config.origin_allowed(None));
    }

    #[test]
    fn settings_derive_from_config() {
        let config = config_with_origins(&[]);
        let conn = config.connection_settings();
        assert_eq!(conn.pong_wait, Duration::from_secs(60));
        assert_eq!(conn.ping_period(), Duration::from_secs(54));

        let hub = config.hub_settings();
        assert_eq!(hub.server_id, "srv_test");
        assert_eq!(hub.presence_refresh, Duration::from_secs(1800));
        assert_eq!(hub.empty_room_grace, Duration::from_secs(600));
    }
}
