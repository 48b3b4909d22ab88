//! Client configuration and eager validation.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use thiserror::Error;
use url::Url;

/// Invoked on every Connected/Disconnected boundary with the new online
/// state. Never called twice in a row with the same value.
pub type OnlineChangeCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Mints a fresh auth token. Consulted before a reconnect when the server
/// rejected the previous token.
pub type AuthRefreshCallback = Arc<dyn Fn() -> BoxFuture<'static, String> + Send + Sync>;

/// Default jitter buffer in milliseconds.
pub const DEFAULT_BUFFER_MS: u64 = 250;

/// Options for [`crate::RoomClient`].
///
/// `user_id` is required and must be non-empty; `socket_origin` must use a
/// `ws` or `wss` scheme. Everything else has a workable default.
#[derive(Clone)]
pub struct ClientOptions {
    pub user_id: String,
    pub room_id: String,
    pub socket_origin: String,
    pub auth: String,
    pub get_auth: Option<AuthRefreshCallback>,
    pub schema_version: String,
    /// Name of the local replica instance, surfaced through the facade.
    /// Derived from `user_id` and `schema_version` when empty.
    pub store_name: String,
    /// Jitter buffer: minimum hold time between receiving a poke and handing
    /// it to the store.
    pub buffer_ms: u64,
    /// Test-only: sleep a uniformly random amount in `[0, n)` ms before each
    /// push. Leave at 0 outside simulations.
    pub max_random_push_latency_ms: u64,
    pub on_online_change: Option<OnlineChangeCallback>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            room_id: String::new(),
            socket_origin: String::new(),
            auth: String::new(),
            get_auth: None,
            schema_version: String::new(),
            store_name: String::new(),
            buffer_ms: DEFAULT_BUFFER_MS,
            max_random_push_latency_ms: 0,
            on_online_change: None,
        }
    }
}

impl ClientOptions {
    pub fn new(
        user_id: impl Into<String>,
        room_id: impl Into<String>,
        socket_origin: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            room_id: room_id.into(),
            socket_origin: socket_origin.into(),
            ..Self::default()
        }
    }

    /// Validates the options and fills derived fields.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.user_id.trim().is_empty() {
            return Err(ConfigError::EmptyUserId);
        }
        parse_socket_origin(&self.socket_origin)?;
        if self.store_name.is_empty() {
            self.store_name = format!("riptide-{}-{}", self.user_id, self.schema_version);
        }
        Ok(self)
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("user_id", &self.user_id)
            .field("room_id", &self.room_id)
            .field("socket_origin", &self.socket_origin)
            .field("schema_version", &self.schema_version)
            .field("store_name", &self.store_name)
            .field("buffer_ms", &self.buffer_ms)
            .field("max_random_push_latency_ms", &self.max_random_push_latency_ms)
            .finish_non_exhaustive()
    }
}

/// Parses the socket origin and rejects non-websocket schemes.
pub(crate) fn parse_socket_origin(origin: &str) -> Result<Url, ConfigError> {
    let parsed = Url::parse(origin.trim())
        .map_err(|err| ConfigError::InvalidOrigin(format!("{origin}: {err}")))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(parsed),
        _ => Err(ConfigError::SocketScheme(origin.to_string())),
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("user id cannot be empty")]
    EmptyUserId,
    #[error("socket origin must use ws:// or wss://: {0}")]
    SocketScheme(String),
    #[error("invalid socket origin: {0}")]
    InvalidOrigin(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_user_id_is_rejected() {
        let err = ClientOptions::new("", "r1", "ws://sync.example.com")
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyUserId));
    }

    #[test]
    fn non_websocket_scheme_is_rejected() {
        let err = ClientOptions::new("u1", "r1", "https://sync.example.com")
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::SocketScheme(_)));
    }

    #[test]
    fn store_name_is_derived_when_empty() {
        let options = ClientOptions {
            schema_version: "2".to_string(),
            ..ClientOptions::new("u1", "r1", "wss://sync.example.com")
        }
        .validate()
        .unwrap();
        assert_eq!(options.store_name, "riptide-u1-2");
    }

    #[test]
    fn ws_and_wss_origins_are_accepted() {
        assert!(ClientOptions::new("u1", "r1", "ws://localhost:8080").validate().is_ok());
        assert!(ClientOptions::new("u1", "r1", "wss://sync.example.com").validate().is_ok());
    }
}
