//! Client configuration.

use std::time::Duration;

/// Default connect and handshake deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Settings for a [`WebSocketClient`](crate::WebSocketClient).
///
/// | Field               | Default       |
/// |---------------------|---------------|
/// | `timeout`           | 3 s           |
/// | `origin`            | none          |
/// | `user_agent`        | `ws-client`   |
/// | `headers`           | none          |
/// | `max_frame_bytes`   | 1024          |
/// | `max_message_bytes` | 16 MiB        |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Deadline for the TCP connect and, separately, for the handshake.
    pub timeout: Duration,
    /// Sent as the `Origin` header when set.
    pub origin: Option<String>,
    pub user_agent: String,
    /// Extra request headers, added after the mandatory ones.
    pub headers: Vec<(String, String)>,
    /// Upper bound on a single socket read.
    pub max_frame_bytes: usize,
    /// Largest reassembled message accepted from the server.
    pub max_message_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            origin: None,
            user_agent: "ws-client".to_string(),
            headers: Vec::new(),
            max_frame_bytes: 1024,
            max_message_bytes: 16 * 1024 * 1024,
        }
    }
}

impl ClientConfig {
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(3));
        assert!(config.origin.is_none());
        assert!(config.headers.is_empty());
        assert_eq!(config.max_frame_bytes, 1024);
    }

    #[test]
    fn test_builders_accumulate_headers() {
        // Act
        let config = ClientConfig::default()
            .with_origin("http://example.com")
            .with_header("X-Token", "abc")
            .with_header("X-Trace", "1");

        // Assert
        assert_eq!(config.origin.as_deref(), Some("http://example.com"));
        assert_eq!(
            config.headers,
            vec![
                ("X-Token".to_string(), "abc".to_string()),
                ("X-Trace".to_string(), "1".to_string()),
            ]
        );
    }
}
