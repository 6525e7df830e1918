//! `ws://` URL parsing.
//!
//! Only the parts a WebSocket client needs are kept: host, port, the
//! request target (path plus query) and optional `user:password`
//! credentials.  Fragments are dropped.  `wss://` is rejected because this
//! crate ships no TLS driver.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::ClientError;

const SCHEME: &str = "ws://";
const SECURE_SCHEME: &str = "wss://";
const DEFAULT_PORT: u16 = 80;

/// A parsed `ws://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUrl {
    host: String,
    port: u16,
    path: String,
    credentials: Option<String>,
}

impl WsUrl {
    /// Parses `ws://[user[:password]@]host[:port][/path][?query][#fragment]`.
    ///
    /// IPv6 hosts are written in brackets, e.g. `ws://[::1]:9000/`.
    ///
    /// # Errors
    ///
    /// [`ClientError::InvalidUrl`] for another scheme, an empty host or a
    /// bad port.
    pub fn parse(input: &str) -> Result<Self, ClientError> {
        let rest = strip_prefix_ignore_case(input, SCHEME).ok_or_else(|| {
            if strip_prefix_ignore_case(input, SECURE_SCHEME).is_some() {
                ClientError::invalid_url(input, "wss:// needs a TLS driver")
            } else {
                ClientError::invalid_url(input, "scheme must be ws://")
            }
        })?;

        let rest = rest.split('#').next().unwrap_or_default();
        let split = rest.find(['/', '?']).unwrap_or(rest.len());
        let (authority, target) = rest.split_at(split);
        let path = match target.chars().next() {
            None => "/".to_string(),
            Some('?') => format!("/{target}"),
            Some(_) => target.to_string(),
        };

        let (credentials, host_port) = match authority.rsplit_once('@') {
            Some((user, host_port)) => (Some(user.to_string()), host_port),
            None => (None, authority),
        };

        let (host, port) = split_host_port(input, host_port)?;
        if host.is_empty() {
            return Err(ClientError::invalid_url(input, "missing host"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            path,
            credentials,
        })
    }

    /// Host to connect to, without IPv6 brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Request target: path and query.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Value for the `Host` request header.
    pub fn host_header(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// `Basic` credentials for the `Authorization` header, when the URL
    /// carries a user.
    pub fn authorization(&self) -> Option<String> {
        self.credentials
            .as_ref()
            .map(|user| format!("Basic {}", STANDARD.encode(user)))
    }
}

impl FromStr for WsUrl {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for WsUrl {
    /// Credentials are never printed.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}{}{}", self.host_header(), self.path)
    }
}

// ── Utility helpers ───────────────────────────────────────────────────────────

fn strip_prefix_ignore_case<'a>(input: &'a str, prefix: &str) -> Option<&'a str> {
    let head = input.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &input[prefix.len()..])
}

fn split_host_port<'a>(input: &str, host_port: &'a str) -> Result<(&'a str, u16), ClientError> {
    let (host, port) = if let Some(bracketed) = host_port.strip_prefix('[') {
        let (host, after) = bracketed
            .split_once(']')
            .ok_or_else(|| ClientError::invalid_url(input, "unterminated IPv6 host"))?;
        match after {
            "" => (host, None),
            _ => match after.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => return Err(ClientError::invalid_url(input, "junk after IPv6 host")),
            },
        }
    } else {
        match host_port.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (host_port, None),
        }
    };

    let port = match port {
        None | Some("") => DEFAULT_PORT,
        Some(port) => port
            .parse()
            .map_err(|_| ClientError::invalid_url(input, format!("bad port {port:?}")))?,
    };
    Ok((host, port))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_url() {
        // Act
        let url = WsUrl::parse("ws://127.0.0.1:9501/chat").unwrap();

        // Assert
        assert_eq!(url.host(), "127.0.0.1");
        assert_eq!(url.port(), 9501);
        assert_eq!(url.path(), "/chat");
        assert_eq!(url.host_header(), "127.0.0.1:9501");
        assert!(url.authorization().is_none());
    }

    #[test]
    fn test_defaults_for_port_and_path() {
        let url = WsUrl::parse("ws://example.com").unwrap();
        assert_eq!(url.port(), 80);
        assert_eq!(url.path(), "/");
    }

    #[test]
    fn test_query_without_path_gets_root() {
        let url = WsUrl::parse("ws://example.com:81?room=1#top").unwrap();
        assert_eq!(url.path(), "/?room=1");
    }

    #[test]
    fn test_scheme_is_case_insensitive() {
        assert_eq!(WsUrl::parse("WS://h:1/").unwrap().host(), "h");
    }

    #[test]
    fn test_ipv6_host() {
        let url = WsUrl::parse("ws://[::1]:9000/x").unwrap();
        assert_eq!(url.host(), "::1");
        assert_eq!(url.port(), 9000);
        assert_eq!(url.host_header(), "[::1]:9000");
        assert_eq!(url.to_string(), "ws://[::1]:9000/x");
    }

    #[test]
    fn test_credentials_become_basic_auth() {
        let url = WsUrl::parse("ws://user:secret@host:8080/").unwrap();
        assert_eq!(url.host(), "host");
        assert_eq!(url.authorization().as_deref(), Some("Basic dXNlcjpzZWNyZXQ="));
        assert_eq!(url.to_string(), "ws://host:8080/");
    }

    #[test]
    fn test_rejects_wss_and_other_schemes() {
        assert!(matches!(
            WsUrl::parse("wss://host/"),
            Err(ClientError::InvalidUrl { reason, .. }) if reason.contains("TLS")
        ));
        assert!(WsUrl::parse("http://host/").is_err());
    }

    #[test]
    fn test_rejects_missing_host_and_bad_port() {
        assert!(WsUrl::parse("ws:///path").is_err());
        assert!(WsUrl::parse("ws://host:http/").is_err());
        assert!(WsUrl::parse("ws://host:70000/").is_err());
        assert!(WsUrl::parse("ws://[::1/").is_err());
    }

    #[test]
    fn test_from_str() {
        let url: WsUrl = "ws://localhost:8080/echo".parse().unwrap();
        assert_eq!(url.path(), "/echo");
    }
}
