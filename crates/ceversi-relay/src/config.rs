//! Relay client configuration

use std::time::Duration;
use url::Url;

use crate::{RelayError, RelayResult};

/// Default time allowed for dialing a single bootstrap server
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Relay client configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    /// Bootstrap servers, tried in order. Always ws:// or wss://
    pub bootstrap_servers: Vec<Url>,
    /// Per-server dial timeout
    pub connect_timeout: Duration,
}

impl RelayConfig {
    /// Build a configuration from raw bootstrap URLs.
    ///
    /// Blank entries are skipped, so an unset `RELAY` variable split on commas
    /// does not produce a bogus server. `http://` and `https://` are rewritten to
    /// `ws://` and `wss://`.
    pub fn from_urls<I, S>(urls: I) -> RelayResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut bootstrap_servers = Vec::new();

        for raw in urls {
            let raw = raw.as_ref().trim();
            if raw.is_empty() {
                continue;
            }
            let url = normalize_url(raw)?;
            if !bootstrap_servers.contains(&url) {
                bootstrap_servers.push(url);
            }
        }

        if bootstrap_servers.is_empty() {
            return Err(RelayError::NoBootstrapServers);
        }

        Ok(Self {
            bootstrap_servers,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    /// Set the per-server dial timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

fn normalize_url(raw: &str) -> RelayResult<Url> {
    let mut url = Url::parse(raw).map_err(|e| RelayError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(RelayError::InvalidUrl {
                url: raw.to_string(),
                reason: format!("unsupported scheme '{}'", other),
            })
        }
    };

    if url.host_str().is_none() {
        return Err(RelayError::InvalidUrl {
            url: raw.to_string(),
            reason: "missing host".to_string(),
        });
    }

    if url.scheme() != scheme {
        url.set_scheme(scheme).map_err(|_| RelayError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("cannot switch scheme to '{}'", scheme),
        })?;
    }

    Ok(url)
}

/// Append path segments to a bootstrap server URL
pub(crate) fn endpoint(server: &Url, segments: &[&str]) -> RelayResult<Url> {
    let mut url = server.clone();
    url.path_segments_mut()
        .map_err(|_| RelayError::InvalidUrl {
            url: server.to_string(),
            reason: "cannot be a base URL".to_string(),
        })?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skips_blank_entries() {
        let config = RelayConfig::from_urls(["", " wss://relay.example.com ", ""]).unwrap();
        assert_eq!(config.bootstrap_servers.len(), 1);
        assert_eq!(config.bootstrap_servers[0].as_str(), "wss://relay.example.com/");
    }

    #[test]
    fn test_empty_list_is_rejected() {
        let err = RelayConfig::from_urls(Vec::<String>::new()).unwrap_err();
        assert!(matches!(err, RelayError::NoBootstrapServers));

        let err = RelayConfig::from_urls([""]).unwrap_err();
        assert!(matches!(err, RelayError::NoBootstrapServers));
    }

    #[test]
    fn test_http_schemes_are_rewritten() {
        let config =
            RelayConfig::from_urls(["http://a.example.com", "https://b.example.com/relay"])
                .unwrap();
        assert_eq!(config.bootstrap_servers[0].scheme(), "ws");
        assert_eq!(config.bootstrap_servers[1].scheme(), "wss");
        assert_eq!(config.bootstrap_servers[1].path(), "/relay");
    }

    #[test]
    fn test_order_is_kept_and_duplicates_dropped() {
        let config = RelayConfig::from_urls([
            "wss://b.example.com",
            "wss://a.example.com",
            "wss://b.example.com",
        ])
        .unwrap();
        let hosts: Vec<_> = config
            .bootstrap_servers
            .iter()
            .map(|u| u.host_str().unwrap().to_string())
            .collect();
        assert_eq!(hosts, vec!["b.example.com", "a.example.com"]);
    }

    #[test]
    fn test_unsupported_scheme() {
        let err = RelayConfig::from_urls(["ftp://relay.example.com"]).unwrap_err();
        assert!(matches!(err, RelayError::InvalidUrl { .. }));
    }

    #[test]
    fn test_endpoint_appends_segments() {
        let base = Url::parse("wss://relay.example.com/portal/").unwrap();
        let url = endpoint(&base, &["lease", "abc", "42"]).unwrap();
        assert_eq!(url.as_str(), "wss://relay.example.com/portal/lease/abc/42");

        let root = Url::parse("ws://127.0.0.1:4017").unwrap();
        let url = endpoint(&root, &["lease"]).unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:4017/lease");
    }
}
