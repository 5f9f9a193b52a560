//! Plugin options: explicit TLS material, certificate domains and the
//! ordered proxy rule table.
//!
//! Options are read from JSON with camelCase keys. The `proxy` object keeps
//! its insertion order, which is the order rules are evaluated in. JSON keys
//! are unique: a pattern listed twice yields a single rule that keeps the
//! first position and the last target. Two rules that should both match a
//! URL need distinct patterns (`^/live` and `live`, say).

use crate::forward::UpstreamError;
use serde::de::{Deserializer, Error as _};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors. These block server start.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid plugin options: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("`ssl` option requires a non-empty `key` and `cert`")]
    EmptySsl,

    #[error("invalid proxy pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid proxy target for `{pattern}`: {reason}")]
    InvalidTarget { pattern: String, reason: String },

    #[error("invalid upstream TLS settings for `{pattern}`: {source}")]
    InvalidUpstream {
        pattern: String,
        #[source]
        source: UpstreamError,
    },
}

/// Explicit certificate material, PEM text.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SslOptions {
    pub key: String,
    pub cert: String,
}

/// Hostnames a provisioned certificate must cover.
///
/// Ordered and de-duplicated. An empty set falls back to `localhost`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "OneOrMany")]
pub struct DomainSet(Vec<String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl From<OneOrMany> for DomainSet {
    fn from(value: OneOrMany) -> Self {
        match value {
            OneOrMany::One(domain) => DomainSet::new([domain]),
            OneOrMany::Many(domains) => DomainSet::new(domains),
        }
    }
}

impl DomainSet {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set: Vec<String> = Vec::new();
        for domain in domains {
            let domain = domain.into().trim().to_ascii_lowercase();
            if !domain.is_empty() && !set.contains(&domain) {
                set.push(domain);
            }
        }
        if set.is_empty() {
            return Self::default();
        }
        Self(set)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// The first domain, used as the certificate common name.
    pub fn primary(&self) -> &str {
        &self.0[0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl Default for DomainSet {
    fn default() -> Self {
        Self(vec!["localhost".to_string()])
    }
}

/// Upstream protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl Protocol {
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Http => 80,
            Protocol::Https => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

/// TLS settings for `https` upstreams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsOptions {
    /// Extra trusted CA certificates (PEM).
    pub ca: Option<String>,
    /// Client certificate chain (PEM).
    pub cert: Option<String>,
    /// Client private key (PEM).
    pub key: Option<String>,
    pub reject_unauthorized: bool,
    /// SNI / verification name override.
    pub servername: Option<String>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            ca: None,
            cert: None,
            key: None,
            reject_unauthorized: true,
            servername: None,
        }
    }
}

/// Everything the connection layer needs to reach an upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub hostname: String,
    pub port: Option<u16>,
    /// Replaces the forwarded path and query when set.
    pub path: Option<String>,
    pub protocol: Protocol,
    /// Connect timeout.
    pub timeout: Option<Duration>,
    /// Time allowed for the upstream to send response headers.
    pub proxy_timeout: Option<Duration>,
    /// Adds a `via` header when set.
    pub proxy_name: Option<String>,
    pub tls: TlsOptions,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: None,
            path: None,
            protocol: Protocol::Http,
            timeout: None,
            proxy_timeout: None,
            proxy_name: None,
            tls: TlsOptions::default(),
        }
    }
}

impl ConnectOptions {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.protocol.default_port())
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn authority(&self) -> String {
        if self.hostname.contains(':') {
            format!("[{}]:{}", self.hostname, self.port())
        } else {
            format!("{}:{}", self.hostname, self.port())
        }
    }
}

/// Target of a route rule: how to connect, and whether WebSocket upgrades may
/// use the rule.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "RawTarget")]
pub struct ProxyTarget {
    pub connect: ConnectOptions,
    pub allow_upgrade: bool,
}

impl ProxyTarget {
    pub fn new(connect: ConnectOptions) -> Self {
        Self {
            connect,
            allow_upgrade: false,
        }
    }

    pub fn with_upgrade(mut self) -> Self {
        self.allow_upgrade = true;
        self
    }
}

/// Flat on-disk form of a target. `ws` is split off into
/// [`ProxyTarget::allow_upgrade`] instead of travelling with the connection
/// options.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawTarget {
    hostname: Option<String>,
    port: Option<u16>,
    path: Option<String>,
    #[serde(default)]
    protocol: Protocol,
    timeout: Option<u64>,
    proxy_timeout: Option<u64>,
    proxy_name: Option<String>,
    ca: Option<String>,
    cert: Option<String>,
    key: Option<String>,
    reject_unauthorized: Option<bool>,
    servername: Option<String>,
    #[serde(default)]
    ws: bool,
}

impl From<RawTarget> for ProxyTarget {
    fn from(raw: RawTarget) -> Self {
        let connect = ConnectOptions {
            hostname: raw.hostname.unwrap_or_else(|| "localhost".to_string()),
            port: raw.port,
            path: raw.path,
            protocol: raw.protocol,
            timeout: raw.timeout.map(Duration::from_millis),
            proxy_timeout: raw.proxy_timeout.map(Duration::from_millis),
            proxy_name: raw.proxy_name,
            tls: TlsOptions {
                ca: raw.ca,
                cert: raw.cert,
                key: raw.key,
                reject_unauthorized: raw.reject_unauthorized.unwrap_or(true),
                servername: raw.servername,
            },
        };
        Self {
            connect,
            allow_upgrade: raw.ws,
        }
    }
}

/// One entry of the proxy table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    pub pattern: String,
    pub target: ProxyTarget,
}

impl RouteRule {
    pub fn new(pattern: impl Into<String>, target: ProxyTarget) -> Self {
        Self {
            pattern: pattern.into(),
            target,
        }
    }
}

/// Options accepted by the plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PluginOptions {
    #[serde(default)]
    pub ssl: Option<SslOptions>,

    #[serde(default)]
    pub certificate_domain: Option<DomainSet>,

    #[serde(default, deserialize_with = "route_table")]
    pub proxy: Option<Vec<RouteRule>>,
}

impl PluginOptions {
    /// Parse options from JSON text and validate them.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let options: PluginOptions = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ssl) = &self.ssl {
            if ssl.key.trim().is_empty() || ssl.cert.trim().is_empty() {
                return Err(ConfigError::EmptySsl);
            }
        }
        Ok(())
    }

    /// Domains to provision for, defaulting to `localhost`.
    pub fn domains(&self) -> DomainSet {
        self.certificate_domain.clone().unwrap_or_default()
    }
}

/// Reads the `proxy` object in insertion order. Every value must be an
/// object.
fn route_table<'de, D>(deserializer: D) -> Result<Option<Vec<RouteRule>>, D::Error>
where
    D: Deserializer<'de>,
{
    let table: Option<Map<String, Value>> = Option::deserialize(deserializer)?;
    let Some(table) = table else {
        return Ok(None);
    };

    let mut rules = Vec::with_capacity(table.len());
    for (pattern, value) in table {
        if !value.is_object() {
            return Err(D::Error::custom(format!(
                "proxy target for `{pattern}` must be an object"
            )));
        }
        let target = ProxyTarget::deserialize(value)
            .map_err(|e| D::Error::custom(format!("proxy target for `{pattern}`: {e}")))?;
        rules.push(RouteRule { pattern, target });
    }
    Ok(Some(rules))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_pattern_collapses_to_one_rule() {
        let options = PluginOptions::from_json(
            r#"{
                "proxy": {
                    "^/live": { "port": 3001 },
                    "^/api": { "port": 3002 },
                    "^/live": { "port": 3003, "ws": true }
                }
            }"#,
        )
        .unwrap();

        let rules = options.proxy.unwrap();
        let patterns: Vec<_> = rules.iter().map(|r| r.pattern.as_str()).collect();
        assert_eq!(patterns, ["^/live", "^/api"]);
        assert_eq!(rules[0].target.connect.port, Some(3003));
        assert!(rules[0].target.allow_upgrade);
    }

    #[test]
    fn test_proxy_table_keeps_insertion_order() {
        let options = PluginOptions::from_json(
            r#"{
                "proxy": {
                    "^/zeta": { "port": 3001 },
                    "^/alpha": { "port": 3002 },
                    "^/mid": { "port": 3003 }
                }
            }"#,
        )
        .unwrap();

        let patterns: Vec<_> = options
            .proxy
            .unwrap()
            .into_iter()
            .map(|rule| rule.pattern)
            .collect();
        assert_eq!(patterns, ["^/zeta", "^/alpha", "^/mid"]);
    }

    #[test]
    fn test_target_fields() {
        let options = PluginOptions::from_json(
            r#"{
                "proxy": {
                    "^/ws/": {
                        "hostname": "127.0.0.1",
                        "port": 9000,
                        "protocol": "https",
                        "path": "/socket",
                        "timeout": 1500,
                        "proxyTimeout": 3000,
                        "proxyName": "devproxy",
                        "rejectUnauthorized": false,
                        "servername": "api.test",
                        "ws": true
                    }
                }
            }"#,
        )
        .unwrap();

        let rule = &options.proxy.unwrap()[0];
        let connect = &rule.target.connect;
        assert!(rule.target.allow_upgrade);
        assert_eq!(connect.hostname, "127.0.0.1");
        assert_eq!(connect.port(), 9000);
        assert_eq!(connect.protocol, Protocol::Https);
        assert_eq!(connect.path.as_deref(), Some("/socket"));
        assert_eq!(connect.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(connect.proxy_timeout, Some(Duration::from_secs(3)));
        assert_eq!(connect.proxy_name.as_deref(), Some("devproxy"));
        assert!(!connect.tls.reject_unauthorized);
        assert_eq!(connect.tls.servername.as_deref(), Some("api.test"));
    }

    #[test]
    fn test_target_defaults() {
        let options = PluginOptions::from_json(r#"{ "proxy": { "^/api": {} } }"#).unwrap();
        let target = &options.proxy.unwrap()[0].target;

        assert!(!target.allow_upgrade);
        assert_eq!(target.connect, ConnectOptions::default());
        assert_eq!(target.connect.authority(), "localhost:80");
    }

    #[test]
    fn test_non_object_target_rejected() {
        let err = PluginOptions::from_json(r#"{ "proxy": { "^/api": "http://localhost:3000" } }"#)
            .unwrap_err();
        assert!(err.to_string().contains("`^/api` must be an object"));

        let err = PluginOptions::from_json(r#"{ "proxy": { "^/api": null } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_unknown_target_key_rejected() {
        let err = PluginOptions::from_json(r#"{ "proxy": { "^/api": { "prot": 80 } } }"#)
            .unwrap_err();
        assert!(err.to_string().contains("^/api"));
    }

    #[test]
    fn test_null_proxy_disables_proxying() {
        let options = PluginOptions::from_json(r#"{ "proxy": null }"#).unwrap();
        assert!(options.proxy.is_none());
    }

    #[test]
    fn test_certificate_domain_forms() {
        let single = PluginOptions::from_json(r#"{ "certificateDomain": "app.test" }"#).unwrap();
        assert_eq!(single.domains().as_slice(), ["app.test"]);

        let many = PluginOptions::from_json(
            r#"{ "certificateDomain": ["localhost", "App.Test", "localhost"] }"#,
        )
        .unwrap();
        assert_eq!(many.domains().as_slice(), ["localhost", "app.test"]);

        let empty = PluginOptions::from_json(r#"{ "certificateDomain": [] }"#).unwrap();
        assert_eq!(empty.domains(), DomainSet::default());

        assert_eq!(PluginOptions::default().domains().as_slice(), ["localhost"]);
    }

    #[test]
    fn test_empty_ssl_rejected() {
        let err = PluginOptions::from_json(r#"{ "ssl": { "key": "", "cert": "x" } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::EmptySsl));
    }

    #[test]
    fn test_ipv6_authority() {
        let connect = ConnectOptions {
            hostname: "::1".to_string(),
            port: Some(8080),
            ..ConnectOptions::default()
        };
        assert_eq!(connect.authority(), "[::1]:8080");
    }

    #[test]
    fn test_from_file_missing() {
        let err = PluginOptions::from_file("/nonexistent/devproxy.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
