//! Rule-based request routing.
//!
//! Rules are evaluated in configuration order and the first match wins.
//! Patterns are regular expressions searched anywhere in the request's path
//! and query (not anchored), so `api` matches `/v1/api/x` as well as
//! `/api`. Anchor with `^` when prefix semantics are wanted.
//!
//! Plain requests and upgrade requests are matched separately: an upgrade
//! only uses a rule whose pattern matches *and* which allows upgrades;
//! matching rules without the flag are skipped.

use crate::config::{ConfigError, RouteRule};
use crate::forward::{ForwardError, Peer, ProxyBody, Upstream};
use bytes::Bytes;
use hyper::body::Body;
use hyper::header::{CONNECTION, UPGRADE};
use hyper::{Request, Response};
use regex::Regex;
use tracing::debug;

/// A rule with its pattern compiled and its upstream resolved
#[derive(Debug)]
pub struct CompiledRule {
    pattern: Regex,
    upstream: Upstream,
    allow_upgrade: bool,
}

impl CompiledRule {
    fn compile(rule: &RouteRule) -> Result<Self, ConfigError> {
        let pattern = Regex::new(&rule.pattern).map_err(|source| ConfigError::InvalidPattern {
            pattern: rule.pattern.clone(),
            source,
        })?;

        let connect = &rule.target.connect;
        if connect.hostname.trim().is_empty() {
            return Err(ConfigError::InvalidTarget {
                pattern: rule.pattern.clone(),
                reason: "hostname must not be empty".to_string(),
            });
        }
        if connect.port == Some(0) {
            return Err(ConfigError::InvalidTarget {
                pattern: rule.pattern.clone(),
                reason: "port must not be 0".to_string(),
            });
        }
        if let Some(path) = &connect.path {
            if !path.starts_with('/') {
                return Err(ConfigError::InvalidTarget {
                    pattern: rule.pattern.clone(),
                    reason: format!("path `{}` must start with `/`", path),
                });
            }
        }

        let upstream =
            Upstream::new(connect.clone()).map_err(|source| ConfigError::InvalidUpstream {
                pattern: rule.pattern.clone(),
                source,
            })?;

        if !rule.pattern.starts_with('^') && rule.pattern.len() < 3 {
            debug!(
                "Proxy pattern `{}` is short and unanchored; it matches anywhere in the URL",
                rule.pattern
            );
        }

        Ok(Self {
            pattern,
            upstream,
            allow_upgrade: rule.target.allow_upgrade,
        })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    pub fn allow_upgrade(&self) -> bool {
        self.allow_upgrade
    }

    pub fn matches(&self, url: &str) -> bool {
        self.pattern.is_match(url)
    }
}

/// Outcome of routing one request
pub enum Dispatch<B> {
    /// Handled by an upstream; send this response to the client
    Forwarded(Response<ProxyBody>),
    /// No rule applies; the request is handed back untouched
    Next(Request<B>),
}

/// Ordered, read-only rule table
#[derive(Debug, Default)]
pub struct ProxyRouter {
    rules: Vec<CompiledRule>,
}

impl ProxyRouter {
    /// Compile every rule up front. The first invalid pattern or target
    /// aborts loading.
    pub fn new(table: &[RouteRule]) -> Result<Self, ConfigError> {
        let rules = table
            .iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First rule matching `url`
    pub fn select(&self, url: &str) -> Option<(usize, &CompiledRule)> {
        self.rules.iter().enumerate().find(|(_, rule)| rule.matches(url))
    }

    /// First rule matching `url` that also allows upgrades
    pub fn select_upgrade(&self, url: &str) -> Option<(usize, &CompiledRule)> {
        self.rules
            .iter()
            .enumerate()
            .find(|(_, rule)| rule.allow_upgrade && rule.matches(url))
    }

    /// Route a plain HTTP request. Forwarding errors are returned for the
    /// host to render.
    pub async fn handle<B>(&self, req: Request<B>, peer: &Peer) -> Result<Dispatch<B>, ForwardError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if self.rules.is_empty() {
            return Ok(Dispatch::Next(req));
        }

        let url = request_url(&req);
        match self.select(url) {
            Some((index, rule)) => {
                debug!("{} {} matched proxy rule #{} `{}`", req.method(), url, index, rule.pattern());
                let response = rule.upstream.forward(req, peer).await?;
                Ok(Dispatch::Forwarded(response))
            }
            None => Ok(Dispatch::Next(req)),
        }
    }

    /// Route an upgrade request. `Next` means no eligible rule; the caller
    /// decides what happens to the request.
    pub async fn handle_upgrade<B>(
        &self,
        req: Request<B>,
        peer: &Peer,
    ) -> Result<Dispatch<B>, ForwardError>
    where
        B: Send + 'static,
    {
        if self.rules.is_empty() {
            return Ok(Dispatch::Next(req));
        }

        let url = request_url(&req);
        match self.select_upgrade(url) {
            Some((index, rule)) => {
                debug!("Upgrade {} matched proxy rule #{} `{}`", url, index, rule.pattern());
                let response = rule.upstream.forward_upgrade(req, peer).await?;
                Ok(Dispatch::Forwarded(response))
            }
            None => Ok(Dispatch::Next(req)),
        }
    }
}

/// Path and query of a request, as matched by rule patterns
pub fn request_url<B>(req: &Request<B>) -> &str {
    req.uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
}

/// Whether a request asks for an HTTP/1.1 protocol upgrade
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade = req.headers().contains_key(UPGRADE);
    let connection_upgrade = req
        .headers()
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    has_upgrade && connection_upgrade
}
