//! devproxy - HTTPS and reverse proxying for local development servers
//!
//! Provides:
//! - Zero-configuration TLS certificates from a local development CA
//! - Ordered, regex-based proxy rules evaluated first-match-wins
//! - WebSocket upgrade forwarding for rules that opt in
//! - A small dev server (HTTP/1.1, HTTPS with HTTP/2) hosting both

pub mod certificate;
pub mod config;
pub mod forward;
pub mod plugin;
pub mod router;
pub mod server;

pub use certificate::{provision, CertificateMaterial, CertificateSource, LocalCertificateAuthority};
pub use config::{ConfigError, DomainSet, PluginOptions, ProxyTarget, RouteRule};
pub use forward::{ForwardError, Peer, ProxyBody};
pub use plugin::{Command, DevPlugin, HttpsConfig, PLUGIN_NAME};
pub use router::{Dispatch, ProxyRouter};
pub use server::{DevServer, DevServerConfig, Fallback, NotFound, StaticFiles};
