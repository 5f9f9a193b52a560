//! Hooks the host server calls: one while it is being configured, one once
//! it is about to start serving.

use crate::certificate::{self, CertificateMaterial, CertificateSource};
use crate::config::{ConfigError, PluginOptions};
use crate::router::ProxyRouter;
use std::sync::Arc;
use tracing::info;

pub const PLUGIN_NAME: &str = "devproxy";

/// What the host is doing. TLS is only provisioned for the dev server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Serve,
    Build,
}

/// HTTPS block for the host's listener; `None` means serve plain HTTP.
pub type HttpsConfig = Option<CertificateMaterial>;

pub struct DevPlugin {
    options: PluginOptions,
    router: Option<Arc<ProxyRouter>>,
}

impl DevPlugin {
    /// Validate options and compile the proxy table.
    pub fn new(options: PluginOptions) -> Result<Self, ConfigError> {
        options.validate()?;
        let router = match &options.proxy {
            Some(table) => Some(Arc::new(ProxyRouter::new(table)?)),
            None => None,
        };
        Ok(Self { options, router })
    }

    pub fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    pub fn options(&self) -> &PluginOptions {
        &self.options
    }

    /// Configuration-phase hook.
    pub fn config<S>(&self, command: Command, source: &S) -> HttpsConfig
    where
        S: CertificateSource + ?Sized,
    {
        if command != Command::Serve {
            return None;
        }
        certificate::provision(self.options.ssl.as_ref(), &self.options.domains(), source)
    }

    /// Server-start hook: the router to install as request middleware and
    /// upgrade handler, if proxying is configured.
    pub fn configure_server(&self) -> Option<Arc<ProxyRouter>> {
        if let Some(router) = &self.router {
            info!("[{}]: {} proxy rule(s) registered", PLUGIN_NAME, router.rules().len());
        }
        self.router.clone()
    }
}
