//! devproxy - Main entry point
//!
//! Local development server with automatic HTTPS and rule-based proxying

use anyhow::Result;
use clap::Parser;
use devproxy::{
    Command, DevPlugin, DevServer, DevServerConfig, LocalCertificateAuthority, PluginOptions,
    StaticFiles,
};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// devproxy - local dev server with automatic HTTPS and proxy rules
#[derive(Parser, Debug)]
#[command(name = "devproxy")]
#[command(author = "devproxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Local development server with automatic HTTPS and proxy rules")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    host: IpAddr,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "5173")]
    port: u16,

    /// Directory served for requests no proxy rule matches
    #[arg(long, env = "ROOT_DIR", default_value = ".")]
    root: PathBuf,

    /// Plugin options file (JSON: ssl, certificateDomain, proxy)
    #[arg(long, env = "DEVPROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Certificates directory
    #[arg(long, env = "CERTS_DIR", default_value = "./certs")]
    certs_dir: PathBuf,

    /// Serve plain HTTP even when certificates are available
    #[arg(long)]
    no_https: bool,

    /// Log level or filter directives (e.g. `debug` or `devproxy=debug,hyper=warn`)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging; LOG_LEVEL takes a level or filter directives
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting devproxy v1.0.0");

    let options = match &args.config {
        Some(path) => {
            info!("Loading plugin options from {}", path.display());
            PluginOptions::from_file(path)?
        }
        None => PluginOptions::default(),
    };
    let plugin = DevPlugin::new(options)?;

    // Configuration phase
    let https = if args.no_https {
        None
    } else {
        let authority = LocalCertificateAuthority::new(&args.certs_dir);
        plugin.config(Command::Serve, &authority)
    };

    // Server start
    let router = plugin.configure_server();
    let fallback = Arc::new(StaticFiles::new(&args.root));
    let config = DevServerConfig {
        host: args.host,
        port: args.port,
    };

    let server = Arc::new(DevServer::new(config, https.as_ref(), router, fallback)?);
    info!("Serving {}", args.root.display());

    server.run().await?;

    Ok(())
}
