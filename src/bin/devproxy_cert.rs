//! CLI tool for development certificates
//!
//! Usage:
//!   devproxy-cert generate [domains...] [--out <dir>]
//!   devproxy-cert ca

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use devproxy::{provision, DomainSet, LocalCertificateAuthority};
use std::fs;
use std::path::PathBuf;

/// CLI tool for devproxy certificates
#[derive(Parser, Debug)]
#[command(name = "devproxy-cert")]
#[command(author = "devproxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Create development certificates signed by the local devproxy CA")]
struct Args {
    /// Certificates directory
    #[arg(long, env = "CERTS_DIR", default_value = "./certs")]
    certs_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Issue a certificate and write key.pem / cert.pem
    Generate {
        /// Domains the certificate covers (default: localhost)
        domains: Vec<String>,

        /// Output directory
        #[arg(short = 'o', long, default_value = ".")]
        out: PathBuf,
    },

    /// Print the CA certificate path, creating the CA if needed
    Ca,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).compact().init();

    let args = Args::parse();
    let authority = LocalCertificateAuthority::new(&args.certs_dir);

    match args.command {
        Commands::Generate { domains, out } => {
            let domains = DomainSet::new(domains);
            let material = provision(None, &domains, &authority)
                .ok_or_else(|| anyhow!("could not create a certificate for {:?}", domains.as_slice()))?;

            fs::create_dir_all(&out).with_context(|| format!("failed to create {}", out.display()))?;
            let key_path = out.join("key.pem");
            let cert_path = out.join("cert.pem");
            fs::write(&key_path, material.key())?;
            fs::write(&cert_path, material.cert())?;

            println!("Certificate for {}:", domains.as_slice().join(", "));
            println!("  key:  {}", key_path.display());
            println!("  cert: {}", cert_path.display());
        }

        Commands::Ca => {
            let path = authority.ensure_ca()?;
            println!("{}", path.display());
        }
    }

    Ok(())
}
