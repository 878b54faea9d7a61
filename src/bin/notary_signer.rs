//! `notary-signer`: hold private keys and sign for notary servers.
//!
//! Only clients presenting a certificate issued by `--client-ca` are
//! served.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use notary::network::tls_util;
use notary::signer::{LocalSigner, SigningService};

#[derive(Parser, Debug)]
#[command(name = "notary-signer", about = "Remote signing service for notary servers")]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:7899")]
    addr: String,
    /// PEM certificate chain presented to clients.
    #[arg(long)]
    cert: PathBuf,
    /// PEM private key for `--cert`.
    #[arg(long)]
    key: PathBuf,
    /// PEM CA certificates that client certificates must chain to.
    #[arg(long)]
    client_ca: PathBuf,
    /// Where private keys are persisted.  Keys are lost on exit
    /// without it.
    #[arg(long)]
    key_file: Option<PathBuf>,
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_max_level(cli.log_level).init();

    let signer = match &cli.key_file {
        Some(path) => LocalSigner::with_key_file(path).await?,
        None => LocalSigner::new(),
    };
    let tls = tls_util::make_server_config(&cli.cert, &cli.key, Some(cli.client_ca.as_path()))?;
    let listener = TcpListener::bind(&cli.addr).await?;
    let service = Arc::new(SigningService::new(Arc::new(signer)));

    tokio::select! {
        served = service.serve(listener, tls) => served,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}
