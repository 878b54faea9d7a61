//! `notary-server`: serve collections to clients over TLS.
//!
//! Everything comes from the configuration file; see
//! [`notary::config`] for its layout.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use notary::config::Config;
use notary::network::{frontend, tls_util};
use notary::server::NotaryServer;

#[derive(Parser, Debug)]
#[command(name = "notary-server", about = "Serve signed update metadata")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "server.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    tracing_subscriber::fmt()
        .with_max_level(config.logging.level()?)
        .init();

    let server = Arc::new(NotaryServer::from_config(&config).await?);
    let tls = tls_util::make_server_config(&config.server.tls_cert_file, &config.server.tls_key_file, None)?;
    let listener = TcpListener::bind(&config.server.addr).await?;

    tokio::select! {
        served = frontend::serve(server, listener, tls) => served,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}
