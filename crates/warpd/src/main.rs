//! warpd binary entry point.

use clap::Parser;
use tracing::{error, info};

use warpd::cli::Cli;
use warpd::srv::{Srv, SrvConfig};
use warpd::tls;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = warp_core::init_logging(cli.verbose, cli.log_file.as_deref(), cli.log_format.into())
    {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Started warpd");

    if cli.has_partial_tls_config() {
        error!("Both --cert and --key are required to serve TLS");
        std::process::exit(1);
    }

    let tls = match cli.tls_files() {
        Some((cert, key)) => match tls::load_acceptor(cert, key) {
            Ok(acceptor) => Some(acceptor),
            Err(e) => {
                error!(error = %e, "Fatal TLS configuration error");
                std::process::exit(1);
            }
        },
        None => None,
    };

    let srv = match Srv::bind(SrvConfig {
        listen_addr: cli.listen_addr,
        tls,
    })
    .await
    {
        Ok(srv) => srv,
        Err(e) => {
            error!(error = %e, "Fatal listener error");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = srv.run() => {
            if let Err(e) = result {
                error!(error = %e, "Listener failed");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
            srv.shutdown();
        }
    }
}
