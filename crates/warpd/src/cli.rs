//! Daemon CLI implementation.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser, ValueEnum};

use warp_core::constants::DEFAULT_LISTEN_ADDR;

/// Log output format for CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CliLogFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// Structured JSON output.
    Json,
}

impl From<CliLogFormat> for warp_core::LogFormat {
    fn from(fmt: CliLogFormat) -> Self {
        match fmt {
            CliLogFormat::Text => warp_core::LogFormat::Text,
            CliLogFormat::Json => warp_core::LogFormat::Json,
        }
    }
}

/// warpd - rendezvous daemon for warp terminal sharing.
#[derive(Debug, Parser)]
#[command(
    name = "warpd",
    version,
    about = "warpd - rendezvous daemon for warp terminal sharing"
)]
pub struct Cli {
    /// Address to listen on ([ip]:port)
    #[arg(
        short = 'l',
        long = "listen",
        value_name = "ADDR",
        default_value = DEFAULT_LISTEN_ADDR,
        value_parser = parse_listen_addr
    )]
    pub listen_addr: SocketAddr,

    /// TLS certificate file (PEM format); TLS is enabled when --cert and
    /// --key are both present
    #[arg(long = "cert", value_name = "FILE")]
    pub cert_file: Option<PathBuf>,

    /// TLS private key file (PEM format)
    #[arg(long = "key", value_name = "FILE")]
    pub key_file: Option<PathBuf>,

    /// Increase verbosity (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    /// Log to file instead of stderr
    #[arg(long = "log-file", value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Log output format
    #[arg(long = "log-format", default_value = "text")]
    pub log_format: CliLogFormat,
}

impl Cli {
    /// TLS cert/key pair, when both are configured.
    pub fn tls_files(&self) -> Option<(&Path, &Path)> {
        match (self.cert_file.as_deref(), self.key_file.as_deref()) {
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => None,
        }
    }

    /// True when TLS flags are partially set, which is a configuration
    /// error.
    pub fn has_partial_tls_config(&self) -> bool {
        self.cert_file.is_some() != self.key_file.is_some()
    }
}

/// Accept `[ip]:port` with an empty ip meaning all interfaces (`:4242`).
fn parse_listen_addr(s: &str) -> Result<SocketAddr, String> {
    if let Some(port) = s.strip_prefix(':') {
        let port: u16 = port.parse().map_err(|e| format!("invalid port: {e}"))?;
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    s.parse()
        .map_err(|e| format!("invalid listen address: {e}"))
}

// =============================================================================
// Tests
// =============================================================================
