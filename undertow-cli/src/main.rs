//! Undertow CLI - streaming daemon entry point
//!
//! Starts the torrent service and its HTTP surface for one profile
//! directory and runs until `/shutdown` or a termination signal.

mod daemon;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use undertow_core::tracing_setup::CliLogLevel;

#[derive(Debug, Parser)]
#[command(name = "undertow")]
#[command(about = "A BitTorrent daemon that streams media while it downloads")]
pub struct Cli {
    /// Address the HTTP surface binds to [default: 127.0.0.1:65220]
    #[arg(long)]
    pub local: Option<SocketAddr>,

    /// Callback address of the host application [default: 127.0.0.1:65221]
    #[arg(long)]
    pub remote: Option<SocketAddr>,

    /// Profile directory holding databases, downloads and logs
    #[arg(long)]
    pub profile: Option<PathBuf>,

    /// Serve deterministic content from an in-process swarm
    #[arg(long)]
    pub simulate: bool,

    /// Run without a host application
    #[arg(long)]
    pub headless: bool,

    /// Console log level
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info)]
    pub log_level: CliLogLevel,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match daemon::run(cli).await {
        Ok(reason) => reason.exit_code(),
        Err(e) => {
            eprintln!("undertow: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["undertow"]);
        assert!(cli.local.is_none());
        assert!(!cli.simulate);
        assert_eq!(cli.log_level, CliLogLevel::Info);
    }

    #[test]
    fn test_addresses_and_flags() {
        let cli = Cli::parse_from([
            "undertow",
            "--local",
            "0.0.0.0:8080",
            "--remote",
            "127.0.0.1:9000",
            "--simulate",
            "--log-level",
            "debug",
        ]);
        assert_eq!(cli.local.unwrap().port(), 8080);
        assert_eq!(cli.remote.unwrap().port(), 9000);
        assert!(cli.simulate);
        assert_eq!(cli.log_level, CliLogLevel::Debug);
    }

    #[test]
    fn test_rejects_bad_address() {
        assert!(Cli::try_parse_from(["undertow", "--local", "nowhere"]).is_err());
    }
}
