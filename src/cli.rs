//! Command-line arguments of the headless driver.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::configuration::ProxyMode;

/// Supervises a local Shadowsocks client and manages server profiles
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// List server profiles with their last measurements
    List,
    /// Print the ss:// link of the current profile
    Link,
    /// Import profiles from a JSON file
    Import { file: PathBuf },
    /// Import profiles from a base64 subscription (defaults to the saved URL)
    Subscribe { url: Option<String> },
    /// Import profiles from the public free-nodes feed
    FreeNodes,
    /// Measure latency and throughput of every profile, then pick the best
    Test,
    /// Install the Shadowsocks client through the system package manager
    Install,
    /// Connect and read stop/restart/status/quit commands from stdin
    Connect {
        /// Profile id or name (defaults to the current profile)
        profile: Option<String>,
        /// System proxy mode: global, pac or manual (saved for later runs)
        #[arg(long, value_parser = parse_proxy_mode)]
        mode: Option<ProxyMode>,
    },
}

fn parse_proxy_mode(value: &str) -> Result<ProxyMode, String> {
    ProxyMode::parse(value).ok_or_else(|| format!("unknown proxy mode '{value}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subcommands() {
        let args = Args::parse_from(["shadowsocks-ui", "connect", "Tokyo"]);
        assert_eq!(
            args.command,
            Some(Commands::Connect {
                profile: Some("Tokyo".into()),
                mode: None,
            })
        );

        let args = Args::parse_from(["shadowsocks-ui", "connect", "--mode", "pac"]);
        assert_eq!(
            args.command,
            Some(Commands::Connect {
                profile: None,
                mode: Some(ProxyMode::Pac),
            })
        );
        assert!(Args::try_parse_from(["shadowsocks-ui", "connect", "--mode", "tun"]).is_err());

        let args = Args::parse_from(["shadowsocks-ui"]);
        assert_eq!(args.command, None);

        let args = Args::parse_from(["shadowsocks-ui", "free-nodes"]);
        assert_eq!(args.command, Some(Commands::FreeNodes));
    }
}
