//! Command-line flags of the demo client.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Flags take precedence over `config.ron`; unset flags leave the file's
/// values alone.
#[derive(Parser, Debug, Default)]
#[command(name = "roomlink", about = "Headless room session client")]
pub struct CliArgs {
    /// Room server host.
    #[arg(long, short = 's', value_name = "HOST")]
    pub server: Option<String>,

    /// Room server port, shared by the stream and datagram channels.
    #[arg(long, short = 'p')]
    pub port: Option<u16>,

    /// Room to join once logged in.
    #[arg(long, short = 'r')]
    pub room: Option<String>,

    /// Application name used to build the login app id.
    #[arg(long, value_name = "NAME")]
    pub app: Option<String>,

    /// `tracing` filter, e.g. `debug` or `info,roomlink_net=trace`.
    #[arg(long, value_name = "FILTER")]
    pub log_level: Option<String>,

    /// Directory holding `config.ron` and the device id.
    #[arg(long, value_name = "DIR")]
    pub config: Option<PathBuf>,

    /// Leave the room and exit after this many seconds.
    #[arg(long, value_name = "SECS")]
    pub duration_secs: Option<u64>,
}

impl Config {
    /// Overlay the flags that were given on top of the loaded settings.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        let network = &mut self.network;
        if let Some(host) = &args.server {
            network.server_address.clone_from(host);
        }
        network.server_port = args.port.unwrap_or(network.server_port);
        if let Some(app) = &args.app {
            network.app_name.clone_from(app);
        }
        if let Some(filter) = &args.log_level {
            self.debug.log_level.clone_from(filter);
        }
    }
}
