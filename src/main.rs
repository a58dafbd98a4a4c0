//! punch-tunnel
//!
//! Tunnels local TCP services between two NATed hosts over a direct
//! hole-punched TCP connection, with relay fallback through the
//! rendezvous server.
//!
//! Usage:
//!   Rendezvous server:  punch-tunnel server --port 9000
//!   Tunnel client:      punch-tunnel client --host rendezvous.example --port 9000 --forward-port 2222

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};

use punch_tunnel::client;
use punch_tunnel::config::{ClientConfig, ServerConfig};
use punch_tunnel::server;

#[derive(Parser)]
#[command(name = "punch-tunnel")]
#[command(version)]
#[command(about = "Tunnel local TCP services over a NAT hole-punched peer connection")]
struct Args {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run the publicly reachable rendezvous server
    Server {
        /// Port to listen on for client registrations
        #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
        port: u16,
    },
    /// Run a tunneling client behind a NAT
    // `-h` means `--host` here as it always has for this tool, so the
    // auto help flag is long-only on this subcommand.
    #[command(disable_help_flag = true)]
    Client {
        /// Rendezvous server hostname or IP
        #[arg(short = 'h', long)]
        host: String,

        /// Rendezvous server port
        #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
        port: u16,

        /// Local TCP port to forward through the tunnel
        #[arg(short = 'f', long, alias = "fp", value_parser = clap::value_parser!(u16).range(1..))]
        forward_port: u16,

        /// Seconds to keep retrying each peer dial before falling back
        #[arg(short, long, default_value_t = 60)]
        timeout: u32,

        /// Print help
        #[arg(long, action = ArgAction::HelpLong)]
        help: Option<bool>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    match args.mode {
        Mode::Server { port } => server::run(ServerConfig { port }).await,
        Mode::Client {
            host,
            port,
            forward_port,
            timeout,
            help: _,
        } => {
            client::run(ClientConfig {
                host,
                port,
                forward_port,
                timeout_secs: timeout,
            })
            .await
        }
    }
}
