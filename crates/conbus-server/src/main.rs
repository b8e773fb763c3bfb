//! Gateway emulator and reverse proxy binary.
//!
//! # Usage
//!
//! ```bash
//! # Emulate a gateway from a module list
//! conbus-server serve --models models.yml
//!
//! # Mirror a real gateway to multiple observers
//! conbus-server proxy --upstream 192.168.1.100:10001
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use conbus_server::{BroadcastProxy, EmulatorConfig, EmulatorServer, ProxyConfig, load_module_list};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Conbus gateway emulator and reverse proxy
#[derive(Parser, Debug)]
#[command(name = "conbus-server")]
#[command(about = "Conbus gateway emulator and broadcasting reverse proxy")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Emulate a gateway with a configured module set
    Serve {
        /// Address to bind to
        #[arg(short, long, default_value = "0.0.0.0:10001")]
        bind: String,

        /// Module-list YAML file
        #[arg(short, long)]
        models: PathBuf,

        /// Per-client buffer soft cap, in frames
        #[arg(long, default_value = "1024")]
        buffer_cap: usize,
    },
    /// Mirror a real gateway to every connected observer
    Proxy {
        /// Address to bind to
        #[arg(short, long, default_value = "0.0.0.0:10001")]
        bind: String,

        /// Upstream gateway, host:port
        #[arg(short, long)]
        upstream: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    match args.command {
        Command::Serve { bind, models, buffer_cap } => {
            let definitions = load_module_list(&models)?;
            tracing::info!(models = definitions.len(), "starting emulator");
            let server = EmulatorServer::bind(EmulatorConfig {
                bind_address: bind,
                definitions,
                buffer_capacity: buffer_cap,
                ..EmulatorConfig::default()
            })
            .await?;
            server.run().await?;
        }
        Command::Proxy { bind, upstream } => {
            tracing::info!(%upstream, "starting proxy");
            let proxy = BroadcastProxy::bind(ProxyConfig {
                bind_address: bind,
                upstream,
                ..ProxyConfig::default()
            })
            .await?;
            proxy.run().await?;
        }
    }
    Ok(())
}
