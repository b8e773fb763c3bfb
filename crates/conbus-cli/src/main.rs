//! `xp`: command line toolkit for the conbus field bus.
//!
//! # Usage
//!
//! ```bash
//! # Inspect a frame without touching the bus
//! xp telegram parse '<E14L00I02MAK>'
//!
//! # Who is out there?
//! xp conbus discover
//!
//! # Switch a relay
//! xp conbus output 0020044966 1 on
//!
//! # Emulate a gateway for development
//! xp server start --models models.yml
//! ```
//!
//! Commands exit 0 when the operation status is `OK` and 1 otherwise;
//! `--json` prints the full response record to stdout.

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Conbus command line toolkit
#[derive(Parser, Debug)]
#[command(name = "xp")]
#[command(about = "Interoperability toolkit for the conbus building automation bus")]
#[command(version)]
struct Args {
    /// Client configuration file (YAML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print the full response record as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Inspect telegrams without a connection
    Telegram {
        #[command(subcommand)]
        command: TelegramCommand,
    },
    /// Checksum helpers
    Checksum {
        #[command(subcommand)]
        command: ChecksumCommand,
    },
    /// Module-type registry lookups
    Module {
        #[command(subcommand)]
        command: ModuleCommand,
    },
    /// Talk to the gateway
    Conbus {
        #[command(subcommand)]
        command: ConbusCommand,
    },
    /// Run the gateway emulator
    Server {
        #[command(subcommand)]
        command: ServerCommand,
    },
    /// Run the broadcasting reverse proxy
    Proxy {
        /// Address to bind to
        #[arg(short, long, default_value = "0.0.0.0:10001")]
        bind: String,

        /// Upstream gateway, host:port
        #[arg(short, long)]
        upstream: String,
    },
}

#[derive(Subcommand, Debug)]
enum TelegramCommand {
    /// Parse one or more frames and describe them
    Parse {
        /// Text containing `<...>` frames
        input: String,
    },
}

#[derive(Subcommand, Debug)]
enum ChecksumCommand {
    /// XOR-nibble checksum of a payload
    Calculate {
        /// Payload text, markers excluded
        payload: String,
    },
    /// Validate the checksum of a complete frame
    Validate {
        /// One `<...>` frame
        frame: String,
    },
}

#[derive(Subcommand, Debug)]
enum ModuleCommand {
    /// Show a module type by code or name
    Info {
        /// Module-type code or name, e.g. `7` or `XP24`
        module: String,
    },
}

#[derive(Subcommand, Debug)]
enum ConbusCommand {
    /// Discover modules on the bus
    Discover,
    /// Read every known datapoint of one module
    Scan {
        /// Ten-digit serial number
        serial: String,
    },
    /// Send raw `<...>` frames and record replies
    Raw {
        /// Text containing the frames to send
        input: String,
    },
    /// Listen passively and print everything received
    Receive,
    /// Event telegram helpers
    Event {
        #[command(subcommand)]
        command: EventCommand,
    },
    /// Send one custom telegram and collect replies
    Custom {
        /// Ten-digit serial number
        serial: String,
        /// Two-digit system function
        function: u8,
        /// Optional datapoint id
        #[arg(long)]
        datapoint: Option<u8>,
        /// Optional data text
        #[arg(long, default_value = "")]
        data: String,
    },
    /// Datapoint access
    Datapoint {
        #[command(subcommand)]
        command: DatapointCommand,
    },
    /// Blink a module LED
    Blink {
        /// Ten-digit serial number
        serial: String,
    },
    /// Stop blinking a module LED
    Unblink {
        /// Ten-digit serial number
        serial: String,
    },
    /// Blink (or unblink) every module on the bus
    Blinkall {
        /// Unblink instead of blink
        #[arg(long)]
        off: bool,
    },
    /// Switch a relay output
    Output {
        /// Ten-digit serial number
        serial: String,
        /// Output channel index
        output: u8,
        /// `on` or `off`
        state: String,
    },
    /// Export bus state to files
    Export {
        #[command(subcommand)]
        command: ExportCommand,
    },
    /// Action-table access
    Actiontable {
        #[command(subcommand)]
        command: ActionTableCommand,
    },
    /// Download an action table, resolving the device family first
    Msactiontable {
        /// Ten-digit serial number
        serial: String,
    },
}

#[derive(Subcommand, Debug)]
enum EventCommand {
    /// Send a raw event payload, checksum added
    Raw {
        /// Event payload, e.g. `E14L00I02M`
        payload: String,
    },
    /// Listen and print parsed events until the timeout
    List,
}

#[derive(Subcommand, Debug)]
enum DatapointCommand {
    /// Read one datapoint
    Read {
        /// Ten-digit serial number
        serial: String,
        /// Datapoint id
        id: u8,
    },
    /// Write a configuration datapoint (link number, auto-report, ...)
    Write {
        /// Ten-digit serial number
        serial: String,
        /// Datapoint id
        id: u8,
        /// Value text as it should travel on the wire
        value: String,
    },
    /// Read every known datapoint
    Readall {
        /// Ten-digit serial number
        serial: String,
    },
}

#[derive(Subcommand, Debug)]
enum ExportCommand {
    /// Export the device inventory as a module-list YAML
    Device {
        /// Output file
        #[arg(short, long, default_value = "conbus-export.yml")]
        output: PathBuf,
    },
    /// Export one module's action table as YAML lines
    Actiontable {
        /// Ten-digit serial number
        serial: String,
        /// Output file
        #[arg(short, long, default_value = "actiontable.yml")]
        output: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ActionTableCommand {
    /// Download the table of one module
    Download {
        /// Ten-digit serial number
        serial: String,
        /// Encoding family: xp20, xp24 or xp33
        #[arg(long, default_value = "xp20")]
        family: String,
    },
    /// Upload a table from YAML lines
    Upload {
        /// Ten-digit serial number
        serial: String,
        /// YAML file with short-form lines
        file: PathBuf,
        /// Encoding family: xp20, xp24 or xp33
        #[arg(long, default_value = "xp20")]
        family: String,
    },
}

#[derive(Subcommand, Debug)]
enum ServerCommand {
    /// Start the emulator
    Start {
        /// Address to bind to
        #[arg(short, long, default_value = "0.0.0.0:10001")]
        bind: String,

        /// Module-list YAML file
        #[arg(short, long)]
        models: PathBuf,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let output = commands::Output { json: args.json };
    let result = match args.command {
        Command::Telegram { command: TelegramCommand::Parse { input } } => {
            commands::telegram_parse(&input, &output)
        }
        Command::Checksum { command } => match command {
            ChecksumCommand::Calculate { payload } => commands::checksum_calculate(&payload),
            ChecksumCommand::Validate { frame } => commands::checksum_validate(&frame),
        },
        Command::Module { command: ModuleCommand::Info { module } } => {
            commands::module_info(&module, &output)
        }
        Command::Conbus { command } => commands::conbus(command, args.config.as_deref(), &output).await,
        Command::Server { command: ServerCommand::Start { bind, models } } => {
            commands::server_start(bind, &models).await
        }
        Command::Proxy { bind, upstream } => commands::proxy(bind, upstream).await,
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}
