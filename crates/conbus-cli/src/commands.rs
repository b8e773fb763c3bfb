//! Command handlers.
//!
//! Connection-free inspection commands live next to the operation
//! commands that drive the services. Every operation prints its response
//! record (JSON with `--json`, a short summary otherwise) and reports
//! success back to `main` for the exit code.

use std::error::Error;
use std::path::Path;
use std::rc::Rc;

use conbus_client::{ClientConfig, ConbusConnection, ConbusToolkit};
use conbus_proto::action_table::ActionTableEntry;
use conbus_proto::module_type::{self, ActionTableFamily};
use conbus_proto::{
    DatapointId, SerialNumber, SystemFunction, Telegram, TelegramType, checksum, payload_bytes,
};
use serde::Serialize;

use crate::{ActionTableCommand, ConbusCommand, DatapointCommand, EventCommand, ExportCommand};

type CommandResult = Result<bool, Box<dyn Error>>;

/// Output selection for operation commands.
pub struct Output {
    /// Print the full response record as JSON.
    pub json: bool,
}

impl Output {
    fn emit<T: Serialize>(&self, response: &T, success: bool, summary: &str) -> CommandResult {
        if self.json {
            println!("{}", serde_json::to_string_pretty(response)?);
        } else {
            println!("{summary}");
        }
        Ok(success)
    }
}

/// `xp telegram parse`
pub fn telegram_parse(input: &str, output: &Output) -> CommandResult {
    let mut parser = conbus_proto::FrameParser::new();
    parser.push(&payload_bytes(input));
    let mut described = Vec::new();
    while let Some(telegram) = parser.next_frame() {
        described.push((telegram.frame_display(), telegram.describe()));
    }
    if described.is_empty() {
        eprintln!("no parseable frames in input");
        return Ok(false);
    }
    if output.json {
        let records: Vec<_> = described
            .iter()
            .map(|(frame, description)| {
                serde_json::json!({ "frame": frame, "description": description })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        for (frame, description) in &described {
            println!("{frame}  {description}");
        }
    }
    Ok(true)
}

/// `xp checksum calculate`
pub fn checksum_calculate(payload: &str) -> CommandResult {
    let letters = checksum::xor_nibble(&payload_bytes(payload));
    println!("{}", conbus_proto::display_bytes(&letters));
    Ok(true)
}

/// `xp checksum validate`
pub fn checksum_validate(frame: &str) -> CommandResult {
    let telegram = Telegram::parse(&payload_bytes(frame))?;
    if telegram.checksum_valid() {
        println!("valid");
        Ok(true)
    } else {
        let expected = checksum::xor_nibble(telegram.payload());
        println!(
            "invalid: got {}, expected {}",
            conbus_proto::display_bytes(&telegram.checksum()),
            conbus_proto::display_bytes(&expected)
        );
        Ok(false)
    }
}

/// `xp module info`
pub fn module_info(module: &str, output: &Output) -> CommandResult {
    let info = module
        .parse::<u8>()
        .ok()
        .and_then(module_type::by_code)
        .or_else(|| module_type::by_name(module));
    let Some(info) = info else {
        eprintln!("unknown module type {module:?}");
        return Ok(false);
    };
    if output.json {
        println!("{}", serde_json::to_string_pretty(info)?);
    } else {
        println!("{:2}  {:10} {}", info.code, info.name, info.description);
        println!("    outputs: {}, inputs: {}, dimmable: {}", info.outputs, info.inputs, info.dimmable);
    }
    Ok(true)
}

fn parse_family(family: &str) -> Result<ActionTableFamily, Box<dyn Error>> {
    match family.to_ascii_lowercase().as_str() {
        "xp20" => Ok(ActionTableFamily::Xp20),
        "xp24" => Ok(ActionTableFamily::Xp24),
        "xp33" => Ok(ActionTableFamily::Xp33),
        other => Err(format!("unknown family {other:?}, expected xp20, xp24 or xp33").into()),
    }
}

/// `xp conbus ...`
pub async fn conbus(
    command: ConbusCommand,
    config: Option<&Path>,
    output: &Output,
) -> CommandResult {
    let config = match config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };
    let toolkit = ConbusToolkit::new(&config);

    match command {
        ConbusCommand::Discover => {
            let service = toolkit.discover();
            if !output.json {
                service.on_device_found.connect(|serial: &SerialNumber| {
                    println!("found {serial}");
                });
            }
            let response = Rc::clone(&service).run().await;
            let summary = format!("{} devices", response.devices.len());
            output.emit(&response, response.exchange.success, &summary)
        }
        ConbusCommand::Scan { serial } => {
            let response = toolkit.scan(serial.parse()?).run().await;
            let lines: Vec<String> = response
                .readings
                .iter()
                .map(|r| format!("{:02} {:18} {}", r.id, r.datapoint, r.raw))
                .collect();
            output.emit(&response, response.exchange.success, &lines.join("\n"))
        }
        ConbusCommand::Raw { input } => {
            let response = toolkit.raw(input).run().await;
            let summary = response.exchange.received_telegrams.join("\n");
            output.emit(&response, response.exchange.success, &summary)
        }
        ConbusCommand::Receive => {
            let connection = toolkit.connection();
            listen_printer(&connection, false);
            Ok(connection.run().await.is_ok())
        }
        ConbusCommand::Event { command } => {
            let connection = toolkit.connection();
            match command {
                EventCommand::Raw { payload } => {
                    let conn = Rc::clone(&connection);
                    connection.connection_made.connect(move |_: &()| {
                        conn.send_raw_telegram(&payload);
                    });
                    listen_printer(&connection, false);
                }
                EventCommand::List => listen_printer(&connection, true),
            }
            Ok(connection.run().await.is_ok())
        }
        ConbusCommand::Custom { serial, function, datapoint, data } => {
            let service = toolkit.custom(
                serial.parse()?,
                SystemFunction::from_code(function),
                datapoint.map(DatapointId::from_code),
                data,
            );
            let response = Rc::clone(&service).run().await;
            let summary = response.replies.join("\n");
            output.emit(&response, response.exchange.success, &summary)
        }
        ConbusCommand::Datapoint { command } => match command {
            DatapointCommand::Read { serial, id } => {
                let service = toolkit.read_datapoint(serial.parse()?, DatapointId::from_code(id));
                let response = Rc::clone(&service).run().await;
                let summary = match (&response.raw, &response.value) {
                    (Some(raw), Some(value)) => format!("{raw}  {value:?}"),
                    (Some(raw), None) => raw.clone(),
                    _ => "no reply".to_owned(),
                };
                output.emit(&response, response.exchange.success, &summary)
            }
            DatapointCommand::Write { serial, id, value } => {
                let service =
                    toolkit.write_datapoint(serial.parse()?, DatapointId::from_code(id), value);
                let response = Rc::clone(&service).run().await;
                output.emit(&response, response.exchange.success, blink_summary(response.acked))
            }
            DatapointCommand::Readall { serial } => {
                let response = toolkit.scan(serial.parse()?).run().await;
                let lines: Vec<String> = response
                    .readings
                    .iter()
                    .map(|r| format!("{:02} {:18} {}", r.id, r.datapoint, r.raw))
                    .collect();
                output.emit(&response, response.exchange.success, &lines.join("\n"))
            }
        },
        ConbusCommand::Blink { serial } => {
            let response = toolkit.blink(serial.parse()?, true).run().await;
            output.emit(&response, response.exchange.success, blink_summary(response.acked))
        }
        ConbusCommand::Unblink { serial } => {
            let response = toolkit.blink(serial.parse()?, false).run().await;
            output.emit(&response, response.exchange.success, blink_summary(response.acked))
        }
        ConbusCommand::Blinkall { off } => {
            let response = toolkit.blink_all(!off).run().await;
            let summary =
                format!("{} of {} acknowledged", response.acked.len(), response.devices.len());
            output.emit(&response, response.exchange.success, &summary)
        }
        ConbusCommand::Output { serial, output: channel, state } => {
            let on = match state.to_ascii_lowercase().as_str() {
                "on" | "1" => true,
                "off" | "0" => false,
                other => return Err(format!("expected on or off, got {other:?}").into()),
            };
            let response = toolkit.output(serial.parse()?, channel, on).run().await;
            output.emit(&response, response.exchange.success, blink_summary(response.acked))
        }
        ConbusCommand::Export { command } => match command {
            ExportCommand::Device { output: path } => {
                let service = toolkit.export(path.clone());
                if !output.json {
                    service.on_device_found.connect(|serial: &SerialNumber| {
                        println!("found {serial}");
                    });
                }
                let response = Rc::clone(&service).run().await;
                let summary =
                    format!("{} devices written to {}", response.devices.len(), path.display());
                output.emit(&response, response.exchange.success, &summary)
            }
            ExportCommand::Actiontable { serial, output: path } => {
                let response = toolkit.ms_actiontable(serial.parse()?).run().await;
                if response.exchange.success {
                    std::fs::write(&path, serde_yaml::to_string(&response.short_lines)?)?;
                }
                let summary =
                    format!("{} entries written to {}", response.table.entries.len(), path.display());
                output.emit(&response, response.exchange.success, &summary)
            }
        },
        ConbusCommand::Actiontable { command } => match command {
            ActionTableCommand::Download { serial, family } => {
                let service =
                    toolkit.actiontable_download(serial.parse()?, parse_family(&family)?);
                if !output.json {
                    service.on_progress.connect(|line: &String| println!("{line}"));
                }
                let response = Rc::clone(&service).run().await;
                let summary = format!("{} entries", response.table.entries.len());
                output.emit(&response, response.exchange.success, &summary)
            }
            ActionTableCommand::Upload { serial, file, family } => {
                let lines: Vec<String> = serde_yaml::from_str(&std::fs::read_to_string(&file)?)?;
                let entries = lines
                    .iter()
                    .map(|line| line.parse::<ActionTableEntry>())
                    .collect::<Result<Vec<_>, _>>()?;
                let service =
                    toolkit.actiontable_upload(serial.parse()?, parse_family(&family)?, entries);
                if !output.json {
                    service.on_progress.connect(|line: &String| println!("{line}"));
                }
                let response = Rc::clone(&service).run().await;
                let summary = format!("{} rows uploaded, crc {}", response.rows, response.integrity);
                output.emit(&response, response.exchange.success, &summary)
            }
        },
        ConbusCommand::Msactiontable { serial } => {
            let service = toolkit.ms_actiontable(serial.parse()?);
            if !output.json {
                service.on_progress.connect(|line: &String| println!("{line}"));
            }
            let response = Rc::clone(&service).run().await;
            let summary = format!(
                "{} entries ({})",
                response.table.entries.len(),
                response.module_type.as_deref().unwrap_or("unknown type")
            );
            output.emit(&response, response.exchange.success, &summary)
        }
    }
}

fn blink_summary(acked: bool) -> &'static str {
    if acked { "acknowledged" } else { "no acknowledge" }
}

/// Print everything (or only events) the engine receives.
fn listen_printer(connection: &Rc<ConbusConnection>, events_only: bool) {
    connection.telegram_received.connect(move |t: &Telegram| {
        let is_event =
            matches!(t.telegram_type(), TelegramType::Event | TelegramType::OldEvent);
        if events_only && !is_event {
            return;
        }
        println!("{}  {}", t.frame_display(), t.describe());
    });
}

/// `xp server start`
pub async fn server_start(bind: String, models: &Path) -> CommandResult {
    let definitions = conbus_server::load_module_list(models)?;
    tracing::info!(models = definitions.len(), "starting emulator");
    let server = conbus_server::EmulatorServer::bind(conbus_server::EmulatorConfig {
        bind_address: bind,
        definitions,
        ..conbus_server::EmulatorConfig::default()
    })
    .await?;
    server.run().await?;
    Ok(true)
}

/// `xp proxy`
pub async fn proxy(bind: String, upstream: String) -> CommandResult {
    let proxy = conbus_server::BroadcastProxy::bind(conbus_server::ProxyConfig {
        bind_address: bind,
        upstream,
        ..conbus_server::ProxyConfig::default()
    })
    .await?;
    proxy.run().await?;
    Ok(true)
}
