//! Service-level scenarios: export, scan, writes and action tables
//! against the emulator.

use std::rc::Rc;
use std::time::Duration;

use conbus_client::services::{
    ActionTableDownloadService, ActionTableUploadService, BlinkAllService, ExportService,
    MsActionTableService, OutputService, ResponseStatus, ScanService, WriteDatapointService,
};
use conbus_client::{ConbusConnection, Pacing, ProtocolConfig};
use conbus_proto::action_table::ActionTableEntry;
use conbus_proto::module_type::ActionTableFamily;
use conbus_proto::{DatapointId, ModuleDefinition, SerialNumber};
use conbus_server::{EmulatorConfig, EmulatorServer, load_module_list};

async fn start_emulator(definitions: Vec<ModuleDefinition>) -> u16 {
    let server = EmulatorServer::bind(EmulatorConfig {
        bind_address: "127.0.0.1:0".to_owned(),
        definitions,
        write_delay_min: Duration::from_millis(1),
        write_delay_max: Duration::from_millis(2),
        ..EmulatorConfig::default()
    })
    .await
    .unwrap();
    let port = server.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    port
}

fn client(port: u16, timeout: Duration) -> Rc<ConbusConnection> {
    ConbusConnection::new(ProtocolConfig {
        host: "127.0.0.1".to_owned(),
        port,
        timeout,
        pacing: Pacing::fixed(Duration::from_millis(2)),
        dedup_window: Some(Duration::from_millis(50)),
    })
}

fn module(serial: &str, type_code: u8, link: u8) -> ModuleDefinition {
    let mut definition = ModuleDefinition::bare(serial.parse().unwrap());
    definition.module_type_code = Some(type_code);
    definition.link_number = Some(link);
    definition.module_number = Some(u16::from(link) + 10);
    definition.sw_version = Some(format!("V0.34.{link:02}"));
    definition.hw_version = Some("HW_REV_B".to_owned());
    definition.auto_report_status = Some("off".to_owned());
    definition
}

#[tokio::test]
async fn export_times_out_partially_when_one_device_stays_silent() {
    let mut silent = module("0020042796", 7, 3);
    // This one never answers MODULE_NUMBER.
    silent.silent_datapoints = Some(vec![DatapointId::ModuleNumber.code()]);
    let definitions =
        vec![module("0020030837", 33, 1), module("0020044966", 7, 2), silent];
    let port = start_emulator(definitions).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("export.yml");
    let connection = client(port, Duration::from_secs(2));
    let response = ExportService::new(connection, &path).run().await;

    assert_eq!(response.exchange.status, ResponseStatus::PartialTimeout);
    assert!(!response.exchange.success);
    assert_eq!(response.devices.len(), 3);

    // Sorted by link number; the silent device is present, minus the
    // field it never answered.
    let links: Vec<Option<u8>> = response.devices.iter().map(|d| d.link_number).collect();
    assert_eq!(links, vec![Some(1), Some(2), Some(3)]);
    let partial = &response.devices[2];
    assert_eq!(partial.serial_number.as_str(), "0020042796");
    assert!(partial.module_number.is_none());
    assert_eq!(partial.module_type.as_deref(), Some("XP24"));

    // The written document round-trips through the emulator loader.
    let reloaded = load_module_list(&path).unwrap();
    assert_eq!(reloaded.len(), 3);
    assert_eq!(reloaded[0].serial_number.as_str(), "0020030837");
}

#[tokio::test]
async fn export_completes_cleanly_when_every_device_answers() {
    let port = start_emulator(vec![module("0020030837", 33, 1), module("0020044966", 7, 2)]).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("export.yml");
    let connection = client(port, Duration::from_secs(2));
    let response = ExportService::new(connection, &path).run().await;

    assert_eq!(response.exchange.status, ResponseStatus::Ok);
    assert!(response.exchange.success);
    assert!(response.exchange.elapsed_ms < 1_500, "completion must stop before the timeout");
    let record = &response.devices[1];
    assert_eq!(record.module_type.as_deref(), Some("XP24"));
    assert_eq!(record.sw_version.as_deref(), Some("V0.34.02"));
    assert_eq!(record.auto_report_status.as_deref(), Some("off"));
}

#[tokio::test]
async fn export_with_no_devices_fails() {
    let port = start_emulator(Vec::new()).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("export.yml");
    let connection = client(port, Duration::from_millis(400));
    let response = ExportService::new(connection, &path).run().await;

    assert_eq!(response.exchange.status, ResponseStatus::FailedNoDevices);
    assert!(!path.exists(), "nothing to write");
}

#[tokio::test]
async fn scan_reads_every_known_datapoint() {
    let mut definition = module("0020044966", 7, 2);
    definition.datapoints = Some(
        [
            (12u8, "xxxx1110".to_owned()),
            (15u8, "00:100,01:050".to_owned()),
            (17u8, "+12,5§V".to_owned()),
            (18u8, "+31,5§C".to_owned()),
        ]
        .into_iter()
        .collect(),
    );
    let port = start_emulator(vec![definition]).await;

    let serial: SerialNumber = "0020044966".parse().unwrap();
    let connection = client(port, Duration::from_secs(1));
    let response = ScanService::new(connection, serial).run().await;

    assert_eq!(response.exchange.status, ResponseStatus::Ok);
    assert_eq!(response.readings.len(), DatapointId::KNOWN.len());
    let voltage = response.readings.iter().find(|r| r.datapoint == "VOLTAGE").unwrap();
    assert_eq!(voltage.raw, "+12,5§V");
    assert!(voltage.parse_error.is_none());
}

#[tokio::test]
async fn link_number_write_is_acked_and_visible() {
    let port = start_emulator(vec![module("0020044966", 7, 2)]).await;

    let serial: SerialNumber = "0020044966".parse().unwrap();
    let connection = client(port, Duration::from_millis(500));
    let response = WriteDatapointService::new(
        Rc::clone(&connection),
        serial,
        DatapointId::LinkNumber,
        "07",
    )
    .run()
    .await;
    assert!(response.exchange.success);
    assert!(response.acked);

    let connection = client(port, Duration::from_millis(500));
    let read = conbus_client::services::ReadDatapointService::new(
        connection,
        serial,
        DatapointId::LinkNumber,
    )
    .run()
    .await;
    assert_eq!(read.raw.as_deref(), Some("07"));
}

#[tokio::test]
async fn output_switch_is_acknowledged() {
    let port = start_emulator(vec![module("0020044966", 7, 2)]).await;

    let serial: SerialNumber = "0020044966".parse().unwrap();
    let connection = client(port, Duration::from_millis(500));
    let response = OutputService::new(connection, serial, 1, true).run().await;

    assert!(response.exchange.success);
    assert!(response.acked);
}

#[tokio::test]
async fn blink_all_blinks_every_discovered_module() {
    let port = start_emulator(vec![module("0020030837", 33, 1), module("0020044966", 7, 2)]).await;

    let connection = client(port, Duration::from_millis(600));
    let response = BlinkAllService::new(connection, true).run().await;

    assert_eq!(response.exchange.status, ResponseStatus::Ok);
    assert_eq!(response.devices.len(), 2);
    assert_eq!(response.acked, response.devices);
}

#[tokio::test]
async fn action_table_download_walks_rows_to_the_end_marker() {
    let mut definition = module("0020044966", 7, 2);
    definition.action_table = Some(vec![
        "XP20 10 0 > 0 OFF".to_owned(),
        "XP20 10 1 > 1 ON".to_owned(),
        "XP2606 2 5 > 3 TOGGLE".to_owned(),
    ]);
    let port = start_emulator(vec![definition]).await;

    let serial: SerialNumber = "0020044966".parse().unwrap();
    let connection = client(port, Duration::from_millis(800));
    let service = ActionTableDownloadService::new(connection, serial, ActionTableFamily::Xp24);

    let progress = Rc::new(std::cell::RefCell::new(Vec::new()));
    let lines = Rc::clone(&progress);
    service.on_progress.connect(move |line: &String| lines.borrow_mut().push(line.clone()));

    let response = Rc::clone(&service).run().await;

    assert_eq!(response.exchange.status, ResponseStatus::Ok);
    assert_eq!(response.table.entries.len(), 3);
    assert_eq!(response.short_lines[0], "XP20 10 0 > 0 OFF");
    assert_eq!(*progress.borrow(), response.short_lines);
    assert_eq!(response.raw_rows.len(), 3);
}

#[tokio::test]
async fn action_table_upload_then_download_round_trips() {
    let port = start_emulator(vec![module("0020044966", 7, 2)]).await;

    let serial: SerialNumber = "0020044966".parse().unwrap();
    let entries: Vec<ActionTableEntry> =
        vec!["XP20 10 0 > 0 OFF".parse().unwrap(), "XP20 10 1 > 1 ON".parse().unwrap()];

    let connection = client(port, Duration::from_millis(800));
    let upload = ActionTableUploadService::new(
        connection,
        serial,
        ActionTableFamily::Xp24,
        entries.clone(),
    )
    .run()
    .await;
    assert_eq!(upload.exchange.status, ResponseStatus::Ok);
    assert_eq!(upload.rows, 2);
    assert_eq!(upload.integrity.len(), 8);

    let connection = client(port, Duration::from_millis(800));
    let download =
        ActionTableDownloadService::new(connection, serial, ActionTableFamily::Xp24).run().await;
    assert_eq!(download.exchange.status, ResponseStatus::Ok);
    assert_eq!(download.table.entries, entries);
}

#[tokio::test]
async fn ms_action_table_resolves_the_family_first() {
    let mut definition = module("0020044966", 7, 2);
    definition.action_table = Some(vec!["XP20 10 0 > 0 OFF".to_owned()]);
    let port = start_emulator(vec![definition]).await;

    let serial: SerialNumber = "0020044966".parse().unwrap();
    let connection = client(port, Duration::from_millis(800));
    let response = MsActionTableService::new(connection, serial).run().await;

    assert_eq!(response.exchange.status, ResponseStatus::Ok);
    assert_eq!(response.module_type.as_deref(), Some("XP24"));
    assert_eq!(response.table.entries.len(), 1);
    assert_eq!(response.short_lines, vec!["XP20 10 0 > 0 OFF"]);
}

#[tokio::test]
async fn ms_action_table_fails_for_tableless_modules() {
    // XP130 is a bus coupler; it stores no action table.
    let port = start_emulator(vec![module("0020040000", 13, 1)]).await;

    let serial: SerialNumber = "0020040000".parse().unwrap();
    let connection = client(port, Duration::from_millis(500));
    let response = MsActionTableService::new(connection, serial).run().await;

    assert_eq!(response.exchange.status, ResponseStatus::Failed);
    assert!(response.exchange.error.as_deref().unwrap_or_default().contains("no action table"));
}
