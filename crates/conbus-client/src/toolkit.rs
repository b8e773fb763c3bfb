//! Object-graph wiring.
//!
//! One [`ConbusToolkit`] owns the single protocol engine of a client
//! process and hands out operation services over it. Composition happens
//! once, up front; services receive their engine reference explicitly and
//! there is no global state anywhere. Services run one at a time on the
//! shared engine, one connection scope per `run()`.

use std::path::PathBuf;
use std::rc::Rc;

use conbus_proto::action_table::ActionTableEntry;
use conbus_proto::module_type::ActionTableFamily;
use conbus_proto::{DatapointId, SerialNumber, SystemFunction};

use crate::config::ClientConfig;
use crate::protocol::{ConbusConnection, ProtocolConfig};
use crate::services::{
    ActionTableDownloadService, ActionTableUploadService, BlinkAllService, BlinkService,
    CustomService, DiscoverService, ExportService, MsActionTableService, OutputService,
    RawService, ReadDatapointService, ScanService, WriteDatapointService,
};

/// The composed client: one engine, services on demand.
pub struct ConbusToolkit {
    connection: Rc<ConbusConnection>,
}

impl ConbusToolkit {
    /// Compose the toolkit from a client configuration.
    #[must_use]
    pub fn new(config: &ClientConfig) -> Self {
        Self::with_protocol(ProtocolConfig::from(config))
    }

    /// Compose the toolkit from explicit engine parameters.
    #[must_use]
    pub fn with_protocol(config: ProtocolConfig) -> Self {
        Self { connection: ConbusConnection::new(config) }
    }

    /// The shared protocol engine.
    #[must_use]
    pub fn connection(&self) -> Rc<ConbusConnection> {
        Rc::clone(&self.connection)
    }

    /// Device discovery.
    #[must_use]
    pub fn discover(&self) -> Rc<DiscoverService> {
        DiscoverService::new(self.connection())
    }

    /// Full datapoint scan of one module.
    #[must_use]
    pub fn scan(&self, serial: SerialNumber) -> Rc<ScanService> {
        ScanService::new(self.connection(), serial)
    }

    /// Single datapoint read.
    #[must_use]
    pub fn read_datapoint(
        &self,
        serial: SerialNumber,
        datapoint: DatapointId,
    ) -> Rc<ReadDatapointService> {
        ReadDatapointService::new(self.connection(), serial, datapoint)
    }

    /// Configuration datapoint write.
    #[must_use]
    pub fn write_datapoint(
        &self,
        serial: SerialNumber,
        datapoint: DatapointId,
        value: impl Into<String>,
    ) -> Rc<WriteDatapointService> {
        WriteDatapointService::new(self.connection(), serial, datapoint, value)
    }

    /// LED blink or unblink.
    #[must_use]
    pub fn blink(&self, serial: SerialNumber, on: bool) -> Rc<BlinkService> {
        BlinkService::new(self.connection(), serial, on)
    }

    /// Blink or unblink every module on the bus.
    #[must_use]
    pub fn blink_all(&self, on: bool) -> Rc<BlinkAllService> {
        BlinkAllService::new(self.connection(), on)
    }

    /// Relay output switch.
    #[must_use]
    pub fn output(&self, serial: SerialNumber, output: u8, on: bool) -> Rc<OutputService> {
        OutputService::new(self.connection(), serial, output, on)
    }

    /// Raw frame sending.
    #[must_use]
    pub fn raw(&self, input: impl Into<String>) -> Rc<RawService> {
        RawService::new(self.connection(), input)
    }

    /// Custom telegram exchange.
    #[must_use]
    pub fn custom(
        &self,
        serial: SerialNumber,
        function: SystemFunction,
        datapoint: Option<DatapointId>,
        data: impl Into<String>,
    ) -> Rc<CustomService> {
        CustomService::new(self.connection(), serial, function, datapoint, data)
    }

    /// Action-table download with a caller-chosen family.
    #[must_use]
    pub fn actiontable_download(
        &self,
        serial: SerialNumber,
        family: ActionTableFamily,
    ) -> Rc<ActionTableDownloadService> {
        ActionTableDownloadService::new(self.connection(), serial, family)
    }

    /// Action-table upload.
    #[must_use]
    pub fn actiontable_upload(
        &self,
        serial: SerialNumber,
        family: ActionTableFamily,
        entries: Vec<ActionTableEntry>,
    ) -> Rc<ActionTableUploadService> {
        ActionTableUploadService::new(self.connection(), serial, family, entries)
    }

    /// Family-aware action-table download.
    #[must_use]
    pub fn ms_actiontable(&self, serial: SerialNumber) -> Rc<MsActionTableService> {
        MsActionTableService::new(self.connection(), serial)
    }

    /// Bus inventory export.
    #[must_use]
    pub fn export(&self, path: impl Into<PathBuf>) -> Rc<ExportService> {
        ExportService::new(self.connection(), path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn services_share_one_engine() {
        let toolkit = ConbusToolkit::new(&ClientConfig::default());
        let engine = toolkit.connection();
        let _discover = toolkit.discover();
        let _raw = toolkit.raw("<S0000000000F01D00FA>");
        // Two services plus the toolkit and our handle on one engine.
        assert_eq!(Rc::strong_count(&engine), 4);
    }
}
